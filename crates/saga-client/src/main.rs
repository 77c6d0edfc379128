use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use saga_client::{ClientConfig, HttpSession, Player, SagaClient};
use saga_db::{ChangeFeed, Database, SqliteStore};
use saga_realtime::memory::MemoryHub;
use saga_types::events::ChangeEvent;
use saga_types::models::CampaignSummary;

/// Two devices on one campaign, sharing an in-process hub and a SQLite store.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    saga_client::init_tracing();

    let config = ClientConfig::from_env()?;

    // Store and transport
    let hub = MemoryHub::new();
    let db = Arc::new(Database::open(&config.db_path)?);
    let feed: ChangeFeed = {
        let hub = hub.clone();
        Arc::new(move |event: ChangeEvent| {
            hub.publish_change(event);
        })
    };
    let store = Arc::new(SqliteStore::new(db).with_feed(feed));
    let session = Arc::new(HttpSession::new(&config));

    let campaign = Uuid::new_v4();
    let alice = Player {
        id: Uuid::new_v4(),
        name: "Alice".into(),
    };
    let bob = Player {
        id: Uuid::new_v4(),
        name: "Bob".into(),
    };
    store.create_campaign(campaign, "The Sunken Keep").await?;
    for player in [&alice, &bob] {
        store.add_member(campaign, player.id).await?;
    }
    store
        .upsert_summary(CampaignSummary {
            campaign_id: campaign,
            title: "The Sunken Keep".into(),
            summary: "Water rises in the lower halls.".into(),
            current_turn_player_id: Some(alice.id),
            message_count: 0,
            updated_at: Utc::now(),
        })
        .await?;

    let device = || SagaClient::new(config.clone(), Arc::new(hub.clone()), store.clone(), session.clone());
    let (first, second) = (device(), device());

    first.sign_in(alice.id).await?;
    let bob_session = second.sign_in(bob.id).await?;

    let alice_view = first.open_campaign(campaign, alice.clone()).await?;
    let bob_view = second.open_campaign(campaign, bob.clone()).await?;
    for channel in [
        alice_view.history().channel(),
        alice_view.turn().channel(),
        bob_view.history().channel(),
        bob_view.turn().channel(),
    ] {
        channel.wait_subscribed().await?;
    }

    let sent = alice_view.take_turn("I light the torch and step into the water.").await?;
    info!("Alice wrote message {}", sent.id);

    let mut bob_history = bob_view.history().subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        bob_history.wait_for(|rows| rows.iter().any(|m| m.id == sent.id)),
    )
    .await
    .context("Bob never saw Alice's move")??;
    info!("Bob sees {} messages", bob_view.history().messages().len());

    let unread = bob_session.read_status.is_unread(campaign, sent.id);
    bob_session.read_status.mark_read(campaign, sent.id).await?;
    info!(
        "Bob had unread messages: {}, now: {}",
        unread,
        bob_session.read_status.is_unread(campaign, sent.id)
    );

    for summary in bob_session.summaries.summaries() {
        info!("campaign {}: {}", summary.title, summary.summary);
    }

    alice_view.close();
    bob_view.close();
    first.sign_out();
    second.sign_out();
    info!("simulation complete");
    Ok(())
}
