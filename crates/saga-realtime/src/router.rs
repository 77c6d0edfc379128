use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, info};
use uuid::Uuid;

use saga_types::events::{ChangeEvent, ChangeKind, Table};
use saga_types::subscription::{Interest, RowFilter, SubscriptionDescriptor};

use crate::supervisor::{ChannelHandle, ConnectionSupervisor, Inbound, InboundHandler};

pub type TableHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type Handlers = Arc<RwLock<HashMap<Table, TableHandler>>>;

pub fn channel_name(user_id: Uuid) -> String {
    format!("user-changes:{user_id}")
}

/// Every per-user table of interest, on one channel.
pub fn user_descriptor(user_id: Uuid) -> SubscriptionDescriptor {
    let user = |column: &str| RowFilter::eq(column, user_id);
    SubscriptionDescriptor::default()
        .with(Interest::all(Table::Campaigns))
        .with(Interest::on(Table::CampaignHistory, ChangeKind::Insert))
        .with(Interest::all(Table::Friendships).filtered(user("requester_id")))
        .with(Interest::all(Table::Friendships).filtered(user("addressee_id")))
        .with(Interest::all(Table::Invitations).filtered(user("inviter_id")))
        .with(Interest::all(Table::Invitations).filtered(user("invitee_id")))
        .with(Interest::all(Table::ReadStatus).filtered(user("user_id")))
        .with(Interest::on(Table::Characters, ChangeKind::Update).filtered(user("user_id")))
        .with(Interest::all(Table::CampaignSummaries))
}

/// Carries change notifications for many tables over a single supervised
/// channel per user, and hands each one to the handler registered for its
/// table.
#[derive(Clone)]
pub struct TableRouter {
    supervisor: ConnectionSupervisor,
    current: Arc<Mutex<Option<Multiplexed>>>,
}

struct Multiplexed {
    user_id: Uuid,
    channel: ChannelHandle,
    handlers: Handlers,
}

impl TableRouter {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self {
            supervisor,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the user's channel, or reuse it if this user already has one.
    ///
    /// A different user's channel is torn down first, handlers included, so
    /// per-user filters never outlive an account switch.
    pub fn connect(&self, user_id: Uuid, handlers: HashMap<Table, TableHandler>) -> ChannelHandle {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = current.as_ref() {
            if existing.user_id == user_id {
                debug!("reusing change channel for {}", user_id);
                existing
                    .handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(handlers);
                return existing.channel.clone();
            }
        }

        if let Some(previous) = current.take() {
            info!("switching change channel from {} to {}", previous.user_id, user_id);
            previous.shut_down();
        }

        let handlers: Handlers = Arc::new(RwLock::new(handlers));
        let dispatch: InboundHandler = {
            let handlers = handlers.clone();
            Arc::new(move |inbound: Inbound| route(&handlers, inbound))
        };
        let channel = self
            .supervisor
            .supervise(channel_name(user_id), user_descriptor(user_id), dispatch);

        *current = Some(Multiplexed {
            user_id,
            channel: channel.clone(),
            handlers,
        });
        channel
    }

    /// Register a handler on the open channel. Returns false if no user is connected.
    pub fn add_handler(&self, table: Table, handler: TableHandler) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(multiplexed) => {
                multiplexed
                    .handlers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(table, handler);
                true
            }
            None => false,
        }
    }

    pub fn remove_handler(&self, table: Table) -> bool {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().is_some_and(|multiplexed| {
            multiplexed
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&table)
                .is_some()
        })
    }

    pub fn current_user(&self) -> Option<Uuid> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|multiplexed| multiplexed.user_id)
    }

    pub fn channel(&self) -> Option<ChannelHandle> {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|multiplexed| multiplexed.channel.clone())
    }

    pub fn disconnect(&self) {
        let previous = self.current.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(previous) = previous {
            info!("closing change channel for {}", previous.user_id);
            previous.shut_down();
        }
    }
}

impl Multiplexed {
    fn shut_down(self) {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.channel.close();
    }
}

fn route(handlers: &Handlers, inbound: Inbound) {
    let change = match inbound {
        Inbound::Change(change) => change,
        Inbound::Broadcast { event, .. } => {
            debug!("ignoring broadcast {} on change channel", event);
            return;
        }
    };
    let Some(table) = change.table() else {
        debug!("ignoring change for unknown table {}", change.table);
        return;
    };
    // Cloned out so a handler may register or remove handlers itself.
    let handler = handlers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&table)
        .cloned();
    match handler {
        Some(handler) => handler(&change),
        None => debug!("no handler registered for {}", table),
    }
}
