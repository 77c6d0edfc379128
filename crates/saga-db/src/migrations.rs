use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS campaigns (
            id          TEXT PRIMARY KEY,
            title       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        );

        CREATE TABLE IF NOT EXISTS campaign_members (
            campaign_id TEXT NOT NULL REFERENCES campaigns(id),
            user_id     TEXT NOT NULL,
            PRIMARY KEY (campaign_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS campaign_history (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id     TEXT NOT NULL REFERENCES campaigns(id),
            author_id       TEXT,
            author_name     TEXT NOT NULL,
            kind            TEXT NOT NULL,
            content         TEXT NOT NULL,
            character_id    TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_campaign
            ON campaign_history(campaign_id, id);

        CREATE TABLE IF NOT EXISTS read_status (
            user_id                 TEXT NOT NULL,
            campaign_id             TEXT NOT NULL REFERENCES campaigns(id),
            last_read_message_id    INTEGER NOT NULL,
            updated_at              TEXT NOT NULL,
            UNIQUE(user_id, campaign_id)
        );

        CREATE TABLE IF NOT EXISTS player_actions (
            id              TEXT PRIMARY KEY,
            campaign_id     TEXT NOT NULL REFERENCES campaigns(id),
            character_id    TEXT NOT NULL,
            game_mode       TEXT NOT NULL,
            label           TEXT NOT NULL,
            priority        INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            expires_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_actions_scope
            ON player_actions(campaign_id, character_id, game_mode);

        CREATE TABLE IF NOT EXISTS characters (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            campaign_id TEXT,
            name        TEXT NOT NULL,
            level       INTEGER NOT NULL DEFAULT 1,
            experience  INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaign_summaries (
            campaign_id             TEXT PRIMARY KEY REFERENCES campaigns(id),
            title                   TEXT NOT NULL,
            summary                 TEXT NOT NULL DEFAULT '',
            current_turn_player_id  TEXT,
            message_count           INTEGER NOT NULL DEFAULT 0,
            updated_at              TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
