use crate::Database;
use crate::models::{ActionRow, CharacterRow, MessageRow, ReadStatusRow, SummaryRow, kind_str, timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row};
use saga_types::models::{ActionScope, CampaignSummary, CharacterLevel, NewMessage, PlayerAction, ReadStatus};
use uuid::Uuid;

const MESSAGE_COLUMNS: &str =
    "id, campaign_id, author_id, author_name, kind, content, character_id, created_at";
const ACTION_COLUMNS: &str =
    "id, campaign_id, character_id, game_mode, label, priority, created_at, expires_at";

impl Database {
    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    // -- Campaigns --

    pub fn create_campaign(&self, id: Uuid, title: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaigns (id, title) VALUES (?1, ?2)",
                (id.to_string(), title),
            )?;
            Ok(())
        })
    }

    pub fn add_member(&self, campaign_id: Uuid, user_id: Uuid) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO campaign_members (campaign_id, user_id) VALUES (?1, ?2)",
                (campaign_id.to_string(), user_id.to_string()),
            )?;
            Ok(())
        })
    }

    // -- History --

    pub fn insert_message(&self, message: &NewMessage, created_at: DateTime<Utc>) -> Result<MessageRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO campaign_history (campaign_id, author_id, author_name, kind, content, character_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.campaign_id.to_string(),
                    message.author_id.map(|id| id.to_string()),
                    message.author_name,
                    kind_str(message.kind),
                    message.content,
                    message.character_id.map(|id| id.to_string()),
                    timestamp(created_at),
                ],
            )?;
            let id = conn.last_insert_rowid();
            let sql = format!("SELECT {} FROM campaign_history WHERE id = ?1", MESSAGE_COLUMNS);
            Ok(conn.query_row(&sql, [id], message_row)?)
        })
    }

    /// The `limit` most recent messages, oldest first.
    pub fn get_history(&self, campaign_id: Uuid, limit: usize) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| query_history(conn, &campaign_id.to_string(), limit))
    }

    pub fn edit_message(&self, id: i64, content: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE campaign_history SET content = ?1 WHERE id = ?2",
                rusqlite::params![content, id],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let sql = format!("SELECT {} FROM campaign_history WHERE id = ?1", MESSAGE_COLUMNS);
            conn.query_row(&sql, [id], message_row).optional()
        })
    }

    // -- Read status --

    pub fn get_read_status(&self, user_id: Uuid) -> Result<Vec<ReadStatusRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, campaign_id, last_read_message_id, updated_at
                 FROM read_status WHERE user_id = ?1",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], read_status_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Creates the marker or moves it forward. Returns the stored row and
    /// whether it existed before.
    pub fn upsert_read_status(&self, status: &ReadStatus) -> Result<(ReadStatusRow, bool)> {
        self.with_conn(|conn| {
            let user_id = status.user_id.to_string();
            let campaign_id = status.campaign_id.to_string();
            let existed = query_read_status(conn, &user_id, &campaign_id)?.is_some();

            conn.execute(
                "INSERT INTO read_status (user_id, campaign_id, last_read_message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, campaign_id) DO UPDATE SET
                    last_read_message_id = MAX(last_read_message_id, excluded.last_read_message_id),
                    updated_at = excluded.updated_at",
                rusqlite::params![user_id, campaign_id, status.last_read_message_id, timestamp(status.updated_at)],
            )?;

            let stored = query_read_status(conn, &user_id, &campaign_id)?
                .ok_or_else(|| anyhow::anyhow!("read status vanished after upsert"))?;
            Ok((stored, existed))
        })
    }

    // -- Player actions --

    /// Highest priority first, then newest first.
    pub fn get_actions(&self, scope: &ActionScope) -> Result<Vec<ActionRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM player_actions
                 WHERE campaign_id = ?1 AND character_id = ?2 AND game_mode = ?3
                 ORDER BY priority DESC, created_at DESC, id ASC",
                ACTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    rusqlite::params![
                        scope.campaign_id.to_string(),
                        scope.character_id.to_string(),
                        scope.game_mode
                    ],
                    action_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_action(&self, action: &PlayerAction) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO player_actions (id, campaign_id, character_id, game_mode, label, priority, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    action.id.to_string(),
                    action.campaign_id.to_string(),
                    action.character_id.to_string(),
                    action.game_mode,
                    action.label,
                    action.priority,
                    timestamp(action.created_at),
                    action.expires_at.map(timestamp),
                ],
            )?;
            Ok(())
        })
    }

    /// Returns the deleted row, or `None` if there was nothing to delete.
    pub fn delete_action(&self, id: Uuid) -> Result<Option<ActionRow>> {
        self.with_conn(|conn| {
            let id = id.to_string();
            let sql = format!("SELECT {} FROM player_actions WHERE id = ?1", ACTION_COLUMNS);
            let Some(existing) = conn.query_row(&sql, [&id], action_row).optional()? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM player_actions WHERE id = ?1", [&id])?;
            Ok(Some(existing))
        })
    }

    // -- Characters --

    pub fn get_characters(&self, user_id: Uuid) -> Result<Vec<CharacterRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, campaign_id, name, level, experience, updated_at
                 FROM characters WHERE user_id = ?1 ORDER BY name, id",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], character_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns whether the character existed before.
    pub fn upsert_character(&self, character: &CharacterLevel) -> Result<bool> {
        self.with_conn(|conn| {
            let id = character.character_id.to_string();
            let existed = conn
                .query_row("SELECT 1 FROM characters WHERE id = ?1", [&id], |row| row.get::<_, i64>(0))
                .optional()?
                .is_some();
            conn.execute(
                "INSERT INTO characters (id, user_id, campaign_id, name, level, experience, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    campaign_id = excluded.campaign_id,
                    name = excluded.name,
                    level = excluded.level,
                    experience = excluded.experience,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    id,
                    character.user_id.to_string(),
                    character.campaign_id.map(|c| c.to_string()),
                    character.name,
                    i64::from(character.level),
                    i64::try_from(character.experience)?,
                    timestamp(character.updated_at),
                ],
            )?;
            Ok(existed)
        })
    }

    // -- Summaries --

    /// Summaries of the user's campaigns, most recently updated first.
    pub fn get_summaries_for(&self, user_id: Uuid) -> Result<Vec<SummaryRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.campaign_id, s.title, s.summary, s.current_turn_player_id, s.message_count, s.updated_at
                 FROM campaign_summaries s
                 JOIN campaign_members m ON m.campaign_id = s.campaign_id
                 WHERE m.user_id = ?1
                 ORDER BY s.updated_at DESC, s.campaign_id ASC",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], |row| {
                    Ok(SummaryRow {
                        campaign_id: row.get(0)?,
                        title: row.get(1)?,
                        summary: row.get(2)?,
                        current_turn_player_id: row.get(3)?,
                        message_count: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns whether the summary existed before.
    pub fn upsert_summary(&self, summary: &CampaignSummary) -> Result<bool> {
        self.with_conn(|conn| {
            let campaign_id = summary.campaign_id.to_string();
            let existed = conn
                .query_row(
                    "SELECT 1 FROM campaign_summaries WHERE campaign_id = ?1",
                    [&campaign_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .is_some();
            conn.execute(
                "INSERT INTO campaign_summaries (campaign_id, title, summary, current_turn_player_id, message_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(campaign_id) DO UPDATE SET
                    title = excluded.title,
                    summary = excluded.summary,
                    current_turn_player_id = excluded.current_turn_player_id,
                    message_count = excluded.message_count,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    campaign_id,
                    summary.title,
                    summary.summary,
                    summary.current_turn_player_id.map(|id| id.to_string()),
                    summary.message_count,
                    timestamp(summary.updated_at),
                ],
            )?;
            Ok(existed)
        })
    }
}

// -- Query helpers --

fn message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        author_id: row.get(2)?,
        author_name: row.get(3)?,
        kind: row.get(4)?,
        content: row.get(5)?,
        character_id: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn read_status_row(row: &Row<'_>) -> rusqlite::Result<ReadStatusRow> {
    Ok(ReadStatusRow {
        user_id: row.get(0)?,
        campaign_id: row.get(1)?,
        last_read_message_id: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

fn action_row(row: &Row<'_>) -> rusqlite::Result<ActionRow> {
    Ok(ActionRow {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        character_id: row.get(2)?,
        game_mode: row.get(3)?,
        label: row.get(4)?,
        priority: row.get(5)?,
        created_at: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

fn character_row(row: &Row<'_>) -> rusqlite::Result<CharacterRow> {
    Ok(CharacterRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        campaign_id: row.get(2)?,
        name: row.get(3)?,
        level: row.get(4)?,
        experience: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn query_history(conn: &Connection, campaign_id: &str, limit: usize) -> Result<Vec<MessageRow>> {
    let sql = format!(
        "SELECT {} FROM campaign_history WHERE campaign_id = ?1 ORDER BY id DESC LIMIT ?2",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map(rusqlite::params![campaign_id, i64::try_from(limit)?], message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

fn query_read_status(conn: &Connection, user_id: &str, campaign_id: &str) -> Result<Option<ReadStatusRow>> {
    conn.query_row(
        "SELECT user_id, campaign_id, last_read_message_id, updated_at
         FROM read_status WHERE user_id = ?1 AND campaign_id = ?2",
        [user_id, campaign_id],
        read_status_row,
    )
    .optional()
}

trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_types::models::MessageKind;

    fn line(campaign_id: Uuid, content: &str) -> NewMessage {
        NewMessage {
            campaign_id,
            author_id: None,
            author_name: "Narrator".into(),
            kind: MessageKind::Narrator,
            content: content.into(),
            character_id: None,
        }
    }

    fn campaign(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        db.create_campaign(id, "The Sunken Keep").unwrap();
        id
    }

    #[test]
    fn history_returns_the_most_recent_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let id = campaign(&db);
        for n in 0..5 {
            db.insert_message(&line(id, &format!("line {n}")), Utc::now()).unwrap();
        }

        let rows = db.get_history(id, 3).unwrap();
        let contents: Vec<_> = rows.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(contents, ["line 2", "line 3", "line 4"]);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn messages_need_an_existing_campaign() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.insert_message(&line(Uuid::new_v4(), "lost"), Utc::now()).is_err());
    }

    #[test]
    fn read_marker_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        let id = campaign(&db);
        let mut status = ReadStatus {
            user_id: Uuid::new_v4(),
            campaign_id: id,
            last_read_message_id: 9,
            updated_at: Utc::now(),
        };

        let (row, existed) = db.upsert_read_status(&status).unwrap();
        assert!(!existed);
        assert_eq!(row.last_read_message_id, 9);

        status.last_read_message_id = 3;
        let (row, existed) = db.upsert_read_status(&status).unwrap();
        assert!(existed);
        assert_eq!(row.last_read_message_id, 9);
        assert_eq!(db.get_read_status(status.user_id).unwrap().len(), 1);
    }

    #[test]
    fn actions_are_scoped_and_ordered() {
        let db = Database::open_in_memory().unwrap();
        let scope = ActionScope {
            campaign_id: campaign(&db),
            character_id: Uuid::new_v4(),
            game_mode: "combat".into(),
        };
        let action = |label: &str, priority: i32, game_mode: &str| PlayerAction {
            id: Uuid::new_v4(),
            campaign_id: scope.campaign_id,
            character_id: scope.character_id,
            game_mode: game_mode.into(),
            label: label.into(),
            priority,
            created_at: Utc::now(),
            expires_at: None,
        };
        db.insert_action(&action("parry", 1, "combat")).unwrap();
        db.insert_action(&action("strike", 5, "combat")).unwrap();
        db.insert_action(&action("search", 9, "explore")).unwrap();

        let labels: Vec<_> = db.get_actions(&scope).unwrap().into_iter().map(|r| r.label).collect();
        assert_eq!(labels, ["strike", "parry"]);
    }

    #[test]
    fn deleting_a_missing_action_reports_nothing() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.delete_action(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn summaries_are_limited_to_member_campaigns() {
        let db = Database::open_in_memory().unwrap();
        let user = Uuid::new_v4();
        let (mine, theirs) = (campaign(&db), campaign(&db));
        db.add_member(mine, user).unwrap();
        db.add_member(mine, user).unwrap();
        for id in [mine, theirs] {
            db.upsert_summary(&CampaignSummary {
                campaign_id: id,
                title: "Keep".into(),
                summary: String::new(),
                current_turn_player_id: None,
                message_count: 0,
                updated_at: Utc::now(),
            })
            .unwrap();
        }

        let rows = db.get_summaries_for(user).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].campaign_id, mine.to_string());
    }
}
