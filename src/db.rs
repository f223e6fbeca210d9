//! Database module for the negotiation engine
//!
//! Provides persistence for conversations, the message log and durable
//! last-seen bookkeeping. Every negotiation mutation runs through
//! [`Database::transaction`], which holds an IMMEDIATE SQLite transaction
//! for the whole read-validate-write sequence.

mod schema;

pub use schema::*;

use crate::state_machine::replay;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Offer already resolved: {0}")]
    OfferAlreadyResolved(String),
    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Run `f` inside one IMMEDIATE transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back every write `f`
    /// made.
    pub fn transaction<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DbError::from)?;
        let value = f(&tx)?;
        tx.commit().map_err(DbError::from)?;
        Ok(value)
    }

    // ==================== Conversation Operations ====================

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.lock()?;
        load_conversation(&conn, id)
    }

    /// Conversations `participant` is in, most recently active first
    pub fn list_conversations_for(
        &self,
        participant: &ParticipantId,
    ) -> DbResult<Vec<ConversationSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS},
                    (SELECT COUNT(*) FROM messages m
                     WHERE m.conversation_id = c.id AND m.receiver_id = ?1 AND m.is_read = 0)
             FROM conversations c
             WHERE c.participant_a = ?1 OR c.participant_b = ?1
             ORDER BY c.last_activity_at DESC, c.id ASC"
        ))?;

        let rows = stmt.query_map(params![participant.as_str()], |row| {
            let conversation = parse_conversation_row(row)?;
            let unread_count: i64 = row.get(13)?;
            Ok((conversation, unread_count))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (conversation, unread_count) = row?;
            let Some(peer_id) = conversation.peer_of(participant).cloned() else {
                continue;
            };
            summaries.push(ConversationSummary {
                role: conversation.role_of(participant),
                peer_id,
                unread_count,
                conversation,
            });
        }
        Ok(summaries)
    }

    /// Compare the stored negotiation state with a replay of the log.
    ///
    /// Returns the replayed state when the two differ.
    pub fn verify_state(&self, conversation_id: &str) -> DbResult<Option<NegotiationState>> {
        let conn = self.lock()?;
        let conversation = load_conversation(&conn, conversation_id)?;
        let messages = load_messages(&conn, conversation_id, None, None)?;
        let replayed = replay(&messages);
        Ok((replayed != conversation.state).then_some(replayed))
    }

    /// Rewrite any stored negotiation state that disagrees with its log.
    /// Last activity is left untouched. Returns the repaired conversation ids.
    pub fn repair_derived_states(&self) -> DbResult<Vec<String>> {
        let ids: Vec<String> = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare("SELECT id FROM conversations ORDER BY id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let ids = rows.collect::<Result<Vec<String>, _>>()?;
            ids
        };

        let mut repaired = Vec::new();
        for id in ids {
            let Some(replayed) = self.verify_state(&id)? else {
                continue;
            };
            self.transaction(|conn| {
                let conversation = load_conversation(conn, &id)?;
                save_state(conn, &id, &replayed, conversation.last_activity_at)
            })?;
            tracing::warn!(
                conv_id = %id,
                status = %replayed.status,
                "Repaired derived negotiation state"
            );
            repaired.push(id);
        }
        Ok(repaired)
    }

    // ==================== Message Operations ====================

    /// Get all messages for a conversation, oldest first
    #[allow(dead_code)] // Used in tests
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.lock()?;
        load_messages(&conn, conversation_id, None, None)
    }

    /// Get messages after a sequence ID, capped at `limit`
    #[allow(dead_code)] // Used in tests
    pub fn get_messages_after(
        &self,
        conversation_id: &str,
        after_sequence: Option<i64>,
        limit: Option<u32>,
    ) -> DbResult<Vec<Message>> {
        let conn = self.lock()?;
        load_messages(&conn, conversation_id, after_sequence, limit)
    }

    /// Get a message by its `message_id`
    #[allow(dead_code)] // Used in tests
    pub fn get_message(&self, message_id: &str) -> DbResult<Message> {
        let conn = self.lock()?;
        load_message(&conn, message_id)
    }

    /// Mark every message addressed to `reader` in a conversation as read
    pub fn mark_read(&self, conversation_id: &str, reader: &ParticipantId) -> DbResult<usize> {
        let conn = self.lock()?;
        mark_read(&conn, conversation_id, reader)
    }

    /// Unread messages addressed to `participant` across all conversations
    pub fn unread_count(&self, participant: &ParticipantId) -> DbResult<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE receiver_id = ?1 AND is_read = 0",
            params![participant.as_str()],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    // ==================== Participant Operations ====================

    /// Record a connect or disconnect
    pub fn touch_participant(
        &self,
        participant: &ParticipantId,
        online: bool,
        at: DateTime<Utc>,
    ) -> DbResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO participants (participant_id, online, last_seen_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(participant_id) DO UPDATE SET online = excluded.online, last_seen_at = excluded.last_seen_at",
            params![participant.as_str(), online, format_datetime(at)],
        )?;
        Ok(())
    }

    pub fn last_seen(&self, participant: &ParticipantId) -> DbResult<Option<LastSeen>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT participant_id, online, last_seen_at FROM participants WHERE participant_id = ?1",
            params![participant.as_str()],
            |row| {
                Ok(LastSeen {
                    participant_id: parse_identifier(row, 0)?,
                    online: row.get(1)?,
                    last_seen_at: parse_datetime(row, 2)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }
}

// ==================== Connection-level operations ====================
//
// These take a bare connection so they compose inside `Database::transaction`.

const CONVERSATION_COLUMNS: &str = "c.id, c.participant_a, c.participant_b, c.item_key, c.holder_id, \
     c.status, c.current_offer_id, c.current_offer_price, c.current_offer_by, \
     c.finalized, c.finalized_price, c.created_at, c.last_activity_at";

const MESSAGE_COLUMNS: &str = "message_id, conversation_id, sequence_id, sender_id, receiver_id, \
     message_kind, body, price, quantity, responds_to, created_at, expires_at, resolution, is_read";

/// Insert a conversation unless one already exists for the same key.
///
/// Returns whether a row was inserted.
pub fn insert_conversation_if_absent(conn: &Connection, new: &NewConversation) -> DbResult<bool> {
    let created_at = format_datetime(new.created_at);
    let inserted = conn.execute(
        "INSERT INTO conversations
             (id, participant_a, participant_b, item_key, holder_id, status, finalized, created_at, last_activity_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'active', 0, ?6, ?6)
         ON CONFLICT DO NOTHING",
        params![
            new.id,
            new.participant_a.as_str(),
            new.participant_b.as_str(),
            new.item_ref.as_ref().map_or("", ItemRef::as_str),
            new.holder_id.as_ref().map(ParticipantId::as_str),
            created_at,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn load_conversation(conn: &Connection, id: &str) -> DbResult<Conversation> {
    conn.query_row(
        &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
        params![id],
        parse_conversation_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::ConversationNotFound(id.to_string()),
        other => DbError::Sqlite(other),
    })
}

/// Persist the derived negotiation state and bump last activity
pub fn save_state(
    conn: &Connection,
    conversation_id: &str,
    state: &NegotiationState,
    at: DateTime<Utc>,
) -> DbResult<()> {
    let offer = state.current_offer.as_ref();
    let updated = conn.execute(
        "UPDATE conversations
         SET status = ?1, current_offer_id = ?2, current_offer_price = ?3, current_offer_by = ?4,
             finalized = ?5, finalized_price = ?6, last_activity_at = ?7
         WHERE id = ?8",
        params![
            state.status.as_str(),
            offer.map(|o| o.message_id.as_str()),
            offer.map(|o| o.price),
            offer.map(|o| o.proposer_id.as_str()),
            state.finalized,
            state.finalized_price,
            format_datetime(at),
            conversation_id,
        ],
    )?;
    if updated == 0 {
        return Err(DbError::ConversationNotFound(conversation_id.to_string()));
    }
    Ok(())
}

/// Append a message at the next sequence position of its conversation
pub fn insert_message(conn: &Connection, new: NewMessage) -> DbResult<Message> {
    let sequence_id: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
        params![new.conversation_id],
        |row| row.get(0),
    )?;

    conn.execute(
        &format!(
            "INSERT INTO messages ({MESSAGE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, 0)"
        ),
        params![
            new.message_id,
            new.conversation_id,
            sequence_id,
            new.sender_id.as_str(),
            new.receiver_id.as_str(),
            new.content.kind().as_str(),
            new.content.body(),
            new.content.price(),
            new.content.quantity(),
            new.responds_to,
            format_datetime(new.created_at),
            new.expires_at.map(format_datetime),
        ],
    )?;

    Ok(new.stored(sequence_id))
}

pub fn load_message(conn: &Connection, message_id: &str) -> DbResult<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE message_id = ?1"),
        params![message_id],
        parse_message_row,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::MessageNotFound(message_id.to_string()),
        other => DbError::Sqlite(other),
    })
}

pub fn load_messages(
    conn: &Connection,
    conversation_id: &str,
    after_sequence: Option<i64>,
    limit: Option<u32>,
) -> DbResult<Vec<Message>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ?1 AND sequence_id > ?2
         ORDER BY sequence_id ASC LIMIT ?3"
    ))?;

    // SQLite treats a negative LIMIT as unbounded
    let limit = limit.map_or(-1, i64::from);
    let rows = stmt.query_map(
        params![conversation_id, after_sequence.unwrap_or(0), limit],
        parse_message_row,
    )?;
    rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
}

/// Record the answer on a proposal only if it is still open.
///
/// A second resolution of the same offer fails with
/// [`DbError::OfferAlreadyResolved`], which rolls back the enclosing
/// transaction.
pub fn resolve_offer_if_open(
    conn: &Connection,
    message_id: &str,
    resolution: Resolution,
) -> DbResult<()> {
    let updated = conn.execute(
        "UPDATE messages SET resolution = ?1 WHERE message_id = ?2 AND resolution IS NULL",
        params![resolution.as_str(), message_id],
    )?;
    if updated == 0 {
        return Err(DbError::OfferAlreadyResolved(message_id.to_string()));
    }
    Ok(())
}

pub fn mark_read(
    conn: &Connection,
    conversation_id: &str,
    reader: &ParticipantId,
) -> DbResult<usize> {
    conn.execute(
        "UPDATE messages SET is_read = 1
         WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0",
        params![conversation_id, reader.as_str()],
    )
    .map_err(DbError::from)
}

/// Mark messages addressed to `reader` with `after < sequence_id <= through`
/// as read
pub fn mark_read_between(
    conn: &Connection,
    conversation_id: &str,
    reader: &ParticipantId,
    after: i64,
    through: i64,
) -> DbResult<usize> {
    conn.execute(
        "UPDATE messages SET is_read = 1
         WHERE conversation_id = ?1 AND receiver_id = ?2 AND is_read = 0
           AND sequence_id > ?3 AND sequence_id <= ?4",
        params![conversation_id, reader.as_str(), after, through],
    )
    .map_err(DbError::from)
}

// ==================== Row parsing ====================

fn parse_conversation_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let item_key: String = row.get(3)?;
    let item_ref = if item_key.is_empty() {
        None
    } else {
        Some(ItemRef::parse(item_key).map_err(|e| corrupt(3, e))?)
    };
    let holder_id = row
        .get::<_, Option<String>>(4)?
        .map(ParticipantId::parse)
        .transpose()
        .map_err(|e| corrupt(4, e))?;

    let status_str: String = row.get(5)?;
    let status = ConversationStatus::parse(&status_str)
        .ok_or_else(|| corrupt(5, format!("unknown conversation status {status_str:?}")))?;

    let current_offer = match (
        row.get::<_, Option<String>>(6)?,
        row.get::<_, Option<Price>>(7)?,
        row.get::<_, Option<String>>(8)?,
    ) {
        (Some(message_id), Some(price), Some(proposer)) => Some(CurrentOffer {
            message_id,
            price,
            proposer_id: ParticipantId::parse(proposer).map_err(|e| corrupt(8, e))?,
        }),
        _ => None,
    };

    Ok(Conversation {
        id: row.get(0)?,
        participant_a: parse_identifier(row, 1)?,
        participant_b: parse_identifier(row, 2)?,
        item_ref,
        holder_id,
        state: NegotiationState {
            status,
            current_offer,
            finalized: row.get(9)?,
            finalized_price: row.get(10)?,
        },
        created_at: parse_datetime(row, 11)?,
        last_activity_at: parse_datetime(row, 12)?,
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let kind_str: String = row.get(5)?;
    let kind = MessageKind::parse(&kind_str)
        .ok_or_else(|| corrupt(5, format!("unknown message kind {kind_str:?}")))?;
    let content = MessageContent::from_columns(kind, row.get(6)?, row.get(7)?, row.get(8)?)
        .map_err(|e| corrupt(7, e))?;

    let resolution = row
        .get::<_, Option<String>>(12)?
        .map(|s| {
            Resolution::parse(&s)
                .ok_or_else(|| corrupt(12, format!("unknown resolution {s:?}")))
        })
        .transpose()?;

    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        sender_id: parse_identifier(row, 3)?,
        receiver_id: parse_identifier(row, 4)?,
        content,
        responds_to: row.get(9)?,
        created_at: parse_datetime(row, 10)?,
        expires_at: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_rfc3339(11, &s))
            .transpose()?,
        resolution,
        read: row.get(13)?,
    })
}

fn parse_identifier<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: TryFrom<String, Error = InvalidIdentifier>,
{
    T::try_from(row.get::<_, String>(idx)?).map_err(|e| corrupt(idx, e))
}

fn parse_datetime(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_rfc3339(idx, &row.get::<_, String>(idx)?)
}

fn parse_rfc3339(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| corrupt(idx, e))
}

/// Timestamps are stored at microsecond precision so they sort as text
pub fn format_datetime(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn corrupt(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}
