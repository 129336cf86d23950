//! SQLite storage backend.
//!
//! Schema:
//! ```text
//! client(id, username UNIQUE, online)
//! queue(id, name UNIQUE)
//! message(id, sender_id, receiver_id?, context, priority, created_at, content)
//! msg_queue_assoc(message_id, queue_id)   -- many-to-many
//! ```
//!
//! Every transaction starts with `BEGIN IMMEDIATE`, taking the write lock up
//! front so that check-then-write sequences (queue exists, queue empty,
//! client online) cannot interleave with another worker's writes.

use std::path::Path;
use std::time::Duration;

use mq_core::{ClientId, Context, FilterType, MessageId, OrderBy};
use rusqlite::{params, Connection, OptionalExtension};

use crate::application::storage::{
    Client, NewMessage, Storage, StorageError, StoredMessage, Transaction,
};
use crate::infrastructure::storage::now_micros;
use crate::infrastructure::storage::pool::{ConnectionPool, PooledConnection};

/// How long a statement waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS client (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT    NOT NULL UNIQUE,
    online   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS queue (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT    NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS message (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id   INTEGER NOT NULL REFERENCES client(id),
    receiver_id INTEGER REFERENCES client(id),
    context     INTEGER NOT NULL,
    priority    INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 10),
    created_at  INTEGER NOT NULL,
    content     TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS msg_queue_assoc (
    message_id INTEGER NOT NULL REFERENCES message(id) ON DELETE CASCADE,
    queue_id   INTEGER NOT NULL REFERENCES queue(id),
    PRIMARY KEY (message_id, queue_id)
);
CREATE INDEX IF NOT EXISTS idx_assoc_queue      ON msg_queue_assoc(queue_id);
CREATE INDEX IF NOT EXISTS idx_message_priority ON message(priority DESC, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_message_created  ON message(created_at DESC, priority DESC);
CREATE INDEX IF NOT EXISTS idx_message_sender   ON message(sender_id);
CREATE INDEX IF NOT EXISTS idx_message_receiver ON message(receiver_id);
";

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

/// [`Storage`] implementation over a pool of SQLite connections to one file.
pub struct SqliteStore {
    pool: ConnectionPool<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` with a pool of
    /// `max_connections` connections.
    ///
    /// No connection can be live at startup, so every client is marked
    /// offline once the schema is in place.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(
        path: &Path,
        max_connections: usize,
        checkout_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let pool = ConnectionPool::new(max_connections, checkout_timeout, || open_connection(path))?;
        {
            let conn = pool.checkout()?;
            conn.execute_batch(SCHEMA)?;
            conn.execute("UPDATE client SET online = 0 WHERE online <> 0", [])?;
        }
        Ok(Self { pool })
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

impl Storage for SqliteStore {
    fn begin(&self) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let conn = self.pool.checkout()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Box::new(SqliteTransaction {
            conn,
            finished: false,
        }))
    }
}

struct SqliteTransaction<'a> {
    conn: PooledConnection<'a, Connection>,
    finished: bool,
}

impl SqliteTransaction<'_> {
    fn client_id(&self, username: &str) -> Result<Option<ClientId>, StorageError> {
        Ok(self
            .conn
            .prepare_cached("SELECT id FROM client WHERE username = ?1")?
            .query_row(params![username], |row| row.get(0))
            .optional()?)
    }

    fn queue_id(&self, name: &str) -> Result<Option<i64>, StorageError> {
        Ok(self
            .conn
            .prepare_cached("SELECT id FROM queue WHERE name = ?1")?
            .query_row(params![name], |row| row.get(0))
            .optional()?)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn find_client_by_username(&mut self, username: &str) -> Result<Option<Client>, StorageError> {
        Ok(self
            .conn
            .prepare_cached("SELECT id, username, online FROM client WHERE username = ?1")?
            .query_row(params![username], |row| {
                Ok(Client {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    online: row.get(2)?,
                })
            })
            .optional()?)
    }

    fn create_client(&mut self, username: &str, online: bool) -> Result<ClientId, StorageError> {
        self.conn
            .prepare_cached("INSERT INTO client (username, online) VALUES (?1, ?2)")?
            .execute(params![username, online])?;
        Ok(self.conn.last_insert_rowid())
    }

    fn set_client_online(&mut self, id: ClientId, online: bool) -> Result<(), StorageError> {
        let updated = self
            .conn
            .prepare_cached("UPDATE client SET online = ?2 WHERE id = ?1")?
            .execute(params![id, online])?;
        if updated == 0 {
            return Err(StorageError::ClientNotFound(id.to_string()));
        }
        Ok(())
    }

    fn create_queue(&mut self, name: &str) -> Result<(), StorageError> {
        if self.queue_id(name)?.is_some() {
            return Err(StorageError::QueueExists(name.to_string()));
        }
        self.conn
            .prepare_cached("INSERT INTO queue (name) VALUES (?1)")?
            .execute(params![name])?;
        Ok(())
    }

    fn delete_queue(&mut self, name: &str) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .prepare_cached(
                "DELETE FROM queue WHERE name = ?1 \
                 AND NOT EXISTS (SELECT 1 FROM msg_queue_assoc a WHERE a.queue_id = queue.id)",
            )?
            .execute(params![name])?;
        if deleted > 0 {
            return Ok(());
        }
        match self.queue_id(name)? {
            Some(_) => Err(StorageError::QueueNotEmpty(name.to_string())),
            None => Err(StorageError::QueueNotFound(name.to_string())),
        }
    }

    fn create_message(&mut self, message: &NewMessage) -> Result<MessageId, StorageError> {
        let receiver_id = match &message.receiver {
            Some(name) => Some(
                self.client_id(name)?
                    .ok_or_else(|| StorageError::ClientNotFound(name.clone()))?,
            ),
            None => None,
        };
        let mut queue_ids = Vec::with_capacity(message.queues.len());
        for name in &message.queues {
            let id = self
                .queue_id(name)?
                .ok_or_else(|| StorageError::QueueNotFound(name.clone()))?;
            queue_ids.push(id);
        }

        let last: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(created_at), 0) FROM message", [], |row| row.get(0))?;
        let created_at = now_micros().max(last + 1);

        self.conn
            .prepare_cached(
                "INSERT INTO message (sender_id, receiver_id, context, priority, created_at, content) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                message.sender,
                receiver_id,
                message.context as u32,
                message.priority.get(),
                created_at,
                message.content,
            ])?;
        let id = self.conn.last_insert_rowid();

        let mut link = self
            .conn
            .prepare_cached("INSERT INTO msg_queue_assoc (message_id, queue_id) VALUES (?1, ?2)")?;
        for queue_id in queue_ids {
            link.execute(params![id, queue_id])?;
        }
        Ok(id)
    }

    fn retrieve_top_message(
        &mut self,
        receiver: ClientId,
        filter: FilterType,
        value: &str,
        order: OrderBy,
    ) -> Result<Option<StoredMessage>, StorageError> {
        let filter_column = match filter {
            FilterType::Queue => "q.name",
            FilterType::Sender => "s.username",
        };
        let order_clause = match order {
            OrderBy::Priority => "m.priority DESC, m.created_at DESC",
            OrderBy::Timestamp => "m.created_at DESC, m.priority DESC",
        };
        let sql = format!(
            "SELECT m.id, s.username, r.username, q.name, m.context, m.priority, m.created_at, m.content \
             FROM message m \
             JOIN msg_queue_assoc a ON a.message_id = m.id \
             JOIN queue q ON q.id = a.queue_id \
             JOIN client s ON s.id = m.sender_id \
             LEFT JOIN client r ON r.id = m.receiver_id \
             WHERE {filter_column} = ?1 AND (m.receiver_id IS NULL OR m.receiver_id = ?2) \
             ORDER BY {order_clause}, q.name ASC \
             LIMIT 1"
        );

        let row = self
            .conn
            .prepare_cached(&sql)?
            .query_row(params![value, receiver], |row| {
                Ok((
                    StoredMessage {
                        id: row.get(0)?,
                        sender: row.get(1)?,
                        receiver: row.get(2)?,
                        queue: row.get(3)?,
                        context: Context::None,
                        priority: row.get(5)?,
                        created_at: row.get(6)?,
                        content: row.get(7)?,
                    },
                    row.get::<_, u32>(4)?,
                ))
            })
            .optional()?;

        let Some((mut message, context_code)) = row else {
            return Ok(None);
        };
        message.context = Context::try_from(context_code).map_err(|_| {
            StorageError::Backend(format!("message {} has invalid context {context_code}", message.id))
        })?;
        Ok(Some(message))
    }

    fn delete_message_from_queue(&mut self, id: MessageId, queue: &str) -> Result<(), StorageError> {
        self.conn
            .prepare_cached(
                "DELETE FROM msg_queue_assoc \
                 WHERE message_id = ?1 AND queue_id = (SELECT id FROM queue WHERE name = ?2)",
            )?
            .execute(params![id, queue])?;
        self.conn
            .prepare_cached(
                "DELETE FROM message WHERE id = ?1 \
                 AND NOT EXISTS (SELECT 1 FROM msg_queue_assoc WHERE message_id = ?1)",
            )?
            .execute(params![id])?;
        Ok(())
    }

    fn queues_with_pending_messages_for(&mut self, receiver: ClientId) -> Result<Vec<String>, StorageError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT DISTINCT q.name FROM queue q \
             JOIN msg_queue_assoc a ON a.queue_id = q.id \
             JOIN message m ON m.id = a.message_id \
             WHERE m.receiver_id = ?1 \
             ORDER BY q.name",
        )?;
        let names = stmt
            .query_map(params![receiver], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}
