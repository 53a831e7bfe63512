//! Durable thread storage with a write-through in-memory cache.
//!
//! Every mutation commits to the durable backend first and only then updates
//! the cache, all under one store-level write lock. A failed durable write
//! therefore never leaves a cached thread that the backend does not have.
//! The cache holds at most `cache_capacity` threads and evicts the least
//! recently used one; evicted threads are read back from the backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::{Mutex, RwLock};

use crate::models::{Content, Message, Role, Thread, ThreadSummary, now_micros, preview_text};

pub type SharedThreadStore = Arc<ThreadStore>;

/// Threads kept in memory before the least recently used is evicted.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),
    #[error("Message {message_id} already exists in thread {thread_id}")]
    DuplicateMessage {
        thread_id: String,
        message_id: String,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("store task failed: {0}")]
    Task(String),
}

/// Durable side of the store. Implementations must make each call atomic.
#[async_trait]
pub trait ThreadBackend: Send + Sync {
    /// Insert the thread if absent and return the stored record.
    async fn insert_thread(&self, thread_id: &str, now: DateTime<Utc>)
    -> Result<Thread, StoreError>;

    async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError>;

    /// Append one message and bump `updated_at` in the same transaction.
    ///
    /// Message ids are unique across all threads; a reused id fails with
    /// [`StoreError::DuplicateMessage`] naming the thread that owns it.
    async fn append_message(
        &self,
        thread_id: &str,
        message: &Message,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Thread holding `message_id`, if any.
    async fn message_thread(&self, message_id: &str) -> Result<Option<String>, StoreError>;

    /// Summaries ordered by `updated_at` descending.
    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError>;

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError>;
}

// === SQLite backend ===

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS threads (
    thread_id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL REFERENCES threads(thread_id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
"#;

/// SQLite-backed [`ThreadBackend`]. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<StdMutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::from_connection(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            path,
        })
    }

    async fn run_db<T, F>(&self, label: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|err| StoreError::Task(format!("{label}: {err}")))?
    }
}

#[async_trait]
impl ThreadBackend for SqliteBackend {
    async fn insert_thread(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Thread, StoreError> {
        let thread_id = thread_id.to_string();
        self.run_db("insert thread", move |conn| {
            let stamp = format_ts(now);
            conn.execute(
                "INSERT OR IGNORE INTO threads (thread_id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![thread_id, stamp],
            )?;
            read_thread(conn, &thread_id)?.ok_or(StoreError::ThreadNotFound(thread_id))
        })
        .await
    }

    async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        let thread_id = thread_id.to_string();
        self.run_db("load thread", move |conn| read_thread(conn, &thread_id))
            .await
    }

    async fn append_message(
        &self,
        thread_id: &str,
        message: &Message,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let thread_id = thread_id.to_string();
        let message = message.clone();
        self.run_db("append message", move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row(
                    "SELECT 1 FROM threads WHERE thread_id = ?1",
                    params![thread_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !exists {
                return Err(StoreError::ThreadNotFound(thread_id));
            }
            if let Some(owner) = owning_thread(&tx, &message.id)? {
                return Err(StoreError::DuplicateMessage {
                    thread_id: owner,
                    message_id: message.id,
                });
            }
            let content = serde_json::to_string(&message.content)
                .map_err(|err| StoreError::Corrupt(err.to_string()))?;
            tx.execute(
                "INSERT INTO messages (id, thread_id, type, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id,
                    thread_id,
                    message.role.as_str(),
                    content,
                    format_ts(message.created_at)
                ],
            )?;
            tx.execute(
                "UPDATE threads SET updated_at = ?1 WHERE thread_id = ?2",
                params![format_ts(updated_at), thread_id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn message_thread(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        let message_id = message_id.to_string();
        self.run_db("find message", move |conn| owning_thread(conn, &message_id))
            .await
    }

    async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        self.run_db("list threads", |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.thread_id, t.created_at, t.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.thread_id = t.thread_id),
                    (SELECT content FROM messages m WHERE m.thread_id = t.thread_id
                        ORDER BY m.created_at DESC, m.rowid DESC LIMIT 1)
                 FROM threads t
                 ORDER BY t.updated_at DESC, t.rowid DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (thread_id, created_at, updated_at, count, last_content) = row?;
                summaries.push(ThreadSummary {
                    thread_id,
                    created_at: parse_ts(&created_at)?,
                    updated_at: parse_ts(&updated_at)?,
                    message_count: usize::try_from(count).unwrap_or_default(),
                    preview: last_content.map(|raw| preview_text(&decode_content(raw))),
                });
            }
            Ok(summaries)
        })
        .await
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
        let thread_id = thread_id.to_string();
        self.run_db("delete thread", move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM messages WHERE thread_id = ?1",
                params![thread_id],
            )?;
            let removed = tx.execute("DELETE FROM threads WHERE thread_id = ?1", params![thread_id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }
}

fn owning_thread(conn: &Connection, message_id: &str) -> Result<Option<String>, StoreError> {
    let owner = conn
        .query_row(
            "SELECT thread_id FROM messages WHERE id = ?1",
            params![message_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(owner)
}

fn read_thread(conn: &Connection, thread_id: &str) -> Result<Option<Thread>, StoreError> {
    let header = conn
        .query_row(
            "SELECT created_at, updated_at FROM threads WHERE thread_id = ?1",
            params![thread_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((created_at, updated_at)) = header else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT id, type, content, created_at FROM messages
         WHERE thread_id = ?1
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt.query_map(params![thread_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut messages = Vec::new();
    for row in rows {
        let (id, role, content, created_at) = row?;
        let role = Role::parse(&role)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown message type '{role}'")))?;
        messages.push(Message {
            id,
            role,
            content: decode_content(content),
            created_at: parse_ts(&created_at)?,
        });
    }

    Ok(Some(Thread {
        thread_id: thread_id.to_string(),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        messages,
    }))
}

// Rows written by older builds hold bare text rather than JSON.
fn decode_content(raw: String) -> Content {
    serde_json::from_str(&raw).unwrap_or(Content::PlainText(raw))
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Corrupt(format!("bad timestamp '{raw}': {err}")))
}

// === Write-through store ===

struct CachedThread {
    thread: Thread,
    last_used: AtomicU64,
}

/// Thread store combining a durable backend with a bounded in-memory cache.
pub struct ThreadStore {
    backend: Arc<dyn ThreadBackend>,
    cache: RwLock<HashMap<String, CachedThread>>,
    cache_capacity: usize,
    clock: AtomicU64,
    write_lock: Mutex<()>,
}

impl ThreadStore {
    pub fn new(backend: Arc<dyn ThreadBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            clock: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        }
    }

    pub fn open_sqlite(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteBackend::open(path)?)))
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(SqliteBackend::open_in_memory()?)))
    }

    /// Cap the number of cached threads. A capacity of zero is treated as one.
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity.max(1);
        self
    }

    /// Create the thread if it does not exist. Idempotent.
    pub async fn create(&self, thread_id: &str) -> Result<Thread, StoreError> {
        let _write = self.write_lock.lock().await;
        if let Some(thread) = self.current(thread_id).await? {
            return Ok(thread);
        }
        let thread = self.backend.insert_thread(thread_id, now_micros()).await?;
        self.remember(thread.clone()).await;
        tracing::debug!(thread_id, "thread created");
        Ok(thread)
    }

    /// Append a message, returning it as stored.
    ///
    /// `created_at` is clamped so it never precedes the thread's last message.
    pub async fn append(&self, thread_id: &str, message: Message) -> Result<Message, StoreError> {
        let _write = self.write_lock.lock().await;
        let mut staged = self
            .current(thread_id)
            .await?
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.to_string()))?;

        if staged.messages.iter().any(|existing| existing.id == message.id) {
            return Err(StoreError::DuplicateMessage {
                thread_id: thread_id.to_string(),
                message_id: message.id,
            });
        }

        let mut message = message;
        if let Some(last) = staged.last_message_at()
            && message.created_at < last
        {
            message.created_at = last;
        }
        let updated_at = now_micros().max(staged.updated_at).max(message.created_at);

        if let Err(err) = self
            .backend
            .append_message(thread_id, &message, updated_at)
            .await
        {
            tracing::warn!(thread_id, message_id = %message.id, error = %err, "durable append failed");
            return Err(err);
        }

        staged.messages.push(message.clone());
        staged.updated_at = updated_at;
        self.remember(staged).await;
        Ok(message)
    }

    /// Current thread snapshot, reading through to the backend on a cache miss.
    pub async fn get(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        if let Some(thread) = self.cached(thread_id).await {
            return Ok(Some(thread));
        }
        let _write = self.write_lock.lock().await;
        self.current(thread_id).await
    }

    pub async fn exists(&self, thread_id: &str) -> Result<bool, StoreError> {
        Ok(self.get(thread_id).await?.is_some())
    }

    /// Thread that already holds `message_id`, searching every thread.
    pub async fn message_owner(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        self.backend.message_thread(message_id).await
    }

    pub async fn list(&self) -> Result<Vec<ThreadSummary>, StoreError> {
        self.backend.list_threads().await
    }

    /// Delete a thread and its messages. Returns `false` if it did not exist.
    pub async fn delete(&self, thread_id: &str) -> Result<bool, StoreError> {
        let _write = self.write_lock.lock().await;
        let removed = self.backend.delete_thread(thread_id).await?;
        self.cache.write().await.remove(thread_id);
        if removed {
            tracing::debug!(thread_id, "thread deleted");
        }
        Ok(removed)
    }

    // Caller must hold `write_lock`.
    async fn current(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
        if let Some(thread) = self.cached(thread_id).await {
            return Ok(Some(thread));
        }
        let loaded = self.backend.load_thread(thread_id).await?;
        if let Some(thread) = &loaded {
            self.remember(thread.clone()).await;
        }
        Ok(loaded)
    }

    async fn cached(&self, thread_id: &str) -> Option<Thread> {
        let cache = self.cache.read().await;
        let entry = cache.get(thread_id)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(entry.thread.clone())
    }

    // Caller must hold `write_lock`.
    async fn remember(&self, thread: Thread) {
        let mut cache = self.cache.write().await;
        cache.insert(
            thread.thread_id.clone(),
            CachedThread {
                thread,
                last_used: AtomicU64::new(self.tick()),
            },
        );
        while cache.len() > self.cache_capacity {
            let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_used.load(Ordering::Relaxed))
                .map(|(thread_id, _)| thread_id.clone())
            else {
                break;
            };
            cache.remove(&oldest);
            tracing::trace!(thread_id = %oldest, "evicted thread from cache");
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentPart;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicBool;

    /// Backend wrapper whose appends can be switched to fail.
    struct FlakyBackend {
        inner: SqliteBackend,
        fail_appends: AtomicBool,
    }

    #[async_trait]
    impl ThreadBackend for FlakyBackend {
        async fn insert_thread(
            &self,
            thread_id: &str,
            now: DateTime<Utc>,
        ) -> Result<Thread, StoreError> {
            self.inner.insert_thread(thread_id, now).await
        }

        async fn load_thread(&self, thread_id: &str) -> Result<Option<Thread>, StoreError> {
            self.inner.load_thread(thread_id).await
        }

        async fn append_message(
            &self,
            thread_id: &str,
            message: &Message,
            updated_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            if self.fail_appends.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
            }
            self.inner.append_message(thread_id, message, updated_at).await
        }

        async fn message_thread(&self, message_id: &str) -> Result<Option<String>, StoreError> {
            self.inner.message_thread(message_id).await
        }

        async fn list_threads(&self) -> Result<Vec<ThreadSummary>, StoreError> {
            self.inner.list_threads().await
        }

        async fn delete_thread(&self, thread_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_thread(thread_id).await
        }
    }

    fn texts(thread: &Thread) -> Vec<String> {
        thread.messages.iter().map(|m| m.content.to_text()).collect()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let store = ThreadStore::in_memory().unwrap();
        let first = store.create("t1").await.unwrap();
        store.append("t1", Message::human("hi")).await.unwrap();
        let second = store.create("t1").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.messages.len(), 1);
    }

    #[tokio::test]
    async fn append_to_unknown_thread_fails() {
        let store = ThreadStore::in_memory().unwrap();
        let err = store.append("nope", Message::human("hi")).await.unwrap_err();
        assert!(matches!(err, StoreError::ThreadNotFound(id) if id == "nope"));
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_message_ids_are_rejected() {
        let store = ThreadStore::in_memory().unwrap();
        store.create("t1").await.unwrap();
        let message = Message::human("hi");
        store.append("t1", message.clone()).await.unwrap();
        let err = store.append("t1", message).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateMessage { .. }));
    }

    #[tokio::test]
    async fn message_ids_are_unique_across_threads() {
        let store = ThreadStore::in_memory().unwrap();
        store.create("t1").await.unwrap();
        store.create("t2").await.unwrap();
        store
            .append("t1", Message::with_id("m1", Role::Human, "first"))
            .await
            .unwrap();

        assert_eq!(store.message_owner("m1").await.unwrap().as_deref(), Some("t1"));
        assert_eq!(store.message_owner("m2").await.unwrap(), None);

        let err = store
            .append("t2", Message::with_id("m1", Role::Human, "second"))
            .await
            .unwrap_err();
        assert!(matches!(
            &err,
            StoreError::DuplicateMessage { thread_id, message_id }
                if thread_id == "t1" && message_id == "m1"
        ));
        assert!(store.get("t2").await.unwrap().unwrap().messages.is_empty());
        assert_eq!(texts(&store.get("t1").await.unwrap().unwrap()), vec!["first"]);
    }

    #[tokio::test]
    async fn append_clamps_created_at_to_be_monotonic() {
        let store = ThreadStore::in_memory().unwrap();
        store.create("t1").await.unwrap();
        let late = store.append("t1", Message::human("first")).await.unwrap();
        let mut early = Message::ai("second");
        early.created_at = late.created_at - chrono::Duration::seconds(30);
        let stored = store.append("t1", early).await.unwrap();
        assert_eq!(stored.created_at, late.created_at);

        let thread = store.get("t1").await.unwrap().unwrap();
        assert_eq!(texts(&thread), vec!["first", "second"]);
        assert!(thread.updated_at >= stored.created_at);
    }

    #[tokio::test]
    async fn cache_and_durable_copy_agree_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("threads.sqlite");
        {
            let store = ThreadStore::open_sqlite(&path).unwrap();
            store.create("t1").await.unwrap();
            store.append("t1", Message::human("Hello")).await.unwrap();
            store
                .append(
                    "t1",
                    Message::ai(Content::Parts(vec![ContentPart::Text {
                        text: "Hi there".to_string(),
                    }])),
                )
                .await
                .unwrap();
        }

        let reopened = ThreadStore::open_sqlite(&path).unwrap();
        let thread = reopened.get("t1").await.unwrap().unwrap();
        assert_eq!(texts(&thread), vec!["Hello", "Hi there"]);
        assert_eq!(thread.messages[0].role, Role::Human);
        assert_eq!(thread.messages[1].role, Role::Ai);
        assert!(matches!(thread.messages[1].content, Content::Parts(_)));
    }

    #[tokio::test]
    async fn failed_durable_write_leaves_cache_untouched() {
        let backend = Arc::new(FlakyBackend {
            inner: SqliteBackend::open_in_memory().unwrap(),
            fail_appends: AtomicBool::new(false),
        });
        let store = ThreadStore::new(backend.clone());
        store.create("t1").await.unwrap();
        store.append("t1", Message::human("kept")).await.unwrap();

        backend.fail_appends.store(true, Ordering::SeqCst);
        let err = store.append("t1", Message::human("lost")).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let cached = store.get("t1").await.unwrap().unwrap();
        let durable = backend.inner.load_thread("t1").await.unwrap().unwrap();
        assert_eq!(texts(&cached), vec!["kept"]);
        assert_eq!(texts(&durable), vec!["kept"]);
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used_thread() {
        let backend = Arc::new(SqliteBackend::open_in_memory().unwrap());
        let store = ThreadStore::new(backend.clone()).with_cache_capacity(2);
        store.create("a").await.unwrap();
        store.append("a", Message::human("from a")).await.unwrap();
        store.create("b").await.unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        store.get("a").await.unwrap();
        store.create("c").await.unwrap();

        {
            let cache = store.cache.read().await;
            assert_eq!(cache.len(), 2);
            assert!(cache.contains_key("a"));
            assert!(!cache.contains_key("b"));
        }

        // Evicted threads read back from the backend and can still be written.
        let reloaded = store.get("b").await.unwrap().unwrap();
        assert!(reloaded.messages.is_empty());
        store.append("b", Message::human("from b")).await.unwrap();
        let durable = backend.load_thread("b").await.unwrap().unwrap();
        assert_eq!(texts(&durable), vec!["from b"]);
        assert!(store.cache.read().await.len() <= 2);
        assert_eq!(texts(&store.get("a").await.unwrap().unwrap()), vec!["from a"]);
    }

    #[tokio::test]
    async fn delete_cascades_and_reports_missing() {
        let store = ThreadStore::in_memory().unwrap();
        store.create("t1").await.unwrap();
        store.append("t1", Message::human("hi")).await.unwrap();

        assert!(store.delete("t1").await.unwrap());
        assert!(store.get("t1").await.unwrap().is_none());
        assert!(!store.delete("t1").await.unwrap());

        // Recreating the id starts from an empty history.
        let fresh = store.create("t1").await.unwrap();
        assert!(fresh.messages.is_empty());
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_activity() {
        let store = ThreadStore::in_memory().unwrap();
        store.create("a").await.unwrap();
        store.create("b").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.append("a", Message::human("latest words")).await.unwrap();

        let listed = store.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|s| s.thread_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(listed[0].message_count, 1);
        assert_eq!(listed[0].preview.as_deref(), Some("latest words"));
        assert_eq!(listed[1].preview, None);
    }

    #[tokio::test]
    async fn plain_text_rows_load_as_plain_content() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend.insert_thread("t1", now_micros()).await.unwrap();
        backend
            .run_db("seed", |conn| {
                conn.execute(
                    "INSERT INTO messages (id, thread_id, type, content, created_at)
                     VALUES ('m1', 't1', 'human', 'raw text', '2024-01-01T00:00:00.000000Z')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let thread = backend.load_thread("t1").await.unwrap().unwrap();
        assert_eq!(
            thread.messages[0].content,
            Content::PlainText("raw text".to_string())
        );
    }

    #[tokio::test]
    async fn concurrent_appends_keep_every_message() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        store.create("t1").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.append("t1", Message::human(format!("m{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let thread = store.get("t1").await.unwrap().unwrap();
        assert_eq!(thread.messages.len(), 16);
        assert!(
            thread
                .messages
                .windows(2)
                .all(|pair| pair[0].created_at <= pair[1].created_at)
        );
    }
}
