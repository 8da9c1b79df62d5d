//! Event repository: lifecycle storage and queue selection
//!
//! The repository owns every query that decides publication order. Callers
//! never cache `status` or `post_time`; each decision re-reads the store.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        Ingestor / PublicationCoordinator / Scheduler        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   EventRepository trait                     │
//! │   insert_new, next_due_event, mark_posted (CAS), ...        │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                         │
//!                    ▼                         ▼
//!          ┌─────────────────┐       ┌─────────────────┐
//!          │     SQLite      │       │     Memory      │
//!          │  inbox + queue  │       │  (tests, dry)   │
//!          └─────────────────┘       └─────────────────┘
//! ```
//!
//! Two tables back the two identity spaces: `inbox_events` holds `Scraped`
//! and `PendingApproval` rows, `queue_events` holds `ReadyToPost` and
//! `Posted` rows. `queue_rank` comes from the persisted `queue_sequence` row
//! so it survives restarts and is never reused.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use super::error::{StoreError, StoreResult};
use crate::models::{Event, EventStatus, Partition, PublishedRef, StatusCounts};

// ============================================================================
// Core Types
// ============================================================================

/// Result of a batch insert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Ids written, in input order
    pub inserted: Vec<String>,

    /// Ids rejected because they already exist in the target partition
    pub conflicts: Vec<String>,
}

impl InsertOutcome {
    pub fn inserted_count(&self) -> usize {
        self.inserted.len()
    }
}

/// Earliest upcoming publication time plus the data-quality signal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EarliestPostTime {
    /// Smallest `post_time >= now` among `ReadyToPost` events
    pub at: Option<DateTime<Utc>>,

    /// `ReadyToPost` events excluded because their `post_time` is null
    pub unscheduled: usize,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Persistence boundary for the event lifecycle
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert events that are not yet known to the target partition
    ///
    /// `status` selects the partition. `ReadyToPost` inserts allocate a fresh
    /// `queue_rank` per event. Duplicates are reported per event in
    /// [`InsertOutcome::conflicts`] and never abort the batch.
    async fn insert_new(
        &self,
        events: &[Event],
        explored_at: DateTime<Utc>,
        status: EventStatus,
    ) -> StoreResult<InsertOutcome>;

    /// Every known event id, across all partitions
    async fn existing_ids(&self) -> StoreResult<HashSet<String>>;

    /// Fetch an event by id; the queue copy wins if both partitions have it
    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>>;

    /// The `ReadyToPost` event due within `now + window`
    ///
    /// Smallest `post_time` first, ties broken by `queue_rank` ascending.
    /// Events without a `post_time` are never returned.
    async fn next_due_event(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<Option<Event>>;

    /// Compare-and-set `ReadyToPost -> Posted`
    ///
    /// Returns false when the event is already posted or no longer exists.
    async fn mark_posted(&self, event_id: &str, receipt: &PublishedRef) -> StoreResult<bool>;

    /// Smallest `post_time >= now` among `ReadyToPost` events
    async fn earliest_ready_post_time(&self, now: DateTime<Utc>) -> StoreResult<EarliestPostTime>;

    /// `Scraped -> PendingApproval`
    async fn mark_pending(&self, event_id: &str) -> StoreResult<bool>;

    /// Move an inbox event into the queue as `ReadyToPost`, returning its rank
    async fn approve(
        &self,
        event_id: &str,
        post_time: Option<DateTime<Utc>>,
    ) -> StoreResult<i64>;

    /// Set `post_time` on a queued event that has none yet
    async fn assign_post_time(&self, event_id: &str, at: DateTime<Utc>) -> StoreResult<bool>;

    /// Operator skip: advance the `post_time` of a `ReadyToPost` event
    ///
    /// Returns false if the event is not `ReadyToPost` or `new_post_time`
    /// does not move it forward.
    async fn skip(&self, event_id: &str, new_post_time: DateTime<Utc>) -> StoreResult<bool>;

    /// `ReadyToPost` events with a null `post_time`, by `queue_rank`
    async fn unscheduled_ready(&self) -> StoreResult<Vec<Event>>;

    /// Greatest assigned `post_time` among `ReadyToPost` events
    async fn latest_post_time(&self) -> StoreResult<Option<DateTime<Utc>>>;

    async fn count_by_status(&self) -> StoreResult<StatusCounts>;

    /// Delete events whose `to_time` is before `before`, in every partition
    async fn sweep_expired(&self, before: DateTime<Utc>) -> StoreResult<usize>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

const BASE_COLUMNS: &str = "event_id, source, title, body, address, price, image_ref, url, \
                            from_time, to_time, explored_at, status";

const QUEUE_EXTRA_COLUMNS: &str = "queue_rank, post_time, posted_at, channel_message_id";

const INBOX_EXTRA_COLUMNS: &str = "NULL, NULL, NULL, NULL";

/// SQLite implementation of [`EventRepository`]
///
/// Uses `Mutex` to ensure thread-safety for the SQLite connection. Times are
/// stored as epoch milliseconds so ordering happens on integers.
pub struct SqliteEventRepository {
    conn: Mutex<Connection>,
}

impl SqliteEventRepository {
    /// Open (or create) the database at `path`
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite event repository initialized");
        Ok(repo)
    }

    /// Create in-memory repository (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.create_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn create_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
                CREATE TABLE IF NOT EXISTS inbox_events (
                    event_id TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    address TEXT,
                    price TEXT,
                    image_ref TEXT,
                    url TEXT NOT NULL,
                    from_time INTEGER NOT NULL,
                    to_time INTEGER NOT NULL,
                    explored_at INTEGER NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('scraped', 'pending_approval'))
                );

                CREATE TABLE IF NOT EXISTS queue_events (
                    event_id TEXT PRIMARY KEY,
                    source TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    address TEXT,
                    price TEXT,
                    image_ref TEXT,
                    url TEXT NOT NULL,
                    from_time INTEGER NOT NULL,
                    to_time INTEGER NOT NULL,
                    explored_at INTEGER NOT NULL,
                    status TEXT NOT NULL
                        CHECK (status IN ('ready_to_post', 'posted')),
                    queue_rank INTEGER NOT NULL UNIQUE,
                    post_time INTEGER,
                    posted_at INTEGER,
                    channel_message_id TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_queue_events_due
                    ON queue_events(status, post_time, queue_rank);

                CREATE INDEX IF NOT EXISTS idx_inbox_events_to_time
                    ON inbox_events(to_time);

                CREATE INDEX IF NOT EXISTS idx_queue_events_to_time
                    ON queue_events(to_time);

                CREATE TABLE IF NOT EXISTS queue_sequence (
                    name TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );

                INSERT OR IGNORE INTO queue_sequence (name, value) VALUES ('queue_rank', 0);
                "#,
        )?;

        Ok(())
    }

    fn next_queue_rank(tx: &Transaction<'_>) -> StoreResult<i64> {
        let rank = tx.query_row(
            "UPDATE queue_sequence SET value = value + 1 WHERE name = 'queue_rank' RETURNING value",
            [],
            |row| row.get(0),
        )?;
        Ok(rank)
    }

    fn exists_in(conn: &Connection, partition: Partition, event_id: &str) -> StoreResult<bool> {
        let sql = match partition {
            Partition::Inbox => "SELECT EXISTS(SELECT 1 FROM inbox_events WHERE event_id = ?1)",
            Partition::Queue => "SELECT EXISTS(SELECT 1 FROM queue_events WHERE event_id = ?1)",
        };
        Ok(conn.query_row(sql, params![event_id], |row| row.get(0))?)
    }

    fn insert_inbox_row(conn: &Connection, event: &Event, status: EventStatus) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO inbox_events ({BASE_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                event.event_id,
                event.source,
                event.title,
                event.body,
                event.address,
                event.price,
                event.image_ref,
                event.url,
                event.from_time.timestamp_millis(),
                event.to_time.timestamp_millis(),
                event.explored_at.timestamp_millis(),
                status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn insert_queue_row(
        conn: &Connection,
        event: &Event,
        rank: i64,
        post_time: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        conn.execute(
            &format!(
                "INSERT INTO queue_events ({BASE_COLUMNS}, {QUEUE_EXTRA_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL, NULL)"
            ),
            params![
                event.event_id,
                event.source,
                event.title,
                event.body,
                event.address,
                event.price,
                event.image_ref,
                event.url,
                event.from_time.timestamp_millis(),
                event.to_time.timestamp_millis(),
                event.explored_at.timestamp_millis(),
                EventStatus::ReadyToPost.as_str(),
                rank,
                post_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(())
    }

    fn query_events(
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Vec<Event>> {
        let mut stmt = conn.prepare(sql)?;
        let events = stmt
            .query_map(args, row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn count_into(conn: &Connection, sql: &str, counts: &mut StatusCounts) -> StoreResult<()> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            let status: EventStatus = status.parse().map_err(|reason| StoreError::Corrupt {
                event_id: "*".to_string(),
                reason,
            })?;
            counts.add_many(status, count as usize);
        }
        Ok(())
    }
}

fn millis_to_time(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {ms}").into(),
        )
    })
}

fn optional_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|ms| millis_to_time(idx, ms))
        .transpose()
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let status: String = row.get(11)?;
    let status = status
        .parse::<EventStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(11, Type::Text, e.into()))?;

    Ok(Event {
        event_id: row.get(0)?,
        source: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        address: row.get(4)?,
        price: row.get(5)?,
        image_ref: row.get(6)?,
        url: row.get(7)?,
        from_time: millis_to_time(8, row.get(8)?)?,
        to_time: millis_to_time(9, row.get(9)?)?,
        explored_at: millis_to_time(10, row.get(10)?)?,
        status,
        queue_rank: row.get(12)?,
        post_time: optional_time(row, 13)?,
        posted_at: optional_time(row, 14)?,
        channel_message_id: row.get(15)?,
    })
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn insert_new(
        &self,
        events: &[Event],
        explored_at: DateTime<Utc>,
        status: EventStatus,
    ) -> StoreResult<InsertOutcome> {
        if status == EventStatus::Posted {
            return Err(StoreError::InvalidTransition {
                event_id: "*".to_string(),
                from: EventStatus::Scraped,
                to: EventStatus::Posted,
            });
        }

        let partition = status.partition();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut outcome = InsertOutcome::default();

        for event in events {
            if Self::exists_in(&tx, partition, &event.event_id)? {
                tracing::debug!(
                    event_id = %event.event_id,
                    partition = partition.as_str(),
                    "Insert conflict"
                );
                outcome.conflicts.push(event.event_id.clone());
                continue;
            }

            let mut row = event.clone();
            row.explored_at = explored_at;

            match partition {
                Partition::Inbox => Self::insert_inbox_row(&tx, &row, status)?,
                Partition::Queue => {
                    let rank = Self::next_queue_rank(&tx)?;
                    Self::insert_queue_row(&tx, &row, rank, row.post_time)?;
                }
            }
            outcome.inserted.push(event.event_id.clone());
        }

        tx.commit()?;
        Ok(outcome)
    }

    async fn existing_ids(&self) -> StoreResult<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT event_id FROM inbox_events UNION SELECT event_id FROM queue_events",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>> {
        let conn = self.conn()?;
        let queued = conn
            .query_row(
                &format!(
                    "SELECT {BASE_COLUMNS}, {QUEUE_EXTRA_COLUMNS} FROM queue_events WHERE event_id = ?1"
                ),
                params![event_id],
                row_to_event,
            )
            .optional()?;

        if queued.is_some() {
            return Ok(queued);
        }

        Ok(conn
            .query_row(
                &format!(
                    "SELECT {BASE_COLUMNS}, {INBOX_EXTRA_COLUMNS} FROM inbox_events WHERE event_id = ?1"
                ),
                params![event_id],
                row_to_event,
            )
            .optional()?)
    }

    async fn next_due_event(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<Option<Event>> {
        let horizon = (now + window).timestamp_millis();
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {BASE_COLUMNS}, {QUEUE_EXTRA_COLUMNS} FROM queue_events \
                     WHERE status = 'ready_to_post' AND post_time IS NOT NULL AND post_time <= ?1 \
                     ORDER BY post_time ASC, queue_rank ASC LIMIT 1"
                ),
                params![horizon],
                row_to_event,
            )
            .optional()?)
    }

    async fn mark_posted(&self, event_id: &str, receipt: &PublishedRef) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE queue_events SET status = 'posted', posted_at = ?2, channel_message_id = ?3 \
             WHERE event_id = ?1 AND status = 'ready_to_post'",
            params![
                event_id,
                receipt.published_at.timestamp_millis(),
                receipt.channel_message_id,
            ],
        )?;
        Ok(changed == 1)
    }

    async fn earliest_ready_post_time(&self, now: DateTime<Utc>) -> StoreResult<EarliestPostTime> {
        let conn = self.conn()?;
        let earliest: Option<i64> = conn.query_row(
            "SELECT MIN(post_time) FROM queue_events \
             WHERE status = 'ready_to_post' AND post_time >= ?1",
            params![now.timestamp_millis()],
            |row| row.get(0),
        )?;
        let unscheduled: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_events WHERE status = 'ready_to_post' AND post_time IS NULL",
            [],
            |row| row.get(0),
        )?;

        Ok(EarliestPostTime {
            at: earliest.map(|ms| millis_to_time(0, ms)).transpose()?,
            unscheduled: unscheduled as usize,
        })
    }

    async fn mark_pending(&self, event_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE inbox_events SET status = 'pending_approval' \
             WHERE event_id = ?1 AND status = 'scraped'",
            params![event_id],
        )?;
        Ok(changed == 1)
    }

    async fn approve(
        &self,
        event_id: &str,
        post_time: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let event = tx
            .query_row(
                &format!(
                    "SELECT {BASE_COLUMNS}, {INBOX_EXTRA_COLUMNS} FROM inbox_events WHERE event_id = ?1"
                ),
                params![event_id],
                row_to_event,
            )
            .optional()?;

        let Some(event) = event else {
            return Err(match Self::exists_in(&tx, Partition::Queue, event_id)? {
                true => StoreError::conflict(event_id, Partition::Queue),
                false => StoreError::NotFound(event_id.to_string()),
            });
        };

        if Self::exists_in(&tx, Partition::Queue, event_id)? {
            return Err(StoreError::conflict(event_id, Partition::Queue));
        }

        let rank = Self::next_queue_rank(&tx)?;
        Self::insert_queue_row(&tx, &event, rank, post_time)?;
        tx.execute(
            "DELETE FROM inbox_events WHERE event_id = ?1",
            params![event_id],
        )?;
        tx.commit()?;

        tracing::info!(event_id, queue_rank = rank, "Event approved");
        Ok(rank)
    }

    async fn assign_post_time(&self, event_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE queue_events SET post_time = ?2 \
             WHERE event_id = ?1 AND status = 'ready_to_post' AND post_time IS NULL",
            params![event_id, at.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    async fn skip(&self, event_id: &str, new_post_time: DateTime<Utc>) -> StoreResult<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE queue_events SET post_time = ?2 \
             WHERE event_id = ?1 AND status = 'ready_to_post' \
               AND (post_time IS NULL OR post_time < ?2)",
            params![event_id, new_post_time.timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    async fn unscheduled_ready(&self) -> StoreResult<Vec<Event>> {
        let conn = self.conn()?;
        Self::query_events(
            &conn,
            &format!(
                "SELECT {BASE_COLUMNS}, {QUEUE_EXTRA_COLUMNS} FROM queue_events \
                 WHERE status = 'ready_to_post' AND post_time IS NULL ORDER BY queue_rank ASC"
            ),
            [],
        )
    }

    async fn latest_post_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(post_time) FROM queue_events WHERE status = 'ready_to_post'",
            [],
            |row| row.get(0),
        )?;
        Ok(latest.map(|ms| millis_to_time(0, ms)).transpose()?)
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        let conn = self.conn()?;
        let mut counts = StatusCounts::default();
        Self::count_into(
            &conn,
            "SELECT status, COUNT(*) FROM inbox_events GROUP BY status",
            &mut counts,
        )?;
        Self::count_into(
            &conn,
            "SELECT status, COUNT(*) FROM queue_events GROUP BY status",
            &mut counts,
        )?;
        Ok(counts)
    }

    async fn sweep_expired(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let cutoff = before.timestamp_millis();
        let inbox = tx.execute(
            "DELETE FROM inbox_events WHERE to_time < ?1",
            params![cutoff],
        )?;
        let queue = tx.execute(
            "DELETE FROM queue_events WHERE to_time < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(inbox + queue)
    }
}

// ============================================================================
// Shared Repository Types
// ============================================================================

/// Thread-safe shared repository handle
pub type SharedEventRepository = Arc<dyn EventRepository>;

/// Create a shared SQLite repository
pub fn create_sqlite_repository(path: impl AsRef<Path>) -> StoreResult<SharedEventRepository> {
    Ok(Arc::new(SqliteEventRepository::new(path)?))
}

/// Create a shared in-memory repository
pub fn create_memory_repository() -> SharedEventRepository {
    Arc::new(super::memory::MemoryEventRepository::new())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryEventRepository;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, 0).unwrap()
    }

    fn event(id: &str) -> Event {
        Event::new(
            id,
            "test",
            format!("Event {id}"),
            format!("https://example.com/{id}"),
            at(18, 0),
            at(21, 0),
        )
    }

    fn queued(id: &str, post_time: DateTime<Utc>) -> Event {
        event(id).with_post_time(post_time)
    }

    fn create_test_repos() -> Vec<Box<dyn EventRepository>> {
        vec![
            Box::new(SqliteEventRepository::in_memory().unwrap()),
            Box::new(MemoryEventRepository::new()),
        ]
    }

    #[tokio::test]
    async fn test_insert_new_reports_conflicts_per_event() {
        for repo in create_test_repos() {
            let first = repo
                .insert_new(&[event("a"), event("b")], at(9, 0), EventStatus::Scraped)
                .await
                .unwrap();
            assert_eq!(first.inserted, vec!["a", "b"]);

            let second = repo
                .insert_new(&[event("b"), event("c")], at(9, 5), EventStatus::PendingApproval)
                .await
                .unwrap();
            assert_eq!(second.inserted, vec!["c"]);
            assert_eq!(second.conflicts, vec!["b"]);

            let c = repo.get("c").await.unwrap().unwrap();
            assert_eq!(c.status, EventStatus::PendingApproval);
            assert_eq!(c.explored_at, at(9, 5));
        }
    }

    #[tokio::test]
    async fn test_partitions_have_separate_identity_spaces() {
        for repo in create_test_repos() {
            repo.insert_new(&[event("x")], at(9, 0), EventStatus::Scraped)
                .await
                .unwrap();
            let outcome = repo
                .insert_new(&[event("x")], at(9, 0), EventStatus::ReadyToPost)
                .await
                .unwrap();
            assert_eq!(outcome.inserted, vec!["x"]);

            let ids = repo.existing_ids().await.unwrap();
            assert_eq!(ids.len(), 1);
            assert_eq!(
                repo.get("x").await.unwrap().unwrap().status,
                EventStatus::ReadyToPost
            );
        }
    }

    #[tokio::test]
    async fn test_insert_posted_is_rejected() {
        for repo in create_test_repos() {
            let result = repo
                .insert_new(&[event("p")], at(9, 0), EventStatus::Posted)
                .await;
            assert!(matches!(result, Err(StoreError::InvalidTransition { .. })));
        }
    }

    #[tokio::test]
    async fn test_existing_ids_spans_all_partitions() {
        for repo in create_test_repos() {
            repo.insert_new(&[event("s")], at(9, 0), EventStatus::Scraped)
                .await
                .unwrap();
            repo.insert_new(&[event("p")], at(9, 0), EventStatus::PendingApproval)
                .await
                .unwrap();
            repo.insert_new(&[queued("r", at(10, 0))], at(9, 0), EventStatus::ReadyToPost)
                .await
                .unwrap();

            let ids = repo.existing_ids().await.unwrap();
            assert_eq!(ids, HashSet::from(["s".into(), "p".into(), "r".into()]));
        }
    }

    #[tokio::test]
    async fn test_next_due_event_orders_by_post_time_then_rank() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[
                    queued("late", at(11, 0)),
                    queued("a", at(10, 0)),
                    queued("b", at(10, 0)),
                ],
                at(9, 0),
                EventStatus::ReadyToPost,
            )
            .await
            .unwrap();

            let window = Duration::minutes(5);
            let first = repo.next_due_event(at(10, 0), window).await.unwrap().unwrap();
            assert_eq!(first.event_id, "a");

            let receipt = PublishedRef::new("test", "1");
            assert!(repo.mark_posted("a", &receipt).await.unwrap());

            let second = repo.next_due_event(at(10, 0), window).await.unwrap().unwrap();
            assert_eq!(second.event_id, "b");
            assert!(second.queue_rank > first.queue_rank);
        }
    }

    #[tokio::test]
    async fn test_next_due_event_respects_window_and_null_post_time() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[event("unscheduled"), queued("later", at(10, 10))],
                at(9, 0),
                EventStatus::ReadyToPost,
            )
            .await
            .unwrap();

            let window = Duration::minutes(5);
            assert!(repo.next_due_event(at(10, 0), window).await.unwrap().is_none());

            let due = repo.next_due_event(at(10, 6), window).await.unwrap().unwrap();
            assert_eq!(due.event_id, "later");
        }
    }

    #[tokio::test]
    async fn test_mark_posted_is_compare_and_set() {
        for repo in create_test_repos() {
            repo.insert_new(&[queued("e", at(10, 0))], at(9, 0), EventStatus::ReadyToPost)
                .await
                .unwrap();

            let receipt = PublishedRef::new("telegram", "777");
            assert!(repo.mark_posted("e", &receipt).await.unwrap());
            assert!(!repo.mark_posted("e", &receipt).await.unwrap());
            assert!(!repo.mark_posted("missing", &receipt).await.unwrap());

            let posted = repo.get("e").await.unwrap().unwrap();
            assert_eq!(posted.status, EventStatus::Posted);
            assert_eq!(posted.channel_message_id.as_deref(), Some("777"));
            assert!(posted.posted_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_earliest_ready_post_time_reports_unscheduled() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[
                    queued("past", at(8, 0)),
                    queued("soon", at(10, 30)),
                    queued("later", at(12, 0)),
                    event("null"),
                ],
                at(7, 0),
                EventStatus::ReadyToPost,
            )
            .await
            .unwrap();

            let earliest = repo.earliest_ready_post_time(at(10, 0)).await.unwrap();
            assert_eq!(earliest.at, Some(at(10, 30)));
            assert_eq!(earliest.unscheduled, 1);

            let none = repo.earliest_ready_post_time(at(13, 0)).await.unwrap();
            assert!(none.at.is_none());
        }
    }

    #[tokio::test]
    async fn test_approve_allocates_increasing_ranks() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[event("a"), event("b"), event("c")],
                at(9, 0),
                EventStatus::PendingApproval,
            )
            .await
            .unwrap();

            let ra = repo.approve("a", Some(at(12, 0))).await.unwrap();
            let rb = repo.approve("b", None).await.unwrap();
            assert!(rb > ra);

            assert!(matches!(
                repo.approve("a", None).await,
                Err(StoreError::Conflict { .. })
            ));
            assert!(matches!(
                repo.approve("zzz", None).await,
                Err(StoreError::NotFound(_))
            ));

            let a = repo.get("a").await.unwrap().unwrap();
            assert_eq!(a.status, EventStatus::ReadyToPost);
            assert_eq!(a.queue_rank, Some(ra));
            assert_eq!(a.post_time, Some(at(12, 0)));

            let counts = repo.count_by_status().await.unwrap();
            assert_eq!(counts.pending_approval, 1);
            assert_eq!(counts.ready_to_post, 2);
        }
    }

    #[tokio::test]
    async fn test_mark_pending_only_from_scraped() {
        for repo in create_test_repos() {
            repo.insert_new(&[event("s")], at(9, 0), EventStatus::Scraped)
                .await
                .unwrap();
            assert!(repo.mark_pending("s").await.unwrap());
            assert!(!repo.mark_pending("s").await.unwrap());
            assert_eq!(
                repo.get("s").await.unwrap().unwrap().status,
                EventStatus::PendingApproval
            );
        }
    }

    #[tokio::test]
    async fn test_skip_and_assign_never_touch_posted() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[queued("q", at(10, 0)), event("n")],
                at(9, 0),
                EventStatus::ReadyToPost,
            )
            .await
            .unwrap();

            assert!(!repo.skip("q", at(9, 0)).await.unwrap());
            assert!(repo.skip("q", at(12, 0)).await.unwrap());
            assert!(repo.assign_post_time("n", at(14, 0)).await.unwrap());
            assert!(!repo.assign_post_time("n", at(15, 0)).await.unwrap());

            repo.mark_posted("q", &PublishedRef::new("t", "1"))
                .await
                .unwrap();
            assert!(!repo.skip("q", at(16, 0)).await.unwrap());

            let q = repo.get("q").await.unwrap().unwrap();
            assert_eq!(q.post_time, Some(at(12, 0)));
            assert_eq!(repo.latest_post_time().await.unwrap(), Some(at(14, 0)));
        }
    }

    #[tokio::test]
    async fn test_unscheduled_ready_in_rank_order() {
        for repo in create_test_repos() {
            repo.insert_new(
                &[event("first"), queued("timed", at(10, 0)), event("second")],
                at(9, 0),
                EventStatus::ReadyToPost,
            )
            .await
            .unwrap();

            let ids: Vec<_> = repo
                .unscheduled_ready()
                .await
                .unwrap()
                .into_iter()
                .map(|e| e.event_id)
                .collect();
            assert_eq!(ids, vec!["first", "second"]);
        }
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        for repo in create_test_repos() {
            let mut old = event("old");
            old.to_time = at(8, 0);
            repo.insert_new(&[old.clone()], at(7, 0), EventStatus::Scraped)
                .await
                .unwrap();
            repo.insert_new(&[old, event("fresh")], at(7, 0), EventStatus::ReadyToPost)
                .await
                .unwrap();

            let removed = repo.sweep_expired(at(9, 0)).await.unwrap();
            assert_eq!(removed, 2);
            assert_eq!(repo.existing_ids().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_queue_rank_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        let first_rank = {
            let repo = SqliteEventRepository::new(&path).unwrap();
            repo.insert_new(&[event("a")], at(9, 0), EventStatus::PendingApproval)
                .await
                .unwrap();
            repo.approve("a", None).await.unwrap()
        };

        let repo = SqliteEventRepository::new(&path).unwrap();
        repo.sweep_expired(at(23, 0)).await.unwrap();
        repo.insert_new(&[event("b")], at(9, 0), EventStatus::PendingApproval)
            .await
            .unwrap();
        let second_rank = repo.approve("b", None).await.unwrap();

        assert!(second_rank > first_rank);
    }

    #[tokio::test]
    async fn test_shared_repository_creation() {
        let repo = create_memory_repository();
        repo.insert_new(&[event("a")], at(9, 0), EventStatus::Scraped)
            .await
            .unwrap();
        assert!(repo.existing_ids().await.unwrap().contains("a"));
    }
}
