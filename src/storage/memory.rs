//! In-process implementation of [`EventRepository`]
//!
//! Mirrors the SQLite semantics exactly (partitions, rank sequence, CAS) so
//! that the publication and scheduling logic can be exercised without a
//! database file.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::error::{StoreError, StoreResult};
use super::repository::{EarliestPostTime, EventRepository, InsertOutcome};
use crate::models::{Event, EventStatus, Partition, PublishedRef, StatusCounts};

#[derive(Default)]
struct MemoryState {
    inbox: HashMap<String, Event>,
    queue: HashMap<String, Event>,
    last_rank: i64,
}

impl MemoryState {
    fn next_rank(&mut self) -> i64 {
        self.last_rank += 1;
        self.last_rank
    }

    fn ready(&self) -> impl Iterator<Item = &Event> {
        self.queue
            .values()
            .filter(|e| e.status == EventStatus::ReadyToPost)
    }
}

/// Memory-backed event repository
pub struct MemoryEventRepository {
    state: RwLock<MemoryState>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, MemoryState>> {
        self.state.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state.write().map_err(|_| StoreError::Poisoned)
    }

    /// Number of stored events across both partitions
    pub fn len(&self) -> usize {
        self.read()
            .map(|s| s.inbox.len() + s.queue.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEventRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
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

        let mut state = self.write()?;
        let mut outcome = InsertOutcome::default();

        for event in events {
            let taken = match status.partition() {
                Partition::Inbox => state.inbox.contains_key(&event.event_id),
                Partition::Queue => state.queue.contains_key(&event.event_id),
            };
            if taken {
                outcome.conflicts.push(event.event_id.clone());
                continue;
            }

            let mut row = event.clone();
            row.explored_at = explored_at;
            row.status = status;
            row.posted_at = None;
            row.channel_message_id = None;

            match status.partition() {
                Partition::Inbox => {
                    row.queue_rank = None;
                    row.post_time = None;
                    state.inbox.insert(row.event_id.clone(), row);
                }
                Partition::Queue => {
                    row.queue_rank = Some(state.next_rank());
                    state.queue.insert(row.event_id.clone(), row);
                }
            }
            outcome.inserted.push(event.event_id.clone());
        }

        Ok(outcome)
    }

    async fn existing_ids(&self) -> StoreResult<HashSet<String>> {
        let state = self.read()?;
        Ok(state
            .inbox
            .keys()
            .chain(state.queue.keys())
            .cloned()
            .collect())
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>> {
        let state = self.read()?;
        Ok(state
            .queue
            .get(event_id)
            .or_else(|| state.inbox.get(event_id))
            .cloned())
    }

    async fn next_due_event(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> StoreResult<Option<Event>> {
        let horizon = now + window;
        let state = self.read()?;
        Ok(state
            .ready()
            .filter_map(|e| e.post_time.filter(|t| *t <= horizon).map(|t| (t, e)))
            .min_by_key(|(t, e)| (*t, e.queue_rank))
            .map(|(_, e)| e.clone()))
    }

    async fn mark_posted(&self, event_id: &str, receipt: &PublishedRef) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.queue.get_mut(event_id) {
            Some(event) if event.status == EventStatus::ReadyToPost => {
                event.status = EventStatus::Posted;
                event.posted_at = Some(receipt.published_at);
                event.channel_message_id = Some(receipt.channel_message_id.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn earliest_ready_post_time(&self, now: DateTime<Utc>) -> StoreResult<EarliestPostTime> {
        let state = self.read()?;
        let at = state
            .ready()
            .filter_map(|e| e.post_time)
            .filter(|t| *t >= now)
            .min();
        let unscheduled = state.ready().filter(|e| e.post_time.is_none()).count();
        Ok(EarliestPostTime { at, unscheduled })
    }

    async fn mark_pending(&self, event_id: &str) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.inbox.get_mut(event_id) {
            Some(event) if event.status == EventStatus::Scraped => {
                event.status = EventStatus::PendingApproval;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn approve(
        &self,
        event_id: &str,
        post_time: Option<DateTime<Utc>>,
    ) -> StoreResult<i64> {
        let mut state = self.write()?;

        if state.queue.contains_key(event_id) {
            return Err(StoreError::conflict(event_id, Partition::Queue));
        }
        let Some(mut event) = state.inbox.remove(event_id) else {
            return Err(StoreError::NotFound(event_id.to_string()));
        };

        let rank = state.next_rank();
        event.status = EventStatus::ReadyToPost;
        event.queue_rank = Some(rank);
        event.post_time = post_time;
        state.queue.insert(event.event_id.clone(), event);

        Ok(rank)
    }

    async fn assign_post_time(&self, event_id: &str, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.queue.get_mut(event_id) {
            Some(event) if event.status == EventStatus::ReadyToPost && event.post_time.is_none() => {
                event.post_time = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn skip(&self, event_id: &str, new_post_time: DateTime<Utc>) -> StoreResult<bool> {
        let mut state = self.write()?;
        match state.queue.get_mut(event_id) {
            Some(event)
                if event.status == EventStatus::ReadyToPost
                    && event.post_time.map_or(true, |t| t < new_post_time) =>
            {
                event.post_time = Some(new_post_time);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unscheduled_ready(&self) -> StoreResult<Vec<Event>> {
        let state = self.read()?;
        let mut events: Vec<Event> = state
            .ready()
            .filter(|e| e.post_time.is_none())
            .cloned()
            .collect();
        events.sort_by_key(|e| e.queue_rank);
        Ok(events)
    }

    async fn latest_post_time(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let state = self.read()?;
        Ok(state.ready().filter_map(|e| e.post_time).max())
    }

    async fn count_by_status(&self) -> StoreResult<StatusCounts> {
        let state = self.read()?;
        let mut counts = StatusCounts::default();
        for event in state.inbox.values().chain(state.queue.values()) {
            counts.add(event.status);
        }
        Ok(counts)
    }

    async fn sweep_expired(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let mut state = self.write()?;
        let initial = state.inbox.len() + state.queue.len();
        state.inbox.retain(|_, e| e.to_time >= before);
        state.queue.retain(|_, e| e.to_time >= before);
        Ok(initial - state.inbox.len() - state.queue.len())
    }
}
