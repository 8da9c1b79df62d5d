//! Posting time slots
//!
//! Events are published at fixed local times of day, with one set of times
//! for weekdays and another for weekends, plus times that apply every day.
//! All slot arithmetic happens at a fixed UTC offset and produces UTC
//! instants.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{EventRepository, StoreResult};

use super::error::{SchedulerError, SchedulerResult};

// ============================================================================
// Configuration
// ============================================================================

/// Local posting times as `HH:MM` strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    pub weekday: Vec<String>,
    pub weekend: Vec<String>,
    pub everyday: Vec<String>,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            weekday: vec!["09:30".into(), "12:00".into(), "14:20".into(), "16:30".into()],
            weekend: vec!["11:00".into(), "12:30".into(), "14:40".into(), "17:00".into()],
            everyday: vec!["18:40".into()],
        }
    }
}

/// Parse a `HH:MM` time of day
pub fn parse_hhmm(value: &str) -> SchedulerResult<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|e| SchedulerError::invalid_time(value, e.to_string()))
}

/// Fixed offset from minutes east of UTC
pub fn offset_from_minutes(minutes: i32) -> SchedulerResult<FixedOffset> {
    FixedOffset::east_opt(minutes * 60).ok_or(SchedulerError::InvalidOffset { minutes })
}

// ============================================================================
// Posting Slots
// ============================================================================

/// Resolved posting times at a fixed offset
#[derive(Debug, Clone)]
pub struct PostingSlots {
    weekday: Vec<NaiveTime>,
    weekend: Vec<NaiveTime>,
    offset: FixedOffset,
}

impl PostingSlots {
    pub fn new(config: &SlotsConfig, utc_offset_minutes: i32) -> SchedulerResult<Self> {
        let everyday = parse_all(&config.everyday)?;
        let mut weekday = parse_all(&config.weekday)?;
        let mut weekend = parse_all(&config.weekend)?;
        weekday.extend(&everyday);
        weekend.extend(&everyday);

        for times in [&mut weekday, &mut weekend] {
            times.sort();
            times.dedup();
        }

        if weekday.is_empty() && weekend.is_empty() {
            return Err(SchedulerError::NoSlots);
        }

        Ok(Self {
            weekday,
            weekend,
            offset: offset_from_minutes(utc_offset_minutes)?,
        })
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Local calendar date of `t`
    pub fn local_date(&self, t: DateTime<Utc>) -> NaiveDate {
        t.with_timezone(&self.offset).date_naive()
    }

    /// Posting times for a local date
    pub fn times_for(&self, date: NaiveDate) -> &[NaiveTime] {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => &self.weekend,
            _ => &self.weekday,
        }
    }

    fn instant(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        self.offset
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Upcoming slot instants strictly after `after`, in order
    pub fn slots_from(&self, after: DateTime<Utc>) -> SlotIter<'_> {
        SlotIter {
            slots: self,
            after,
            date: self.local_date(after),
            index: 0,
            empty_days: 0,
        }
    }

    /// First slot strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.slots_from(after).next()
    }

    /// Next occurrence of local `time` strictly after `after`
    pub fn next_daily(&self, after: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
        let date = self.local_date(after);
        [date, date + Duration::days(1)]
            .into_iter()
            .filter_map(|d| self.instant(d, time))
            .find(|t| *t > after)
            .unwrap_or(after + Duration::days(1))
    }
}

fn parse_all(values: &[String]) -> SchedulerResult<Vec<NaiveTime>> {
    values.iter().map(|v| parse_hhmm(v)).collect()
}

/// Iterator over slot instants
pub struct SlotIter<'a> {
    slots: &'a PostingSlots,
    after: DateTime<Utc>,
    date: NaiveDate,
    index: usize,
    empty_days: u32,
}

impl Iterator for SlotIter<'_> {
    type Item = DateTime<Utc>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let times = self.slots.times_for(self.date);

            if self.index >= times.len() {
                if times.is_empty() {
                    self.empty_days += 1;
                    if self.empty_days > 7 {
                        return None;
                    }
                } else {
                    self.empty_days = 0;
                }
                self.date = self.date.succ_opt()?;
                self.index = 0;
                continue;
            }

            let time = times[self.index];
            self.index += 1;

            if let Some(at) = self.slots.instant(self.date, time) {
                if at > self.after {
                    return Some(at);
                }
            }
        }
    }
}

// ============================================================================
// Slot Allocation
// ============================================================================

/// Assigns posting slots to queued events
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    slots: PostingSlots,
}

impl SlotAllocator {
    pub fn new(slots: PostingSlots) -> Self {
        Self { slots }
    }

    pub fn slots(&self) -> &PostingSlots {
        &self.slots
    }

    /// Give every unscheduled `ReadyToPost` event its own slot
    ///
    /// Events are taken in `queue_rank` order and placed on consecutive slots
    /// after `max(now, latest assigned post_time)`.
    pub async fn fill_unscheduled(
        &self,
        repo: &dyn EventRepository,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, DateTime<Utc>)>> {
        let pending = repo.unscheduled_ready().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let mut cursor = match repo.latest_post_time().await? {
            Some(latest) if latest > now => latest,
            _ => now,
        };

        let mut assigned = Vec::with_capacity(pending.len());
        let mut upcoming = self.slots.slots_from(cursor);

        for event in pending {
            let Some(slot) = upcoming.next() else {
                break;
            };
            if repo.assign_post_time(&event.event_id, slot).await? {
                debug!(event_id = %event.event_id, post_time = %slot, "Assigned posting slot");
                assigned.push((event.event_id, slot));
                cursor = slot;
            } else {
                // slot stays free for the next event
                upcoming = self.slots.slots_from(cursor);
            }
        }

        info!(assigned = assigned.len(), "Filled unscheduled events");
        Ok(assigned)
    }

    /// Move a queued event to the first slot after its current post time
    ///
    /// Returns the new post time, or `None` when the event can not be skipped.
    pub async fn skip(
        &self,
        repo: &dyn EventRepository,
        event_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(event) = repo.get(event_id).await? else {
            return Ok(None);
        };
        let from = event.post_time.unwrap_or(now).max(now);
        let Some(target) = self.slots.next_after(from) else {
            return Ok(None);
        };

        if repo.skip(event_id, target).await? {
            info!(event_id, post_time = %target, "Skipped event to next slot");
            Ok(Some(target))
        } else {
            Ok(None)
        }
    }
}
