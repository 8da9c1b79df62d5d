//! Batch deduplication against known event ids
//!
//! Identity is the `event_id` alone; there is no content or fuzzy matching.
//! [`filter_new`] is pure: it borrows its inputs and returns owned copies of
//! the unseen events in their original order.

use std::collections::HashSet;

use crate::models::Event;

/// Outcome of checking one scraped batch
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Unseen events, input order preserved
    pub fresh: Vec<Event>,

    /// Candidates whose id was already known to the store
    pub already_known: usize,

    /// Repeats of an id earlier in the same batch
    pub batch_duplicates: usize,
}

impl DedupOutcome {
    pub fn new_count(&self) -> usize {
        self.fresh.len()
    }

    pub fn total_checked(&self) -> usize {
        self.fresh.len() + self.already_known + self.batch_duplicates
    }

    /// Deduplication ratio (0.0 = all new, 1.0 = nothing new)
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.total_checked();
        if total == 0 {
            return 0.0;
        }
        (self.already_known + self.batch_duplicates) as f64 / total as f64
    }
}

/// Stateless batch deduplicator
#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    /// Split `candidates` into fresh events and counts of what was dropped
    pub fn check(candidates: &[Event], known_ids: &HashSet<String>) -> DedupOutcome {
        let mut seen: HashSet<&str> = HashSet::with_capacity(candidates.len());
        let mut outcome = DedupOutcome::default();

        for event in candidates {
            if known_ids.contains(&event.event_id) {
                outcome.already_known += 1;
            } else if !seen.insert(event.event_id.as_str()) {
                outcome.batch_duplicates += 1;
            } else {
                outcome.fresh.push(event.clone());
            }
        }

        outcome
    }
}

/// Events from `candidates` whose id is not in `known_ids`
///
/// Keeps only the first occurrence of an id repeated inside the batch.
pub fn filter_new(candidates: &[Event], known_ids: &HashSet<String>) -> Vec<Event> {
    Deduplicator::check(candidates, known_ids).fresh
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn event(id: &str, title: &str) -> Event {
        let t = Utc.with_ymd_and_hms(2024, 6, 1, 18, 0, 0).unwrap();
        Event::new(id, "test", title, format!("https://example.com/{id}"), t, t)
    }

    fn ids(events: &[Event]) -> Vec<&str> {
        events.iter().map(|e| e.event_id.as_str()).collect()
    }

    #[test]
    fn test_filter_new_drops_known_ids() {
        let candidates = vec![event("1", "a"), event("2", "b"), event("3", "c")];
        let known = HashSet::from(["2".to_string()]);

        let fresh = filter_new(&candidates, &known);
        assert_eq!(ids(&fresh), vec!["1", "3"]);
    }

    #[test]
    fn test_filter_new_keeps_first_batch_duplicate() {
        let candidates = vec![event("1", "first"), event("2", "b"), event("1", "second")];
        let fresh = filter_new(&candidates, &HashSet::new());

        assert_eq!(ids(&fresh), vec!["1", "2"]);
        assert_eq!(fresh[0].title, "first");
    }

    #[test]
    fn test_check_counts() {
        let candidates = vec![event("1", "a"), event("1", "a"), event("9", "z")];
        let known = HashSet::from(["9".to_string()]);

        let outcome = Deduplicator::check(&candidates, &known);
        assert_eq!(outcome.new_count(), 1);
        assert_eq!(outcome.already_known, 1);
        assert_eq!(outcome.batch_duplicates, 1);
        assert!((outcome.dedup_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_batch() {
        let outcome = Deduplicator::check(&[], &HashSet::new());
        assert_eq!(outcome.total_checked(), 0);
        assert_eq!(outcome.dedup_ratio(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_filter_new_is_idempotent(
            batch in proptest::collection::vec("[a-e]", 0..20),
            known in proptest::collection::hash_set("[a-e]", 0..5),
        ) {
            let candidates: Vec<Event> = batch.iter().map(|id| event(id, id)).collect();

            let once = filter_new(&candidates, &known);
            let twice = filter_new(&candidates, &known);
            prop_assert_eq!(&once, &twice);

            let refiltered = filter_new(&once, &known);
            prop_assert_eq!(&once, &refiltered);
        }

        #[test]
        fn prop_filter_new_preserves_order_and_uniqueness(
            batch in proptest::collection::vec("[a-h]", 0..30),
            known in proptest::collection::hash_set("[a-h]", 0..4),
        ) {
            let candidates: Vec<Event> = batch.iter().map(|id| event(id, id)).collect();
            let fresh = filter_new(&candidates, &known);

            let mut seen = HashSet::new();
            for e in &fresh {
                prop_assert!(!known.contains(&e.event_id));
                prop_assert!(seen.insert(e.event_id.clone()));
            }

            let expected: Vec<&String> = {
                let mut first = HashSet::new();
                batch
                    .iter()
                    .filter(|id| !known.contains(*id) && first.insert(id.as_str()))
                    .collect()
            };
            let actual: Vec<&String> = fresh.iter().map(|e| &e.event_id).collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
