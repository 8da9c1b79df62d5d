//! Publication scheduling
//!
//! This module decides *when* the publication coordinator runs. It keeps a
//! single delayed trigger outstanding for the earliest ready event and
//! re-derives it after every tick, so the loop corrects itself when the
//! queue changes underneath it.
//!
//! # Architecture
//!
//! ```text
//!            reconcile interval / admin command
//!                          │
//!                          ▼
//!  ┌────────────────────────────────────────────┐
//!  │              PostingScheduler              │
//!  │  earliest_ready_post_time ──► target       │
//!  │  TokenStore (KV, CAS)  ◄──► TriggerQueue   │
//!  └────────────────────────────────────────────┘
//!                          │ trigger fires
//!                          ▼
//!            PublicationCoordinator::tick
//!                          │
//!                          └──► reschedule (always)
//! ```
//!
//! # Modules
//!
//! - [`posting`] - The rescheduling loop and trigger handling
//! - [`token`] - Persisted rescheduling token with compare-and-set updates
//! - [`trigger`] - Delayed-trigger substrate (Redis sorted set or in-process)
//! - [`slots`] - Daily posting slots and post-time allocation
//! - [`error`] - Scheduler errors
//!
//! # Configuration
//!
//! | Setting | Default | Description |
//! |---------|---------|-------------|
//! | `due_window_secs` | 300 | How early an event may be published |
//! | `reschedule_tolerance_secs` | 180 | Token drift that is left alone |
//! | `failure_backoff_secs` | 60 | Delay of the next trigger after a failed tick |
//! | `reconcile_interval_secs` | 300 | Periodic `reschedule` in the daemon |
//! | `utc_offset_minutes` | 180 | Offset of the local posting slots |

pub mod error;
pub mod posting;
pub mod slots;
pub mod token;
pub mod trigger;

pub use error::{SchedulerError, SchedulerResult};
pub use posting::{PostingScheduler, PostingSettings, RescheduleOutcome, TriggerOutcome};
pub use slots::{offset_from_minutes, parse_hhmm, PostingSlots, SlotAllocator, SlotsConfig};
pub use token::{StoredToken, TokenStore, TOKEN_KEY};
pub use trigger::{
    MemoryTriggerQueue, RedisTriggerQueue, SharedTriggerQueue, Trigger, TriggerHandle,
    TriggerPayload, TriggerQueue,
};
