pub mod admin;
pub mod run;

pub use admin::{approve, fill_slots, ingest, maintain, reschedule, skip, status, sweep, tick};
pub use run::run;
