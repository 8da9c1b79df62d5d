//! Prometheus metrics for the publication core
//!
//! This module provides metrics tracking for:
//! - Publication: ticks by outcome, publications per channel, conflicts, delivery failures
//! - Scheduling: reschedule decisions, retries per operation
//! - Ingestion: dedup hits/misses per source, inserted events per status
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for publication and scheduling metrics
struct PublisherMetrics {
    ticks: CounterVec,
    publications: CounterVec,
    conflicts: CounterVec,
    delivery_failures: CounterVec,
    reschedules: CounterVec,
    retries: CounterVec,
    ready_queue_depth: Gauge,
}

/// Container for ingestion metrics
struct IngestMetrics {
    dedup_hits: CounterVec,
    dedup_misses: CounterVec,
    inserted: CounterVec,
    source_failures: CounterVec,
}

static PUBLISHER_METRICS: OnceLock<PublisherMetrics> = OnceLock::new();

static INGEST_METRICS: OnceLock<IngestMetrics> = OnceLock::new();

/// Outcome of the one registration attempt
static METRICS_INIT: OnceLock<Result<(), String>> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once and from several threads; only the first
/// call registers anything and later calls return its outcome.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = eventcast::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    METRICS_INIT
        .get_or_init(|| register_all().map_err(|e| e.to_string()))
        .clone()
        .map_err(Into::into)
}

fn register_all() -> Result<(), Box<dyn std::error::Error>> {
    let publisher = PublisherMetrics {
        ticks: register_counter_vec!(
            "eventcast_ticks_total",
            "Publication ticks by outcome",
            &["outcome"]
        )?,
        publications: register_counter_vec!(
            "eventcast_publications_total",
            "Events published per channel",
            &["channel"]
        )?,
        conflicts: register_counter_vec!(
            "eventcast_publication_conflicts_total",
            "Publication conflicts by stage (claim or mark_posted)",
            &["stage"]
        )?,
        delivery_failures: register_counter_vec!(
            "eventcast_delivery_failures_total",
            "Failed deliveries per channel",
            &["channel"]
        )?,
        reschedules: register_counter_vec!(
            "eventcast_reschedules_total",
            "Reschedule decisions by action",
            &["action"]
        )?,
        retries: register_counter_vec!(
            "eventcast_retries_total",
            "Retried remote calls per operation",
            &["operation"]
        )?,
        ready_queue_depth: register_gauge!(
            "eventcast_ready_queue_depth",
            "Events currently ReadyToPost"
        )?,
    };

    let ingest = IngestMetrics {
        dedup_hits: register_counter_vec!(
            "eventcast_dedup_hits_total",
            "Scraped events dropped as already known",
            &["source"]
        )?,
        dedup_misses: register_counter_vec!(
            "eventcast_dedup_misses_total",
            "Scraped events that were new",
            &["source"]
        )?,
        inserted: register_counter_vec!(
            "eventcast_events_inserted_total",
            "Events inserted by target status",
            &["status"]
        )?,
        source_failures: register_counter_vec!(
            "eventcast_source_failures_total",
            "Failed scraper runs per source",
            &["source"]
        )?,
    };

    PUBLISHER_METRICS
        .set(publisher)
        .map_err(|_| "Publisher metrics already initialized")?;
    INGEST_METRICS
        .set(ingest)
        .map_err(|_| "Ingest metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    PUBLISHER_METRICS.get().is_some() && INGEST_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a tick outcome ("idle", "published", "conflict", "delivery_failed", "error")
pub fn record_tick(outcome: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.ticks.with_label_values(&[outcome]).inc();
    }
}

pub fn record_publication(channel: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.publications.with_label_values(&[channel]).inc();
    }
}

/// Record a publication conflict at `stage` ("claim" or "mark_posted")
pub fn record_conflict(stage: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.conflicts.with_label_values(&[stage]).inc();
    }
}

pub fn record_delivery_failure(channel: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.delivery_failures.with_label_values(&[channel]).inc();
    }
}

/// Record a reschedule decision
pub fn record_reschedule(action: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.reschedules.with_label_values(&[action]).inc();
    }
}

pub fn record_retry(operation: &str) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.retries.with_label_values(&[operation]).inc();
    }
}

pub fn set_ready_queue_depth(depth: usize) {
    if let Some(m) = PUBLISHER_METRICS.get() {
        m.ready_queue_depth.set(depth as f64);
    }
}

/// Record deduplication results for one source batch
pub fn record_dedup_results(source: &str, new_events: usize, known_events: usize) {
    let Some(m) = INGEST_METRICS.get() else {
        return;
    };

    if new_events > 0 {
        m.dedup_misses
            .with_label_values(&[source])
            .inc_by(new_events as f64);
    }
    if known_events > 0 {
        m.dedup_hits
            .with_label_values(&[source])
            .inc_by(known_events as f64);
    }
}

pub fn record_inserted(status: &str, count: usize) {
    if count == 0 {
        return;
    }
    if let Some(m) = INGEST_METRICS.get() {
        m.inserted.with_label_values(&[status]).inc_by(count as f64);
    }
}

pub fn record_source_failure(source: &str) {
    if let Some(m) = INGEST_METRICS.get() {
        m.source_failures.with_label_values(&[source]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
