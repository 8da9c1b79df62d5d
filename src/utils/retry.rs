//! Retry policy for calls that cross a network boundary
//!
//! Every store and channel call made by the publication core goes through a
//! [`RetryPolicy`]. Retries are immediate (no backoff); the attempt bound is
//! chosen per call site, so publication and reads can differ. Intermediate
//! errors never reach the caller: only the final success or the last error.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::metrics;
use crate::notifications::{Alert, AlertKind, SharedAlertSink};

/// Bounded or unbounded immediate retry
#[derive(Clone)]
pub struct RetryPolicy {
    /// `None` retries forever; only valid for idempotent reads
    max_attempts: Option<u32>,
    sink: Option<SharedAlertSink>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bounded(3)
    }
}

impl RetryPolicy {
    /// At most `max_attempts` calls in total; zero is treated as one
    pub fn bounded(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            sink: None,
        }
    }

    /// Retry until the operation succeeds
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            sink: None,
        }
    }

    /// Report each retry to `sink`
    pub fn with_sink(mut self, sink: SharedAlertSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn sink(&self) -> Option<SharedAlertSink> {
        self.sink.clone()
    }

    /// Run `operation`, retrying on every error
    pub async fn run<T, E, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(operation_name, operation, |_| true).await
    }

    /// Run `operation`, retrying only errors accepted by `should_retry`
    ///
    /// A rejected error is returned immediately without consuming further
    /// attempts.
    pub async fn run_if<T, E, F, Fut, P>(
        &self,
        operation_name: &str,
        mut operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        warn!(operation = operation_name, attempt, error = %e, "Non-retryable error encountered");
                        return Err(e);
                    }

                    if let Some(max) = self.max_attempts {
                        if attempt >= max {
                            warn!(
                                operation = operation_name,
                                attempt,
                                max_attempts = max,
                                error = %e,
                                "Operation failed, attempts exhausted"
                            );
                            return Err(e);
                        }
                    }

                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = ?self.max_attempts,
                        error = %e,
                        "Operation failed, will retry"
                    );
                    self.report_retry(operation_name, attempt, &e);

                    attempt = attempt.saturating_add(1);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    fn report_retry<E: Display>(&self, operation_name: &str, attempt: u32, error: &E) {
        metrics::record_retry(operation_name);

        if let Some(sink) = &self.sink {
            sink.notify(
                Alert::new(
                    AlertKind::Retry,
                    format!("{operation_name} failed (attempt {attempt}): {error}"),
                )
                .with_metadata("operation", operation_name)
                .with_metadata("attempt", attempt),
            );
        }
    }
}

/// Retry bounds per call site
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    /// Idempotent store reads
    pub read: RetryPolicy,
    /// Store writes and KV updates
    pub write: RetryPolicy,
    /// Channel publication; only pre-send failures are retried
    pub publish: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            read: RetryPolicy::unbounded(),
            write: RetryPolicy::bounded(3),
            publish: RetryPolicy::bounded(3),
        }
    }
}

impl RetryPolicies {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            read: match config.read_attempts {
                Some(n) => RetryPolicy::bounded(n),
                None => RetryPolicy::unbounded(),
            },
            write: RetryPolicy::bounded(config.write_attempts),
            publish: RetryPolicy::bounded(config.publish_attempts),
        }
    }

    /// Single attempt everywhere, for tests and dry runs
    pub fn no_retry() -> Self {
        Self {
            read: RetryPolicy::bounded(1),
            write: RetryPolicy::bounded(1),
            publish: RetryPolicy::bounded(1),
        }
    }

    /// Attach the same alert sink to every policy
    pub fn with_sink(self, sink: SharedAlertSink) -> Self {
        Self {
            read: self.read.with_sink(Arc::clone(&sink)),
            write: self.write.with_sink(Arc::clone(&sink)),
            publish: self.publish.with_sink(sink),
        }
    }
}
