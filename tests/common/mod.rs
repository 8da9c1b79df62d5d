//! Common test utilities

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use eventcast::app::{App, Collaborators};
use eventcast::channels::{ChannelClient, DeliveryError};
use eventcast::config::Config;
use eventcast::models::{Event, PublishedRef};
use eventcast::notifications::MemorySink;

/// 2024-05-01 (a Wednesday) at `h:m` UTC
pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
}

/// Event ready to be queued with the given post time
pub fn queued(id: &str, post_time: DateTime<Utc>) -> Event {
    Event::new(
        id,
        "test",
        format!("Event {id}"),
        format!("https://example.com/events/{id}"),
        post_time + chrono::Duration::days(2),
        post_time + chrono::Duration::days(2) + chrono::Duration::hours(2),
    )
    .with_post_time(post_time)
}

/// Event without a post time
#[allow(dead_code)]
pub fn unscheduled(id: &str) -> Event {
    let mut event = queued(id, at(0, 0));
    event.post_time = None;
    event
}

/// Channel that counts calls and can hold each publish for a while
#[derive(Default)]
pub struct CountingChannel {
    calls: AtomicUsize,
    delay: Option<Duration>,
    published: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl CountingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelClient for CountingChannel {
    fn name(&self) -> &str {
        "counting"
    }

    async fn publish(&self, event: &Event) -> Result<PublishedRef, DeliveryError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.published.lock().unwrap().push(event.event_id.clone());
        Ok(PublishedRef::new(self.name(), format!("msg-{n}")))
    }
}

/// In-memory app plus handles on its channel and alert sink
#[allow(dead_code)]
pub struct Harness {
    pub app: App,
    pub channel: Arc<CountingChannel>,
    pub sink: Arc<MemorySink>,
}

#[allow(dead_code)]
pub fn harness() -> Harness {
    harness_with(Config::default())
}

#[allow(dead_code)]
pub fn harness_with(config: Config) -> Harness {
    let channel = Arc::new(CountingChannel::new());
    let sink = Arc::new(MemorySink::new());
    let parts = Collaborators::in_memory(channel.clone(), sink.clone());
    let app = App::new(config, parts).unwrap();
    Harness { app, channel, sink }
}
