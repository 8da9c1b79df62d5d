use anyhow::{Context, Result};
use chrono::Utc;

use eventcast::app::{App, Collaborators};
use eventcast::config::Config;
use eventcast::publisher::TickOutcome;

async fn connect(config: Config, dry_run: bool) -> Result<App> {
    let parts = Collaborators::connect(&config, dry_run).await?;
    App::new(config, parts)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to encode output")?
    );
    Ok(())
}

pub async fn tick(config: Config, dry_run: bool) -> Result<()> {
    let app = connect(config, dry_run).await?;
    let outcome = app.tick(Utc::now()).await?;

    match &outcome.tick {
        Some(TickOutcome::Published { event_id, receipt }) => println!(
            "Published {event_id} to {} (message {})",
            receipt.channel, receipt.channel_message_id
        ),
        Some(TickOutcome::Idle) => println!("Nothing to publish"),
        Some(TickOutcome::Conflict { event_id, stage }) => {
            println!("{event_id} was taken by another worker ({})", stage.as_str())
        }
        Some(TickOutcome::DeliveryFailed { event_id, error }) => {
            println!("Failed to publish {event_id}: {error}")
        }
        None => println!("Tick failed; see the log"),
    }
    println!("Next trigger: {}", describe(outcome.reschedule.scheduled_at()));
    Ok(())
}

pub async fn reschedule(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    let outcome = app.reschedule(Utc::now()).await?;
    println!(
        "Reschedule: {} (next trigger: {})",
        outcome.as_str(),
        describe(outcome.scheduled_at())
    );
    Ok(())
}

pub async fn ingest(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    let reports = app.ingest(Utc::now()).await;

    println!("Ingestion");
    println!("=========");
    for report in &reports {
        match &report.error {
            Some(error) => println!("  {:<16} FAILED: {error}", report.source),
            None => println!(
                "  {:<16} fetched {:>4}  filtered {:>3}  known {:>4}  inserted {:>4}",
                report.source, report.fetched, report.filtered, report.already_known, report.inserted
            ),
        }
    }
    Ok(())
}

pub async fn maintain(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    let report = app.daily_maintenance(Utc::now()).await?;
    print_json(&report)
}

pub async fn status(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    print_json(&app.status().await?)
}

pub async fn approve(config: Config, event_id: &str) -> Result<()> {
    let app = connect(config, true).await?;
    let report = app
        .approve(event_id, Utc::now())
        .await
        .with_context(|| format!("Failed to approve {event_id}"))?;
    println!(
        "Approved {} (rank {}, post time {})",
        report.event_id,
        report.queue_rank,
        describe(report.post_time)
    );
    Ok(())
}

pub async fn skip(config: Config, event_id: &str) -> Result<()> {
    let app = connect(config, true).await?;
    match app.skip(event_id, Utc::now()).await? {
        Some(at) => println!("Moved {event_id} to {at}"),
        None => println!("{event_id} is not a queued event"),
    }
    Ok(())
}

pub async fn fill_slots(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    let now = Utc::now();
    let assigned = app.fill_slots(now).await?;
    for (event_id, at) in &assigned {
        println!("  {event_id} -> {at}");
    }
    println!("Assigned {} events", assigned.len());
    app.reschedule(now).await?;
    Ok(())
}

pub async fn sweep(config: Config) -> Result<()> {
    let app = connect(config, true).await?;
    let removed = app.sweep(Utc::now()).await?;
    println!("Removed {removed} expired events");
    Ok(())
}

fn describe(at: Option<chrono::DateTime<Utc>>) -> String {
    at.map_or_else(|| "none".to_string(), |t| t.to_rfc3339())
}
