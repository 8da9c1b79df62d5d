use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use eventcast::app::{App, Collaborators};
use eventcast::config::Config;
use eventcast::metrics;

/// Run the publication daemon until Ctrl-C
pub async fn run(config: Config, dry_run: bool, metrics_addr: Option<String>) -> Result<()> {
    let metrics_addr = metrics_addr.or_else(|| config.metrics.listen_addr.clone());
    let daily_time = config.scheduler.daily_update_time()?;
    let poll_interval = config.scheduler.poll_interval();
    let reconcile_interval = config.scheduler.reconcile_interval();

    let parts = Collaborators::connect(&config, dry_run).await?;
    let app = Arc::new(App::new(config, parts)?);

    if let Some(addr) = metrics_addr {
        metrics::init_metrics().map_err(|e| anyhow::anyhow!("Failed to register metrics: {e}"))?;
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {addr}"))?;
        tracing::info!(addr = %addr, "Metrics server listening");
        let router = metrics_router(app.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "Metrics server stopped");
            }
        });
    }

    // converge with whatever state an earlier process left behind
    if let Err(e) = app.reschedule(Utc::now()).await {
        tracing::error!(error = %e, "Initial reschedule failed");
    }

    let mut poll = tokio::time::interval(poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut reconcile = tokio::time::interval(reconcile_interval);
    reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut next_daily = app.allocator().slots().next_daily(Utc::now(), daily_time);
    tracing::info!(next_daily = %next_daily, "Daemon started");

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match app.fire_due(Utc::now()).await {
                    Ok(outcomes) => {
                        for outcome in outcomes {
                            tracing::debug!(
                                tick = ?outcome.tick.as_ref().map(|t| t.as_str()),
                                reschedule = outcome.reschedule.as_str(),
                                "Trigger handled"
                            );
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Failed to handle due triggers"),
                }
            }
            _ = reconcile.tick() => {
                if let Err(e) = app.reschedule(Utc::now()).await {
                    tracing::error!(error = %e, "Reconcile failed");
                }
            }
            _ = tokio::time::sleep(until(next_daily)) => {
                let now = Utc::now();
                if let Err(e) = app.daily_maintenance(now).await {
                    tracing::error!(error = %e, "Daily maintenance failed");
                }
                next_daily = app.allocator().slots().next_daily(now, daily_time);
                tracing::info!(next_daily = %next_daily, "Next daily maintenance scheduled");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    Ok(())
}

fn until(at: DateTime<Utc>) -> Duration {
    (at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ready_to_post: Option<usize>,
}

fn metrics_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::encode_metrics().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn health_handler(State(app): State<Arc<App>>) -> (StatusCode, Json<HealthResponse>) {
    match app.repository().count_by_status().await {
        Ok(counts) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "healthy",
                version: env!("CARGO_PKG_VERSION"),
                ready_to_post: Some(counts.ready_to_post),
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unhealthy",
                    version: env!("CARGO_PKG_VERSION"),
                    ready_to_post: None,
                }),
            )
        }
    }
}
