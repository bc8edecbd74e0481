//! `jobsync-watch` -- follows a set of backend jobs until they finish.
//!
//! Tracks every job id in `JOBSYNC_JOB_IDS` over the job stream, falls
//! back to REST polling while the stream is down, and logs each state
//! change. Exits once every job is terminal or on Ctrl-C / SIGTERM.
//!
//! See [`WatchConfig::from_env`] for the environment variables. Set
//! `LOG_FORMAT=json` for JSON log lines; `RUST_LOG` overrides the filter.

use std::sync::Arc;

use jobsync_client::api::JobApi;
use jobsync_client::events::ConnectionEvent;
use jobsync_client::poller::PollingCoordinator;
use jobsync_client::router::SubscriptionRouter;
use jobsync_client::tracker::JobTracker;
use jobsync_client::transport::WsConnector;
use jobsync_core::store::{JobStore, StoreEvent};
use jobsync_watch::config::WatchConfig;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "jobsync_watch=info,jobsync_client=info,jobsync_core=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WatchConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        ws_url = %config.ws_url,
        api_url = %config.api_url,
        jobs = config.job_ids.len(),
        poll_mode = ?config.poll_mode,
        "Starting jobsync-watch",
    );

    let store = Arc::new(JobStore::new());
    let mut store_events = store.subscribe();

    let api = Arc::new(JobApi::new(config.api_url.clone()));
    let poller = PollingCoordinator::new(api, Arc::clone(&store), config.poll.clone());
    let router = SubscriptionRouter::new(config.connection.clone(), Arc::new(WsConnector));
    let tracker = JobTracker::new(router, poller, config.ws_url.clone(), config.poll_mode);

    for job_id in &config.job_ids {
        tracker.track(job_id.clone());
    }

    if let Some(connection) = tracker.connection() {
        tokio::spawn(log_connection_events(connection.subscribe()));
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            event = store_events.recv() => match event {
                Ok(StoreEvent::Updated(state)) => {
                    tracing::info!(
                        job_id = %state.id,
                        status = %state.status,
                        progress = state.progress,
                        message = state.message.as_deref().unwrap_or_default(),
                        error = state.error.as_deref().unwrap_or_default(),
                        source = ?state.source,
                        "Job updated",
                    );
                    if tracker.all_terminal() {
                        tracing::info!("All watched jobs reached a terminal status");
                        break;
                    }
                }
                Ok(StoreEvent::Dismissed(job_id)) => {
                    tracing::info!(job_id = %job_id, "Job dismissed");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Store event feed lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    for state in store.get_all() {
        tracing::info!(
            job_id = %state.id,
            status = %state.status,
            progress = state.progress,
            "Final job state",
        );
    }

    if let Some(connection) = tracker.connection() {
        connection.disconnect().await;
    }
    tracker.poller().stop_all();

    tracing::info!("jobsync-watch stopped");
}

/// Install the tracing subscriber. `LOG_FORMAT=json` selects JSON output.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn log_connection_events(mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::StatusChanged { status }) => {
                if status.is_degraded() {
                    tracing::warn!(status = %status, "Job stream degraded");
                } else {
                    tracing::info!(status = %status, "Job stream status");
                }
            }
            Ok(ConnectionEvent::LatencySampled { latency }) => {
                tracing::debug!(latency_ms = latency.as_millis() as u64, "Job stream latency");
            }
            Ok(ConnectionEvent::Message(_)) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
    }
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
