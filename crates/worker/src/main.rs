use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use porteiro_events::{
    DecisionWatcher, FileStore, RestConfig, RestDecisionSource, WatcherConfig,
};
use porteiro_realtime::{RealtimeClient, RealtimeConfig};

mod config;
mod notice;

use config::{LogFormat, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    // Before the rest of the configuration so its errors are logged.
    init_tracing(LogFormat::from_env());

    // --- Configuration ---
    let config = WorkerConfig::from_env().inspect_err(|e| {
        tracing::error!(error = %e, "Invalid worker configuration");
    })?;
    tracing::info!(
        building_id = %config.building_id,
        poll_interval_secs = config.poll_interval.as_secs(),
        cache_dir = %config.cache_dir.display(),
        authenticated = config.access_token.is_some(),
        "Loaded worker configuration",
    );

    // --- Backend ---
    let store = Arc::new(FileStore::new(config.cache_dir.clone()));
    let source = Arc::new(RestDecisionSource::new(RestConfig {
        base_url: config.supabase_url.clone(),
        api_key: config.anon_key.clone(),
        access_token: config.access_token.clone(),
    }));

    let mut realtime_config = RealtimeConfig::new(&config.supabase_url, &config.anon_key);
    realtime_config.access_token = config.access_token.clone();
    let realtime = RealtimeClient::new(realtime_config);

    // --- Watcher ---
    let watcher_config = WatcherConfig {
        poll_interval: config.poll_interval,
        ..WatcherConfig::default()
    };
    let mut watcher = DecisionWatcher::new(
        watcher_config,
        source,
        Arc::new(realtime.clone()),
        store,
    )
    .with_session_expired(|e| {
        tracing::error!(error = %e, "Session expired, sign in again and restart the worker");
    });

    let mut notices = watcher.start(config.building_id.clone()).await?;
    tracing::info!(building_id = %config.building_id, "Watching resident decisions");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received");
                break;
            }
            notice = notices.recv() => match notice {
                Some(notice) => {
                    tracing::info!(
                        signature = %notice.signature,
                        path = %notice.path,
                        status = %notice.decision.status,
                        "{}",
                        notice::describe(&notice),
                    );
                }
                None => {
                    tracing::warn!("Decision stream ended");
                    break;
                }
            }
        }
    }

    // --- Shutdown ---
    watcher.stop().await;
    realtime.shutdown();
    tracing::info!("Worker stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "porteiro_worker=debug,porteiro_events=debug,porteiro_realtime=info".into()
    });
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
