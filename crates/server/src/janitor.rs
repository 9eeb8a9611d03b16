//! Session janitor
//!
//! Background task that removes idle sessions on an interval. Shut
//! down through a watch channel at server exit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use orbit_config::SessionConfig;
use orbit_store::SqliteHistoryStore;

/// Start the cleanup task. Returns the shutdown sender.
pub fn start(store: Arc<SqliteHistoryStore>, config: SessionConfig) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let interval = Duration::from_secs(config.cleanup_interval_secs.max(1));
    let idle = config.idle_timeout_secs;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match store.idle_sessions(idle).await {
                        Ok(sessions) => {
                            let count = sessions.len();
                            for session_id in sessions {
                                if let Err(e) = store.remove_session(&session_id).await {
                                    tracing::warn!(session_id, error = %e, "failed to remove idle session");
                                }
                            }
                            if count > 0 {
                                tracing::info!(removed = count, "session janitor swept idle sessions");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "session janitor sweep failed"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("session janitor shutting down");
                        break;
                    }
                }
            }
        }
    });

    shutdown_tx
}
