//! Gateway server binary
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 critical
//! dependency unreachable at startup with strict mode on, 130 on
//! SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use orbit_config::load_settings;
use orbit_server::{create_router, init_metrics, janitor, AppState};

const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;
const EXIT_SIGINT: i32 = 130;

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            return args.next().map(PathBuf::from);
        }
    }
    std::env::var("ORBIT_CONFIG").ok().map(PathBuf::from)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = match load_settings(config_path().as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    init_metrics();

    let state = match AppState::build(settings).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "failed to assemble server");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Startup verification: every provider and datasource must answer
    // when strict mode is on.
    let unreachable = state.verify_dependencies().await;
    if !unreachable.is_empty() {
        if state.settings.strict_startup {
            tracing::error!(targets = ?unreachable, "critical dependencies unreachable");
            std::process::exit(EXIT_DEPENDENCY);
        }
        tracing::warn!(targets = ?unreachable, "dependencies unreachable, serving degraded");
    }

    let janitor_shutdown = state
        .janitor_store
        .as_ref()
        .map(|store| janitor::start(Arc::clone(store), state.settings.session.clone()));

    let bind = format!("{}:{}", state.settings.server.host, state.settings.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(bind, error = %e, "failed to bind");
            std::process::exit(EXIT_CONFIG);
        }
    };
    tracing::info!(bind, "gateway listening");

    let router = create_router(state);
    let sigint = tokio::signal::ctrl_c();

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = sigint.await;
            tracing::info!("SIGINT received, shutting down");
        })
        .await;

    if let Some(shutdown) = janitor_shutdown {
        let _ = shutdown.send(true);
    }

    match served {
        Ok(()) => std::process::exit(EXIT_SIGINT),
        Err(e) => {
            tracing::error!(error = %e, "server error");
            std::process::exit(EXIT_CONFIG);
        }
    }
}
