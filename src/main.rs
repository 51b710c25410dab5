//! ChangeGate - Software Change Governance
//!
//! Serves the governance pipeline over HTTP: start runs, answer approval
//! checkpoints, read the audit trail and roll deployments back.

use changegate::config::Settings;
use changegate::integrations::collaborators_from_settings;
use changegate::routes::create_router;
use changegate::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting ChangeGate - Software Change Governance...");

    let settings = Settings::load()?;
    info!("Configuration loaded successfully");

    let collaborators = collaborators_from_settings(&settings)?;
    let state = Arc::new(AppState::open(&settings, collaborators).await?);

    let app = create_router(state, &settings);
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("Server listening on http://{}", addr);
    info!("   POST /api/runs                          - Start a pipeline run");
    info!("   GET  /api/runs/{{id}}                     - Run status");
    info!("   GET  /api/approvals?status=pending      - Pending approvals");
    info!("   POST /api/approvals/{{id}}/approve|reject - Answer a checkpoint");
    info!("   GET  /api/audit                         - Audit trail");
    info!("   POST /api/deployments/{{env}}/rollback    - Roll back an environment");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,changegate=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
