//! Governance Engine server
//!
//! Serves the process and engine action API and, unless disabled, runs an
//! engine host that claims and executes engine actions from the shared store.

use governance_engine::config::Settings;
use governance_engine::governance::{self, EngineHost, ServiceRegistry};
use governance_engine::routes::create_router;
use governance_engine::state::AppState;
use governance_engine::store::{InMemoryMetadataStore, MetadataStore, PostgresMetadataStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting Governance Engine...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let store: Arc<dyn MetadataStore> = match &settings.database {
        Some(db) => match PostgresMetadataStore::connect(db).await {
            Ok(store) => {
                info!("✅ Metadata store connected (postgres {}:{}/{})", db.host, db.port, db.database);
                Arc::new(store)
            }
            Err(e) => {
                error!("❌ FATAL: Failed to initialize metadata store: {}", e);
                return Err(e.into());
            }
        },
        None => {
            warn!("⚠️  DATABASE_URL not set, using the in-memory metadata store (state is lost on exit)");
            Arc::new(InMemoryMetadataStore::new())
        }
    };

    let services = Arc::new(ServiceRegistry::with_builtins());
    let listeners = governance::listener::global();
    let state = Arc::new(AppState::new(
        store,
        services.clone(),
        listeners.clone(),
        settings.clone(),
    ));

    // Engine host runs beside the API until shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let host_handle = if settings.engine.enabled {
        let host = Arc::new(EngineHost::new(&settings.engine, state.actions.clone(), services));
        Some(tokio::spawn(host.run(shutdown_rx)))
    } else {
        info!("Engine host disabled (ENGINE_ENABLED=false)");
        None
    };

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Processes ───");
    info!("   POST /api/processes                     - Define a process");
    info!("   GET  /api/processes                     - List processes");
    info!("   POST /api/processes/:guid/publish       - Make a process active");
    info!("   PUT  /api/processes/:guid/first-step    - Set the first step");
    info!("   GET  /api/processes/:guid/validate      - Report graph problems");
    info!("   POST /api/processes/initiate            - Start a process");
    info!("");
    info!("   ─── Steps & Links ───");
    info!("   POST /api/steps                         - Define a step");
    info!("   POST /api/steps/:guid/next-steps        - Link a successor step");
    info!("   PUT  /api/links/:guid                   - Change a link's guard");
    info!("");
    info!("   ─── Engine Actions ───");
    info!("   POST /api/engine-actions                - Request a single action");
    info!("   GET  /api/engine-actions                - List engine actions");
    info!("   POST /api/engine-actions/:guid/claim    - Claim for an engine");
    info!("   PUT  /api/engine-actions/:guid/status   - Advance status");
    info!("   POST /api/engine-actions/:guid/complete - Record completion");
    info!("   POST /api/engine-actions/:guid/cancel   - Force termination");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the engine host and wait for running actions
    let _ = shutdown_tx.send(true);
    if let Some(handle) = host_handle {
        if let Err(e) = handle.await {
            error!("Engine host task failed: {}", e);
        }
    }
    listeners.shutdown().await;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,governance_engine=debug,tower_http=debug"));

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
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
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
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
