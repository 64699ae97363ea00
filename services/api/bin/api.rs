//! Main Entrypoint for the Call Bridge Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the call store (PostgreSQL when configured, memory otherwise).
//! 3. Wiring the session registry, event broadcaster and voice agent factory.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use callbridge_api::{
    config::Config,
    db::Db,
    router::create_router,
    state::AppState,
    ws::provider::{RealtimeAgentFactory, RealtimeSettings},
};
use callbridge_core::{
    EventBroadcaster, SessionContext, SessionRegistry,
    store::{CallStore, MemoryCallStore},
};
use sqlx::PgPool;
use std::{fs, net::SocketAddr, path::Path, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Loads the agent's system prompt from the prompts directory.
fn load_system_prompt(prompts_path: &Path) -> anyhow::Result<String> {
    let path = prompts_path.join("system_prompt.md");
    fs::read_to_string(&path)
        .with_context(|| format!("Could not read system prompt at {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Call Store ---
    let store: Arc<dyn CallStore> = match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = Db::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(db)
        }
        None => {
            warn!("DATABASE_URL not set; call records will be kept in memory only.");
            Arc::new(MemoryCallStore::new())
        }
    };

    // --- 4. Initialize Shared Services ---
    let instructions = load_system_prompt(&config.prompts_path)?;
    let agents = RealtimeAgentFactory::new(RealtimeSettings::from_config(&config, instructions));
    let broadcaster = Arc::new(EventBroadcaster::new(config.observer_buffer));

    let app_state = Arc::new(AppState {
        sessions: SessionContext {
            registry: SessionRegistry::new(),
            publisher: broadcaster.clone(),
            store,
            agents: Arc::new(agents),
            disconnect_timeout: config.agent_disconnect_timeout,
        },
        broadcaster,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model = %config.realtime_model,
        voice = %config.realtime_voice,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
