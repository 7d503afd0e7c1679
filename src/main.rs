use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use beacon_server::auth::jwt::{load_or_generate_jwt_secret, JwtVerifier};
use beacon_server::config::{generate_config_template, Config};
use beacon_server::notify::{dispatch, retention};
use beacon_server::push::HttpPushSender;
use beacon_server::ws::lifecycle;
use beacon_server::{db, routes, state};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("beacon_server=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Beacon server v{} starting", env!("CARGO_PKG_VERSION"));

    // Initialize SQLite database
    let db = db::init_db(&config.data_dir)?;

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = load_or_generate_jwt_secret(&config.data_dir)?;
    let verifier = Arc::new(JwtVerifier::new(jwt_secret));

    let push_sender = Arc::new(HttpPushSender::new(&config.push)?);

    let bind = format!("{}:{}", config.bind_address, config.port);
    let app_state = state::AppState::new(db, config, verifier, push_sender);

    // Background tasks: feed -> sockets, idle sweep, retention
    let dispatcher = dispatch::spawn_dispatcher(app_state.clone()).await?;
    let sweeper = lifecycle::spawn_heartbeat_sweeper(app_state.clone());
    let cleanup = retention::spawn_retention_cleanup(
        app_state.store.clone(),
        app_state.config.notifications.retention_days,
        app_state.config.notifications.cleanup_interval_secs,
        app_state.shutdown.clone(),
    );

    // Build router
    let app = routes::build_router(app_state.clone());

    // Bind and serve
    let listener = TcpListener::bind(&bind).await?;
    tracing::info!("Listening on {}", bind);

    let shutdown = app_state.shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
        shutdown.cancel();
    })
    .await?;

    app_state.shutdown.cancel();
    let _ = tokio::join!(dispatcher, sweeper, cleanup);
    tracing::info!("Beacon server stopped");
    Ok(())
}
