use axum::{middleware, routing, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::middleware::VerifierExt;
use crate::notify::routes as notify_routes;
use crate::presence::status as presence;
use crate::push::routes as push_routes;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the token verifier into request extensions so the Principal extractor can find it.
async fn inject_verifier(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(VerifierExt(state.verifier.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting on writes that fan out: 30 requests per minute per IP
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(2) // 1 token every 2 seconds = 30 per minute
            .burst_size(10)
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(60)) => {}
            }
            governor_limiter.retain_recent();
        }
    });

    // Push registration and event creation, rate limited
    let limited_routes = Router::new()
        .route(
            "/api/push/subscriptions",
            routing::post(push_routes::register_subscription),
        )
        .route("/api/events", routing::post(notify_routes::create_event))
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Authenticated routes (bearer token required — Principal extractor validates it)
    let authenticated_routes = Router::new()
        .route(
            "/api/push/subscriptions/{id}",
            routing::put(push_routes::update_subscription).delete(push_routes::delete_subscription),
        )
        .route("/api/notifications", routing::get(notify_routes::list_notifications))
        .route(
            "/api/notifications/read-all",
            routing::post(notify_routes::mark_all_read),
        )
        .route(
            "/api/notifications/{id}/read",
            routing::post(notify_routes::mark_read),
        )
        .route("/api/presence/online", routing::get(presence::get_online_users));

    // WebSocket endpoint (auth via query param, not bearer header)
    let ws_routes = Router::new().route("/ws", routing::get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", routing::get(health_check));

    Router::new()
        .merge(limited_routes)
        .merge(authenticated_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_verifier,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
