//! API router construction

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_bearer, AuthTokens};
use crate::handlers;
use crate::state::ApiState;

/// Builds the `/api/v1` router. Auth, monitoring routes and CORS follow the
/// configuration the state was created with.
pub fn build_router(state: ApiState) -> Router {
    let config = state.config();
    let enable_auth = config.security.enable_auth;
    let monitoring = config.monitoring.enabled;
    let cors = config.api.enable_cors;
    let tokens = AuthTokens::new(config.security.auth_tokens.iter().cloned());

    let mut protected = Router::new()
        .route("/status", get(handlers::status))
        .route("/config", get(handlers::get_config))
        .route(
            "/servers",
            get(handlers::list_servers).post(handlers::create_server),
        )
        .route(
            "/servers/{name}",
            get(handlers::get_server)
                .put(handlers::update_server)
                .delete(handlers::delete_server),
        )
        .route("/servers/{name}/test", post(handlers::test_server))
        .route("/tunnels", get(handlers::list_tunnels))
        .route("/tunnels/start", post(handlers::start_tunnel))
        .route("/tunnels/stop", post(handlers::stop_tunnel))
        .route("/tunnels/restart", post(handlers::restart_tunnels));

    if monitoring {
        protected = protected
            .route("/metrics", get(handlers::metrics))
            .route("/logs", get(handlers::logs));
    }

    if enable_auth {
        protected = protected.route_layer(middleware::from_fn_with_state(tokens, require_bearer));
    }

    // Health stays reachable without a token
    let api_v1 = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected);

    let mut router = Router::new()
        .nest("/api/v1", api_v1)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors {
        router = router.layer(CorsLayer::permissive());
    }

    router
}
