use axum::{
    routing::{any, get},
    Router,
};
use rust_crm_resilience::config::Config;
use rust_crm_resilience::gateway_client::CrmClient;
use rust_crm_resilience::handlers::{self, AppState};
use rust_crm_resilience::state_store;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the ops service.
///
/// This function initializes:
/// - Logging and tracing.
/// - Configuration loading.
/// - The state store (Postgres or in-process).
/// - The resilient CRM client.
/// - HTTP routes and middleware (CORS, body limit, inbound rate limiting).
///
/// It then starts the Axum server.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_crm_resilience=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    // Shared state for rate limits, analytics and health history
    let store = state_store::from_config(&config).await?;
    tracing::info!("State store ready ({})", store.backend());

    let client = CrmClient::new(&config, store)?;
    tracing::info!("✓ CRM client initialized: {}", config.crm_base_url);

    let app_state = Arc::new(AppState {
        client,
        config: config.clone(),
    });

    // Configure inbound rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid inbound rate limit configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/v1/health", get(handlers::crm_health))
        .route("/api/v1/health/history", get(handlers::health_history))
        .route("/api/v1/diagnostics", get(handlers::diagnostics))
        .route("/api/v1/analytics", get(handlers::analytics))
        .route("/api/v1/crm/*endpoint", any(handlers::crm_passthrough))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Liveness bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
