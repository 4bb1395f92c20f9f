use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method, header::{AUTHORIZATION, CONTENT_TYPE}};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use sparkie_api::persona::Persona;
use sparkie_api::rate_limit::RateLimiter;
use sparkie_api::relay::ChatRelay;
use sparkie_api::{AppState, AppStateInner, AuthSettings, build_router};
use sparkie_db::Database;
use sparkie_llm::{ImageClient, OpenAiCompatClient};
use sparkie_server::DEFAULT_LOG_FILTER;
use sparkie_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.debug {
        warn!("SPARKIE_DEBUG is on: error details will be sent to clients");
    }

    let db = Arc::new(Database::open(&config.db_path)?);

    let chat_client = OpenAiCompatClient::new(&config.chat_api_key, &config.chat_api_url, &config.chat_model)?;
    let images = ImageClient::new(config.image_api_key.clone(), config.image_api_url.clone())?;
    let relay = ChatRelay::new(
        db.clone(),
        Arc::new(chat_client),
        Persona::new(config.privileged_username.clone()),
    );

    let state: AppState = Arc::new(AppStateInner {
        db,
        auth: AuthSettings {
            jwt_secret: config.jwt_secret.clone(),
            token_ttl: chrono::Duration::minutes(config.jwt_expire_minutes),
        },
        rate_limiter: RateLimiter::new(config.rate_limit_requests, config.rate_limit_window),
        relay,
        images,
        debug: config.debug,
    });

    tokio::spawn(purge_rate_limits(state.clone(), config.rate_limit_window));

    let app = build_router(state)
        .layer(cors(&config.allowed_origins))
        .layer(TraceLayer::new_for_http());

    let addr = config.listen_addr()?;
    info!("Sparkie server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Sparkie server stopped");
    Ok(())
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", o);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true)
}

/// Drops idle rate-limit keys once per window.
async fn purge_rate_limits(state: AppState, every: std::time::Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let purged = state.rate_limiter.purge_idle();
        if purged > 0 {
            debug!("Purged {} idle rate-limit keys", purged);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
