use std::{sync::Arc, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

use huntart_gateway::auth::{token::AccessTokenVerifier, Authenticator};
use huntart_gateway::broadcast::{BroadcastLayer, MemoryBroadcast, PgBroadcast};
use huntart_gateway::config::{BroadcastBackend, GatewayConfig};
use huntart_gateway::metrics::{self, GatewayMetrics};
use huntart_gateway::store::{migrations::run_migrations, pool, ChatStore, UserStore};
use huntart_gateway::ws::{self, subsystems::SessionServices, GatewayState};

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;
const REQUEST_ID_HEADER: &str = "x-request-id";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .context("invalid HUNTART_GATEWAY_LOG_FILTER directive")?,
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set HUNTART_GATEWAY_JWT_SECRET in production");
    }

    let metrics_registry = Arc::new(GatewayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&metrics_registry));

    let authenticator = Authenticator::new(
        AccessTokenVerifier::new(&config.jwt_secret).context("invalid gateway JWT secret")?,
    );

    let services = build_services(&config).await?;
    let state = GatewayState { services, authenticator, metrics: metrics_registry };
    let app = apply_middleware(ws::router(state));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting chat gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited unexpectedly")
}

async fn build_services(config: &GatewayConfig) -> anyhow::Result<SessionServices> {
    let (users, chats, broadcast): (UserStore, ChatStore, Arc<dyn BroadcastLayer>) =
        match &config.database_url {
            Some(database_url) => {
                let pool = pool::connect(database_url, &config.db)
                    .await
                    .context("failed to initialize gateway PostgreSQL pool")?;
                run_migrations(&pool).await?;

                let broadcast: Arc<dyn BroadcastLayer> = match config.broadcast_backend {
                    BroadcastBackend::Postgres => Arc::new(
                        PgBroadcast::connect(pool.clone())
                            .await
                            .context("failed to start postgres broadcast backend")?,
                    ),
                    BroadcastBackend::Memory => Arc::new(MemoryBroadcast::new()),
                };

                (UserStore::Postgres(pool.clone()), ChatStore::Postgres(pool), broadcast)
            }
            None => {
                warn!("no HUNTART_GATEWAY_DATABASE_URL set; using in-memory stores");
                (UserStore::memory(), ChatStore::memory(), Arc::new(MemoryBroadcast::new()))
            }
        };

    Ok(SessionServices {
        users,
        chats,
        broadcast,
        read_flush_interval: config.read_flush_interval,
    })
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
