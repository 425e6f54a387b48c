//! HTTP serving core.
//!
//! Requests flow through a fixed pipeline, throttle then authenticate then
//! the per-route authorization gates, before any handler body runs. The
//! server owns a shutdown coordinator and a background-task supervisor;
//! `serve` wires them together and runs until the process is signalled.

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use std::{any::Any, future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, time::timeout};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, info_span, Span};
use ulid::Ulid;

pub mod auth;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod shutdown;
pub mod store;
pub mod tasks;

use error::ApiError;
use handlers::{health, resources};
use limiter::{LimiterConfig, RateLimiterRegistry};
use shutdown::ShutdownCoordinator;
use store::{postgres::PgStore, CredentialStore, PermissionStore, ResourceStore};
use tasks::TaskSupervisor;

/// Everything `serve` needs, validated upstream by the CLI layer.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub limiter: LimiterConfig,
    pub drain_timeout: Duration,
    pub task_drain_timeout: Option<Duration>,
    pub cors_trusted_origins: Vec<String>,
}

/// Shared handler state. Storage is behind trait objects so tests can swap
/// in the in-memory store.
#[derive(Clone)]
pub struct AppState {
    pub credentials: Arc<dyn CredentialStore>,
    pub permissions: Arc<dyn PermissionStore>,
    pub resources: Arc<dyn ResourceStore>,
    pub limiter: Arc<RateLimiterRegistry>,
    pub tasks: TaskSupervisor,
}

/// Build the application router with the full middleware pipeline attached.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthcheck", get(health::health))
        .route(
            "/v1/resources",
            post(resources::create).fallback(method_not_allowed),
        )
        .route(
            "/v1/resources/:id",
            get(resources::show)
                .patch(resources::update)
                .delete(resources::remove)
                .fallback(method_not_allowed),
        )
        .fallback(fallback)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CatchPanicLayer::custom(recover_panic))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    limiter::throttle,
                ))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth::authenticate,
                )),
        )
        .with_state(state)
}

async fn fallback() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({
            "error": {
                "code": "method_not_allowed",
                "message": "the method is not supported for this resource",
            }
        })),
    )
        .into_response()
}

/// A handler panic becomes a 500 for that request only; the connection and
/// the process keep serving.
fn recover_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "opaque panic payload".to_string()
    };

    error!(panic = %detail, "request handler panicked");

    ApiError::Internal(anyhow!("request handler panicked")).into_response()
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn cors_layer(origins: &[String]) -> Result<CorsLayer> {
    let mut allowed = Vec::with_capacity(origins.len());
    for origin in origins {
        allowed.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("Invalid CORS origin: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(resources::EXPECTED_VERSION_HEADER),
        ])
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_origin(AllowOrigin::list(allowed)))
}

/// Start the server and run it to completion.
///
/// The first SIGINT or SIGTERM stops the listener, drains in-flight requests
/// under `drain_timeout`, then waits for outstanding background tasks. New
/// work is refused while draining.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the server fails to
/// start, exits before a drain was requested, or misses a drain budget
pub async fn serve(config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(25)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PgStore::new(pool));
    let limiter = Arc::new(RateLimiterRegistry::new(config.limiter));
    let tasks = TaskSupervisor::new();

    let state = AppState {
        credentials: store.clone(),
        permissions: store.clone(),
        resources: store,
        limiter: Arc::clone(&limiter),
        tasks: tasks.clone(),
    };

    if config.limiter.enabled() {
        limiter::spawn_sweeper(limiter);
    }

    let mut app = router(state);
    if !config.cors_trusted_origins.is_empty() {
        app = app.layer(cors_layer(&config.cors_trusted_origins)?);
    }

    let coordinator = ShutdownCoordinator::new();
    coordinator.spawn_signal_listener();

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    let drain_requested = {
        let coordinator = coordinator.clone();
        async move { coordinator.draining().await }
    };

    let mut server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(drain_requested)
        .into_future(),
    );

    tokio::select! {
        result = &mut server => {
            result.context("server task failed")??;
            return Err(anyhow!("server exited before a drain was requested"));
        }
        () = coordinator.draining() => {}
    }

    // In-flight requests get a bounded window; the listener is already
    // closed so nothing new is admitted
    match timeout(config.drain_timeout, &mut server).await {
        Ok(result) => result
            .context("server task failed")?
            .context("error while draining in-flight requests")?,
        Err(_) => {
            server.abort();
            return Err(anyhow!(
                "in-flight requests did not drain within {:?}",
                config.drain_timeout
            ));
        }
    }

    info!("completing background tasks");

    match config.task_drain_timeout {
        Some(budget) => timeout(budget, tasks.drain())
            .await
            .map_err(|_| anyhow!("background tasks did not drain within {budget:?}"))?,
        None => tasks.drain().await,
    }

    coordinator.mark_stopped();

    info!("stopped server");

    Ok(())
}
