#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vgo_adapter::{
    AdapterFailure, AdapterRuntime, IngestAdapterRequest, LeaseAdapterRequest,
    OpenWindowAdapterRequest, ProofsAdapterRequest, SupersedeAdapterRequest, WriterAdapterRequest,
    DEFAULT_HTTP_BIND, ENV_HTTP_BIND,
};

type SharedRuntime = State<Arc<AdapterRuntime>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let bind = env::var(ENV_HTTP_BIND).unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string());
    let addr: SocketAddr = bind.parse()?;
    let runtime = Arc::new(AdapterRuntime::default_from_env()?);
    let health = runtime.health_report();

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/windows", post(open_window))
        .route("/windows/:id", get(window))
        .route("/windows/:id/transcript", get(transcript))
        .route("/windows/:id/claim", post(claim))
        .route("/windows/:id/renew", post(renew))
        .route("/windows/:id/release", post(release))
        .route("/windows/:id/watermark", post(watermark))
        .route("/windows/:id/close", post(close))
        .route("/windows/:id/seal", post(seal))
        .route("/windows/:id/proofs", post(proofs))
        .route("/windows/:id/authorize", post(authorize))
        .route("/windows/:id/export", post(export))
        .route("/windows/:id/replay", post(replay))
        .route("/windows/:id/supersede", post(supersede))
        .route("/events", post(ingest))
        .with_state(runtime);

    info!(
        %addr,
        partition_count = health.partition_count,
        trusted_signers = health.trusted_signers,
        "vgo_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

fn respond<T: Serialize>(result: Result<T, AdapterFailure>) -> Response {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(failure) => {
            let status = StatusCode::from_u16(failure.http_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(failure.body)).into_response()
        }
    }
}

async fn healthz(State(runtime): SharedRuntime) -> Response {
    (StatusCode::OK, Json(runtime.health_report())).into_response()
}

async fn open_window(
    State(runtime): SharedRuntime,
    Json(request): Json<OpenWindowAdapterRequest>,
) -> Response {
    respond(runtime.open_window(request, runtime.clock_now()))
}

async fn window(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.window(&id))
}

async fn transcript(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.transcript(&id))
}

async fn ingest(
    State(runtime): SharedRuntime,
    Json(request): Json<IngestAdapterRequest>,
) -> Response {
    respond(runtime.ingest(request, runtime.clock_now()))
}

async fn claim(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    Json(request): Json<LeaseAdapterRequest>,
) -> Response {
    respond(runtime.claim(&id, request, runtime.clock_now()))
}

async fn renew(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    Json(request): Json<LeaseAdapterRequest>,
) -> Response {
    respond(runtime.renew(&id, request, runtime.clock_now()))
}

async fn release(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    Json(request): Json<LeaseAdapterRequest>,
) -> Response {
    respond(runtime.release(&id, request, runtime.clock_now()))
}

async fn watermark(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    Json(request): Json<WriterAdapterRequest>,
) -> Response {
    respond(runtime.advance_watermark(&id, request, runtime.clock_now()))
}

async fn close(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    request: Option<Json<WriterAdapterRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    respond(runtime.close(&id, request, runtime.clock_now()))
}

async fn seal(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.seal(&id, runtime.clock_now()))
}

async fn proofs(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    Json(request): Json<ProofsAdapterRequest>,
) -> Response {
    respond(runtime.submit_proofs(&id, request, runtime.clock_now()))
}

async fn authorize(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.authorize(&id, runtime.clock_now()))
}

async fn export(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.export(&id, runtime.clock_now()))
}

async fn replay(State(runtime): SharedRuntime, Path(id): Path<String>) -> Response {
    respond(runtime.replay(&id, runtime.clock_now()))
}

async fn supersede(
    State(runtime): SharedRuntime,
    Path(id): Path<String>,
    request: Option<Json<SupersedeAdapterRequest>>,
) -> Response {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    respond(runtime.supersede(&id, request, runtime.clock_now()))
}
