use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use contact_form_core::{
    client_identifier, join_field_errors, now_utc, validate_submission, FieldErrors,
    MessageRecord, NewMessage, RateLimiter, Submission,
};
use contact_form_store_sqlite::SqliteContactStore;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const PAGE_HTML: &str = include_str!("../assets/index.html");
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

const INVALID_JSON_MESSAGE: &str = "Invalid JSON payload.";
const RATE_LIMITED_MESSAGE: &str = "Too many submissions. Please wait 15 seconds and try again.";
const STORAGE_FAILURE_MESSAGE: &str = "Could not save your message. Please try again later.";

/// Opens the message store on demand; every call gets its own connection.
#[derive(Debug, Clone)]
struct ContactApi {
    db_path: PathBuf,
}

impl ContactApi {
    fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn ensure_schema(&self) -> Result<()> {
        SqliteContactStore::open(&self.db_path)?.ensure_schema()
    }

    fn save_message(&self, message: &NewMessage) -> Result<MessageRecord> {
        let mut store = SqliteContactStore::open(&self.db_path)?;
        store.ensure_schema()?;
        store.insert(message)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: ContactApi,
    rate_limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ContactAccepted {
    ok: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    tracked_clients: usize,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    accepted_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    rate_limited_total: AtomicU64,
    storage_error_total: AtomicU64,
    timeout_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    accepted_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    rate_limited_total: u64,
    storage_error_total: u64,
    timeout_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "contact-form-service")]
#[command(about = "Contact form page and submission endpoint")]
struct Args {
    #[arg(long, default_value = "./contact.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:5555")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u64).range(1..))]
    sweep_interval_secs: u64,
    /// Key the rate limit on the first `X-Forwarded-For` entry. Only safe
    /// behind a reverse proxy that sets the header.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    trust_forwarded_for: bool,
    #[arg(long)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        debug!(code = self.code, status = self.status.as_u16(), "contact request failed");
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

impl ServiceState {
    fn failure(status: StatusCode, code: &'static str, message: impl Into<String>) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into() }
    }

    fn invalid_json(&self, detail: &str) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        debug!(detail, "rejected contact payload that is not a JSON object");
        Self::failure(StatusCode::BAD_REQUEST, "invalid_json", INVALID_JSON_MESSAGE)
    }

    fn validation_failed(&self, errors: &FieldErrors) -> ServiceFailure {
        self.telemetry.record_failure("validation_error", false);
        let message = join_field_errors(errors);
        debug!(fields = errors.len(), %message, "rejected invalid contact submission");
        Self::failure(StatusCode::BAD_REQUEST, "validation_error", message)
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.operation_timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn rate_limited(&self, client_ip: &str) -> ServiceFailure {
        self.telemetry.record_failure("rate_limited", false);
        info!(client_ip, "contact submission throttled");
        Self::failure(StatusCode::TOO_MANY_REQUESTS, "rate_limited", RATE_LIMITED_MESSAGE)
    }

    /// Runs a storage operation on the blocking pool, bounded by the
    /// operation timeout. Every failure maps to a 500 with a generic message;
    /// the underlying cause is only logged.
    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(ContactApi) -> anyhow::Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure("storage_timeout", true);
                error!(
                    operation = operation_label,
                    timeout_ms = self.timeout_ms(),
                    "storage operation timed out"
                );
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_timeout",
                    STORAGE_FAILURE_MESSAGE,
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            error!(operation = operation_label, "storage worker join failure: {err}");
            Self::failure(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", STORAGE_FAILURE_MESSAGE)
        })?;

        op_result.map_err(|err| {
            self.telemetry.record_failure("storage_error", false);
            error!(operation = operation_label, "storage operation failed: {err:#}");
            Self::failure(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", STORAGE_FAILURE_MESSAGE)
        })
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "rate_limited" => {
                self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.storage_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            storage_error_total: self.storage_error_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
        }
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/contact", post(submit_contact))
        .route("/healthz", get(health))
        .with_state(state)
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn spawn_rate_limit_sweeper(rate_limiter: Arc<RateLimiter>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = rate_limiter.sweep(now_utc());
            if removed > 0 {
                debug!(removed, remaining = rate_limiter.tracked_clients(), "swept rate-limit entries");
            }
        }
    });
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
                return;
            }
            Err(err) => warn!("failed to register SIGTERM handler: {err}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let api = ContactApi::new(args.db.clone());
    api.ensure_schema()
        .with_context(|| format!("failed to prepare database at {}", args.db.display()))?;

    let state = ServiceState {
        api,
        rate_limiter: Arc::new(RateLimiter::default()),
        trust_forwarded_for: args.trust_forwarded_for,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    spawn_rate_limit_sweeper(
        Arc::clone(&state.rate_limiter),
        Duration::from_secs(args.sweep_interval_secs),
    );

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    info!(
        bind = %args.bind,
        db = %args.db.display(),
        trust_forwarded_for = args.trust_forwarded_for,
        "contact form service listening"
    );

    axum::serve(listener, app(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await?;
    info!("contact form service stopped");
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(PAGE_HTML)
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timeout_ms: state.timeout_ms(),
        tracked_clients: state.rate_limiter.tracked_clients(),
        telemetry: state.telemetry.snapshot(),
    })
}

/// Decodes the body as a JSON object. Content type is not checked.
fn parse_submission(body: &[u8]) -> Result<Submission, String> {
    let value: serde_json::Value = serde_json::from_slice(body).map_err(|err| err.to_string())?;
    if !value.is_object() {
        return Err("payload is not a JSON object".to_string());
    }
    serde_json::from_value(value).map_err(|err| err.to_string())
}

async fn submit_contact(
    State(state): State<ServiceState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ContactAccepted>, ServiceFailure> {
    state.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);

    let submission = parse_submission(&body).map_err(|detail| state.invalid_json(&detail))?;

    let errors = validate_submission(&submission);
    if !errors.is_empty() {
        return Err(state.validation_failed(&errors));
    }

    let forwarded_for = headers.get(FORWARDED_FOR_HEADER).and_then(|value| value.to_str().ok());
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    let client_ip = client_identifier(forwarded_for, peer, state.trust_forwarded_for);

    let now = now_utc();
    if !state.rate_limiter.admit(&client_ip, now) {
        return Err(state.rate_limited(&client_ip));
    }

    // The limiter has already advanced; a storage failure below still
    // consumes this client's window.
    let message = NewMessage::from_submission(submission.normalized(), client_ip.clone(), now);
    let record = state
        .run_blocking("save_message", move |api| api.save_message(&message))
        .await?;

    state.telemetry.accepted_total.fetch_add(1, Ordering::Relaxed);
    info!(message_id = record.id, client_ip = %client_ip, "contact message stored");
    Ok(Json(ContactAccepted { ok: true }))
}
