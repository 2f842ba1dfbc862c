//! Tripwire sensor demo target.
//!
//! Serves a small decoy web app with the detection middleware in front of
//! every route, and appends classified requests to the event log.
//!
//! # Usage
//!
//! ```bash
//! tripwire-sensor --bind 0.0.0.0:3000 --log-path ./logs/attacks.jsonl
//!
//! # With geolocation and a lower burst threshold
//! tripwire-sensor --geo-table ./geo.json --dos-threshold 50
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Form, Multipart, Path, Query};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use tripwire_sensor::middleware::detect;
use tripwire_sensor::{
    Classifier, DetectionConfig, EventWriter, GeoResolver, GeoTable, NoGeo, Sensor, SensorConfig,
    WriterConfig,
};

/// Decoy web app with attack detection.
#[derive(Parser, Debug)]
#[command(name = "tripwire-sensor")]
#[command(about = "Decoy web app that records attack attempts")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "TRIPWIRE_SENSOR_BIND", default_value = "0.0.0.0:3000")]
    bind: SocketAddr,

    /// Event log path
    #[arg(long, env = "TRIPWIRE_LOG_PATH", default_value = "./logs/attacks.jsonl")]
    log_path: PathBuf,

    /// JSON geo table (`[{start, end, country, city, lat, lon}]`)
    #[arg(long, env = "TRIPWIRE_GEO_TABLE")]
    geo_table: Option<PathBuf>,

    /// Requests per window above which an address is reported
    #[arg(long, env = "TRIPWIRE_DOS_THRESHOLD", default_value = "100")]
    dos_threshold: u64,

    /// Burst window in seconds
    #[arg(long, env = "TRIPWIRE_DOS_WINDOW_SECS", default_value = "60")]
    dos_window_secs: u64,

    /// Object ids above this are treated as enumeration
    #[arg(long, env = "TRIPWIRE_IDOR_THRESHOLD", default_value = "1000")]
    idor_threshold: u64,

    /// Skip fsync after each event (faster, less durable)
    #[arg(long, env = "TRIPWIRE_NO_FSYNC")]
    no_fsync: bool,

    /// Ignore X-Forwarded-For / X-Real-IP
    #[arg(long, env = "TRIPWIRE_IGNORE_PROXY_HEADERS")]
    ignore_proxy_headers: bool,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "TRIPWIRE_METRICS_PORT", default_value = "0")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    if args.metrics_port > 0
        && let Some(handle) = tripwire_core::metrics::try_init_metrics()
    {
        tripwire_core::metrics::start_metrics_server(args.metrics_port, handle).await?;
    }

    let geo: Arc<dyn GeoResolver> = match &args.geo_table {
        Some(path) => Arc::new(
            GeoTable::load(path)
                .with_context(|| format!("failed to load geo table {}", path.display()))?,
        ),
        None => Arc::new(NoGeo),
    };

    let detection = DetectionConfig {
        dos_threshold: args.dos_threshold,
        dos_window: Duration::from_secs(args.dos_window_secs.max(1)),
        id_threshold: args.idor_threshold,
        ..DetectionConfig::default()
    };

    let writer = EventWriter::open(WriterConfig {
        path: args.log_path.clone(),
        fsync: !args.no_fsync,
    })
    .with_context(|| format!("failed to open event log {}", args.log_path.display()))?;

    let sensor = Sensor::new(
        Classifier::new(detection),
        writer,
        geo,
        SensorConfig {
            trust_proxy_headers: !args.ignore_proxy_headers,
            ..SensorConfig::default()
        },
    );

    let app = decoy_routes()
        .layer(axum::middleware::from_fn_with_state(sensor, detect))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                )
            }),
        );

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(addr = %args.bind, log = %args.log_path.display(), "sensor listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

fn decoy_routes() -> Router {
    Router::new()
        .route("/", get(home))
        .route("/login", post(login))
        .route("/settings", get(settings))
        .route("/upload", post(upload))
        .route("/download", get(download))
        .route("/api/user/{id}", get(user))
        .fallback(not_found)
}

async fn home() -> &'static str {
    "CryptoVault Exchange\n\
     POST /login            username, password\n\
     GET  /settings?name=   profile settings\n\
     POST /upload           multipart avatar upload\n\
     GET  /download?file=   account statements\n\
     GET  /api/user/{id}    profile API\n"
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(default)]
    username: String,
}

async fn login(Form(form): Form<LoginForm>) -> impl IntoResponse {
    (
        StatusCode::UNAUTHORIZED,
        format!("invalid credentials for {}", form.username),
    )
}

#[derive(Deserialize)]
struct SettingsQuery {
    name: Option<String>,
}

async fn settings(Query(query): Query<SettingsQuery>) -> String {
    let name = query.name.unwrap_or_else(|| "Guest".to_string());
    format!("settings for {}", name)
}

async fn upload(mut multipart: Multipart) -> impl IntoResponse {
    while let Ok(Some(field)) = multipart.next_field().await {
        if let Some(name) = field.file_name().map(str::to_string) {
            return (StatusCode::OK, format!("file uploaded: {}", name));
        }
    }
    (StatusCode::BAD_REQUEST, "upload failed".to_string())
}

#[derive(Deserialize)]
struct DownloadQuery {
    file: Option<String>,
}

async fn download(Query(query): Query<DownloadQuery>) -> impl IntoResponse {
    match query.file.as_deref() {
        Some("statement.pdf") => (StatusCode::OK, "statement placeholder".to_string()),
        Some(other) => (StatusCode::NOT_FOUND, format!("file not found: {}", other)),
        None => (StatusCode::BAD_REQUEST, "missing file parameter".to_string()),
    }
}

async fn user(Path(id): Path<String>) -> impl IntoResponse {
    Json(serde_json::json!({
        "id": id,
        "username": format!("user{}", id),
        "balance": "1.5 BTC",
    }))
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
