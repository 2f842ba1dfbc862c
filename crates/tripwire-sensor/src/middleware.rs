//! axum middleware that classifies every request of a monitored app.
//!
//! The middleware reads the request into a [`RequestDescriptor`] (buffering
//! form, JSON and multipart bodies up to a limit), lets the handler run, then
//! classifies the request and appends any detection to the event log. It
//! never rejects a request because of a detection.
//!
//! A body over the limit is answered with 413 without reaching the handler.
//! The request is still counted and classified: multipart part headers are
//! read from the stream with file content drained, so upload names are
//! checked whatever the body size.
//!
//! Apply it with [`axum::Router::layer`] after all routes and the fallback are
//! registered, so `MatchedPath` tells routed requests apart from misses. A
//! routed path answered with 405 counts as a miss too.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::multipart::Field;
use axum::extract::{ConnectInfo, Form, FromRequest, MatchedPath, Multipart, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header, request::Parts};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::StreamExt;
use tracing::{debug, error, warn};
use tripwire_core::AttackEvent;

use crate::client_ip::{ClientIp, client_ip};
use crate::detect::{Classifier, RequestDescriptor, UploadedFile};
use crate::geo::{self, GeoResolver};
use crate::writer::EventWriter;

/// Request handling limits for the middleware.
#[derive(Debug, Clone)]
pub struct SensorConfig {
    /// Largest body the middleware buffers for inspection.
    /// Default: 10 MiB
    pub max_body_bytes: usize,

    /// Honor `X-Forwarded-For` / `X-Real-IP`.
    /// Default: true
    pub trust_proxy_headers: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
            trust_proxy_headers: true,
        }
    }
}

/// Classifier, geo lookup and event log bundled for use as router state.
#[derive(Clone)]
pub struct Sensor {
    classifier: Arc<Classifier>,
    writer: Arc<EventWriter>,
    geo: Arc<dyn GeoResolver>,
    config: SensorConfig,
}

impl Sensor {
    pub fn new(
        classifier: Classifier,
        writer: EventWriter,
        geo: Arc<dyn GeoResolver>,
        config: SensorConfig,
    ) -> Self {
        Self {
            classifier: Arc::new(classifier),
            writer: Arc::new(writer),
            geo,
            config,
        }
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn writer(&self) -> &EventWriter {
        &self.writer
    }

    /// Classify a request and build the event it would produce.
    pub fn evaluate(&self, req: &RequestDescriptor) -> Option<AttackEvent> {
        let detection = self.classifier.classify(req)?;

        metrics::counter!("sensor_events_detected_total", "category" => detection.category.as_str())
            .increment(1);
        warn!(
            category = %detection.category,
            ip = %req.client_ip,
            method = %req.method,
            path = %req.path,
            details = %detection.details,
            "attack detected"
        );

        Some(AttackEvent {
            timestamp: Utc::now(),
            category: detection.category,
            source_ip: req.client_ip.to_string(),
            method: req.method.clone(),
            path: req.url(),
            user_agent: req
                .user_agent
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            details: detection.details,
            geo: geo::resolve(self.geo.as_ref(), req.client_ip),
        })
    }

    /// Classify a request and append any detection to the event log.
    ///
    /// Blocks on the log append; async callers should use the middleware.
    pub fn inspect(&self, req: &RequestDescriptor) -> Option<AttackEvent> {
        let event = self.evaluate(req)?;
        self.writer.record(event.clone());
        Some(event)
    }

    async fn observe(&self, req: &RequestDescriptor) {
        if let Some(event) = self.evaluate(req) {
            let writer = self.writer.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || writer.record(event)).await {
                error!(error = %e, "event log task failed");
            }
        }
    }
}

/// Detection middleware, for use with `axum::middleware::from_fn_with_state`.
pub async fn detect(State(sensor): State<Sensor>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(&parts.headers, peer, sensor.config.trust_proxy_headers);
    parts.extensions.insert(ClientIp(ip));

    let mut descriptor = RequestDescriptor::new(parts.method.as_str(), parts.uri.path(), ip);
    descriptor.query = parts.uri.query().map(str::to_string);
    descriptor.user_agent = parts
        .headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Ok(Query(params)) = Query::<HashMap<String, String>>::try_from_uri(&parts.uri) {
        descriptor.params = params;
    }
    let routed = parts.extensions.get::<MatchedPath>().is_some();

    let limit = sensor.config.max_body_bytes;
    let body = match BodyKind::of(&parts.headers) {
        Some(kind) => match buffer_body(&parts.headers, body, limit).await {
            Buffered::Complete(bytes) => {
                kind.inspect(&parts, bytes.clone(), limit, &mut descriptor).await;
                Body::from(bytes)
            }
            Buffered::Overflow(rest) => {
                debug!(limit, "request body over limit");
                if kind == BodyKind::Multipart {
                    read_multipart(replay(&parts, rest), limit, &mut descriptor).await;
                }
                descriptor.route_matched = routed;
                sensor.observe(&descriptor).await;
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            }
            Buffered::Failed => {
                descriptor.route_matched = routed;
                sensor.observe(&descriptor).await;
                return (StatusCode::BAD_REQUEST, "request body could not be read").into_response();
            }
        },
        None => body,
    };

    let response = next.run(Request::from_parts(parts, body)).await;

    descriptor.route_matched = routed && response.status() != StatusCode::METHOD_NOT_ALLOWED;
    sensor.observe(&descriptor).await;
    response
}

/// Result of reading a body up to the inspection limit.
enum Buffered {
    Complete(Bytes),
    /// Over the limit: the bytes already read chained with the unread rest.
    Overflow(Body),
    Failed,
}

async fn buffer_body(headers: &HeaderMap, body: Body, limit: usize) -> Buffered {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Buffered::Overflow(body);
    }

    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut len = 0;
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                len += chunk.len();
                chunks.push(chunk);
                if len > limit {
                    let seen = futures::stream::iter(chunks.into_iter().map(Ok::<_, axum::Error>));
                    return Buffered::Overflow(Body::from_stream(seen.chain(stream)));
                }
            }
            Err(e) => {
                debug!(error = %e, "request body could not be read");
                return Buffered::Failed;
            }
        }
    }

    let mut bytes = Vec::with_capacity(len);
    for chunk in &chunks {
        bytes.extend_from_slice(chunk);
    }
    Buffered::Complete(Bytes::from(bytes))
}

/// Body encodings the middleware knows how to read fields from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Form,
    Json,
    Multipart,
}

impl BodyKind {
    fn of(headers: &HeaderMap) -> Option<Self> {
        let content_type = headers.get(header::CONTENT_TYPE)?.to_str().ok()?;
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/x-www-form-urlencoded" => Some(Self::Form),
            "multipart/form-data" => Some(Self::Multipart),
            m if m == "application/json" || m.ends_with("+json") => Some(Self::Json),
            _ => None,
        }
    }

    /// Merge body fields and upload metadata into the descriptor.
    /// Unparseable bodies are left to the handler to reject.
    async fn inspect(
        self,
        parts: &Parts,
        bytes: Bytes,
        limit: usize,
        descriptor: &mut RequestDescriptor,
    ) {
        match self {
            Self::Form => {
                let request = replay(parts, Body::from(bytes));
                if let Ok(Form(fields)) =
                    Form::<HashMap<String, String>>::from_request(request, &()).await
                {
                    descriptor.params.extend(fields);
                }
            }
            Self::Json => {
                if let Ok(serde_json::Value::Object(map)) = serde_json::from_slice(&bytes) {
                    for (name, value) in map {
                        let value = match value {
                            serde_json::Value::String(s) => s,
                            serde_json::Value::Number(n) => n.to_string(),
                            serde_json::Value::Bool(b) => b.to_string(),
                            _ => continue,
                        };
                        descriptor.params.insert(name, value);
                    }
                }
            }
            Self::Multipart => {
                read_multipart(replay(parts, Body::from(bytes)), limit, descriptor).await;
            }
        }
    }
}

/// Collect upload names and text fields from a multipart body.
///
/// File content is drained chunk by chunk and never kept. Text fields longer
/// than `limit` are skipped.
async fn read_multipart(request: Request, limit: usize, descriptor: &mut RequestDescriptor) {
    let Ok(mut multipart) = Multipart::from_request(request, &()).await else {
        return;
    };
    loop {
        let mut field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "multipart body ended early");
                break;
            }
        };
        let name = field.name().unwrap_or_default().to_string();

        if let Some(file_name) = field.file_name().map(str::to_string) {
            descriptor.uploads.push(UploadedFile {
                field: name,
                file_name,
            });
            if drain(&mut field).await.is_none() {
                break;
            }
            continue;
        }

        let mut text = Vec::new();
        let mut oversized = false;
        loop {
            match field.chunk().await {
                Ok(Some(chunk)) if !oversized && text.len() + chunk.len() <= limit => {
                    text.extend_from_slice(&chunk);
                }
                Ok(Some(_)) => oversized = true,
                Ok(None) => break,
                Err(_) => return,
            }
        }
        if !oversized && let Ok(text) = String::from_utf8(text) {
            descriptor.params.insert(name, text);
        }
    }
}

/// Read a part to its end without keeping it. `None` when the stream failed.
async fn drain(field: &mut Field<'_>) -> Option<()> {
    loop {
        match field.chunk().await {
            Ok(Some(_)) => {}
            Ok(None) => return Some(()),
            Err(e) => {
                debug!(error = %e, "multipart part ended early");
                return None;
            }
        }
    }
}

/// A throwaway copy of the request around `body`, for extractors.
fn replay(parts: &Parts, body: Body) -> Request {
    let mut request = Request::new(body);
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionConfig;
    use axum::body::to_bytes;
    use crate::geo::NoGeo;
    use crate::writer::WriterConfig;
    use axum::Router;
    use axum::routing::{get, post};
    use tempfile::TempDir;
    use tower::ServiceExt;
    use tripwire_core::AttackCategory;

    fn sensor(dir: &TempDir) -> Sensor {
        let writer = EventWriter::open(WriterConfig {
            path: dir.path().join("attacks.jsonl"),
            fsync: false,
        })
        .unwrap();
        Sensor::new(
            Classifier::new(DetectionConfig::default()),
            writer,
            Arc::new(NoGeo),
            SensorConfig::default(),
        )
    }

    async fn echo_username(Form(fields): Form<HashMap<String, String>>) -> String {
        fields.get("username").cloned().unwrap_or_default()
    }

    fn app(sensor: Sensor) -> Router {
        Router::new()
            .route("/", get(|| async { "home" }))
            .route("/login", post(echo_username))
            .route("/upload", post(|| async { "uploaded" }))
            .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
            .layer(axum::middleware::from_fn_with_state(sensor, detect))
    }

    fn logged(sensor: &Sensor) -> Vec<AttackEvent> {
        std::fs::read_to_string(sensor.writer().path())
            .unwrap()
            .lines()
            .map(|l| AttackEvent::from_line(l.as_bytes()).unwrap())
            .collect()
    }

    fn request(method: &str, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("x-forwarded-for", "203.0.113.50")
    }

    #[tokio::test]
    async fn test_benign_request_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let response = app(sensor.clone())
            .oneshot(request("GET", "/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(logged(&sensor).is_empty());
    }

    #[tokio::test]
    async fn test_form_login_injection_is_logged_and_handler_still_runs() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let response = app(sensor.clone())
            .oneshot(
                request("POST", "/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .header(header::USER_AGENT, "sqlmap/1.7")
                    .body(Body::from("username=%27+OR+1%3D1+--&password=x"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"' OR 1=1 --");

        let events = logged(&sensor);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AttackCategory::SqlInjection);
        assert_eq!(events[0].details, "Username: ' OR 1=1 --");
        assert_eq!(events[0].source_ip, "203.0.113.50");
        assert_eq!(events[0].user_agent, "sqlmap/1.7");
        assert_eq!(events[0].method, "POST");
        assert_eq!(events[0].path, "/login");
    }

    #[tokio::test]
    async fn test_json_body_fields_are_inspected() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        app(sensor.clone())
            .oneshot(
                request("POST", "/upload")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"username": "admin' --"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(logged(&sensor)[0].category, AttackCategory::SqlInjection);
    }

    #[tokio::test]
    async fn test_multipart_upload_is_logged_once() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let body = "--XBOUNDARY\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"SHELL.PHP\"\r\n\
            Content-Type: application/octet-stream\r\n\r\n\
            <?php system($_GET['c']); ?>\r\n\
            --XBOUNDARY--\r\n";
        let response = app(sensor.clone())
            .oneshot(
                request("POST", "/upload")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let events = logged(&sensor);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AttackCategory::MaliciousUpload);
        assert_eq!(events[0].details, "File: SHELL.PHP");
    }

    #[tokio::test]
    async fn test_unrouted_request_is_not_found_scan() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let response = app(sensor.clone())
            .oneshot(request("GET", "/wp-login.php?x=1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let events = logged(&sensor);
        assert_eq!(events[0].category, AttackCategory::NotFound);
        assert_eq!(events[0].path, "/wp-login.php?x=1");
        assert_eq!(events[0].user_agent, "Unknown");
    }

    #[tokio::test]
    async fn test_sensitive_path_beats_not_found() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        app(sensor.clone())
            .oneshot(request("GET", "/.env").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(logged(&sensor)[0].category, AttackCategory::Reconnaissance);
    }

    fn limited_sensor(dir: &TempDir, max_body_bytes: usize) -> Sensor {
        let writer = EventWriter::open(WriterConfig {
            path: dir.path().join("attacks.jsonl"),
            fsync: false,
        })
        .unwrap();
        Sensor::new(
            Classifier::new(DetectionConfig::default()),
            writer,
            Arc::new(NoGeo),
            SensorConfig {
                max_body_bytes,
                trust_proxy_headers: true,
            },
        )
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_but_counted() {
        let dir = TempDir::new().unwrap();
        let sensor = limited_sensor(&dir, 8);
        let response = app(sensor.clone())
            .oneshot(
                request("POST", "/login")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("username=someone-long"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(logged(&sensor).is_empty());
        assert_eq!(sensor.classifier().tracked_addresses(), 1);
    }

    #[tokio::test]
    async fn test_oversized_upload_is_still_detected() {
        let dir = TempDir::new().unwrap();
        let sensor = limited_sensor(&dir, 64);
        let body = format!(
            "--XBOUNDARY\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"shell.php\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {}\r\n\
             --XBOUNDARY--\r\n",
            "A".repeat(200)
        );
        let response = app(sensor.clone())
            .oneshot(
                request("POST", "/upload")
                    .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let events = logged(&sensor);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AttackCategory::MaliciousUpload);
        assert_eq!(events[0].details, "File: shell.php");
        assert_eq!(sensor.classifier().tracked_addresses(), 1);
    }

    #[tokio::test]
    async fn test_declared_oversized_body_still_classifies_path() {
        let dir = TempDir::new().unwrap();
        let sensor = limited_sensor(&dir, 16);
        let response = app(sensor.clone())
            .oneshot(
                request("POST", "/admin/import")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, "4096")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(logged(&sensor)[0].category, AttackCategory::Reconnaissance);
    }

    #[tokio::test]
    async fn test_wrong_method_is_not_found_scan() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let response = app(sensor.clone())
            .oneshot(request("GET", "/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let events = logged(&sensor);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].category, AttackCategory::NotFound);
        assert_eq!(events[0].details, "Path: /login");
    }

    #[tokio::test]
    async fn test_handler_not_found_on_routed_path_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let sensor = sensor(&dir);
        let app = Router::new()
            .route("/item", get(|| async { (StatusCode::NOT_FOUND, "no such item") }))
            .layer(axum::middleware::from_fn_with_state(sensor.clone(), detect));
        let response = app
            .oneshot(request("GET", "/item").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(logged(&sensor).is_empty());
    }

    #[test]
    fn test_body_kind() {
        let mut headers = HeaderMap::new();
        assert_eq!(BodyKind::of(&headers), None);
        headers.insert(header::CONTENT_TYPE, "application/json; charset=utf-8".parse().unwrap());
        assert_eq!(BodyKind::of(&headers), Some(BodyKind::Json));
        headers.insert(header::CONTENT_TYPE, "Multipart/Form-Data; boundary=x".parse().unwrap());
        assert_eq!(BodyKind::of(&headers), Some(BodyKind::Multipart));
        headers.insert(header::CONTENT_TYPE, "text/plain".parse().unwrap());
        assert_eq!(BodyKind::of(&headers), None);
    }
}
