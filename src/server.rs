//! HTTP surface of the relay.
//!
//! `tiny_http` accepts connections; each request gets its own worker thread.
//! Async work (storage, provider calls, stream forwarding) runs on the tokio
//! runtime behind `runtime`.

use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tiny_http::{Header, Method, Request, Response, Server};
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::config::{Settings, StorageSettings};
use crate::error::{RelayError, Result};
use crate::forward::{forward, frame_channel, pump_frames};
use crate::provider::CritiqueClient;
use crate::score::{CritiqueReport, LabeledScoreParser, ScoreParser};
use crate::upload::{ImageRelay, Storage};

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Debug, Deserialize)]
struct UploadRequest {
    image: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest {
    image_url: String,
}

pub struct AppState {
    pub relay: ImageRelay<Storage>,
    pub critic: CritiqueClient,
    pub parser: Box<dyn ScoreParser>,
    pub settings: Settings,
    pub runtime: Handle,
}

pub struct RelayServer {
    server: Arc<Server>,
    state: Arc<AppState>,
    addr: SocketAddr,
}

impl RelayServer {
    pub fn bind(settings: Settings, runtime: Handle) -> Result<Self> {
        let server = Server::http(settings.server.bind.as_str())
            .map_err(|e| RelayError::Config(format!("Failed to bind {}: {}", settings.server.bind, e)))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| RelayError::Config("Relay must listen on a TCP address".to_string()))?;

        let fallback_base = format!("http://{}/uploads", addr);
        if let StorageSettings::Local {
            public_base_url: None,
            ..
        } = &settings.storage
        {
            warn!(
                "storage.public_base_url not set; image URLs will point at {} and must be reachable by the provider",
                fallback_base
            );
        }

        let storage = Storage::from_settings(&settings.storage, &fallback_base);
        let relay = ImageRelay::new(storage, settings.storage.key_prefix());
        let critic = CritiqueClient::new(settings.provider.clone(), settings.critique.rubric.rubric())?;

        let state = AppState {
            relay,
            critic,
            parser: Box::new(LabeledScoreParser::default()),
            settings,
            runtime,
        };

        info!("Relay listening on http://{}", addr);
        Ok(Self {
            server: Arc::new(server),
            state: Arc::new(state),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            server: Arc::clone(&self.server),
        }
    }

    /// Serve until the shutdown handle is triggered.
    pub fn run(&self) {
        for request in self.server.incoming_requests() {
            let state = Arc::clone(&self.state);
            let spawned = std::thread::Builder::new()
                .name("relay-worker".to_string())
                .spawn(move || handle_request(&state, request));
            if let Err(e) = spawned {
                error!("Failed to spawn request worker: {}", e);
            }
        }
        info!("Relay stopped");
    }
}

#[derive(Clone)]
pub struct ShutdownHandle {
    server: Arc<Server>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.server.unblock();
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn respond<R: Read>(request: Request, mut response: Response<R>, content_type: &str) {
    if let Some(h) = header("Content-Type", content_type) {
        response.add_header(h);
    }
    if let Err(e) = request.respond(response) {
        warn!("Failed to send response: {}", e);
    }
}

fn respond_json(request: Request, status: u16, body: &serde_json::Value) {
    let response = Response::from_string(body.to_string()).with_status_code(status);
    respond(request, response, "application/json");
}

fn respond_error(request: Request, err: &RelayError) {
    respond_json(
        request,
        err.status_code(),
        &serde_json::json!({ "error": err.wire_message() }),
    );
}

fn read_json<T: DeserializeOwned>(request: &mut Request, limit: u64) -> Result<T> {
    if let Some(len) = request.body_length() {
        if len as u64 > limit {
            return Err(RelayError::bad_request(format!("Body of {} bytes exceeds {}", len, limit)));
        }
    }
    let mut body = Vec::new();
    request
        .as_reader()
        .take(limit + 1)
        .read_to_end(&mut body)?;
    if body.len() as u64 > limit {
        return Err(RelayError::bad_request(format!("Body exceeds {} bytes", limit)));
    }
    serde_json::from_slice(&body).map_err(|e| RelayError::bad_request(e.to_string()))
}

fn wants_json(request: &Request) -> bool {
    request
        .headers()
        .iter()
        .any(|h| h.field.equiv("Accept") && h.value.as_str().contains("application/json"))
}

fn handle_request(state: &AppState, request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();
    let path = url.split('?').next().unwrap_or("/").to_string();
    info!("{} {}", method, path);

    match (&method, path.as_str()) {
        (Method::Get, "/") | (Method::Get, "/index.html") => {
            respond(request, Response::from_string(INDEX_HTML), "text/html; charset=utf-8");
        }
        (Method::Get, p) if p.starts_with("/uploads/") => {
            serve_upload(state, request, &p["/uploads/".len()..]);
        }
        (Method::Post, "/api/upload-image") => handle_upload(state, request),
        (Method::Post, "/api/analyze-calligraphy") => handle_analyze(state, request),
        _ => respond_json(request, 404, &serde_json::json!({ "error": "Not found" })),
    }
}

fn handle_upload(state: &AppState, mut request: Request) {
    let body: UploadRequest = match read_json(&mut request, state.settings.server.max_body_bytes) {
        Ok(body) => body,
        Err(e) => {
            warn!("Rejected upload: {}", e);
            return respond_error(request, &e);
        }
    };

    match state.runtime.block_on(state.relay.upload_data_url(&body.image)) {
        Ok(url) => respond_json(request, 200, &serde_json::json!({ "url": url })),
        Err(e) => respond_error(request, &e),
    }
}

fn handle_analyze(state: &AppState, mut request: Request) {
    let body: AnalyzeRequest = match read_json(&mut request, state.settings.server.max_body_bytes) {
        Ok(body) => body,
        Err(e) => {
            warn!("Rejected analyze request: {}", e);
            return respond_error(request, &e);
        }
    };

    if !state.settings.critique.streaming || wants_json(&request) {
        return analyze_once(state, request, &body.image_url);
    }

    // The ceiling covers waiting for the provider's response head as well as
    // the stream itself.
    let budget = Duration::from_secs(state.settings.critique.stream_deadline_secs);
    let deadline = Instant::now() + budget;
    let opened = state.runtime.block_on(async {
        tokio::time::timeout_at(deadline, state.critic.critique_stream(&body.image_url))
            .await
            .unwrap_or_else(|_| {
                Err(RelayError::analyze(format!(
                    "provider did not answer within {:?}",
                    budget
                )))
            })
    });
    let fragments = match opened {
        Ok(fragments) => fragments,
        Err(e) => {
            error!("Error opening critique stream: {}", e);
            return respond_error(request, &e);
        }
    };

    let (tx, rx) = frame_channel();
    let remaining = deadline.saturating_duration_since(Instant::now());
    let task = state.runtime.spawn(forward(fragments, tx, remaining));

    let written = pump_frames(rx, request.into_writer());
    match state.runtime.block_on(task) {
        Ok(stats) => info!(
            "Critique stream closed ({:?}): {} frames forwarded, {} written",
            stats.outcome, stats.frames, written
        ),
        Err(e) => error!("Forwarding task failed: {}", e),
    }
}

fn analyze_once(state: &AppState, request: Request, image_url: &str) {
    let result = state.runtime.block_on(async {
        let critique = state.critic.critique(image_url).await?;
        let card = state.parser.parse(&critique, state.critic.rubric());
        debug!("Extracted scores: {:?}", card.scores);
        Ok::<_, RelayError>(CritiqueReport::new(card, critique))
    });

    match result.and_then(|report| serde_json::to_value(report).map_err(|e| RelayError::analyze(e.to_string()))) {
        Ok(json) => respond_json(request, 200, &json),
        Err(e) => {
            error!("Error analyzing image: {}", e);
            respond_error(request, &e)
        }
    }
}

fn serve_upload(state: &AppState, request: Request, raw_key: &str) {
    let Some(store) = state.relay.store().local() else {
        return respond_json(request, 404, &serde_json::json!({ "error": "Not found" }));
    };

    let key = match urlencoding::decode(raw_key) {
        Ok(key) => key.into_owned(),
        Err(_) => return respond_json(request, 400, &serde_json::json!({ "error": "Invalid key" })),
    };

    match state.runtime.block_on(store.get(&key)) {
        Ok(bytes) => {
            let content_type = match key.rsplit('.').next() {
                Some("jpg") => "image/jpeg",
                Some("webp") => "image/webp",
                Some("gif") => "image/gif",
                _ => "image/png",
            };
            let mut response = Response::from_data(bytes);
            if let Some(h) = header("Cache-Control", "public, max-age=3600") {
                response.add_header(h);
            }
            respond(request, response, content_type);
        }
        Err(e) => {
            debug!("Upload {} not served: {}", key, e);
            respond_json(request, 404, &serde_json::json!({ "error": "Not found" }));
        }
    }
}
