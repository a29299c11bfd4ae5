use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use inkcritic::canvas::{ExportOptions, Point, StrokeSession, Surface};
use inkcritic::config::{
    CritiqueSettings, ProviderSettings, ServerSettings, Settings, StorageSettings,
};
use inkcritic::presentation::RequestState;
use inkcritic::rubric::RubricVariant;
use inkcritic::sse::encode_frame;
use inkcritic::{CritiqueReport, CritiqueSession, RelayServer, ShutdownHandle};
use parking_lot::Mutex;
use serde_json::Value;
use tiny_http::{Header, Response, Server};

#[derive(Clone)]
enum Reply {
    Stream(Vec<&'static str>),
    Json(&'static str),
    Fail(u16),
    /// Reads the request, then never answers.
    Hang,
}

/// A chat-completions endpoint that answers every request the same way and
/// records the request bodies.
struct FakeProvider {
    server: Arc<Server>,
    base_url: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeProvider {
    fn start(reply: Reply) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let worker = Arc::clone(&server);
        let seen = Arc::clone(&requests);
        std::thread::spawn(move || {
            for mut request in worker.incoming_requests() {
                let mut body = String::new();
                request.as_reader().read_to_string(&mut body).unwrap();
                seen.lock()
                    .push(serde_json::from_str(&body).unwrap_or(Value::Null));

                if let Reply::Hang = reply {
                    std::thread::sleep(Duration::from_secs(60));
                    continue;
                }
                let response = match &reply {
                    Reply::Stream(deltas) => {
                        let mut sse = String::new();
                        for delta in deltas {
                            let chunk = serde_json::json!({
                                "choices": [{ "delta": { "content": delta } }]
                            });
                            sse.push_str(&format!("data: {}\n\n", chunk));
                        }
                        sse.push_str("data: [DONE]\n\n");
                        Response::from_string(sse).with_header(
                            Header::from_bytes("Content-Type", "text/event-stream").unwrap(),
                        )
                    }
                    Reply::Json(text) => {
                        let body = serde_json::json!({
                            "choices": [{ "message": { "content": text } }],
                            "usage": { "prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30 }
                        });
                        Response::from_string(body.to_string()).with_header(
                            Header::from_bytes("Content-Type", "application/json").unwrap(),
                        )
                    }
                    Reply::Fail(status) => {
                        Response::from_string("{\"error\":\"quota\"}").with_status_code(*status)
                    }
                    Reply::Hang => unreachable!(),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            server,
            base_url: format!("http://{}/v1", addr),
            requests,
        }
    }
}

impl Drop for FakeProvider {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

struct Relay {
    base: String,
    uploads: PathBuf,
    shutdown: ShutdownHandle,
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        let _ = std::fs::remove_dir_all(&self.uploads);
    }
}

fn start_relay(provider: &FakeProvider, streaming: bool) -> Relay {
    start_relay_with_deadline(provider, streaming, 10)
}

fn start_relay_with_deadline(provider: &FakeProvider, streaming: bool, deadline_secs: u64) -> Relay {
    let uploads = std::env::temp_dir().join(format!("inkcritic-it-{}", uuid::Uuid::new_v4()));
    let settings = Settings {
        server: ServerSettings {
            bind: "127.0.0.1:0".to_string(),
            max_body_bytes: 4 << 20,
        },
        provider: ProviderSettings {
            base_url: provider.base_url.clone(),
            api_key: "sk-test".to_string(),
            model: "vision-test".to_string(),
            temperature: 0.7,
            max_tokens: 800,
            connect_timeout_secs: 2,
            request_timeout_secs: 10,
        },
        critique: CritiqueSettings {
            rubric: RubricVariant::Standard,
            streaming,
            stream_deadline_secs: deadline_secs,
        },
        storage: StorageSettings::Local {
            dir: uploads.to_string_lossy().into_owned(),
            key_prefix: "calligraphy".to_string(),
            public_base_url: None,
        },
    };

    let server =
        RelayServer::bind(settings, tokio::runtime::Handle::current()).expect("relay binds");
    let base = format!("http://{}", server.local_addr());
    let shutdown = server.shutdown_handle();
    std::thread::spawn(move || server.run());

    Relay {
        base,
        uploads,
        shutdown,
    }
}

fn sample_strokes() -> StrokeSession {
    let mut session = StrokeSession::new(Surface::new(64, 64, 1.0));
    session.begin_stroke(Point::new(10.0, 10.0));
    session.extend_stroke(Point::new(50.0, 50.0));
    session.end_stroke();
    session
}

#[tokio::test(flavor = "multi_thread")]
async fn uploaded_image_is_served_back_unchanged() {
    let provider = FakeProvider::start(Reply::Fail(500));
    let relay = start_relay(&provider, true);
    let strokes = sample_strokes();
    let options = ExportOptions::default();
    let png = strokes.export_png(&options).unwrap();

    let http = reqwest::Client::new();
    let body: Value = http
        .post(format!("{}/api/upload-image", relay.base))
        .json(&serde_json::json!({ "image": strokes.export_data_url(&options).unwrap() }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = body["url"].as_str().unwrap();
    assert!(url.starts_with(&format!("{}/uploads/calligraphy/", relay.base)));
    assert!(url.ends_with(".png"));

    let fetched = http.get(url).send().await.unwrap();
    assert_eq!(fetched.status(), 200);
    assert_eq!(fetched.headers()["content-type"], "image/png");
    assert_eq!(fetched.bytes().await.unwrap().as_ref(), png.as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_forwards_one_frame_per_fragment() {
    let provider = FakeProvider::start(Reply::Stream(vec!["## 整体评价\n", "", "**结构**：8", "\n- 多练"]));
    let relay = start_relay(&provider, true);

    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze-calligraphy", relay.base))
        .json(&serde_json::json!({ "imageUrl": "https://cdn.example.com/a.png" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    let expected = [encode_frame("## 整体评价\n"), encode_frame("**结构**：8"), encode_frame("\n- 多练")].concat();
    assert_eq!(body, expected);

    let requests = provider.requests.lock();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request["stream"], true);
    assert_eq!(request["model"], "vision-test");
    assert_eq!(
        request["messages"][1]["content"][1]["image_url"]["url"],
        "https://cdn.example.com/a.png"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn client_session_uploads_then_accumulates_the_stream() {
    let provider = FakeProvider::start(Reply::Stream(vec!["## 总结\n", "笔画", "流畅"]));
    let relay = start_relay(&provider, true);
    let mut strokes = sample_strokes();
    let data_url = strokes.export_data_url(&ExportOptions::default()).unwrap();

    let session = CritiqueSession::new(&relay.base).unwrap();
    let mut renders = Vec::new();
    let pending = session.submit(data_url, false, |buffer| renders.push(buffer.text().to_string()));
    // Clearing after dispatch must not change what was sent.
    strokes.clear();
    let submission = pending.await.unwrap();

    assert_eq!(submission.critique.text(), "## 总结\n笔画流畅");
    assert_eq!(renders, vec!["## 总结\n", "## 总结\n笔画", "## 总结\n笔画流畅"]);
    assert!(submission.scores.is_none());
    assert_eq!(session.state(), RequestState::Done);

    let key = submission
        .image_url
        .strip_prefix(&format!("{}/uploads/", relay.base))
        .unwrap();
    let stored = std::fs::read(relay.uploads.join(key)).unwrap();
    assert_eq!(stored, sample_strokes().export_png(&ExportOptions::default()).unwrap());
    assert_eq!(
        provider.requests.lock()[0]["messages"][1]["content"][1]["image_url"]["url"],
        submission.image_url.as_str()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn blank_canvas_is_still_submitted() {
    let provider = FakeProvider::start(Reply::Stream(vec!["未见笔画"]));
    let relay = start_relay(&provider, true);
    let blank = StrokeSession::new(Surface::new(32, 32, 2.0));
    assert!(blank.is_empty());

    let session = CritiqueSession::new(&relay.base).unwrap();
    let submission = session
        .submit(blank.export_data_url(&ExportOptions::default()).unwrap(), false, |_| {})
        .await
        .unwrap();
    assert_eq!(submission.critique.text(), "未见笔画");
}

#[tokio::test(flavor = "multi_thread")]
async fn json_mode_returns_scores() {
    let provider = FakeProvider::start(Reply::Json("## 评分\n**结构**：8.5\n其余尚可"));
    let relay = start_relay(&provider, false);

    let report: CritiqueReport = reqwest::Client::new()
        .post(format!("{}/api/analyze-calligraphy", relay.base))
        .json(&serde_json::json!({ "imageUrl": "https://cdn.example.com/a.png" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(report.scores["structure"], 8.5);
    assert_eq!(report.scores["technique"], 7.0);
    assert_eq!(report.scores.len(), 4);
    assert_eq!(report.average_score, 7.4);
    assert!(report.critique.contains("其余尚可"));
    assert_eq!(provider.requests.lock()[0]["stream"], false);
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_header_selects_json_on_a_streaming_relay() {
    let provider = FakeProvider::start(Reply::Json("**笔法**：6"));
    let relay = start_relay(&provider, true);

    let session = CritiqueSession::new(&relay.base).unwrap();
    let data_url = sample_strokes().export_data_url(&ExportOptions::default()).unwrap();
    let submission = session.submit(data_url, true, |_| {}).await.unwrap();

    let scores = submission.scores.unwrap();
    assert_eq!(scores.scores["technique"], 6.0);
    assert_eq!(submission.critique.text(), "**笔法**：6");
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_failure_is_reported_generically() {
    let provider = FakeProvider::start(Reply::Fail(429));
    let relay = start_relay(&provider, true);

    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze-calligraphy", relay.base))
        .json(&serde_json::json!({ "imageUrl": "https://cdn.example.com/a.png" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Failed to analyze image" }));
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_bodies_and_unknown_routes() {
    let provider = FakeProvider::start(Reply::Fail(500));
    let relay = start_relay(&provider, true);
    let http = reqwest::Client::new();

    let response = http
        .post(format!("{}/api/upload-image", relay.base))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Invalid request body");

    let response = http
        .post(format!("{}/api/upload-image", relay.base))
        .json(&serde_json::json!({ "image": "data:image/png;base64,%%%" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Failed to upload image");

    let response = http.get(format!("{}/nope", relay.base)).send().await.unwrap();
    assert_eq!(response.status(), 404);

    let response = http
        .get(format!("{}/uploads/calligraphy/missing.png", relay.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let page = http.get(&relay.base).send().await.unwrap();
    assert_eq!(page.status(), 200);
    assert!(page.text().await.unwrap().contains("api/analyze-calligraphy"));
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_provider_is_cut_off_at_the_deadline() {
    let provider = FakeProvider::start(Reply::Hang);
    let relay = start_relay_with_deadline(&provider, true, 1);

    let started = Instant::now();
    let response = reqwest::Client::new()
        .post(format!("{}/api/analyze-calligraphy", relay.base))
        .json(&serde_json::json!({ "imageUrl": "https://cdn.example.com/a.png" }))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, serde_json::json!({ "error": "Failed to analyze image" }));
    assert!(elapsed < Duration::from_millis(2500), "took {:?}", elapsed);
}
