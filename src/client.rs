//! Command-line counterpart of the drawing page: uploads an exported canvas to
//! a running relay and follows the critique stream.

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info};
use parking_lot::Mutex;
use serde::Deserialize;
use url::Url;

use crate::error::{RelayError, Result};
use crate::presentation::{CritiqueBuffer, RequestState, FAILURE_MESSAGE};
use crate::score::{CritiqueReport, ScoreCard};
use crate::sse::FrameDecoder;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// What a finished submission produced.
#[derive(Debug, Clone)]
pub struct Submission {
    pub image_url: String,
    pub critique: CritiqueBuffer,
    /// Only present when the relay answered with a JSON report.
    pub scores: Option<ScoreCard>,
}

/// One user's view of the relay. At most one critique is in flight at a time.
pub struct CritiqueSession {
    http: reqwest::Client,
    server: Url,
    state: Arc<Mutex<RequestState>>,
}

/// Resets a dangling `Streaming` state when a submission is dropped midway.
struct InFlight {
    state: Arc<Mutex<RequestState>>,
}

impl InFlight {
    fn finish(self, next: RequestState) {
        *self.state.lock() = next;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.is_busy() {
            *state = RequestState::Idle;
        }
    }
}

impl CritiqueSession {
    pub fn new(server: &str) -> Result<Self> {
        let server = Url::parse(server)
            .map_err(|e| RelayError::Config(format!("Invalid relay URL {}: {}", server, e)))?;
        Ok(Self {
            http: reqwest::Client::new(),
            server,
            state: Arc::new(Mutex::new(RequestState::Idle)),
        })
    }

    pub fn state(&self) -> RequestState {
        self.state.lock().clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.server
            .join(path)
            .map_err(|e| RelayError::Config(format!("Invalid relay path {}: {}", path, e)))
    }

    fn begin(&self) -> Result<InFlight> {
        let mut state = self.state.lock();
        if state.is_busy() {
            return Err(RelayError::Busy);
        }
        *state = RequestState::Streaming;
        Ok(InFlight {
            state: Arc::clone(&self.state),
        })
    }

    /// Submit an already-exported canvas. The data URL is the snapshot taken
    /// at dispatch; later edits to the canvas do not reach this request.
    ///
    /// `on_update` sees the whole accumulated buffer after every fragment.
    pub async fn submit<F>(&self, data_url: String, json: bool, mut on_update: F) -> Result<Submission>
    where
        F: FnMut(&CritiqueBuffer),
    {
        let in_flight = self.begin()?;
        let result = self.run(&data_url, json, &mut on_update).await;
        match &result {
            Ok(submission) => {
                info!(
                    "Critique received: {} fragments, {} chars",
                    submission.critique.fragments(),
                    submission.critique.text().chars().count()
                );
                in_flight.finish(RequestState::Done);
            }
            Err(e) => {
                error!("Error: {}", e);
                in_flight.finish(RequestState::Error(FAILURE_MESSAGE.to_string()));
            }
        }
        result
    }

    async fn run<F>(&self, data_url: &str, json: bool, on_update: &mut F) -> Result<Submission>
    where
        F: FnMut(&CritiqueBuffer),
    {
        let image_url = self.upload(data_url).await?;
        debug!("Uploaded canvas to {}", image_url);

        let mut request = self
            .http
            .post(self.endpoint("/api/analyze-calligraphy")?)
            .json(&serde_json::json!({ "imageUrl": image_url }));
        if json {
            request = request.header(reqwest::header::ACCEPT, "application/json");
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RelayError::analyze(format!(
                "Relay answered {}",
                response.status()
            )));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/json"))
            .unwrap_or(false);

        let mut critique = CritiqueBuffer::new();
        if is_json {
            let report: CritiqueReport = response.json().await?;
            critique.push(&report.critique);
            on_update(&critique);
            let scores = ScoreCard {
                scores: report.scores,
                average_score: report.average_score,
            };
            return Ok(Submission {
                image_url,
                critique,
                scores: Some(scores),
            });
        }

        let mut decoder = FrameDecoder::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for fragment in decoder.push(&chunk) {
                critique.push(&fragment);
                on_update(&critique);
            }
        }
        for fragment in decoder.finish() {
            critique.push(&fragment);
            on_update(&critique);
        }
        if decoder.malformed() > 0 {
            debug!("Skipped {} malformed frames", decoder.malformed());
        }

        Ok(Submission {
            image_url,
            critique,
            scores: None,
        })
    }

    pub async fn upload(&self, data_url: &str) -> Result<String> {
        let response = self
            .http
            .post(self.endpoint("/api/upload-image")?)
            .json(&serde_json::json!({ "image": data_url }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::upload(format!(
                "Relay answered {}",
                response.status()
            )));
        }
        Ok(response.json::<UploadResponse>().await?.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_relay_url() {
        assert!(matches!(
            CritiqueSession::new("not a url"),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn endpoints_resolve_against_server_root() {
        let session = CritiqueSession::new("http://127.0.0.1:3000/").unwrap();
        assert_eq!(
            session.endpoint("/api/upload-image").unwrap().as_str(),
            "http://127.0.0.1:3000/api/upload-image"
        );
    }

    #[tokio::test]
    async fn second_submission_while_streaming_is_rejected() {
        let session = CritiqueSession::new("http://127.0.0.1:9").unwrap();
        let in_flight = session.begin().unwrap();
        assert!(session.state().is_busy());

        let err = session
            .submit("data:image/png;base64,AA==".into(), false, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Busy));
        assert_eq!(session.state(), RequestState::Streaming);

        in_flight.finish(RequestState::Done);
        assert_eq!(session.state(), RequestState::Done);
    }

    #[test]
    fn dropped_submission_returns_to_idle() {
        let session = CritiqueSession::new("http://127.0.0.1:9").unwrap();
        drop(session.begin().unwrap());
        assert_eq!(session.state(), RequestState::Idle);
    }

    #[tokio::test]
    async fn unreachable_relay_reports_failure_message() {
        let session = CritiqueSession::new("http://127.0.0.1:9").unwrap();
        assert!(session
            .submit("data:image/png;base64,AA==".into(), false, |_| {})
            .await
            .is_err());
        assert_eq!(
            session.state(),
            RequestState::Error(FAILURE_MESSAGE.to_string())
        );
    }
}
