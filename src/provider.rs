use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use futures_util::StreamExt;
use log::{debug, error, info};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ProviderSettings;
use crate::error::{RelayError, Result};
use crate::rubric::Rubric;
use crate::sse::{parse_upstream_line, LineBuffer, UpstreamEvent};

/// Incremental text from the provider, in generation order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send + 'static>>;

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

/// Builds the rubric prompt around an image URL and submits it to an
/// OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct CritiqueClient {
    client: Client,
    streaming_client: Client,
    settings: ProviderSettings,
    rubric: Rubric,
}

impl CritiqueClient {
    pub fn new(settings: ProviderSettings, rubric: Rubric) -> Result<Self> {
        let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;
        // No whole-request timeout here; the forwarder owns the deadline.
        let streaming_client = Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            streaming_client,
            settings,
            rubric,
        })
    }

    pub fn rubric(&self) -> &Rubric {
        &self.rubric
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }

    pub fn build_request(&self, image_url: &str, stream: bool) -> ChatRequest {
        ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: json!(self.rubric.system_prompt()),
                },
                ChatMessage {
                    role: "user",
                    content: json!([
                        { "type": "text", "text": self.rubric.user_prompt() },
                        { "type": "image_url", "image_url": { "url": image_url } }
                    ]),
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            stream,
        }
    }

    async fn send(&self, client: &Client, request: &ChatRequest) -> Result<reqwest::Response> {
        let mut builder = client
            .post(self.endpoint())
            .header("Content-Type", "application/json")
            .header("User-Agent", "inkcritic/0.1");

        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }
        if !self.settings.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.settings.api_key));
        }

        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| RelayError::analyze(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("Provider API error {}: {}", status, error_text);
            return Err(RelayError::analyze(format!("HTTP {}: {}", status, error_text)));
        }

        Ok(response)
    }

    /// Single-shot mode: the complete critique text.
    pub async fn critique(&self, image_url: &str) -> Result<String> {
        let request = self.build_request(image_url, false);
        info!("Sending critique request with model: {}", request.model);

        let response = self.send(&self.client, &request).await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| RelayError::analyze(format!("invalid response body: {}", e)))?;

        if let Some(usage) = &body.usage {
            info!(
                "Token usage - Prompt: {}, Completion: {}, Total: {}",
                usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
            );
        }

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(RelayError::analyze("empty response from provider"));
        }
        Ok(text)
    }

    /// Streaming mode. Fails up front on connection or status errors; after
    /// that, errors arrive as items of the stream.
    pub async fn critique_stream(&self, image_url: &str) -> Result<FragmentStream> {
        let request = self.build_request(image_url, true);
        info!("Sending streaming critique request with model: {}", request.model);

        let response = self.send(&self.streaming_client, &request).await?;
        Ok(decode_fragments(response.bytes_stream()))
    }
}

/// Turns a provider SSE body into fragments. Stops at `[DONE]` or at the end
/// of the body.
pub fn decode_fragments<S, B, E>(body: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = Box::pin(body);
        let mut lines = LineBuffer::new();
        let mut received = 0usize;

        while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Error reading upstream stream: {}", e);
                    yield Err(RelayError::analyze(format!("stream read failed: {}", e)));
                    return;
                }
            };
            for line in lines.push(bytes.as_ref()) {
                match parse_upstream_line(&line) {
                    Some(UpstreamEvent::Done) => {
                        debug!("Upstream stream completed with [DONE], {} bytes of text", received);
                        return;
                    }
                    Some(UpstreamEvent::Delta(content)) => {
                        received += content.len();
                        yield Ok(content);
                    }
                    None => {}
                }
            }
        }

        if let Some(line) = lines.finish() {
            if let Some(UpstreamEvent::Delta(content)) = parse_upstream_line(&line) {
                received += content.len();
                yield Ok(content);
            }
        }

        info!("Upstream stream finished, {} bytes of text", received);
    };
    Box::pin(stream)
}
