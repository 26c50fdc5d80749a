use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use crate::stream::{parse_sse_line, SseParsed, StreamEvent};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client. The only provider this substrate wires
/// up — no OAuth, no tool calling, no extended thinking, plain `x-api-key`
/// auth against `{base_url}/v1/messages`.
pub struct AnthropicLlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicLlmClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl LlmProvider for AnthropicLlmClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = build_body(req, false);
        debug!(model = %req.model, "sending unary request to Anthropic");
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if let Some(err) = rate_limit_error(&resp) {
            return Err(err);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api { status, message: text });
        }

        let api_resp: ApiResponse = resp.json().await.map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(to_chat_response(api_resp))
    }

    async fn send_stream(
        &self,
        req: &ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_body(req, true);
        debug!(model = %req.model, "sending streaming request to Anthropic");
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if let Some(err) = rate_limit_error(&resp) {
            return Err(err);
        }
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error on stream open");
            return Err(ProviderError::Api { status, message: text });
        }

        process_sse_stream(resp, tx).await;
        Ok(())
    }
}

fn rate_limit_error(resp: &reqwest::Response) -> Option<ProviderError> {
    if resp.status().as_u16() != 429 {
        return None;
    }
    let retry_after_ms = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| secs * 1000)
        .unwrap_or(5_000);
    Some(ProviderError::RateLimited { retry_after_ms })
}

fn build_body(req: &ChatRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| json!({ "role": m.role.to_string(), "content": m.content.render() }))
        .collect();
    json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "system": req.system,
        "messages": messages,
        "stream": stream,
    })
}

fn to_chat_response(resp: ApiResponse) -> ChatResponse {
    let content = resp
        .content
        .into_iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Unknown => None,
        })
        .collect::<Vec<_>>()
        .join("");
    ChatResponse {
        content,
        model: resp.model,
        tokens_in: resp.usage.input_tokens,
        tokens_out: resp.usage.output_tokens,
        stop_reason: resp.stop_reason.unwrap_or_default(),
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// Consume Anthropic's `text/event-stream` body and translate its named
/// events into `StreamEvent`s. The teacher's `anthropic_stream` module this
/// was split from no longer exists in this substrate, so frame assembly is
/// done directly against `resp.bytes_stream()` here, reusing only the
/// `parse_sse_line` primitive from `stream.rs`.
async fn process_sse_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut byte_stream = resp.bytes_stream();
    let mut buf = String::new();
    let mut model = String::new();
    let mut tokens_in: u32 = 0;
    let mut tokens_out: u32 = 0;
    let mut stop_reason = String::new();

    loop {
        let chunk = match byte_stream.next().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(StreamEvent::Error { message: e.to_string() }).await;
                return;
            }
            None => break,
        };
        buf.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buf.find("\n\n") {
            let block: String = buf.drain(..pos + 2).collect();
            for line in block.lines() {
                let Some(SseParsed::Data(data)) = parse_sse_line(line) else { continue };
                if data == "[DONE]" {
                    continue;
                }
                let Ok(event): Result<serde_json::Value, _> = serde_json::from_str(&data) else {
                    continue;
                };
                match event.get("type").and_then(|t| t.as_str()) {
                    Some("message_start") => {
                        if let Some(m) = event["message"]["model"].as_str() {
                            model = m.to_string();
                        }
                        if let Some(t) = event["message"]["usage"]["input_tokens"].as_u64() {
                            tokens_in = t as u32;
                        }
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event["delta"]["text"].as_str() {
                            if tx.send(StreamEvent::TextDelta { text: text.to_string() }).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some("message_delta") => {
                        if let Some(t) = event["usage"]["output_tokens"].as_u64() {
                            tokens_out = t as u32;
                        }
                        if let Some(r) = event["delta"]["stop_reason"].as_str() {
                            stop_reason = r.to_string();
                        }
                    }
                    Some("message_stop") => {
                        let _ = tx
                            .send(StreamEvent::Done {
                                model: model.clone(),
                                tokens_in,
                                tokens_out,
                                stop_reason: stop_reason.clone(),
                            })
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    // Stream closed without an explicit message_stop: surface what we have.
    let _ = tx
        .send(StreamEvent::Done { model, tokens_in, tokens_out, stop_reason })
        .await;
}
