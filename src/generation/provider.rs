//! Streaming completion clients.
//!
//! Both supported APIs stream Server-Sent Events with one JSON document per
//! `data:` line. Anthropic sends text in `content_block_delta` events, the
//! OpenAI chat API in `choices[].delta.content`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::errors::ProviderError;
use crate::store::{ProviderKey, ProviderKind};

pub const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Cooldown applied when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
}

/// A completion provider. `on_chunk` is called for every text delta as it
/// arrives; the full text is returned once the stream ends.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn complete(
        &self,
        request: &CompletionRequest,
        key: &ProviderKey,
        on_chunk: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<String, ProviderError>;
}

pub struct HttpProvider {
    client: reqwest::Client,
    base_url: Option<String>,
    connect_timeout: Duration,
}

impl HttpProvider {
    pub fn new(base_url: Option<String>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("buildforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            connect_timeout,
        })
    }

    fn url(&self, kind: ProviderKind) -> &str {
        match (&self.base_url, kind) {
            (Some(url), _) => url,
            (None, ProviderKind::Anthropic) => ANTHROPIC_MESSAGES_URL,
            (None, ProviderKind::OpenAi) => OPENAI_CHAT_URL,
        }
    }

    fn request_builder(&self, request: &CompletionRequest, key: &ProviderKey) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.url(key.provider));
        match key.provider {
            ProviderKind::Anthropic => builder
                .header("x-api-key", &key.secret)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": request.model,
                    "max_tokens": request.max_tokens,
                    "system": request.system,
                    "stream": true,
                    "messages": [{"role": "user", "content": request.prompt}],
                })),
            ProviderKind::OpenAi => builder.bearer_auth(&key.secret).json(&json!({
                "model": request.model,
                "max_tokens": request.max_tokens,
                "stream": true,
                "messages": [
                    {"role": "system", "content": request.system},
                    {"role": "user", "content": request.prompt},
                ],
            })),
        }
    }

    fn map_send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout {
                secs: self.connect_timeout.as_secs(),
            }
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn complete(
        &self,
        request: &CompletionRequest,
        key: &ProviderKey,
        on_chunk: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> Result<String, ProviderError> {
        let response = self
            .request_builder(request, key)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: truncate(&body, 500),
            });
        }

        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut text = String::new();
        'stream: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_send_error(e))?;
            pending.extend_from_slice(&chunk);
            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(key.provider, line.trim_end())? {
                    SseLine::Text(delta) => {
                        on_chunk(&delta);
                        text.push_str(&delta);
                    }
                    SseLine::Done => break 'stream,
                    SseLine::Skip => {}
                }
            }
        }
        debug!(provider = %key.provider, bytes = text.len(), "Provider stream finished");
        Ok(text)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Text(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    ContentBlockDelta { delta: AnthropicDelta },
    MessageStop,
    Error { error: AnthropicErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
}

#[derive(Deserialize, Default)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn parse_sse_line(kind: ProviderKind, line: &str) -> Result<SseLine, ProviderError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    match kind {
        ProviderKind::Anthropic => {
            let event: AnthropicEvent = serde_json::from_str(data)
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            match event {
                AnthropicEvent::ContentBlockDelta {
                    delta: AnthropicDelta::TextDelta { text },
                } => Ok(SseLine::Text(text)),
                AnthropicEvent::MessageStop => Ok(SseLine::Done),
                AnthropicEvent::Error { error } => Err(ProviderError::Http {
                    status: 529,
                    body: error.message,
                }),
                _ => Ok(SseLine::Skip),
            }
        }
        ProviderKind::OpenAi => {
            let chunk: OpenAiChunk = serde_json::from_str(data)
                .map_err(|e| ProviderError::Malformed(e.to_string()))?;
            let text: String = chunk
                .choices
                .into_iter()
                .filter_map(|c| c.delta.content)
                .collect();
            if text.is_empty() {
                Ok(SseLine::Skip)
            } else {
                Ok(SseLine::Text(text))
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_text_delta() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        assert_eq!(
            parse_sse_line(ProviderKind::Anthropic, line).unwrap(),
            SseLine::Text("Hello".into())
        );
    }

    #[test]
    fn test_anthropic_other_events_skipped() {
        for line in [
            "event: content_block_delta",
            r#"data: {"type":"message_start","message":{"id":"m"}}"#,
            r#"data: {"type":"ping"}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
            "",
        ] {
            assert_eq!(parse_sse_line(ProviderKind::Anthropic, line).unwrap(), SseLine::Skip);
        }
        assert_eq!(
            parse_sse_line(ProviderKind::Anthropic, r#"data: {"type":"message_stop"}"#).unwrap(),
            SseLine::Done
        );
    }

    #[test]
    fn test_anthropic_error_event() {
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let err = parse_sse_line(ProviderKind::Anthropic, line).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Overloaded"));
    }

    #[test]
    fn test_openai_delta_and_done() {
        let line = r#"data: {"id":"c","choices":[{"index":0,"delta":{"content":"fn "}}]}"#;
        assert_eq!(
            parse_sse_line(ProviderKind::OpenAi, line).unwrap(),
            SseLine::Text("fn ".into())
        );
        let role_only = r#"data: {"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(ProviderKind::OpenAi, role_only).unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line(ProviderKind::OpenAi, "data: [DONE]").unwrap(), SseLine::Done);
    }

    #[test]
    fn test_malformed_data_line() {
        let err = parse_sse_line(ProviderKind::OpenAi, "data: {not json").unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_url_override() {
        let provider = HttpProvider::new(Some("http://localhost:9999/v1".into()), Duration::from_secs(5)).unwrap();
        assert_eq!(provider.url(ProviderKind::Anthropic), "http://localhost:9999/v1");
        let provider = HttpProvider::new(None, Duration::from_secs(5)).unwrap();
        assert_eq!(provider.url(ProviderKind::OpenAi), OPENAI_CHAT_URL);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("ééé", 3), "é...");
    }
}
