//! HTTP client for DeepSeek's OpenAI-compatible Chat Completions API.
//!
//! Only the streaming endpoint is used: every completion is requested with
//! `stream: true` and decoded from server-sent `data:` lines.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, RETRY_AFTER};
use serde_json::{Value, json};

use crate::config::{Config, RetryPolicy};
use crate::llm_client::{DeltaStream, LlmClient, ProviderError};
use crate::logging;
use crate::models::{Message, Role};

// === Types ===

/// Client for DeepSeek's OpenAI-compatible APIs.
#[derive(Clone)]
#[must_use]
pub struct DeepSeekClient {
    http_client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: Option<String>,
}

impl std::fmt::Debug for DeepSeekClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeepSeekClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

// === DeepSeekClient ===

impl DeepSeekClient {
    /// Create a DeepSeek client from server configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config.deepseek_api_key()?;
        let base_url = config.deepseek_base_url();
        let retry = config.retry_policy();

        logging::info(format!("DeepSeek base URL: {base_url}"));
        logging::info(format!(
            "Retry policy: enabled={}, max_retries={}, initial_delay={}s, max_delay={}s",
            retry.enabled, retry.max_retries, retry.initial_delay, retry.max_delay
        ));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))?,
        );

        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            retry,
            model: config.model(),
            temperature: config.temperature(),
            max_tokens: config.max_tokens(),
            system_prompt: config.system_prompt(),
        })
    }

    fn build_body(&self, messages: &[Message]) -> Value {
        json!({
            "model": self.model,
            "messages": build_chat_messages(self.system_prompt.as_deref(), messages),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": true,
        })
    }
}

// === Trait Implementations ===

#[async_trait]
impl LlmClient for DeepSeekClient {
    fn provider_name(&self) -> &'static str {
        "deepseek"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_completion(&self, messages: &[Message]) -> Result<DeltaStream, ProviderError> {
        let body = self.build_body(messages);
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response =
            send_with_retry(&self.retry, || self.http_client.post(&url).json(&body)).await?;

        let byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            use futures_util::StreamExt;

            let mut decoder = SseDataDecoder::default();
            let mut byte_stream = std::pin::pin!(byte_stream);

            'read: while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(ProviderError::NetworkError(format!("Stream read error: {e}")));
                        break;
                    }
                };

                for data in decoder.push(&chunk) {
                    if data.trim() == "[DONE]" {
                        break 'read;
                    }
                    match parse_sse_chunk(&data) {
                        Ok(Some(delta)) => yield Ok(delta),
                        Ok(None) => {}
                        Err(err) => {
                            yield Err(err);
                            break 'read;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

// === Chat Message Helpers ===

fn build_chat_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt {
        out.push(json!({ "role": "system", "content": system }));
    }
    for message in messages {
        let text = message.content.to_text();
        // Assistant turns that produced nothing add no context.
        if message.role == Role::Ai && text.is_empty() {
            continue;
        }
        out.push(json!({
            "role": message.role.chat_role(),
            "content": text,
        }));
    }
    out
}

// === SSE Chunk Parser ===

/// Splits a byte stream into the `data:` payloads of complete SSE events.
///
/// Works on raw bytes so multi-byte characters split across network chunks
/// are reassembled before decoding.
#[derive(Debug, Default)]
struct SseDataDecoder {
    byte_buf: Vec<u8>,
    data_buf: Option<String>,
}

impl SseDataDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.byte_buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline_pos) = self.byte_buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.byte_buf.drain(..=newline_pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(data) = self.data_buf.take() {
                    events.push(data);
                }
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.strip_prefix(' ').unwrap_or(data);
                match self.data_buf.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(data);
                    }
                    None => self.data_buf = Some(data.to_string()),
                }
            }
            // Ignore other SSE fields (event:, id:, retry:) and comments.
        }

        events
    }
}

/// Extract the text delta from one Chat Completions chunk.
///
/// Chunks that are not JSON at all are skipped. An `error` object, or a delta
/// whose `content` is neither a string nor null, ends the stream.
fn parse_sse_chunk(data: &str) -> Result<Option<String>, ProviderError> {
    let Ok(chunk) = serde_json::from_str::<Value>(data) else {
        tracing::debug!(chunk = data, "skipping undecodable stream chunk");
        return Ok(None);
    };

    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string);
        return Err(ProviderError::Other(message));
    }

    let content = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("delta"))
        .and_then(|delta| delta.get("content"));
    match content {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) if text.is_empty() => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.clone())),
        Some(other) => Err(ProviderError::ParseError(format!(
            "delta content is not a string: {other}"
        ))),
    }
}

// === Retry Helpers ===

async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> Result<reqwest::Response, ProviderError>
where
    F: FnMut() -> reqwest::RequestBuilder,
{
    let mut attempt: u32 = 0;

    loop {
        let err = match build().send().await {
            Ok(response) if response.status().is_success() => return Ok(response),
            Ok(response) => error_from_response(response).await,
            Err(err) => ProviderError::NetworkError(err.to_string()),
        };

        if !err.is_retryable() || !policy.enabled || attempt >= policy.max_retries {
            return Err(err);
        }
        logging::warn(format!(
            "{err} (attempt {} of {})",
            attempt + 1,
            policy.max_retries + 1
        ));

        let backoff = policy.delay_for_attempt(attempt);
        let delay = err
            .retry_after()
            .map_or(backoff, |secs| {
                Duration::from_secs(secs).min(Duration::from_secs_f64(policy.max_delay.max(0.0)))
            });
        attempt += 1;
        logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
        tokio::time::sleep(delay).await;
    }
}

/// Classify a non-success response, honoring a numeric `Retry-After` header.
async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    ProviderError::from_status(status, &body).with_retry_after(retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use futures_util::StreamExt;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn sse_body(deltas: &[&str]) -> String {
        let mut body = String::new();
        for delta in deltas {
            let chunk = json!({ "choices": [{ "index": 0, "delta": { "content": delta } }] });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn test_config(base_url: String) -> Config {
        Config {
            api_key: Some("sk-test".to_string()),
            base_url: Some(base_url),
            retry: Some(RetryConfig {
                enabled: Some(true),
                max_retries: Some(2),
                initial_delay: Some(0.0),
                max_delay: Some(0.0),
                exponential_base: Some(2.0),
            }),
            ..Config::default()
        }
    }

    async fn collect(stream: DeltaStream) -> Vec<Result<String, ProviderError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "stream": true, "model": "deepseek-chat" })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["Hel", "", "lo"])),
            )
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let deltas: Vec<String> = collect(
            client
                .stream_completion(&[Message::human("Hello")])
                .await
                .unwrap(),
        )
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let err = client
            .stream_completion(&[Message::human("hi")])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::AuthenticationError(ref m) if m == "invalid key"));
    }

    #[tokio::test]
    async fn server_errors_are_retried_before_first_byte() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["ok"])),
            )
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let results = collect(
            client
                .stream_completion(&[Message::human("hi")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), "ok");
    }

    #[tokio::test]
    async fn in_stream_error_payload_fails_the_stream() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}\n\n",
            json!({ "choices": [{ "delta": { "content": "part" } }] }),
            json!({ "error": { "message": "overloaded" } })
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let results = collect(
            client
                .stream_completion(&[Message::human("hi")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap(), "part");
        assert!(matches!(&results[1], Err(ProviderError::Other(m)) if m == "overloaded"));
    }

    #[test]
    fn decoder_reassembles_split_lines_and_utf8() {
        let mut decoder = SseDataDecoder::default();
        let payload = "data: {\"text\":\"héllo\"}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xC3).unwrap() + 1;
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events, vec!["{\"text\":\"héllo\"}".to_string()]);
    }

    #[test]
    fn decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDataDecoder::default();
        let events = decoder.push(b": keep-alive\n\nevent: chunk\nid: 7\ndata: a\ndata: b\n\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn chat_messages_prepend_system_and_skip_empty_assistant_turns() {
        let messages = vec![
            Message::human("first"),
            Message::ai(""),
            Message::human("second"),
        ];
        let built = build_chat_messages(Some("be nice"), &messages);
        assert_eq!(
            built,
            vec![
                json!({ "role": "system", "content": "be nice" }),
                json!({ "role": "user", "content": "first" }),
                json!({ "role": "user", "content": "second" }),
            ]
        );
    }

    #[tokio::test]
    async fn rate_limit_reports_retry_after_when_retries_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "0")
                    .set_body_string("slow down"),
            )
            .expect(3)
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let err = client
            .stream_completion(&[Message::human("hi")])
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            ProviderError::RateLimited { ref message, retry_after: Some(0) } if message == "slow down"
        ));
    }

    #[tokio::test]
    async fn retries_disabled_returns_first_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(server.uri());
        if let Some(retry) = config.retry.as_mut() {
            retry.enabled = Some(false);
        }
        let client = DeepSeekClient::new(&config).unwrap();
        let err = client
            .stream_completion(&[Message::human("hi")])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::ServerError { status: 502, .. }));
    }

    #[tokio::test]
    async fn mistyped_delta_content_fails_the_stream() {
        let server = MockServer::start().await;
        let body = format!(
            "data: {}\n\ndata: {}\n\n",
            json!({ "choices": [{ "delta": { "content": "ok" } }] }),
            json!({ "choices": [{ "delta": { "content": 42 } }] })
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = DeepSeekClient::new(&test_config(server.uri())).unwrap();
        let results = collect(
            client
                .stream_completion(&[Message::human("hi")])
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[1], Err(ProviderError::ParseError(_))));
    }

    #[test]
    fn parse_sse_chunk_skips_role_only_and_garbage() {
        assert_eq!(
            parse_sse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(
            parse_sse_chunk(r#"{"choices":[{"delta":{"content":null}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_sse_chunk("not json").unwrap(), None);
        assert_eq!(
            parse_sse_chunk(r#"{"choices":[{"delta":{"content":"x"}}]}"#).unwrap(),
            Some("x".to_string())
        );
    }
}
