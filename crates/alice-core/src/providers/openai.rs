//! OpenAI-compatible Chat Completions streaming client.

use std::collections::VecDeque;
use std::pin::Pin;

use anyhow::Result;
use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use super::reasoning::extract_reasoning;
use super::shared::{
    ModelClient, ProviderError, ProviderErrorKind, ProviderResult, ProviderStream, StreamEvent,
    USER_AGENT, Usage, resolve_api_key, resolve_base_url,
};
use crate::config::Config;
use crate::core::conversation::Message;

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
pub const DEFAULT_BASE_URL: &str = "https://api-inference.modelscope.cn/v1";
pub const API_KEY_ENV: &str = "ALICE_API_KEY";
pub const BASE_URL_ENV: &str = "ALICE_BASE_URL";

/// Chat completions client configuration.
#[derive(Debug, Clone)]
pub struct OpenAIChatConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub enable_thinking: bool,
}

impl OpenAIChatConfig {
    /// Resolves key, endpoint and model from config and environment.
    ///
    /// # Errors
    /// Returns an error if no API key is available or the base URL is invalid.
    pub fn from_config(config: &Config, model: String) -> Result<Self> {
        Ok(Self {
            api_key: resolve_api_key(config.provider.api_key.as_deref(), API_KEY_ENV)?,
            base_url: resolve_base_url(
                config.provider.base_url.as_deref(),
                BASE_URL_ENV,
                DEFAULT_BASE_URL,
            )?,
            model,
            max_tokens: config.max_tokens,
            enable_thinking: config.enable_thinking,
        })
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAIChatClient {
    config: OpenAIChatConfig,
    http: reqwest::Client,
}

impl OpenAIChatClient {
    pub fn new(config: OpenAIChatConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn send_messages_stream(&self, messages: &[Message]) -> Result<ProviderStream> {
        let request = ChatCompletionRequest::new(&self.config, messages);
        let url = format!("{}{}", self.config.base_url, CHAT_COMPLETIONS_PATH);

        tracing::debug!(model = %self.config.model, messages = messages.len(), "chat request");
        let response = self
            .http
            .post(&url)
            .headers(build_headers(&self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::http_status(status.as_u16(), &error_body).into());
        }

        let event_stream = ChatCompletionsSseParser::new(response.bytes_stream());
        Ok(Box::pin(event_stream))
    }
}

impl ModelClient for OpenAIChatClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ProviderStream> {
        self.send_messages_stream(messages).await
    }
}

fn build_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {api_key}"))
            .unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers.insert("user-agent", HeaderValue::from_static(USER_AGENT));
    headers
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(format!("Request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::timeout(format!("Connection failed: {e}"))
    } else if e.is_request() {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Request error: {e}"))
    } else {
        ProviderError::new(ProviderErrorKind::HttpStatus, format!("Network error: {e}"))
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatCompletionMessage<'a>>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    /// ModelScope/Qwen switch for the reasoning channel.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    enable_thinking: bool,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatCompletionMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> ChatCompletionRequest<'a> {
    fn new(config: &'a OpenAIChatConfig, messages: &'a [Message]) -> Self {
        Self {
            model: &config.model,
            messages: messages
                .iter()
                .map(|m| ChatCompletionMessage {
                    role: m.role.wire_name(),
                    content: &m.text,
                })
                .collect(),
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: config.max_tokens,
            enable_thinking: config.enable_thinking,
        }
    }
}

/// Appends a blank line when the body ends so a final event without its
/// trailing separator is still dispatched.
struct SseTerminatedStream<S> {
    inner: S,
    emitted_terminator: bool,
}

impl<S> SseTerminatedStream<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            emitted_terminator: false,
        }
    }
}

impl<S, E> Stream for SseTerminatedStream<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
{
    type Item = std::result::Result<bytes::Bytes, E>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        if self.emitted_terminator {
            return Poll::Ready(None);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(None) => {
                self.emitted_terminator = true;
                Poll::Ready(Some(Ok(bytes::Bytes::from_static(b"\n\n"))))
            }
            other => other,
        }
    }
}

/// SSE parser turning chat completion chunks into [`StreamEvent`]s.
struct ChatCompletionsSseParser<S> {
    inner: EventStream<SseTerminatedStream<S>>,
    pending: VecDeque<StreamEvent>,
    done: bool,
}

impl<S> ChatCompletionsSseParser<S> {
    fn new<E>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    {
        Self {
            inner: SseTerminatedStream::new(stream).eventsource(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn handle_event_data(&mut self, data: &str) -> ProviderResult<()> {
        let trimmed = data.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        if trimmed == "[DONE]" {
            self.done = true;
            return Ok(());
        }

        let value = serde_json::from_str::<Value>(trimmed).map_err(|err| {
            ProviderError::new(
                ProviderErrorKind::Parse,
                format!("Failed to parse SSE JSON: {err}"),
            )
        })?;
        self.handle_chunk(&value);
        Ok(())
    }

    fn handle_chunk(&mut self, value: &Value) {
        // Errors are terminal; nothing after them is forwarded.
        if let Some(error) = value.get("error") {
            let error_type = error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("error")
                .to_string();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string();
            self.pending.push_back(StreamEvent::Error {
                error_type,
                message,
            });
            self.done = true;
            return;
        }

        let first_choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|arr| arr.first());

        if let Some(delta) = first_choice.and_then(|c| c.get("delta")) {
            if let Some(text) = extract_reasoning(delta) {
                self.pending.push_back(StreamEvent::ReasoningDelta { text });
            }
            if let Some(text) = delta.get("content").and_then(Value::as_str)
                && !text.is_empty()
            {
                self.pending.push_back(StreamEvent::TextDelta {
                    text: text.to_string(),
                });
            }
        }

        // Usage usually arrives in a separate final chunk with empty choices.
        let usage = value.get("usage").or_else(|| first_choice?.get("usage"));
        if let Some(usage) = usage.filter(|u| u.is_object()) {
            self.pending.push_back(StreamEvent::Usage(parse_usage(usage)));
        }
    }
}

impl<S, E> Stream for ChatCompletionsSseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::Poll;

        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Err(err) = self.handle_event_data(&event.data) {
                        self.done = true;
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(ProviderError::new(
                        ProviderErrorKind::Parse,
                        format!("SSE stream error: {e}"),
                    ))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let prompt_tokens = field("prompt_tokens");
    let completion_tokens = field("completion_tokens");
    let total_tokens = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt_tokens + completion_tokens);
    Usage {
        total_tokens,
        prompt_tokens,
        completion_tokens,
    }
}
