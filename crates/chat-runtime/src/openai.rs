//! OpenAI-Compatible Completion Provider
//!
//! Streams `/chat/completions` over server-sent events and translates each
//! `data:` frame into provider events. Works with any endpoint speaking the
//! OpenAI wire format (OpenAI, Azure proxies, vLLM, LocalAI).

use std::time::Duration;

use async_trait::async_trait;
use chat_core::{
    error::{ChatError, Result},
    message::{Message, Role},
    provider::{
        CompletionProvider, CompletionRequest, FinishReason, ModelInfo, ProviderEvent, ProviderStream,
        TokenUsage,
    },
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Chunks buffered between the reader task and the dispatcher
const CHANNEL_CAPACITY: usize = 64;

/// Body fields the provider owns; passthrough extras may not replace them
const RESERVED_FIELDS: [&str; 4] = ["model", "messages", "stream", "functions"];

/// OpenAI provider configuration
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Bearer token
    pub api_key: String,

    /// API root, without the trailing `/chat/completions`
    pub base_url: String,

    /// Model used when a request leaves the default in place
    pub default_model: String,

    /// Timeout for establishing the connection
    pub connect_timeout_secs: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".into(),
            default_model: "gpt-3.5-turbo".into(),
            connect_timeout_secs: 30,
        }
    }
}

impl OpenAiConfig {
    /// Read `OPENAI_API_KEY` (required), `OPENAI_BASE_URL`, `OPENAI_MODEL`
    /// and `OPENAI_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ChatError::Config("OPENAI_API_KEY is not set".into()))?;
        let defaults = Self::default();

        Ok(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            default_model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.default_model),
            connect_timeout_secs: std::env::var("OPENAI_TIMEOUT_SECS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(defaults.connect_timeout_secs),
        })
    }
}

/// Streaming provider for OpenAI-compatible chat completions
pub struct OpenAiProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn from_config(config: OpenAiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OpenAiConfig::from_env()?)
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn messages_to_json(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Function => "function",
                };
                let mut message = json!({ "role": role, "content": m.content });
                if let Some(name) = &m.name {
                    message["name"] = json!(name);
                }
                message
            })
            .collect()
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let options = &request.options;
        let model = if options.model.is_empty() {
            self.config.default_model.as_str()
        } else {
            options.model.as_str()
        };

        let mut body = json!({
            "model": model,
            "messages": Self::messages_to_json(&request.messages),
            "stream": true,
        });

        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if !options.stop.is_empty() {
            body["stop"] = json!(options.stop);
        }
        if !request.functions.is_empty() {
            body["functions"] = json!(request.functions);
        }
        for (key, value) in &options.extra {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                tracing::warn!(field = %key, "extra option would override a reserved field, ignored");
                continue;
            }
            body[key.as_str()] = value.clone();
        }

        body
    }
}

/// Map a non-success HTTP status to the matching error
fn map_http_error(status: reqwest::StatusCode, body: &str) -> ChatError {
    match status.as_u16() {
        401 | 403 => {
            tracing::debug!(%body, "authentication failed ({})", status);
            ChatError::Auth(format!("HTTP {}", status))
        }
        429 => ChatError::RateLimited(body.to_string()),
        code if code >= 500 => ChatError::ProviderUnavailable(format!("Server error ({}): {}", status, body)),
        _ => ChatError::Provider(format!("HTTP {}: {}", status, body)),
    }
}

fn map_send_error(err: &reqwest::Error) -> ChatError {
    if err.is_connect() || err.is_timeout() {
        ChatError::ProviderUnavailable(err.to_string())
    } else {
        ChatError::Provider(format!("Request failed: {}", err))
    }
}

/// Result of decoding one SSE `data:` payload
#[derive(Debug, PartialEq)]
pub enum SseFrame {
    /// The `[DONE]` sentinel
    Done,
    Events(Vec<ProviderEvent>),
}

/// Decode one SSE `data:` payload into provider events
pub fn parse_sse_data(data: &str) -> Result<SseFrame> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseFrame::Done);
    }

    let chunk: Value = serde_json::from_str(data)
        .map_err(|e| ChatError::MalformedEvent(format!("{}: {}", e, truncate(data, 80))))?;

    if let Some(error) = chunk.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(ChatError::StreamInterrupted(message.to_string()));
    }

    let mut events = Vec::new();

    if let Some(choice) = chunk.get("choices").and_then(|c| c.get(0)) {
        if let Some(delta) = choice.get("delta") {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                if !content.is_empty() {
                    events.push(ProviderEvent::Token(content.to_string()));
                }
            }

            // Legacy `function_call` deltas
            if let Some(call) = delta.get("function_call") {
                events.push(call_delta(call));
            }

            // Only the first tool call is forwarded
            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for tc in tool_calls {
                    let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0);
                    match tc.get("function") {
                        Some(function) if index == 0 => events.push(call_delta(function)),
                        Some(_) => tracing::debug!(index, "additional tool call fragment ignored"),
                        None => {}
                    }
                }
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            events.push(ProviderEvent::Finished {
                reason: FinishReason::parse(reason),
                usage: parse_usage(&chunk),
            });
        }
    } else if let Some(usage) = parse_usage(&chunk) {
        tracing::debug!(total_tokens = usage.total_tokens, "usage-only chunk");
    }

    Ok(SseFrame::Events(events))
}

fn call_delta(function: &Value) -> ProviderEvent {
    ProviderEvent::FunctionCallDelta {
        name: function.get("name").and_then(Value::as_str).map(str::to_string),
        arguments: function
            .get("arguments")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

fn parse_usage(chunk: &Value) -> Option<TokenUsage> {
    let usage = chunk.get("usage")?;
    let count = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    };
    Some(TokenUsage {
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
        total_tokens: count("total_tokens"),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Splits a byte stream into complete SSE lines.
///
/// Bytes are held raw until a newline arrives, so a multi-byte character
/// split across network chunks is decoded whole.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    /// Append bytes and return the `data:` payloads of every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<String>> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(payload) = data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Payload of a trailing line the server did not terminate
    pub fn flush(&mut self) -> Option<Result<String>> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&rest)
    }
}

fn data_payload(line: &[u8]) -> Option<Result<String>> {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(e) => return Some(Err(ChatError::MalformedEvent(format!("invalid UTF-8 in SSE line: {}", e)))),
    };
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    line.strip_prefix("data:").map(|d| Ok(d.trim_start().to_string()))
}

async fn forward(payload: Result<String>, tx: &mpsc::Sender<Result<ProviderEvent>>) -> bool {
    match payload.and_then(|data| parse_sse_data(&data)) {
        Ok(SseFrame::Done) => false,
        Ok(SseFrame::Events(events)) => {
            for event in events {
                if tx.send(Ok(event)).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(err @ ChatError::MalformedEvent(_)) => tx.send(Err(err)).await.is_ok(),
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            false
        }
    }
}

/// Reader task: pulls bytes off the response until `[DONE]`, a transport
/// error, or the receiving side goes away. A closed receiver ends the task
/// even while the server is silent, which drops the connection.
async fn pump<S, B, E>(bytes: S, tx: mpsc::Sender<Result<ProviderEvent>>)
where
    S: futures::Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut bytes = std::pin::pin!(bytes);
    let mut lines = SseLineBuffer::default();

    loop {
        let chunk = tokio::select! {
            () = tx.closed() => {
                tracing::debug!("completion stream dropped, closing connection");
                return;
            }
            chunk = bytes.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(Err(ChatError::StreamInterrupted(e.to_string()))).await;
                return;
            }
            None => break,
        };

        for payload in lines.push(chunk.as_ref()) {
            if !forward(payload, &tx).await {
                return;
            }
        }
    }

    if let Some(payload) = lines.flush() {
        forward(payload, &tx).await;
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.list_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("OpenAI health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn stream(&self, request: CompletionRequest) -> Result<ProviderStream> {
        let body = self.request_body(&request);
        tracing::debug!(
            model = body["model"].as_str().unwrap_or_default(),
            messages = request.messages.len(),
            "opening completion stream"
        );

        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(response.bytes_stream(), tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let response = self
            .client
            .get(self.endpoint("models"))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(map_http_error(status, &body_text));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ChatError::Provider(format!("Invalid models response: {}", e)))?;

        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(|id| ModelInfo {
                        id: id.to_string(),
                        name: id.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_core::provider::ProviderOptions;
    use chat_core::FunctionDeclaration;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::from_config(OpenAiConfig {
            api_key: "sk-test".into(),
            ..Default::default()
        })
        .unwrap()
    }

    fn events(data: &str) -> Vec<ProviderEvent> {
        match parse_sse_data(data).unwrap() {
            SseFrame::Events(events) => events,
            SseFrame::Done => panic!("unexpected [DONE]"),
        }
    }

    #[test]
    fn test_parse_content_delta() {
        let parsed = events(r#"{"id":"chatcmpl-1","choices":[{"index":0,"delta":{"content":"Hello"}}]}"#);
        assert_eq!(parsed, vec![ProviderEvent::Token("Hello".into())]);
    }

    #[test]
    fn test_parse_done() {
        assert_eq!(parse_sse_data("[DONE]").unwrap(), SseFrame::Done);
    }

    #[test]
    fn test_parse_function_call_delta() {
        let parsed = events(
            r#"{"choices":[{"delta":{"role":"assistant","content":null,"function_call":{"name":"placeTrade","arguments":""}}}]}"#,
        );
        assert_eq!(
            parsed,
            vec![ProviderEvent::FunctionCallDelta {
                name: Some("placeTrade".into()),
                arguments: String::new(),
            }]
        );
    }

    #[test]
    fn test_parse_tool_call_delta_keeps_first_call() {
        let parsed = events(
            r#"{"choices":[{"delta":{"tool_calls":[
                {"index":0,"id":"call_1","function":{"arguments":"{\"ticker\":"}},
                {"index":1,"id":"call_2","function":{"name":"getStockPrice","arguments":""}}
            ]}}]}"#,
        );
        assert_eq!(
            parsed,
            vec![ProviderEvent::FunctionCallDelta {
                name: None,
                arguments: "{\"ticker\":".into(),
            }]
        );
    }

    #[test]
    fn test_parse_finish_with_usage() {
        let parsed = events(
            r#"{"choices":[{"delta":{},"finish_reason":"function_call"}],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        );
        assert_eq!(
            parsed,
            vec![ProviderEvent::Finished {
                reason: FinishReason::FunctionCall,
                usage: Some(TokenUsage {
                    prompt_tokens: 9,
                    completion_tokens: 3,
                    total_tokens: 12,
                }),
            }]
        );
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(parse_sse_data("{not json"), Err(ChatError::MalformedEvent(_))));
    }

    #[test]
    fn test_parse_in_stream_error() {
        let result = parse_sse_data(r#"{"error":{"message":"overloaded"}}"#);
        assert!(matches!(result, Err(ChatError::StreamInterrupted(msg)) if msg == "overloaded"));
    }

    fn payloads(results: Vec<Result<String>>) -> Vec<String> {
        results.into_iter().map(Result::unwrap).collect()
    }

    #[test]
    fn test_line_buffer_splits_across_chunks() {
        let mut lines = SseLineBuffer::default();
        assert!(lines.push(b"data: {\"a\"").is_empty());
        assert_eq!(
            payloads(lines.push(b":1}\r\n\r\n: keep-alive\ndata: [DO")),
            vec!["{\"a\":1}".to_string()]
        );
        assert_eq!(payloads(lines.push(b"NE]\n")), vec!["[DONE]".to_string()]);
        assert!(lines.flush().is_none());
    }

    #[test]
    fn test_line_buffer_flushes_unterminated_line() {
        let mut lines = SseLineBuffer::default();
        assert!(lines.push(b"data: [DONE]").is_empty());
        assert_eq!(lines.flush().unwrap().unwrap(), "[DONE]");
    }

    #[test]
    fn test_line_buffer_keeps_split_multibyte_char() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"€\"}}]}\n".as_bytes();
        let euro = line.iter().position(|b| *b == 0xE2).unwrap();

        let mut lines = SseLineBuffer::default();
        assert!(lines.push(&line[..euro + 1]).is_empty());
        let data = payloads(lines.push(&line[euro + 1..]));

        assert_eq!(events(&data[0]), vec![ProviderEvent::Token("€".into())]);
    }

    #[test]
    fn test_line_buffer_rejects_invalid_utf8() {
        let mut lines = SseLineBuffer::default();
        let result = lines.push(b"data: \xff\xfe\n");
        assert!(matches!(result.as_slice(), [Err(ChatError::MalformedEvent(_))]));
    }

    #[tokio::test]
    async fn test_forward_passes_decode_errors_on() {
        let (tx, mut rx) = mpsc::channel(4);
        let keep_going = forward(Err(ChatError::MalformedEvent("bad".into())), &tx).await;

        assert!(keep_going);
        assert!(matches!(rx.recv().await, Some(Err(ChatError::MalformedEvent(_)))));
    }

    #[tokio::test]
    async fn test_reader_exits_when_stream_dropped() {
        let (tx, rx) = mpsc::channel(4);
        let silent = futures::stream::pending::<std::result::Result<Vec<u8>, std::io::Error>>();
        let reader = tokio::spawn(pump(silent, tx));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("reader task outlived its receiver")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reader_forwards_until_done() {
        let (tx, rx) = mpsc::channel(8);
        let chunks = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n".to_vec()),
        ]);
        pump(chunks, tx).await;

        let received: Vec<_> = ReceiverStream::new(rx).collect().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].as_ref().unwrap(), &ProviderEvent::Token("Hi".into()));
    }

    #[test]
    fn test_http_error_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(map_http_error(StatusCode::UNAUTHORIZED, ""), ChatError::Auth(_)));
        assert!(matches!(map_http_error(StatusCode::TOO_MANY_REQUESTS, ""), ChatError::RateLimited(_)));
        assert!(matches!(
            map_http_error(StatusCode::SERVICE_UNAVAILABLE, ""),
            ChatError::ProviderUnavailable(_)
        ));
        assert!(matches!(map_http_error(StatusCode::BAD_REQUEST, "bad"), ChatError::Provider(_)));
    }

    #[test]
    fn test_request_body() {
        let mut options = ProviderOptions::with_model("gpt-4");
        options.temperature = Some(0.5);
        options.extra.insert("user".into(), json!("wallet-1"));
        let request = CompletionRequest {
            messages: vec![
                Message::system("You are a wallet assistant."),
                Message::function("getStockPrice", "412.50"),
            ],
            functions: vec![FunctionDeclaration {
                name: "getStockPrice".into(),
                description: "Price of a stock".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            options,
        };

        let body = provider().request_body(&request);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["stream"], true);
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["user"], "wallet-1");
        assert_eq!(body["messages"][1]["role"], "function");
        assert_eq!(body["messages"][1]["name"], "getStockPrice");
        assert_eq!(body["functions"][0]["name"], "getStockPrice");
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_extras_cannot_override_reserved_fields() {
        let mut options = ProviderOptions::with_model("gpt-4");
        options.extra.insert("stream".into(), json!(false));
        options.extra.insert("model".into(), json!("other"));
        options.extra.insert("messages".into(), json!([]));
        options.extra.insert("functions".into(), json!(null));
        options.extra.insert("seed".into(), json!(7));
        let request = CompletionRequest {
            messages: vec![Message::user("Buy MSFT")],
            functions: vec![FunctionDeclaration {
                name: "placeTrade".into(),
                description: "Buy or sell shares".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }],
            options,
        };

        let body = provider().request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["model"], "gpt-4");
        assert_eq!(body["messages"][0]["content"], "Buy MSFT");
        assert_eq!(body["functions"][0]["name"], "placeTrade");
        assert_eq!(body["seed"], 7);
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let provider = OpenAiProvider::from_config(OpenAiConfig {
            base_url: "http://localhost:8080/v1/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(provider.endpoint("models"), "http://localhost:8080/v1/models");
    }
}
