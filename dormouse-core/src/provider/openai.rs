//! OpenAI-compatible provider implementation.
//!
//! Talks to any server exposing `/embeddings` and `/chat/completions` in the
//! OpenAI wire format (OpenAI itself, Azure-style proxies, vLLM, LiteLLM, ...).

use super::retry::send_with_retry;
use super::types::*;
use crate::config::{GenerationOptions, LlmConfig, RetryConfig};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// HTTP provider for OpenAI-compatible APIs.
#[derive(Clone)]
pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    http_client: reqwest::Client,
    request_timeout: Duration,
    retry: RetryConfig,
}

impl fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl OpenAiProvider {
    /// Creates a provider from the LLM section of the config.
    ///
    /// Fails when no API key is configured.
    ///
    /// `timeout_secs` bounds connecting and every read. A non-streaming request
    /// is also bounded as a whole; a streamed answer may run longer as long as
    /// events keep arriving.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ProviderError::Other("API key must not be empty".to_string()))?;

        let request_timeout = Duration::from_secs(config.timeout_secs);
        let http_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()?;

        let mut base_url = config.base_url.clone();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self {
            base_url,
            api_key,
            http_client,
            request_timeout,
            retry: config.retry.clone(),
        })
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = client;
        self
    }

    /// Deadline for a whole request, or `None` when the body is streamed.
    fn total_timeout(&self, stream: bool) -> Option<Duration> {
        (!stream).then_some(self.request_timeout)
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &T,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let total_timeout = self.total_timeout(stream);
        send_with_retry(self.name(), &self.retry, || {
            let mut request = self
                .http_client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body);
            if let Some(timeout) = total_timeout {
                request = request.timeout(timeout);
            }
            request.send()
        })
        .await
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat<'a>(
        &'a self,
        request: ChatRequest,
        mut callback: Box<dyn FnMut(ChatResponse) + Send + 'a>,
    ) -> Result<()> {
        let body = OpenAiChatRequest {
            model: &request.model,
            messages: &request.messages,
            stream: request.stream,
            options: &request.options,
        };

        debug!(
            model = %request.model,
            messages = request.messages.len(),
            stream = request.stream,
            "Sending chat completion request"
        );
        let response = self.post("chat/completions", &body, request.stream).await?;

        if !request.stream {
            let completion = response.json::<OpenAiChatResponse>().await?;
            let choice = completion
                .choices
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::Other("No choices returned".to_string()))?;

            callback(ChatResponse {
                model: completion.model,
                content: choice.message.content.unwrap_or_default(),
                done: true,
            });
            return Ok(());
        }

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let mut model = request.model.clone();

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| ProviderError::Stream(e.to_string()))?;

            if event.data.trim() == "[DONE]" {
                break;
            }

            let chunk = serde_json::from_str::<OpenAiStreamChunk>(&event.data)?;
            if let Some(name) = chunk.model {
                model = name;
            }

            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .unwrap_or_default();

            if !content.is_empty() {
                callback(ChatResponse {
                    model: model.clone(),
                    content,
                    done: false,
                });
            }
        }

        callback(ChatResponse {
            model,
            content: String::new(),
            done: true,
        });

        Ok(())
    }

    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let body = OpenAiEmbedRequest { model, input: texts };
        let response = self.post("embeddings", &body, false).await?;
        let mut embed_response = response.json::<OpenAiEmbedResponse>().await?;

        if embed_response.data.len() != texts.len() {
            return Err(ProviderError::Other(format!(
                "Requested {} embeddings, received {}",
                texts.len(),
                embed_response.data.len()
            )));
        }

        // The API may answer out of order; `index` is authoritative.
        embed_response.data.sort_by_key(|item| item.index);

        Ok(embed_response
            .data
            .into_iter()
            .map(|item| item.embedding)
            .collect())
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// OpenAI-specific request/response types (internal)

#[derive(Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(flatten)]
    options: &'a GenerationOptions,
}

#[derive(Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Serialize)]
struct OpenAiEmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct OpenAiEmbedResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_for(server: &MockServer) -> OpenAiProvider {
        let config = LlmConfig {
            base_url: format!("{}/v1/", server.uri()),
            api_key: Some("sk-test".to_string()),
            retry: RetryConfig {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..LlmConfig::default()
        };
        OpenAiProvider::new(&config).unwrap()
    }

    async fn collect(provider: &OpenAiProvider, request: ChatRequest) -> Vec<ChatResponse> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider
            .chat(
                request,
                Box::new(move |response| sink.lock().unwrap().push(response)),
            )
            .await
            .unwrap();
        let responses = seen.lock().unwrap().clone();
        responses
    }

    fn sse_body(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            let chunk = json!({
                "model": "gpt-4o-mini",
                "choices": [{ "index": 0, "delta": { "content": fragment } }]
            });
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    #[test]
    fn test_new_requires_api_key() {
        let config = LlmConfig::default();
        assert!(matches!(OpenAiProvider::new(&config), Err(ProviderError::Other(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = LlmConfig {
            api_key: Some("sk-very-secret".to_string()),
            ..LlmConfig::default()
        };
        let provider = OpenAiProvider::new(&config).unwrap();
        assert!(!format!("{provider:?}").contains("sk-very-secret"));
    }

    #[test]
    fn test_generation_options_flattened_and_sparse() {
        let messages = vec![Message::user("hi")];
        let options = GenerationOptions {
            temperature: Some(0.5),
            stop: vec!["END".to_string()],
            ..GenerationOptions::default()
        };
        let body = OpenAiChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            stream: false,
            options: &options,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["temperature"], json!(0.5));
        assert_eq!(value["stop"], json!(["END"]));
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("seed").is_none());
        assert_eq!(value["messages"][0]["role"], json!("user"));
    }

    #[test]
    fn test_streamed_requests_have_no_total_deadline() {
        let config = LlmConfig {
            api_key: Some("sk-test".to_string()),
            timeout_secs: 30,
            ..LlmConfig::default()
        };
        let provider = OpenAiProvider::new(&config).unwrap();
        assert_eq!(provider.total_timeout(false), Some(Duration::from_secs(30)));
        assert_eq!(provider.total_timeout(true), None);
    }

    #[tokio::test]
    async fn test_non_streaming_request_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(1_500))
                    .set_body_json(json!({ "data": [{ "index": 0, "embedding": [1.0] }] })),
            )
            .mount(&server)
            .await;

        let config = LlmConfig {
            base_url: format!("{}/v1", server.uri()),
            api_key: Some("sk-test".to_string()),
            timeout_secs: 1,
            retry: RetryConfig {
                max_retries: 0,
                base_delay_ms: 1,
                max_delay_ms: 1,
            },
            ..LlmConfig::default()
        };
        let provider = OpenAiProvider::new(&config).unwrap();
        let result = provider.embed(&["slow".to_string()], "m").await;
        assert!(matches!(result, Err(ProviderError::Request(e)) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_embed_reorders_by_index() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({ "model": "text-embedding-3-small" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    { "object": "embedding", "index": 1, "embedding": [0.0, 1.0] },
                    { "object": "embedding", "index": 0, "embedding": [1.0, 0.0] }
                ],
                "model": "text-embedding-3-small"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let texts = vec!["first".to_string(), "second".to_string()];
        let vectors = provider.embed(&texts, "text-embedding-3-small").await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[tokio::test]
    async fn test_embed_count_mismatch_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "index": 0, "embedding": [1.0] }]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let texts = vec!["a".to_string(), "b".to_string()];
        assert!(provider.embed(&texts, "m").await.is_err());
    }

    #[tokio::test]
    async fn test_embed_empty_input_skips_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        assert!(provider.embed(&[], "m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chat_non_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "stream": false, "temperature": 0.0 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": { "role": "assistant", "content": "Paris is the capital." },
                    "finish_reason": "stop"
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let request = ChatRequest::new("gpt-4o-mini", vec![Message::user("Capital of France?")])
            .with_options(GenerationOptions {
                temperature: Some(0.0),
                ..GenerationOptions::default()
            });
        let responses = collect(&provider, request).await;
        assert_eq!(responses.len(), 1);
        assert!(responses[0].done);
        assert_eq!(responses[0].content, "Paris is the capital.");
    }

    #[tokio::test]
    async fn test_chat_streaming_matches_non_streaming() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body(&["Paris ", "is the ", "capital."])),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({ "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{ "message": { "content": "Paris is the capital." } }]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let messages = vec![Message::user("Capital of France?")];

        let streamed = collect(
            &provider,
            ChatRequest::new("gpt-4o-mini", messages.clone()).with_stream(true),
        )
        .await;
        let fragments: Vec<&str> = streamed
            .iter()
            .filter(|r| !r.done)
            .map(|r| r.content.as_str())
            .collect();
        assert_eq!(fragments, vec!["Paris ", "is the ", "capital."]);
        assert!(streamed.last().unwrap().done);

        let whole = collect(&provider, ChatRequest::new("gpt-4o-mini", messages)).await;
        let streamed_text: String = streamed.iter().map(|r| r.content.as_str()).collect();
        assert_eq!(streamed_text, whole[0].content);
    }

    #[tokio::test]
    async fn test_chat_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{ "message": { "content": "ok" } }]
            })))
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let responses = collect(&provider, ChatRequest::new("gpt-4o-mini", vec![Message::user("hi")])).await;
        assert_eq!(responses[0].content, "ok");
    }

    #[tokio::test]
    async fn test_chat_bad_request_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "model not found", "type": "invalid_request_error" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = provider_for(&server);
        let result = provider
            .chat(
                ChatRequest::new("nope", vec![Message::user("hi")]),
                Box::new(|_| {}),
            )
            .await;
        assert!(matches!(result, Err(ProviderError::Api { status: 400, .. })));
    }
}
