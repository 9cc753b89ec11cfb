//! Client for an OpenAI-compatible model server. Serves as the classifier
//! fallback (chat completions) and as the embedding provider.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::classifier::{FallbackClassifier, FallbackContext, FallbackVerdict};
use crate::embedding::Embedder;

const CLASSIFY_PROMPT: &str = "You label software development events. \
Reply with a single JSON object {\"label\": string, \"confidence\": number between 0 and 1}. \
Preferred labels: decision, fix, feat, refactor, task, todo, command, file_change, message.";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

pub struct LlmWorker {
    backend_url: String,
    chat_model: String,
    embedding_model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl LlmWorker {
    pub fn new(backend_url: impl Into<String>, chat_model: impl Into<String>, embedding_model: impl Into<String>) -> Self {
        let backend_url = backend_url.into().trim_end_matches('/').to_string();
        info!("LLM worker initialized with backend: {}", backend_url);
        Self {
            backend_url,
            chat_model: chat_model.into(),
            embedding_model: embedding_model.into(),
            api_key: None,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/v1/embeddings", self.backend_url)
    }

    fn post(&self, url: String) -> reqwest::RequestBuilder {
        let request = self.http_client.post(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn complete(&self, messages: Vec<ChatMessage>, max_tokens: u32) -> anyhow::Result<String> {
        let request = ChatCompletionRequest {
            model: self.chat_model.clone(),
            messages,
            max_tokens,
            temperature: 0.0,
            stream: false,
        };
        let response = self
            .post(self.completions_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .ok_or_else(|| anyhow::anyhow!("LLM response has no choices"))
    }

    pub async fn generate_embeddings(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Generating embeddings for {} text(s)", texts.len());
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: texts,
        };
        let response = self
            .post(self.embeddings_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Embedding request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Embedding endpoint returned {}: {}", status, body));
        }
        let mut parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse embedding response: {}", e))?;
        // servers may answer out of order when they carry an index
        if parsed.data.iter().all(|d| d.index.is_some()) {
            parsed.data.sort_by_key(|d| d.index);
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Pull `{label, confidence}` out of a model reply that may wrap the JSON
/// in prose or code fences.
fn parse_verdict(reply: &str) -> anyhow::Result<FallbackVerdict> {
    let start = reply.find('{').ok_or_else(|| anyhow::anyhow!("no JSON object in reply: {}", reply))?;
    let end = reply.rfind('}').ok_or_else(|| anyhow::anyhow!("unterminated JSON in reply: {}", reply))?;
    if end < start {
        return Err(anyhow::anyhow!("malformed JSON in reply: {}", reply));
    }
    let verdict: FallbackVerdict = serde_json::from_str(&reply[start..=end])?;
    Ok(verdict)
}

#[async_trait]
impl FallbackClassifier for LlmWorker {
    async fn classify_fallback(&self, text: &str, context: &FallbackContext) -> anyhow::Result<FallbackVerdict> {
        let mut user = format!("source: {}\nevent: {}", context.source, text);
        if let Some(guess) = &context.rule_guess {
            user.push_str(&format!("\nweak rule guess: {}", guess));
        }
        let messages = vec![
            ChatMessage { role: "system".into(), content: CLASSIFY_PROMPT.into() },
            ChatMessage { role: "user".into(), content: user },
        ];
        let reply = self.complete(messages, 64).await?;
        parse_verdict(&reply)
    }

    fn name(&self) -> &str {
        "llm"
    }
}

#[async_trait]
impl Embedder for LlmWorker {
    async fn embed(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        self.generate_embeddings(texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SourceTag;
    use mockito::Matcher;

    fn context() -> FallbackContext {
        FallbackContext { source: SourceTag::Message, rule_guess: None }
    }

    #[test]
    fn test_parse_verdict_tolerates_fences() {
        let verdict = parse_verdict("```json\n{\"label\": \"decision\", \"confidence\": 0.8}\n```").unwrap();
        assert_eq!(verdict.label, "decision");
        assert!(parse_verdict("no idea").is_err());
    }

    #[tokio::test]
    async fn test_classify_fallback_parses_chat_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({ "model": "tiny", "stream": false })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"label\":\"task\",\"confidence\":0.66}"}}]}"#)
            .create_async()
            .await;

        let worker = LlmWorker::new(server.url(), "tiny", "embed");
        let verdict = worker.classify_fallback("remember to bump the version", &context()).await.unwrap();
        assert_eq!(verdict, FallbackVerdict { label: "task".into(), confidence: 0.66 });
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_backend_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("loading model")
            .create_async()
            .await;

        let worker = LlmWorker::new(server.url(), "tiny", "embed");
        let err = worker.classify_fallback("anything", &context()).await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_embeddings_respect_index_order() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/embeddings")
            .match_header("authorization", "Bearer secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data":[{"index":1,"embedding":[0.0,1.0]},{"index":0,"embedding":[1.0,0.0]}]}"#)
            .create_async()
            .await;

        let worker = LlmWorker::new(server.url(), "tiny", "embed").with_api_key(Some("secret".into()));
        let vectors = worker.embed(vec!["a".into(), "b".into()]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }
}
