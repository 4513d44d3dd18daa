//! OpenAI-compatible chat completion client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;
use crate::models::{ChatMessage, Completion, FinishReason, GenerationConfig, TokenUsage};
use crate::services::response::CompletionProvider;
use crate::utils::retry::{RetryConfig, with_retry};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

pub struct HttpCompletionProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryConfig,
}

impl HttpCompletionProvider {
    /// Requires an API key; see `POLICY_RAG_COMPLETION_API_KEY`.
    pub fn new(config: &GenerationConfig) -> Result<Self, GenerationError> {
        let api_key = config.api_key.clone().ok_or_else(|| {
            GenerationError::NotConfigured(format!(
                "no API key; set {}",
                crate::models::COMPLETION_API_KEY_ENV
            ))
        })?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| GenerationError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: config.retry.clone(),
        })
    }

    async fn send(&self, messages: &[ChatMessage]) -> Result<Completion, GenerationError> {
        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    GenerationError::ConnectionError(e.to_string())
                } else {
                    GenerationError::RequestError(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::ServerError(format!(
                "status {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        parse_completion(parsed, &self.model)
    }
}

fn parse_completion(parsed: ChatResponse, requested_model: &str) -> Result<Completion, GenerationError> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::InvalidResponse("response has no choices".to_string()))?;

    let token_usage = parsed
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        })
        .unwrap_or_default();

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        finish_reason: FinishReason::parse(choice.finish_reason.as_deref()),
        token_usage,
        model: parsed.model.unwrap_or_else(|| requested_model.to_string()),
    })
}

#[async_trait]
impl CompletionProvider for HttpCompletionProvider {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GenerationError> {
        with_retry(&self.retry, || self.send(messages)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_api_key() {
        let config = GenerationConfig {
            api_key: None,
            ..Default::default()
        };
        assert!(matches!(
            HttpCompletionProvider::new(&config),
            Err(GenerationError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_request_body_shape() {
        let messages = vec![ChatMessage::system("助手"), ChatMessage::user("班機延誤")];
        let body = serde_json::to_value(ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            temperature: 0.1,
            max_tokens: 1000,
        })
        .unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "班機延誤");
        assert_eq!(body["max_tokens"], 1000);
    }

    #[test]
    fn test_parse_completion() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o-mini-2024-07-18",
                "choices": [{"message": {"role": "assistant", "content": "可以申請。"}, "finish_reason": "length"}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }"#,
        )
        .unwrap();
        let completion = parse_completion(parsed, "gpt-4o-mini").unwrap();
        assert_eq!(completion.content, "可以申請。");
        assert!(completion.finish_reason.is_truncated());
        assert_eq!(completion.token_usage.total_tokens, 15);
        assert_eq!(completion.model, "gpt-4o-mini-2024-07-18");
    }

    #[test]
    fn test_parse_completion_without_choices() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            parse_completion(parsed, "m"),
            Err(GenerationError::InvalidResponse(_))
        ));
    }
}
