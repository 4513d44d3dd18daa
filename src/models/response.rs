//! Answer-side models: chat messages, completions and the final response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Why the completion provider stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Output hit the token limit.
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None | Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
        }
    }

    pub fn is_truncated(&self) -> bool {
        matches!(self, FinishReason::Length)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Raw output of a completion provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub finish_reason: FinishReason,
    pub token_usage: TokenUsage,
    pub model: String,
}

/// A clause cited in an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCitation {
    pub clause_number: String,
    pub source_file: String,
    pub content_snippet: String,
    pub relevance_score: f32,
    pub chunk_id: String,
}

/// Final answer returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ChatbotResponseRecord")]
pub struct ChatbotResponse {
    pub query: String,
    pub answer: String,
    pub sources: Vec<SourceCitation>,
    confidence: f32,
    response_time: f64,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub token_usage: TokenUsage,
}

#[derive(Deserialize)]
struct ChatbotResponseRecord {
    query: String,
    answer: String,
    sources: Vec<SourceCitation>,
    confidence: f32,
    response_time: f64,
    model_used: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    token_usage: TokenUsage,
}

impl TryFrom<ChatbotResponseRecord> for ChatbotResponse {
    type Error = GenerationError;

    fn try_from(record: ChatbotResponseRecord) -> Result<Self, Self::Error> {
        let mut response = ChatbotResponse::new(
            record.query,
            record.answer,
            record.sources,
            record.confidence,
            record.response_time,
            record.model_used,
        )?;
        response.timestamp = record.timestamp;
        response.token_usage = record.token_usage;
        Ok(response)
    }
}

impl ChatbotResponse {
    /// Fails if `confidence` is outside [0, 1] or `response_time` is negative.
    pub fn new(
        query: impl Into<String>,
        answer: impl Into<String>,
        sources: Vec<SourceCitation>,
        confidence: f32,
        response_time: f64,
        model_used: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(GenerationError::InvalidConfidence(confidence));
        }
        if response_time.is_nan() || response_time < 0.0 {
            return Err(GenerationError::InvalidResponseTime(response_time));
        }
        Ok(Self {
            query: query.into(),
            answer: answer.into(),
            sources,
            confidence,
            response_time,
            model_used: model_used.into(),
            timestamp: Utc::now(),
            token_usage: TokenUsage::default(),
        })
    }

    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = usage;
        self
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Seconds spent producing the answer.
    pub fn response_time(&self) -> f64 {
        self.response_time
    }
}
