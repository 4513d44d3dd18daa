//! Turns ranked matches and a completion into a cited, scored answer.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::GenerationError;
use crate::models::{
    ChatMessage, ChatbotResponse, Completion, DocumentMatch, FinishReason, Role, SourceCitation,
};
use crate::utils::text::preview;

/// Confidence reported when an answer had no supporting clauses.
pub const NO_MATCH_CONFIDENCE: f32 = 0.1;
pub const NO_MATCH_ANSWER: &str = "抱歉，在保險條款中沒有找到與您問題相關的內容。請換個方式描述問題，或直接聯繫客服人員。";
const SNIPPET_CHARS: usize = 200;

const SYSTEM_PROMPT: &str = "你是一個專業的旅遊不便險諮詢助手，專門協助客戶理解保險條款和理賠相關問題。

**你的職責:**
1. 根據提供的保險條款準確回答客戶問題
2. 提供清楚、易懂的解釋
3. 指出相關的條款編號和具體規定
4. 如果需要其他文件或程序，要明確說明

**重要原則:**
- 只根據提供的條款內容回答，不要編造資訊
- 如果條款中沒有明確規定，要誠實說明
- 用繁體中文回答
- 保持專業、友善的語氣";

/// Opaque chat-completion backend.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GenerationError>;

    fn model_name(&self) -> &str;
}

/// `0.6 * mean score + 0.3 * min(1, n / 3) + 0.1 * finish factor`, clamped to [0, 1].
/// With no matches the result is always [`NO_MATCH_CONFIDENCE`].
pub fn compute_confidence(matches: &[DocumentMatch], finish_reason: &FinishReason) -> f32 {
    if matches.is_empty() {
        return NO_MATCH_CONFIDENCE;
    }

    let mean_score = matches.iter().map(|m| m.score).sum::<f32>() / matches.len() as f32;
    let count_factor = (matches.len() as f32 / 3.0).min(1.0);
    let finish_factor = if finish_reason.is_truncated() { 0.8 } else { 1.0 };

    let confidence = 0.6 * mean_score + 0.3 * count_factor + 0.1 * finish_factor;
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn clause_label(m: &DocumentMatch) -> String {
    let meta = &m.document.metadata;
    let number = if meta.clause_number.starts_with(|c: char| c.is_ascii_digit()) {
        format!("第{}條", meta.clause_number)
    } else {
        meta.clause_number.clone()
    };
    match meta.clause_title.as_deref().filter(|t| !t.is_empty()) {
        Some(title) => format!("{} {}", number, title),
        None => number,
    }
}

/// Context block handed to the model, one entry per match.
pub fn build_context(matches: &[DocumentMatch]) -> String {
    matches
        .iter()
        .map(|m| {
            format!(
                "【{}】(相關度: {:.2})\n來源: {}\n內容: {}\n",
                clause_label(m),
                m.score,
                m.document.metadata.source_file,
                m.document.content()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// System prompt, the last `history_window` user/assistant turns, then the question.
pub fn build_messages(
    query: &str,
    context: &str,
    history: &[ChatMessage],
    history_window: usize,
) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];

    let turns: Vec<&ChatMessage> = history
        .iter()
        .filter(|m| matches!(m.role, Role::User | Role::Assistant))
        .collect();
    let skip = turns.len().saturating_sub(history_window);
    messages.extend(turns.into_iter().skip(skip).cloned());

    messages.push(ChatMessage::user(format!(
        "保險條款資料:\n{}\n客戶問題: {}\n\n請根據上述條款資料，提供專業、準確的回答。請記得引用相關條款編號。",
        context, query
    )));
    messages
}

pub fn citations(matches: &[DocumentMatch]) -> Vec<SourceCitation> {
    matches
        .iter()
        .map(|m| SourceCitation {
            clause_number: m.document.metadata.clause_number.clone(),
            source_file: m.document.metadata.source_file.clone(),
            content_snippet: preview(m.document.content(), SNIPPET_CHARS),
            relevance_score: m.score,
            chunk_id: m.document.chunk_id.clone(),
        })
        .collect()
}

pub struct ResponseAssembler {
    provider: Arc<dyn CompletionProvider>,
    history_window: usize,
}

impl ResponseAssembler {
    pub fn new(provider: Arc<dyn CompletionProvider>, history_window: usize) -> Self {
        Self {
            provider,
            history_window,
        }
    }

    /// Answer `query` from `matches`. Without matches the provider is not called.
    pub async fn answer(
        &self,
        query: &str,
        matches: &[DocumentMatch],
        history: &[ChatMessage],
    ) -> Result<ChatbotResponse, GenerationError> {
        let start = Instant::now();

        if matches.is_empty() {
            debug!(query = %query, "no matches, answering without the model");
            return ChatbotResponse::new(
                query,
                NO_MATCH_ANSWER,
                Vec::new(),
                NO_MATCH_CONFIDENCE,
                start.elapsed().as_secs_f64(),
                self.provider.model_name(),
            );
        }

        let context = build_context(matches);
        let messages = build_messages(query, &context, history, self.history_window);
        let completion = self.provider.complete(&messages).await?;

        let confidence = compute_confidence(matches, &completion.finish_reason);
        let response = ChatbotResponse::new(
            query,
            completion.content,
            citations(matches),
            confidence,
            start.elapsed().as_secs_f64(),
            completion.model,
        )?
        .with_token_usage(completion.token_usage);

        info!(
            sources = response.sources.len(),
            confidence = response.confidence(),
            tokens = response.token_usage.total_tokens,
            "answer assembled"
        );
        Ok(response)
    }
}
