//! Query-time models: ranked matches and their container.

use serde::{Deserialize, Serialize};

use super::document::Chunk;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text format
    #[default]
    Text,
    /// Machine-parseable JSON format
    Json,
    /// Documentation-friendly Markdown format
    Markdown,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            _ => Err(format!("unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

/// One retrieved chunk with its cosine similarity and 1-based rank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMatch {
    pub document: Chunk,
    /// Cosine similarity, always within [0, 1].
    pub score: f32,
    pub rank: u32,
}

impl DocumentMatch {
    pub fn new(document: Chunk, score: f32, rank: u32) -> Self {
        Self {
            document,
            score: clamp_score(score),
            rank,
        }
    }
}

/// Clamp a similarity into [0, 1]; NaN maps to 0.
pub fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Keep matches at or above `threshold`, ordered best first, ranks renumbered from 1.
pub fn apply_threshold(mut matches: Vec<DocumentMatch>, threshold: f32) -> Vec<DocumentMatch> {
    matches.retain(|m| m.score >= threshold);
    matches.sort_by(|a, b| b.score.total_cmp(&a.score));
    for (i, m) in matches.iter_mut().enumerate() {
        m.rank = i as u32 + 1;
    }
    matches
}

/// Result of one `search` call, as shown to users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub query: String,
    pub matches: Vec<DocumentMatch>,
    pub similarity_threshold: f32,
    pub duration_ms: u64,
}

impl SearchResults {
    pub fn new(
        query: String,
        matches: Vec<DocumentMatch>,
        similarity_threshold: f32,
        duration_ms: u64,
    ) -> Self {
        Self {
            query,
            matches,
            similarity_threshold,
            duration_ms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matches.len()
    }
}
