use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChunkError;

/// Classification label attached to every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClauseType {
    Exclusion,
    Procedure,
    Coverage,
    General,
}

impl ClauseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClauseType::Exclusion => "exclusion",
            ClauseType::Procedure => "procedure",
            ClauseType::Coverage => "coverage",
            ClauseType::General => "general",
        }
    }
}

impl std::fmt::Display for ClauseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ClauseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exclusion" => Ok(ClauseType::Exclusion),
            "procedure" => Ok(ClauseType::Procedure),
            "coverage" => Ok(ClauseType::Coverage),
            "general" => Ok(ClauseType::General),
            _ => Err(format!("unknown clause type: {}", s)),
        }
    }
}

/// Where a chunk came from inside its policy document.
///
/// Offsets count characters of the cleaned text the chunk was cut from, and
/// `char_end - char_start == chunk_length`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source_file: String,
    pub source_path: String,
    pub section_title: String,
    pub clause_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clause_title: Option<String>,
    pub clause_type: ClauseType,
    pub char_start: usize,
    pub char_end: usize,
    pub chunk_length: usize,
    pub chunk_id: String,
}

/// A retrievable unit of policy text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ChunkRecord")]
pub struct Chunk {
    content: String,
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub chunk_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ChunkRecord {
    content: String,
    metadata: ChunkMetadata,
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    chunk_id: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ChunkRecord> for Chunk {
    type Error = ChunkError;

    fn try_from(record: ChunkRecord) -> Result<Self, Self::Error> {
        if record.content.trim().is_empty() {
            return Err(ChunkError::EmptyContent);
        }
        Ok(Self {
            content: record.content,
            metadata: record.metadata,
            embedding: record.embedding,
            chunk_id: record.chunk_id,
            created_at: record.created_at,
        })
    }
}

impl Chunk {
    /// Deterministic id: the same source span always maps to the same point,
    /// so re-ingesting a document overwrites instead of duplicating.
    pub fn generate_id(source_path: &str, clause_number: &str, start: usize, end: usize) -> String {
        let name = format!("{}:{}:{}:{}", source_path, clause_number, start, end);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    /// Build a chunk. The id in `metadata.chunk_id` becomes the chunk id.
    pub fn new(content: impl Into<String>, metadata: ChunkMetadata) -> Result<Self, ChunkError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ChunkError::EmptyContent);
        }
        Ok(Self {
            chunk_id: metadata.chunk_id.clone(),
            content,
            metadata,
            embedding: None,
            created_at: Utc::now(),
        })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Per-source audit artifact written after chunking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkArtifact {
    pub source_file: String,
    pub total_chunks: usize,
    pub chunks: Vec<ArtifactChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactChunk {
    pub content: String,
    pub metadata: ChunkMetadata,
    pub chunk_id: String,
    pub embedding_shape: Option<Vec<usize>>,
}

impl ChunkArtifact {
    pub fn from_chunks(source_file: impl Into<String>, chunks: &[Chunk]) -> Self {
        Self {
            source_file: source_file.into(),
            total_chunks: chunks.len(),
            chunks: chunks
                .iter()
                .map(|chunk| ArtifactChunk {
                    content: chunk.content.clone(),
                    metadata: chunk.metadata.clone(),
                    chunk_id: chunk.chunk_id.clone(),
                    embedding_shape: chunk.embedding.as_ref().map(|e| vec![e.len()]),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata(clause_number: &str, clause_type: ClauseType) -> ChunkMetadata {
    ChunkMetadata {
        source_file: "policy.txt".to_string(),
        source_path: "/data/policy.txt".to_string(),
        section_title: "全文".to_string(),
        clause_number: clause_number.to_string(),
        clause_title: Some("旅程延誤".to_string()),
        clause_type,
        char_start: 0,
        char_end: 10,
        chunk_length: 10,
        chunk_id: Chunk::generate_id("/data/policy.txt", clause_number, 0, 10),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_generate_id_is_deterministic() {
        let id = Chunk::generate_id("/data/policy.txt", "3", 10, 40);
        assert_eq!(id.len(), 36);
        assert_eq!(id, Chunk::generate_id("/data/policy.txt", "3", 10, 40));
        assert_ne!(id, Chunk::generate_id("/data/policy.txt", "3", 11, 40));
        assert_ne!(id, Chunk::generate_id("/data/other.txt", "3", 10, 40));
    }

    #[test]
    fn test_chunk_rejects_empty_content() {
        let metadata = sample_metadata("1", ClauseType::General);
        assert!(Chunk::new("   \n", metadata.clone()).is_err());
        let chunk = Chunk::new("第1條 總則", metadata).unwrap();
        assert_eq!(chunk.chunk_id, chunk.metadata.chunk_id);
    }

    #[test]
    fn test_chunk_deserialize_enforces_invariant() {
        let chunk = Chunk::new("第1條 總則", sample_metadata("1", ClauseType::General)).unwrap();
        let mut value = serde_json::to_value(&chunk).unwrap();
        assert!(serde_json::from_value::<Chunk>(value.clone()).is_ok());

        value["content"] = serde_json::Value::String(String::new());
        assert!(serde_json::from_value::<Chunk>(value).is_err());
    }

    #[test]
    fn test_clause_type_round_trip_str() {
        for kind in [
            ClauseType::Exclusion,
            ClauseType::Procedure,
            ClauseType::Coverage,
            ClauseType::General,
        ] {
            assert_eq!(kind.as_str().parse::<ClauseType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_artifact_records_embedding_shape() {
        let chunk = Chunk::new("第2條 承保範圍", sample_metadata("2", ClauseType::Coverage))
            .unwrap()
            .with_embedding(vec![0.0; 8]);
        let artifact = ChunkArtifact::from_chunks("policy.txt", &[chunk]);
        assert_eq!(artifact.total_chunks, 1);
        assert_eq!(artifact.chunks[0].embedding_shape, Some(vec![8]));
    }
}
