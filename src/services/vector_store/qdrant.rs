//! Qdrant backend. One collection holds every namespace; the namespace is a
//! keyword payload field applied as a filter on every read and delete.
//! Point ids are derived from namespace and chunk id, so the same chunk
//! ingested into two namespaces lands in two points.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    DeletePointsBuilder, Distance, FieldType, Filter, PointId, PointStruct, PointsIdsList,
    SearchPointsBuilder, UpsertPointsBuilder, Value, VectorParamsBuilder, value::Kind,
};
use tracing::debug;
use uuid::Uuid;

use super::{IndexStats, VectorIndex, rank_matches, require_embedding, stored_content};
use crate::error::VectorStoreError;
use crate::models::{
    Chunk, ChunkMetadata, ClauseType, DocumentMatch, VectorDriver, VectorStoreConfig,
};

pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
    namespace: String,
    dimension: usize,
}

impl QdrantIndex {
    pub fn new(config: &VectorStoreConfig, dimension: usize) -> Result<Self, VectorStoreError> {
        let mut builder = Qdrant::from_url(&config.url);

        if let Some(ref api_key) = config.api_key {
            builder = builder.api_key(api_key.clone());
        }

        let client = builder
            .build()
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            collection: config.collection.clone(),
            namespace: config.namespace.clone(),
            dimension,
        })
    }

    /// Point id of `chunk_id` inside this namespace.
    fn point_id(&self, chunk_id: &str) -> String {
        let name = format!("{}/{}", self.namespace, chunk_id);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }

    fn namespace_filter(&self) -> Filter {
        Filter::must([Condition::matches("namespace", self.namespace.clone())])
    }

    async fn count(&self, filter: Option<Filter>) -> Result<u64, VectorStoreError> {
        if !self.collection_exists().await? {
            return Ok(0);
        }
        let mut builder = CountPointsBuilder::new(&self.collection).exact(true);
        if let Some(f) = filter {
            builder = builder.filter(f);
        }
        let response = self
            .client
            .count(builder)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;
        Ok(response.result.map_or(0, |r| r.count))
    }

    async fn collection_exists(&self) -> Result<bool, VectorStoreError> {
        self.client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))
    }

    async fn delete_matching(&self, filter: Filter) -> Result<(), VectorStoreError> {
        if !self.collection_exists().await? {
            return Ok(());
        }
        let delete = DeletePointsBuilder::new(&self.collection)
            .points(filter)
            .wait(true);
        self.client
            .delete_points(delete)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;
        Ok(())
    }

    /// Points of `source_path` in this namespace, minus the chunk ids in `keep`.
    fn source_filter(&self, source_path: &str, keep: &[String]) -> Filter {
        let must_not = if keep.is_empty() {
            Vec::new()
        } else {
            vec![Condition::has_id(
                keep.iter().map(|id| PointId::from(self.point_id(id))),
            )]
        };
        Filter {
            must: vec![
                Condition::matches("namespace", self.namespace.clone()),
                Condition::matches("source_path", source_path.to_string()),
            ],
            should: Vec::new(),
            must_not,
            min_should: None,
        }
    }

    fn to_payload(&self, chunk: &Chunk) -> HashMap<String, Value> {
        let meta = &chunk.metadata;
        let mut payload: HashMap<String, Value> = HashMap::new();
        payload.insert("namespace".to_string(), self.namespace.clone().into());
        payload.insert("chunk_id".to_string(), chunk.chunk_id.clone().into());
        payload.insert("content".to_string(), stored_content(chunk).into());
        payload.insert("source_file".to_string(), meta.source_file.clone().into());
        payload.insert("source_path".to_string(), meta.source_path.clone().into());
        payload.insert("section_title".to_string(), meta.section_title.clone().into());
        payload.insert("clause_number".to_string(), meta.clause_number.clone().into());
        if let Some(title) = &meta.clause_title {
            payload.insert("clause_title".to_string(), title.clone().into());
        }
        payload.insert(
            "clause_type".to_string(),
            meta.clause_type.as_str().to_string().into(),
        );
        payload.insert("char_start".to_string(), (meta.char_start as i64).into());
        payload.insert("char_end".to_string(), (meta.char_end as i64).into());
        payload.insert("chunk_length".to_string(), (meta.chunk_length as i64).into());
        payload.insert("created_at".to_string(), chunk.created_at.to_rfc3339().into());
        payload
    }
}

fn payload_str<'a>(payload: &'a HashMap<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| match &v.kind {
        Some(Kind::StringValue(s)) => Some(s.as_str()),
        _ => None,
    })
}

fn payload_usize(payload: &HashMap<String, Value>, key: &str) -> usize {
    payload
        .get(key)
        .and_then(|v| match &v.kind {
            Some(Kind::IntegerValue(n)) => usize::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0)
}

fn point_id_string(id: Option<&PointId>) -> String {
    use qdrant_client::qdrant::point_id::PointIdOptions;
    match id.and_then(|id| id.point_id_options.as_ref()) {
        Some(PointIdOptions::Uuid(uuid)) => uuid.clone(),
        Some(PointIdOptions::Num(num)) => num.to_string(),
        None => String::new(),
    }
}

/// Rebuild a chunk from a stored payload. Points without content are skipped.
fn chunk_from_payload(point_id: String, payload: &HashMap<String, Value>) -> Option<Chunk> {
    let content = payload_str(payload, "content")?;
    let chunk_id = payload_str(payload, "chunk_id").map_or(point_id, str::to_string);
    let metadata = ChunkMetadata {
        source_file: payload_str(payload, "source_file").unwrap_or_default().to_string(),
        source_path: payload_str(payload, "source_path").unwrap_or_default().to_string(),
        section_title: payload_str(payload, "section_title")
            .unwrap_or_default()
            .to_string(),
        clause_number: payload_str(payload, "clause_number")
            .unwrap_or_default()
            .to_string(),
        clause_title: payload_str(payload, "clause_title").map(str::to_string),
        clause_type: payload_str(payload, "clause_type")
            .and_then(|s| s.parse().ok())
            .unwrap_or(ClauseType::General),
        char_start: payload_usize(payload, "char_start"),
        char_end: payload_usize(payload, "char_end"),
        chunk_length: payload_usize(payload, "chunk_length"),
        chunk_id,
    };

    let mut chunk = Chunk::new(content, metadata).ok()?;
    if let Some(created_at) = payload_str(payload, "created_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        chunk.created_at = created_at.with_timezone(&Utc);
    }
    Some(chunk)
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        self.client
            .health_check()
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn ensure_namespace(&self, dimension: usize) -> Result<(), VectorStoreError> {
        if self.collection_exists().await? {
            return Ok(());
        }

        let create_collection = CreateCollectionBuilder::new(&self.collection).vectors_config(
            VectorParamsBuilder::new(dimension as u64, Distance::Cosine),
        );
        self.client
            .create_collection(create_collection)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        for field in ["namespace", "source_path"] {
            self.client
                .create_field_index(CreateFieldIndexCollectionBuilder::new(
                    &self.collection,
                    field,
                    FieldType::Keyword,
                ))
                .await
                .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        }

        debug!(collection = %self.collection, dimension, "created qdrant collection");
        Ok(())
    }

    async fn upsert(&self, chunks: &[Chunk]) -> Result<Vec<String>, VectorStoreError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let mut points = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = require_embedding(chunk)?.to_vec();
            if vector.len() != self.dimension {
                return Err(VectorStoreError::UpsertError(format!(
                    "chunk {} has dimension {}, index expects {}",
                    chunk.chunk_id,
                    vector.len(),
                    self.dimension
                )));
            }
            points.push(PointStruct::new(
                self.point_id(&chunk.chunk_id),
                vector,
                self.to_payload(chunk),
            ));
        }

        let upsert = UpsertPointsBuilder::new(&self.collection, points).wait(true);
        self.client
            .upsert_points(upsert)
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        Ok(chunks.iter().map(|c| c.chunk_id.clone()).collect())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<DocumentMatch>, VectorStoreError> {
        let search = SearchPointsBuilder::new(&self.collection, vector.to_vec(), k as u64)
            .filter(self.namespace_filter())
            .with_payload(true);

        let results = self
            .client
            .search_points(search)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        let scored = results
            .result
            .into_iter()
            .filter_map(|point| {
                let point_id = point_id_string(point.id.as_ref());
                chunk_from_payload(point_id, &point.payload).map(|chunk| (chunk, point.score))
            })
            .collect();

        Ok(rank_matches(scored))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, VectorStoreError> {
        if ids.is_empty() || !self.collection_exists().await? {
            return Ok(0);
        }

        let selector = PointsIdsList {
            ids: ids.iter().map(|id| PointId::from(self.point_id(id))).collect(),
        };
        let delete = DeletePointsBuilder::new(&self.collection)
            .points(selector)
            .wait(true);
        self.client
            .delete_points(delete)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        Ok(ids.len())
    }

    async fn delete_source(
        &self,
        source_path: &str,
        keep: &[String],
    ) -> Result<(), VectorStoreError> {
        self.delete_matching(self.source_filter(source_path, keep)).await
    }

    async fn clear_namespace(&self) -> Result<(), VectorStoreError> {
        self.delete_matching(self.namespace_filter()).await
    }

    async fn stats(&self) -> Result<IndexStats, VectorStoreError> {
        Ok(IndexStats {
            total_vectors: self.count(None).await?,
            namespace_vectors: self.count(Some(self.namespace_filter())).await?,
            dimension: self.dimension,
            namespace: self.namespace.clone(),
            index_name: self.collection.clone(),
            backend: VectorDriver::Qdrant,
        })
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::sample_metadata;

    fn index() -> QdrantIndex {
        QdrantIndex::new(&VectorStoreConfig::default(), 4).unwrap()
    }

    fn index_in(namespace: &str) -> QdrantIndex {
        let config = VectorStoreConfig {
            namespace: namespace.to_string(),
            ..VectorStoreConfig::default()
        };
        QdrantIndex::new(&config, 4).unwrap()
    }

    #[test]
    fn test_payload_round_trip() {
        let index = index();
        let chunk = Chunk::new(
            "第3條 班機延誤",
            sample_metadata("3", ClauseType::Coverage),
        )
        .unwrap();

        let payload = index.to_payload(&chunk);
        assert_eq!(payload_str(&payload, "namespace"), Some("travel-insurance"));
        assert_eq!(payload_str(&payload, "clause_type"), Some("coverage"));

        let point_id = index.point_id(&chunk.chunk_id);
        let restored = chunk_from_payload(point_id, &payload).unwrap();
        assert_eq!(restored.chunk_id, chunk.chunk_id);
        assert_eq!(restored.content(), chunk.content());
        assert_eq!(restored.metadata, chunk.metadata);
        assert_eq!(restored.created_at, chunk.created_at);
    }

    #[test]
    fn test_point_ids_are_scoped_to_namespace() {
        let travel = index_in("travel-insurance");
        let medical = index_in("medical-insurance");
        let chunk_id = Chunk::generate_id("/data/policy.txt", "3", 0, 40);

        assert_eq!(travel.point_id(&chunk_id), travel.point_id(&chunk_id));
        assert_ne!(travel.point_id(&chunk_id), medical.point_id(&chunk_id));
        assert_ne!(travel.point_id(&chunk_id), chunk_id);
        assert!(Uuid::parse_str(&travel.point_id(&chunk_id)).is_ok());
    }

    #[test]
    fn test_source_filter_excludes_kept_points() {
        let index = index();
        let keep = vec![Chunk::generate_id("/data/policy.txt", "1", 0, 10)];

        let filter = index.source_filter("/data/policy.txt", &keep);
        assert_eq!(filter.must.len(), 2);
        assert_eq!(filter.must_not.len(), 1);

        let filter = index.source_filter("/data/policy.txt", &[]);
        assert!(filter.must_not.is_empty());
    }

    #[test]
    fn test_payload_without_content_is_skipped() {
        let payload: HashMap<String, Value> = HashMap::new();
        assert!(chunk_from_payload("id".to_string(), &payload).is_none());
    }

    #[test]
    fn test_point_id_string() {
        let id = PointId::from("2f1c8a64-3e39-5b6f-9a53-0c7f7a5a1f11".to_string());
        assert_eq!(
            point_id_string(Some(&id)),
            "2f1c8a64-3e39-5b6f-9a53-0c7f7a5a1f11"
        );
        assert_eq!(point_id_string(Some(&PointId::from(7u64))), "7");
        assert_eq!(point_id_string(None), "");
    }
}
