//! PostgreSQL + pgvector backend. One table; namespaces are a column and
//! part of the primary key, so chunk ids never collide across namespaces.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};

use super::{IndexStats, VectorIndex, rank_matches, require_embedding, stored_content};
use crate::error::VectorStoreError;
use crate::models::{
    Chunk, ChunkMetadata, ClauseType, DocumentMatch, VectorDriver, VectorStoreConfig,
};

pub struct PgVectorIndex {
    pool: PgPool,
    table_name: String,
    namespace: String,
    dimension: usize,
}

/// Table names are interpolated into SQL, so only identifier characters pass.
fn table_name_for(collection: &str) -> String {
    let name: String = collection
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.starts_with(|c: char| c.is_ascii_digit()) || name.is_empty() {
        format!("t_{}", name)
    } else {
        name
    }
}

fn create_table_sql(table: &str, dimension: usize) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id UUID NOT NULL,
            namespace TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding vector({}) NOT NULL,
            source_file TEXT NOT NULL,
            source_path TEXT NOT NULL,
            section_title TEXT NOT NULL,
            clause_number TEXT NOT NULL,
            clause_title TEXT,
            clause_type TEXT NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            chunk_length INTEGER NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (namespace, id)
        )
        "#,
        table, dimension
    )
}

fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {} (id, namespace, content, embedding, source_file, source_path,
                        section_title, clause_number, clause_title, clause_type,
                        char_start, char_end, chunk_length, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
        ON CONFLICT (namespace, id) DO UPDATE SET
            content = EXCLUDED.content,
            embedding = EXCLUDED.embedding,
            source_file = EXCLUDED.source_file,
            source_path = EXCLUDED.source_path,
            section_title = EXCLUDED.section_title,
            clause_number = EXCLUDED.clause_number,
            clause_title = EXCLUDED.clause_title,
            clause_type = EXCLUDED.clause_type,
            char_start = EXCLUDED.char_start,
            char_end = EXCLUDED.char_end,
            chunk_length = EXCLUDED.chunk_length,
            created_at = EXCLUDED.created_at
        "#,
        table
    )
}

/// `$1` namespace, `$2` source path, `$3` ids to keep.
fn delete_source_sql(table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE namespace = $1 AND source_path = $2 AND NOT (id = ANY($3))",
        table
    )
}

fn parse_ids(ids: &[String]) -> Result<Vec<uuid::Uuid>, uuid::Error> {
    ids.iter().map(|id| uuid::Uuid::parse_str(id)).collect()
}

impl PgVectorIndex {
    pub async fn new(config: &VectorStoreConfig, dimension: usize) -> Result<Self, VectorStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))?;

        let index = Self {
            pool,
            table_name: table_name_for(&config.collection),
            namespace: config.namespace.clone(),
            dimension,
        };

        index.check_pgvector_extension().await?;
        Ok(index)
    }

    async fn check_pgvector_extension(&self) -> Result<(), VectorStoreError> {
        let result: Option<(String,)> =
            sqlx::query_as("SELECT extname FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| VectorStoreError::ClientError(e.to_string()))?;

        if result.is_none() {
            return Err(VectorStoreError::ConnectionError(
                "pgvector extension is not installed. Run: CREATE EXTENSION vector;".to_string(),
            ));
        }
        Ok(())
    }

    async fn table_exists(&self) -> Result<bool, VectorStoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT table_name::text FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(&self.table_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        Ok(row.is_some())
    }

    fn row_to_match(row: &PgRow) -> Result<(Chunk, f32), VectorStoreError> {
        let read = |e: sqlx::Error| VectorStoreError::SearchError(e.to_string());

        let clause_type: String = row.try_get("clause_type").map_err(read)?;
        let metadata = ChunkMetadata {
            source_file: row.try_get("source_file").map_err(read)?,
            source_path: row.try_get("source_path").map_err(read)?,
            section_title: row.try_get("section_title").map_err(read)?,
            clause_number: row.try_get("clause_number").map_err(read)?,
            clause_title: row.try_get("clause_title").map_err(read)?,
            clause_type: clause_type.parse().unwrap_or(ClauseType::General),
            char_start: row.try_get::<i32, _>("char_start").map_err(read)? as usize,
            char_end: row.try_get::<i32, _>("char_end").map_err(read)? as usize,
            chunk_length: row.try_get::<i32, _>("chunk_length").map_err(read)? as usize,
            chunk_id: row.try_get("chunk_id").map_err(read)?,
        };
        let content: String = row.try_get("content").map_err(read)?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(read)?;
        let score: f64 = row.try_get("score").map_err(read)?;

        let mut chunk = Chunk::new(content, metadata)
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;
        chunk.created_at = created_at;
        Ok((chunk, score as f32))
    }
}

#[async_trait]
impl VectorIndex for PgVectorIndex {
    async fn health_check(&self) -> Result<bool, VectorStoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| true)
            .map_err(|e| VectorStoreError::ConnectionError(e.to_string()))
    }

    async fn ensure_namespace(&self, dimension: usize) -> Result<(), VectorStoreError> {
        let create_table = create_table_sql(&self.table_name, dimension);

        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;

        let indices = [
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_embedding_idx ON {0} USING hnsw (embedding vector_cosine_ops)",
                self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_namespace_idx ON {0} (namespace)",
                self.table_name
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_source_path_idx ON {0} (namespace, source_path)",
                self.table_name
            ),
        ];

        for index_sql in &indices {
            sqlx::query(index_sql)
                .execute(&self.pool)
                .await
                .map_err(|e| VectorStoreError::CollectionError(e.to_string()))?;
        }

        Ok(())
    }

    async fn upsert(&self, chunks: &[Chunk]) -> Result<Vec<String>, VectorStoreError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let query = upsert_sql(&self.table_name);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        for chunk in chunks {
            let id = uuid::Uuid::parse_str(&chunk.chunk_id)
                .map_err(|e| VectorStoreError::UpsertError(format!("Invalid UUID: {}", e)))?;
            let embedding = require_embedding(chunk)?;
            if embedding.len() != self.dimension {
                return Err(VectorStoreError::UpsertError(format!(
                    "chunk {} has dimension {}, index expects {}",
                    chunk.chunk_id,
                    embedding.len(),
                    self.dimension
                )));
            }
            let meta = &chunk.metadata;

            sqlx::query(&query)
                .bind(id)
                .bind(&self.namespace)
                .bind(stored_content(chunk))
                .bind(Vector::from(embedding.to_vec()))
                .bind(&meta.source_file)
                .bind(&meta.source_path)
                .bind(&meta.section_title)
                .bind(&meta.clause_number)
                .bind(&meta.clause_title)
                .bind(meta.clause_type.as_str())
                .bind(meta.char_start as i32)
                .bind(meta.char_end as i32)
                .bind(meta.chunk_length as i32)
                .bind(chunk.created_at)
                .execute(&mut *tx)
                .await
                .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| VectorStoreError::UpsertError(e.to_string()))?;

        Ok(chunks.iter().map(|c| c.chunk_id.clone()).collect())
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<DocumentMatch>, VectorStoreError> {
        let query = format!(
            r#"
            SELECT
                id::text AS chunk_id,
                1 - (embedding <=> $1) AS score,
                content, source_file, source_path, section_title, clause_number,
                clause_title, clause_type, char_start, char_end, chunk_length, created_at
            FROM {}
            WHERE namespace = $2
            ORDER BY embedding <=> $1
            LIMIT $3
            "#,
            self.table_name
        );

        let rows = sqlx::query(&query)
            .bind(Vector::from(vector.to_vec()))
            .bind(&self.namespace)
            .bind(k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;

        let scored = rows
            .iter()
            .map(Self::row_to_match)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rank_matches(scored))
    }

    async fn delete(&self, ids: &[String]) -> Result<usize, VectorStoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let uuids = parse_ids(ids)
            .map_err(|e| VectorStoreError::DeleteError(format!("Invalid UUID: {}", e)))?;

        let query = format!(
            "DELETE FROM {} WHERE namespace = $1 AND id = ANY($2)",
            self.table_name
        );
        let result = sqlx::query(&query)
            .bind(&self.namespace)
            .bind(&uuids)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn delete_source(
        &self,
        source_path: &str,
        keep: &[String],
    ) -> Result<(), VectorStoreError> {
        if !self.table_exists().await? {
            return Ok(());
        }
        let keep = parse_ids(keep)
            .map_err(|e| VectorStoreError::DeleteError(format!("Invalid UUID: {}", e)))?;
        sqlx::query(&delete_source_sql(&self.table_name))
            .bind(&self.namespace)
            .bind(source_path)
            .bind(&keep)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;
        Ok(())
    }

    async fn clear_namespace(&self) -> Result<(), VectorStoreError> {
        if !self.table_exists().await? {
            return Ok(());
        }
        let query = format!("DELETE FROM {} WHERE namespace = $1", self.table_name);
        sqlx::query(&query)
            .bind(&self.namespace)
            .execute(&self.pool)
            .await
            .map_err(|e| VectorStoreError::DeleteError(e.to_string()))?;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats, VectorStoreError> {
        let (total, in_namespace) = if self.table_exists().await? {
            let query = format!(
                "SELECT COUNT(*), COUNT(*) FILTER (WHERE namespace = $1) FROM {}",
                self.table_name
            );
            let row: (i64, i64) = sqlx::query_as(&query)
                .bind(&self.namespace)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| VectorStoreError::SearchError(e.to_string()))?;
            row
        } else {
            (0, 0)
        };

        Ok(IndexStats {
            total_vectors: total as u64,
            namespace_vectors: in_namespace as u64,
            dimension: self.dimension,
            namespace: self.namespace.clone(),
            index_name: self.table_name.clone(),
            backend: VectorDriver::PostgreSQL,
        })
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }
}
