//! End-to-end ingestion, retrieval and answer assembly against the in-memory index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use policy_rag::RetrievalError;
use policy_rag::error::{EmbeddingError, GenerationError};
use policy_rag::models::{
    ChatMessage, ClauseType, Completion, Config, FinishReason, TokenUsage, VectorDriver,
};
use policy_rag::services::{
    CompletionProvider, Embedder, EmbeddingProvider, InMemoryIndex, NO_MATCH_CONFIDENCE,
    OrchestratorState, ResponseAssembler, RetrievalOrchestrator, Severity,
};

const DIMENSION: usize = 384;

const POLICY: &str = "海外旅行不便保險條款
第一章 總則
第1條 保險契約的構成
本保險契約之構成部分包括保險單、要保書、批註及其他約定書。
第2條 名詞定義
本契約所稱被保險人，指保險單上所載之人；所稱旅程，指被保險人出國至返國之期間。
第二章 承保範圍
第3條 班機延誤超過四小時
被保險人搭乘之定期班機延誤超過四小時者，本公司按每滿四小時給付定額保險金。
第4條 行李延誤
被保險人之隨行託運行李於抵達目的地六小時後仍未領取者，本公司給付行李延誤保險金。
第5條 行程取消
被保險人因本人或家屬身故、重大疾病而取消行程者，本公司賠償已支付且不可退還之團費。
第6條 緊急救援
被保險人於海外遭遇緊急事故時，可撥打二十四小時救援專線請求協助安排醫療轉送。
第三章 除外責任
第7條 一般除外責任
因被保險人之故意行為、犯罪行為或參與暴動所致之損失，本公司不負保險責任。
第8條 戰爭除外
因戰爭、內亂或核子輻射所致之損失，不在本保險承保範圍。
第四章 理賠
第9條 事故通知
被保險人應於知悉保險事故發生後十日內通知本公司。
第10條 理賠申請
被保險人申請理賠時，應檢具理賠申請書、登機證及航空公司出具之延誤證明文件。";

/// Hashed character bigrams. Deterministic, so similarity follows shared wording.
struct BigramProvider {
    calls: AtomicUsize,
}

impl BigramProvider {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let chars: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut v = vec![0.0; DIMENSION];
        for pair in chars.windows(2) {
            let h = (pair[0] as u64).wrapping_mul(31).wrapping_add(pair[1] as u64);
            v[(h % DIMENSION as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for BigramProvider {
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::vector(text))
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn model_name(&self) -> &str {
        "bigram"
    }
}

struct EchoCompletion {
    calls: AtomicUsize,
}

#[async_trait]
impl CompletionProvider for EchoCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(Completion {
            content: format!("根據條款：{}", last.chars().take(20).collect::<String>()),
            finish_reason: FinishReason::Stop,
            token_usage: TokenUsage {
                prompt_tokens: 200,
                completion_tokens: 40,
                total_tokens: 240,
            },
            model: "echo".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}

struct Pipeline {
    dir: TempDir,
    provider: Arc<BigramProvider>,
    orchestrator: RetrievalOrchestrator,
}

impl Pipeline {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.vector_store.driver = VectorDriver::Memory;
        config.embedding.dimension = DIMENSION;
        config.retrieval.similarity_threshold = 0.1;
        config.retrieval.chunk_size = 256;
        config.retrieval.chunk_overlap = 26;
        config.retrieval.persist_chunks = true;

        let provider = Arc::new(BigramProvider::new());
        let embedder = Embedder::new(provider.clone(), config.embedding.batch_size);
        let index = Arc::new(InMemoryIndex::new(&config.vector_store.namespace, DIMENSION));
        let orchestrator = RetrievalOrchestrator::new(&config, embedder, index);

        Self {
            dir,
            provider,
            orchestrator,
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }
}

#[tokio::test]
async fn test_query_before_ingestion_is_rejected() {
    let pipeline = Pipeline::new();
    assert_eq!(pipeline.orchestrator.state(), OrchestratorState::Uninitialized);

    let result = pipeline.orchestrator.query("班機延誤怎麼賠償", None).await;
    assert!(matches!(result, Err(RetrievalError::NotInitialized)));
    assert_eq!(pipeline.provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_ingest_then_retrieve_coverage_clause() {
    let mut pipeline = Pipeline::new();
    let path = pipeline.write("travel_policy.txt", POLICY);

    let stats = pipeline.orchestrator.ingest(&path).await.unwrap();
    assert!(stats.total_chunks >= 10, "got {} chunks", stats.total_chunks);
    assert_eq!(stats.vectors_written, stats.total_chunks);
    assert_eq!(stats.success_rate(), 1.0);
    assert!(stats.errors.is_empty());
    assert_eq!(pipeline.orchestrator.state(), OrchestratorState::Ready);

    let matches = pipeline
        .orchestrator
        .query("班機延誤超過幾小時可以申請賠償？", Some(3))
        .await
        .unwrap();
    assert!(!matches.is_empty());
    assert!(matches.len() <= 3);

    let top = &matches[0];
    assert_eq!(top.rank, 1);
    assert_eq!(top.document.metadata.clause_number, "3");
    assert_eq!(top.document.metadata.clause_type, ClauseType::Coverage);
    assert!(top.document.embedding.is_none());
    assert!(matches.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(matches.iter().all(|m| (0.1..=1.0).contains(&m.score)));

    let artifact = pipeline.root().join("processed").join("travel_policy_chunks.json");
    assert!(artifact.exists());
}

#[tokio::test]
async fn test_reingest_replaces_previous_vectors() {
    let mut pipeline = Pipeline::new();
    let path = pipeline.write("policy.txt", POLICY);

    let first = pipeline.orchestrator.ingest(&path).await.unwrap();
    pipeline.orchestrator.ingest(&path).await.unwrap();

    let stats = pipeline.orchestrator.stats().await;
    let index = stats.index.unwrap();
    assert_eq!(index.namespace_vectors as usize, first.total_chunks);
}

#[tokio::test]
async fn test_directory_ingestion_skips_bad_documents() {
    let mut pipeline = Pipeline::new();
    pipeline.write("a_policy.txt", POLICY);
    pipeline.write("b_empty.txt", "   \n");
    pipeline.write("c_notes.md", "第1條 不會被讀取的內容。");

    let root = pipeline.root().to_path_buf();
    let stats = pipeline.orchestrator.ingest_directory(&root).await.unwrap();
    assert_eq!(stats.total_documents, 2);
    assert_eq!(stats.processed_documents, 1);
    assert_eq!(stats.failed_documents, 1);
    assert_eq!(stats.success_rate(), 0.5);
    assert!(stats.errors[0].contains("b_empty.txt"));
    assert!(pipeline.orchestrator.is_ready());
}

#[tokio::test]
async fn test_path_outside_data_dir_is_refused() {
    let mut pipeline = Pipeline::new();
    let elsewhere = tempfile::tempdir().unwrap();
    let path = elsewhere.path().join("policy.txt");
    std::fs::write(&path, POLICY).unwrap();

    let result = pipeline.orchestrator.ingest(&path).await;
    assert!(matches!(result, Err(RetrievalError::Security(_))));
    assert_eq!(pipeline.orchestrator.state(), OrchestratorState::Uninitialized);
    assert_eq!(
        pipeline
            .orchestrator
            .security()
            .audit_events(Some(Severity::Error))
            .len(),
        1
    );
}

#[tokio::test]
async fn test_answer_cites_retrieved_clauses() {
    let mut pipeline = Pipeline::new();
    let path = pipeline.write("policy.txt", POLICY);
    pipeline.orchestrator.ingest(&path).await.unwrap();

    let completion = Arc::new(EchoCompletion {
        calls: AtomicUsize::new(0),
    });
    let assembler = ResponseAssembler::new(completion.clone(), 6);

    let matches = pipeline
        .orchestrator
        .query("班機延誤超過幾小時可以申請賠償？", Some(3))
        .await
        .unwrap();
    let response = assembler
        .answer("班機延誤超過幾小時可以申請賠償？", &matches, &[])
        .await
        .unwrap();

    assert_eq!(completion.calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.sources.len(), matches.len());
    assert_eq!(response.sources[0].clause_number, "3");
    assert_eq!(response.token_usage.total_tokens, 240);
    assert!((0.0..=1.0).contains(&response.confidence()));
    assert!(response.confidence() > NO_MATCH_CONFIDENCE);
}

#[tokio::test]
async fn test_unrelated_question_gets_fallback_answer() {
    let mut pipeline = Pipeline::new();
    let path = pipeline.write("policy.txt", POLICY);
    pipeline.orchestrator.ingest(&path).await.unwrap();

    let matches = pipeline
        .orchestrator
        .search("Quarterly revenue forecast", None, Some(0.9))
        .await
        .unwrap()
        .matches;
    assert!(matches.is_empty());

    let completion = Arc::new(EchoCompletion {
        calls: AtomicUsize::new(0),
    });
    let response = ResponseAssembler::new(completion.clone(), 6)
        .answer("Quarterly revenue forecast", &matches, &[])
        .await
        .unwrap();
    assert_eq!(response.confidence(), NO_MATCH_CONFIDENCE);
    assert!(response.sources.is_empty());
    assert_eq!(completion.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_clear_returns_to_uninitialized() {
    let mut pipeline = Pipeline::new();
    let path = pipeline.write("policy.txt", POLICY);
    pipeline.orchestrator.ingest(&path).await.unwrap();

    pipeline.orchestrator.clear().await.unwrap();
    assert_eq!(pipeline.orchestrator.state(), OrchestratorState::Uninitialized);
    assert!(!pipeline.orchestrator.attach_existing().await.unwrap());

    let result = pipeline.orchestrator.query("班機延誤怎麼賠償", None).await;
    assert!(matches!(result, Err(RetrievalError::NotInitialized)));
}
