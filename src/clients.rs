//! 클라이언트 레지스트리
//!
//! 임베딩 모델, 지식 저장소, 텍스트 생성기는 처음 쓰일 때 한 번만 만들고
//! `Arc`로 공유합니다. 검색기/파이프라인은 여기서 꺼낸 핸들을 생성자로 받습니다.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{Config, StoreBackend};
use crate::embedding::{EmbeddingProvider, FastEmbedProvider};
use crate::error::{KbError, Result};
use crate::generator::{self, TextGenerator};
use crate::interpret::Interpreter;
use crate::knowledge::{
    paragraph_chunker, IngestOptions, IngestPipeline, KnowledgeStore, LanceKnowledgeStore,
    SupabaseStore,
};
use crate::retrieval::HybridRetriever;

/// 지연 생성 클라이언트 모음
pub struct Clients {
    config: Config,
    embedder: OnceCell<Arc<dyn EmbeddingProvider>>,
    read_store: OnceCell<Arc<dyn KnowledgeStore>>,
    write_store: OnceCell<Arc<dyn KnowledgeStore>>,
    generator: OnceCell<Arc<dyn TextGenerator>>,
}

impl Clients {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            embedder: OnceCell::new(),
            read_store: OnceCell::new(),
            write_store: OnceCell::new(),
            generator: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 임베딩 제공자 (최초 호출 시 모델 로드)
    pub async fn embedder(&self) -> Result<Arc<dyn EmbeddingProvider>> {
        self.embedder
            .get_or_try_init(|| async {
                let model = self.config.embedding.model.clone();
                let show_progress = self.config.embedding.show_download_progress;
                // 모델 로드는 블로킹
                let provider = tokio::task::spawn_blocking(move || {
                    FastEmbedProvider::new(&model, show_progress)
                })
                .await
                .map_err(|e| KbError::Embedding(format!("model loader panicked: {}", e)))??;

                tracing::info!(
                    "Loaded embedding model {} ({}-d)",
                    provider.model_name(),
                    provider.dimension()
                );
                Ok::<_, KbError>(Arc::new(provider) as Arc<dyn EmbeddingProvider>)
            })
            .await
            .cloned()
    }

    /// 읽기용 저장소 (Supabase는 anon key 우선)
    pub async fn read_store(&self) -> Result<Arc<dyn KnowledgeStore>> {
        self.read_store
            .get_or_try_init(|| self.open_store(false))
            .await
            .cloned()
    }

    /// 쓰기용 저장소 (Supabase는 service key 필수)
    pub async fn write_store(&self) -> Result<Arc<dyn KnowledgeStore>> {
        self.write_store
            .get_or_try_init(|| self.open_store(true))
            .await
            .cloned()
    }

    /// 텍스트 생성기
    pub async fn generator(&self) -> Result<Arc<dyn TextGenerator>> {
        self.generator
            .get_or_try_init(|| async {
                let built = generator::from_config(&self.config.generator)?;
                Ok::<_, KbError>(Arc::from(built))
            })
            .await
            .cloned()
    }

    /// 검색기 생성
    pub async fn retriever(&self) -> Result<HybridRetriever> {
        Ok(HybridRetriever::from_config(
            self.embedder().await?,
            self.read_store().await?,
            &self.config.retrieval,
        ))
    }

    /// 해석기 생성
    pub async fn interpreter(&self) -> Result<Interpreter> {
        Ok(Interpreter::new(self.retriever().await?, self.generator().await?)
            .with_top_k(self.config.retrieval.top_k))
    }

    /// 수집 파이프라인 생성
    pub async fn ingest_pipeline(&self) -> Result<IngestPipeline> {
        let ingest = &self.config.ingest;
        Ok(IngestPipeline::new(
            self.embedder().await?,
            self.write_store().await?,
            paragraph_chunker(ingest.max_chars),
            IngestOptions {
                batch_size: ingest.batch_size,
                extensions: ingest.extensions.clone(),
            },
        ))
    }

    async fn open_store(&self, write: bool) -> Result<Arc<dyn KnowledgeStore>> {
        let store: Arc<dyn KnowledgeStore> = match self.config.store.backend {
            StoreBackend::Supabase => {
                Arc::new(SupabaseStore::from_config(&self.config.store, write)?)
            }
            StoreBackend::Lance => {
                let dimension = self.embedder().await?.dimension();
                let path = self.config.store.lance_path();
                Arc::new(LanceKnowledgeStore::open(&path, dimension).await?)
            }
        };

        tracing::debug!(
            "Opened {} store ({})",
            store.name(),
            if write { "write" } else { "read" }
        );
        Ok(store)
    }
}
