//! 임베딩 모듈 - FastEmbed 로컬 모델을 통한 텍스트 벡터화
//!
//! 수집 경로와 질의 경로가 같은 프로바이더를 써야 유사도가 의미를 가집니다.
//! 벡터는 프로바이더 안에서 L2 정규화되어 나가므로, 저장소는 코사인 거리만
//! 사용하면 됩니다.
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = FastEmbedProvider::new("bge-small-en-v1.5", false)?;
//! let embedding = embedder.embed("Mars in the first house").await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

use crate::error::{KbError, Result};

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 입력 순서대로 고정 길이 벡터를 하나씩 돌려줍니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| KbError::Embedding("no embedding generated".to_string()))
    }

    /// 배치 임베딩 (한 문서의 청크 전체를 한 번에)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 이름 (코퍼스 스냅샷에 고정)
    fn model_name(&self) -> &str;
}

// ============================================================================
// FastEmbed
// ============================================================================

/// 지원 모델 목록: (이름, fastembed 모델, 차원)
const SUPPORTED_MODELS: &[(&str, EmbeddingModel, usize)] = &[
    ("bge-small-en-v1.5", EmbeddingModel::BGESmallENV15, 384),
    ("multilingual-e5-small", EmbeddingModel::MultilingualE5Small, 384),
    ("all-MiniLM-L6-v2", EmbeddingModel::AllMiniLML6V2, 384),
];

/// 기본 임베딩 모델
pub const DEFAULT_MODEL: &str = "bge-small-en-v1.5";

/// FastEmbed 로컬 임베딩 구현체
///
/// 모델은 처음 사용할 때 `~/.cache/huggingface/`로 다운로드됩니다.
pub struct FastEmbedProvider {
    model: Arc<TextEmbedding>,
    model_name: String,
    dimension: usize,
}

impl FastEmbedProvider {
    /// 모델 이름으로 생성
    ///
    /// # Arguments
    /// * `model_name` - `bge-small-en-v1.5`, `multilingual-e5-small`, `all-MiniLM-L6-v2`
    /// * `show_download_progress` - 다운로드 진행 표시 여부
    pub fn new(model_name: &str, show_download_progress: bool) -> Result<Self> {
        let (name, model, dimension) = resolve_model(model_name)?;

        tracing::info!(
            "Initializing embedding model: {} ({}D)",
            name,
            dimension
        );

        let options = InitOptions::new(model).with_show_download_progress(show_download_progress);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| KbError::Embedding(format!("model init failed: {}", e)))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: name.to_string(),
            dimension,
        })
    }

    /// 기본 모델로 생성
    pub fn with_default_model() -> Result<Self> {
        Self::new(DEFAULT_MODEL, true)
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = Arc::clone(&self.model);
        let inputs = texts.to_vec();

        // ONNX 추론은 블로킹이므로 런타임 워커를 막지 않도록 분리
        let mut vectors = tokio::task::spawn_blocking(move || model.embed(inputs, None))
            .await
            .map_err(|e| KbError::Embedding(format!("embedding task panicked: {}", e)))?
            .map_err(|e| KbError::Embedding(e.to_string()))?;

        if vectors.len() != texts.len() {
            return Err(KbError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }

        for vector in &mut vectors {
            check_dimension(vector, self.dimension)?;
            l2_normalize(vector);
        }

        tracing::debug!("Embedded {} text(s) with {}", texts.len(), self.model_name);
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

/// 모델 이름 해석 (대소문자 무시)
fn resolve_model(model_name: &str) -> Result<(&'static str, EmbeddingModel, usize)> {
    // "BAAI/bge-small-en-v1.5" 같은 허브 경로도 허용
    let short = model_name.rsplit('/').next().unwrap_or(model_name);

    SUPPORTED_MODELS
        .iter()
        .find(|(name, _, _)| name.eq_ignore_ascii_case(short))
        .map(|(name, model, dim)| (*name, model.clone(), *dim))
        .ok_or_else(|| {
            let names: Vec<&str> = SUPPORTED_MODELS.iter().map(|(n, _, _)| *n).collect();
            KbError::Embedding(format!(
                "unsupported model: {}. Supported: {}",
                model_name,
                names.join(", ")
            ))
        })
}

// ============================================================================
// Vector Helpers
// ============================================================================

/// 차원 검증
pub fn check_dimension(vector: &[f32], expected: usize) -> Result<()> {
    if vector.len() != expected {
        return Err(KbError::Embedding(format!(
            "dimension mismatch: expected {}, got {}",
            expected,
            vector.len()
        )));
    }
    Ok(())
}

/// L2 정규화 (제자리). 영벡터는 그대로 둡니다.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ============================================================================
// Test Support
// ============================================================================


// ============================================================================
// Tests
// ============================================================================
