//! 설정 모듈
//!
//! 기본값 → TOML 파일 → 환경변수 순서로 설정을 덮어씁니다.
//!
//! ```toml
//! [store]
//! backend = "lance"
//!
//! [retrieval.weights]
//! facet_field_bonus = 0.05
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KbError, Result};

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.astro-kb/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".astro-kb")
}

// ============================================================================
// Config Types
// ============================================================================

/// 전체 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub ingest: IngestConfig,
    pub retrieval: RetrievalConfig,
    pub generator: GeneratorConfig,
}

/// 저장소 백엔드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Supabase (PostgREST + pgvector RPC)
    Supabase,
    /// 로컬 LanceDB
    Lance,
}

impl std::str::FromStr for StoreBackend {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "supabase" => Ok(StoreBackend::Supabase),
            "lance" | "lancedb" => Ok(StoreBackend::Lance),
            other => Err(KbError::Config(format!(
                "unknown store backend '{}' (expected supabase or lance)",
                other
            ))),
        }
    }
}

/// 지식 저장소 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub supabase_url: Option<String>,
    /// 쓰기용 (ingest)
    #[serde(skip_serializing)]
    pub supabase_service_key: Option<String>,
    /// 읽기용 (검색). 없으면 service key 사용
    #[serde(skip_serializing)]
    pub supabase_anon_key: Option<String>,
    pub table: String,
    pub search_rpc: String,
    /// LanceDB 경로 (없으면 데이터 디렉토리 아래 kb.lance)
    pub lance_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Lance,
            supabase_url: None,
            supabase_service_key: None,
            supabase_anon_key: None,
            table: "astro_kb_chunks".to_string(),
            search_rpc: "kb_semantic_search".to_string(),
            lance_path: None,
        }
    }
}

impl StoreConfig {
    /// 검색용 키 (anon 우선, 없으면 service)
    pub fn read_key(&self) -> Option<&str> {
        self.supabase_anon_key
            .as_deref()
            .or(self.supabase_service_key.as_deref())
            .filter(|k| !k.is_empty())
    }

    /// 쓰기용 키 (service만 허용)
    pub fn write_key(&self) -> Option<&str> {
        self.supabase_service_key
            .as_deref()
            .filter(|k| !k.is_empty())
    }

    pub fn lance_path(&self) -> PathBuf {
        self.lance_path
            .clone()
            .unwrap_or_else(|| get_data_dir().join("kb.lance"))
    }
}

/// 임베딩 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// 코퍼스 스냅샷 전체에 고정되는 모델 이름
    pub model: String,
    pub show_download_progress: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "bge-small-en-v1.5".to_string(),
            show_download_progress: true,
        }
    }
}

/// 수집 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub kb_dir: PathBuf,
    pub max_chars: usize,
    pub batch_size: usize,
    pub extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            kb_dir: PathBuf::from("kb"),
            max_chars: 1200,
            batch_size: 200,
            extensions: vec!["md".to_string()],
        }
    }
}

/// 재정렬 가중치
///
/// `score = priority / priority_divisor
///        + Σ(facet) Σ(field) facet_field_bonus
///        + similarity_weight * similarity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    /// priority 나눗수 (priority 80 → 0.8)
    pub priority_divisor: f32,
    /// priority가 없는 행의 기본값
    pub default_priority: i64,
    /// facet 필드 하나가 일치할 때마다 더하는 보너스
    pub facet_field_bonus: f32,
    /// 저장소가 유사도를 돌려줄 때 곱하는 가중치 (0이면 무시)
    pub similarity_weight: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority_divisor: 100.0,
            default_priority: 50,
            facet_field_bonus: 0.05,
            similarity_weight: 1.0,
        }
    }
}

/// 검색 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// 재정렬용 후보 배수 (top_k * oversample_factor)
    pub oversample_factor: usize,
    /// 임베딩/검색 호출 데드라인 (초)
    pub timeout_secs: Option<u64>,
    pub weights: ScoringWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 12,
            oversample_factor: 2,
            timeout_secs: None,
            weights: ScoringWeights::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// 텍스트 생성기 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// 프롬프트 길이만 알려주는 데모
    Demo,
    /// Groq (OpenAI 호환 chat completions)
    Groq,
}

/// 텍스트 생성기 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub kind: GeneratorKind,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            kind: GeneratorKind::Demo,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            temperature: 0.4,
            max_tokens: 900,
            api_key: None,
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Config {
    /// 설정 로드
    ///
    /// `path`가 없으면 `~/.astro-kb/config.toml`을 시도하고,
    /// 그것도 없으면 기본값을 사용합니다. 마지막으로 환경변수를 적용합니다.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = get_data_dir().join("config.toml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 읽기
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KbError::io(e, format!("reading config {}", path.display())))?;
        toml::from_str(&content)
            .map_err(|e| KbError::Config(format!("{}: {}", path.display(), e)))
    }

    /// 환경변수 덮어쓰기
    ///
    /// 테스트에서 프로세스 환경을 건드리지 않도록 조회 함수를 주입받습니다.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("SUPABASE_URL") {
            self.store.supabase_url = Some(url);
        }
        if let Some(key) = get("SUPABASE_SERVICE_KEY") {
            self.store.supabase_service_key = Some(key);
        }
        if let Some(key) = get("SUPABASE_ANON_KEY") {
            self.store.supabase_anon_key = Some(key);
        }
        if let Some(backend) = get("ASTRO_KB_STORE") {
            match backend.parse() {
                Ok(b) => self.store.backend = b,
                Err(e) => tracing::warn!("Ignoring ASTRO_KB_STORE: {}", e),
            }
        }
        if let Some(model) = get("EMBEDDING_MODEL") {
            self.embedding.model = model;
        }
        if let Some(dir) = get("ASTRO_KB_DIR") {
            self.ingest.kb_dir = PathBuf::from(dir);
        }
        if let Some(key) = get("GROQ_API_KEY") {
            self.generator.api_key = Some(key);
        }
    }

    /// 값 범위 검사
    pub fn validate(&self) -> Result<()> {
        if self.ingest.max_chars == 0 {
            return Err(KbError::Config("ingest.max_chars must be > 0".to_string()));
        }
        if self.ingest.batch_size == 0 {
            return Err(KbError::Config("ingest.batch_size must be > 0".to_string()));
        }
        if self.retrieval.oversample_factor == 0 {
            return Err(KbError::Config(
                "retrieval.oversample_factor must be > 0".to_string(),
            ));
        }
        if self.retrieval.weights.priority_divisor == 0.0 {
            return Err(KbError::Config(
                "retrieval.weights.priority_divisor must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.ingest.max_chars, 1200);
        assert_eq!(config.ingest.batch_size, 200);
        assert_eq!(config.retrieval.top_k, 12);
        assert_eq!(config.retrieval.oversample_factor, 2);
        assert_eq!(config.retrieval.weights.priority_divisor, 100.0);
        assert_eq!(config.retrieval.weights.facet_field_bonus, 0.05);
        assert_eq!(config.store.table, "astro_kb_chunks");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [store]
            backend = "supabase"

            [retrieval.weights]
            facet_field_bonus = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.store.backend, StoreBackend::Supabase);
        assert_eq!(config.retrieval.weights.facet_field_bonus, 0.1);
        // 나머지는 기본값
        assert_eq!(config.retrieval.weights.priority_divisor, 100.0);
        assert_eq!(config.ingest.max_chars, 1200);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SUPABASE_URL", "https://x.supabase.co"),
            ("SUPABASE_SERVICE_KEY", "service"),
            ("ASTRO_KB_STORE", "supabase"),
            ("EMBEDDING_MODEL", "multilingual-e5-small"),
            ("GROQ_API_KEY", ""),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.store.backend, StoreBackend::Supabase);
        assert_eq!(config.store.supabase_url.as_deref(), Some("https://x.supabase.co"));
        assert_eq!(config.embedding.model, "multilingual-e5-small");
        // 빈 값은 무시
        assert!(config.generator.api_key.is_none());
    }

    #[test]
    fn test_key_priority() {
        let mut store = StoreConfig {
            supabase_service_key: Some("service".to_string()),
            ..Default::default()
        };
        assert_eq!(store.read_key(), Some("service"));
        assert_eq!(store.write_key(), Some("service"));

        store.supabase_anon_key = Some("anon".to_string());
        assert_eq!(store.read_key(), Some("anon"));
        assert_eq!(store.write_key(), Some("service"));

        store.supabase_service_key = None;
        assert_eq!(store.write_key(), None);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = Config::default();
        config.ingest.max_chars = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.retrieval.weights.priority_divisor = 0.0;
        assert!(config.validate().is_err());

        assert!("redis".parse::<StoreBackend>().is_err());
        assert_eq!("LanceDB".parse::<StoreBackend>().unwrap(), StoreBackend::Lance);
    }
}
