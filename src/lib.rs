//! astro-kb - 점성술 지식베이스 RAG
//!
//! 프런트매터가 달린 마크다운 코퍼스를 청킹/임베딩하여 벡터 저장소에 넣고,
//! 구조화된 배치(placements)와 트랜싯을 질의 컨텍스트로 바꿔
//! 벡터 검색 + facet 재정렬로 노트를 골라 합성 프롬프트를 만듭니다.

pub mod cli;
pub mod clients;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod interpret;
pub mod knowledge;
pub mod retrieval;

// Re-exports
pub use clients::Clients;
pub use config::{get_data_dir, Config, ScoringWeights};
pub use embedding::{EmbeddingProvider, FastEmbedProvider};
pub use error::{KbError, Result};
pub use generator::{DemoGenerator, GroqGenerator, TextGenerator};
pub use interpret::{InterpretResponse, Interpreter, TransitRequest};
pub use knowledge::{
    default_chunker, paragraph_chunker, ChunkConfig, ChunkRow, Chunker, IngestPipeline,
    IngestReport, KnowledgeStore, LanceKnowledgeStore, MemoryStore, RetrievedRow, SourceDocument,
    SupabaseStore,
};
pub use retrieval::{
    build_query_context, build_synthesis_prompt, HybridRetriever, Mode, QueryContext, ScoredRow,
};
