//! Knowledge 모듈 - 점성술 지식베이스 수집/저장
//!
//! - Document: 프런트매터 + 본문 파싱
//! - Chunker: 문단 경계 유지 청크 분할
//! - Store: 청크 행 + 저장소 트레이트 (Supabase, LanceDB, Memory)
//! - Ingest: 디렉토리 → 청크 → 임베딩 → upsert

mod chunker;
mod document;
mod ingest;
mod lance;
mod memory;
mod store;
mod supabase;

// Re-exports
pub use chunker::{default_chunker, paragraph_chunker, ChunkConfig, Chunker, ParagraphChunker};
pub use document::{value_to_field, Metadata, SourceDocument, REQUIRED_FIELDS};
pub use ingest::{
    discover_documents, prepare_document, scan_corpus, IngestOptions, IngestPipeline,
    IngestReport, PreparedDocument, SkippedDocument,
};
pub use lance::LanceKnowledgeStore;
pub use memory::MemoryStore;
pub use store::{
    chunk_id, cosine_similarity, ChunkFields, ChunkRow, KnowledgeStore, RetrievedRow,
    DEFAULT_PRIORITY, DEFAULT_VERSION,
};
pub use supabase::SupabaseStore;
