//! Retrieval 모듈 - 질의 컨텍스트, 하이브리드 검색, 프롬프트 조립

mod prompt;
mod query;
mod retriever;

// Re-exports
pub use prompt::{build_synthesis_prompt, to_bullets};
pub use query::{build_query_context, is_truthy, Facet, Mode, Placements, QueryContext, ASPECTS_KEY};
pub use retriever::{blended_score, rerank, HybridRetriever, ScoredRow};
