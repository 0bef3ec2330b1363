//! 해석 서비스 - 요청 경계
//!
//! placements(+transits) → QueryContext → 검색 → 프롬프트 → 생성기

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::generator::TextGenerator;
use crate::knowledge::RetrievedRow;
use crate::retrieval::{
    build_query_context, build_synthesis_prompt, HybridRetriever, Mode, Placements, QueryContext,
};

/// 요청당 기본 검색 개수
pub const DEFAULT_TOP_K: usize = 12;

/// 트랜싯 요청 본문
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitRequest {
    #[serde(default)]
    pub placements: Placements,
    #[serde(default)]
    pub transits: Vec<Value>,
}

/// 해석 응답
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpretResponse {
    pub ok: bool,
    pub interpretation: String,
    /// 프롬프트에 들어간 청크 id (순위 순)
    pub chunks_used: Vec<String>,
}

/// 검색 + 프롬프트까지만 수행한 결과
#[derive(Debug, Clone)]
pub struct PreparedPrompt {
    pub context: QueryContext,
    pub rows: Vec<RetrievedRow>,
    pub prompt: String,
}

/// 해석기
pub struct Interpreter {
    retriever: HybridRetriever,
    generator: Arc<dyn TextGenerator>,
    top_k: usize,
}

impl Interpreter {
    pub fn new(retriever: HybridRetriever, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            retriever,
            generator,
            top_k: DEFAULT_TOP_K,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// 출생 차트 해석
    pub async fn interpret_natal(&self, placements: &Placements) -> Result<InterpretResponse> {
        let prepared = self.prepare(Mode::Natal, placements, None).await?;
        self.respond(prepared).await
    }

    /// 트랜싯 해석
    pub async fn interpret_transit(&self, request: &TransitRequest) -> Result<InterpretResponse> {
        let prepared = self
            .prepare(Mode::Transit, &request.placements, Some(request.transits.as_slice()))
            .await?;
        self.respond(prepared).await
    }

    /// 생성기 호출 없이 프롬프트까지 조립
    pub async fn prepare(
        &self,
        mode: Mode,
        placements: &Placements,
        transits: Option<&[Value]>,
    ) -> Result<PreparedPrompt> {
        let context = build_query_context(mode, placements, transits)?;
        let rows = self.retriever.search(&context, self.top_k).await?;
        let prompt = build_synthesis_prompt(&context, &rows);

        Ok(PreparedPrompt {
            context,
            rows,
            prompt,
        })
    }

    async fn respond(&self, prepared: PreparedPrompt) -> Result<InterpretResponse> {
        let interpretation = self.generator.generate(&prepared.prompt).await?;

        tracing::info!(
            "Interpreted {} request with {} chunk(s) via {}",
            prepared.context.mode,
            prepared.rows.len(),
            self.generator.name()
        );

        Ok(InterpretResponse {
            ok: true,
            interpretation,
            chunks_used: prepared.rows.into_iter().map(|r| r.id).collect(),
        })
    }
}
