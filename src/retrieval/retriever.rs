//! 하이브리드 검색 - 벡터 검색 + facet/priority 재정렬
//!
//! 1. QueryContext → 질의 문자열 → 임베딩
//! 2. context 필터 벡터 검색 (top_k * oversample_factor 후보)
//! 3. blended score로 로컬 재정렬 후 top_k 절단
//!
//! blended score = priority / priority_divisor
//!               + facet 필드 일치마다 facet_field_bonus
//!               + similarity_weight * similarity (저장소가 돌려준 경우)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::query::{is_truthy, QueryContext};
use crate::config::{RetrievalConfig, ScoringWeights};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, Result};
use crate::knowledge::{value_to_field, KnowledgeStore, RetrievedRow};

// ============================================================================
// Types
// ============================================================================

/// 점수가 매겨진 검색 결과
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRow {
    #[serde(flatten)]
    pub row: RetrievedRow,
    /// blended score (높을수록 좋음)
    pub score: f32,
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
///
/// 임베딩 제공자와 저장소는 호출자가 만들어 넘겨줍니다 (공유 `Arc`).
pub struct HybridRetriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
    weights: ScoringWeights,
    oversample_factor: usize,
    timeout: Option<Duration>,
}

impl HybridRetriever {
    /// 기본 가중치로 생성
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, store: Arc<dyn KnowledgeStore>) -> Self {
        Self::from_config(embedder, store, &RetrievalConfig::default())
    }

    /// 검색 설정으로 생성
    pub fn from_config(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn KnowledgeStore>,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            weights: config.weights.clone(),
            oversample_factor: config.oversample_factor.max(1),
            timeout: config.timeout(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// 검색 (관련도 순, 최대 top_k개)
    pub async fn search(&self, ctx: &QueryContext, top_k: usize) -> Result<Vec<RetrievedRow>> {
        let scored = self.search_scored(ctx, top_k).await?;
        Ok(scored.into_iter().map(|s| s.row).collect())
    }

    /// 검색 (점수 포함)
    pub async fn search_scored(&self, ctx: &QueryContext, top_k: usize) -> Result<Vec<ScoredRow>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        // 1. 질의 임베딩
        let query = ctx.query_text();
        let embedding = self
            .with_deadline("embedding", self.embedder.embed(&query))
            .await?;

        // 2. context 필터 벡터 검색 (재정렬용 오버샘플)
        let limit = top_k.saturating_mul(self.oversample_factor);
        let candidates = self
            .with_deadline(
                "semantic search",
                self.store
                    .semantic_search(&embedding, ctx.required_filter(), limit),
            )
            .await?;

        let fetched = candidates.len();
        let candidates: Vec<RetrievedRow> = candidates
            .into_iter()
            .filter(|row| match row.fields.context.as_deref() {
                Some(context) => context == ctx.required_filter(),
                None => true,
            })
            .collect();

        if candidates.len() < fetched {
            tracing::debug!(
                "Dropped {} candidate(s) outside context '{}'",
                fetched - candidates.len(),
                ctx.required_filter()
            );
        }

        // 3. 로컬 재정렬
        let ranked = rerank(candidates, ctx, &self.weights, top_k);

        tracing::info!(
            "Retrieved {} of {} candidate(s) from {} (context={}, facets={})",
            ranked.len(),
            fetched,
            self.store.name(),
            ctx.required_filter(),
            ctx.facets.len()
        );

        Ok(ranked)
    }

    async fn with_deadline<T, F>(&self, operation: &'static str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.timeout {
            Some(after) => tokio::time::timeout(after, future)
                .await
                .map_err(|_| KbError::Timeout { operation, after })?,
            None => future.await,
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

/// blended score 계산
///
/// 같은 facet이 여러 번 들어 있으면 일치 보너스도 그만큼 누적됩니다.
pub fn blended_score(row: &RetrievedRow, ctx: &QueryContext, weights: &ScoringWeights) -> f32 {
    let priority = row.fields.priority.unwrap_or(weights.default_priority) as f32;
    let mut score = if weights.priority_divisor > 0.0 {
        priority / weights.priority_divisor
    } else {
        0.0
    };

    for facet in &ctx.facets {
        for (key, value) in facet.fields() {
            if !is_truthy(value) {
                continue;
            }
            if value_to_field(value) == row.field(key) {
                score += weights.facet_field_bonus;
            }
        }
    }

    if let Some(similarity) = row.similarity {
        score += weights.similarity_weight * similarity;
    }

    score
}

/// 점수 내림차순 안정 정렬 후 top_k 절단 (동점은 저장소 순서 유지)
pub fn rerank(
    rows: Vec<RetrievedRow>,
    ctx: &QueryContext,
    weights: &ScoringWeights,
    top_k: usize,
) -> Vec<ScoredRow> {
    let mut scored: Vec<ScoredRow> = rows
        .into_iter()
        .map(|row| {
            let score = blended_score(&row, ctx, weights);
            ScoredRow { row, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(top_k);
    scored
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::testing::HashEmbedder;
    use crate::knowledge::{ChunkFields, ChunkRow, Metadata, MemoryStore};
    use crate::retrieval::query::{build_query_context, Mode, Placements};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    fn object(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn row(meta: Value, similarity: Option<f32>) -> RetrievedRow {
        let meta = object(meta);
        RetrievedRow {
            id: meta
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("?")
                .to_string(),
            text: "note".to_string(),
            metadata: Some(Value::Object(meta.clone())),
            fields: ChunkFields::from_metadata(&meta),
            similarity,
        }
    }

    fn natal_mars_ctx() -> QueryContext {
        let placements: Placements = object(json!({"Mars": {"house": 1}}));
        build_query_context(Mode::Natal, &placements, None).unwrap()
    }

    fn no_similarity() -> ScoringWeights {
        ScoringWeights {
            similarity_weight: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_blended_score_components() {
        let ctx = natal_mars_ctx();
        let weights = ScoringWeights::default();

        let matching = row(
            json!({"id": "mars-h1-00", "entity_type": "planet_house", "planet": "Mars", "house": 1, "priority": 80}),
            None,
        );
        // 0.8 + 3 * 0.05
        assert!((blended_score(&matching, &ctx, &weights) - 0.95).abs() < 1e-5);

        let unrelated = row(json!({"id": "venus-h7-00", "entity_type": "planet_house"}), None);
        // priority 기본값 50 + entity_type 일치
        assert!((blended_score(&unrelated, &ctx, &weights) - 0.55).abs() < 1e-5);

        let with_similarity = row(json!({"id": "x"}), Some(0.4));
        assert!((blended_score(&with_similarity, &ctx, &weights) - 0.9).abs() < 1e-5);
        assert!((blended_score(&with_similarity, &ctx, &no_similarity()) - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_falsy_facet_values_never_match() {
        let placements: Placements = object(json!({"Moon": {"house": null, "sign": ""}}));
        let ctx = build_query_context(Mode::Natal, &placements, None).unwrap();

        let row = row(json!({"id": "moon", "entity_type": "other", "planet": "Moon"}), None);
        // planet 일치 2회만 (house: null, sign: "" 은 무시)
        let expected = 0.5 + 2.0 * 0.05;
        assert!((blended_score(&row, &ctx, &no_similarity()) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_duplicate_facets_amplify() {
        let single = natal_mars_ctx();
        let mut doubled = single.clone();
        doubled.facets.push(single.facets[0].clone());

        let row = row(
            json!({"id": "mars-h1-00", "entity_type": "planet_house", "planet": "Mars", "house": 1}),
            None,
        );
        let weights = ScoringWeights::default();
        assert!(blended_score(&row, &doubled, &weights) > blended_score(&row, &single, &weights));
    }

    #[test]
    fn test_rerank_is_stable_and_bounded() {
        let ctx = natal_mars_ctx();
        let rows = vec![
            row(json!({"id": "a", "priority": 50}), None),
            row(json!({"id": "b", "priority": 50}), None),
            row(json!({"id": "c", "priority": 90}), None),
            row(json!({"id": "d", "priority": 50}), None),
        ];

        let ranked = rerank(rows, &ctx, &ScoringWeights::default(), 3);
        let ids: Vec<_> = ranked.iter().map(|s| s.row.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));

        assert!(rerank(Vec::new(), &ctx, &ScoringWeights::default(), 5).is_empty());
    }

    fn chunk(id: &str, meta: Value, embedder: &HashEmbedder) -> ChunkRow {
        let meta = object(meta);
        let text = format!("{} interpretation", id);
        ChunkRow {
            id: id.to_string(),
            embedding: embedder.vector(&text),
            text,
            fields: ChunkFields::from_metadata(&meta),
            metadata: meta,
        }
    }

    async fn seeded_store(embedder: &HashEmbedder) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let rows = vec![
            chunk(
                "mars-h1-00",
                json!({"entity_type": "planet_house", "planet": "Mars", "house": 1, "context": "natal", "priority": 60}),
                embedder,
            ),
            chunk(
                "venus-h7-00",
                json!({"entity_type": "planet_house", "planet": "Venus", "house": 7, "context": "natal"}),
                embedder,
            ),
            chunk(
                "moon-leo-00",
                json!({"entity_type": "planet_sign", "planet": "Moon", "sign": "Leo", "context": "natal"}),
                embedder,
            ),
            chunk(
                "saturn-sun-00",
                json!({"entity_type": "transit", "transit_by": "Saturn", "target": "Sun", "context": "transit"}),
                embedder,
            ),
        ];
        store.upsert(&rows).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_filters_context_and_ranks_facet_match_first() {
        let embedder = HashEmbedder::new(32);
        let store = seeded_store(&embedder).await;
        let retriever = HybridRetriever::new(Arc::new(embedder), store)
            .with_weights(no_similarity());

        let ranked = retriever.search_scored(&natal_mars_ctx(), 2).await.unwrap();
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].row.id, "mars-h1-00");
        assert!(ranked[0].score >= ranked[1].score);
        assert!(ranked
            .iter()
            .all(|s| s.row.fields.context.as_deref() == Some("natal")));
    }

    #[tokio::test]
    async fn test_search_empty_store_and_zero_top_k() {
        let retriever = HybridRetriever::new(
            Arc::new(HashEmbedder::new(16)),
            Arc::new(MemoryStore::new()),
        );

        assert!(retriever.search(&natal_mars_ctx(), 12).await.unwrap().is_empty());
        assert!(retriever.search(&natal_mars_ctx(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_propagates() {
        let retriever =
            HybridRetriever::new(Arc::new(HashEmbedder::failing()), Arc::new(MemoryStore::new()));

        let err = retriever.search(&natal_mars_ctx(), 5).await.unwrap_err();
        assert!(matches!(err, KbError::Embedding(_)));
    }

    struct SlowEmbedder;

    #[async_trait]
    impl EmbeddingProvider for SlowEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let retriever = HybridRetriever::new(Arc::new(SlowEmbedder), Arc::new(MemoryStore::new()))
            .with_timeout(Some(Duration::from_millis(20)));

        let err = retriever.search(&natal_mars_ctx(), 5).await.unwrap_err();
        assert!(matches!(
            err,
            KbError::Timeout {
                operation: "embedding",
                ..
            }
        ));
    }
}
