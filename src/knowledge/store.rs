//! Knowledge Store - 청크 행 타입과 저장소 트레이트
//!
//! 코어는 두 가지 계약에만 의존합니다:
//! - id 기준 upsert (재수집 시 같은 행을 덮어씀)
//! - context 필터 + 벡터 유사도 top-N 검색

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::document::{value_to_field, Metadata};
use crate::error::Result;

/// priority 기본값
pub const DEFAULT_PRIORITY: i64 = 50;

/// version 기본값
pub const DEFAULT_VERSION: &str = "v1";

// ============================================================================
// Types
// ============================================================================

/// 행에 펼쳐 저장하는 메타데이터 필드
///
/// 없는 선택 필드는 명시적으로 `None`(null)으로 저장됩니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkFields {
    #[serde(default, deserialize_with = "de_field")]
    pub entity_type: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub planet: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub house: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub sign: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub planet_a: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub planet_b: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub aspect: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub transit_by: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub target: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub transit_type: Option<String>,
    #[serde(default, deserialize_with = "de_field")]
    pub context: Option<String>,
    #[serde(default, deserialize_with = "de_priority")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "de_field")]
    pub version: Option<String>,
}

impl ChunkFields {
    /// 프런트매터에서 필드 추출 (priority/version은 기본값 적용)
    pub fn from_metadata(meta: &Metadata) -> Self {
        let get = |key: &str| meta.get(key).and_then(value_to_field);

        Self {
            entity_type: get("entity_type"),
            planet: get("planet"),
            house: get("house"),
            sign: get("sign"),
            planet_a: get("planet_a"),
            planet_b: get("planet_b"),
            aspect: get("aspect"),
            transit_by: get("transit_by"),
            target: get("target"),
            transit_type: get("transit_type"),
            context: get("context"),
            priority: Some(
                meta.get("priority")
                    .and_then(priority_from_value)
                    .unwrap_or(DEFAULT_PRIORITY),
            ),
            version: Some(get("version").unwrap_or_else(|| DEFAULT_VERSION.to_string())),
        }
    }

    /// 이름으로 필드 조회 (facet 매칭용)
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match name {
            "entity_type" => &self.entity_type,
            "planet" => &self.planet,
            "house" => &self.house,
            "sign" => &self.sign,
            "planet_a" => &self.planet_a,
            "planet_b" => &self.planet_b,
            "aspect" => &self.aspect,
            "transit_by" => &self.transit_by,
            "target" => &self.target,
            "transit_type" => &self.transit_type,
            "context" => &self.context,
            "version" => &self.version,
            "priority" => return self.priority.map(|p| p.to_string()),
            _ => return None,
        };
        value.clone()
    }
}

/// 저장용 청크 행
#[derive(Debug, Clone, Serialize)]
pub struct ChunkRow {
    /// `{document.id}-{index:02}`
    pub id: String,
    pub text: String,
    /// 프런트매터 전체
    pub metadata: Metadata,
    #[serde(flatten)]
    pub fields: ChunkFields,
    pub embedding: Vec<f32>,
}

/// 검색된 행
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedRow {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub fields: ChunkFields,
    /// 저장소가 돌려주는 경우의 벡터 유사도
    #[serde(default)]
    pub similarity: Option<f32>,
}

impl RetrievedRow {
    /// 저장된 행 + 유사도
    pub fn from_chunk(row: &ChunkRow, similarity: Option<f32>) -> Self {
        Self {
            id: row.id.clone(),
            text: row.text.clone(),
            metadata: Some(Value::Object(row.metadata.clone())),
            fields: row.fields.clone(),
            similarity,
        }
    }

    /// 이름으로 필드 조회
    ///
    /// 펼쳐진 컬럼에 없는 키는 원본 메타데이터에서 찾습니다.
    pub fn field(&self, name: &str) -> Option<String> {
        if name == "id" {
            return Some(self.id.clone());
        }
        self.fields.get(name).or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get(name))
                .and_then(value_to_field)
        })
    }
}

/// 청크 ID 생성
pub fn chunk_id(doc_id: &str, index: usize) -> String {
    format!("{}-{:02}", doc_id, index)
}

// ============================================================================
// KnowledgeStore Trait
// ============================================================================

/// 지식 저장소 트레이트 (async)
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// id 기준 upsert, 처리한 행 수 반환
    async fn upsert(&self, rows: &[ChunkRow]) -> Result<usize>;

    /// context 필터 + 벡터 유사도 순 top-N
    async fn semantic_search(
        &self,
        query_embedding: &[f32],
        context: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedRow>>;

    /// 저장된 행 수
    async fn count(&self) -> Result<usize>;

    /// 저장소 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산 (-1.0 ~ 1.0)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

fn priority_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// 문자열/숫자/불리언 모두 문자열 필드로 받음 (house: 1 과 "1")
fn de_field<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_to_field))
}

fn de_priority<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(priority_from_value))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_chunk_id_zero_padded() {
        assert_eq!(chunk_id("mars-h1", 0), "mars-h1-00");
        assert_eq!(chunk_id("mars-h1", 7), "mars-h1-07");
        assert_eq!(chunk_id("mars-h1", 123), "mars-h1-123");
    }

    #[test]
    fn test_fields_from_metadata() {
        let fields = ChunkFields::from_metadata(&meta(json!({
            "id": "mars-h1",
            "entity_type": "planet_house",
            "planet": "Mars",
            "house": 1,
            "context": "natal",
        })));

        assert_eq!(fields.house.as_deref(), Some("1"));
        assert_eq!(fields.priority, Some(DEFAULT_PRIORITY));
        assert_eq!(fields.version.as_deref(), Some(DEFAULT_VERSION));
        assert_eq!(fields.sign, None);
        assert_eq!(fields.get("planet").as_deref(), Some("Mars"));
        assert_eq!(fields.get("priority").as_deref(), Some("50"));
        assert_eq!(fields.get("unknown"), None);
    }

    #[test]
    fn test_priority_parsing() {
        let fields = ChunkFields::from_metadata(&meta(json!({"priority": "80"})));
        assert_eq!(fields.priority, Some(80));

        let fields = ChunkFields::from_metadata(&meta(json!({"priority": "high"})));
        assert_eq!(fields.priority, Some(DEFAULT_PRIORITY));
    }

    #[test]
    fn test_chunk_row_serializes_nulls() {
        let row = ChunkRow {
            id: "a-00".to_string(),
            text: "t".to_string(),
            metadata: meta(json!({"id": "a"})),
            fields: ChunkFields::from_metadata(&meta(json!({"context": "natal"}))),
            embedding: vec![0.5, 0.5],
        };

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["id"], "a-00");
        assert_eq!(value["context"], "natal");
        assert_eq!(value["planet"], Value::Null);
        assert_eq!(value["priority"], 50);
        assert_eq!(value["embedding"], json!([0.5, 0.5]));
    }

    #[test]
    fn test_retrieved_row_lenient_deserialize() {
        let row: RetrievedRow = serde_json::from_value(json!({
            "id": "mars-h1-00",
            "text": "Mars...",
            "entity_type": "planet_house",
            "house": 1,
            "priority": 80,
            "context": "natal",
            "similarity": 0.83,
            "metadata": {"id": "mars-h1", "keywords": "drive"}
        }))
        .unwrap();

        assert_eq!(row.fields.house.as_deref(), Some("1"));
        assert_eq!(row.fields.priority, Some(80));
        assert_eq!(row.similarity, Some(0.83));
        assert_eq!(row.field("id").as_deref(), Some("mars-h1-00"));
        // 펼쳐진 컬럼에 없으면 메타데이터에서
        assert_eq!(row.field("keywords").as_deref(), Some("drive"));
        assert_eq!(row.field("sign"), None);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
