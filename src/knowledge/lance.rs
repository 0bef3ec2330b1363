//! LanceDB Knowledge Store - 로컬 임베디드 벡터 저장소
//!
//! - upsert: `id` 기준 merge_insert
//! - 검색: context 프리필터 + 코사인 거리 ANN
//!
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;

use super::store::{ChunkFields, ChunkRow, KnowledgeStore, RetrievedRow};
use crate::error::{KbError, Result};

/// 청크 테이블 이름
const TABLE_NAME: &str = "astro_kb_chunks";

/// 펼쳐 저장하는 문자열 메타데이터 컬럼
const STRING_FIELDS: &[&str] = &[
    "entity_type",
    "planet",
    "house",
    "sign",
    "planet_a",
    "planet_b",
    "aspect",
    "transit_by",
    "target",
    "transit_type",
    "context",
    "version",
];

fn store_err(context: &str, e: impl std::fmt::Display) -> KbError {
    KbError::Store(format!("{}: {}", context, e))
}

// ============================================================================
// LanceKnowledgeStore
// ============================================================================

/// LanceDB 지식 저장소 구현
pub struct LanceKnowledgeStore {
    db: Connection,
    dimension: usize,
}

impl LanceKnowledgeStore {
    /// LanceDB 저장소 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원 (모델과 일치해야 함)
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| KbError::io(e, "creating LanceDB directory"))?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| KbError::Store("Invalid path encoding".to_string()))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .map_err(|e| store_err("Failed to connect to LanceDB", e))?;

        Ok(Self { db, dimension })
    }

    /// 청크 테이블 스키마
    fn create_schema(dimension: usize) -> Schema {
        let mut fields = vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, true),
        ];
        fields.extend(
            STRING_FIELDS
                .iter()
                .map(|name| Field::new(*name, DataType::Utf8, true)),
        );
        fields.push(Field::new("priority", DataType::Int64, true));
        fields.push(Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension as i32,
            ),
            false,
        ));
        Schema::new(fields)
    }

    /// 행들을 Arrow RecordBatch로 변환
    fn rows_to_batch(&self, rows: &[ChunkRow]) -> Result<RecordBatch> {
        if rows.is_empty() {
            return Err(KbError::Store("Cannot create batch from empty rows".to_string()));
        }

        for row in rows {
            if row.embedding.len() != self.dimension {
                return Err(KbError::Store(format!(
                    "row {} has dimension {}, table expects {}",
                    row.id,
                    row.embedding.len(),
                    self.dimension
                )));
            }
        }

        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let texts: Vec<&str> = rows.iter().map(|r| r.text.as_str()).collect();
        let metadata: Vec<Option<String>> = rows
            .iter()
            .map(|r| serde_json::to_string(&r.metadata).ok())
            .collect();

        let mut columns: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(metadata)),
        ];

        for name in STRING_FIELDS {
            let values: Vec<Option<String>> = rows.iter().map(|r| r.fields.get(name)).collect();
            columns.push(Arc::new(StringArray::from(values)));
        }

        let priorities: Vec<Option<i64>> = rows.iter().map(|r| r.fields.priority).collect();
        columns.push(Arc::new(Int64Array::from(priorities)));

        // 임베딩을 FixedSizeList로 변환
        let embeddings_flat: Vec<f32> = rows
            .iter()
            .flat_map(|r| r.embedding.iter().copied())
            .collect();
        let values = Float32Array::from(embeddings_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .map_err(|e| store_err("Failed to create embedding array", e))?;
        columns.push(Arc::new(embeddings_list));

        RecordBatch::try_new(Arc::new(Self::create_schema(self.dimension)), columns)
            .map_err(|e| store_err("Failed to create RecordBatch", e))
    }

    /// 테이블 존재 여부 확인 (목록 조회 실패는 에러)
    async fn table_exists(&self) -> Result<bool> {
        contains_table(self.db.table_names().execute().await)
    }

    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| store_err("Failed to open table", e))
    }

    /// RecordBatch → 검색 결과 행
    fn batch_to_rows(batch: &RecordBatch) -> Result<Vec<RetrievedRow>> {
        let ids = string_column(batch, "id")?;
        let texts = string_column(batch, "text")?;
        let metadata = string_column(batch, "metadata")?;
        let priorities = batch
            .column_by_name("priority")
            .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
            .ok_or_else(|| KbError::Store("Missing priority column".to_string()))?;

        // _distance 컬럼 (LanceDB가 자동 추가)
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        let mut string_fields = Vec::with_capacity(STRING_FIELDS.len());
        for name in STRING_FIELDS {
            string_fields.push((*name, string_column(batch, name)?));
        }

        let mut rows = Vec::with_capacity(batch.num_rows());
        for i in 0..batch.num_rows() {
            let get = |name: &str| {
                string_fields
                    .iter()
                    .find(|(n, _)| *n == name)
                    .and_then(|(_, col)| optional_str(col, i))
            };

            let fields = ChunkFields {
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
                priority: (!priorities.is_null(i)).then(|| priorities.value(i)),
                version: get("version"),
            };

            // 코사인 거리 → 유사도
            let similarity = distances
                .filter(|d| !d.is_null(i))
                .map(|d| 1.0 - d.value(i));

            rows.push(RetrievedRow {
                id: ids.value(i).to_string(),
                text: texts.value(i).to_string(),
                metadata: optional_str(metadata, i).and_then(|m| serde_json::from_str(&m).ok()),
                fields,
                similarity,
            });
        }

        Ok(rows)
    }
}

#[async_trait]
impl KnowledgeStore for LanceKnowledgeStore {
    async fn upsert(&self, rows: &[ChunkRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let batch = self.rows_to_batch(rows)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if self.table_exists().await? {
            let table = self.open_table().await?;
            let mut merge = table.merge_insert(&["id"]);
            merge.when_matched_update_all(None).when_not_matched_insert_all();
            merge
                .execute(Box::new(batches))
                .await
                .map_err(|e| store_err("Failed to upsert rows", e))?;
        } else {
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| store_err("Failed to create table", e))?;
        }

        tracing::debug!("Upserted {} row(s) into LanceDB", rows.len());
        Ok(rows.len())
    }

    async fn semantic_search(
        &self,
        query_embedding: &[f32],
        context: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedRow>> {
        if !self.table_exists().await? {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;
        let filter = format!("context = '{}'", context.replace('\'', "''"));

        let stream = table
            .vector_search(query_embedding.to_vec())
            .map_err(|e| store_err("Failed to create vector search", e))?
            .distance_type(DistanceType::Cosine)
            .only_if(filter)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| store_err("Failed to execute vector search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| store_err("Failed to read search results", e))?;

        let mut rows = Vec::new();
        for batch in &batches {
            rows.extend(Self::batch_to_rows(batch)?);
        }
        Ok(rows)
    }

    async fn count(&self) -> Result<usize> {
        if !self.table_exists().await? {
            return Ok(0);
        }

        self.open_table()
            .await?
            .count_rows(None)
            .await
            .map_err(|e| store_err("Failed to count rows", e))
    }

    fn name(&self) -> &str {
        "lancedb"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn contains_table<E: std::fmt::Display>(
    names: std::result::Result<Vec<String>, E>,
) -> Result<bool> {
    names
        .map(|names| names.iter().any(|n| n == TABLE_NAME))
        .map_err(|e| store_err("Failed to list tables", e))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| KbError::Store(format!("Missing {} column", name)))
}

fn optional_str(column: &StringArray, i: usize) -> Option<String> {
    if column.is_null(i) {
        None
    } else {
        Some(column.value(i).to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
