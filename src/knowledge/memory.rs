//! Memory Store - 프로세스 내 지식 저장소
//!
//! 테스트와 일회성 실행용. 브루트포스 코사인 검색을 합니다.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::store::{cosine_similarity, ChunkRow, KnowledgeStore, RetrievedRow};
use crate::error::{KbError, Result};

#[derive(Default)]
struct Inner {
    /// 최초 삽입 순서 유지
    rows: Vec<ChunkRow>,
    /// id → rows 인덱스
    index: HashMap<String, usize>,
}

/// 인메모리 지식 저장소
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장된 id 목록 (삽입 순서)
    pub fn ids(&self) -> Result<Vec<String>> {
        let inner = self.read()?;
        Ok(inner.rows.iter().map(|r| r.id.clone()).collect())
    }

    /// id로 행 조회
    pub fn get(&self, id: &str) -> Result<Option<ChunkRow>> {
        let inner = self.read()?;
        Ok(inner.index.get(id).map(|&i| inner.rows[i].clone()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|e| KbError::Store(format!("Lock error: {}", e)))
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn upsert(&self, rows: &[ChunkRow]) -> Result<usize> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| KbError::Store(format!("Lock error: {}", e)))?;

        for row in rows {
            match inner.index.get(&row.id).copied() {
                Some(i) => inner.rows[i] = row.clone(),
                None => {
                    let i = inner.rows.len();
                    inner.index.insert(row.id.clone(), i);
                    inner.rows.push(row.clone());
                }
            }
        }

        Ok(rows.len())
    }

    async fn semantic_search(
        &self,
        query_embedding: &[f32],
        context: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedRow>> {
        let inner = self.read()?;

        let mut scored: Vec<(f32, &ChunkRow)> = inner
            .rows
            .iter()
            .filter(|row| row.fields.context.as_deref() == Some(context))
            .map(|row| (cosine_similarity(query_embedding, &row.embedding), row))
            .collect();

        // 안정 정렬: 동점이면 삽입 순서
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(similarity, row)| RetrievedRow::from_chunk(row, Some(similarity)))
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read()?.rows.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::store::ChunkFields;

    fn row(id: &str, context: &str, embedding: Vec<f32>) -> ChunkRow {
        ChunkRow {
            id: id.to_string(),
            text: format!("text of {}", id),
            metadata: Default::default(),
            fields: ChunkFields {
                context: Some(context.to_string()),
                ..Default::default()
            },
            embedding,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_by_id() {
        let store = MemoryStore::new();
        store
            .upsert(&[row("a-00", "natal", vec![1.0, 0.0]), row("b-00", "natal", vec![0.0, 1.0])])
            .await
            .unwrap();

        let mut updated = row("a-00", "natal", vec![1.0, 0.0]);
        updated.text = "changed".to_string();
        store.upsert(&[updated]).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.ids().unwrap(), vec!["a-00", "b-00"]);
        assert_eq!(store.get("a-00").unwrap().unwrap().text, "changed");
    }

    #[tokio::test]
    async fn test_search_filters_context_and_ranks() {
        let store = MemoryStore::new();
        store
            .upsert(&[
                row("far", "natal", vec![0.0, 1.0]),
                row("near", "natal", vec![1.0, 0.1]),
                row("transit", "transit", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let results = store.semantic_search(&[1.0, 0.0], "natal", 10).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "far"]);
        assert!(results[0].similarity.unwrap() > results[1].similarity.unwrap());

        let limited = store.semantic_search(&[1.0, 0.0], "natal", 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let empty = MemoryStore::new()
            .semantic_search(&[1.0, 0.0], "natal", 5)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }
}
