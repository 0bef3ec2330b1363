//! Ingestion Pipeline - 문서 → 청크 → 임베딩 → upsert
//!
//! 문서 단위 에러(검증 실패, 프런트매터 손상)는 그 문서만 건너뛰고,
//! 임베딩/저장소 에러는 실행 전체를 중단합니다. 청크 ID가 결정적이므로
//! 같은 코퍼스를 다시 수집해도 데이터는 바뀌지 않습니다.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ignore::WalkBuilder;

use super::chunker::Chunker;
use super::document::SourceDocument;
use super::store::{chunk_id, ChunkFields, ChunkRow, KnowledgeStore};
use crate::embedding::EmbeddingProvider;
use crate::error::{KbError, Result};

// ============================================================================
// Types
// ============================================================================

/// 수집 옵션
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// upsert 배치 크기 (행 수, 최소 1)
    pub batch_size: usize,
    /// 수집할 확장자 (점 없이)
    pub extensions: Vec<String>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: 200,
            extensions: vec!["md".to_string()],
        }
    }
}

/// 건너뛴 문서
#[derive(Debug, Clone)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

/// 수집 결과 보고
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// 발견한 문서 수
    pub documents_scanned: usize,
    /// 청크를 만든 문서 수
    pub documents_ingested: usize,
    /// upsert한 (dry-run이면 만들어진) 청크 수
    pub chunks_upserted: usize,
    /// upsert 호출 수
    pub batches: usize,
    pub skipped: Vec<SkippedDocument>,
}

impl IngestReport {
    /// 대상 문서가 하나도 없었는지
    pub fn is_empty_corpus(&self) -> bool {
        self.documents_scanned == 0
    }

    fn skip(&mut self, path: &Path, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!("Skipping {}: {}", path.display(), reason);
        self.skipped.push(SkippedDocument {
            path: path.to_path_buf(),
            reason,
        });
    }
}

/// 검증 + 청킹까지 끝난 문서
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub document: SourceDocument,
    pub doc_id: String,
    /// 앞뒤 공백 제거된 청크 텍스트 (삽입 순서)
    pub texts: Vec<String>,
}

impl PreparedDocument {
    /// 임베딩과 합쳐 저장 행 생성
    pub fn into_rows(self, embeddings: Vec<Vec<f32>>) -> Result<Vec<ChunkRow>> {
        if embeddings.len() != self.texts.len() {
            return Err(KbError::Embedding(format!(
                "{}: expected {} embeddings, got {}",
                self.doc_id,
                self.texts.len(),
                embeddings.len()
            )));
        }

        let fields = ChunkFields::from_metadata(&self.document.metadata);
        let metadata = self.document.metadata;

        Ok(self
            .texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(i, (text, embedding))| ChunkRow {
                id: chunk_id(&self.doc_id, i),
                text,
                metadata: metadata.clone(),
                fields: fields.clone(),
                embedding,
            })
            .collect())
    }
}

// ============================================================================
// Discovery & Preparation
// ============================================================================

/// 코퍼스 디렉토리 재귀 탐색 (숨김 파일 제외, 경로 정렬)
pub fn discover_documents(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Err(KbError::Config(format!(
            "Directory not found: {}",
            dir.display()
        )));
    }
    if !dir.is_dir() {
        return Err(KbError::Config(format!("Not a directory: {}", dir.display())));
    }

    let mut files = Vec::new();
    let walker = WalkBuilder::new(dir).hidden(true).build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Walk error: {}", e);
                continue;
            }
        };

        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let matches = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
            .unwrap_or(false);

        if matches {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// 문서 하나 로드 → 검증 → 청킹
pub fn prepare_document(path: &Path, chunker: &dyn Chunker) -> Result<PreparedDocument> {
    let document = SourceDocument::load(path)?;
    document.validate()?;

    let doc_id = document.id().ok_or_else(|| KbError::Validation {
        path: path.to_path_buf(),
        missing: vec!["id".to_string()],
    })?;

    let texts: Vec<String> = chunker
        .chunk(&document.body)
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();

    Ok(PreparedDocument {
        document,
        doc_id,
        texts,
    })
}

/// 임베딩/저장 없이 코퍼스를 점검 (dry-run)
pub fn scan_corpus(
    dir: &Path,
    chunker: &dyn Chunker,
    extensions: &[String],
) -> Result<(IngestReport, Vec<PreparedDocument>)> {
    let files = discover_documents(dir, extensions)?;
    let mut report = IngestReport {
        documents_scanned: files.len(),
        ..Default::default()
    };
    let mut prepared = Vec::new();
    let mut seen_ids = HashSet::new();

    for path in &files {
        match prepare_document(path, chunker) {
            Ok(doc) => {
                if !seen_ids.insert(doc.doc_id.clone()) {
                    report.skip(path, format!("duplicate document id '{}'", doc.doc_id));
                    continue;
                }
                if doc.texts.is_empty() {
                    tracing::warn!("No chunks generated for document: {}", path.display());
                    continue;
                }
                report.documents_ingested += 1;
                report.chunks_upserted += doc.texts.len();
                prepared.push(doc);
            }
            Err(e) if e.is_document_error() => report.skip(path, e.to_string()),
            Err(e) => return Err(e),
        }
    }

    Ok((report, prepared))
}

// ============================================================================
// IngestPipeline
// ============================================================================

/// 수집 파이프라인
///
/// 임베더와 저장소는 외부에서 주입합니다.
pub struct IngestPipeline {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn KnowledgeStore>,
    chunker: Box<dyn Chunker>,
    options: IngestOptions,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn KnowledgeStore>,
        chunker: Box<dyn Chunker>,
        mut options: IngestOptions,
    ) -> Self {
        options.batch_size = options.batch_size.max(1);
        Self {
            embedder,
            store,
            chunker,
            options,
        }
    }

    /// 디렉토리 전체 수집
    ///
    /// 문서별로 청크를 한 번에 임베딩하고, 행은 `batch_size` 단위로 upsert합니다.
    pub async fn ingest_dir(&self, dir: &Path) -> Result<IngestReport> {
        let files = discover_documents(dir, &self.options.extensions)?;
        let mut report = IngestReport {
            documents_scanned: files.len(),
            ..Default::default()
        };

        if files.is_empty() {
            tracing::warn!(
                "No documents with extensions {:?} found in {}",
                self.options.extensions,
                dir.display()
            );
            return Ok(report);
        }

        let mut pending: Vec<ChunkRow> = Vec::new();
        let mut seen_ids = HashSet::new();

        for path in &files {
            let prepared = match prepare_document(path, self.chunker.as_ref()) {
                Ok(p) => p,
                Err(e) if e.is_document_error() => {
                    report.skip(path, e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !seen_ids.insert(prepared.doc_id.clone()) {
                report.skip(path, format!("duplicate document id '{}'", prepared.doc_id));
                continue;
            }

            if prepared.texts.is_empty() {
                tracing::warn!("No chunks generated for document: {}", path.display());
                continue;
            }

            // 문서당 임베딩 호출 1회
            let embeddings = self.embedder.embed_batch(&prepared.texts).await?;
            let doc_id = prepared.doc_id.clone();
            let rows = prepared.into_rows(embeddings)?;

            tracing::info!(
                "Prepared document: {} (id={}, chunks={})",
                path.display(),
                doc_id,
                rows.len()
            );

            report.documents_ingested += 1;
            pending.extend(rows);

            while pending.len() >= self.options.batch_size {
                let batch: Vec<ChunkRow> = pending.drain(..self.options.batch_size).collect();
                self.flush(&batch, &mut report).await?;
            }
        }

        if !pending.is_empty() {
            self.flush(&pending, &mut report).await?;
        }

        tracing::info!(
            "Ingestion finished: scanned={}, ingested={}, chunks={}, skipped={}",
            report.documents_scanned,
            report.documents_ingested,
            report.chunks_upserted,
            report.skipped.len()
        );

        Ok(report)
    }

    async fn flush(&self, batch: &[ChunkRow], report: &mut IngestReport) -> Result<()> {
        let written = self.store.upsert(batch).await?;
        report.chunks_upserted += written;
        report.batches += 1;
        tracing::debug!(
            "Upserted batch #{} ({} rows) into {}",
            report.batches,
            written,
            self.store.name()
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
