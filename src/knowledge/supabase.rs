//! Supabase Knowledge Store - PostgREST upsert + pgvector RPC
//!
//! - upsert: `POST /rest/v1/{table}?on_conflict=id` (merge-duplicates)
//! - 검색: `POST /rest/v1/rpc/{search_rpc}` `{q_embedding, p_context, p_topk}`
//!
//! RPC 함수는 context로 필터링하고 벡터 유사도 순으로 행을 돌려줘야 합니다.
//! `similarity` 컬럼은 선택입니다.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use url::Url;

use super::store::{ChunkRow, KnowledgeStore, RetrievedRow};
use crate::config::StoreConfig;
use crate::error::{KbError, Result};

/// 전송 실패/429/5xx 시 최대 재시도 횟수
const MAX_RETRIES: u32 = 3;
/// 재시도 시 초기 백오프 (ms)
const INITIAL_BACKOFF_MS: u64 = 500;
/// HTTP 타임아웃
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// RPC 요청 본문
#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    q_embedding: &'a [f32],
    p_context: &'a str,
    p_topk: usize,
}

// ============================================================================
// SupabaseStore
// ============================================================================

/// Supabase (PostgREST) 지식 저장소
#[derive(Debug)]
pub struct SupabaseStore {
    client: reqwest::Client,
    rest_base: Url,
    key: String,
    table: String,
    search_rpc: String,
    initial_backoff: Duration,
}

impl SupabaseStore {
    /// 새 저장소 클라이언트 생성
    ///
    /// # Arguments
    /// * `project_url` - `https://<project>.supabase.co`
    /// * `key` - anon 또는 service role 키
    pub fn new(project_url: &str, key: String, table: &str, search_rpc: &str) -> Result<Self> {
        let rest_base = rest_base_url(project_url)?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| KbError::Store(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rest_base,
            key,
            table: table.to_string(),
            search_rpc: search_rpc.to_string(),
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    /// 첫 재시도 대기 시간 변경 (이후 2배씩 증가)
    pub fn with_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// 설정에서 생성
    ///
    /// 쓰기용은 service key 필수, 읽기용은 anon key 우선.
    pub fn from_config(config: &StoreConfig, write: bool) -> Result<Self> {
        let url = config.supabase_url.as_deref().ok_or_else(|| {
            KbError::Config("SUPABASE_URL is not set (store.supabase_url)".to_string())
        })?;

        let key = if write {
            config.write_key().ok_or_else(|| {
                KbError::Config("SUPABASE_SERVICE_KEY is required for ingestion".to_string())
            })?
        } else {
            config.read_key().ok_or_else(|| {
                KbError::Config(
                    "SUPABASE_ANON_KEY or SUPABASE_SERVICE_KEY must be set".to_string(),
                )
            })?
        };

        Self::new(url, key.to_string(), &config.table, &config.search_rpc)
    }

    fn table_url(&self) -> Result<Url> {
        join(&self.rest_base, &self.table)
    }

    fn rpc_url(&self) -> Result<Url> {
        join(&self.rest_base, &format!("rpc/{}", self.search_rpc))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(self.key.trim())
            .map_err(|_| KbError::Config("invalid Supabase key".to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.key.trim()))
            .map_err(|_| KbError::Config("invalid Supabase key".to_string()))?;

        headers.insert("apikey", key);
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// 재시도 포함 요청 전송 (전송 실패/429/5xx는 지수 백오프)
    async fn send_with_retry<F>(&self, operation: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last_error = String::new();

        for attempt in 0..=MAX_RETRIES {
            let backoff = self.initial_backoff * 2u32.pow(attempt);

            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    let body = response.text().await.unwrap_or_default();
                    last_error = format!("{} ({}): {}", operation, status, body);

                    if !is_retryable(status) {
                        return Err(KbError::Store(last_error));
                    }
                }
                Err(e) => {
                    last_error = format!("{}: {}", operation, e);
                }
            }

            if attempt < MAX_RETRIES {
                tracing::warn!(
                    "{} failed, retrying in {:?} (attempt {}/{})",
                    operation,
                    backoff,
                    attempt + 1,
                    MAX_RETRIES
                );
                tokio::time::sleep(backoff).await;
            }
        }

        Err(KbError::Store(format!(
            "{} (after {} retries)",
            last_error, MAX_RETRIES
        )))
    }
}

#[async_trait]
impl KnowledgeStore for SupabaseStore {
    async fn upsert(&self, rows: &[ChunkRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut url = self.table_url()?;
        url.query_pairs_mut().append_pair("on_conflict", "id");
        let headers = self.headers()?;

        self.send_with_retry("upsert", || {
            self.client
                .post(url.clone())
                .headers(headers.clone())
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(rows)
        })
        .await?;

        tracing::debug!("Upserted {} row(s) into {}", rows.len(), self.table);
        Ok(rows.len())
    }

    async fn semantic_search(
        &self,
        query_embedding: &[f32],
        context: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedRow>> {
        let url = self.rpc_url()?;
        let headers = self.headers()?;
        let request = SearchRequest {
            q_embedding: query_embedding,
            p_context: context,
            p_topk: limit,
        };

        let response = self
            .send_with_retry("semantic search", || {
                self.client
                    .post(url.clone())
                    .headers(headers.clone())
                    .json(&request)
            })
            .await?;

        let body = response
            .text()
            .await
            .map_err(|e| KbError::Store(format!("Failed to read search response: {}", e)))?;

        parse_search_response(&body)
    }

    async fn count(&self) -> Result<usize> {
        let mut url = self.table_url()?;
        url.query_pairs_mut().append_pair("select", "id");
        let headers = self.headers()?;

        let response = self
            .send_with_retry("count", || {
                self.client
                    .get(url.clone())
                    .headers(headers.clone())
                    .header("Prefer", "count=exact")
                    .header("Range", "0-0")
            })
            .await?;

        let content_range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        parse_content_range_total(content_range).ok_or_else(|| {
            KbError::Store(format!("unexpected Content-Range: '{}'", content_range))
        })
    }

    fn name(&self) -> &str {
        "supabase"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// `https://x.supabase.co` → `https://x.supabase.co/rest/v1/`
fn rest_base_url(project_url: &str) -> Result<Url> {
    let mut base = project_url.trim().trim_end_matches('/').to_string();
    base.push_str("/rest/v1/");
    Url::parse(&base).map_err(|e| KbError::Config(format!("invalid SUPABASE_URL '{}': {}", project_url, e)))
}

fn join(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| KbError::Config(format!("invalid REST path '{}': {}", path, e)))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// 빈 본문/null은 빈 결과
fn parse_search_response(body: &str) -> Result<Vec<RetrievedRow>> {
    if body.trim().is_empty() || body.trim() == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(body)
        .map_err(|e| KbError::Store(format!("Failed to parse search response: {}", e)))
}

/// `0-0/123` → 123, `*/0` → 0
fn parse_content_range_total(value: &str) -> Option<usize> {
    value.rsplit('/').next()?.trim().parse().ok()
}

// ============================================================================
// Tests
// ============================================================================
