//! 에러 타입
//!
//! 문서 단위 에러(검증, 프런트매터)는 해당 문서만 건너뛰고,
//! 인프라 에러(임베딩, 저장소)는 배치/요청 전체를 중단합니다.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// astro-kb 라이브러리 에러
#[derive(Error, Debug)]
pub enum KbError {
    /// 필수 메타데이터 누락
    #[error("ValidationError: {path}: missing required field(s): {}", missing.join(", "))]
    Validation { path: PathBuf, missing: Vec<String> },

    /// 프런트매터 블록 손상 (닫는 마커 없음, YAML 파싱 실패 등)
    #[error("MalformedDocument: {path}: {reason}")]
    MalformedDocument { path: PathBuf, reason: String },

    /// 임베딩 모델 초기화/생성 실패
    #[error("EmbeddingFailure: {0}")]
    Embedding(String),

    /// 지식 저장소 읽기/쓰기 실패
    #[error("StoreError: {0}")]
    Store(String),

    /// 텍스트 생성 백엔드 실패
    #[error("GenerationFailure: {0}")]
    Generation(String),

    /// 잘못된 placements/transits 구조 (클라이언트 입력 에러)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// 원격 호출 데드라인 초과
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO 에러
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },
}

impl KbError {
    /// 문서 하나만 건너뛰면 되는 에러인지
    pub fn is_document_error(&self) -> bool {
        matches!(
            self,
            KbError::Validation { .. } | KbError::MalformedDocument { .. }
        )
    }

    /// 요청 경계에서 4xx로 처리할 에러인지
    pub fn is_client_error(&self) -> bool {
        matches!(self, KbError::InvalidRequest(_))
    }

    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        KbError::Io {
            source,
            context: context.into(),
        }
    }
}

/// astro-kb 결과 타입
pub type Result<T> = std::result::Result<T, KbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = KbError::Validation {
            path: PathBuf::from("kb/mars.md"),
            missing: vec!["entity_type".to_string(), "context".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("entity_type, context"));
        assert!(msg.contains("kb/mars.md"));
    }

    #[test]
    fn test_error_classes() {
        let malformed = KbError::MalformedDocument {
            path: PathBuf::from("a.md"),
            reason: "unterminated".to_string(),
        };
        assert!(malformed.is_document_error());
        assert!(!malformed.is_client_error());

        assert!(!KbError::Store("down".to_string()).is_document_error());
        assert!(KbError::InvalidRequest("bad".to_string()).is_client_error());
    }
}
