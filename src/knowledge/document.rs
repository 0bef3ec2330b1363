//! Document Loader - 프런트매터 + 본문 파싱
//!
//! ```text
//! ---
//! id: mars-h1
//! entity_type: planet_house
//! context: natal
//! ---
//! 본문...
//! ```

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{KbError, Result};

/// 프런트매터 마커
const FRONT_MATTER_MARKER: &str = "---";

/// 모든 문서에 있어야 하는 메타데이터 필드
pub const REQUIRED_FIELDS: &[&str] = &["id", "entity_type", "context"];

/// 문서 메타데이터 (프런트매터 키-값)
pub type Metadata = Map<String, Value>;

// ============================================================================
// SourceDocument
// ============================================================================

/// 파싱된 원본 문서
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub path: PathBuf,
    pub metadata: Metadata,
    pub body: String,
}

impl SourceDocument {
    /// 파일에서 읽기
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| KbError::io(e, format!("reading {}", path.display())))?;
        Self::parse(path, &text)
    }

    /// 문자열에서 파싱
    ///
    /// 첫 줄이 `---`가 아니면 프런트매터가 없는 것으로 보고 전체를 본문으로 씁니다.
    /// 여는 마커만 있고 닫는 마커가 없으면 `MalformedDocument`.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let text = text.replace("\r\n", "\n");
        let text = text.strip_prefix('\u{feff}').unwrap_or(&text);

        let mut lines = text.split_inclusive('\n');
        let first = lines.next().unwrap_or("");

        if first.trim_end() != FRONT_MATTER_MARKER {
            return Ok(Self {
                path: path.to_path_buf(),
                metadata: Metadata::new(),
                body: text.trim().to_string(),
            });
        }

        let mut block = String::new();
        let mut consumed = first.len();
        let mut closed = false;

        for line in lines {
            consumed += line.len();
            if line.trim_end() == FRONT_MATTER_MARKER {
                closed = true;
                break;
            }
            block.push_str(line);
        }

        if !closed {
            return Err(KbError::MalformedDocument {
                path: path.to_path_buf(),
                reason: "front-matter opened with '---' but never closed".to_string(),
            });
        }

        let metadata = parse_metadata(path, &block)?;
        let body = text.get(consumed..).unwrap_or("").trim().to_string();

        Ok(Self {
            path: path.to_path_buf(),
            metadata,
            body,
        })
    }

    /// 누락된 필수 필드 목록 (null, 빈 문자열도 누락으로 봄)
    pub fn missing_required_fields(&self) -> Vec<String> {
        REQUIRED_FIELDS
            .iter()
            .filter(|field| !is_present(self.metadata.get(**field)))
            .map(|field| field.to_string())
            .collect()
    }

    /// 필수 필드 검증
    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_required_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(KbError::Validation {
                path: self.path.clone(),
                missing,
            })
        }
    }

    /// 문서 ID (검증 후에는 항상 존재)
    pub fn id(&self) -> Option<String> {
        self.metadata.get("id").and_then(value_to_field)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// YAML 블록 → 메타데이터 맵
fn parse_metadata(path: &Path, block: &str) -> Result<Metadata> {
    if block.trim().is_empty() {
        return Ok(Metadata::new());
    }

    let value: Value = serde_yaml::from_str(block).map_err(|e| KbError::MalformedDocument {
        path: path.to_path_buf(),
        reason: format!("invalid front-matter: {}", e),
    })?;

    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Metadata::new()),
        other => Err(KbError::MalformedDocument {
            path: path.to_path_buf(),
            reason: format!("front-matter must be a mapping, got {}", type_name(&other)),
        }),
    }
}

fn is_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// 메타데이터 값 → 행 필드 문자열 (null은 None)
///
/// 숫자 `1`과 문자열 `"1"`은 같은 필드 값이 됩니다.
pub fn value_to_field(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

// ============================================================================
// Tests
// ============================================================================
