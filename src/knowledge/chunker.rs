//! Text Chunking Module
//!
//! 문단 경계를 유지하면서 최대 크기 이하의 청크로 나눕니다.
//! 크기는 바이트가 아니라 문자(char) 수 기준입니다.

use std::sync::LazyLock;

use regex::Regex;

/// 빈 줄(공백만 있는 줄 포함) 문단 구분자
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph regex is valid"));

/// 문단을 이어 붙일 때 쓰는 구분자
const PARAGRAPH_JOINER: &str = "\n\n";

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 최대 청크 크기 (문자 수)
    pub max_characters: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_characters: 1200,
        }
    }
}

impl ChunkConfig {
    pub fn with_max_characters(max_characters: usize) -> Self {
        Self {
            max_characters: max_characters.max(1),
        }
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할 (입력에 대한 순수 함수)
    fn chunk(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// ParagraphChunker
// ============================================================================

/// 문단 누적 청커
///
/// - 빈 줄 기준으로 문단 분리
/// - 버퍼 + 구분자 + 다음 문단이 한도 안이면 이어 붙임
/// - 넘치면 버퍼를 청크로 내보내고 새 버퍼 시작
/// - 한도보다 긴 문단 하나는 고정 길이로 잘라냄 (단어 경계 무시)
pub struct ParagraphChunker {
    config: ChunkConfig,
}

impl ParagraphChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 기본 설정으로 생성
    pub fn with_defaults() -> Self {
        Self::new(ChunkConfig::default())
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }
}

impl Chunker for ParagraphChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        let max = self.config.max_characters.max(1);
        let joiner_len = PARAGRAPH_JOINER.chars().count();

        let mut chunks = Vec::new();
        let mut buffer = String::new();
        let mut buffer_len = 0usize;

        for para in split_paragraphs(text) {
            let para_len = para.chars().count();

            // 한도보다 긴 문단: 버퍼를 비우고 고정 길이로 자름
            if para_len > max {
                flush(&mut chunks, &mut buffer, &mut buffer_len);
                chunks.extend(hard_split(para, max));
                continue;
            }

            let needed = if buffer.is_empty() {
                para_len
            } else {
                buffer_len + joiner_len + para_len
            };

            if needed > max {
                flush(&mut chunks, &mut buffer, &mut buffer_len);
            }

            if !buffer.is_empty() {
                buffer.push_str(PARAGRAPH_JOINER);
                buffer_len += joiner_len;
            }
            buffer.push_str(para);
            buffer_len += para_len;
        }

        flush(&mut chunks, &mut buffer, &mut buffer_len);
        chunks
    }

    fn name(&self) -> &'static str {
        "ParagraphChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 문단 분리 (앞뒤 공백 제거, 빈 문단 제외)
fn split_paragraphs(text: &str) -> impl Iterator<Item = &str> {
    PARAGRAPH_BREAK
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

/// `max` 문자 단위로 자르기
fn hard_split(para: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = para.chars().collect();
    chars.chunks(max).map(|slice| slice.iter().collect()).collect()
}

fn flush(chunks: &mut Vec<String>, buffer: &mut String, buffer_len: &mut usize) {
    if !buffer.is_empty() {
        chunks.push(std::mem::take(buffer));
        *buffer_len = 0;
    }
}

// ============================================================================
// Factory Functions
// ============================================================================

/// 기본 청커 생성
pub fn default_chunker() -> Box<dyn Chunker> {
    Box::new(ParagraphChunker::with_defaults())
}

/// 최대 크기를 지정한 청커 생성
pub fn paragraph_chunker(max_characters: usize) -> Box<dyn Chunker> {
    Box::new(ParagraphChunker::new(ChunkConfig::with_max_characters(
        max_characters,
    )))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(max: usize) -> ParagraphChunker {
        ParagraphChunker::new(ChunkConfig::with_max_characters(max))
    }

    #[test]
    fn test_chunker_empty() {
        let chunker = ParagraphChunker::with_defaults();
        assert!(chunker.chunk("").is_empty());
        assert!(chunker.chunk("  \n\n \n").is_empty());
    }

    #[test]
    fn test_single_paragraph() {
        let chunks = ParagraphChunker::with_defaults().chunk("Mars in the first house.");
        assert_eq!(chunks, vec!["Mars in the first house."]);
    }

    #[test]
    fn test_paragraphs_accumulate() {
        let chunks = chunker(100).chunk("one\n\ntwo\n\n\n  \nthree");
        assert_eq!(chunks, vec!["one\n\ntwo\n\nthree"]);
    }

    #[test]
    fn test_overflow_starts_new_chunk() {
        // "aaaa" + "\n\n" + "bbbb" = 10 > 9
        let chunks = chunker(9).chunk("aaaa\n\nbbbb\n\ncc");
        assert_eq!(chunks, vec!["aaaa", "bbbb\n\ncc"]);
    }

    #[test]
    fn test_joiner_counts_toward_limit() {
        // 정확히 10자: 들어감
        let chunks = chunker(10).chunk("aaaa\n\nbbbb");
        assert_eq!(chunks, vec!["aaaa\n\nbbbb"]);
    }

    #[test]
    fn test_oversized_paragraph_hard_split() {
        let long = "x".repeat(25);
        let text = format!("intro\n\n{}\n\noutro", long);
        let chunks = chunker(10).chunk(&text);

        assert_eq!(
            chunks,
            vec![
                "intro".to_string(),
                "x".repeat(10),
                "x".repeat(10),
                "x".repeat(5),
                "outro".to_string(),
            ]
        );
    }

    #[test]
    fn test_size_bound() {
        let text = (0..40)
            .map(|i| "word ".repeat(i % 17 + 1).trim().to_string())
            .collect::<Vec<_>>()
            .join("\n\n");

        for max in [5, 20, 64, 200] {
            for chunk in chunker(max).chunk(&text) {
                assert!(chunk.chars().count() <= max, "{} > {}", chunk.len(), max);
            }
        }
    }

    #[test]
    fn test_idempotent() {
        let text = "Saturn return.\n\nPressure and structure.\n\n".repeat(30);
        let c = chunker(120);
        assert_eq!(c.chunk(&text), c.chunk(&text));
    }

    #[test]
    fn test_unicode_counts_chars() {
        // 한글 7자 = 21바이트
        let chunks = chunker(6).chunk("화성제일하우스");
        assert_eq!(chunks, vec!["화성제일하우", "스"]);
    }

    #[test]
    fn test_factories() {
        assert_eq!(default_chunker().name(), "ParagraphChunker");
        assert_eq!(paragraph_chunker(0).chunk("ab"), vec!["a", "b"]);
        assert_eq!(ChunkConfig::default().max_characters, 1200);
    }
}
