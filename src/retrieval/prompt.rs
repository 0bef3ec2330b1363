//! 합성 프롬프트 조립
//!
//! 고정 지시문 + 질의 컨텍스트 + 검색된 노트(한 줄 bullet) + 출력 형식.
//! 노트는 잘라내지 않습니다. 양 조절은 검색 단계의 top_k 몫입니다.

use super::query::QueryContext;
use crate::knowledge::RetrievedRow;

const PREAMBLE: &str = "\
Role: analytical, practical astrologer.

Instructions:
- Paraphrase the concepts in your own words; never copy the corpus verbatim.
- Merge consistent points; separate (+) opportunities from (-) risks.
- If elements are missing, state the uncertainty.
- Tone: clear, non-deterministic, action-oriented.
";

const OUTPUT_SHAPE: &str = "\
Required output:
1) short introductory paragraph (2-3 sentences)
2) 3-6 bullets (+)
3) 3-6 bullets (-)
4) 1-2 specific practical suggestions
";

/// 행 → `- [id] text` 목록 (줄바꿈은 공백으로)
pub fn to_bullets(rows: &[RetrievedRow]) -> String {
    rows.iter()
        .map(|row| {
            let id = if row.id.is_empty() { "?" } else { row.id.as_str() };
            let note = row.text.trim().replace(['\r', '\n'], " ");
            format!("- [{}] {}", id, note)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 합성 프롬프트 생성
pub fn build_synthesis_prompt(ctx: &QueryContext, rows: &[RetrievedRow]) -> String {
    format!(
        "{}Astro context: {}\n\nBase notes (rework, do not quote):\n{}\n\n{}",
        PREAMBLE,
        ctx.query_text(),
        to_bullets(rows),
        OUTPUT_SHAPE
    )
}
