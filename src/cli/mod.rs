//! CLI 모듈
//!
//! astro-kb CLI 명령어 정의 및 구현

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::clients::Clients;
use crate::config::{get_data_dir, Config};
use crate::error::KbError;
use crate::interpret::TransitRequest;
use crate::knowledge::{paragraph_chunker, scan_corpus, IngestReport};
use crate::retrieval::{build_query_context, Mode, Placements};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "astro-kb")]
#[command(version, about = "점성술 지식베이스 RAG", long_about = None)]
pub struct Cli {
    /// 설정 파일 경로 (기본: ~/.astro-kb/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 지식베이스 디렉토리를 청킹/임베딩하여 저장소에 upsert
    Ingest {
        /// 코퍼스 디렉토리 (기본: 설정의 ingest.kb_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 청크 최대 글자 수
        #[arg(long)]
        max_chars: Option<usize>,

        /// upsert 배치 크기
        #[arg(long)]
        batch_size: Option<usize>,

        /// 임베딩/저장 없이 검증과 청킹만 수행
        #[arg(long)]
        dry_run: bool,
    },

    /// 출생 차트 해석 (placements JSON)
    Natal {
        /// 입력 JSON 파일 (`-`는 stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// 트랜싯 해석 ({placements, transits} JSON)
    Transit {
        /// 입력 JSON 파일 (`-`는 stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// 검색 결과와 점수 확인 (디버깅용)
    Search {
        /// natal 또는 transit
        #[arg(short, long, default_value = "natal")]
        mode: String,

        /// 입력 JSON 파일 (`-`는 stdin)
        #[arg(short, long, default_value = "-")]
        input: String,

        /// 결과 개수 (기본: 설정의 retrieval.top_k)
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },

    /// 생성기 호출 없이 합성 프롬프트 출력
    Prompt {
        /// natal 또는 transit
        #[arg(short, long, default_value = "natal")]
        mode: String,

        /// 입력 JSON 파일 (`-`는 stdin)
        #[arg(short, long, default_value = "-")]
        input: String,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).context("설정 로드 실패")?;

    match cli.command {
        Commands::Ingest {
            dir,
            max_chars,
            batch_size,
            dry_run,
        } => cmd_ingest(config, dir, max_chars, batch_size, dry_run).await,
        Commands::Natal { input } => cmd_interpret(config, Mode::Natal, &input).await,
        Commands::Transit { input } => cmd_interpret(config, Mode::Transit, &input).await,
        Commands::Search { mode, input, top_k } => {
            cmd_search(config, parse_mode(&mode)?, &input, top_k).await
        }
        Commands::Prompt { mode, input } => cmd_prompt(config, parse_mode(&mode)?, &input).await,
        Commands::Status => cmd_status(config).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 수집 명령어 (ingest)
///
/// 코퍼스 디렉토리의 문서를 검증/청킹하고, 임베딩 후 저장소에 upsert합니다.
async fn cmd_ingest(
    mut config: Config,
    dir: Option<PathBuf>,
    max_chars: Option<usize>,
    batch_size: Option<usize>,
    dry_run: bool,
) -> Result<()> {
    if let Some(dir) = dir {
        config.ingest.kb_dir = dir;
    }
    if let Some(max_chars) = max_chars {
        config.ingest.max_chars = max_chars;
    }
    if let Some(batch_size) = batch_size {
        config.ingest.batch_size = batch_size;
    }
    config.validate().context("잘못된 수집 옵션")?;

    let kb_dir = config.ingest.kb_dir.clone();
    if !kb_dir.is_dir() {
        bail!("코퍼스 디렉토리를 찾을 수 없습니다: {}", kb_dir.display());
    }

    if dry_run {
        println!("[*] 점검 중 (dry-run): {}", kb_dir.display());

        let chunker = paragraph_chunker(config.ingest.max_chars);
        let (report, prepared) = scan_corpus(&kb_dir, chunker.as_ref(), &config.ingest.extensions)
            .context("코퍼스 점검 실패")?;

        for doc in &prepared {
            println!(
                "    {} → {} 청크 ({})",
                doc.doc_id,
                doc.texts.len(),
                doc.document.path.display()
            );
        }
        print_report(&report, &kb_dir, true);
        return Ok(());
    }

    println!("[*] 수집 중: {}", kb_dir.display());

    let clients = Clients::new(config);
    let pipeline = clients
        .ingest_pipeline()
        .await
        .context("수집 파이프라인 초기화 실패")?;

    let report = pipeline.ingest_dir(&kb_dir).await.context("수집 실패")?;
    print_report(&report, &kb_dir, false);

    Ok(())
}

/// 해석 명령어 (natal / transit)
async fn cmd_interpret(config: Config, mode: Mode, input: &str) -> Result<()> {
    let (placements, transits) = read_request(mode, input)?;

    let clients = Clients::new(config);
    let interpreter = clients.interpreter().await.context("해석기 초기화 실패")?;

    let result = match mode {
        Mode::Natal => interpreter.interpret_natal(&placements).await,
        Mode::Transit => {
            let request = TransitRequest {
                placements,
                transits: transits.unwrap_or_default(),
            };
            interpreter.interpret_transit(&request).await
        }
    };

    let response = result.map_err(client_error)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// 검색 명령어 (search)
///
/// 재정렬된 행과 blended score를 출력합니다.
async fn cmd_search(config: Config, mode: Mode, input: &str, top_k: Option<usize>) -> Result<()> {
    let (placements, transits) = read_request(mode, input)?;
    let ctx = build_query_context(mode, &placements, transits.as_deref()).map_err(client_error)?;
    let top_k = top_k.unwrap_or(config.retrieval.top_k);

    println!("[*] 검색 중: {}", truncate_text(&ctx.query_text(), 120));

    let clients = Clients::new(config);
    let retriever = clients.retriever().await.context("검색기 초기화 실패")?;
    let results = retriever
        .search_scored(&ctx, top_k)
        .await
        .context("검색 실패")?;

    if results.is_empty() {
        println!("\n[!] 검색 결과가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, scored) in results.iter().enumerate() {
        let row = &scored.row;
        let similarity = row
            .similarity
            .map(|s| format!("{:.4}", s))
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{}. [점수: {:.4}] [유사도: {}] {}",
            i + 1,
            scored.score,
            similarity,
            row.id
        );
        println!(
            "   유형: {} | priority: {}",
            row.fields.entity_type.as_deref().unwrap_or("-"),
            row.fields
                .priority
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
        println!("   내용: {}", truncate_text(&row.text, 200));
        println!();
    }

    Ok(())
}

/// 프롬프트 명령어 (prompt)
async fn cmd_prompt(config: Config, mode: Mode, input: &str) -> Result<()> {
    let (placements, transits) = read_request(mode, input)?;

    let clients = Clients::new(config);
    let interpreter = clients.interpreter().await.context("해석기 초기화 실패")?;
    let prepared = interpreter
        .prepare(mode, &placements, transits.as_deref())
        .await
        .map_err(client_error)?;

    println!("{}", prepared.prompt);
    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(config: Config) -> Result<()> {
    println!("astro-kb v{}", env!("CARGO_PKG_VERSION"));
    println!();

    println!("[*] 데이터 디렉토리: {}", get_data_dir().display());
    println!("[*] 코퍼스 디렉토리: {}", config.ingest.kb_dir.display());
    println!("[*] 임베딩 모델: {}", config.embedding.model);
    println!("[*] 생성기: {:?}", config.generator.kind);
    println!("[*] 저장소: {:?}", config.store.backend);

    let store = &config.store;
    if store.supabase_url.is_some() {
        println!("[OK] SUPABASE_URL: 설정됨");
    } else {
        println!("[!] SUPABASE_URL: 미설정");
    }
    if store.write_key().is_some() {
        println!("[OK] 쓰기 키 (service): 설정됨");
    } else {
        println!("[!] 쓰기 키 (service): 미설정 - 수집 불가");
    }

    let clients = Clients::new(config);
    match clients.read_store().await {
        Ok(store) => match store.count().await {
            Ok(count) => println!("[OK] 저장된 청크: {} 건 ({})", count, store.name()),
            Err(e) => println!("[!] 청크 수 조회 실패: {}", e),
        },
        Err(e) => println!("[!] 저장소 열기 실패: {}", e),
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 모드 문자열 파싱
fn parse_mode(mode: &str) -> Result<Mode> {
    mode.parse::<Mode>().map_err(client_error)
}

/// 입력 JSON 읽기 (`-`는 stdin)
fn read_input(input: &str) -> Result<String> {
    if input == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("stdin 읽기 실패")?;
        Ok(buffer)
    } else {
        let path = Path::new(input);
        std::fs::read_to_string(path)
            .with_context(|| format!("입력 파일 읽기 실패: {}", path.display()))
    }
}

/// 요청 본문 → (placements, transits)
fn read_request(mode: Mode, input: &str) -> Result<(Placements, Option<Vec<Value>>)> {
    parse_request(mode, &read_input(input)?)
}

/// natal은 placements 매핑 자체, transit은 `{placements, transits}`
fn parse_request(mode: Mode, text: &str) -> Result<(Placements, Option<Vec<Value>>)> {
    let value: Value = serde_json::from_str(text).context("입력이 올바른 JSON이 아닙니다")?;

    match mode {
        Mode::Natal => match value {
            Value::Object(placements) => Ok((placements, None)),
            _ => Err(client_error(KbError::InvalidRequest(
                "natal input must be a JSON object of placements".to_string(),
            ))),
        },
        Mode::Transit => {
            let request: TransitRequest = serde_json::from_value(value).map_err(|e| {
                client_error(KbError::InvalidRequest(format!(
                    "transit input must be {{placements, transits}}: {}",
                    e
                )))
            })?;
            Ok((request.placements, Some(request.transits)))
        }
    }
}

/// 클라이언트 입력 에러는 재시도 없이 안내 메시지로
fn client_error(err: KbError) -> anyhow::Error {
    if err.is_client_error() {
        anyhow::anyhow!("잘못된 요청입니다: {}", err)
    } else {
        anyhow::Error::new(err)
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 수집 결과 출력
fn print_report(report: &IngestReport, dir: &Path, dry_run: bool) {
    println!();

    if report.is_empty_corpus() {
        println!("[!] 수집할 문서가 없습니다: {}", dir.display());
        return;
    }

    for skipped in &report.skipped {
        println!("[!] 건너뜀: {} ({})", skipped.path.display(), skipped.reason);
    }

    if dry_run {
        println!(
            "[OK] 점검 완료: 문서 {} / {}, 청크 {} (저장 안 함)",
            report.documents_ingested, report.documents_scanned, report.chunks_upserted
        );
    } else {
        println!(
            "[OK] 수집 완료: 문서 {} / {}, 청크 {}, 배치 {}",
            report.documents_ingested,
            report.documents_scanned,
            report.chunks_upserted,
            report.batches
        );
    }

    if !report.skipped.is_empty() {
        println!("     건너뛴 문서: {}", report.skipped.len());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("hello\nworld", 20), "hello world");
    }

    #[test]
    fn test_truncate_unicode() {
        let korean = "안녕하세요 세계";
        let truncated = truncate_text(korean, 5);
        assert_eq!(truncated, "안녕하세요...");
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "astro-kb",
            "ingest",
            "--dir",
            "kb",
            "--max-chars",
            "800",
            "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Commands::Ingest {
                dir,
                max_chars,
                dry_run,
                ..
            } => {
                assert_eq!(dir, Some(PathBuf::from("kb")));
                assert_eq!(max_chars, Some(800));
                assert!(dry_run);
            }
            _ => panic!("expected ingest"),
        }

        let cli = Cli::try_parse_from(["astro-kb", "search", "-m", "transit", "-k", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Search { top_k: Some(3), .. }
        ));
    }

    #[test]
    fn test_parse_natal_request() {
        let (placements, transits) =
            parse_request(Mode::Natal, r#"{"Mars": {"house": 1}}"#).unwrap();
        assert!(placements.contains_key("Mars"));
        assert!(transits.is_none());

        let err = parse_request(Mode::Natal, "[1, 2]").unwrap_err();
        assert!(err.to_string().contains("잘못된 요청"));

        assert!(parse_request(Mode::Natal, "not json").is_err());
    }

    #[test]
    fn test_parse_transit_request() {
        let (placements, transits) = parse_request(
            Mode::Transit,
            r#"{"transits": [{"by": "Saturn", "target": "Sun", "type": "square"}]}"#,
        )
        .unwrap();
        assert!(placements.is_empty());
        assert_eq!(transits.map(|t| t.len()), Some(1));

        assert!(parse_request(Mode::Transit, r#"{"transits": 5}"#).is_err());
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("transit").unwrap(), Mode::Transit);
        assert!(parse_mode("horary").is_err());
    }
}
