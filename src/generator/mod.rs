//! Text Generator - 합성 프롬프트 → 해석 텍스트
//!
//! 생성기는 불투명한 외부 협력자입니다. 프롬프트 문자열을 받아 텍스트를 돌려줍니다.
//!
//! - `DemoGenerator`: 프롬프트 길이만 알려주는 자리표시자
//! - `GroqGenerator`: OpenAI 호환 chat completions (Groq)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::{GeneratorConfig, GeneratorKind};
use crate::error::{KbError, Result};

/// 생성 요청 HTTP 타임아웃
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

const SYSTEM_PROMPT: &str =
    "You write astrological interpretations from the provided notes. Follow the requested output shape.";

// ============================================================================
// TextGenerator Trait
// ============================================================================

/// 텍스트 생성기 트레이트 (async)
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// 프롬프트 → 텍스트
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// 생성기 이름
    fn name(&self) -> &str;
}

/// 설정에 맞는 생성기 생성
pub fn from_config(config: &GeneratorConfig) -> Result<Box<dyn TextGenerator>> {
    match config.kind {
        GeneratorKind::Demo => Ok(Box::new(DemoGenerator)),
        GeneratorKind::Groq => Ok(Box::new(GroqGenerator::from_config(config)?)),
    }
}

// ============================================================================
// DemoGenerator
// ============================================================================

/// 데모 생성기
#[derive(Debug, Default, Clone, Copy)]
pub struct DemoGenerator;

#[async_trait]
impl TextGenerator for DemoGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        Ok(format!(
            "[DEMO] Synthesis ready for a prompt of {} characters.",
            prompt.chars().count()
        ))
    }

    fn name(&self) -> &str {
        "demo"
    }
}

// ============================================================================
// GroqGenerator
// ============================================================================

/// Groq chat completions 생성기
pub struct GroqGenerator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl GroqGenerator {
    /// 설정에서 생성 (`GROQ_API_KEY` 필수)
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| KbError::Config("GROQ_API_KEY is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| KbError::Generation(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| KbError::Config("invalid GROQ_API_KEY".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl TextGenerator for GroqGenerator {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| KbError::Generation(format!("chat completions request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(KbError::Generation(format!("Groq returned {}: {}", status, text)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| KbError::Generation(format!("Failed to parse Groq response: {}", e)))?;

        tracing::debug!("Generated completion with model {}", self.model);
        first_content(parsed)
    }

    fn name(&self) -> &str {
        "groq"
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

/// 첫 번째 비어 있지 않은 응답 본문
fn first_content(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .filter_map(|choice| choice.message.content)
        .find(|content| !content.trim().is_empty())
        .ok_or_else(|| KbError::Generation("empty completion".to_string()))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_generator_reports_length() {
        let text = DemoGenerator.generate("한글 prompt").await.unwrap();
        assert_eq!(text, "[DEMO] Synthesis ready for a prompt of 9 characters.");
    }

    #[test]
    fn test_groq_requires_key() {
        let config = GeneratorConfig {
            kind: GeneratorKind::Groq,
            ..Default::default()
        };
        assert!(matches!(
            GroqGenerator::from_config(&config),
            Err(KbError::Config(_))
        ));

        let config = GeneratorConfig {
            kind: GeneratorKind::Groq,
            api_key: Some("gsk_test".to_string()),
            base_url: "https://api.groq.com/openai/v1/".to_string(),
            ..Default::default()
        };
        let generator = GroqGenerator::from_config(&config).unwrap();
        assert_eq!(
            generator.endpoint,
            "https://api.groq.com/openai/v1/chat/completions"
        );
        assert_eq!(generator.name(), "groq");
    }

    #[test]
    fn test_from_config_defaults_to_demo() {
        let generator = from_config(&GeneratorConfig::default()).unwrap();
        assert_eq!(generator.name(), "demo");
    }

    #[test]
    fn test_response_parsing() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"Mars energizes."}}]}"#,
        )
        .unwrap();
        assert_eq!(first_content(parsed).unwrap(), "Mars energizes.");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(first_content(empty), Err(KbError::Generation(_))));

        let null_content: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#,
        )
        .unwrap();
        let err = first_content(null_content).unwrap_err();
        assert!(err.to_string().contains("empty completion"));
    }
}
