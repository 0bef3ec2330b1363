//! Query Context Builder
//!
//! 구조화된 배치(placements)/트랜싯 입력을 필수 필터(context) 하나와
//! 가중 soft-match facet 목록으로 변환합니다. facet은 중복 제거하지 않으며,
//! 같은 facet이 반복되면 점수 기여도 그만큼 커집니다.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KbError, Result};
use crate::knowledge::value_to_field;

/// placements 안의 예약 키 (애스펙트 목록)
pub const ASPECTS_KEY: &str = "aspects";

/// 요청 placements 매핑 (입력 순서 유지)
pub type Placements = Map<String, Value>;

// ============================================================================
// Mode
// ============================================================================

/// 해석 모드 (필수 필터 값)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Natal,
    Transit,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Natal => "natal",
            Mode::Transit => "transit",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = KbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "natal" => Ok(Mode::Natal),
            "transit" => Ok(Mode::Transit),
            other => Err(KbError::InvalidRequest(format!(
                "unknown mode '{}' (expected natal or transit)",
                other
            ))),
        }
    }
}

// ============================================================================
// Facet
// ============================================================================

/// soft-match 절 하나: entity_type + 구별 필드들
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Facet(Map<String, Value>);

impl Facet {
    fn new(entity_type: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("entity_type".to_string(), Value::from(entity_type));
        Self(fields)
    }

    fn with(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    /// 필드 순회 (삽입 순서)
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.0.get("entity_type").and_then(Value::as_str)
    }

    /// `entity_type:planet_house planet:Mars house:1` (null은 `null`)
    pub fn render(&self) -> String {
        self.fields()
            .map(|(k, v)| {
                let rendered = value_to_field(v).unwrap_or_else(|| "null".to_string());
                format!("{}:{}", k, rendered)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ============================================================================
// QueryContext
// ============================================================================

/// 질의 컨텍스트 (요청마다 생성, 저장하지 않음)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryContext {
    /// 필수 필터
    pub mode: Mode,
    /// soft-match facet (순서 유지, 중복 허용)
    pub facets: Vec<Facet>,
}

impl QueryContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            facets: Vec::new(),
        }
    }

    /// 필수 필터 값
    pub fn required_filter(&self) -> &'static str {
        self.mode.as_str()
    }

    /// 질의 문자열 (벡터 검색용 텍스트 겸 프롬프트용 컨텍스트)
    ///
    /// `context:natal | entity_type:planet_house planet:Mars house:1 | ...`
    pub fn query_text(&self) -> String {
        std::iter::once(format!("context:{}", self.mode))
            .chain(self.facets.iter().map(Facet::render))
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

// ============================================================================
// Builder
// ============================================================================

/// placements/transits → QueryContext
///
/// - `aspects` 외 키마다: `house`가 있으면 planet_house, `sign`이 있으면 planet_sign
/// - `aspects` 항목마다: aspect (`a`, `b`, `type` 필수 키)
/// - transit 항목마다: transit (`by`, `target`, `type` 필수 키)
///
/// 키가 있으면 값이 비어 있어도 facet을 만듭니다. 키 자체가 없거나 구조가
/// 매핑/리스트가 아니면 `InvalidRequest`.
pub fn build_query_context(
    mode: Mode,
    placements: &Placements,
    transits: Option<&[Value]>,
) -> Result<QueryContext> {
    let mut ctx = QueryContext::new(mode);

    for (planet, info) in placements {
        if planet == ASPECTS_KEY {
            continue;
        }

        let info = info.as_object().ok_or_else(|| {
            KbError::InvalidRequest(format!("placement '{}' must be a mapping", planet))
        })?;

        if let Some(house) = info.get("house") {
            ctx.facets.push(
                Facet::new("planet_house")
                    .with("planet", Value::from(planet.as_str()))
                    .with("house", house.clone()),
            );
        }
        if let Some(sign) = info.get("sign") {
            ctx.facets.push(
                Facet::new("planet_sign")
                    .with("planet", Value::from(planet.as_str()))
                    .with("sign", sign.clone()),
            );
        }
    }

    for (i, aspect) in list_entries(placements.get(ASPECTS_KEY), ASPECTS_KEY)?
        .iter()
        .enumerate()
    {
        let label = format!("aspects[{}]", i);
        ctx.facets.push(
            Facet::new("aspect")
                .with("planet_a", required(aspect, "a", &label)?)
                .with("planet_b", required(aspect, "b", &label)?)
                .with("aspect", required(aspect, "type", &label)?),
        );
    }

    for (i, transit) in transits.unwrap_or_default().iter().enumerate() {
        let label = format!("transits[{}]", i);
        ctx.facets.push(
            Facet::new("transit")
                .with("transit_by", required(transit, "by", &label)?)
                .with("target", required(transit, "target", &label)?)
                .with("transit_type", required(transit, "type", &label)?),
        );
    }

    tracing::debug!(
        "Built query context: mode={}, facets={}",
        ctx.mode,
        ctx.facets.len()
    );
    Ok(ctx)
}

/// 리스트 값 (없거나 null이면 빈 리스트)
fn list_entries<'a>(value: Option<&'a Value>, name: &str) -> Result<&'a [Value]> {
    match value {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(items)) => Ok(items.as_slice()),
        Some(_) => Err(KbError::InvalidRequest(format!("'{}' must be a list", name))),
    }
}

/// 필수 키 값 (값 자체는 비어 있어도 허용)
fn required(entry: &Value, key: &str, label: &str) -> Result<Value> {
    let object = entry
        .as_object()
        .ok_or_else(|| KbError::InvalidRequest(format!("{} must be a mapping", label)))?;
    object
        .get(key)
        .cloned()
        .ok_or_else(|| KbError::InvalidRequest(format!("{} is missing key '{}'", label, key)))
}

/// 파이썬식 truthiness (null, false, 0, "", 빈 컬렉션은 거짓)
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn placements(value: Value) -> Placements {
        match value {
            Value::Object(map) => map,
            _ => panic!("placements must be an object"),
        }
    }

    #[test]
    fn test_planet_with_house_and_sign() {
        let ctx = build_query_context(
            Mode::Natal,
            &placements(json!({"Mars": {"house": 1, "sign": "Aries"}})),
            None,
        )
        .unwrap();

        assert_eq!(ctx.required_filter(), "natal");
        assert_eq!(ctx.facets.len(), 2);
        assert_eq!(ctx.facets[0].entity_type(), Some("planet_house"));
        assert_eq!(ctx.facets[1].entity_type(), Some("planet_sign"));
        assert_eq!(
            ctx.query_text(),
            "context:natal | entity_type:planet_house planet:Mars house:1 | entity_type:planet_sign planet:Mars sign:Aries"
        );
    }

    #[test]
    fn test_aspects_and_transits() {
        let transits = vec![
            json!({"by": "Saturn", "target": "Sun", "type": "square"}),
            json!({"by": "Saturn", "target": "Sun", "type": "square"}),
        ];
        let ctx = build_query_context(
            Mode::Transit,
            &placements(json!({
                "Sun": {"sign": "Leo"},
                "aspects": [{"a": "Venus", "b": "Jupiter", "type": "trine"}]
            })),
            Some(transits.as_slice()),
        )
        .unwrap();

        let types: Vec<_> = ctx.facets.iter().map(|f| f.entity_type().unwrap()).collect();
        assert_eq!(types, vec!["planet_sign", "aspect", "transit", "transit"]);
        assert_eq!(ctx.facets[1].get("planet_a"), Some(&json!("Venus")));
        assert_eq!(ctx.facets[1].get("aspect"), Some(&json!("trine")));
        // 중복 facet 유지
        assert_eq!(ctx.facets[2], ctx.facets[3]);
        assert!(ctx.query_text().starts_with("context:transit | "));
    }

    #[test]
    fn test_empty_values_still_emit_facets() {
        let ctx = build_query_context(
            Mode::Natal,
            &placements(json!({"Moon": {"house": null, "sign": ""}, "Pluto": {}})),
            None,
        )
        .unwrap();

        assert_eq!(ctx.facets.len(), 2);
        assert_eq!(ctx.facets[0].get("house"), Some(&Value::Null));
        assert_eq!(ctx.facets[0].render(), "entity_type:planet_house planet:Moon house:null");
    }

    #[test]
    fn test_malformed_inputs() {
        let missing_key = build_query_context(
            Mode::Natal,
            &placements(json!({"aspects": [{"a": "Venus", "type": "trine"}]})),
            None,
        )
        .unwrap_err();
        assert!(missing_key.is_client_error());
        assert!(missing_key.to_string().contains("'b'"));

        let not_mapping =
            build_query_context(Mode::Natal, &placements(json!({"Mars": "Aries"})), None);
        assert!(matches!(not_mapping, Err(KbError::InvalidRequest(_))));

        let not_list =
            build_query_context(Mode::Natal, &placements(json!({"aspects": {"a": 1}})), None);
        assert!(not_list.is_err());

        let bad_transit = vec![json!({"by": "Mars", "target": "Moon"})];
        let err =
            build_query_context(Mode::Transit, &Placements::new(), Some(bad_transit.as_slice()))
                .unwrap_err();
        assert!(err.to_string().contains("transits[0]"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Natal".parse::<Mode>().unwrap(), Mode::Natal);
        assert_eq!("transit".parse::<Mode>().unwrap(), Mode::Transit);
        assert!("solar".parse::<Mode>().is_err());
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(false)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("Mars")));
    }
}
