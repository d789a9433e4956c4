//! Closed-vocabulary heuristics for city detection.
//!
//! Two lexicons drive the detector: terms whose presence means a query already
//! names a place, and phrases whose presence means a model reply is asking the
//! user for one. Matching is plain case-sensitive substring containment.

use serde::Deserialize;
use std::fs;
use std::path::Path;

/// City names and generic locality terms recognised in user queries.
pub const DEFAULT_CITY_TERMS: &[&str] = &[
    "北京", "上海", "广州", "深圳", "杭州", "南京", "苏州", "天津", "重庆", "成都",
    "武汉", "西安", "长沙", "郑州", "青岛", "厦门", "沈阳", "大连", "哈尔滨", "昆明",
    "城市", "哪里", "哪个城市",
    "Beijing", "Shanghai", "Guangzhou", "Shenzhen", "Hong Kong", "Tokyo", "London",
    "New York", "Paris", "Singapore",
    "city", "where", "which city",
];

/// Phrases indicating a reply is asking the user to supply a city.
pub const DEFAULT_CLARIFICATION_PHRASES: &[&str] = &[
    "哪个城市", "告诉", "城市名称", "城市吗", "想查询哪个城市", "请告诉我", "请说", "请问您",
    "which city", "Which city", "what city", "What city", "tell me the city",
];

/// Term sets used by [`CityDetector`].
///
/// Loadable from a JSON file shaped as
/// `{"city_terms": [...], "clarification_phrases": [...]}`. Either field may be
/// omitted, in which case the built-in list is used for it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Lexicon {
    #[serde(default = "default_city_terms")]
    pub city_terms: Vec<String>,
    #[serde(default = "default_clarification_phrases")]
    pub clarification_phrases: Vec<String>,
}

fn default_city_terms() -> Vec<String> {
    DEFAULT_CITY_TERMS.iter().map(|s| s.to_string()).collect()
}

fn default_clarification_phrases() -> Vec<String> {
    DEFAULT_CLARIFICATION_PHRASES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            city_terms: default_city_terms(),
            clarification_phrases: default_clarification_phrases(),
        }
    }
}

impl Lexicon {
    /// Load a lexicon from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read lexicon file {}: {}", path.display(), e)
        })?;
        let lexicon: Lexicon = serde_json::from_str(&contents).map_err(|e| {
            anyhow::anyhow!("Failed to parse lexicon file {}: {}", path.display(), e)
        })?;

        tracing::info!(
            path = %path.display(),
            city_terms = lexicon.city_terms.len(),
            clarification_phrases = lexicon.clarification_phrases.len(),
            "Lexicon loaded"
        );

        Ok(lexicon)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CityDetector {
    lexicon: Lexicon,
}

impl CityDetector {
    pub fn new(lexicon: Lexicon) -> Self {
        Self { lexicon }
    }

    pub fn lexicon(&self) -> &Lexicon {
        &self.lexicon
    }

    /// True if `text` contains any recognised city or locality term.
    pub fn query_names_city(&self, text: &str) -> bool {
        contains_any(text, &self.lexicon.city_terms)
    }

    /// True if a model reply reads as a request for the user's city.
    pub fn reply_asks_for_city(&self, text: &str) -> bool {
        contains_any(text, &self.lexicon.clarification_phrases)
    }
}

fn contains_any(text: &str, terms: &[String]) -> bool {
    terms
        .iter()
        .any(|term| !term.is_empty() && text.contains(term.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_query_with_city_is_detected() {
        let detector = CityDetector::default();
        assert!(detector.query_names_city("北京今天天气怎么样"));
        assert!(detector.query_names_city("What's the weather in London?"));
    }

    #[test]
    fn test_query_without_city_is_not_detected() {
        let detector = CityDetector::default();
        assert!(!detector.query_names_city("今天天气怎么样"));
        assert!(!detector.query_names_city("明天会下雨吗"));
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let detector = CityDetector::default();
        assert!(!detector.query_names_city("weather in LONDON"));
        assert!(!detector.query_names_city("WHERE is it raining"));
    }

    #[test]
    fn test_default_city_lexicon_is_pinned() {
        let lexicon = Lexicon::default();
        assert_eq!(lexicon.city_terms.len(), DEFAULT_CITY_TERMS.len());
        for term in ["北京", "上海", "城市", "哪里", "city", "where", "which city"] {
            assert!(lexicon.city_terms.iter().any(|t| t == term), "missing {term}");
        }
        assert!(!lexicon.city_terms.iter().any(|t| t == "今天"));
        assert!(!lexicon.city_terms.iter().any(|t| t == "天气"));
    }

    #[test]
    fn test_clarification_reply_is_detected() {
        let detector = CityDetector::default();
        assert!(detector.reply_asks_for_city("请问您想查询哪个城市的天气？"));
        assert!(detector.reply_asks_for_city("Sure! Which city are you in?"));
        assert!(!detector.reply_asks_for_city("北京今天晴，气温 25°C。"));
    }

    #[test]
    fn test_lexicon_load_with_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"city_terms": ["Lisbon"]}}"#).unwrap();

        let lexicon = Lexicon::load(file.path()).unwrap();
        assert_eq!(lexicon.city_terms, vec!["Lisbon".to_string()]);
        assert_eq!(
            lexicon.clarification_phrases.len(),
            DEFAULT_CLARIFICATION_PHRASES.len()
        );

        let detector = CityDetector::new(lexicon);
        assert!(detector.query_names_city("rain in Lisbon?"));
        assert!(!detector.query_names_city("北京今天天气怎么样"));
    }

    #[test]
    fn test_lexicon_load_rejects_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Lexicon::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_terms_never_match() {
        let detector = CityDetector::new(Lexicon {
            city_terms: vec![String::new()],
            clarification_phrases: vec![],
        });
        assert!(!detector.query_names_city("anything"));
        assert!(!detector.reply_asks_for_city("anything"));
    }
}
