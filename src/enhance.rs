//! Query enhancement (C10).
//!
//! Turns a raw user query into a richer [`EnhancedQuery`]: an intent guess,
//! extracted entities, a detected time filter, normalized search terms, and
//! source hints. Tries the configured LLM first (bounded by
//! `llm.timeout_s`), falls back to a deterministic NLP pass on timeout,
//! error, or malformed output. Results are cached by query hash via
//! [`crate::cache::Cache`] so repeated queries skip the round trip entirely.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::Cache;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("llm request timed out after {0}s")]
    Timeout(u64),
    #[error("llm returned a response that could not be parsed: {0}")]
    InvalidResponse(String),
    #[error("unknown llm provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Search,
    Filter,
    Question,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Person,
    Topic,
    Location,
    Organization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub kind: EntityKind,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeFilter {
    Relative(String),
    AbsoluteRange { start: String, end: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceMethod {
    Llm,
    BasicNlp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancedQuery {
    pub original: String,
    pub enhanced: String,
    pub intent: Intent,
    pub entities: Vec<Entity>,
    pub time_filter: Option<TimeFilter>,
    pub search_terms: Vec<String>,
    pub source_hints: Vec<String>,
    pub method: EnhanceMethod,
}

/// Fragment returned by the LLM, parsed out of its response text.
#[derive(Debug, Deserialize)]
struct LlmEnhanceBody {
    intent: Intent,
    #[serde(default)]
    entities: Vec<Entity>,
    #[serde(default)]
    time_filter: Option<TimeFilter>,
    #[serde(default)]
    search_terms: Vec<String>,
    #[serde(default)]
    source_hints: Vec<String>,
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "of", "in", "on", "at", "to", "for", "and", "or", "is", "are", "was", "were",
    "be", "been", "with", "from", "by", "me", "my", "about", "that", "this", "it", "do", "does",
    "did", "can", "could", "would", "will", "show", "find", "get",
];

const SOURCE_KEYWORDS: &[(&str, &str)] = &[
    ("email", "mail"),
    ("mail", "mail"),
    ("calendar", "calendar"),
    ("event", "calendar"),
    ("meeting", "calendar"),
    ("file", "files"),
    ("document", "files"),
    ("note", "notes"),
    ("message", "messages"),
    ("text", "messages"),
    ("whatsapp", "whatsapp"),
    ("reminder", "reminders"),
    ("todo", "reminders"),
    ("contact", "contacts"),
];

const SYNONYMS: &[(&str, &[&str])] = &[
    ("meeting", &["call", "sync", "appointment"]),
    ("document", &["file", "paper", "doc"]),
    ("note", &["memo", "jotting"]),
    ("message", &["text", "chat"]),
    ("cheap", &["inexpensive", "affordable"]),
    ("fast", &["quick", "rapid"]),
];

/// Enhance `query`, consulting the cache first and writing the result back
/// under a TTL that reflects how the answer was produced (LLM answers are
/// trusted for the configured default, NLP fallbacks for a quarter of it).
pub async fn enhance(config: &Config, cache: &Cache, query: &str) -> EnhancedQuery {
    let cache_key = format!("enhance:{}", sha256_hex(query));
    if let Some(cached) = cache.get(&cache_key) {
        if let Ok(parsed) = serde_json::from_str::<EnhancedQuery>(&cached) {
            return parsed;
        }
    }

    let timeout = Duration::from_secs(config.llm.timeout_s);
    let attempt = tokio::time::timeout(timeout, attempt_llm_enhance(config, query)).await;

    let (enhanced, ttl) = match attempt {
        Ok(Ok(parsed)) => (parsed, Duration::from_secs(config.cache.default_ttl_s)),
        _ => (
            basic_nlp_enhance(query),
            Duration::from_secs(config.cache.default_ttl_s / 4 + 1),
        ),
    };

    if let Ok(serialized) = serde_json::to_string(&enhanced) {
        cache.put_with_ttl(cache_key, serialized, ttl);
    }

    enhanced
}

/// Generate up to `k` alternate phrasings of `query`, for widening recall on
/// a follow-up retrieval pass. Cached separately from [`enhance`] since
/// callers may want enhancement without variations or vice versa.
pub async fn variations(config: &Config, cache: &Cache, query: &str, k: usize) -> Vec<String> {
    if k == 0 {
        return Vec::new();
    }

    let cache_key = format!("variations:{}:{}", k, sha256_hex(query));
    if let Some(cached) = cache.get(&cache_key) {
        if let Ok(parsed) = serde_json::from_str::<Vec<String>>(&cached) {
            return parsed;
        }
    }

    let result = synonym_variations(query, k);

    if let Ok(serialized) = serde_json::to_string(&result) {
        cache.put_with_ttl(
            cache_key,
            serialized,
            Duration::from_secs(config.cache.default_ttl_s),
        );
    }

    result
}

async fn attempt_llm_enhance(config: &Config, query: &str) -> Result<EnhancedQuery, EnhanceError> {
    let body = match config.llm.provider.as_str() {
        "mock" => mock_llm_body(query),
        "ollama" | "openai" => call_llm_enhance(config, query).await?,
        other => return Err(EnhanceError::UnknownProvider(other.to_string())),
    };

    Ok(EnhancedQuery {
        original: query.to_string(),
        enhanced: canonicalize(&body.search_terms),
        intent: body.intent,
        entities: body.entities,
        time_filter: body.time_filter,
        search_terms: body.search_terms,
        source_hints: body.source_hints,
        method: EnhanceMethod::Llm,
    })
}

/// The rewritten/canonical form of a query: its search terms, in the order
/// they were extracted, space-joined. Re-running enhancement on this string
/// must reproduce the same `search_terms` (and therefore the same
/// `enhanced` value) so callers can treat enhancement as idempotent.
fn canonicalize(search_terms: &[String]) -> String {
    search_terms.join(" ")
}

/// The "mock" provider never makes a network call; it mirrors
/// [`basic_nlp_enhance`]'s extraction so offline development and tests can
/// exercise the `Llm` method path deterministically.
fn mock_llm_body(query: &str) -> LlmEnhanceBody {
    let nlp = basic_nlp_enhance(query);
    LlmEnhanceBody {
        intent: nlp.intent,
        entities: nlp.entities,
        time_filter: nlp.time_filter,
        search_terms: nlp.search_terms,
        source_hints: nlp.source_hints,
    }
}

async fn call_llm_enhance(config: &Config, query: &str) -> Result<LlmEnhanceBody, EnhanceError> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", config.llm.endpoint.trim_end_matches('/'));

    let system_prompt = "You analyze search queries for a personal knowledge index. \
        Respond with ONLY a JSON object matching: \
        {\"intent\":\"search|filter|question|command\",\"entities\":[{\"kind\":\"person|topic|location|organization\",\"value\":\"...\"}],\
        \"time_filter\":null,\"search_terms\":[\"...\"],\"source_hints\":[\"...\"]}. No prose, no markdown fences.";

    let payload = serde_json::json!({
        "model": config.llm.model,
        "stream": false,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": query},
        ],
        "options": {"temperature": 0.0},
    });

    let response = client.post(&url).json(&payload).send().await?;
    let parsed: serde_json::Value = response.json().await?;

    let content = parsed
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| EnhanceError::InvalidResponse("missing message.content".to_string()))?;

    serde_json::from_str(content).map_err(|e| EnhanceError::InvalidResponse(e.to_string()))
}

/// Deterministic, dependency-free fallback: stopword-filtered tokens as
/// search terms, keyword-matched source hints, and a handful of heuristics
/// for intent, entities, and relative time filters.
fn basic_nlp_enhance(query: &str) -> EnhancedQuery {
    let trimmed = query.trim();
    let lower = trimmed.to_lowercase();
    let tokens: Vec<&str> = lower
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|t| !t.is_empty())
        .collect();

    let intent = detect_intent(trimmed, &lower, &tokens);
    let search_terms = tokens
        .iter()
        .filter(|t| !STOPWORDS.contains(t) && t.len() > 1)
        .map(|t| t.to_string())
        .collect();
    let source_hints = detect_source_hints(&tokens);
    let time_filter = detect_time_filter(&lower);
    let entities = detect_entities(trimmed);

    EnhancedQuery {
        original: trimmed.to_string(),
        enhanced: canonicalize(&search_terms),
        intent,
        entities,
        time_filter,
        search_terms,
        source_hints,
        method: EnhanceMethod::BasicNlp,
    }
}

fn detect_intent(original: &str, lower: &str, tokens: &[&str]) -> Intent {
    const QUESTION_WORDS: &[&str] = &["who", "what", "when", "where", "why", "how", "which"];
    const COMMAND_WORDS: &[&str] = &[
        "create", "add", "delete", "remove", "set", "schedule", "remind", "send", "move", "update",
        "append",
    ];
    const FILTER_WORDS: &[&str] = &["from", "before", "after", "since", "until", "type", "source"];

    if original.trim_end().ends_with('?') {
        return Intent::Question;
    }
    if let Some(first) = tokens.first() {
        if QUESTION_WORDS.contains(first) {
            return Intent::Question;
        }
        if COMMAND_WORDS.contains(first) {
            return Intent::Command;
        }
    }
    if FILTER_WORDS.iter().any(|w| lower.contains(w)) {
        return Intent::Filter;
    }
    Intent::Search
}

fn detect_source_hints(tokens: &[&str]) -> Vec<String> {
    let mut hints = Vec::new();
    for token in tokens {
        for (keyword, source) in SOURCE_KEYWORDS {
            if token == keyword && !hints.contains(&source.to_string()) {
                hints.push(source.to_string());
            }
        }
    }
    hints
}

fn detect_time_filter(lower: &str) -> Option<TimeFilter> {
    const RELATIVE_KEYWORDS: &[&str] = &[
        "today",
        "yesterday",
        "tomorrow",
        "this week",
        "last week",
        "this month",
        "last month",
        "this year",
        "last year",
    ];
    RELATIVE_KEYWORDS
        .iter()
        .find(|kw| lower.contains(*kw))
        .map(|kw| TimeFilter::Relative(kw.to_string()))
}

/// Capitalized words that aren't the first token are treated as topic
/// entities; a preceding "in"/"at" reclassifies the following one as a
/// location. This is a heuristic, not a named-entity recognizer.
fn detect_entities(original: &str) -> Vec<Entity> {
    let words: Vec<&str> = original.split_whitespace().collect();
    let mut entities = Vec::new();

    for (i, word) in words.iter().enumerate() {
        if i == 0 {
            continue;
        }
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.is_empty() || !cleaned.chars().next().unwrap().is_uppercase() {
            continue;
        }

        let kind = match words.get(i.saturating_sub(1)).map(|w| w.to_lowercase()) {
            Some(prev) if prev == "in" || prev == "at" => EntityKind::Location,
            _ => EntityKind::Topic,
        };

        entities.push(Entity {
            kind,
            value: cleaned,
        });
    }

    entities
}

fn synonym_variations(query: &str, k: usize) -> Vec<String> {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();
    let mut variations = Vec::new();

    for (i, word) in words.iter().enumerate() {
        if variations.len() >= k {
            break;
        }
        if let Some((_, synonyms)) = SYNONYMS.iter().find(|(w, _)| w == word) {
            for synonym in *synonyms {
                if variations.len() >= k {
                    break;
                }
                let mut replaced = words.clone();
                replaced[i] = synonym;
                variations.push(replaced.join(" "));
            }
        }
    }

    variations
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, Environment};

    fn cache() -> Cache {
        Cache::new(&CacheConfig::default(), Environment::Development)
    }

    fn test_config() -> Config {
        let toml = r#"
            [db]
            path = "./test.db"
            [chunking]
            max_chunk_size = 512
            overlap = 50
            [retrieval]
            [server]
            bind = "127.0.0.1:8080"
        "#;
        toml::from_str(toml).unwrap()
    }

    #[tokio::test]
    async fn detects_question_intent() {
        let config = test_config();
        let enhanced = enhance(&config, &cache(), "what did alice say yesterday?").await;
        assert_eq!(enhanced.intent, Intent::Question);
        assert!(matches!(enhanced.time_filter, Some(TimeFilter::Relative(_))));
    }

    #[tokio::test]
    async fn detects_command_intent() {
        let config = test_config();
        let enhanced = enhance(&config, &cache(), "create reminder to call bob").await;
        assert_eq!(enhanced.intent, Intent::Command);
    }

    #[tokio::test]
    async fn detects_source_hints_from_keywords() {
        let config = test_config();
        let enhanced = enhance(&config, &cache(), "find the email about the invoice").await;
        assert!(enhanced.source_hints.contains(&"mail".to_string()));
    }

    #[tokio::test]
    async fn caches_results_across_calls() {
        let config = test_config();
        let cache = cache();
        let first = enhance(&config, &cache, "project roadmap").await;
        let second = enhance(&config, &cache, "project roadmap").await;
        assert_eq!(first.search_terms, second.search_terms);
    }

    #[test]
    fn strips_stopwords_from_search_terms() {
        let enhanced = basic_nlp_enhance("find the notes about the budget");
        assert!(!enhanced.search_terms.contains(&"the".to_string()));
        assert!(enhanced.search_terms.contains(&"budget".to_string()));
    }

    #[tokio::test]
    async fn enhanced_query_is_a_fixed_point() {
        let config = test_config();
        let cache = cache();
        let first = enhance(&config, &cache, "find the notes about the budget").await;
        let second = enhance(&config, &cache, &first.enhanced).await;
        assert_eq!(first.enhanced, second.enhanced);
    }

    #[tokio::test]
    async fn produces_synonym_variations() {
        let config = test_config();
        let result = variations(&config, &cache(), "schedule a meeting", 2).await;
        assert!(result.iter().all(|v| v != "schedule a meeting"));
    }
}
