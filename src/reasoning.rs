//! Reasoning Loop (C12): Select -> Validate -> Execute -> Succeed/Retry/Fail.
//!
//! Prompts the LLM with the tool catalog and a user query, expects a JSON
//! selection `{tool_name, reasoning, arguments}`, validates and executes it
//! via [`crate::tools::ToolRegistry`]. Validation failures are deterministic
//! and never retried; any other failure appends a nudge to the prompt and
//! loops back to selection, up to `max_retries`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::tools::{catalog_summary, operation_hash, CallContext, ToolError, ToolRegistry};

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("llm request timed out after {0}s")]
    Timeout(u64),
    #[error("llm returned a response that could not be parsed: {0}")]
    InvalidSelection(String),
    #[error("unknown llm provider: {0}")]
    UnknownProvider(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ToolSelection {
    tool_name: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReasoningOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub tool_used: Option<String>,
    pub attempts: u32,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// Run the select/validate/execute loop for `query`, retrying up to
/// `config.performance.max_retries` (reused as the reasoning retry budget)
/// times on non-validation failures.
pub async fn run(
    registry: &ToolRegistry<'_>,
    config: &Config,
    query: &str,
    plan_id: &str,
) -> ReasoningOutcome {
    let started = chrono::Utc::now();
    let max_retries = config.llm.max_retries.max(1);
    let correlation_id = Uuid::new_v4().to_string();

    let mut prompt_context = query.to_string();
    let mut last_error: Option<String> = None;

    for attempt in 1..=max_retries {
        let selection = match select_tool(config, &prompt_context).await {
            Ok(s) => s,
            Err(e) => {
                last_error = Some(summarize(&e.to_string()));
                prompt_context = nudge(query, &last_error);
                continue;
            }
        };

        let ctx = CallContext {
            correlation_id: correlation_id.clone(),
            plan_id: plan_id.to_string(),
            step_index: (attempt - 1) as i64,
        };

        match registry
            .call(&selection.tool_name, selection.arguments.clone(), false, None, &ctx)
            .await
        {
            Ok(call_result) if call_result.requires_confirmation => {
                // Mutating tool, dry run succeeded: surface the hash so the
                // caller can confirm. This counts as a success for the loop
                // — the tool was correctly selected and validated.
                return ReasoningOutcome {
                    success: true,
                    result: Some(serde_json::json!({
                        "was_dry_run": true,
                        "operation_hash": call_result.operation_hash,
                        "reasoning": selection.reasoning,
                    })),
                    tool_used: Some(selection.tool_name),
                    attempts: attempt,
                    duration_ms: elapsed_ms(started),
                    error: None,
                };
            }
            Ok(call_result) => {
                return ReasoningOutcome {
                    success: true,
                    result: call_result.result,
                    tool_used: Some(selection.tool_name),
                    attempts: attempt,
                    duration_ms: elapsed_ms(started),
                    error: None,
                };
            }
            Err(e @ (ToolError::MissingParameter(_) | ToolError::InvalidParameterType { .. }
                | ToolError::UnknownParameter(_))) => {
                // Deterministic validation failure: retrying without a
                // different selection would just fail again.
                return ReasoningOutcome {
                    success: false,
                    result: None,
                    tool_used: Some(selection.tool_name),
                    attempts: attempt,
                    duration_ms: elapsed_ms(started),
                    error: Some(summarize(&e.to_string())),
                };
            }
            Err(e) => {
                last_error = Some(summarize(&e.to_string()));
                prompt_context = nudge(query, &last_error);
            }
        }
    }

    ReasoningOutcome {
        success: false,
        result: None,
        tool_used: None,
        attempts: max_retries,
        duration_ms: elapsed_ms(started),
        error: last_error.or_else(|| Some("exhausted retries".to_string())),
    }
}

fn elapsed_ms(started: chrono::DateTime<chrono::Utc>) -> i64 {
    (chrono::Utc::now() - started).num_milliseconds().max(0)
}

fn nudge(original_query: &str, last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(
            "{original_query}\n\n(earlier attempt failed: {e}; consider alternative tools)"
        ),
        None => original_query.to_string(),
    }
}

/// Fold an error's kind and message into a single line; never includes a
/// stack trace or backtrace.
fn summarize(message: &str) -> String {
    message.lines().next().unwrap_or(message).to_string()
}

async fn select_tool(config: &Config, prompt_context: &str) -> Result<ToolSelection, ReasoningError> {
    match config.llm.provider.as_str() {
        "mock" => Ok(mock_select(prompt_context)),
        "ollama" | "openai" => {
            let timeout = Duration::from_secs(config.llm.timeout_s);
            tokio::time::timeout(timeout, call_llm_select(config, prompt_context))
                .await
                .map_err(|_| ReasoningError::Timeout(config.llm.timeout_s))?
        }
        other => Err(ReasoningError::UnknownProvider(other.to_string())),
    }
}

/// The "mock" provider always selects `search_data` with the raw query as
/// its argument, so reasoning can be exercised offline and in tests.
fn mock_select(prompt_context: &str) -> ToolSelection {
    let query = prompt_context
        .split("\n\n(earlier attempt failed")
        .next()
        .unwrap_or(prompt_context)
        .to_string();
    ToolSelection {
        tool_name: "search_data".to_string(),
        reasoning: "default mock selection".to_string(),
        arguments: serde_json::json!({ "query": query }),
    }
}

async fn call_llm_select(config: &Config, prompt_context: &str) -> Result<ToolSelection, ReasoningError> {
    let client = reqwest::Client::new();
    let url = format!("{}/api/chat", config.llm.endpoint.trim_end_matches('/'));

    let system_prompt = format!(
        "You select a tool to answer a user request. Available tools:\n{}\n\
        Respond with ONLY a JSON object matching: \
        {{\"tool_name\":\"...\",\"reasoning\":\"...\",\"arguments\":{{...}}}}. No prose, no markdown fences.",
        serde_json::to_string(&catalog_summary()).unwrap_or_default()
    );

    let payload = serde_json::json!({
        "model": config.llm.model,
        "stream": false,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": prompt_context},
        ],
        "options": {"temperature": 0.0},
    });

    let response = client.post(&url).json(&payload).send().await?;
    let parsed: Value = response.json().await?;

    let content = parsed
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ReasoningError::InvalidSelection("missing message.content".to_string()))?;

    serde_json::from_str(content).map_err(|e| ReasoningError::InvalidSelection(e.to_string()))
}

/// Precompute the operation hash a caller would need to confirm a mutating
/// selection the loop surfaced via a dry run. Exposed so the HTTP/CLI layer
/// can round-trip the confirm step without recomputing tool internals.
pub fn confirm_hash(tool_name: &str, arguments: &Value) -> String {
    operation_hash(tool_name, arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConnectionBroker;
    use crate::embedding::DisabledProvider;
    use crate::migrate::run_migrations;
    use crate::store::DocumentStore;

    async fn test_store() -> DocumentStore {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        DocumentStore::new(ConnectionBroker::new(pool))
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
    async fn mock_provider_selects_search_and_succeeds() {
        let store = test_store().await;
        let config = test_config();
        let provider = DisabledProvider;
        let registry = ToolRegistry::new(&store, &config, &provider);

        let outcome = run(&registry, &config, "find my dentist note", "plan-1").await;
        assert!(outcome.success);
        assert_eq!(outcome.tool_used.as_deref(), Some("search_data"));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn summarize_takes_first_line_only() {
        let summary = summarize("bad thing happened\nstack trace line 1\nstack trace line 2");
        assert_eq!(summary, "bad thing happened");
    }

    #[test]
    fn confirm_hash_matches_tool_registry_hash() {
        let args = serde_json::json!({"title": "x"});
        assert_eq!(
            confirm_hash("create_reminder", &args),
            operation_hash("create_reminder", &args)
        );
    }
}
