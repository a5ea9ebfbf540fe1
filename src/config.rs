//! Configuration parsing and validation.
//!
//! The indexer is configured via a TOML file (default: `config/kenny.toml`),
//! one section per external interface named in the system's configuration
//! surface: database, chunking, retrieval, embedding, llm, cache,
//! performance, monitoring, and features. [`load_config`] reads, parses and
//! validates the file; invalid values fail fast with a descriptive message
//! rather than surfacing as a confusing error deep in the pipeline.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Deployment environment. Not currently used to branch behavior beyond
/// logging verbosity defaults, but recognized per the configuration surface.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Testing,
    Staging,
    Production,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub extractors: ExtractorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub connection_pool_size: u32,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_wal: bool,
    #[serde(default = "default_true")]
    pub enable_fts: bool,
    /// Directory backups are written to. Defaults to the database's parent directory.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

fn default_pool_size() -> u32 {
    5
}
fn default_query_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_max_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_w_bm25")]
    pub w_bm25: f64,
    #[serde(default = "default_w_emb")]
    pub w_emb: f64,
    #[serde(default = "default_candidate_factor")]
    pub candidate_factor: i64,
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_candidate_k_vector")]
    pub candidate_k_vector: i64,
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f32,
}

fn default_w_bm25() -> f64 {
    0.5
}
fn default_w_emb() -> f64 {
    0.5
}
fn default_candidate_factor() -> i64 {
    4
}
fn default_final_limit() -> i64 {
    12
}
fn default_candidate_k_vector() -> i64 {
    1000
}
fn default_relevance_floor() -> f32 {
    0.1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            normalize: true,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_llm_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            endpoint: default_llm_endpoint(),
            timeout_s: default_llm_timeout_s(),
            max_retries: default_max_retries(),
            enable_fallback: true,
        }
    }
}

fn default_llm_provider() -> String {
    "mock".to_string()
}
fn default_llm_model() -> String {
    "llama3".to_string()
}
fn default_llm_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_timeout_s() -> u64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_cache_ttl_s")]
    pub default_ttl_s: u64,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_memory_mb: default_cache_max_memory_mb(),
            default_ttl_s: default_cache_ttl_s(),
            max_entries: default_cache_max_entries(),
        }
    }
}

fn default_cache_max_memory_mb() -> u64 {
    64
}
fn default_cache_ttl_s() -> u64 {
    300
}
fn default_cache_max_entries() -> usize {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PerformanceConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
    #[serde(default = "default_critical_op_ms")]
    pub critical_op_ms: u64,
    #[serde(default)]
    pub enable_tracing: bool,
    #[serde(default = "default_memory_warning_mb")]
    pub memory_warning_mb: u64,
    #[serde(default = "default_max_datapoints")]
    pub max_datapoints: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            retention_days: default_retention_days(),
            slow_query_ms: default_slow_query_ms(),
            critical_op_ms: default_critical_op_ms(),
            enable_tracing: false,
            memory_warning_mb: default_memory_warning_mb(),
            max_datapoints: default_max_datapoints(),
        }
    }
}

fn default_retention_days() -> u32 {
    30
}
fn default_slow_query_ms() -> u64 {
    250
}
fn default_critical_op_ms() -> u64 {
    2_000
}
fn default_memory_warning_mb() -> u64 {
    512
}
fn default_max_datapoints() -> usize {
    10_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub structured_logging: bool,
    #[serde(default)]
    pub metrics_endpoint: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            structured_logging: false,
            metrics_endpoint: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeaturesConfig {
    #[serde(default = "default_true")]
    pub hybrid_search: bool,
    #[serde(default)]
    pub embeddings: bool,
    #[serde(default)]
    pub real_time_sync: bool,
    #[serde(default)]
    pub webhooks: bool,
    #[serde(default = "default_true")]
    pub advanced_caching: bool,
    #[serde(default = "default_safety_strictness")]
    pub safety_strictness: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            hybrid_search: true,
            embeddings: false,
            real_time_sync: false,
            webhooks: false,
            advanced_caching: true,
            safety_strictness: default_safety_strictness(),
        }
    }
}

fn default_safety_strictness() -> String {
    "medium".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size_ingest")]
    pub batch_size: usize,
    #[serde(default = "default_inter_source_sleep_ms")]
    pub inter_source_sleep_ms: u64,
    #[serde(default = "default_true")]
    pub backup_before_sync: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size_ingest(),
            inter_source_sleep_ms: default_inter_source_sleep_ms(),
            backup_before_sync: true,
        }
    }
}

fn default_batch_size_ingest() -> usize {
    500
}
fn default_inter_source_sleep_ms() -> u64 {
    1_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Per-extractor configuration. Most source types (calendar, mail,
/// messages, contacts, whatsapp, notes, reminders) talk to OS-owned
/// frameworks and are out of scope for this store; `files` is the one
/// extractor implemented directly, since it only needs the filesystem.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractorsConfig {
    #[serde(default)]
    pub files: Option<FilesExtractorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesExtractorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_true() -> bool {
    true
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Read, parse, and validate the TOML configuration file at `path`.
///
/// Environment variable overrides recognized: `KENNY_DB_PATH` (database
/// path), `KENNY_LLM_ENDPOINT` / `KENNY_LLM_MODEL` (LLM service), and
/// `KENNY_METRICS_ENDPOINT` (monitoring).
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if let Ok(db_path) = std::env::var("KENNY_DB_PATH") {
        config.db.path = PathBuf::from(db_path);
    }
    if let Ok(endpoint) = std::env::var("KENNY_LLM_ENDPOINT") {
        config.llm.endpoint = endpoint;
    }
    if let Ok(model) = std::env::var("KENNY_LLM_MODEL") {
        config.llm.model = model;
    }
    if let Ok(endpoint) = std::env::var("KENNY_METRICS_ENDPOINT") {
        config.monitoring.metrics_endpoint = Some(endpoint);
    }

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chunk_size == 0 {
        anyhow::bail!("chunking.max_chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.max_chunk_size {
        anyhow::bail!("chunking.overlap must be < chunking.max_chunk_size");
    }

    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.w_bm25 < 0.0 || config.retrieval.w_emb < 0.0 {
        anyhow::bail!("retrieval.w_bm25 and retrieval.w_emb must be non-negative");
    }
    if (config.retrieval.w_bm25 + config.retrieval.w_emb - 1.0).abs() > 1e-6 {
        anyhow::bail!("retrieval.w_bm25 + retrieval.w_emb must sum to 1.0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "mock" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or mock.",
            other
        ),
    }

    match config.llm.provider.as_str() {
        "ollama" | "openai" | "mock" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be ollama, openai, or mock.",
            other
        ),
    }

    match config.features.safety_strictness.as_str() {
        "low" | "medium" | "high" | "paranoid" => {}
        other => anyhow::bail!(
            "Unknown features.safety_strictness: '{}'. Must be low, medium, high, or paranoid.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_minimal(extra: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
            [db]
            path = "./test.db"

            [chunking]
            max_chunk_size = 512
            overlap = 50

            [retrieval]

            [server]
            bind = "127.0.0.1:8080"

            {extra}
            "#
        )
        .unwrap();
        f
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let f = write_minimal("");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.retrieval.final_limit, 12);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.llm.provider, "mock");
        assert!(config.cache.enabled);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let f = write_minimal("[chunking]\nmax_chunk_size = 0\noverlap = 0");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_overlap_ge_chunk_size() {
        let f = write_minimal("[chunking]\nmax_chunk_size = 100\noverlap = 100");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_weights_not_summing_to_one() {
        let f = write_minimal("[retrieval]\nw_bm25 = 0.9\nw_emb = 0.9");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn rejects_unknown_safety_strictness() {
        let f = write_minimal("[features]\nsafety_strictness = \"yolo\"");
        assert!(load_config(f.path()).is_err());
    }
}
