//! # kenny
//!
//! CLI entry point. See the `kenny` library crate's documentation for the
//! architecture overview; this binary is a thin wrapper that wires
//! configuration, the document store, and the embedding provider into each
//! subcommand.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kenny::broker::ConnectionBroker;
use kenny::cache::Cache;
use kenny::config::{self, Config};
use kenny::db;
use kenny::embed_cmd;
use kenny::embedding;
use kenny::enhance;
use kenny::extractors::{FileExtractor, SourceExtractor};
use kenny::get::get_document;
use kenny::ingest::IngestCoordinator;
use kenny::migrate;
use kenny::models::DocumentType;
use kenny::reasoning;
use kenny::search::{hybrid_search, SearchType};
use kenny::server;
use kenny::sources::list_sources;
use kenny::stats::run_stats;
use kenny::store::DocumentStore;
use kenny::tools::{CallContext, ToolRegistry};

#[derive(Parser)]
#[command(
    name = "kenny",
    about = "kenny — a local-first personal knowledge indexer and query engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/kenny.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// List configured sources and their health
    Sources,

    /// Ingest data from one source, or every configured source
    Sync {
        /// Source name (e.g. files), or omit with --all
        source: Option<String>,

        /// Sync every configured source in fixed order
        #[arg(long)]
        all: bool,

        /// Ignore checkpoint, reingest everything
        #[arg(long)]
        full: bool,
    },

    /// Search indexed documents
    Search {
        /// Search query
        query: String,

        /// Restrict to one or more document types (repeatable)
        #[arg(long = "type")]
        doc_type: Vec<DocumentType>,

        /// Maximum number of results
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Retrieve a document by ID
    Get {
        /// Document ID
        id: String,
    },

    /// Print database statistics
    Stats,

    /// Manage embeddings
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },

    /// Enhance a raw query (intent, entities, time filter, source hints)
    Enhance {
        /// Query text
        query: String,
    },

    /// Inspect or invoke the side-effecting tool registry
    Tools {
        #[command(subcommand)]
        action: ToolsAction,
    },

    /// Run the reasoning loop over a free-text prompt
    Reason {
        /// Prompt text
        query: String,
    },

    /// Start the HTTP server
    Serve,

    /// List persisted audit records, newest first
    Audit {
        /// Filter by correlation id
        #[arg(long)]
        correlation_id: Option<String>,

        /// Filter by plan id
        #[arg(long)]
        plan_id: Option<String>,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks missing an embedding row for the configured model
    Pending {
        /// Maximum number of chunks to embed
        #[arg(long)]
        limit: Option<usize>,

        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,

        /// Show counts without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete and regenerate all embeddings
    Rebuild {
        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ToolsAction {
    /// List the tool catalog
    List,

    /// Invoke a tool by name
    Call {
        /// Tool name (e.g. search_data)
        name: String,

        /// JSON-encoded arguments object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Confirm a previously dry-run mutating call
        #[arg(long)]
        confirm: bool,

        /// Operation hash returned by the dry run, required with --confirm
        #[arg(long)]
        operation_hash: Option<String>,

        /// Plan id returned by the dry run, required with --confirm; a fresh
        /// one is generated and printed when omitted on a dry run
        #[arg(long)]
        plan_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sources => {
            let extractors = build_extractors(&cfg);
            for status in list_sources(&cfg, &extractors) {
                println!(
                    "{:<10} configured={:<5} healthy={:<5} {}",
                    status.name, status.configured, status.healthy, status.detail
                );
            }
        }
        Commands::Sync { source, all, full } => {
            let store = open_store(&cfg).await?;
            let config = Arc::new(cfg.clone());
            let provider: Arc<dyn embedding::EmbeddingProvider> =
                Arc::from(embedding::create_provider(&config.embedding)?);
            let extractors = build_extractors(&cfg);
            let coordinator = IngestCoordinator::new(Arc::new(store), config, provider);

            if all || source.is_none() {
                let results = coordinator.run_all(&extractors, full).await?;
                for stats in results {
                    print_ingest_stats(&stats);
                }
            } else {
                let name = source.expect("checked above");
                match extractors.get(name.as_str()) {
                    Some(extractor) => {
                        let stats = coordinator.run_source(extractor.as_ref(), full).await;
                        print_ingest_stats(&stats);
                    }
                    None => {
                        anyhow::bail!("no extractor registered for source: {name}");
                    }
                }
            }
        }
        Commands::Search {
            query,
            doc_type,
            limit,
        } => {
            let store = open_store(&cfg).await?;
            let provider = embedding::create_provider(&cfg.embedding)?;
            let response = hybrid_search(&store, &cfg, provider.as_ref(), &query, &doc_type, limit).await?;

            println!(
                "search_type: {}",
                match response.search_type {
                    SearchType::Hybrid => "hybrid",
                    SearchType::Bm25Only => "bm25_only",
                }
            );
            for result in response.results {
                println!(
                    "{:.4}  [{}] {}  ({})",
                    result.score,
                    result.app_source,
                    result.title.as_deref().unwrap_or("(untitled)"),
                    result.document_id
                );
                println!("      {}", result.snippet);
            }
        }
        Commands::Get { id } => {
            let store = open_store(&cfg).await?;
            let doc = get_document(&store, &id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Stats => {
            let store = open_store(&cfg).await?;
            run_stats(&cfg, &store).await?;
        }
        Commands::Embed { action } => {
            let store = open_store(&cfg).await?;
            match action {
                EmbedAction::Pending {
                    limit,
                    batch_size,
                    dry_run,
                } => {
                    embed_cmd::run_embed_pending(&cfg, &store, limit, batch_size, dry_run).await?;
                }
                EmbedAction::Rebuild { batch_size } => {
                    embed_cmd::run_embed_rebuild(&cfg, &store, batch_size).await?;
                }
            }
        }
        Commands::Enhance { query } => {
            let cache = Cache::new(&cfg.cache, cfg.environment);
            let enhanced = enhance::enhance(&cfg, &cache, &query).await;
            println!("{}", serde_json::to_string_pretty(&enhanced)?);
        }
        Commands::Tools { action } => match action {
            ToolsAction::List => {
                for summary in kenny::tools::catalog_summary() {
                    println!(
                        "{:<16} mutating={:<5} {}",
                        summary.name, summary.mutating, summary.description
                    );
                    for param in summary.parameters {
                        println!(
                            "    {:<16} {:<8} required={} — {}",
                            param.name, param.param_type, param.required, param.description
                        );
                    }
                }
            }
            ToolsAction::Call {
                name,
                args,
                confirm,
                operation_hash,
                plan_id,
            } => {
                let store = open_store(&cfg).await?;
                let provider = embedding::create_provider(&cfg.embedding)?;
                let registry = ToolRegistry::new(&store, &cfg, provider.as_ref());
                let arguments: serde_json::Value = serde_json::from_str(&args)?;
                let ctx = CallContext {
                    correlation_id: uuid::Uuid::new_v4().to_string(),
                    plan_id: plan_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                    step_index: 0,
                };
                let result = registry
                    .call(&name, arguments, confirm, operation_hash.as_deref(), &ctx)
                    .await?;
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        },
        Commands::Reason { query } => {
            let store = open_store(&cfg).await?;
            let provider = embedding::create_provider(&cfg.embedding)?;
            let registry = ToolRegistry::new(&store, &cfg, provider.as_ref());
            let plan_id = uuid::Uuid::new_v4().to_string();
            let outcome = reasoning::run(&registry, &cfg, &query, &plan_id).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Serve => {
            let store = Arc::new(open_store(&cfg).await?);
            let config = Arc::new(cfg.clone());
            let provider: Arc<dyn embedding::EmbeddingProvider> =
                Arc::from(embedding::create_provider(&config.embedding)?);
            let cache = Arc::new(Cache::new(&config.cache, config.environment));
            let extractors = Arc::new(build_extractors(&cfg));

            server::run_server(config, store, provider, cache, extractors).await?;
        }
        Commands::Audit {
            correlation_id,
            plan_id,
        } => {
            let store = open_store(&cfg).await?;
            let records = store
                .find_audit_records(correlation_id.as_deref(), plan_id.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

async fn open_store(config: &Config) -> anyhow::Result<DocumentStore> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    Ok(DocumentStore::new(ConnectionBroker::new(pool)))
}

fn build_extractors(config: &Config) -> HashMap<String, Box<dyn SourceExtractor>> {
    let mut extractors: HashMap<String, Box<dyn SourceExtractor>> = HashMap::new();

    if let Some(files_config) = &config.extractors.files {
        extractors.insert(
            "files".to_string(),
            Box::new(FileExtractor::new(files_config.clone())),
        );
    }

    extractors
}

fn print_ingest_stats(stats: &kenny::models::IngestStats) {
    println!(
        "{:<10} status={:?} processed={} created={} updated={} tombstoned={} errors={} ({}ms)",
        stats.source,
        stats.status,
        stats.items_processed,
        stats.items_created,
        stats.items_updated,
        stats.items_tombstoned,
        stats.errors,
        stats.duration_ms
    );
}

fn init_tracing(config: &Config) {
    if !config.monitoring.enabled {
        return;
    }

    let filter = EnvFilter::try_new(&config.monitoring.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if config.monitoring.structured_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
