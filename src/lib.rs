//! # kenny
//!
//! **A local-first personal knowledge indexer and query engine.**
//!
//! kenny ingests data from heterogeneous personal sources (mail headers,
//! calendar events, reminders, notes, files, SMS/iMessage, WhatsApp,
//! contacts), normalizes them into a unified document model persisted in an
//! embedded relational store with full-text and vector indices, and answers
//! natural-language queries by combining lexical and semantic retrieval. It
//! also exposes a controlled set of side-effecting tools (create reminder,
//! append note, move file) behind a dry-run/confirm safety protocol, and a
//! reasoning loop that selects and invokes those tools from a user prompt.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Extractors  │──▶│   Ingest     │──▶│  SQLite   │
//! │ (per source)│   │ Coordinator  │   │ FTS5+Vec  │
//! └─────────────┘   └──────────────┘   └────┬─────┘
//!                                           │
//!                       ┌───────────────────┤
//!                       ▼                   ▼
//!                  ┌──────────┐       ┌──────────┐
//!                  │   CLI    │       │   HTTP   │
//!                  │ (kenny)  │       │  server  │
//!                  └──────────┘       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **Extractors** ([`extractors`]) scan external sources and produce
//!    [`models::RawRecord`]s.
//! 2. The **ingest coordinator** ([`ingest`]) normalizes records, computes
//!    content-addressed deduplication hashes, and upserts them through the
//!    **document store** ([`store`]), which serializes all writes through a
//!    single **connection broker** ([`broker`]).
//! 3. Documents are split into [`models::Chunk`]s by the paragraph-boundary
//!    chunker ([`chunk`]) and embedded via the configured provider
//!    ([`embedding`]).
//! 4. Chunks are indexed in **FTS5** for lexical search; embeddings feed a
//!    brute-force cosine scan for vector search. **Hybrid search**
//!    ([`search`]) fuses both.
//! 5. Raw queries pass through **query enhancement** ([`enhance`]), backed
//!    by a process-local **cache** ([`cache`]), before retrieval.
//! 6. A controlled set of side-effecting **tools** ([`tools`]) is exposed
//!    behind a dry-run/confirm safety protocol; a **reasoning loop**
//!    ([`reasoning`]) selects and invokes them from a free-text prompt.
//! 7. Every tool invocation and a stream of performance counters are
//!    recorded for observability ([`metrics`]).
//! 8. All of the above is reachable via the **CLI** (`kenny`) and an HTTP
//!    **server** ([`server`]).
//!
//! ## Quick Start
//!
//! ```bash
//! kenny init                      # create database
//! kenny sync files                # ingest the configured files root
//! kenny embed pending              # generate embeddings
//! kenny search "dentist appointment" --limit 5
//! kenny serve                      # start the HTTP server
//! ```
//!
//! ## Sources
//!
//! | Source | Extractor | Notes |
//! |--------|-----------|-------|
//! | `files` | [`extractors::FileExtractor`] | implemented directly; walks a configured root |
//! | `calendar`, `mail`, `messages`, `contacts`, `whatsapp`, `notes`, `reminders` | host-supplied | OS-framework extractors; see [`extractors::SourceExtractor`] |
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types: documents, chunks, satellite fields, search results |
//! | [`db`] | SQLite connection pool, WAL mode, vector blob (de)serialization |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`broker`] | Single-writer/many-reader connection broker |
//! | [`store`] | Document store: upserts, satellite tables, chunks, embeddings, audit |
//! | [`chunk`] | Paragraph-boundary text chunker |
//! | [`embedding`] | Embedding provider trait, OpenAI/Ollama implementations, vector utilities |
//! | [`embed_cmd`] | Embedding CLI commands: `pending` and `rebuild` |
//! | [`extractors`] | Source extractor trait plus the filesystem implementation |
//! | [`ingest`] | Ingestion coordinator: extractors → normalize → chunk → embed → store |
//! | [`backup`] | Pre-sync database backup |
//! | [`search`] | Lexical, vector, and hybrid search with score normalization |
//! | [`enhance`] | Query enhancement: intent, entities, time filters, source hints |
//! | [`cache`] | Process-local TTL cache backing enhancement and tool results |
//! | [`get`] | Document retrieval by id |
//! | [`sources`] | Source health and status listing |
//! | [`stats`] | Database statistics summary |
//! | [`tools`] | Tool registry and dry-run/confirm safe-execution protocol |
//! | [`reasoning`] | LLM-driven tool-selection retry loop |
//! | [`metrics`] | In-memory counters/timers with percentile summaries |
//! | [`server`] | HTTP server exposing search, tools, and reasoning |
//!
//! ## Configuration
//!
//! kenny is configured via a TOML file (default: `config/kenny.toml`). See
//! [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod backup;
pub mod broker;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod enhance;
pub mod extractors;
pub mod get;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod reasoning;
pub mod search;
pub mod server;
pub mod sources;
pub mod stats;
pub mod store;
pub mod tools;
