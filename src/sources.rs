//! Source status listing.
//!
//! Reports which of the coordinator's fixed sources are configured and
//! healthy. Used by both the `kenny sources` CLI command and the
//! `GET /tools/sources` HTTP endpoint.
//!
//! Most source types (calendar, mail, messages, contacts, whatsapp, notes,
//! reminders) talk to an OS-owned framework this crate does not implement —
//! they are reported as `not_configured` unless the embedding application
//! has registered an extractor for them. `files` is the one source this
//! crate can check directly: configured when `[extractors.files]` is
//! present, healthy when its root directory exists.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Config;
use crate::extractors::SourceExtractor;
use crate::ingest::FIXED_SOURCE_ORDER;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub configured: bool,
    pub healthy: bool,
    pub detail: String,
}

/// Report status for every source in the coordinator's fixed order,
/// regardless of whether it has a registered extractor.
pub fn list_sources(
    config: &Config,
    extractors: &HashMap<String, Box<dyn SourceExtractor>>,
) -> Vec<SourceStatus> {
    FIXED_SOURCE_ORDER
        .iter()
        .map(|name| status_for(config, name, extractors.contains_key(*name)))
        .collect()
}

fn status_for(config: &Config, name: &str, has_extractor: bool) -> SourceStatus {
    if name != "files" {
        return SourceStatus {
            name: name.to_string(),
            configured: has_extractor,
            healthy: has_extractor,
            detail: if has_extractor {
                "registered by host application".to_string()
            } else {
                "requires an OS-framework extractor supplied by the host application".to_string()
            },
        };
    }

    match &config.extractors.files {
        Some(files) if files.root.exists() => SourceStatus {
            name: name.to_string(),
            configured: true,
            healthy: true,
            detail: format!("root {} exists", files.root.display()),
        },
        Some(files) => SourceStatus {
            name: name.to_string(),
            configured: true,
            healthy: false,
            detail: format!("root {} does not exist", files.root.display()),
        },
        None => SourceStatus {
            name: name.to_string(),
            configured: false,
            healthy: false,
            detail: "no [extractors.files] section in config".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn no_extractors() -> HashMap<String, Box<dyn SourceExtractor>> {
        HashMap::new()
    }

    #[test]
    fn reports_all_fixed_sources() {
        let config = test_config();
        let statuses = list_sources(&config, &no_extractors());
        assert_eq!(statuses.len(), FIXED_SOURCE_ORDER.len());
        assert!(statuses.iter().all(|s| !s.configured));
    }

    #[test]
    fn files_source_unconfigured_without_extractors_section() {
        let config = test_config();
        let statuses = list_sources(&config, &no_extractors());
        let files = statuses.iter().find(|s| s.name == "files").unwrap();
        assert!(!files.configured);
        assert!(!files.healthy);
    }
}
