use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kenny_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kenny");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let data_dir = root.join("data");
    fs::create_dir_all(&data_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt contains information about cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nDeep learning frameworks like PyTorch are covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nContains notes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/kenny.sqlite"

[chunking]
max_chunk_size = 700
overlap = 80

[retrieval]
final_limit = 12

[server]
bind = "127.0.0.1:7331"

[extractors.files]
root = "{}/files"
include_globs = ["**/*.md", "**/*.txt"]
exclude_globs = []
follow_symlinks = false
"#,
        root.display(),
        root.display()
    );

    let config_path = config_dir.join("kenny.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kenny(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kenny_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run kenny binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kenny(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kenny(&config_path, &["init"]);
    assert!(success1, "first init failed");

    let (_, _, success2) = run_kenny(&config_path, &["init"]);
    assert!(success2, "second init failed, migrations are not idempotent");
}

#[test]
fn sync_files_ingests_every_matching_file() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    let (stdout, stderr, success) = run_kenny(&config_path, &["sync", "files"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("files"));
    assert!(stdout.contains("status=Success"));
    assert!(stdout.contains("processed=3"));
}

#[test]
fn sync_full_is_idempotent_no_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);

    let (stdout1, _, _) = run_kenny(&config_path, &["sync", "files", "--full"]);
    assert!(stdout1.contains("processed=3"));

    let (stdout2, _, _) = run_kenny(&config_path, &["sync", "files", "--full"]);
    assert!(stdout2.contains("processed=3"));
}

#[test]
fn sync_incremental_skips_unmodified_files() {
    let (tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    // A second incremental sync with no changes should see nothing new.
    let (stdout, _, _) = run_kenny(&config_path, &["sync", "files"]);
    assert!(
        stdout.contains("processed=0"),
        "expected no items on unchanged incremental sync, got: {}",
        stdout
    );

    std::thread::sleep(std::time::Duration::from_secs(1));
    let files_dir = tmp.path().join("files");
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document Updated\n\nThis file was modified.",
    )
    .unwrap();

    let (stdout, _, _) = run_kenny(&config_path, &["sync", "files"]);
    assert!(
        stdout.contains("processed=1"),
        "expected 1 changed file, got: {}",
        stdout
    );
}

#[test]
fn search_finds_matching_document() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (stdout, stderr, success) = run_kenny(&config_path, &["search", "Rust programming"]);
    assert!(success, "search failed: {}", stderr);
    assert!(stdout.contains("search_type: bm25_only"));
    assert!(
        stdout.contains("Alpha") || stdout.contains("alpha"),
        "expected alpha document in results, got: {}",
        stdout
    );
}

#[test]
fn search_is_deterministic_across_runs() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (stdout1, _, _) = run_kenny(&config_path, &["search", "document"]);
    let (stdout2, _, _) = run_kenny(&config_path, &["search", "document"]);
    assert_eq!(stdout1, stdout2, "identical queries should return identical output");
}

#[test]
fn search_with_no_matches_returns_empty_results() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (stdout, _, success) = run_kenny(&config_path, &["search", "xyznonexistenttoken"]);
    assert!(success);
    assert!(stdout.contains("search_type:"));
}

#[test]
fn get_round_trips_a_synced_document() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (search_out, _, _) = run_kenny(&config_path, &["search", "Rust"]);
    let id = search_out
        .lines()
        .find(|line| line.contains('('))
        .and_then(|line| line.rsplit('(').next())
        .and_then(|tail| tail.strip_suffix(')'))
        .map(|s| s.to_string());

    let doc_id = id.expect("expected at least one search result with a document id");

    let (stdout, stderr, success) = run_kenny(&config_path, &["get", &doc_id]);
    assert!(success, "get failed: {}", stderr);
    assert!(stdout.contains(&doc_id));
}

#[test]
fn get_missing_document_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);

    let (_, stderr, success) = run_kenny(&config_path, &["get", "nonexistent-id"]);
    assert!(!success, "get with a missing id should fail");
    assert!(stderr.contains("not found"), "expected a not-found message, got: {}", stderr);
}

#[test]
fn sources_reports_the_configured_files_extractor() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kenny(&config_path, &["sources"]);
    assert!(success);
    assert!(stdout.contains("files"));
    assert!(stdout.contains("configured=true"));
}

#[test]
fn sync_unknown_source_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    let (_, stderr, success) = run_kenny(&config_path, &["sync", "nonexistent"]);
    assert!(!success, "unknown source should fail");
    assert!(stderr.contains("no extractor registered"));
}

#[test]
fn embed_pending_fails_when_embedding_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    let (_, stderr, success) = run_kenny(&config_path, &["embed", "pending"]);
    assert!(!success, "embed pending should fail when the provider is disabled");
    assert!(stderr.contains("disabled"));
}

#[test]
fn embed_rebuild_fails_when_embedding_disabled() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    let (_, stderr, success) = run_kenny(&config_path, &["embed", "rebuild"]);
    assert!(!success, "embed rebuild should fail when the provider is disabled");
    assert!(stderr.contains("disabled"));
}

#[test]
fn tools_list_includes_the_closed_catalog() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_kenny(&config_path, &["tools", "list"]);
    assert!(success);
    assert!(stdout.contains("search_data"));
    assert!(stdout.contains("create_reminder"));
    assert!(stdout.contains("append_note"));
    assert!(stdout.contains("move_file"));
}

#[test]
fn tools_call_search_data_succeeds_read_only() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (stdout, stderr, success) = run_kenny(
        &config_path,
        &["tools", "call", "search_data", "--args", r#"{"query":"Rust"}"#],
    );
    assert!(success, "tools call failed: {}", stderr);
    assert!(stdout.contains("\"requires_confirmation\": false"));
}

#[test]
fn tools_call_mutating_tool_requires_dry_run_then_confirm() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);

    let (dry_run_stdout, stderr, success) = run_kenny(
        &config_path,
        &[
            "tools",
            "call",
            "create_reminder",
            "--args",
            r#"{"title":"call the dentist"}"#,
        ],
    );
    assert!(success, "dry run should succeed: {}", stderr);
    assert!(dry_run_stdout.contains("\"requires_confirmation\": true"));

    let hash = dry_run_stdout
        .lines()
        .find(|line| line.contains("operation_hash"))
        .and_then(|line| line.split('"').nth(3))
        .expect("dry run response should carry an operation_hash");

    let plan_id = dry_run_stdout
        .lines()
        .find(|line| line.contains("plan_id"))
        .and_then(|line| line.split('"').nth(3))
        .expect("dry run response should carry a plan_id");

    let (confirm_stdout, stderr, success) = run_kenny(
        &config_path,
        &[
            "tools",
            "call",
            "create_reminder",
            "--args",
            r#"{"title":"call the dentist"}"#,
            "--confirm",
            "--operation-hash",
            hash,
            "--plan-id",
            plan_id,
        ],
    );
    assert!(success, "confirmed call should succeed: {}", stderr);
    assert!(confirm_stdout.contains("\"was_dry_run\": false"));
}

#[test]
fn reason_mock_provider_selects_search_data() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);
    run_kenny(&config_path, &["sync", "files"]);

    let (stdout, stderr, success) = run_kenny(&config_path, &["reason", "find my rust notes"]);
    assert!(success, "reason failed: {}", stderr);
    assert!(stdout.contains("\"tool_used\": \"search_data\""));
    assert!(stdout.contains("\"success\": true"));
}

#[test]
fn enhance_falls_back_to_basic_nlp_with_the_mock_provider() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kenny(&config_path, &["enhance", "remind me to call mom tomorrow"]);
    assert!(success, "enhance failed: {}", stderr);
    assert!(stdout.contains("\"method\""));
}

#[test]
fn audit_lists_a_dry_run_tool_call_and_filters_by_plan_id() {
    let (_tmp, config_path) = setup_test_env();

    run_kenny(&config_path, &["init"]);

    let (dry_run_stdout, stderr, success) = run_kenny(
        &config_path,
        &[
            "tools",
            "call",
            "create_reminder",
            "--args",
            r#"{"title":"call the dentist"}"#,
        ],
    );
    assert!(success, "dry run should succeed: {}", stderr);

    let plan_id = dry_run_stdout
        .lines()
        .find(|line| line.contains("plan_id"))
        .and_then(|line| line.split('"').nth(3))
        .expect("dry run response should carry a plan_id");

    let (all_stdout, stderr, success) = run_kenny(&config_path, &["audit"]);
    assert!(success, "audit failed: {}", stderr);
    assert!(all_stdout.contains("create_reminder"));

    let (filtered_stdout, stderr, success) =
        run_kenny(&config_path, &["audit", "--plan-id", plan_id]);
    assert!(success, "audit --plan-id failed: {}", stderr);
    assert!(filtered_stdout.contains(plan_id));

    let (empty_stdout, stderr, success) =
        run_kenny(&config_path, &["audit", "--plan-id", "nonexistent-plan"]);
    assert!(success, "audit --plan-id with no match should still succeed: {}", stderr);
    assert_eq!(empty_stdout.trim(), "[]");
}
