use chrono::{Duration, Local};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mnemo_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mnemo");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_content = format!(
        r#"[workspace]
dir = "{}/ws"

[chunking]
target_tokens = 100
overlap_tokens = 20

[search]
lexical_fallback = true

[retention]
days_to_keep = 7
strategy = "archive"
"#,
        root.display()
    );

    let config_path = root.join("mnemo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mnemo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mnemo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mnemo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_workspace_and_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mnemo(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let ws = tmp.path().join("ws");
    assert!(ws.join("MEMORY.md").exists());
    assert!(ws.join("memory").is_dir());
    assert!(ws.join("memory.db").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_mnemo(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_mnemo(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_remember_then_search() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    let (stdout, _, success) = run_mnemo(
        &config_path,
        &["remember", "Deployed the billing service with the new flag."],
    );
    assert!(success);
    assert!(stdout.contains("remembered"));

    let (stdout, _, success) = run_mnemo(&config_path, &["search", "billing service"]);
    assert!(success, "search failed: {}", stdout);
    assert!(
        stdout.contains("billing"),
        "expected the remembered note in results, got: {}",
        stdout
    );
}

#[test]
fn test_search_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    run_mnemo(&config_path, &["remember", "One note about kubernetes."]);
    run_mnemo(&config_path, &["remember", "Another note about kubernetes."]);

    let (stdout1, _, _) = run_mnemo(&config_path, &["search", "kubernetes"]);
    let (stdout2, _, _) = run_mnemo(&config_path, &["search", "kubernetes"]);
    assert_eq!(stdout1, stdout2, "search output should be deterministic");
}

#[test]
fn test_search_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    let (stdout, _, success) = run_mnemo(&config_path, &["search", "xyznonexistentterm"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_search_empty_query() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    let (stdout, _, success) = run_mnemo(&config_path, &["search", ""]);
    assert!(success, "empty query should not fail");
    assert!(stdout.contains("No results."));
}

#[test]
fn test_promote_lands_in_long_term_file() {
    let (tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    let (stdout, _, success) = run_mnemo(
        &config_path,
        &[
            "promote",
            "Production deploys always go through the canary stage.",
            "--summary",
            "deploy policy",
        ],
    );
    assert!(success);
    assert!(stdout.contains("promoted"));

    let long_term = fs::read_to_string(tmp.path().join("ws").join("MEMORY.md")).unwrap();
    assert!(long_term.contains("canary stage"));
    assert!(long_term.contains("**Summary:** deploy policy"));

    let (stdout, _, _) = run_mnemo(&config_path, &["search", "canary stage"]);
    assert!(stdout.contains("long-term"));
}

#[test]
fn test_compact_retention_window() {
    let (tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);

    // Ten daily files: today through nine days ago
    let memory_dir = tmp.path().join("ws").join("memory");
    for age in 0..10 {
        let date = Local::now().date_naive() - Duration::days(age);
        fs::write(
            memory_dir.join(format!("{}.md", date.format("%Y-%m-%d"))),
            format!("# Log\nNotes from {} days ago, tagged marker{}.\n", age, age),
        )
        .unwrap();
    }
    run_mnemo(&config_path, &["sync"]);

    let (stdout, _, success) = run_mnemo(&config_path, &["compact", "--days", "7"]);
    assert!(success, "compact failed: {}", stdout);
    assert!(stdout.contains("files compacted: 3"));
    assert!(stdout.contains("files archived: 3"));

    let remaining = fs::read_dir(&memory_dir).unwrap().count();
    assert_eq!(remaining, 7, "seven newest daily files remain");
    let archived = fs::read_dir(tmp.path().join("ws").join("archive")).unwrap().count();
    assert_eq!(archived, 3);

    // Archived content is no longer searchable; kept content still is
    let (stdout, _, _) = run_mnemo(&config_path, &["search", "marker9"]);
    assert!(stdout.contains("No results."), "got: {}", stdout);
    let (stdout, _, _) = run_mnemo(&config_path, &["search", "marker2"]);
    assert!(stdout.contains("marker2") || !stdout.contains("No results."));
}

#[test]
fn test_index_and_forget_external_file() {
    let (tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);

    let doc = tmp.path().join("guide.md");
    fs::write(&doc, "# Guide\nTuning the frobnicator requires patience.\n").unwrap();

    let (stdout, _, success) = run_mnemo(
        &config_path,
        &["index", doc.to_str().unwrap(), "--source", "docs"],
    );
    assert!(success, "index failed: {}", stdout);
    assert!(stdout.contains("chunks added: 1"));

    let (stdout, _, _) = run_mnemo(&config_path, &["search", "frobnicator"]);
    assert!(stdout.contains("guide.md"));

    let (stdout, _, success) = run_mnemo(
        &config_path,
        &["forget", doc.to_str().unwrap(), "--source", "docs"],
    );
    assert!(success);
    assert!(stdout.contains("forgot"));

    let (stdout, _, _) = run_mnemo(&config_path, &["search", "frobnicator"]);
    assert!(stdout.contains("No results."));

    // Forgetting an unknown path still succeeds
    let (_, _, success) = run_mnemo(&config_path, &["forget", "never-indexed.md"]);
    assert!(success);
}

#[test]
fn test_reindex_skips_unchanged_files() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    run_mnemo(&config_path, &["remember", "A single stable note."]);
    run_mnemo(&config_path, &["sync"]);

    // Nothing changed: the second sync indexes zero chunks
    let (stdout, _, success) = run_mnemo(&config_path, &["sync"]);
    assert!(success);
    assert!(
        stdout.contains("chunks indexed: 0"),
        "expected no re-indexing, got: {}",
        stdout
    );
}

#[test]
fn test_stats_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    run_mnemo(&config_path, &["remember", "Stats fodder note."]);
    run_mnemo(&config_path, &["sync"]);

    let (stdout, _, success) = run_mnemo(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Files:"));
    assert!(stdout.contains("Chunks:"));
    assert!(stdout.contains("short-term"));
}

#[test]
fn test_search_flags_keyword_only_degradation() {
    let (_tmp, config_path) = setup_test_env();

    run_mnemo(&config_path, &["init"]);
    run_mnemo(&config_path, &["remember", "Degradation probe note."]);

    // Embeddings are disabled in this config, so the fallback note goes
    // to stderr while results still arrive
    let (stdout, stderr, success) = run_mnemo(&config_path, &["search", "degradation probe"]);
    assert!(success);
    assert!(stderr.contains("keyword-only"), "stderr: {}", stderr);
    assert!(stdout.contains("probe") || !stdout.contains("No results."));
}

#[test]
fn test_search_without_fallback_fails_cleanly() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("mnemo.toml");
    fs::write(
        &config_path,
        format!(
            "[workspace]\ndir = \"{}/ws\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    run_mnemo(&config_path, &["init"]);
    let (_, stderr, success) = run_mnemo(&config_path, &["search", "anything"]);
    assert!(!success, "search without provider or fallback should fail");
    assert!(
        stderr.contains("embedding") || stderr.contains("provider"),
        "stderr should explain the failure, got: {}",
        stderr
    );
}
