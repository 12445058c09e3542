use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn kh_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("kh");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

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

    let config_content = format!(
        r#"[db]
path = "{}/data/kh.sqlite"

[embedding]
provider = "hash"
dims = 64

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("kh.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_kh(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = kh_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run kh binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn files(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .display()
        .to_string()
}

/// Ingest a file and return the new document id.
fn ingest(config_path: &Path, tenant: &str, title: &str, file: &str) -> String {
    let path = files(config_path, file);
    let (stdout, stderr, success) = run_kh(
        config_path,
        &["ingest", title, "--file", &path, "--tenant", tenant, "--content-type", "text/markdown"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
        .lines()
        .find_map(|l| l.strip_prefix("ingested "))
        .map(str::to_string)
        .unwrap_or_else(|| panic!("no document id in output: {}", stdout))
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_kh(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/kh.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_kh(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_kh(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_reports_chunks() {
    let (_tmp, config_path) = setup_test_env();
    let path = files(&config_path, "alpha.md");

    let (stdout, stderr, success) = run_kh(
        &config_path,
        &["ingest", "Alpha", "--file", &path, "--tenant", "acme"],
    );
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks: 1"));
    assert!(stdout.contains("title: Alpha"));
}

#[test]
fn test_query_finds_ingested_document() {
    let (_tmp, config_path) = setup_test_env();
    ingest(&config_path, "acme", "Alpha", "alpha.md");
    ingest(&config_path, "acme", "Beta", "beta.md");

    let (stdout, stderr, success) = run_kh(
        &config_path,
        &["query", "rust cargo crates", "--tenant", "acme", "--min-score", "0"],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.starts_with("1. ["), "unexpected output: {}", stdout);
    assert!(first.contains("Alpha"), "unexpected output: {}", stdout);
}

#[test]
fn test_query_json_output() {
    let (_tmp, config_path) = setup_test_env();
    ingest(&config_path, "acme", "Alpha", "alpha.md");

    let (stdout, stderr, success) = run_kh(
        &config_path,
        &["query", "CARGO", "--tenant", "acme", "--min-score", "0", "--json"],
    );
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["totalChunks"], 1);
    assert_eq!(json["chunks"][0]["title"], "Alpha");
    assert!(json["context"].as_str().unwrap().starts_with("[1] Alpha"));
    assert_eq!(json["diagnostics"]["classification"], "exact_match");
}

#[test]
fn test_tenants_are_isolated() {
    let (_tmp, config_path) = setup_test_env();
    ingest(&config_path, "acme", "Alpha", "alpha.md");

    let (stdout, _, success) = run_kh(
        &config_path,
        &["query", "rust cargo crates", "--tenant", "globex", "--min-score", "0"],
    );
    assert!(success);
    assert!(stdout.contains("No results."));

    let (stdout, _, success) = run_kh(&config_path, &["list", "--tenant", "globex"]);
    assert!(success);
    assert!(stdout.contains("No documents."));
}

#[test]
fn test_delete_removes_document() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest(&config_path, "acme", "Alpha", "alpha.md");

    let (stdout, _, success) = run_kh(&config_path, &["list", "--tenant", "acme"]);
    assert!(success);
    assert!(stdout.contains(&id));

    let (_, stderr, success) = run_kh(&config_path, &["delete", &id, "--tenant", "globex"]);
    assert!(!success, "cross-tenant delete must fail");
    assert!(stderr.contains("not found"));

    let (stdout, _, success) = run_kh(&config_path, &["delete", &id, "--tenant", "acme"]);
    assert!(success);
    assert!(stdout.contains(&format!("deleted {}", id)));

    let (stdout, _, _) = run_kh(
        &config_path,
        &["query", "rust cargo crates", "--tenant", "acme", "--min-score", "0"],
    );
    assert!(stdout.contains("No results."));
}

#[test]
fn test_invalid_requests_fail() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_kh(
        &config_path,
        &["ingest", "Empty", "--content", "   ", "--tenant", "acme"],
    );
    assert!(!success);
    assert!(stderr.contains("content must not be empty"), "stderr: {}", stderr);

    let (_, stderr, success) = run_kh(
        &config_path,
        &["query", "anything", "--tenant", "acme", "--top-k", "0"],
    );
    assert!(!success);
    assert!(stderr.contains("top_k"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    fs::write(
        &config_path,
        "[db]\npath = \"kh.sqlite\"\n\n[embedding]\nprovider = \"magic\"\n",
    )
    .unwrap();

    let (_, stderr, success) = run_kh(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown embedding provider"));
}
