use rusqlite::Connection;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::tempdir;

fn run(dir: &Path, args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_article-sync");
    Command::new(bin_path)
        .args(args)
        .current_dir(dir)
        .env_remove("ARTICLE_SYNC_CONFIG")
        .env_remove("ARTICLE_SYNC_SOURCE")
        .env_remove("ARTICLE_SYNC_STORE")
        .env_remove("ARTICLE_SYNC_STATE")
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_watermark_command() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();
    let state_file = dir.join(".article-sync").join("state.json");

    // Unset watermark falls back to the sentinel
    let output = run(dir, &["watermark", "get"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("2010-11-23T19:36:18+00:00 (initial)"));
    assert!(!state_file.exists());

    let output = run(dir, &["watermark", "set", "1700000000"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("2023-11-14T22:13:20+00:00"));
    assert!(state_file.exists());

    let output = run(dir, &["watermark", "get"]);
    assert_eq!(stdout(&output).trim(), "2023-11-14T22:13:20+00:00");

    let output = run(dir, &["watermark", "reset"]);
    assert!(stdout(&output).contains("reset"));

    let output = run(dir, &["watermark", "get"]);
    assert!(stdout(&output).contains("(initial)"));

    // Garbage is rejected without touching state
    let output = run(dir, &["watermark", "set", "next tuesday"]);
    assert!(!output.status.success());
}

#[test]
fn test_sync_once_then_inspect() {
    let temp_dir = tempdir().unwrap();
    let dir = temp_dir.path();

    let conn = Connection::open(dir.join("cms.db")).unwrap();
    conn.execute_batch(
        "CREATE TABLE articles (id INTEGER PRIMARY KEY, content TEXT, updated_at TEXT);
         INSERT INTO articles VALUES (1, 'first', '2024-01-01 00:00:00');
         INSERT INTO articles VALUES (2, 'second', '2024-01-02 00:00:00');",
    )
    .unwrap();
    drop(conn);

    let output = run(
        dir,
        &["--source", "cms.db", "--store", "content.db", "sync", "--once"],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let text = stdout(&output);
    assert!(text.contains("Outcome: Completed"));
    assert!(text.contains("Created: 2"));

    let output = run(dir, &["--store", "content.db", "entities"]);
    let text = stdout(&output);
    assert!(text.contains("\t1\t"));
    assert!(text.contains("second"));
    assert!(text.contains("2 article entities"));

    let output = run(dir, &["status"]);
    let text = stdout(&output);
    assert!(text.contains("Pending retries: 0"));
    assert!(text.contains("Lock: free"));

    // Nothing changed since the last pass
    let output = run(
        dir,
        &["--source", "cms.db", "--store", "content.db", "sync", "--once"],
    );
    assert!(stdout(&output).contains("Outcome: NoRows"));
}

#[test]
fn test_sync_once_with_missing_source_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let output = run(temp_dir.path(), &["--source", "missing.db", "sync", "--once"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("Sync skipped"));
}
