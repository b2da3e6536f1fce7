//! Scenario 6 and the boundary behaviors of the security gates.

use az_adapters::tools;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn scenario_6_path_traversal_attack() {
    let dir = TempDir::new().unwrap();

    // The model asks for a write outside the worktree
    let outcome = tools::execute(
        "write_file",
        &json!({"path": "../../etc/passwd", "content": "x"}),
        dir.path(),
    )
    .await;

    // The tool fails without touching the filesystem; the session's tool
    // loop is free to continue
    assert!(!outcome.success);
    assert!(outcome.content.contains("path traversal"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

    // The very next tool call on the same working dir still works
    let next = tools::execute(
        "write_file",
        &json!({"path": "notes.txt", "content": "inside"}),
        dir.path(),
    )
    .await;
    assert!(next.success);
    assert!(dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn denylisted_command_is_rejected_before_spawn() {
    let dir = TempDir::new().unwrap();
    let outcome =
        tools::execute("exec_command", &json!({"command": "dd if=/dev/zero of=/dev/sda"}), dir.path())
            .await;
    assert!(!outcome.success);
    assert!(outcome.content.contains("denylist"));
}

#[tokio::test]
async fn oversized_file_fails_the_tool_not_the_session() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("big.bin"), vec![b'x'; 51 * 1024]).unwrap();

    let outcome = tools::execute("read_file", &json!({"path": "big.bin"}), dir.path()).await;
    assert!(!outcome.success);
    assert!(outcome.content.contains("file too large"));

    // Subsequent reads of reasonable files still succeed
    std::fs::write(dir.path().join("small.txt"), "ok").unwrap();
    let next = tools::execute("read_file", &json!({"path": "small.txt"}), dir.path()).await;
    assert!(next.success);
}
