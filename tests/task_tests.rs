use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a temporary database and set it as the data location
fn setup_test_env() -> (TempDir, std::sync::MutexGuard<'static, ()>) {
    let guard = test_env::lock_test_env();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let config_dir = temp_dir.path().join(".stagehand");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(config_dir.join("rc"), format!("data.location={}\n", db_path.display())).unwrap();

    std::env::set_var("HOME", temp_dir.path().to_str().unwrap());
    (temp_dir, guard)
}

fn get_cmd(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stagehand").unwrap();
    cmd.env("HOME", temp_dir.path());
    cmd
}

fn add_task(temp_dir: &TempDir, at: &str, title: &str) {
    get_cmd(temp_dir)
        .args(["task", "add", "--at", at, "alice", "cooking", title])
        .assert()
        .success();
}

#[test]
fn test_add_and_list_tasks() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "2030-01-01T10:00", "--category", "pasta", "alice", "cooking", "Pasta", "night"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created task 1 for alice/cooking at 2030-01-01 10:00"));

    get_cmd(&temp_dir)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("alice/cooking"))
        .stdout(predicate::str::contains("Pasta night"))
        .stdout(predicate::str::contains("schedule"))
        .stdout(predicate::str::contains("waiting"))
        .stdout(predicate::str::contains("0%"));
}

#[test]
fn test_list_empty() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks found."));
}

#[test]
fn test_duplicate_minute_is_rejected_without_force() {
    let (temp_dir, _guard) = setup_test_env();
    add_task(&temp_dir, "2030-01-01T10:00", "First");

    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "2030-01-01T10:00", "alice", "cooking", "Second"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("already has a task"));

    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "2030-01-01T10:00", "--force", "alice", "cooking", "Second"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created task 2"));

    // Another channel may use the same minute
    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "2030-01-01T10:00", "alice", "travel", "Third"])
        .assert()
        .success();
}

#[test]
fn test_add_rejects_bad_input() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "someday", "alice", "cooking", "Title"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"))
        .stderr(predicate::str::contains("Unsupported date expression"));

    get_cmd(&temp_dir)
        .args(["task", "add", "alice", "my channel", "Title"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid channel"));
}

#[test]
fn test_show_task_with_history() {
    let (temp_dir, _guard) = setup_test_env();
    add_task(&temp_dir, "2030-01-01T10:00", "Pasta night");

    get_cmd(&temp_dir)
        .args(["task", "show", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 1: Pasta night"))
        .stdout(predicate::str::contains("Channel:     alice/cooking"))
        .stdout(predicate::str::contains("Phase:     schedule"))
        .stdout(predicate::str::contains("Queue:     0 ahead"))
        .stdout(predicate::str::contains("History:"));

    get_cmd(&temp_dir)
        .args(["task", "show", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"title\": \"Pasta night\""))
        .stdout(predicate::str::contains("\"events\""));
}

#[test]
fn test_show_missing_task() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["task", "show", "42"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Task 42 not found"));
}

#[test]
fn test_cancel_and_retry() {
    let (temp_dir, _guard) = setup_test_env();
    add_task(&temp_dir, "2030-01-01T10:00", "Pasta night");

    get_cmd(&temp_dir)
        .args(["task", "cancel", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cancelled task 1 at schedule"));

    // Cancelled is final
    get_cmd(&temp_dir)
        .args(["task", "cancel", "1"])
        .assert()
        .failure()
        .code(1);
    get_cmd(&temp_dir)
        .args(["task", "retry", "1"])
        .assert()
        .failure()
        .code(1);

    add_task(&temp_dir, "2020-01-01T10:00", "Soup");
    get_cmd(&temp_dir).args(["stage", "acquire", "2", "schedule"]).assert().success();
    get_cmd(&temp_dir)
        .args(["stage", "fail", "2", "schedule", "network", "down"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 2 failed: network down"));
    get_cmd(&temp_dir)
        .args(["task", "retry", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Task 2 back to waiting at schedule (retry 1)"));
}

#[test]
fn test_list_filters() {
    let (temp_dir, _guard) = setup_test_env();
    add_task(&temp_dir, "2030-01-01T10:00", "Pasta night");
    get_cmd(&temp_dir)
        .args(["task", "add", "--at", "2030-01-01T10:00", "bob", "travel", "Lisbon"])
        .assert()
        .success();

    get_cmd(&temp_dir)
        .args(["task", "list", "--owner", "bob"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lisbon"))
        .stdout(predicate::str::contains("Pasta night").not());

    get_cmd(&temp_dir)
        .args(["task", "list", "--phase", "script"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No tasks found."));

    get_cmd(&temp_dir)
        .args(["task", "list", "--status", "finished"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid status"));
}

#[test]
fn test_progress_follows_phase() {
    let (temp_dir, _guard) = setup_test_env();
    add_task(&temp_dir, "2020-01-01T10:00", "Pasta night");

    get_cmd(&temp_dir)
        .args(["task", "progress", "1"])
        .assert()
        .success()
        .stdout(predicate::str::diff("0%\n"));

    get_cmd(&temp_dir).args(["stage", "acquire", "1", "schedule"]).assert().success();
    get_cmd(&temp_dir).args(["stage", "complete", "1", "schedule"]).assert().success();

    get_cmd(&temp_dir)
        .args(["task", "progress", "1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"phase\": \"script\""))
        .stdout(predicate::str::contains("\"status\": \"waiting\""));
}
