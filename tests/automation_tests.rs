use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, std::sync::MutexGuard<'static, ()>) {
    setup_test_env_with("")
}

/// Like `setup_test_env`, with extra rc lines
fn setup_test_env_with(extra: &str) -> (TempDir, std::sync::MutexGuard<'static, ()>) {
    let guard = test_env::lock_test_env();
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let config_dir = temp_dir.path().join(".stagehand");
    fs::create_dir_all(&config_dir).unwrap();
    fs::write(
        config_dir.join("rc"),
        format!("data.location={}\n{}", db_path.display(), extra),
    )
    .unwrap();

    std::env::set_var("HOME", temp_dir.path().to_str().unwrap());
    (temp_dir, guard)
}

fn get_cmd(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("stagehand").unwrap();
    cmd.env("HOME", temp_dir.path());
    cmd
}

fn daily_channel(temp_dir: &TempDir) {
    get_cmd(temp_dir)
        .args(["channel", "set", "alice", "cooking", "--every", "1", "--unit", "days", "--at", "11:00", "--categories", "pasta,soup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Channel alice/cooking: every 1 days at 11:00"));
}

#[test]
fn test_channel_set_and_list() {
    let (temp_dir, _guard) = setup_test_env();
    daily_channel(&temp_dir);

    get_cmd(&temp_dir)
        .args(["channel", "set", "bob", "travel", "--slot", "1=09:00,18:00", "--slot", "5=12:30", "--categories", "city", "--name", "Bob Travels"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mon 09:00,18:00; Fri 12:30"));

    get_cmd(&temp_dir)
        .args(["channel", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cooking"))
        .stdout(predicate::str::contains("travel"))
        .stdout(predicate::str::contains("pasta,soup"));

    get_cmd(&temp_dir)
        .args(["channel", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"mode\": \"weekday_time\""))
        .stdout(predicate::str::contains("\"name\": \"Bob Travels\""));
}

#[test]
fn test_channel_set_validation() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["channel", "set", "alice", "cooking", "--categories", "pasta"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--every"));

    get_cmd(&temp_dir)
        .args(["channel", "set", "alice", "cooking", "--every", "2", "--unit", "weeks", "--categories", "pasta"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid unit"));

    get_cmd(&temp_dir)
        .args(["channel", "set", "alice", "cooking", "--slot", "8=09:00", "--categories", "pasta"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Invalid weekday"));

    get_cmd(&temp_dir)
        .args(["channel", "set", "alice", "cooking", "--every", "1", "--categories", " , "])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("categor"));
}

#[test]
fn test_channel_next() {
    let (temp_dir, _guard) = setup_test_env();
    // 2024-01-01 is a Monday
    get_cmd(&temp_dir)
        .args(["channel", "set", "bob", "travel", "--slot", "1=09:00,18:00", "--categories", "city"])
        .assert()
        .success();

    get_cmd(&temp_dir)
        .args(["channel", "next", "bob", "travel", "--from", "2024-01-01T08:00"])
        .assert()
        .success()
        .stdout(predicate::str::diff("2024-01-01 09:00\n"));
    get_cmd(&temp_dir)
        .args(["channel", "next", "bob", "travel", "--from", "2024-01-01T09:00"])
        .assert()
        .success()
        .stdout(predicate::str::diff("2024-01-01 18:00\n"));
    get_cmd(&temp_dir)
        .args(["channel", "next", "bob", "travel", "--from", "2024-01-01T19:00", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"next_due\": \"2024-01-08 09:00\""));

    get_cmd(&temp_dir)
        .args(["channel", "set", "alice", "quick", "--every", "2", "--unit", "minutes", "--categories", "x"])
        .assert()
        .success();
    // Minute intervals are raised to five minutes
    get_cmd(&temp_dir)
        .args(["channel", "next", "alice", "quick", "--from", "2024-01-01T10:00"])
        .assert()
        .success()
        .stdout(predicate::str::diff("2024-01-01 10:05\n"));

    get_cmd(&temp_dir)
        .args(["channel", "next", "nobody", "here"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_channel_slots_and_disable() {
    let (temp_dir, _guard) = setup_test_env();
    daily_channel(&temp_dir);

    // Fixed intervals have no slots
    get_cmd(&temp_dir)
        .args(["channel", "slots", "alice", "cooking", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::diff("[]\n"));

    get_cmd(&temp_dir)
        .args(["channel", "disable", "alice", "cooking"])
        .assert()
        .success();
    get_cmd(&temp_dir)
        .args(["channel", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No channels configured."));
    get_cmd(&temp_dir)
        .args(["channel", "list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cooking"));

    get_cmd(&temp_dir)
        .args(["channel", "enable", "nobody", "here"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_tick_schedules_from_title_pool() {
    let (temp_dir, _guard) = setup_test_env();
    daily_channel(&temp_dir);

    // Empty pool: the channel is skipped, not failed
    get_cmd(&temp_dir)
        .args(["tick"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled 0, failed 0, skipped 1"));

    for category in ["pasta", "soup"] {
        get_cmd(&temp_dir)
            .args(["title", "add", category, "Weeknight", "special"])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("Added title to {}", category)));
    }

    get_cmd(&temp_dir)
        .args(["tick", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"success\": 1"));

    get_cmd(&temp_dir)
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Weeknight special"))
        .stdout(predicate::str::contains("11:00"));

    // Same slot again
    get_cmd(&temp_dir)
        .args(["tick"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled 0, failed 0, skipped 1"));

    get_cmd(&temp_dir)
        .args(["title", "stats", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"used\": 1"));
}

#[test]
fn test_tick_disabled() {
    let (temp_dir, _guard) = setup_test_env_with("automation.enabled=false\n");
    daily_channel(&temp_dir);
    get_cmd(&temp_dir).args(["title", "add", "pasta", "Carbonara"]).assert().success();

    get_cmd(&temp_dir)
        .args(["tick"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Scheduled 0, failed 0, skipped 0"));
}

#[test]
fn test_run_stops_after_max_ticks() {
    let (temp_dir, _guard) = setup_test_env();
    daily_channel(&temp_dir);
    get_cmd(&temp_dir).args(["title", "add", "pasta", "Carbonara"]).assert().success();
    get_cmd(&temp_dir).args(["title", "add", "soup", "Minestrone"]).assert().success();

    get_cmd(&temp_dir)
        .args(["run", "--max-ticks", "1"])
        .assert()
        .success();

    get_cmd(&temp_dir)
        .args(["task", "list", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"owner\": \"alice\""));
}

#[test]
fn test_error_ledger_lifecycle() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["errors", "report", "--kind", "upload_failed", "--message", "quota exceeded", "--severity", "critical"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Recorded error 1"));
    get_cmd(&temp_dir)
        .args(["errors", "report", "--kind", "upload_failed", "--message", "quota exceeded", "--severity", "critical"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Already recorded"));

    get_cmd(&temp_dir)
        .args(["errors", "claim", "--worker", "w1", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"claimed\""))
        .stdout(predicate::str::contains("\"claimed_by\": \"w1\""));

    get_cmd(&temp_dir)
        .args(["errors", "start", "1", "--worker", "w2"])
        .assert()
        .failure()
        .code(1);
    get_cmd(&temp_dir)
        .args(["errors", "start", "1", "--worker", "w1"])
        .assert()
        .success();

    get_cmd(&temp_dir)
        .args(["errors", "retry", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("back to pending (attempt 1)"));

    get_cmd(&temp_dir)
        .args(["errors", "resolve", "1", "raised", "quota"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Error 1 resolved"));
    get_cmd(&temp_dir)
        .args(["errors", "ignore", "1"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not open"));

    get_cmd(&temp_dir)
        .args(["errors", "claim", "--worker", "w1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Nothing to claim."));

    get_cmd(&temp_dir)
        .args(["errors", "stats", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"total\": 1"))
        .stdout(predicate::str::contains("\"resolved\": 1"));
}

#[test]
fn test_error_retry_gives_up() {
    let (temp_dir, _guard) = setup_test_env_with("errors.max_retries=2\n");
    get_cmd(&temp_dir)
        .args(["errors", "report", "--kind", "k", "--message", "m"])
        .assert()
        .success();

    get_cmd(&temp_dir).args(["errors", "retry", "1"]).assert().success();
    get_cmd(&temp_dir)
        .args(["errors", "retry", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed after 2 attempts"));
    get_cmd(&temp_dir)
        .args(["errors", "list", "--status", "failed"])
        .assert()
        .success()
        .stdout(predicate::str::contains("failed"));
}

#[test]
fn test_version_and_help() {
    let (temp_dir, _guard) = setup_test_env();

    get_cmd(&temp_dir)
        .args(["--version"])
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));

    get_cmd(&temp_dir)
        .args(["--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("channel"));

    get_cmd(&temp_dir)
        .args(["frobnicate"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_corrupt_database_is_internal_error() {
    let (temp_dir, _guard) = setup_test_env();
    fs::write(temp_dir.path().join("test.db"), vec![0x42u8; 4096]).unwrap();

    get_cmd(&temp_dir)
        .args(["task", "list"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::starts_with("Internal error:"));
}
