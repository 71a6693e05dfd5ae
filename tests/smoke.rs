//! Smoke tests -- verify the binary runs and the command surface is wired.

use assert_cmd::Command;

fn speedwatch() -> Command {
    let mut cmd = Command::cargo_bin("speedwatch").unwrap();
    cmd.env_remove("SPEEDWATCH_CONFIG").env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    speedwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("adaptive server selection"));
}

#[test]
fn test_cli_version() {
    speedwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("speedwatch"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        vec!["monitor", "--help"],
        vec!["find-best", "--help"],
        vec!["list-servers", "--help"],
        vec!["preference", "show", "--help"],
        vec!["preference", "forget", "--help"],
    ] {
        speedwatch().args(&args).assert().success();
    }
}

#[test]
fn test_monitor_help_lists_selection_flags() {
    speedwatch()
        .args(["monitor", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--server-id"))
        .stdout(predicates::str::contains("--no-server-optimization"))
        .stdout(predicates::str::contains("--single"))
        .stdout(predicates::str::contains("--find-best-first"));
}

#[test]
fn test_find_best_first_conflicts_with_explicit_server() {
    speedwatch()
        .args(["monitor", "--find-best-first", "--server-id", "48238"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("cannot be used with"));
}

#[test]
fn test_invalid_server_id_is_rejected_at_startup() {
    speedwatch()
        .args(["monitor", "--single", "--server-id", "not-a-number"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("invalid endpoint id"));
}

#[test]
fn test_preference_show_without_cache() {
    let dir = tempfile::TempDir::new().unwrap();
    speedwatch()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["preference", "show"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No cached preference"));
}

#[test]
fn test_preference_forget_keeps_scores() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("best_server.json");
    std::fs::write(
        &path,
        r#"{"bestEndpointId":48238,"candidateScores":{"48238":99.0,"1270":79.0},"lastUpdated":"2024-05-01T12:00:00Z"}"#,
    )
    .unwrap();

    speedwatch()
        .arg("--data-dir")
        .arg(dir.path())
        .args(["preference", "forget"])
        .assert()
        .success()
        .stdout(predicates::str::contains("cleared"));

    let value: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert!(value["bestEndpointId"].is_null());
    assert_eq!(value["candidateScores"]["1270"], 79.0);
}

#[test]
fn test_zero_interval_is_a_configuration_error() {
    let dir = tempfile::TempDir::new().unwrap();
    let cfg = dir.path().join("speedwatch.toml");
    std::fs::write(&cfg, "[schedule]\ninterval_minutes = 0\n").unwrap();
    speedwatch()
        .arg("--config")
        .arg(&cfg)
        .args(["preference", "show"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("interval_minutes"));
}
