use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn test_help_shows_all_commands() {
    cargo_bin_cmd!("alice")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bridge"))
        .stdout(predicate::str::contains("config"))
        .stdout(predicate::str::contains("--root"))
        .stdout(predicate::str::contains("--model"));
}

#[test]
fn test_config_help_shows_subcommands() {
    cargo_bin_cmd!("alice")
        .args(["config", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("path"))
        .stdout(predicate::str::contains("init"));
}

#[test]
fn test_version_flag() {
    cargo_bin_cmd!("alice")
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1"));
}
