//! CLI integration tests for legacy-pg-migrate.
//!
//! These tests cover argument parsing, help output, the offline commands
//! (`check`, `mapping`) and exit codes for configuration errors.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

/// Get a command for the legacy-pg-migrate binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("legacy-pg-migrate").unwrap();
    cmd.env_remove("MIGRATE_CONFIG")
        .env_remove("MIGRATE_WORKERS")
        .env_remove("MIGRATE_ENCRYPTION_KEY");
    cmd
}

const CONFIG: &str = r#"
source: { host: legacy-db, database: legacy, user: sa }
target: { host: localhost, database: app, user: app }
tables:
  - name: orders
    select: SELECT OrderId, EventId, Note FROM dbo.Orders
    source_columns:
      - { name: OrderId, type: int }
      - { name: EventId, type: int }
      - { name: Note, type: nvarchar }
    columns:
      - { name: id, type: bigint, rule: { kind: direct, source: OrderId } }
      - { name: event_id, type: bigint, rule: { kind: foreign_key, source: EventId, reference: events } }
      - { name: note, type: text, rule: { kind: encrypt, source: Note } }
    references:
      - { name: events, query: "SELECT id FROM event" }
    depends_on: [event]
  - name: event
    select: SELECT EventId FROM dbo.Events
    source_columns:
      - { name: EventId, type: int }
    columns:
      - { name: id, type: bigint, rule: { kind: direct, source: EventId } }
"#;

const KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

fn config_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", content).unwrap();
    file
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("run-all"))
        .stdout(predicate::str::contains("mapping"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_run_subcommand_help() {
    cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<TABLE>"))
        .stdout(predicate::str::contains("--transactional"))
        .stdout(predicate::str::contains("--workers"));
}

#[test]
fn test_run_requires_table() {
    cmd()
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<TABLE>"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("legacy-pg-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_global_flags_and_defaults() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--shutdown-timeout"))
        .stdout(predicate::str::contains("[default: 60]"))
        .stdout(predicate::str::contains("--progress"))
        .stdout(predicate::str::contains("--output-json"))
        .stdout(predicate::str::contains("[default: text]"))
        .stdout(predicate::str::contains("[default: info]"))
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

#[test]
fn test_secrets_are_not_listed() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("source-password").not());
}

// =============================================================================
// Offline Commands
// =============================================================================

#[test]
fn test_check_prints_dependency_order() {
    let file = config_file(CONFIG);
    cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "check"])
        .assert()
        .success()
        .stdout(predicate::str::contains("event -> orders"));
}

#[test]
fn test_check_json_output() {
    let file = config_file(CONFIG);
    let output = cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "--output-json", "check"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["valid"], true);
    assert_eq!(json["execution_order"][0], "event");
}

#[test]
fn test_check_requires_encryption_key_for_encrypt_rules() {
    let file = config_file(CONFIG);
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("encryption_key"));
}

#[test]
fn test_dependency_cycle_exits_with_code_1() {
    let cyclic = CONFIG.replace(
        "      - { name: id, type: bigint, rule: { kind: direct, source: EventId } }\n",
        "      - { name: id, type: bigint, rule: { kind: direct, source: EventId } }\n    depends_on: [orders]\n",
    );
    let file = config_file(&cyclic);
    cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_mapping_prints_triples() {
    let file = config_file(CONFIG);
    cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "mapping", "orders"])
        .assert()
        .success()
        .stdout(predicate::str::contains("orders -> orders"))
        .stdout(predicate::str::contains("EventId"))
        .stdout(predicate::str::contains("event_id"));
}

#[test]
fn test_mapping_unknown_table_exits_with_code_1() {
    let file = config_file(CONFIG);
    cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "mapping", "missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Unknown table 'missing'"));
}

#[test]
fn test_zero_workers_override_is_rejected() {
    let file = config_file(CONFIG);
    cmd()
        .env("MIGRATE_ENCRYPTION_KEY", KEY)
        .args(["--config", file.path().to_str().unwrap(), "--workers", "0", "check"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("migration.workers"));
}

// =============================================================================
// Exit Code Tests - Config Errors
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_7() {
    // Missing file is an IO error (code 7), not config error (code 1)
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "health-check"])
        .assert()
        .code(7);
}

#[test]
fn test_invalid_yaml_exits_with_code_1() {
    let file = config_file("invalid: yaml: content: [\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "health-check"])
        .assert()
        .code(1);
}

#[test]
fn test_empty_config_exits_with_code_1() {
    let file = tempfile::NamedTempFile::new().unwrap();
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "check"])
        .assert()
        .code(1);
}

#[test]
fn test_missing_required_fields_exits_with_code_1() {
    let file = config_file("source:\n  type: mssql\n");
    cmd()
        .args(["--config", file.path().to_str().unwrap(), "run-all"])
        .assert()
        .code(1);
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
