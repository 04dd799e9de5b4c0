//! Binary-level tests for the `queue-exchange` command.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("queue-exchange").unwrap();
    cmd.env_remove("QUEUE_EXCHANGE_KEY")
        .env_remove("QUEUE_EXCHANGE_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_lists_commands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("token"))
        .stdout(predicate::str::contains("inspect"))
        .stdout(predicate::str::contains("simulate"));
}

#[test]
fn test_token_reads_key_from_environment() {
    cli()
        .args([
            "token",
            "--entity",
            "orders",
            "--namespace",
            "contoso",
            "--issued-at",
            "1700000000",
        ])
        .env("QUEUE_EXCHANGE_KEY", "my-key")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "SharedAccessSignature sr=contoso.servicebus.windows.net%2Forders&sig=",
        ))
        .stdout(predicate::str::contains("&se=1700604800&skn=RootManageSharedAccessKey"));
}

#[test]
fn test_token_without_key_exits_with_invalid_argument() {
    cli()
        .args(["token", "--entity", "orders", "--namespace", "contoso"])
        .assert()
        .code(4)
        .stderr(predicate::str::contains("QUEUE_EXCHANGE_KEY"));
}

#[test]
fn test_namespace_from_environment_configuration() {
    cli()
        .args(["connection-string", "--entity", "orders", "--key", "my-key"])
        .env("QUEUE_EXCHANGE__NAMESPACE", "fabrikam")
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "Endpoint=fabrikam.servicebus.windows.net;SharedAccessSignature=",
        ));
}

#[test]
fn test_inspect_issued_token() {
    let issued = cli()
        .args([
            "token", "-e", "orders", "-n", "contoso", "--key", "my-key",
        ])
        .output()
        .unwrap();
    assert!(issued.status.success());
    let token = String::from_utf8(issued.stdout).unwrap();

    cli()
        .args(["inspect", token.trim(), "--key", "my-key"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "resource:   contoso.servicebus.windows.net/orders",
        ))
        .stdout(predicate::str::contains("signature:  valid"));

    cli()
        .args(["inspect", token.trim(), "--key", "wrong-key"])
        .assert()
        .code(3);
}

#[test]
fn test_simulate_with_failure_rolls_back() {
    cli()
        .args(["simulate", "--messages", "a,b,c", "--fail-at", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("rolled back"))
        .stdout(predicate::str::contains("queued:     0"));
}

#[test]
fn test_simulate_json_output() {
    let output = cli()
        .args(["simulate", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["sent"], 3);
    assert_eq!(report["received"], serde_json::json!(["a", "b", "c"]));
    assert_eq!(report["remaining"], 0);
}

#[test]
fn test_missing_config_file_exits_with_configuration_error() {
    cli()
        .args(["--config", "/nonexistent/exchange.toml", "config"])
        .assert()
        .code(1);
}
