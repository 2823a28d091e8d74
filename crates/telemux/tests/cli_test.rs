//! Integration tests for the `telemux` binary.
//!
//! Argument parsing, config inspection and RPC against a mock server; no
//! live telemetry server needed.
#![allow(clippy::unwrap_used)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DEVICE: &str = "784f394c-42b6-435a-983c-b7beff2784f9";

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a command for the `telemux` binary with env isolation.
///
/// Clears all `TELEMUX_*` env vars and points config directories at
/// `home` so tests never touch the user's real configuration.
fn telemux_cmd(home: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("telemux");
    cmd.env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("TELEMUX_PROFILE")
        .env_remove("TELEMUX_SERVER")
        .env_remove("TELEMUX_TOKEN")
        .env_remove("TELEMUX_OUTPUT")
        .env_remove("TELEMUX_INSECURE")
        .env_remove("TELEMUX_TIMEOUT")
        .env_remove("RUST_LOG");
    cmd
}

fn config_path(home: &Path) -> PathBuf {
    let out = telemux_cmd(home)
        .args(["config", "path"])
        .output()
        .unwrap();
    assert!(out.status.success());
    PathBuf::from(String::from_utf8(out.stdout).unwrap().trim())
}

fn write_config(home: &Path, contents: &str) {
    let path = config_path(home);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let home = tempfile::tempdir().unwrap();
    let output = telemux_cmd(home.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Usage"));
}

#[test]
fn test_help_lists_commands() {
    let home = tempfile::tempdir().unwrap();
    telemux_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("watch")
                .and(predicate::str::contains("history"))
                .and(predicate::str::contains("latest"))
                .and(predicate::str::contains("rpc")),
        );
}

#[test]
fn test_watch_requires_keys() {
    let home = tempfile::tempdir().unwrap();
    telemux_cmd(home.path())
        .args(["watch", DEVICE])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--keys"));
}

#[test]
fn test_invalid_aggregation_rejected() {
    let home = tempfile::tempdir().unwrap();
    telemux_cmd(home.path())
        .args(["history", DEVICE, "--keys", "t", "--agg", "median"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown aggregation"));
}

// ── Configuration ───────────────────────────────────────────────────

#[test]
fn test_missing_server_reports_config_path() {
    let home = tempfile::tempdir().unwrap();
    telemux_cmd(home.path())
        .args(["latest", DEVICE, "--keys", "temperature"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No server configured"));
}

#[test]
fn test_unknown_profile() {
    let home = tempfile::tempdir().unwrap();
    write_config(
        home.path(),
        "[profiles.lab]\nserver = \"http://iot.local:8080\"\ntoken = \"jwt\"\n",
    );
    telemux_cmd(home.path())
        .args(["--profile", "prod", "latest", DEVICE, "--keys", "t"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Profile 'prod' not found").and(predicate::str::contains("lab")));
}

#[test]
fn test_profile_without_credentials() {
    let home = tempfile::tempdir().unwrap();
    write_config(
        home.path(),
        "[profiles.default]\nserver = \"http://iot.local:8080\"\n",
    );
    telemux_cmd(home.path())
        .args(["latest", DEVICE, "--keys", "t"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No credentials"));
}

#[test]
fn test_config_profiles_and_show() {
    let home = tempfile::tempdir().unwrap();
    write_config(
        home.path(),
        r#"
default_profile = "lab"

[profiles.lab]
server = "http://iot.local:8080"
username = "tenant@example.com"
password = "hunter2"

[profiles.prod]
server = "https://iot.example.com"
token_env = "PROD_TOKEN"
"#,
    );

    telemux_cmd(home.path())
        .args(["config", "profiles"])
        .assert()
        .success()
        .stdout("* lab\n  prod\n");

    telemux_cmd(home.path())
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains("tenant@example.com")
                .and(predicate::str::contains("hunter2").not()),
        );
}

// ── RPC against a mock server ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_two_way_rpc_prints_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/api/plugins/rpc/twoway/{DEVICE}")))
        .and(header("X-Authorization", "Bearer jwt"))
        .and(body_json(serde_json::json!({
            "method": "getGpio",
            "params": { "pin": 7 },
            "timeout": 5000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "value": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let uri = server.uri();
    let output = tokio::task::spawn_blocking(move || {
        let home = tempfile::tempdir().unwrap();
        telemux_cmd(home.path())
            .args([
                "--server",
                uri.as_str(),
                "--token",
                "jwt",
                "-o",
                "json-compact",
                "rpc",
                DEVICE,
                "getGpio",
                "--params",
                r#"{"pin":7}"#,
                "--rpc-timeout",
                "5s",
            ])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert!(output.status.success(), "{output:?}");
    assert_eq!(String::from_utf8_lossy(&output.stdout), "{\"value\":1}\n");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offline_device_exit_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/api/plugins/rpc/oneway/{DEVICE}")))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let uri = server.uri();
    let output = tokio::task::spawn_blocking(move || {
        let home = tempfile::tempdir().unwrap();
        telemux_cmd(home.path())
            .args(["--server", uri.as_str(), "--token", "jwt", "rpc", DEVICE, "reboot", "--one-way"])
            .output()
            .unwrap()
    })
    .await
    .unwrap();

    assert_eq!(output.status.code(), Some(6));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Device is offline."));
}
