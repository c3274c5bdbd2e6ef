//! CLI integration tests for the Tether command-line interface.
//!
//! Every test points config, storage and log directories at a temp dir so
//! nothing touches the real user profile.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get a command for the tether binary, isolated under `home`.
fn tether(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("tether").unwrap();
    cmd.current_dir(home.path())
        .env("TETHER_CONFIG_DIR", home.path().join("config"))
        .env("TETHER_STORAGE_DIR", home.path().join("store"))
        .env("XDG_DATA_HOME", home.path().join("data"))
        .env_remove("TETHER_API_BASE")
        .env_remove("TETHER_PASSWORD");
    cmd
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_displays() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Tether"))
        .stdout(predicate::str::contains("session-managed HTTP APIs"));
}

#[test]
fn test_version_displays() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("tether"));
}

#[test]
fn test_help_lists_subcommands() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("auth"))
        .stdout(predicate::str::contains("call"))
        .stdout(predicate::str::contains("watch"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_auth_help_lists_actions() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["auth", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("login"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("refresh"))
        .stdout(predicate::str::contains("logout"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Invalid Input Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_unknown_subcommand_rejected() {
    let home = TempDir::new().unwrap();
    tether(&home).arg("frobnicate").assert().failure();
}

#[test]
fn test_call_requires_endpoint() {
    let home = TempDir::new().unwrap();
    tether(&home).args(["call", "GET"]).assert().failure();
}

#[test]
fn test_call_rejects_unknown_method() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["call", "TRACE", "/widgets"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown method"));
}

#[test]
fn test_call_data_conflicts_with_form() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["call", "POST", "/upload", "--data", "{}", "--form", "a=b"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Offline Session Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_status_when_logged_out() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["--api-base", "http://127.0.0.1:9", "auth", "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Not logged in"));
}

#[test]
fn test_status_json_when_logged_out() {
    let home = TempDir::new().unwrap();
    let output = tether(&home)
        .args(["--json", "--api-base", "http://127.0.0.1:9", "auth", "status"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let status: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(status["authenticated"], false);
    assert_eq!(status["api_base"], "http://127.0.0.1:9");
}

#[test]
fn test_refresh_requires_login() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["--api-base", "http://127.0.0.1:9", "auth", "refresh"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not logged in"));
}

#[test]
fn test_call_with_unreachable_api_fails() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["--api-base", "http://127.0.0.1:9", "call", "GET", "/widgets"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_config_path_uses_config_dir() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}

#[test]
fn test_config_init_then_exists() {
    let home = TempDir::new().unwrap();
    tether(&home)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created"));
    assert!(home.path().join("config").join("config.toml").exists());

    tether(&home)
        .args(["config", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn test_local_config_overrides_base() {
    let home = TempDir::new().unwrap();
    std::fs::write(
        home.path().join("tether.toml"),
        "[api]\nbase_url = \"https://project.example.com/api\"\n",
    )
    .unwrap();

    tether(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("https://project.example.com/api"));

    tether(&home)
        .args(["config", "which"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1 config file(s) loaded"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Live Session Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn test_login_call_logout_against_mock_api() {
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "access_token": "cli-token",
                "user": {"id": 7, "username": "ada"},
                "expires_in": 3600
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/widgets"))
        .and(header("authorization", "Bearer cli-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/logout"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let base = server.uri();
    tokio::task::spawn_blocking(move || {
        tether(&home)
            .args(["--api-base", &base, "auth", "login"])
            .args(["--username", "ada", "--password", "secret"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Logged in as ada"));

        tether(&home)
            .args(["--api-base", &base, "call", "GET", "/widgets"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"items\""));

        tether(&home)
            .args(["--api-base", &base, "auth", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Logged in: ada"));

        tether(&home)
            .args(["--api-base", &base, "auth", "logout"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Logged out"));

        tether(&home)
            .args(["--api-base", &base, "auth", "status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Not logged in"));
    })
    .await
    .unwrap();
}
