use std::fs;
use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_config(dir: &Path, base_url: &str) -> std::path::PathBuf {
    let config_path = dir.join("margin.toml");
    fs::write(
        &config_path,
        format!(
            r#"
[polling]
watched-files = ["doxA"]

[feishu]
app-id = "cli_test"
app-secret = "secret"
base-url = "{base_url}"
bot-open-id = "ou_bot"

[agent]
provider = "command"
command = ["echo", "thanks for the note"]
"#
        ),
    )
    .unwrap();
    config_path
}

async fn mount_feishu(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "tenant_access_token": "t-1",
            "expire": 7200
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/open-apis/drive/v1/files/doxA/comments"))
        .and(query_param("file_type", "docx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": {
                "has_more": false,
                "items": [
                    {
                        "comment_id": "c1",
                        "user_id": "ou_alice",
                        "is_solved": false,
                        "reply_list": { "replies": [{
                            "reply_id": "r1",
                            "user_id": "ou_alice",
                            "content": { "elements": [
                                { "type": "text_run", "text_run": { "text": "is this right?" } }
                            ] }
                        }] }
                    },
                    {
                        "comment_id": "c2",
                        "user_id": "ou_alice",
                        "is_solved": true,
                        "reply_list": { "replies": [] }
                    }
                ]
            }
        })))
        .mount(server)
        .await;
}

fn margin_poll(margin_dir: &Path, config_path: &Path) -> std::process::Output {
    let mut cmd = cargo_bin_cmd!("margin");
    cmd.env("MARGIN_DIR", margin_dir)
        .env_remove("FEISHU_BASE_URL")
        .env_remove("MARGIN_ENABLED")
        .env_remove("MARGIN_WATCHED_FILES")
        .args(["--config", config_path.to_str().unwrap(), "poll"]);
    cmd.output().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_replies_to_new_comments_once() {
    let server = MockServer::start().await;
    mount_feishu(&server).await;

    Mock::given(method("POST"))
        .and(path("/open-apis/drive/v1/files/doxA/comments/c1/replies"))
        .and(body_partial_json(json!({
            "content": { "elements": [
                { "type": "text_run", "text_run": { "text": "thanks for the note" } }
            ] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "data": { "reply_id": "r2" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let margin_dir = dir.path().join("margin");
    let config_path = write_config(dir.path(), &server.uri());

    let first = {
        let margin_dir = margin_dir.clone();
        let config_path = config_path.clone();
        tokio::task::spawn_blocking(move || margin_poll(&margin_dir, &config_path))
            .await
            .unwrap()
    };
    first
        .assert()
        .success()
        .stdout(predicate::str::contains("\"replied\": 1"))
        .stdout(predicate::str::contains("\"skipped_solved\": 1"));

    let state: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(margin_dir.join("state.json")).unwrap()).unwrap();
    assert_eq!(state["processedComments"]["doxA"], json!(["c1", "c2"]));

    let second = {
        let margin_dir = margin_dir.clone();
        let config_path = config_path.clone();
        tokio::task::spawn_blocking(move || margin_poll(&margin_dir, &config_path))
            .await
            .unwrap()
    };
    second
        .assert()
        .success()
        .stdout(predicate::str::contains("\"replied\": 0"));
}

#[tokio::test(flavor = "multi_thread")]
async fn poll_fails_when_authentication_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/open-apis/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 10003,
            "msg": "invalid param"
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let margin_dir = dir.path().join("margin");
    let config_path = write_config(dir.path(), &server.uri());

    let output = {
        let margin_dir = margin_dir.clone();
        tokio::task::spawn_blocking(move || margin_poll(&margin_dir, &config_path))
            .await
            .unwrap()
    };
    output
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid param"));
    assert!(!margin_dir.join("state.json").exists());
}
