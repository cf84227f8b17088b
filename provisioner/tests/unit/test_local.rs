//! Local docker target against a scripted CLI

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::json;

use fleet_provisioner::errors::ProvisionError;
use fleet_provisioner::settings::LocalSettings;
use fleet_provisioner::targets::local::LocalTarget;
use fleet_provisioner::targets::naming::ResourceNames;
use fleet_provisioner::targets::{
    ConfigurePayload, DeploymentTarget, InstallOptions, LogQuery, TargetState,
};

use crate::support::ScriptedRunner;

fn data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("fleet-local-test-{}", uuid::Uuid::new_v4()))
}

fn target(runner: Arc<ScriptedRunner>, data_dir: PathBuf, token: Option<&str>) -> LocalTarget {
    let settings = LocalSettings {
        image: "ghcr.io/fleet/gateway:latest".to_string(),
        data_dir,
        registry_token: token.map(SecretString::from),
        ..Default::default()
    };
    LocalTarget::new(
        ResourceNames::for_profile("support bot").unwrap(),
        18789,
        settings,
        runner,
    )
}

#[tokio::test]
async fn test_install_logs_in_pulls_and_creates() {
    let runner = ScriptedRunner::new();
    let dir = data_dir();
    let target = target(runner.clone(), dir.clone(), Some("registry-token"));

    let result = target
        .install(&InstallOptions {
            profile_name: "support bot".to_string(),
            port: 18789,
            version_tag: Some("3.1.0".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(result.instance_id, "fleet-gw-support-bot");

    let lines: Vec<String> = runner.calls().iter().map(|c| c.display()).collect();
    assert!(lines[0].starts_with("docker login ghcr.io"));
    assert_eq!(runner.calls()[0].stdin.as_deref(), Some("registry-token"));
    assert_eq!(lines[1], "docker pull ghcr.io/fleet/gateway:3.1.0");
    assert!(lines[2].starts_with("docker create --name fleet-gw-support-bot"));
    assert!(lines[2].contains("127.0.0.1:18789:18789"));
    assert!(dir.join("support-bot").join("gateway.env").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_install_tolerates_existing_container_and_failed_login() {
    let runner = ScriptedRunner::new();
    runner
        .fail("docker login", "unauthorized: authentication required")
        .fail(
            "docker create",
            "Conflict. The container name \"/fleet-gw-support-bot\" is already in use",
        );
    let dir = data_dir();

    let options = InstallOptions {
        profile_name: "support bot".to_string(),
        port: 18789,
        version_tag: None,
    };
    target(runner.clone(), dir.clone(), Some("stale-token"))
        .install(&options)
        .await
        .unwrap();
    assert_eq!(runner.matching("docker pull").len(), 1);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_configure_writes_config_and_env_files() {
    let runner = ScriptedRunner::new();
    let dir = data_dir();
    let payload = ConfigurePayload {
        profile_name: "support bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::from([("TEAM".to_string(), "support".to_string())]),
        config: json!({ "channels": ["chat"] }),
    };

    let result = target(runner.clone(), dir.clone(), None)
        .configure(&payload)
        .await
        .unwrap();
    assert!(result.requires_restart);
    assert!(runner.calls().is_empty());

    let instance_dir = dir.join("support-bot");
    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(instance_dir.join("gateway.json")).unwrap())
            .unwrap();
    assert_eq!(config["channels"][0], "chat");
    assert_eq!(
        std::fs::read_to_string(instance_dir.join("gateway.env")).unwrap(),
        "TEAM=support\n"
    );

    std::fs::remove_dir_all(&dir).unwrap();
}

#[tokio::test]
async fn test_status_mapping() {
    let cases = [
        ("running", TargetState::Running),
        ("exited", TargetState::Stopped),
        ("restarting", TargetState::Error),
    ];
    for (state, expected) in cases {
        let runner = ScriptedRunner::new();
        runner.ok_text("inspect", state);
        let status = target(runner, data_dir(), None).get_status().await.unwrap();
        assert_eq!(status.state, expected, "{state}");
    }

    let runner = ScriptedRunner::new();
    runner.fail("inspect", "Error: No such object: fleet-gw-support-bot");
    let status = target(runner, data_dir(), None).get_status().await.unwrap();
    assert_eq!(status.state, TargetState::NotInstalled);
}

fn call_lines(runner: &ScriptedRunner) -> Vec<String> {
    runner.calls().iter().map(|c| c.display()).collect()
}

#[tokio::test]
async fn test_restart_replaces_container_before_removing_old_one() {
    let runner = ScriptedRunner::new();
    runner.ok_text("inspect", "ghcr.io/fleet/gateway:3.0.0");

    target(runner.clone(), data_dir(), None).restart().await.unwrap();

    let lines = call_lines(&runner);
    assert_eq!(lines[1], "docker rm -f fleet-gw-support-bot-previous");
    assert_eq!(
        lines[2],
        "docker rename fleet-gw-support-bot fleet-gw-support-bot-previous"
    );
    assert!(lines[3].starts_with("docker create --name fleet-gw-support-bot "));
    assert!(lines[3].ends_with(" ghcr.io/fleet/gateway:3.0.0"));
    assert_eq!(lines[4], "docker stop fleet-gw-support-bot-previous");
    assert_eq!(lines[5], "docker start fleet-gw-support-bot");
    assert_eq!(lines[6], "docker rm -f fleet-gw-support-bot-previous");
    assert_eq!(lines.len(), 7);
}

#[tokio::test]
async fn test_restart_keeps_old_container_when_create_fails() {
    let runner = ScriptedRunner::new();
    runner
        .ok_text("inspect", "ghcr.io/fleet/gateway:3.0.0")
        .fail("docker create", "docker: invalid reference format.");

    let err = target(runner.clone(), data_dir(), None).restart().await.unwrap_err();
    assert!(err.to_string().contains("invalid reference format"));

    let lines = call_lines(&runner);
    assert_eq!(
        lines[4],
        "docker rename fleet-gw-support-bot-previous fleet-gw-support-bot"
    );
    assert_eq!(lines[5], "docker start fleet-gw-support-bot");
    assert_eq!(lines.len(), 6);
}

#[tokio::test]
async fn test_restart_restores_old_container_when_start_fails() {
    let runner = ScriptedRunner::new();
    runner
        .ok_text("inspect", "ghcr.io/fleet/gateway:3.0.0")
        .fail_once("docker start", "Error response from daemon: port is already allocated");

    assert!(target(runner.clone(), data_dir(), None).restart().await.is_err());

    let lines = call_lines(&runner);
    assert_eq!(lines[5], "docker start fleet-gw-support-bot");
    assert_eq!(lines[6], "docker rm -f fleet-gw-support-bot");
    assert_eq!(
        lines[7],
        "docker rename fleet-gw-support-bot-previous fleet-gw-support-bot"
    );
    assert_eq!(lines[8], "docker start fleet-gw-support-bot");
    assert_eq!(lines.len(), 9);
}

#[tokio::test]
async fn test_configure_rejects_multiline_env_values() {
    let runner = ScriptedRunner::new();
    let dir = data_dir();
    let payload = ConfigurePayload {
        profile_name: "support bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::from([(
            "TEAM".to_string(),
            "support\nADMIN_MODE=true".to_string(),
        )]),
        config: json!({}),
    };

    let err = target(runner, dir.clone(), None)
        .configure(&payload)
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::ValidationError(_)));
    assert!(!dir.join("support-bot").join("gateway.env").exists());
}

#[tokio::test]
async fn test_logs_interleave_streams_and_respect_line_limit() {
    let runner = ScriptedRunner::new();
    runner.ok_streams(
        "docker logs",
        "2026-03-01T10:00:00Z listening on 18789\n2026-03-01T10:00:03Z request served\n",
        "2026-03-01T10:00:01Z warning: slow start\n2026-03-01T10:00:02Z retrying upstream\n",
    );

    let lines = target(runner.clone(), data_dir(), None)
        .get_logs(&LogQuery {
            lines: Some(3),
            ..Default::default()
        })
        .await;
    assert_eq!(
        lines,
        vec!["warning: slow start", "retrying upstream", "request served"]
    );
    assert!(call_lines(&runner)[0].starts_with("docker logs --timestamps --tail 3"));
}

#[tokio::test]
async fn test_destroy_removes_container_and_config_dir() {
    let runner = ScriptedRunner::new();
    let dir = data_dir();
    let instance_dir = dir.join("support-bot");
    std::fs::create_dir_all(&instance_dir).unwrap();

    let report = target(runner.clone(), dir.clone(), None).destroy().await;
    assert!(report.is_clean());
    assert_eq!(report.removed, vec!["container", "config-dir"]);
    assert!(!instance_dir.exists());

    std::fs::remove_dir_all(&dir).unwrap();
}
