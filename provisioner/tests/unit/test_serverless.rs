//! Serverless-container target against a scripted CLI

use std::collections::BTreeMap;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::json;

use fleet_provisioner::errors::ProvisionError;
use fleet_provisioner::settings::ServerlessSettings;
use fleet_provisioner::targets::naming::ResourceNames;
use fleet_provisioner::targets::serverless::ServerlessTarget;
use fleet_provisioner::targets::{
    ConfigurePayload, DeploymentTarget, InstallOptions, LogQuery, TargetState,
};

use crate::support::ScriptedRunner;

fn settings() -> ServerlessSettings {
    ServerlessSettings {
        region: "eu-west-1".to_string(),
        access_key_id: "AKIAFLEET".to_string(),
        secret_access_key: Some(SecretString::from("fleet-secret")),
        image: "ghcr.io/fleet/gateway:latest".to_string(),
        subnets: vec!["subnet-a".to_string()],
        ..Default::default()
    }
}

fn target(runner: Arc<ScriptedRunner>) -> ServerlessTarget {
    ServerlessTarget::new(
        ResourceNames::for_profile("support bot").unwrap(),
        18789,
        settings(),
        runner,
    )
}

fn registered(revision: u32) -> serde_json::Value {
    json!({
        "taskDefinition": {
            "taskDefinitionArn": format!("arn:aws:ecs:eu-west-1:1:task-definition/gw-support-bot:{revision}"),
            "revision": revision,
            "containerDefinitions": []
        }
    })
}

fn install_options() -> InstallOptions {
    InstallOptions {
        profile_name: "support bot".to_string(),
        port: 18789,
        version_tag: Some("1.4.0".to_string()),
    }
}

#[tokio::test]
async fn test_fresh_install_creates_shared_and_instance_resources() {
    let runner = ScriptedRunner::new();
    runner
        .fail(
            "describe-task-definition",
            "An error occurred (ClientException): Unable to describe task definition.",
        )
        .ok("register-task-definition", registered(1));

    let result = target(runner.clone()).install(&install_options()).await.unwrap();

    assert!(result.success);
    assert_eq!(result.instance_id, "gw-support-bot");
    assert_eq!(runner.matching("ecs create-cluster --cluster-name gateway-fleet").len(), 1);
    assert_eq!(runner.matching("logs create-log-group --log-group-name /fleet/gw-support-bot").len(), 1);
    assert_eq!(runner.matching("ecs create-service").len(), 1);
    assert!(runner.matching("ecs update-service").is_empty());

    let register = &runner.matching("register-task-definition")[0];
    let document: serde_json::Value =
        serde_json::from_str(register.args.last().unwrap()).unwrap();
    assert_eq!(document["family"], "gw-support-bot");
    assert_eq!(
        document["containerDefinitions"][0]["image"],
        "ghcr.io/fleet/gateway:1.4.0"
    );
    assert_eq!(
        document["containerDefinitions"][0]["portMappings"][0]["containerPort"],
        18789
    );
}

#[tokio::test]
async fn test_repeated_install_reuses_existing_resources() {
    let runner = ScriptedRunner::new();
    runner
        .ok(
            "describe-clusters",
            json!({ "clusters": [{ "clusterName": "gateway-fleet", "status": "ACTIVE" }] }),
        )
        .fail(
            "create-log-group",
            "An error occurred (ResourceAlreadyExistsException) when calling the CreateLogGroup operation",
        )
        .ok(
            "describe-task-definition",
            json!({
                "taskDefinition": {
                    "taskDefinitionArn": "arn:aws:ecs:eu-west-1:1:task-definition/gw-support-bot:4",
                    "revision": 4,
                    "containerDefinitions": [{
                        "name": "gateway",
                        "environment": [{ "name": "TEAM", "value": "support" }],
                        "secrets": [{ "name": "GATEWAY_CONFIG", "valueFrom": "arn:secret:cfg" }]
                    }]
                }
            }),
        )
        .ok("register-task-definition", registered(5))
        .fail(
            "create-service",
            "An error occurred (InvalidParameterException): Creation of service was not idempotent.",
        );

    target(runner.clone()).install(&install_options()).await.unwrap();

    assert!(runner.matching("create-cluster").is_empty());
    let updates = runner.matching("ecs update-service");
    assert_eq!(updates.len(), 1);
    assert!(updates[0].display().contains("gw-support-bot:5"));

    // Configuration written by an earlier configure survives the new revision
    let register = &runner.matching("register-task-definition")[0];
    let document: serde_json::Value =
        serde_json::from_str(register.args.last().unwrap()).unwrap();
    let container = &document["containerDefinitions"][0];
    assert_eq!(container["environment"][0]["name"], "TEAM");
    assert_eq!(container["secrets"][0]["valueFrom"], "arn:secret:cfg");
}

#[tokio::test]
async fn test_every_call_carries_explicit_credentials() {
    let runner = ScriptedRunner::new();
    target(runner.clone()).stop().await.unwrap();

    let call = &runner.calls()[0];
    assert_eq!(call.program, "aws");
    assert!(call.display().contains("--region eu-west-1"));
    assert!(call.env_remove.contains(&"AWS_PROFILE".to_string()));
    assert!(call
        .env
        .contains(&("AWS_ACCESS_KEY_ID".to_string(), "AKIAFLEET".to_string())));
    assert!(call
        .env
        .contains(&("AWS_SECRET_ACCESS_KEY".to_string(), "fleet-secret".to_string())));
    // Secrets never reach the argument list
    assert!(!call.display().contains("fleet-secret"));
}

#[tokio::test]
async fn test_configure_writes_secret_through_stdin() {
    let runner = ScriptedRunner::new();
    runner
        .fail(
            "create-secret",
            "An error occurred (ResourceExistsException) when calling the CreateSecret operation",
        )
        .ok("put-secret-value", json!({ "ARN": "arn:secret:cfg-v2" }))
        .ok(
            "describe-services",
            json!({ "services": [{
                "serviceName": "gw-support-bot",
                "status": "ACTIVE",
                "taskDefinition": "arn:aws:ecs:eu-west-1:1:task-definition/gw-support-bot:3"
            }] }),
        )
        .ok(
            "describe-task-definition",
            json!({ "taskDefinition": { "containerDefinitions": [
                { "name": "gateway", "image": "ghcr.io/fleet/gateway:1.3.0" }
            ] } }),
        )
        .ok("register-task-definition", registered(4));

    let payload = ConfigurePayload {
        profile_name: "support bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::from([("TEAM".to_string(), "support".to_string())]),
        config: json!({ "token": "bot-token-123" }),
    };
    let result = target(runner.clone()).configure(&payload).await.unwrap();
    assert!(result.requires_restart);

    let put = &runner.matching("put-secret-value")[0];
    assert!(put.stdin.as_deref().unwrap().contains("bot-token-123"));
    assert!(!put.display().contains("bot-token-123"));

    let register = &runner.matching("register-task-definition")[0];
    let document: serde_json::Value =
        serde_json::from_str(register.args.last().unwrap()).unwrap();
    let container = &document["containerDefinitions"][0];
    assert_eq!(container["image"], "ghcr.io/fleet/gateway:1.3.0");
    assert_eq!(container["secrets"][0]["name"], "GATEWAY_CONFIG");
    assert_eq!(container["secrets"][0]["valueFrom"], "arn:secret:cfg-v2");
    assert!(container["environment"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["name"] == "TEAM" && e["value"] == "support"));

    // Configure never restarts the workload by itself
    assert!(runner.matching("--desired-count").is_empty());
    assert!(runner.matching("--force-new-deployment").is_empty());
}

#[tokio::test]
async fn test_configure_rejects_foreign_profile() {
    let runner = ScriptedRunner::new();
    let payload = ConfigurePayload {
        profile_name: "billing bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::new(),
        config: json!({}),
    };
    let err = target(runner.clone()).configure(&payload).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ValidationError(_)));
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_status_maps_service_counters() {
    let cases = [
        (json!({ "services": [] }), TargetState::NotInstalled),
        (
            json!({ "services": [{ "serviceName": "gw-support-bot", "status": "INACTIVE" }] }),
            TargetState::NotInstalled,
        ),
        (
            json!({ "services": [{ "serviceName": "gw-support-bot", "status": "ACTIVE",
                "desiredCount": 1, "runningCount": 1 }] }),
            TargetState::Running,
        ),
        (
            json!({ "services": [{ "serviceName": "gw-support-bot", "status": "ACTIVE",
                "desiredCount": 0, "runningCount": 0 }] }),
            TargetState::Stopped,
        ),
        (
            json!({ "services": [{ "serviceName": "gw-support-bot", "status": "ACTIVE",
                "desiredCount": 1, "runningCount": 0,
                "events": [{ "message": "essential container exited" }] }] }),
            TargetState::Error,
        ),
    ];

    for (described, expected) in cases {
        let runner = ScriptedRunner::new();
        runner.ok("describe-services", described.clone());
        let status = target(runner).get_status().await.unwrap();
        assert_eq!(status.state, expected, "{described}");
        if expected == TargetState::Error {
            assert!(status.error.unwrap().contains("essential container exited"));
        }
    }
}

#[tokio::test]
async fn test_status_of_missing_cluster_is_not_installed() {
    let runner = ScriptedRunner::new();
    runner.fail(
        "describe-services",
        "An error occurred (ClusterNotFoundException) when calling the DescribeServices operation",
    );
    let status = target(runner).get_status().await.unwrap();
    assert_eq!(status.state, TargetState::NotInstalled);
}

#[tokio::test]
async fn test_endpoint_walks_task_to_public_ip() {
    let runner = ScriptedRunner::new();
    runner
        .ok("list-tasks", json!({ "taskArns": ["arn:task/1"] }))
        .ok(
            "describe-tasks",
            json!({ "tasks": [{
                "taskArn": "arn:task/1",
                "attachments": [{
                    "type": "ElasticNetworkInterface",
                    "details": [{ "name": "networkInterfaceId", "value": "eni-42" }]
                }]
            }] }),
        )
        .ok(
            "describe-network-interfaces",
            json!({ "NetworkInterfaces": [{ "Association": { "PublicIp": "203.0.113.7" } }] }),
        );

    let endpoint = target(runner).get_endpoint().await.unwrap();
    assert_eq!(endpoint.url(), "http://203.0.113.7:18789");
}

#[tokio::test]
async fn test_endpoint_without_tasks_fails() {
    let runner = ScriptedRunner::new();
    runner.ok("list-tasks", json!({ "taskArns": [] }));
    let err = target(runner).get_endpoint().await.unwrap_err();
    assert!(matches!(err, ProvisionError::Endpoint(_)));
}

#[tokio::test]
async fn test_destroy_continues_past_failures() {
    let runner = ScriptedRunner::new();
    runner
        .fail("delete-service", "An error occurred (AccessDeniedException)")
        .ok(
            "list-task-definitions",
            json!({ "taskDefinitionArns": [
                "arn:aws:ecs:eu-west-1:1:task-definition/gw-support-bot:1",
                "arn:aws:ecs:eu-west-1:1:task-definition/gw-support-bot-old:1"
            ] }),
        )
        .fail(
            "delete-secret",
            "An error occurred (ResourceNotFoundException) when calling the DeleteSecret operation",
        );

    let report = target(runner.clone()).destroy().await;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "service");
    assert_eq!(report.removed, vec!["task-definitions", "secret", "log-group"]);
    // Only the exact family is deregistered
    let deregistered = runner.matching("deregister-task-definition");
    assert_eq!(deregistered.len(), 1);
    assert!(deregistered[0].display().ends_with("gw-support-bot:1 --region eu-west-1 --output json"));
}

#[tokio::test]
async fn test_logs_are_best_effort() {
    let runner = ScriptedRunner::new();
    runner.ok(
        "filter-log-events",
        json!({ "events": [
            { "message": "one\n" }, { "message": "two\n" }, { "message": "three\n" }
        ] }),
    );
    let query = LogQuery {
        lines: Some(2),
        ..Default::default()
    };
    assert_eq!(target(runner).get_logs(&query).await, vec!["two", "three"]);

    let runner = ScriptedRunner::new();
    runner.fail("filter-log-events", "An error occurred (ThrottlingException)");
    assert!(target(runner).get_logs(&LogQuery::default()).await.is_empty());
}
