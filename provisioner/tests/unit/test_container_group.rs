//! Container-group provider and target against in-memory clients

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::routing::post;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use fleet_provisioner::errors::ProvisionError;
use fleet_provisioner::providers::container_group::client::{LogAnalytics, SecretVault, TokenSource};
use fleet_provisioner::providers::container_group::models::ContainerGroup;
use fleet_provisioner::providers::container_group::ContainerGroupProvider;
use fleet_provisioner::providers::{
    CloudProvider, ContainerFilters, ContainerSpec, ContainerStatus, HealthStatus,
};
use fleet_provisioner::settings::ContainerGroupSettings;
use fleet_provisioner::targets::container_group::{
    ContainerGroupTarget, CONFIG_SECRET_ENV, CONFIG_SECRET_URI_ENV,
};
use fleet_provisioner::targets::naming::ResourceNames;
use fleet_provisioner::targets::{
    ConfigurePayload, DeploymentTarget, InstallOptions, LogQuery, TargetState,
};

use crate::support::{FakeAnalytics, FakeArm, FakeVault};

fn settings() -> ContainerGroupSettings {
    ContainerGroupSettings {
        subscription_id: "sub-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        client_id: "client-1".to_string(),
        client_secret: Some(SecretString::from("client-secret")),
        image: "ghcr.io/fleet/gateway:latest".to_string(),
        ..Default::default()
    }
}

fn provider(
    arm: &Arc<FakeArm>,
    vault: Option<&Arc<FakeVault>>,
    analytics: Option<&Arc<FakeAnalytics>>,
) -> ContainerGroupProvider {
    ContainerGroupProvider::with_clients(
        settings(),
        arm.clone(),
        vault.map(|v| v.clone() as Arc<dyn SecretVault>),
        analytics.map(|a| a.clone() as Arc<dyn LogAnalytics>),
    )
}

fn target(provider: ContainerGroupProvider) -> ContainerGroupTarget {
    ContainerGroupTarget::with_provider(
        ResourceNames::for_profile("support bot").unwrap(),
        18789,
        provider,
    )
}

fn group(name: &str, provisioning: &str, state: &str, tags: serde_json::Value) -> ContainerGroup {
    serde_json::from_value(json!({
        "name": name,
        "location": "westeurope",
        "tags": tags,
        "properties": {
            "provisioningState": provisioning,
            "containers": [{
                "name": "gateway",
                "properties": {
                    "image": "ghcr.io/fleet/gateway:1.0.0",
                    "resources": { "requests": { "cpu": 1.0, "memoryInGB": 2.0 } },
                    "instanceView": { "restartCount": 0, "currentState": { "state": state } }
                }
            }],
            "ipAddress": { "type": "Public", "ip": "20.1.2.3", "fqdn": format!("{name}.westeurope.example") }
        }
    }))
    .unwrap()
}

fn managed() -> serde_json::Value {
    json!({ "managed-by": "fleet-provisioner", "gateway-profile": "support-bot" })
}

fn install_options() -> InstallOptions {
    InstallOptions {
        profile_name: "support bot".to_string(),
        port: 18789,
        version_tag: Some("2.0.0".to_string()),
    }
}

// ================================== TARGET ======================================= //

#[tokio::test]
async fn test_install_deploys_tagged_group_with_secret_reference() {
    let arm = FakeArm::new();
    let vault = FakeVault::new();
    let target = target(provider(&arm, Some(&vault), None));

    let result = target.install(&install_options()).await.unwrap();
    assert_eq!(result.instance_id, "gw-support-bot");
    assert_eq!(*arm.resource_groups.lock().unwrap(), vec!["gateway-fleet"]);

    let created = arm.group("gw-support-bot").unwrap();
    assert_eq!(created.tags.get("managed-by").unwrap(), "fleet-provisioner");
    assert_eq!(created.tags.get("gateway-profile").unwrap(), "support-bot");
    assert_eq!(created.identity.unwrap().kind, "SystemAssigned");

    let container = &created.properties.containers[0];
    assert_eq!(container.properties.image, "ghcr.io/fleet/gateway:2.0.0");
    assert_eq!(container.properties.ports[0].port, 18789);
    let reference = container
        .properties
        .environment_variables
        .iter()
        .find(|v| v.name == CONFIG_SECRET_URI_ENV)
        .unwrap();
    assert_eq!(
        reference.value.as_deref(),
        Some("https://fleet-vault.vault.example.net/secrets/gw-support-bot-config")
    );
}

#[tokio::test]
async fn test_install_keeps_existing_group() {
    let arm = FakeArm::new();
    arm.insert("gw-support-bot", group("gw-support-bot", "Succeeded", "Running", managed()));
    let target = target(provider(&arm, None, None));

    target.install(&install_options()).await.unwrap();

    assert!(!arm
        .calls()
        .iter()
        .any(|c| c.starts_with("create_or_update_group")));
}

#[tokio::test]
async fn test_install_without_image_is_a_config_error() {
    let arm = FakeArm::new();
    let provider = ContainerGroupProvider::with_clients(
        ContainerGroupSettings::default(),
        arm.clone(),
        None,
        None,
    );
    let err = target(provider).install(&install_options()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ConfigError(_)));
    assert!(arm.calls().is_empty());
}

#[tokio::test]
async fn test_status_mapping() {
    let arm = FakeArm::new();
    let target = target(provider(&arm, None, None));
    assert_eq!(target.get_status().await.unwrap().state, TargetState::NotInstalled);

    arm.insert("gw-support-bot", group("gw-support-bot", "Succeeded", "Running", managed()));
    assert_eq!(target.get_status().await.unwrap().state, TargetState::Running);

    arm.insert("gw-support-bot", group("gw-support-bot", "Succeeded", "Stopped", managed()));
    assert_eq!(target.get_status().await.unwrap().state, TargetState::Stopped);

    arm.insert("gw-support-bot", group("gw-support-bot", "Creating", "Waiting", managed()));
    let status = target.get_status().await.unwrap();
    assert_eq!(status.state, TargetState::Error);
    assert!(status.error.unwrap().contains("Waiting"));
}

#[tokio::test]
async fn test_endpoint_prefers_fqdn() {
    let arm = FakeArm::new();
    let target = target(provider(&arm, None, None));
    assert!(matches!(
        target.get_endpoint().await.unwrap_err(),
        ProvisionError::Endpoint(_)
    ));

    arm.insert("gw-support-bot", group("gw-support-bot", "Succeeded", "Running", managed()));
    let endpoint = target.get_endpoint().await.unwrap();
    assert_eq!(endpoint.host, "gw-support-bot.westeurope.example");
    assert_eq!(endpoint.port, 18789);
}

#[tokio::test]
async fn test_configure_without_vault_redeploys_with_inline_config() {
    let arm = FakeArm::new();
    arm.insert("gw-support-bot", group("gw-support-bot", "Succeeded", "Running", managed()));
    let payload = ConfigurePayload {
        profile_name: "support bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::from([("TEAM".to_string(), "support".to_string())]),
        config: json!({ "channels": ["chat"] }),
    };

    let result = target(provider(&arm, None, None))
        .configure(&payload)
        .await
        .unwrap();
    assert!(!result.requires_restart);

    let calls = arm.calls();
    let deleted = calls.iter().position(|c| c == "delete_group gw-support-bot").unwrap();
    let created = calls
        .iter()
        .position(|c| c == "create_or_update_group gw-support-bot")
        .unwrap();
    assert!(deleted < created);

    let deployed = arm.group("gw-support-bot").unwrap();
    let container = &deployed.properties.containers[0].properties;
    // Keeps the running image rather than the configured default
    assert_eq!(container.image, "ghcr.io/fleet/gateway:1.0.0");
    let config = container
        .environment_variables
        .iter()
        .find(|v| v.name == CONFIG_SECRET_ENV)
        .unwrap();
    assert!(config.value.is_none());
    let document: serde_json::Value =
        serde_json::from_str(config.secure_value.as_deref().unwrap()).unwrap();
    assert_eq!(document["gatewayPort"], 18789);
    assert_eq!(document["environment"]["TEAM"], "support");
    assert_eq!(document["config"]["channels"][0], "chat");
    assert!(!container
        .environment_variables
        .iter()
        .any(|v| v.name == CONFIG_SECRET_URI_ENV));
}

#[tokio::test]
async fn test_configure_recovers_soft_deleted_secret() {
    let arm = FakeArm::new();
    let vault = FakeVault::new();
    vault.soft_delete("gw-support-bot-config");
    let payload = ConfigurePayload {
        profile_name: "support bot".to_string(),
        gateway_port: 18789,
        environment: BTreeMap::from([("TEAM".to_string(), "support".to_string())]),
        config: json!({ "channels": ["chat"] }),
    };

    let result = target(provider(&arm, Some(&vault), None))
        .configure(&payload)
        .await
        .unwrap();

    assert!(result.requires_restart);
    let stored: serde_json::Value =
        serde_json::from_str(&vault.secret("gw-support-bot-config").unwrap()).unwrap();
    assert_eq!(stored["gatewayPort"], 18789);
    assert_eq!(stored["environment"]["TEAM"], "support");
    assert_eq!(stored["config"]["channels"][0], "chat");
    // The group itself is untouched until restart
    assert!(arm.calls().is_empty());
}

#[tokio::test]
async fn test_destroy_treats_missing_resources_as_removed() {
    let arm = FakeArm::new();
    let vault = FakeVault::new();
    let report = target(provider(&arm, Some(&vault), None)).destroy().await;
    assert!(report.is_clean());
    assert_eq!(report.removed, vec!["container-group", "secret"]);
}

// ================================= PROVIDER ====================================== //

fn spec_with_secret() -> ContainerSpec {
    ContainerSpec {
        name: "gw-support-bot".to_string(),
        image: "ghcr.io/fleet/gateway:1.0.0".to_string(),
        cpu: 1.0,
        memory_gb: 2.0,
        ports: vec![18789],
        environment: BTreeMap::from([("TEAM".to_string(), "support".to_string())]),
        secrets: BTreeMap::from([("API_TOKEN".to_string(), SecretString::from("tok-123"))]),
        labels: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_secrets_inline_without_vault() {
    let arm = FakeArm::new();
    let instance = provider(&arm, None, None)
        .deploy_container(&spec_with_secret())
        .await
        .unwrap();
    assert_eq!(instance.id, "gw-support-bot");

    let created = arm.group("gw-support-bot").unwrap();
    assert!(created.identity.is_none());
    let variables = &created.properties.containers[0].properties.environment_variables;
    let token = variables.iter().find(|v| v.name == "API_TOKEN").unwrap();
    assert_eq!(token.secure_value.as_deref(), Some("tok-123"));
    assert!(token.value.is_none());
}

#[tokio::test]
async fn test_secrets_go_to_vault_when_configured() {
    let arm = FakeArm::new();
    let vault = FakeVault::new();
    provider(&arm, Some(&vault), None)
        .deploy_container(&spec_with_secret())
        .await
        .unwrap();

    assert_eq!(vault.secret("gw-support-bot-api-token").as_deref(), Some("tok-123"));
    let created = arm.group("gw-support-bot").unwrap();
    let variables = &created.properties.containers[0].properties.environment_variables;
    assert!(variables.iter().all(|v| v.secure_value.is_none()));
    let reference = variables
        .iter()
        .find(|v| v.name == "API_TOKEN_SECRET_URI")
        .unwrap();
    assert!(reference
        .value
        .as_deref()
        .unwrap()
        .starts_with("https://fleet-vault.vault.example.net/secrets/gw-support-bot-api-token"));
}

#[tokio::test]
async fn test_update_in_place_is_unsupported() {
    let arm = FakeArm::new();
    let err = provider(&arm, None, None)
        .update_container("gw-support-bot", &spec_with_secret())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Unsupported(_)));
}

#[tokio::test]
async fn test_listing_only_returns_managed_groups() {
    let arm = FakeArm::new();
    arm.insert("gw-a", group("gw-a", "Succeeded", "Running", managed()));
    arm.insert("gw-b", group("gw-b", "Succeeded", "Stopped", managed()));
    arm.insert("legacy", group("legacy", "Succeeded", "Running", json!({ "team": "ops" })));
    let provider = provider(&arm, None, None);

    let all = provider.list_containers(None).await.unwrap();
    let names: Vec<&str> = all.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["gw-a", "gw-b"]);
    assert_eq!(all[0].health, HealthStatus::Healthy);
    assert_eq!(all[0].metadata.get("fqdn").unwrap(), "gw-a.westeurope.example");

    let running = ContainerFilters {
        status: Some(ContainerStatus::Running),
        ..Default::default()
    };
    let filtered = provider.list_containers(Some(&running)).await.unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "gw-a");
}

#[tokio::test]
async fn test_logs_fall_back_to_workspace() {
    let arm = FakeArm::new();
    arm.insert("gw-a", group("gw-a", "Succeeded", "Running", managed()));
    let analytics = FakeAnalytics::with_rows(vec![
        vec![json!("2026-01-01T00:00:02Z"), json!("newest")],
        vec![json!("2026-01-01T00:00:01Z"), json!("older")],
    ]);
    let provider = provider(&arm, None, Some(&analytics));

    let lines = provider.get_logs("gw-a", &LogQuery::default()).await.unwrap();
    assert_eq!(lines, vec!["older", "newest"]);
    let queries = analytics.queries.lock().unwrap().clone();
    assert!(queries[0].contains("ContainerGroup_s == 'gw-a'"));

    // Direct logs win when available
    arm.set_logs(Some("boot\nready\n"));
    let lines = provider.get_logs("gw-a", &LogQuery::default()).await.unwrap();
    assert_eq!(lines, vec!["boot", "ready"]);
}

#[tokio::test]
async fn test_logs_without_workspace_surface_error() {
    let arm = FakeArm::new();
    let err = provider(&arm, None, None)
        .get_logs("gw-missing", &LogQuery::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_secret_round_trip_through_vault() {
    let arm = FakeArm::new();
    let vault = FakeVault::new();
    let provider = provider(&arm, Some(&vault), None);

    let id = provider
        .store_secret("gw-a-token", &SecretString::from("v1"))
        .await
        .unwrap();
    assert!(id.ends_with("/secrets/gw-a-token/v1"));
    let fetched = provider.get_secret("gw-a-token").await.unwrap().unwrap();
    assert_eq!(fetched.expose_secret(), "v1");

    provider.delete_secret("gw-a-token").await.unwrap();
    assert!(provider.get_secret("gw-a-token").await.unwrap().is_none());
}

#[tokio::test]
async fn test_validate_reports_findings_without_failing() {
    let arm = FakeArm::new();
    let result = ContainerGroupProvider::with_clients(
        ContainerGroupSettings::default(),
        arm,
        None,
        None,
    )
    .validate()
    .await;
    assert!(!result.valid);
    assert!(result.errors.iter().any(|e| e.contains("subscription_id")));
    assert!(result.errors.iter().any(|e| e.contains("client_secret")));
    assert_eq!(result.warnings.len(), 2);

    let result = provider(&FakeArm::new(), Some(&FakeVault::new()), None).validate().await;
    assert!(result.valid, "{:?}", result.errors);
    assert_eq!(result.warnings.len(), 1);
}

// ================================== TOKENS ======================================= //

/// Token endpoint that answers slowly and counts requests
async fn token_endpoint(expires_in: u64) -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    let app = Router::new().route(
        "/tenant-1/oauth2/v2.0/token",
        post(move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(50)).await;
                Json(json!({ "access_token": format!("token-{n}"), "expires_in": expires_in }))
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    (format!("http://{addr}"), requests)
}

fn token_source(login_endpoint: String) -> TokenSource {
    let settings = ContainerGroupSettings {
        login_endpoint,
        ..settings()
    };
    TokenSource::new(reqwest::Client::new(), &settings)
}

#[tokio::test]
async fn test_concurrent_token_requests_share_one_refresh() {
    let (endpoint, requests) = token_endpoint(3600).await;
    let tokens = token_source(endpoint);
    let scope = "https://vault.azure.net/.default";

    let (a, b, c) = tokio::join!(tokens.token(scope), tokens.token(scope), tokens.token(scope));
    for token in [a, b, c] {
        assert_eq!(token.unwrap().expose_secret(), "token-1");
    }
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    // Cached for the same scope, fetched for another
    assert_eq!(tokens.token(scope).await.unwrap().expose_secret(), "token-1");
    let other = tokens.token("https://api.loganalytics.io/.default").await.unwrap();
    assert_eq!(other.expose_secret(), "token-2");
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_tokens_close_to_expiry_are_refreshed() {
    let (endpoint, requests) = token_endpoint(30).await;
    let tokens = token_source(endpoint);
    let scope = "https://vault.azure.net/.default";

    assert_eq!(tokens.token(scope).await.unwrap().expose_secret(), "token-1");
    assert_eq!(tokens.token(scope).await.unwrap().expose_secret(), "token-2");
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}
