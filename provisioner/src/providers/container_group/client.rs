//! Typed clients for the container-group platform
//!
//! Three services sit behind the provider: the management API (resource
//! groups and container groups), the secret vault and the log-analytics
//! query API. Each is a trait so the provider can be driven by fakes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::errors::ProvisionError;
use crate::providers::container_group::models::{ContainerGroup, ContainerLogs, GroupList};
use crate::settings::ContainerGroupSettings;

const GROUPS_API_VERSION: &str = "2023-05-01";
const RESOURCE_GROUPS_API_VERSION: &str = "2021-04-01";
const VAULT_API_VERSION: &str = "7.4";

const VAULT_SCOPE: &str = "https://vault.azure.net/.default";
const LOG_ANALYTICS_SCOPE: &str = "https://api.loganalytics.io/.default";
const LOG_ANALYTICS_ENDPOINT: &str = "https://api.loganalytics.io";

/// Refresh tokens this long before they expire
const TOKEN_SKEW: Duration = Duration::from_secs(60);

// ================================ TRAITS ====================================== //

/// Management API for resource groups and container groups
#[async_trait]
pub trait ContainerGroupApi: Send + Sync {
    async fn ensure_resource_group(
        &self,
        resource_group: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProvisionError>;

    async fn get_group(&self, resource_group: &str, name: &str)
        -> Result<ContainerGroup, ProvisionError>;

    async fn create_or_update_group(
        &self,
        resource_group: &str,
        name: &str,
        group: &ContainerGroup,
    ) -> Result<ContainerGroup, ProvisionError>;

    async fn delete_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError>;

    async fn list_groups(&self, resource_group: &str) -> Result<Vec<ContainerGroup>, ProvisionError>;

    async fn start_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError>;

    async fn stop_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError>;

    async fn restart_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError>;

    async fn container_logs(
        &self,
        resource_group: &str,
        name: &str,
        container: &str,
        tail: usize,
    ) -> Result<String, ProvisionError>;
}

/// Managed secret store
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Base URL secrets are addressed under
    fn vault_url(&self) -> &str;

    /// Fails with `Conflict` when the name is held by a deleted secret
    async fn create_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError>;

    /// Write a new version, recovering a soft-deleted secret first
    async fn update_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError>;

    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, ProvisionError>;

    async fn delete_secret(&self, name: &str) -> Result<(), ProvisionError>;
}

/// Workspace query API; returns rows of the first result table
#[async_trait]
pub trait LogAnalytics: Send + Sync {
    async fn query(
        &self,
        query: &str,
        timespan: Duration,
    ) -> Result<Vec<Vec<serde_json::Value>>, ProvisionError>;
}

// ================================ TOKENS ====================================== //

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

/// Client-credentials token source with a per-scope cache. Cache hits never
/// wait on a refresh; concurrent misses share one token request.
pub struct TokenSource {
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: Option<SecretString>,
    cache: RwLock<HashMap<String, CachedToken>>,
    refresh: Mutex<()>,
}

impl TokenSource {
    pub fn new(http: Client, settings: &ContainerGroupSettings) -> Self {
        Self {
            http,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                settings.login_endpoint.trim_end_matches('/'),
                settings.tenant_id
            ),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            cache: RwLock::new(HashMap::new()),
            refresh: Mutex::new(()),
        }
    }

    pub async fn token(&self, scope: &str) -> Result<SecretString, ProvisionError> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        let _refresh = self.refresh.lock().await;
        // Filled by whoever held the refresh lock before us
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        let (token, expires_in) = self.request_token(scope).await?;
        self.cache.write().unwrap_or_else(|e| e.into_inner()).insert(
            scope.to_string(),
            CachedToken {
                token: token.clone(),
                expires_at: Instant::now() + expires_in,
            },
        );
        Ok(token)
    }

    fn cached(&self, scope: &str) -> Option<SecretString> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache
            .get(scope)
            .filter(|cached| cached.expires_at > Instant::now() + TOKEN_SKEW)
            .map(|cached| cached.token.clone())
    }

    async fn request_token(&self, scope: &str) -> Result<(SecretString, Duration), ProvisionError> {
        let secret = self.client_secret.as_ref().ok_or_else(|| {
            ProvisionError::ConfigError("container-group client secret is not set".into())
        })?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", &self.client_id)
            .append_pair("client_secret", secret.expose_secret())
            .append_pair("scope", scope)
            .finish();

        debug!("Requesting token for {}", scope);
        let response = self
            .http
            .post(&self.token_url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await?;
        let response: TokenResponse = decode(response).await?;

        Ok((
            SecretString::from(response.access_token),
            Duration::from_secs(response.expires_in),
        ))
    }
}

// ============================== HTTP HELPERS ================================== //

async fn check(response: Response) -> Result<Response, ProvisionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.as_u16() != 404 {
        error!("Request failed: {} - {}", status, body);
    }
    Err(ProvisionError::from_status(status.as_u16(), body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ProvisionError> {
    let response = check(response).await?;
    Ok(response.json().await?)
}

async fn send_authorized(
    tokens: &TokenSource,
    scope: &str,
    request: RequestBuilder,
) -> Result<Response, ProvisionError> {
    let token = tokens.token(scope).await?;
    let response = request
        .header(header::AUTHORIZATION, format!("Bearer {}", token.expose_secret()))
        .send()
        .await?;
    check(response).await
}

// ============================ MANAGEMENT CLIENT =============================== //

/// Management API client bound to one subscription
pub struct ArmClient {
    http: Client,
    tokens: Arc<TokenSource>,
    base_url: String,
    subscription_id: String,
}

impl ArmClient {
    pub fn new(http: Client, tokens: Arc<TokenSource>, settings: &ContainerGroupSettings) -> Self {
        Self {
            http,
            tokens,
            base_url: settings.management_endpoint.trim_end_matches('/').to_string(),
            subscription_id: settings.subscription_id.clone(),
        }
    }

    fn scope(&self) -> String {
        format!("{}/.default", self.base_url)
    }

    fn group_url(&self, resource_group: &str, name: &str) -> String {
        format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups/{}",
            self.base_url, self.subscription_id, resource_group, name
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProvisionError> {
        send_authorized(&self.tokens, &self.scope(), request).await
    }

    async fn post_action(&self, resource_group: &str, name: &str, action: &str) -> Result<(), ProvisionError> {
        let url = format!("{}/{}", self.group_url(resource_group, name), action);
        debug!("POST {}", url);
        self.send(
            self.http
                .post(&url)
                .query(&[("api-version", GROUPS_API_VERSION)])
                .header(header::CONTENT_LENGTH, 0),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerGroupApi for ArmClient {
    async fn ensure_resource_group(
        &self,
        resource_group: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProvisionError> {
        let url = format!(
            "{}/subscriptions/{}/resourcegroups/{}",
            self.base_url, self.subscription_id, resource_group
        );
        debug!("PUT {}", url);
        self.send(
            self.http
                .put(&url)
                .query(&[("api-version", RESOURCE_GROUPS_API_VERSION)])
                .json(&json!({ "location": location, "tags": tags })),
        )
        .await?;
        Ok(())
    }

    async fn get_group(&self, resource_group: &str, name: &str) -> Result<ContainerGroup, ProvisionError> {
        let url = self.group_url(resource_group, name);
        debug!("GET {}", url);
        let response = self
            .send(self.http.get(&url).query(&[("api-version", GROUPS_API_VERSION)]))
            .await?;
        Ok(response.json().await?)
    }

    async fn create_or_update_group(
        &self,
        resource_group: &str,
        name: &str,
        group: &ContainerGroup,
    ) -> Result<ContainerGroup, ProvisionError> {
        let url = self.group_url(resource_group, name);
        debug!("PUT {}", url);
        let response = self
            .send(
                self.http
                    .put(&url)
                    .query(&[("api-version", GROUPS_API_VERSION)])
                    .json(group),
            )
            .await?;
        Ok(response.json().await?)
    }

    async fn delete_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError> {
        let url = self.group_url(resource_group, name);
        debug!("DELETE {}", url);
        self.send(self.http.delete(&url).query(&[("api-version", GROUPS_API_VERSION)]))
            .await?;
        Ok(())
    }

    async fn list_groups(&self, resource_group: &str) -> Result<Vec<ContainerGroup>, ProvisionError> {
        let mut url = format!(
            "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ContainerInstance/containerGroups?api-version={}",
            self.base_url, self.subscription_id, resource_group, GROUPS_API_VERSION
        );
        let mut groups = Vec::new();
        loop {
            debug!("GET {}", url);
            let page: GroupList = self.send(self.http.get(&url)).await?.json().await?;
            groups.extend(page.value);
            match page.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }
        Ok(groups)
    }

    async fn start_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError> {
        self.post_action(resource_group, name, "start").await
    }

    async fn stop_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError> {
        self.post_action(resource_group, name, "stop").await
    }

    async fn restart_group(&self, resource_group: &str, name: &str) -> Result<(), ProvisionError> {
        self.post_action(resource_group, name, "restart").await
    }

    async fn container_logs(
        &self,
        resource_group: &str,
        name: &str,
        container: &str,
        tail: usize,
    ) -> Result<String, ProvisionError> {
        let url = format!("{}/containers/{}/logs", self.group_url(resource_group, name), container);
        let tail = tail.to_string();
        debug!("GET {}", url);
        let logs: ContainerLogs = self
            .send(
                self.http
                    .get(&url)
                    .query(&[("api-version", GROUPS_API_VERSION), ("tail", tail.as_str())]),
            )
            .await?
            .json()
            .await?;
        Ok(logs.content)
    }
}

// ================================ VAULT ======================================= //

#[derive(Deserialize)]
struct SecretBundle {
    #[serde(default)]
    id: String,
    #[serde(default)]
    value: Option<String>,
}

pub struct VaultClient {
    http: Client,
    tokens: Arc<TokenSource>,
    vault_url: String,
}

impl VaultClient {
    pub fn new(http: Client, tokens: Arc<TokenSource>, vault_url: &str) -> Self {
        Self {
            http,
            tokens,
            vault_url: vault_url.trim_end_matches('/').to_string(),
        }
    }

    fn secret_url(&self, name: &str) -> String {
        format!("{}/secrets/{}", self.vault_url, name)
    }

    async fn put_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError> {
        let url = self.secret_url(name);
        debug!("PUT {}", url);
        let bundle: SecretBundle = send_authorized(
            &self.tokens,
            VAULT_SCOPE,
            self.http
                .put(&url)
                .query(&[("api-version", VAULT_API_VERSION)])
                .json(&json!({ "value": value.expose_secret() })),
        )
        .await?
        .json()
        .await?;
        Ok(bundle.id)
    }
}

#[async_trait]
impl SecretVault for VaultClient {
    fn vault_url(&self) -> &str {
        &self.vault_url
    }

    async fn create_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError> {
        self.put_secret(name, value).await
    }

    async fn update_secret(&self, name: &str, value: &SecretString) -> Result<String, ProvisionError> {
        let url = format!("{}/deletedsecrets/{}/recover", self.vault_url, name);
        debug!("POST {}", url);
        let recovered = send_authorized(
            &self.tokens,
            VAULT_SCOPE,
            self.http
                .post(&url)
                .query(&[("api-version", VAULT_API_VERSION)])
                .header(header::CONTENT_LENGTH, 0),
        )
        .await;
        match recovered {
            Ok(_) => debug!("Recovered deleted secret {}", name),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.put_secret(name, value).await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<SecretString>, ProvisionError> {
        let url = self.secret_url(name);
        debug!("GET {}", url);
        let result = send_authorized(
            &self.tokens,
            VAULT_SCOPE,
            self.http.get(&url).query(&[("api-version", VAULT_API_VERSION)]),
        )
        .await;
        match result {
            Ok(response) => {
                let bundle: SecretBundle = response.json().await?;
                Ok(bundle.value.map(SecretString::from))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete_secret(&self, name: &str) -> Result<(), ProvisionError> {
        let url = self.secret_url(name);
        debug!("DELETE {}", url);
        send_authorized(
            &self.tokens,
            VAULT_SCOPE,
            self.http.delete(&url).query(&[("api-version", VAULT_API_VERSION)]),
        )
        .await?;
        Ok(())
    }
}

// ============================= LOG ANALYTICS ================================== //

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    tables: Vec<QueryTable>,
}

#[derive(Deserialize)]
struct QueryTable {
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

pub struct LogAnalyticsClient {
    http: Client,
    tokens: Arc<TokenSource>,
    workspace_id: String,
}

impl LogAnalyticsClient {
    pub fn new(http: Client, tokens: Arc<TokenSource>, workspace_id: &str) -> Self {
        Self {
            http,
            tokens,
            workspace_id: workspace_id.to_string(),
        }
    }
}

#[async_trait]
impl LogAnalytics for LogAnalyticsClient {
    async fn query(
        &self,
        query: &str,
        timespan: Duration,
    ) -> Result<Vec<Vec<serde_json::Value>>, ProvisionError> {
        let url = format!("{}/v1/workspaces/{}/query", LOG_ANALYTICS_ENDPOINT, self.workspace_id);
        debug!("POST {}", url);
        let response: QueryResponse = send_authorized(
            &self.tokens,
            LOG_ANALYTICS_SCOPE,
            self.http.post(&url).json(&json!({
                "query": query,
                "timespan": format!("PT{}S", timespan.as_secs().max(1)),
            })),
        )
        .await?
        .json()
        .await?;
        Ok(response
            .tables
            .into_iter()
            .next()
            .map(|table| table.rows)
            .unwrap_or_default())
    }
}

/// Shared HTTP client for all three services
pub fn http_client() -> Result<Client, ProvisionError> {
    Ok(Client::builder().timeout(Duration::from_secs(30)).build()?)
}
