//! Step catalogs
//!
//! What provisioning looks like for each backend kind, as data. The tracker
//! only looks catalogs up; the runner maps each step id to an action.

use serde::Serialize;

/// Catalog used for any backend kind without its own entry
pub const DEFAULT_CATALOG: &[&str] = &[
    "validate_config",
    "install_resources",
    "write_config",
    "start_service",
];

const CATALOGS: &[(&str, &[&str])] = &[
    (
        "serverless-container",
        &[
            "validate_config",
            "install_resources",
            "write_config",
            "start_service",
            "wait_running",
            "resolve_endpoint",
            "health_check",
            "connect_channels",
        ],
    ),
    (
        "container-group",
        &[
            "validate_config",
            "install_resources",
            "write_config",
            "restart_workload",
            "wait_running",
            "resolve_endpoint",
            "health_check",
        ],
    ),
    (
        "local-service",
        &[
            "validate_config",
            "install_resources",
            "write_config",
            "restart_workload",
            "wait_running",
            "health_check",
        ],
    ),
];

const STEP_NAMES: &[(&str, &str)] = &[
    ("validate_config", "Validating configuration"),
    ("install_resources", "Creating cloud resources"),
    ("write_config", "Writing gateway configuration"),
    ("start_service", "Starting gateway service"),
    ("restart_workload", "Restarting gateway with new configuration"),
    ("wait_running", "Waiting for gateway to run"),
    ("resolve_endpoint", "Resolving public endpoint"),
    ("health_check", "Checking gateway health"),
    ("connect_channels", "Connecting messaging channels"),
];

/// What the runner does for a step id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Validate,
    Install,
    Configure,
    Start,
    Restart,
    AwaitRunning,
    ResolveEndpoint,
    HealthCheck,
    /// Completed by a collaborator outside this process, if at all
    External,
}

pub fn step_action(step_id: &str) -> StepAction {
    match step_id {
        "validate_config" => StepAction::Validate,
        "install_resources" => StepAction::Install,
        "write_config" => StepAction::Configure,
        "start_service" => StepAction::Start,
        "restart_workload" => StepAction::Restart,
        "wait_running" => StepAction::AwaitRunning,
        "resolve_endpoint" => StepAction::ResolveEndpoint,
        "health_check" => StepAction::HealthCheck,
        _ => StepAction::External,
    }
}

/// Ordered step ids for `backend_kind`, or the default catalog
pub fn steps_for(backend_kind: &str) -> &'static [&'static str] {
    CATALOGS
        .iter()
        .find(|(kind, _)| *kind == backend_kind)
        .map(|(_, steps)| *steps)
        .unwrap_or(DEFAULT_CATALOG)
}

/// Human-readable step name; unknown ids render as themselves
pub fn step_name(step_id: &str) -> &str {
    STEP_NAMES
        .iter()
        .find(|(id, _)| *id == step_id)
        .map(|(_, name)| *name)
        .unwrap_or(step_id)
}

/// Catalog entry as served to clients
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub backend_kind: &'static str,
    pub steps: Vec<CatalogStep>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStep {
    pub id: &'static str,
    pub name: &'static str,
    pub action: StepAction,
}

fn entry(backend_kind: &'static str, steps: &'static [&'static str]) -> CatalogEntry {
    CatalogEntry {
        backend_kind,
        steps: steps
            .iter()
            .map(|&id| CatalogStep {
                id,
                name: step_name(id),
                action: step_action(id),
            })
            .collect(),
    }
}

/// Every registered catalog followed by the default
pub fn all_catalogs() -> Vec<CatalogEntry> {
    CATALOGS
        .iter()
        .map(|(kind, steps)| entry(*kind, *steps))
        .chain(std::iter::once(entry("default", DEFAULT_CATALOG)))
        .collect()
}
