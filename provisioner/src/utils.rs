//! Build identity and run identifiers

use serde::Serialize;

/// Name reported by `/health`, `/version` and `--version`
pub const SERVICE_NAME: &str = "fleet-provisioner";

/// Identity of this build, embedded by `build.rs`
#[derive(Debug, Clone, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_time: &'static str,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown"),
    }
}

/// Identifier of one provisioning run. Timers carry it so a timer left
/// over from an earlier run of the same instance cannot touch a newer one.
pub fn new_run_id() -> String {
    format!("run-{}", uuid::Uuid::new_v4().simple())
}
