//! Deterministic resource naming
//!
//! Every per-instance resource name is a pure function of the profile name so
//! a fresh adapter can take over an existing deployment after a restart.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::ProvisionError;

const MAX_SLUG_LEN: usize = 32;
const DIGEST_LEN: usize = 8;

/// Container name inside every task definition / container group
pub const GATEWAY_CONTAINER: &str = "gateway";

/// Default gateway listen port
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// Tag marking resources created by this system
pub const MANAGED_BY_TAG: &str = "managed-by";
pub const MANAGED_BY_VALUE: &str = "fleet-provisioner";
pub const PROFILE_TAG: &str = "gateway-profile";

/// Resource identifiers derived from one profile name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceNames {
    pub profile: String,
    pub slug: String,
    pub service: String,
    pub task_family: String,
    pub container: String,
    pub secret: String,
    pub log_group: String,
    pub container_group: String,
    pub local_container: String,
}

impl ResourceNames {
    /// Derive every resource name for `profile`
    pub fn for_profile(profile: &str) -> Result<Self, ProvisionError> {
        let slug = slugify(profile);
        if slug.is_empty() {
            return Err(ProvisionError::ValidationError(format!(
                "profile name '{}' has no usable characters",
                profile
            )));
        }

        Ok(Self {
            profile: profile.to_string(),
            service: format!("gw-{}", slug),
            task_family: format!("gw-{}", slug),
            container: GATEWAY_CONTAINER.to_string(),
            secret: format!("fleet/{}/gateway-config", slug),
            log_group: format!("/fleet/gw-{}", slug),
            container_group: format!("gw-{}", slug),
            local_container: format!("fleet-gw-{}", slug),
            slug,
        })
    }

    /// Vault secret names only allow alphanumerics and dashes
    pub fn vault_secret(&self) -> String {
        format!("gw-{}-config", self.slug)
    }
}

/// Lowercase, `[a-z0-9-]`, no leading/trailing/double dashes, bounded length.
/// Over-long names keep a digest of the full profile so truncation cannot collide.
pub fn slugify(profile: &str) -> String {
    let mut slug = String::with_capacity(profile.len());
    let mut last_dash = true;
    for c in profile.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }

    if slug.len() <= MAX_SLUG_LEN {
        return slug;
    }

    let digest = format!("{:x}", Sha256::digest(profile.as_bytes()));
    let keep = MAX_SLUG_LEN - DIGEST_LEN - 1;
    let head = slug[..keep].trim_end_matches('-');
    format!("{}-{}", head, &digest[..DIGEST_LEN])
}
