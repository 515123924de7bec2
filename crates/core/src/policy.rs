use std::collections::HashSet;
use tracing::warn;

use crate::config::PolicySettings;
use crate::AdmissionError;

pub const MB_IN_BYTES: u64 = 1024 * 1024;

/// Default custom ceiling, in megabytes.
pub const DEFAULT_MAX_MB: u64 = 5;

/// Role allowed to upload when nothing else is configured.
pub const DEFAULT_ROLE: &str = "administrator";

/// Admission policy consulted for every upload.
///
/// Built fresh from settings on each evaluation and passed explicitly; nothing
/// in this crate reads policy from a global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPolicy {
    /// Roles that may upload the managed type. Any overlap grants access.
    pub allowed_roles: HashSet<String>,
    /// Ceiling configured for this gatekeeper.
    pub custom_max_bytes: u64,
    /// Ceiling imposed by the host. Not owned here; can only be tightened.
    pub host_global_max_bytes: u64,
}

impl Default for AccessPolicy {
    fn default() -> Self {
        Self {
            allowed_roles: HashSet::from([DEFAULT_ROLE.to_string()]),
            custom_max_bytes: DEFAULT_MAX_MB * MB_IN_BYTES,
            host_global_max_bytes: u64::MAX,
        }
    }
}

impl AccessPolicy {
    /// Convert configured settings. A zero megabyte ceiling would refuse every
    /// file, so it is raised to 1 MB with a warning.
    pub fn from_settings(settings: &PolicySettings) -> Self {
        if settings.custom_max_size_mb == 0 {
            warn!("policy.custom_max_size_mb is 0, using 1 MB instead");
        }
        Self {
            allowed_roles: settings.allowed_roles.iter().cloned().collect(),
            custom_max_bytes: settings
                .custom_max_size_mb
                .max(1)
                .saturating_mul(MB_IN_BYTES),
            host_global_max_bytes: settings.host_max_upload_bytes.max(1),
        }
    }

    /// Builder-style method to set the host's ceiling
    pub fn with_host_max(mut self, host_global_max_bytes: u64) -> Self {
        self.host_global_max_bytes = host_global_max_bytes;
        self
    }

    pub fn effective_ceiling(&self) -> u64 {
        compute_effective_ceiling(self.custom_max_bytes, self.host_global_max_bytes)
    }
}

/// True iff the caller holds at least one allowed role.
/// An empty role set never matches.
pub fn authorize_role(caller_roles: &HashSet<String>, allowed_roles: &HashSet<String>) -> bool {
    !caller_roles.is_disjoint(allowed_roles)
}

pub fn compute_effective_ceiling(custom_max_bytes: u64, host_global_max_bytes: u64) -> u64 {
    custom_max_bytes.min(host_global_max_bytes)
}

/// Reject only when `byte_size` is strictly greater than the ceiling.
///
/// The error carries the ceiling in whole megabytes (floor division).
pub fn authorize_size(byte_size: u64, effective_ceiling: u64) -> Result<(), AdmissionError> {
    if byte_size > effective_ceiling {
        return Err(AdmissionError::SizeExceeded {
            ceiling_mb: effective_ceiling / MB_IN_BYTES,
        });
    }
    Ok(())
}
