pub mod audit;
pub mod config;
pub mod gatekeeper;
pub mod metrics;
pub mod policy;
pub mod types;
pub mod verifier;

#[cfg(test)]
mod testutil;

use thiserror::Error;

/// Extension of the one file type this crate arbitrates.
pub const MANAGED_EXTENSION: &str = "avifs";

/// Canonical MIME reported for every accepted file.
pub const MIME_PRIMARY: &str = "image/avif";

/// Blocking outcomes of an admission check.
///
/// `Display` output is the message surfaced to the end user.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Sorry, you are not allowed to upload AVIF Sequence files.")]
    RoleDenied,
    #[error("AVIF Sequence files must be smaller than {ceiling_mb} MB.")]
    SizeExceeded { ceiling_mb: u64 },
    #[error("Invalid AVIFS file")]
    TypeUnverified,
}

impl AdmissionError {
    /// Short machine-readable code used in audit events and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::RoleDenied => "role_denied",
            AdmissionError::SizeExceeded { .. } => "size_exceeded",
            AdmissionError::TypeUnverified => "type_unverified",
        }
    }
}
