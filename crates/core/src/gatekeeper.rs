//! Host-facing admission interface.
//!
//! The host calls these methods directly, in a fixed order, instead of
//! registering callbacks. `admit` runs the whole chain for callers that do not
//! need the individual hook shapes.

use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::log_audit;
use crate::config::VerifierSettings;
use crate::metrics::MetricsStore;
use crate::policy::{self, AccessPolicy};
use crate::types::{extension_of, FileClassification, TypeVerdict, UploadCandidate, UploadFile};
use crate::verifier::{InferSniffer, TypeVerifier, UniqueFilename};
use crate::{AdmissionError, MANAGED_EXTENSION, MIME_PRIMARY};

/// Final decision for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Not the managed extension; the host decides on its own.
    NotApplicable,
    Admitted {
        extension: String,
        mime: String,
        /// Name the host should store the file under.
        filename: String,
    },
    Rejected(AdmissionError),
}

pub struct Gatekeeper {
    verifier: TypeVerifier,
    metrics: Option<Arc<MetricsStore>>,
}

impl Gatekeeper {
    pub fn new(verifier: TypeVerifier) -> Self {
        Self {
            verifier,
            metrics: None,
        }
    }

    /// Build a gatekeeper with the `infer` sniffer when sniffing is enabled.
    pub fn from_settings(settings: &VerifierSettings, namer: Arc<dyn UniqueFilename>) -> Self {
        let mut verifier = TypeVerifier::new(namer);
        if settings.sniffing_enabled {
            verifier = verifier.with_sniffer(Arc::new(InferSniffer));
        }
        Self::new(verifier)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsStore>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn evaluate_role(
        &self,
        caller_roles: &HashSet<String>,
        policy: &AccessPolicy,
    ) -> Result<(), AdmissionError> {
        if policy::authorize_role(caller_roles, &policy.allowed_roles) {
            Ok(())
        } else {
            Err(AdmissionError::RoleDenied)
        }
    }

    pub fn verify_type(&self, candidate: &UploadCandidate) -> TypeVerdict {
        self.verifier.verify(candidate)
    }

    /// Size check against `min(custom, host)`, recomputed from `policy` on every call.
    pub fn authorize_size(&self, byte_size: u64, policy: &AccessPolicy) -> Result<(), AdmissionError> {
        policy::authorize_size(byte_size, policy.effective_ceiling())
    }

    /// Run role, type and size checks in order, stopping at the first rejection.
    pub fn admit(&self, candidate: &UploadCandidate, policy: &AccessPolicy) -> Admission {
        let filename = candidate.declared_filename();
        let admission = self.decide(candidate, policy);

        match &admission {
            Admission::NotApplicable => {
                debug!("{} is not an .{} upload, skipping", filename, MANAGED_EXTENSION);
                if let Some(m) = &self.metrics {
                    m.inc_not_applicable();
                }
            }
            Admission::Admitted {
                mime,
                filename: stored_as,
                ..
            } => {
                info!("Admitted {} as {} ({} bytes)", filename, stored_as, candidate.byte_size);
                if let Some(m) = &self.metrics {
                    m.inc_admitted();
                }
                log_audit(
                    "admission",
                    filename,
                    json!({
                        "decision": "admitted",
                        "stored_as": stored_as,
                        "mime": mime,
                        "size_bytes": candidate.byte_size,
                    }),
                );
            }
            Admission::Rejected(err) => {
                warn!("Rejected {}: {}", filename, err);
                if let Some(m) = &self.metrics {
                    m.inc_rejected(err);
                }
                log_audit(
                    "admission",
                    filename,
                    json!({
                        "decision": "rejected",
                        "reason": err.code(),
                        "message": err.to_string(),
                        "size_bytes": candidate.byte_size,
                    }),
                );
            }
        }

        admission
    }

    fn decide(&self, candidate: &UploadCandidate, policy: &AccessPolicy) -> Admission {
        if !candidate.claims_managed_type() {
            return Admission::NotApplicable;
        }

        if let Err(e) = self.evaluate_role(&candidate.caller_roles, policy) {
            return Admission::Rejected(e);
        }

        let (extension, mime, filename) = match self.verify_type(candidate) {
            TypeVerdict::NotApplicable => return Admission::NotApplicable,
            TypeVerdict::HostResolved { extension, mime } => {
                (extension, mime, candidate.declared_filename().to_string())
            }
            TypeVerdict::Accepted(resolved) => {
                (resolved.extension, resolved.mime, resolved.rename_hint)
            }
            TypeVerdict::Rejected { .. } => {
                return Admission::Rejected(AdmissionError::TypeUnverified)
            }
        };

        if let Err(e) = self.authorize_size(candidate.byte_size, policy) {
            return Admission::Rejected(e);
        }

        Admission::Admitted {
            extension,
            mime,
            filename,
        }
    }

    /// Accepted-types hook: add the managed mapping for permitted callers only.
    ///
    /// Returns whether the mapping was added.
    pub fn register_mime_types(
        &self,
        mimes: &mut BTreeMap<String, String>,
        caller_roles: &HashSet<String>,
        policy: &AccessPolicy,
    ) -> bool {
        if self.evaluate_role(caller_roles, policy).is_err() {
            return false;
        }
        mimes.insert(MANAGED_EXTENSION.to_string(), MIME_PRIMARY.to_string());
        true
    }

    /// Classification hook.
    ///
    /// Returns `tentative` untouched for other extensions or when the host had
    /// already resolved the type. A rejection is reported by setting `error`.
    pub fn check_filetype_and_ext(
        &self,
        tentative: FileClassification,
        path: &Path,
        filename: &str,
        mimes: &BTreeMap<String, String>,
    ) -> FileClassification {
        if extension_of(filename) != MANAGED_EXTENSION {
            return tentative;
        }

        // Without the mapping the caller was never allowed this type.
        if !mimes.contains_key(MANAGED_EXTENSION) {
            return FileClassification {
                error: Some(AdmissionError::RoleDenied.to_string()),
                ..tentative
            };
        }

        let byte_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let candidate =
            UploadCandidate::new(filename, byte_size, path).with_tentative(tentative.clone());

        match self.verify_type(&candidate) {
            TypeVerdict::NotApplicable | TypeVerdict::HostResolved { .. } => tentative,
            TypeVerdict::Accepted(resolved) => FileClassification {
                ext: Some(resolved.extension),
                mime: Some(resolved.mime),
                proper_filename: Some(resolved.rename_hint),
                error: None,
            },
            TypeVerdict::Rejected { message } => {
                warn!("Type verification failed for {}", filename);
                FileClassification {
                    error: Some(message),
                    ..tentative
                }
            }
        }
    }

    /// Pre-storage hook: flag managed uploads above the effective ceiling.
    pub fn prefilter(&self, mut file: UploadFile, policy: &AccessPolicy) -> UploadFile {
        if extension_of(&file.name) != MANAGED_EXTENSION {
            return file;
        }
        if let Err(e) = self.authorize_size(file.size, policy) {
            warn!("{} exceeds the upload ceiling: {}", file.name, e);
            file.error = Some(e.to_string());
        }
        file
    }
}
