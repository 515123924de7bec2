//! Content-based verification of files claiming the managed extension.
//!
//! The extension in a filename is attacker-controlled, so a claim is only
//! honoured when the file's bytes back it up. Two independent checks are
//! layered: a MIME sniffer (fast, may be unavailable) and a raw scan of the
//! file header for the `ftypavif` brand marker (always available).
//!
//! Both can be satisfied by hand-crafted bytes. This stops casual renaming
//! of arbitrary files to `.avifs`; it does not prove the payload is a
//! well-formed AVIF sequence.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::types::{ResolvedType, TypeVerdict, UploadCandidate};
use crate::{AdmissionError, MANAGED_EXTENSION, MIME_PRIMARY};

/// Marker of an AVIF-family file type box.
pub const SIGNATURE: &[u8] = b"ftypavif";

/// Number of leading bytes searched for [`SIGNATURE`].
pub const HEADER_SCAN_LEN: usize = 256;

/// Content-based MIME detection.
pub trait MimeSniffer: Send + Sync {
    /// Detected MIME type, or `None` when detection is inconclusive or fails.
    fn sniff(&self, path: &Path) -> Option<String>;
}

/// Sniffer backed by the `infer` magic-number tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct InferSniffer;

impl MimeSniffer for InferSniffer {
    fn sniff(&self, path: &Path) -> Option<String> {
        match infer::get_from_path(path) {
            Ok(kind) => kind.map(|k| k.mime_type().to_string()),
            Err(e) => {
                debug!("MIME sniffing failed for {}: {}", path.display(), e);
                None
            }
        }
    }
}

/// Host service producing a filename that does not collide with anything
/// already in `dir`.
pub trait UniqueFilename: Send + Sync {
    fn unique_filename(&self, dir: &Path, filename: &str) -> String;
}

/// Whether a sniffed MIME type belongs to the AVIF family.
///
/// Prefix match, so `image/avif`, `image/avif-sequence` and future variants
/// all count.
pub fn is_avif_mime(mime: &str) -> bool {
    mime.trim().to_ascii_lowercase().starts_with(MIME_PRIMARY)
}

/// Whether [`SIGNATURE`] occurs anywhere in the first [`HEADER_SCAN_LEN`] bytes.
pub fn contains_signature(bytes: &[u8]) -> bool {
    let header = &bytes[..bytes.len().min(HEADER_SCAN_LEN)];
    header.windows(SIGNATURE.len()).any(|w| w == SIGNATURE)
}

/// Read the file header and look for [`SIGNATURE`].
/// An unreadable file yields `false`.
pub fn scan_signature(path: &Path) -> bool {
    let mut header = Vec::with_capacity(HEADER_SCAN_LEN);
    let read = File::open(path)
        .and_then(|f| f.take(HEADER_SCAN_LEN as u64).read_to_end(&mut header));
    match read {
        Ok(_) => contains_signature(&header),
        Err(e) => {
            debug!("Signature scan could not read {}: {}", path.display(), e);
            false
        }
    }
}

pub struct TypeVerifier {
    sniffer: Option<Arc<dyn MimeSniffer>>,
    namer: Arc<dyn UniqueFilename>,
}

impl TypeVerifier {
    /// A verifier without content sniffing; only the signature scan runs.
    pub fn new(namer: Arc<dyn UniqueFilename>) -> Self {
        Self {
            sniffer: None,
            namer,
        }
    }

    pub fn with_sniffer(mut self, sniffer: Arc<dyn MimeSniffer>) -> Self {
        self.sniffer = Some(sniffer);
        self
    }

    pub fn verify(&self, candidate: &UploadCandidate) -> TypeVerdict {
        if !candidate.claims_managed_type() {
            return TypeVerdict::NotApplicable;
        }

        // A classification the host already trusts wins over our own checks.
        if candidate.tentative.is_resolved() {
            return TypeVerdict::HostResolved {
                extension: candidate.tentative.ext.clone().unwrap_or_default(),
                mime: candidate.tentative.mime.clone().unwrap_or_default(),
            };
        }

        if !self.corroborate(&candidate.path) {
            return TypeVerdict::Rejected {
                message: AdmissionError::TypeUnverified.to_string(),
            };
        }

        let rename_hint = self
            .namer
            .unique_filename(candidate.directory(), candidate.declared_filename());

        TypeVerdict::Accepted(ResolvedType {
            extension: MANAGED_EXTENSION.to_string(),
            mime: MIME_PRIMARY.to_string(),
            rename_hint,
        })
    }

    fn corroborate(&self, path: &Path) -> bool {
        if let Some(sniffer) = &self.sniffer {
            match sniffer.sniff(path) {
                Some(mime) if is_avif_mime(&mime) => {
                    debug!("Sniffed {} for {}", mime, path.display());
                    return true;
                }
                Some(mime) => debug!("Sniffed non-AVIF type {} for {}", mime, path.display()),
                None => debug!("Sniffer inconclusive for {}", path.display()),
            }
        }

        let found = scan_signature(path);
        debug!(
            "Signature scan for {}: {}",
            path.display(),
            if found { "found" } else { "absent" }
        );
        found
    }
}
