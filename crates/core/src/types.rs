use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::MANAGED_EXTENSION;

/// One upload attempt, as seen by the gatekeeper.
///
/// The extension is always derived from the filename so the two can never
/// disagree at the input boundary.
#[derive(Debug, Clone)]
pub struct UploadCandidate {
    declared_filename: String,
    declared_extension: String,
    /// Size of the uploaded payload in bytes.
    pub byte_size: u64,
    /// Where the verifier may read the uploaded bytes from.
    pub path: PathBuf,
    /// Roles of the uploading caller. May be empty.
    pub caller_roles: HashSet<String>,
    /// Classification the host already produced on its own, if any.
    pub tentative: FileClassification,
}

impl UploadCandidate {
    pub fn new(declared_filename: &str, byte_size: u64, path: impl Into<PathBuf>) -> Self {
        Self {
            declared_filename: declared_filename.to_string(),
            declared_extension: extension_of(declared_filename),
            byte_size,
            path: path.into(),
            caller_roles: HashSet::new(),
            tentative: FileClassification::default(),
        }
    }

    /// Builder-style method to set the caller's roles
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.caller_roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style method to attach the host's own classification
    pub fn with_tentative(mut self, tentative: FileClassification) -> Self {
        self.tentative = tentative;
        self
    }

    pub fn declared_filename(&self) -> &str {
        &self.declared_filename
    }

    pub fn declared_extension(&self) -> &str {
        &self.declared_extension
    }

    pub fn claims_managed_type(&self) -> bool {
        self.declared_extension == MANAGED_EXTENSION
    }

    /// Directory the file currently lives in, used to scope rename hints.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// Lower-cased suffix after the last `.` of the final path component.
///
/// Returns an empty string when the name has no extension.
pub fn extension_of(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);
    match base.rsplit_once('.') {
        Some((_, ext)) => ext.to_ascii_lowercase(),
        None => String::new(),
    }
}

/// A file type classification exchanged with the host.
///
/// Mirrors what an upload pipeline typically carries around: an extension,
/// a MIME type, an optional corrected filename and an optional blocking error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileClassification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proper_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileClassification {
    pub fn new(ext: &str, mime: &str) -> Self {
        Self {
            ext: Some(ext.to_string()),
            mime: Some(mime.to_string()),
            ..Default::default()
        }
    }

    /// True when both an extension and a MIME type are present and non-empty.
    pub fn is_resolved(&self) -> bool {
        let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        filled(&self.ext) && filled(&self.mime)
    }
}

/// Fields of an accepted verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedType {
    pub extension: String,
    pub mime: String,
    /// Collision-free filename suggested by the host for the destination directory.
    pub rename_hint: String,
}

/// Outcome of type verification. Produced once per candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum TypeVerdict {
    /// The file does not claim the managed extension.
    NotApplicable,
    /// The host had already classified the file; passed through verbatim.
    HostResolved { extension: String, mime: String },
    /// The extension claim was corroborated by the file's content.
    Accepted(ResolvedType),
    /// The file claims the managed extension but nothing corroborates it.
    Rejected { message: String },
}

/// Upload record handed to the pre-storage hook.
///
/// Setting `error` is how the hook tells the host to abort the upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadFile {
    pub name: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadFile {
    pub fn new(name: &str, size: u64) -> Self {
        Self {
            name: name.to_string(),
            size,
            error: None,
        }
    }
}
