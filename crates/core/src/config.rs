use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::policy::{DEFAULT_MAX_MB, DEFAULT_ROLE, MB_IN_BYTES};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub verifier: VerifierSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

/// Persisted admission settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PolicySettings {
    #[serde(default = "default_allowed_roles")]
    pub allowed_roles: Vec<String>,
    #[serde(default = "default_custom_max_size_mb")]
    pub custom_max_size_mb: u64,
    /// The host's own global upload ceiling, in bytes.
    #[serde(default = "default_host_max_upload_bytes")]
    pub host_max_upload_bytes: u64,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            allowed_roles: default_allowed_roles(),
            custom_max_size_mb: default_custom_max_size_mb(),
            host_max_upload_bytes: default_host_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VerifierSettings {
    /// Use content sniffing before the raw signature scan.
    #[serde(default = "default_true")]
    pub sniffing_enabled: bool,
}

impl Default for VerifierSettings {
    fn default() -> Self {
        Self {
            sniffing_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Destination directory for admitted uploads.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    /// Bearer tokens and the roles they carry. Empty = local-only mode.
    #[serde(default)]
    pub tokens: Vec<TokenGrant>,
    /// Roles assumed for every caller in local-only mode.
    #[serde(default = "default_allowed_roles")]
    pub local_roles: Vec<String>,
    /// Types the host accepts on its own (extension -> MIME).
    #[serde(default = "default_accepted_types")]
    pub accepted_types: BTreeMap<String, String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            upload_dir: default_upload_dir(),
            tokens: Vec::new(),
            local_roles: default_allowed_roles(),
            accepted_types: default_accepted_types(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub token: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

fn default_allowed_roles() -> Vec<String> {
    vec![DEFAULT_ROLE.to_string()]
}

fn default_custom_max_size_mb() -> u64 {
    DEFAULT_MAX_MB
}

fn default_host_max_upload_bytes() -> u64 {
    64 * MB_IN_BYTES
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    18790
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_accepted_types() -> BTreeMap<String, String> {
    [
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("gif", "image/gif"),
        ("webp", "image/webp"),
        ("avif", "image/avif"),
        ("pdf", "application/pdf"),
        ("txt", "text/plain"),
    ]
    .into_iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}

impl AppConfig {
    /// Load from `custom_path` (required) or the default path (optional),
    /// overlaid with `AVIFSGATE__SECTION__KEY` environment variables.
    pub fn load(custom_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let required = custom_path.is_some();
        let config_path = custom_path.unwrap_or_else(Self::default_path);

        let s = Config::builder()
            .add_source(File::from(config_path).required(required))
            .add_source(
                Environment::with_prefix("AVIFSGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("policy.allowed_roles")
                    .with_list_parse_key("server.local_roles"),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".avifsgate/config.json")
    }
}
