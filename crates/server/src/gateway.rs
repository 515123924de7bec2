use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post, put},
    Json, Router,
};
use avifsgate_core::config::{AppConfig, ServerSettings};
use avifsgate_core::gatekeeper::{Admission, Gatekeeper};
use avifsgate_core::metrics::{MetricsSnapshot, MetricsStore};
use avifsgate_core::policy::AccessPolicy;
use avifsgate_core::types::{extension_of, FileClassification, UploadCandidate, UploadFile};
use avifsgate_core::verifier::UniqueFilename;
use avifsgate_core::AdmissionError;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::unique::DirectoryUniqueFilename;

/// Extra room on top of the host ceiling for multipart framing.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// How many destination names are tried before giving up on a crowded name.
const MAX_NAME_CLAIMS: usize = 16;

#[derive(Clone)]
struct AppState {
    config: Arc<RwLock<AppConfig>>,
    /// Source the config was loaded from; re-read on reload.
    config_path: Option<PathBuf>,
    metrics: Arc<MetricsStore>,
    namer: Arc<dyn UniqueFilename>,
}

impl AppState {
    /// A gatekeeper reflecting the current verifier settings.
    fn gatekeeper(&self, config: &AppConfig) -> Gatekeeper {
        Gatekeeper::from_settings(&config.verifier, self.namer.clone())
            .with_metrics(self.metrics.clone())
    }
}

pub struct Gateway {
    config: AppConfig,
    config_path: Option<PathBuf>,
    metrics: Arc<MetricsStore>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UploadResponse {
    pub id: String,
    /// Name the file was stored under.
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

/// Why the host refused to store an upload.
#[derive(Debug, Error)]
pub enum UploadRejection {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("Sorry, this file type is not permitted ({0}).")]
    UnsupportedType(String),
    #[error("Empty file")]
    Empty,
    #[error("{0}")]
    TooLarge(String),
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadRejection {
    fn status(&self) -> StatusCode {
        match self {
            UploadRejection::Admission(AdmissionError::RoleDenied) => StatusCode::FORBIDDEN,
            UploadRejection::Admission(AdmissionError::SizeExceeded { .. })
            | UploadRejection::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            UploadRejection::Admission(AdmissionError::TypeUnverified)
            | UploadRejection::UnsupportedType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            UploadRejection::Empty => StatusCode::BAD_REQUEST,
            UploadRejection::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            UploadRejection::Admission(e) => e.code(),
            UploadRejection::UnsupportedType(_) => "unsupported_type",
            UploadRejection::Empty => "empty_file",
            UploadRejection::TooLarge(_) => "size_exceeded",
            UploadRejection::Io(_) => "storage_error",
        }
    }

    fn into_response(self) -> (StatusCode, Json<ErrorResponse>) {
        (
            self.status(),
            Json(ErrorResponse {
                code: self.code(),
                error: self.to_string(),
            }),
        )
    }
}

impl Gateway {
    pub fn new(config: AppConfig, config_path: Option<PathBuf>, metrics: Arc<MetricsStore>) -> Self {
        Self {
            config,
            config_path,
            metrics,
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let upload_dir = self.config.server.upload_dir.clone();
        tokio::fs::create_dir_all(&upload_dir).await?;

        let state = AppState {
            config: Arc::new(RwLock::new(self.config.clone())),
            config_path: self.config_path.clone(),
            metrics: self.metrics.clone(),
            namer: Arc::new(DirectoryUniqueFilename),
        };

        // Body limit is fixed at startup; a reload only tightens via the policy checks.
        let max_body = usize::try_from(self.config.policy.host_max_upload_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(MULTIPART_OVERHEAD_BYTES);

        let app = router(state, max_body);

        // Security: bind to localhost-only if no tokens configured
        let addr = if self.config.server.tokens.is_empty() {
            warn!("No gateway tokens configured, binding to 127.0.0.1 only");
            SocketAddr::from(([127, 0, 0, 1], self.config.server.port))
        } else {
            SocketAddr::from(([0, 0, 0, 0], self.config.server.port))
        };

        info!("Gateway listening on {} (uploads in {})", addr, upload_dir.display());

        let listener = TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

fn router(state: AppState, max_body: usize) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/upload", post(upload_file))
        .route("/api/upload/types", get(accepted_types))
        .route("/api/control/reload", put(reload_config))
        .route("/api/monitor/metrics", get(get_metrics))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

/// Resolve the caller's roles from the bearer token.
///
/// With no tokens configured every caller is local and gets `local_roles`.
fn resolve_caller_roles(
    server: &ServerSettings,
    headers: &HeaderMap,
) -> Result<HashSet<String>, StatusCode> {
    if server.tokens.is_empty() {
        return Ok(server.local_roles.iter().cloned().collect());
    }

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let provided_token = auth_header.strip_prefix("Bearer ").unwrap_or("");

    match server
        .tokens
        .iter()
        .find(|grant| !provided_token.is_empty() && grant.token == provided_token)
    {
        Some(grant) => Ok(grant.roles.iter().cloned().collect()),
        None => {
            warn!("Unauthorized gateway access attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn unauthorized(code: StatusCode) -> (StatusCode, Json<ErrorResponse>) {
    (
        code,
        Json(ErrorResponse {
            error: "Unauthorized".to_string(),
            code: "unauthorized",
        }),
    )
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/upload/types: the host's accepted types as seen by this caller
async fn accepted_types(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<BTreeMap<String, String>>, StatusCode> {
    let config = state.config.read().await.clone();
    let roles = resolve_caller_roles(&config.server, &headers)?;
    let policy = AccessPolicy::from_settings(&config.policy);

    let mut mimes = config.server.accepted_types.clone();
    state
        .gatekeeper(&config)
        .register_mime_types(&mut mimes, &roles, &policy);
    Ok(Json(mimes))
}

/// POST /api/upload
async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, (StatusCode, Json<ErrorResponse>)> {
    let config = state.config.read().await.clone();
    let roles = resolve_caller_roles(&config.server, &headers).map_err(unauthorized)?;
    let policy = AccessPolicy::from_settings(&config.policy);
    let gatekeeper = state.gatekeeper(&config);
    let upload_dir = config.server.upload_dir.clone();

    // Only process the first field
    let Some(mut field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
                code: "bad_request",
            }),
        )
    })?
    else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "No file uploaded".to_string(),
                code: "bad_request",
            }),
        ));
    };

    let filename = field.file_name().unwrap_or("upload.bin").to_string();

    tokio::fs::create_dir_all(&upload_dir)
        .await
        .map_err(|e| UploadRejection::Io(e).into_response())?;
    let staging = upload_dir.join(format!(".staging-{}", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&staging)
        .await
        .map_err(|e| UploadRejection::Io(e).into_response())?;

    let mut size: u64 = 0;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&staging).await;
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: e.to_string(),
                        code: "bad_request",
                    }),
                ));
            }
        };
        size += chunk.len() as u64;

        // Abort as soon as the running size crosses a ceiling.
        let checked = gatekeeper.prefilter(UploadFile::new(&filename, size), &policy);
        let over_limit = match checked.error {
            Some(message) => Some(UploadRejection::TooLarge(message)),
            None if size > policy.host_global_max_bytes => Some(UploadRejection::TooLarge(
                "File exceeds the server upload limit".to_string(),
            )),
            None => None,
        };
        if let Some(rejection) = over_limit {
            drop(file);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(rejection.into_response());
        }

        if let Err(e) = file.write_all(&chunk).await {
            drop(file);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(UploadRejection::Io(e).into_response());
        }
    }

    if let Err(e) = file.flush().await {
        drop(file);
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(UploadRejection::Io(e).into_response());
    }
    drop(file);

    // Verification and the final move touch the filesystem synchronously.
    let namer = state.namer.clone();
    let committed = tokio::task::spawn_blocking(move || {
        let result = commit_upload(
            &gatekeeper,
            namer.as_ref(),
            &config.server,
            &policy,
            &roles,
            &staging,
            &filename,
            size,
        );
        if result.is_err() {
            if let Err(e) = std::fs::remove_file(&staging) {
                error!("Failed to remove staging file {}: {}", staging.display(), e);
            }
        }
        result
    })
    .await;

    match committed {
        Ok(Ok(response)) => Ok(Json(response)),
        Ok(Err(rejection)) => Err(rejection.into_response()),
        Err(e) => {
            error!("Upload commit task failed: {}", e);
            Err(UploadRejection::Io(std::io::Error::new(ErrorKind::Other, e.to_string()))
                .into_response())
        }
    }
}

/// Decide on a fully staged upload and move it into place.
///
/// Files of the managed type go through the gatekeeper; everything else is
/// checked against the host's own accepted types.
#[allow(clippy::too_many_arguments)]
pub fn commit_upload(
    gatekeeper: &Gatekeeper,
    namer: &dyn UniqueFilename,
    server: &ServerSettings,
    policy: &AccessPolicy,
    roles: &HashSet<String>,
    staging: &Path,
    filename: &str,
    size: u64,
) -> Result<UploadResponse, UploadRejection> {
    if size == 0 {
        return Err(UploadRejection::Empty);
    }

    let upload_dir = staging.parent().unwrap_or_else(|| Path::new("."));
    let ext = extension_of(filename);
    let mut candidate =
        UploadCandidate::new(filename, size, staging).with_roles(roles.iter().cloned());

    // The host's own classification, before any gatekeeper mapping is added.
    if let Some(mime) = server.accepted_types.get(&ext) {
        candidate = candidate.with_tentative(FileClassification::new(&ext, mime));
    }

    let (preferred, mime) = match gatekeeper.admit(&candidate, policy) {
        Admission::Admitted {
            mime,
            filename: stored_as,
            ..
        } => (stored_as, mime),
        Admission::Rejected(e) => return Err(e.into()),
        Admission::NotApplicable => {
            let mime = candidate
                .tentative
                .mime
                .clone()
                .ok_or_else(|| UploadRejection::UnsupportedType(ext.clone()))?;
            (filename.to_string(), mime)
        }
    };

    let stored_name = store_staged(namer, upload_dir, staging, &preferred)?;
    info!("Stored upload {} as {}", filename, stored_name);

    Ok(UploadResponse {
        id: Uuid::new_v4().to_string(),
        filename: stored_name,
        mime_type: mime,
        size_bytes: size,
    })
}

/// Move the staged file under a name nobody else holds.
///
/// The name is claimed with a hard link, which fails instead of replacing an
/// existing file, so two uploads racing for the same name both survive.
fn store_staged(
    namer: &dyn UniqueFilename,
    dir: &Path,
    staging: &Path,
    preferred: &str,
) -> Result<String, UploadRejection> {
    for _ in 0..MAX_NAME_CLAIMS {
        let name = namer.unique_filename(dir, preferred);
        match std::fs::hard_link(staging, dir.join(&name)) {
            Ok(()) => {
                if let Err(e) = std::fs::remove_file(staging) {
                    warn!("Failed to remove staging file {}: {}", staging.display(), e);
                }
                return Ok(name);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("{} was taken before it could be claimed, picking another name", name);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(UploadRejection::Io(std::io::Error::new(
        ErrorKind::AlreadyExists,
        format!("no free name for {} after {} attempts", preferred, MAX_NAME_CLAIMS),
    )))
}

async fn reload_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, StatusCode> {
    {
        let config = state.config.read().await;
        resolve_caller_roles(&config.server, &headers)?;
    }
    info!("Control request: Config reload triggered");

    let fresh = AppConfig::load(state.config_path.clone()).map_err(|e| {
        error!("Config reload failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    *state.config.write().await = fresh;
    Ok(Json(json!({ "status": "reloaded" })))
}

async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MetricsSnapshot>, StatusCode> {
    {
        let config = state.config.read().await;
        resolve_caller_roles(&config.server, &headers)?;
    }
    Ok(Json(state.metrics.snapshot()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mk_temp_dir;
    use avifsgate_core::config::{TokenGrant, VerifierSettings};
    use avifsgate_core::verifier::TypeVerifier;
    use axum::body::Body;
    use axum::extract::FromRequest;
    use axum::http::{header, HeaderValue, Request};
    use std::fs;
    use std::time::Duration;

    const BOUNDARY: &str = "avifsgate-test-boundary";

    /// Picks a free name, then stalls so a concurrent upload can pick the same one.
    struct SlowNamer;

    impl UniqueFilename for SlowNamer {
        fn unique_filename(&self, dir: &Path, filename: &str) -> String {
            let name = DirectoryUniqueFilename.unique_filename(dir, filename);
            std::thread::sleep(Duration::from_millis(100));
            name
        }
    }

    fn state_for(config: AppConfig, config_path: Option<PathBuf>) -> AppState {
        AppState {
            config: Arc::new(RwLock::new(config)),
            config_path,
            metrics: MetricsStore::new(),
            namer: Arc::new(DirectoryUniqueFilename),
        }
    }

    fn config_in(upload_dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.upload_dir = upload_dir.to_path_buf();
        config
    }

    async fn multipart_request(
        filename: &str,
        bytes: &[u8],
        token: Option<&str>,
    ) -> (HeaderMap, Multipart) {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            );
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body)).expect("build request");
        let headers = request.headers().clone();
        let multipart = Multipart::from_request(request, &())
            .await
            .expect("multipart body");
        (headers, multipart)
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = match fs::read_dir(dir) {
            Ok(read) => read
                .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    fn stage(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join(format!(".staging-{}", Uuid::new_v4()));
        fs::write(&path, bytes).expect("write staging file");
        path
    }

    fn avifs_bytes() -> Vec<u8> {
        let mut bytes = vec![0x00, 0x00, 0x00, 0x1c];
        bytes.extend_from_slice(b"ftypavif");
        bytes.resize(1024, 0);
        bytes
    }

    const MB: u64 = 1024 * 1024;

    fn roles(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn gatekeeper() -> Gatekeeper {
        Gatekeeper::from_settings(
            &VerifierSettings {
                sniffing_enabled: false,
            },
            Arc::new(DirectoryUniqueFilename),
        )
    }

    #[test]
    fn local_mode_uses_local_roles() {
        let server = ServerSettings::default();
        let resolved = resolve_caller_roles(&server, &HeaderMap::new()).expect("local mode");
        assert!(resolved.contains("administrator"));
    }

    #[test]
    fn bearer_token_maps_to_roles() {
        let server = ServerSettings {
            tokens: vec![TokenGrant {
                token: "tok-editor".to_string(),
                roles: vec!["editor".to_string()],
            }],
            ..Default::default()
        };

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-editor"));
        assert_eq!(
            resolve_caller_roles(&server, &headers).expect("known token"),
            roles(&["editor"])
        );

        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert_eq!(
            resolve_caller_roles(&server, &headers),
            Err(StatusCode::UNAUTHORIZED)
        );
        assert_eq!(
            resolve_caller_roles(&server, &HeaderMap::new()),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn verified_avifs_is_stored_under_unique_name() {
        let dir = mk_temp_dir("gateway-commit");
        fs::write(dir.join("clip.avifs"), b"existing").expect("write existing");
        let staging = stage(&dir, &avifs_bytes());

        let response = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &roles(&["administrator"]),
            &staging,
            "clip.avifs",
            1024,
        )
        .expect("upload should be admitted");

        assert_eq!(response.filename, "clip-1.avifs");
        assert_eq!(response.mime_type, "image/avif");
        assert!(dir.join("clip-1.avifs").exists());
        assert!(!staging.exists());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn renamed_payload_is_rejected_as_unsupported_media() {
        let dir = mk_temp_dir("gateway-spoof");
        let staging = stage(&dir, b"<?php system($_GET['c']); ?>");

        let err = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &roles(&["administrator"]),
            &staging,
            "shell.avifs",
            28,
        )
        .expect_err("spoofed file must be rejected");

        assert_eq!(err.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(err.to_string(), "Invalid AVIFS file");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn role_denial_maps_to_forbidden() {
        let dir = mk_temp_dir("gateway-forbidden");
        let staging = stage(&dir, &avifs_bytes());

        let err = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &roles(&["subscriber"]),
            &staging,
            "clip.avifs",
            1024,
        )
        .expect_err("subscriber must be denied");

        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "role_denied");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn host_types_are_stored_without_gatekeeper_checks() {
        let dir = mk_temp_dir("gateway-host-type");
        let staging = stage(&dir, b"hello");

        let response = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &HashSet::new(),
            &staging,
            "notes.txt",
            5,
        )
        .expect("text files are accepted by the host");
        assert_eq!(response.filename, "notes.txt");
        assert_eq!(response.mime_type, "text/plain");

        let unknown = stage(&dir, b"MZ");
        let err = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &HashSet::new(),
            &unknown,
            "tool.exe",
            2,
        )
        .expect_err("unknown types are refused");
        assert_eq!(err.code(), "unsupported_type");

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn empty_upload_is_rejected() {
        let dir = mk_temp_dir("gateway-empty");
        let staging = stage(&dir, b"");
        let err = commit_upload(
            &gatekeeper(),
            &DirectoryUniqueFilename,
            &ServerSettings::default(),
            &AccessPolicy::default(),
            &roles(&["administrator"]),
            &staging,
            "clip.avifs",
            0,
        )
        .expect_err("empty upload");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_uploads_of_same_name_both_survive() {
        let dir = mk_temp_dir("gateway-race");
        let keeper = Gatekeeper::new(TypeVerifier::new(Arc::new(SlowNamer)));
        let server = ServerSettings::default();
        let policy = AccessPolicy::default();
        let admins = roles(&["administrator"]);

        let mut first = avifs_bytes();
        first[1023] = 1;
        let mut second = avifs_bytes();
        second[1023] = 2;
        let stagings = [stage(&dir, &first), stage(&dir, &second)];

        let (keeper, server, policy, admins) = (&keeper, &server, &policy, &admins);
        let stored: Vec<String> = std::thread::scope(|scope| {
            let handles: Vec<_> = stagings
                .iter()
                .map(|staging| {
                    scope.spawn(move || {
                        commit_upload(
                            keeper,
                            &SlowNamer,
                            server,
                            policy,
                            admins,
                            staging,
                            "clip.avifs",
                            1024,
                        )
                        .expect("both uploads are admitted")
                        .filename
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("upload thread"))
                .collect()
        });

        assert_ne!(stored[0], stored[1]);
        let mut contents: Vec<Vec<u8>> = stored
            .iter()
            .map(|name| fs::read(dir.join(name)).expect("stored file"))
            .collect();
        contents.sort();
        assert_eq!(contents, vec![first, second]);
        assert!(stagings.iter().all(|s| !s.exists()));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn oversized_streams_are_cut_off_and_cleaned_up() {
        let dir = mk_temp_dir("gateway-oversized");
        let mut config = config_in(&dir);
        config.policy.host_max_upload_bytes = MB + MB / 2;
        let state = state_for(config, None);

        let mut bytes = avifs_bytes();
        bytes.resize((MB + 3 * MB / 4) as usize, 0);

        let (headers, multipart) = multipart_request("clip.avifs", &bytes, None).await;
        let (status, Json(body)) = upload_file(State(state.clone()), headers, multipart)
            .await
            .expect_err("avifs over the ceiling");
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.code, "size_exceeded");
        assert_eq!(body.error, "AVIF Sequence files must be smaller than 1 MB.");
        assert!(entries(&dir).is_empty());

        let (headers, multipart) = multipart_request("scan.png", &bytes, None).await;
        let (status, Json(body)) = upload_file(State(state), headers, multipart)
            .await
            .expect_err("png over the host limit");
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.error, "File exceeds the server upload limit");
        assert!(entries(&dir).is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn rejected_uploads_leave_no_files_behind() {
        let dir = mk_temp_dir("gateway-cleanup");
        let state = state_for(config_in(&dir), None);

        let cases: [(&str, Vec<u8>, StatusCode, &str); 3] = [
            (
                "shell.avifs",
                b"<?php echo 1; ?>".to_vec(),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "type_unverified",
            ),
            ("tool.exe", b"MZ".to_vec(), StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_type"),
            ("clip.avifs", Vec::new(), StatusCode::BAD_REQUEST, "empty_file"),
        ];
        for (name, bytes, expected_status, expected_code) in cases {
            let (headers, multipart) = multipart_request(name, &bytes, None).await;
            let (status, Json(body)) = upload_file(State(state.clone()), headers, multipart)
                .await
                .expect_err("upload must be refused");
            assert_eq!(status, expected_status, "{name}");
            assert_eq!(body.code, expected_code, "{name}");
            assert!(entries(&dir).is_empty(), "{name} left files behind");
        }

        // Role denial, with a caller the policy does not know.
        let mut config = config_in(&dir);
        config.server.local_roles = vec!["subscriber".to_string()];
        let state = state_for(config, None);
        let (headers, multipart) = multipart_request("clip.avifs", &avifs_bytes(), None).await;
        let (status, Json(body)) = upload_file(State(state), headers, multipart)
            .await
            .expect_err("subscriber is denied");
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.error, "Sorry, you are not allowed to upload AVIF Sequence files.");
        assert!(entries(&dir).is_empty());

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn wrong_bearer_token_is_unauthorized() {
        let dir = mk_temp_dir("gateway-auth");
        let mut config = config_in(&dir);
        config.server.tokens = vec![
            TokenGrant {
                token: "tok-admin".to_string(),
                roles: vec!["administrator".to_string()],
            },
            TokenGrant {
                token: "tok-editor".to_string(),
                roles: vec!["editor".to_string()],
            },
        ];
        let state = state_for(config, None);

        let (headers, multipart) =
            multipart_request("clip.avifs", &avifs_bytes(), Some("tok-wrong")).await;
        let (status, Json(body)) = upload_file(State(state.clone()), headers, multipart)
            .await
            .expect_err("unknown token");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "unauthorized");
        assert!(entries(&dir).is_empty());

        let mut wrong = HeaderMap::new();
        wrong.insert("authorization", HeaderValue::from_static("Bearer tok-wrong"));
        assert_eq!(
            accepted_types(State(state.clone()), wrong.clone())
                .await
                .expect_err("unknown token"),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            reload_config(State(state.clone()), wrong)
                .await
                .expect_err("unknown token"),
            StatusCode::UNAUTHORIZED
        );

        let mut admin = HeaderMap::new();
        admin.insert("authorization", HeaderValue::from_static("Bearer tok-admin"));
        let Json(types) = accepted_types(State(state.clone()), admin)
            .await
            .expect("admin token");
        assert_eq!(types.get("avifs").map(String::as_str), Some("image/avif"));

        let mut editor = HeaderMap::new();
        editor.insert("authorization", HeaderValue::from_static("Bearer tok-editor"));
        let Json(types) = accepted_types(State(state), editor)
            .await
            .expect("editor token");
        assert!(!types.contains_key("avifs"));
        assert!(types.contains_key("png"));

        let _ = fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn reload_applies_new_policy_to_next_upload() {
        let dir = mk_temp_dir("gateway-reload");
        let uploads = dir.join("uploads");
        let config_path = dir.join("config.json");

        let mut config = config_in(&uploads);
        config.server.local_roles = vec!["editor".to_string()];
        fs::write(&config_path, serde_json::to_string(&config).expect("serialize config"))
            .expect("write config");
        let state = state_for(config.clone(), Some(config_path.clone()));

        let (headers, multipart) = multipart_request("clip.avifs", &avifs_bytes(), None).await;
        let (status, _) = upload_file(State(state.clone()), headers, multipart)
            .await
            .expect_err("editors are not allowed yet");
        assert_eq!(status, StatusCode::FORBIDDEN);

        config.policy.allowed_roles = vec!["editor".to_string()];
        fs::write(&config_path, serde_json::to_string(&config).expect("serialize config"))
            .expect("rewrite config");
        reload_config(State(state.clone()), HeaderMap::new())
            .await
            .expect("reload succeeds");

        let (headers, multipart) = multipart_request("clip.avifs", &avifs_bytes(), None).await;
        let Json(response) = upload_file(State(state), headers, multipart)
            .await
            .expect("editors are allowed after reload");
        assert_eq!(response.filename, "clip.avifs");
        assert_eq!(response.mime_type, "image/avif");
        assert!(uploads.join("clip.avifs").exists());

        let _ = fs::remove_dir_all(dir);
    }
}
