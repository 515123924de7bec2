use avifsgate_core::{MANAGED_EXTENSION, MIME_PRIMARY};
use regex::Regex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

pub const BLOCK_BEGIN: &str = "# BEGIN avifsgate";
pub const BLOCK_END: &str = "# END avifsgate";

#[derive(Debug, Error)]
pub enum HtaccessError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid block pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Created,
    Appended,
    AlreadyPresent,
    /// The uploads directory is missing or read-only; nothing was written.
    NotWritable,
}

/// The managed block: serve `.avifs` as AVIF and stop browsers from sniffing.
pub fn rules_block() -> String {
    format!(
        "\n{BLOCK_BEGIN}\n\
         <IfModule mod_mime.c>\n\
         \x20 AddType {MIME_PRIMARY} .{MANAGED_EXTENSION}\n\
         </IfModule>\n\
         <IfModule mod_headers.c>\n\
         \x20 Header set X-Content-Type-Options \"nosniff\"\n\
         </IfModule>\n\
         {BLOCK_END}\n"
    )
}

/// Remove every managed block, along with the newline before and after it.
pub fn strip_block(content: &str) -> Result<String, regex::Error> {
    let pattern = format!(
        r"(?s)\n?{}.*?{}\n?",
        regex::escape(BLOCK_BEGIN),
        regex::escape(BLOCK_END)
    );
    let re = Regex::new(&pattern)?;
    Ok(re.replace_all(content, "").into_owned())
}

pub fn htaccess_path(uploads_dir: &Path) -> PathBuf {
    uploads_dir.join(".htaccess")
}

fn is_writable_dir(dir: &Path) -> bool {
    std::fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> HtaccessError + '_ {
    move |source| HtaccessError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Append the managed block to `<uploads_dir>/.htaccess` unless it is already there.
pub fn install(uploads_dir: &Path) -> Result<InstallOutcome, HtaccessError> {
    if !is_writable_dir(uploads_dir) {
        warn!(
            "Uploads directory {} is not writable, skipping .htaccess rules",
            uploads_dir.display()
        );
        return Ok(InstallOutcome::NotWritable);
    }

    let path = htaccess_path(uploads_dir);
    if !path.exists() {
        std::fs::write(&path, rules_block()).map_err(io_err(&path))?;
        info!("Created {} with AVIFS rules", path.display());
        return Ok(InstallOutcome::Created);
    }

    let current = std::fs::read_to_string(&path).map_err(io_err(&path))?;
    if current.contains(BLOCK_BEGIN) {
        return Ok(InstallOutcome::AlreadyPresent);
    }

    std::fs::write(&path, current + &rules_block()).map_err(io_err(&path))?;
    info!("Appended AVIFS rules to {}", path.display());
    Ok(InstallOutcome::Appended)
}

/// Remove the managed block. Returns whether the file changed.
pub fn uninstall(uploads_dir: &Path) -> Result<bool, HtaccessError> {
    let path = htaccess_path(uploads_dir);
    if !path.exists() {
        return Ok(false);
    }

    let content = std::fs::read_to_string(&path).map_err(io_err(&path))?;
    let cleaned = strip_block(&content)?;
    if cleaned == content {
        return Ok(false);
    }

    std::fs::write(&path, cleaned).map_err(io_err(&path))?;
    info!("Removed AVIFS rules from {}", path.display());
    Ok(true)
}
