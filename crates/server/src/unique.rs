use avifsgate_core::verifier::UniqueFilename;
use std::path::Path;

/// Host-side unique filename service backed by the upload directory.
///
/// Sanitizes the client-supplied name, then appends `-1`, `-2`, ... to the
/// stem until nothing in the directory has that name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectoryUniqueFilename;

impl UniqueFilename for DirectoryUniqueFilename {
    fn unique_filename(&self, dir: &Path, filename: &str) -> String {
        let clean = sanitize_filename(filename);
        if !dir.join(&clean).exists() {
            return clean;
        }

        let (stem, ext) = match clean.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), format!(".{ext}")),
            _ => (clean.clone(), String::new()),
        };

        let mut n: u64 = 1;
        loop {
            let candidate = format!("{stem}-{n}{ext}");
            if !dir.join(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Strip directories and anything outside `[A-Za-z0-9._-]`.
///
/// Runs of other characters collapse into a single `-`. Leading dots and
/// dashes are removed so the result can never be hidden or look like a flag.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(filename);

    let mut out = String::with_capacity(base.len());
    let mut last_dash = false;
    for c in base.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
            out.push(c);
            last_dash = c == '-';
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    let trimmed = out.trim_start_matches(['.', '-']).trim_end_matches('-');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}
