use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fresh directory under the system temp dir, unique per call.
pub(crate) fn mk_temp_dir(tag: &str) -> PathBuf {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after epoch")
        .as_nanos();
    let path = std::env::temp_dir().join(format!("avifsgate-{tag}-{nonce}"));
    fs::create_dir_all(&path).expect("failed to create temp dir");
    path
}
