//! Common test helper functions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use vdesk::config::HealthConfig;

static COUNTER: AtomicU32 = AtomicU32::new(0);

/// Create a unique temporary directory for a test.
///
/// The name carries a timestamp, the process id and a per-process counter so
/// parallel tests never collide. The directory is created immediately.
///
/// # Panics
///
/// Panics if the directory cannot be created.
///
/// # Example
///
/// ```ignore
/// let dir = temp_dir("state");
/// // dir is something like /tmp/vdesk-state-1703520000000-4242-0
/// ```
#[must_use]
pub fn temp_dir(prefix: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    dir.push(format!("vdesk-{prefix}-{stamp}-{}-{seq}", std::process::id()));

    #[allow(clippy::expect_used)]
    fs::create_dir_all(&dir).expect("failed to create temp directory");

    dir
}

/// Write a supervisor configuration to a JSON file.
///
/// # Panics
///
/// Panics if serialization or file writing fails.
pub fn write_config(path: &Path, config: &HealthConfig) {
    #[allow(clippy::expect_used)]
    let data = serde_json::to_vec_pretty(config).expect("failed to serialize config");

    #[allow(clippy::expect_used)]
    fs::write(path, data).expect("failed to write config file");
}
