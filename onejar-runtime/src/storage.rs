//! Process lifecycle glue
//!
//! Temporary storage for the module runtime lives exactly as long as the boot:
//! it is removed when [`TemporaryStorage`] is dropped and, through a signal
//! handler, when the process is terminated.

use anyhow::{Context, Result};
use onejar_common::descriptor;
use onejar_common::layout::keys;
use onejar_common::Properties;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const STORAGE_PREFIX: &str = "onejar";

/// Exit status after a termination signal
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// A private directory removed deepest-first on drop
#[derive(Debug)]
pub struct TemporaryStorage {
    path: PathBuf,
}

impl TemporaryStorage {
    /// Create a fresh directory in the system temporary directory
    pub fn create() -> Result<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn create_in(parent: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(STORAGE_PREFIX)
            .keep(true)
            .tempdir_in(parent)
            .with_context(|| format!("Failed to create temporary storage in {}", parent.display()))?;

        let path = dir.path().to_path_buf();
        tracing::debug!("Temporary storage at {}", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TemporaryStorage {
    fn drop(&mut self) {
        let failures = remove_tree(&self.path);
        if failures == 0 {
            tracing::debug!("Removed temporary storage {}", self.path.display());
        }
    }
}

/// Delete `root` and everything below it, deepest entries first.
///
/// Failures are logged and counted, never returned.
pub fn remove_tree(root: &Path) -> usize {
    if !root.exists() {
        return 0;
    }

    let mut failures = 0;
    for entry in WalkDir::new(root).contents_first(true) {
        let result = match &entry {
            Ok(entry) if entry.file_type().is_dir() => std::fs::remove_dir(entry.path()),
            Ok(entry) => std::fs::remove_file(entry.path()),
            Err(e) => Err(std::io::Error::other(e.to_string())),
        };

        if let Err(e) = result {
            failures += 1;
            tracing::warn!("Failed to remove temporary file: {}", e);
        }
    }

    failures
}

/// Remove `path` and exit with [`SIGNAL_EXIT_CODE`] on SIGINT, SIGTERM or
/// SIGHUP. Only one handler can be installed per process.
pub fn install_signal_cleanup(path: &Path) -> Result<()> {
    let path = path.to_path_buf();
    ctrlc::set_handler(move || {
        remove_tree(&path);
        std::process::exit(SIGNAL_EXIT_CODE);
    })
    .context("Failed to install termination handler")
}

/// Split startup properties into process-wide (`system.`) and runtime
/// (`framework.`) properties, prefixes removed
pub fn partition_properties(props: &Properties) -> (Properties, Properties) {
    let strip = |prefix: &str| {
        props
            .with_prefix(prefix)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<Properties>()
    };

    (strip(keys::SYSTEM_PREFIX), strip(keys::FRAMEWORK_PREFIX))
}

/// Export system properties into the process environment
///
/// Names that cannot be environment variables, and values holding a NUL, are
/// skipped with a warning. Returns the number exported.
pub fn export_system_properties(system: &Properties) -> usize {
    let mut exported = 0;

    for (key, value) in system.iter() {
        if !descriptor::is_valid_property_key(key) || value.contains('\0') {
            tracing::warn!("Skipping unusable system property {:?}", key);
            continue;
        }

        tracing::debug!("System property {}={}", key, value);
        std::env::set_var(key, value);
        exported += 1;
    }

    exported
}
