//! Input artifacts
//!
//! An input artifact is a product export: a directory or a tar archive with a
//! launcher `.ini` at its root, a `configuration/` directory and the component
//! files under `plugins/`. Tar archives are unpacked into a private temporary
//! directory that lives as long as the artifact.

use anyhow::{Context, Result};
use onejar_common::layout::{ARTIFACT_CONFIGURATION_DIR, DEFAULT_LAUNCHER_INI};
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct InputArtifact {
    source: PathBuf,
    root: PathBuf,
    _unpacked: Option<TempDir>,
}

impl InputArtifact {
    /// Open a directory in place, or unpack a tar archive
    pub fn open(source: &Path) -> Result<Self> {
        if source.is_dir() {
            return Ok(Self {
                source: source.to_path_buf(),
                root: source.to_path_buf(),
                _unpacked: None,
            });
        }

        let unpacked = tempfile::Builder::new()
            .prefix("onejar-input")
            .tempdir()
            .context("Failed to create temporary directory for input artifact")?;

        let file = File::open(source)
            .with_context(|| format!("Failed to open input artifact: {}", source.display()))?;
        tar::Archive::new(file)
            .unpack(unpacked.path())
            .with_context(|| format!("Failed to unpack input artifact: {}", source.display()))?;

        tracing::debug!("Unpacked {} to {:?}", source.display(), unpacked.path());

        Ok(Self {
            source: source.to_path_buf(),
            root: unpacked.path().to_path_buf(),
            _unpacked: Some(unpacked),
        })
    }

    /// Path the artifact was opened from
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Directory holding the artifact's contents
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a `/` separated path inside the artifact
    pub fn resolve(&self, rel: &str) -> PathBuf {
        rel.split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .fold(self.root.clone(), |p, s| p.join(s))
    }

    pub fn configuration_dir(&self) -> PathBuf {
        self.root.join(ARTIFACT_CONFIGURATION_DIR)
    }

    /// Pick the launcher `.ini` at the artifact root.
    ///
    /// A single candidate is used whatever its name; among several only the
    /// default name is accepted.
    pub fn launcher_ini(&self) -> Result<Option<PathBuf>> {
        let mut inis = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_file() && path.extension().map(|e| e == "ini").unwrap_or(false) {
                inis.push(path);
            }
        }
        inis.sort();

        let is_default = |p: &PathBuf| p.file_name().map(|n| n == DEFAULT_LAUNCHER_INI).unwrap_or(false);

        match inis.len() {
            0 => Ok(None),
            1 => {
                let ini = inis.remove(0);
                if !is_default(&ini) {
                    tracing::info!("Using '{}' as {}", file_name(&ini), DEFAULT_LAUNCHER_INI);
                }
                Ok(Some(ini))
            }
            _ => match inis.into_iter().find(is_default) {
                Some(ini) => Ok(Some(ini)),
                None => {
                    tracing::warn!(
                        "Multiple candidates for {} found in {}, using neither of them",
                        DEFAULT_LAUNCHER_INI,
                        self.source.display()
                    );
                    Ok(None)
                }
            },
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_open_directory_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = InputArtifact::open(dir.path()).unwrap();
        assert_eq!(artifact.root(), dir.path());
        assert_eq!(artifact.resolve("plugins/a.jar"), dir.path().join("plugins").join("a.jar"));
    }

    #[test]
    fn test_open_tar_archive() {
        let src = tempfile::tempdir().unwrap();
        fs::create_dir_all(src.path().join("plugins")).unwrap();
        fs::write(src.path().join("plugins/a.jar"), b"a").unwrap();

        let out = tempfile::tempdir().unwrap();
        let archive = out.path().join("product.tar");
        let data = onejar_common::payload::create_tar_archive(src.path()).unwrap();
        fs::write(&archive, data).unwrap();

        let artifact = InputArtifact::open(&archive).unwrap();
        assert_eq!(fs::read(artifact.resolve("plugins/a.jar")).unwrap(), b"a");
    }

    #[test]
    fn test_launcher_ini_selection() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = InputArtifact::open(dir.path()).unwrap();
        assert!(artifact.launcher_ini().unwrap().is_none());

        fs::write(dir.path().join("product.ini"), b"").unwrap();
        assert_eq!(artifact.launcher_ini().unwrap(), Some(dir.path().join("product.ini")));

        fs::write(dir.path().join("other.ini"), b"").unwrap();
        assert!(artifact.launcher_ini().unwrap().is_none());

        fs::write(dir.path().join("eclipse.ini"), b"").unwrap();
        assert_eq!(artifact.launcher_ini().unwrap(), Some(dir.path().join("eclipse.ini")));
    }
}
