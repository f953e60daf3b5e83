//! Content Registry
//!
//! Tracks files already placed in the output tree so that byte-identical
//! components coming from several artifacts are copied only once. Files are
//! compared by size first; a SHA256 is computed only when sizes collide, and
//! at most once per registered file.

use onejar_common::{OnejarError, OnejarResult};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DIGEST_BUFFER: usize = 32 * 1024;

/// A file known to be in the output tree
#[derive(Debug)]
struct RegisteredFile {
    path: PathBuf,
    size: u64,
    digest: Option<[u8; 32]>,
}

#[derive(Debug, Default)]
pub struct ContentRegistry {
    files: Vec<RegisteredFile>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file; the same path may be registered only once
    pub fn register(&mut self, path: &Path) -> OnejarResult<()> {
        if self.files.iter().any(|f| f.path == path) {
            return Err(OnejarError::DuplicateRegistration(path.to_path_buf()));
        }

        let size = std::fs::metadata(path)?.len();
        self.files.push(RegisteredFile {
            path: path.to_path_buf(),
            size,
            digest: None,
        });

        Ok(())
    }

    /// Register every regular file below `root`
    pub fn register_tree(&mut self, root: &Path) -> OnejarResult<usize> {
        if !root.is_dir() {
            return Ok(0);
        }

        let mut count = 0;
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| OnejarError::Io(e.into()))?;
            if entry.file_type().is_file() {
                self.register(entry.path())?;
                count += 1;
            }
        }

        Ok(count)
    }

    /// Find a registered file with the same size and content as `candidate`
    pub fn find(&mut self, candidate: &Path) -> OnejarResult<Option<PathBuf>> {
        let size = std::fs::metadata(candidate)?.len();

        if !self.files.iter().any(|f| f.size == size) {
            return Ok(None);
        }

        let wanted = digest(candidate)?;

        for file in self.files.iter_mut().filter(|f| f.size == size) {
            let known = match file.digest {
                Some(d) => d,
                None => {
                    let d = digest(&file.path)?;
                    file.digest = Some(d);
                    d
                }
            };
            if known == wanted {
                return Ok(Some(file.path.clone()));
            }
        }

        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn digest(path: &Path) -> OnejarResult<[u8; 32]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_BUFFER];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}
