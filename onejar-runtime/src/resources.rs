//! Resource access layer
//!
//! The bootstrap loader sees the packaged archive through a [`Classpath`]: an
//! ordered list of payload-carrying executables, plain tar archives and
//! directories. Archive entries are indexed once and read in place by offset,
//! so nothing is extracted to disk. The same lookup backs the `embedded`
//! scheme handed to the module runtime.

use crate::runtime::ResourceHandler;
use anyhow::{Context, Result};
use onejar_common::{layout, payload};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Position of one regular file inside an archive
#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: u64,
    size: u64,
}

/// A tar archive, possibly embedded in an executable, indexed by entry name
#[derive(Debug)]
pub struct EmbeddedArchive {
    path: PathBuf,
    entries: HashMap<String, EntryLocation>,
}

impl EmbeddedArchive {
    /// Index the payload appended to an assembled executable
    pub fn open_executable(path: &Path) -> Result<Self> {
        let info = payload::read_payload_info(path)?;
        let reader = payload::open_payload_reader(&info)?;
        let entries = index_entries(reader, info.payload_offset)
            .with_context(|| format!("Failed to index payload of {}", path.display()))?;

        tracing::debug!("Indexed {} payload entries in {}", entries.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Index a plain tar archive
    pub fn open_tar(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open archive: {}", path.display()))?;
        let entries = index_entries(BufReader::new(file), 0)
            .with_context(|| format!("Failed to index {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open the entry `name` for reading
    pub fn open_entry(&self, name: &str) -> io::Result<Box<dyn Read>> {
        let location = self.entries.get(name).ok_or_else(|| not_found(name))?;

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(location.offset))?;

        Ok(Box::new(BufReader::new(file).take(location.size)))
    }
}

fn index_entries<R: Read>(reader: R, base_offset: u64) -> Result<HashMap<String, EntryLocation>> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = HashMap::new();

    for entry in archive.entries()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = layout::to_uri_path(&entry.path()?);
        entries.insert(
            name,
            EntryLocation {
                offset: base_offset + entry.raw_file_position(),
                size: entry.size(),
            },
        );
    }

    Ok(entries)
}

/// One element of the classpath
#[derive(Debug)]
pub enum ClasspathEntry {
    Archive(EmbeddedArchive),
    Directory(PathBuf),
}

impl ClasspathEntry {
    /// Classify `path` as a directory, an assembled executable or a tar archive
    pub fn open(path: &Path) -> Result<Self> {
        if path.is_dir() {
            Ok(Self::Directory(path.to_path_buf()))
        } else if payload::has_payload(path) {
            Ok(Self::Archive(EmbeddedArchive::open_executable(path)?))
        } else {
            Ok(Self::Archive(EmbeddedArchive::open_tar(path)?))
        }
    }

    fn open_resource(&self, name: &str) -> io::Result<Box<dyn Read>> {
        match self {
            Self::Archive(archive) => archive.open_entry(name),
            Self::Directory(root) => {
                let path = resolve_in_directory(root, name).ok_or_else(|| not_found(name))?;
                if !path.is_file() {
                    return Err(not_found(name));
                }
                Ok(Box::new(BufReader::new(File::open(path)?)))
            }
        }
    }

    fn contains(&self, name: &str) -> bool {
        match self {
            Self::Archive(archive) => archive.contains(name),
            Self::Directory(root) => resolve_in_directory(root, name)
                .map(|p| p.is_file())
                .unwrap_or(false),
        }
    }
}

/// Join a `/` separated name onto `root`, refusing anything but plain segments
fn resolve_in_directory(root: &Path, name: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("resource not found: {}", name))
}

/// Ordered lookup across several classpath entries; the first match wins
#[derive(Debug, Default)]
pub struct Classpath {
    entries: Vec<ClasspathEntry>,
}

impl Classpath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open every path as a classpath entry, in order
    pub fn from_paths(paths: &[PathBuf]) -> Result<Self> {
        let mut classpath = Self::new();
        for path in paths {
            classpath.push(ClasspathEntry::open(path)?);
        }
        Ok(classpath)
    }

    pub fn push(&mut self, entry: ClasspathEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.contains(name))
    }

    /// Open the resource `name` from the first entry holding it
    pub fn open(&self, name: &str) -> io::Result<Box<dyn Read>> {
        match self.entries.iter().find(|e| e.contains(name)) {
            Some(entry) => entry.open_resource(name),
            None => Err(not_found(name)),
        }
    }

    pub fn read_to_string(&self, name: &str) -> io::Result<String> {
        let mut text = String::new();
        self.open(name)?.read_to_string(&mut text)?;
        Ok(text)
    }

    /// Copy the resource `name` to `dest`, creating parent directories
    pub fn copy_to(&self, name: &str, dest: &Path) -> io::Result<u64> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut reader = self.open(name)?;
        let mut file = File::create(dest)?;
        io::copy(&mut reader, &mut file)
    }
}

/// Handler for the `embedded` scheme: paths are looked up in the classpath
/// after removing one leading `/`
pub struct EmbeddedResourceHandler {
    classpath: Rc<Classpath>,
}

impl EmbeddedResourceHandler {
    pub fn new(classpath: Rc<Classpath>) -> Self {
        Self { classpath }
    }
}

impl ResourceHandler for EmbeddedResourceHandler {
    fn open(&self, path: &str) -> io::Result<Box<dyn Read>> {
        let name = path.strip_prefix('/').unwrap_or(path);
        self.classpath.open(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn read_all(mut reader: Box<dyn Read>) -> String {
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        text
    }

    fn sample_tree(dir: &Path) -> PathBuf {
        let tree = dir.join("tree");
        fs::create_dir_all(tree.join("foo")).unwrap();
        fs::write(tree.join("foo/bar.txt"), "bar").unwrap();
        fs::write(tree.join("launcher.properties"), "a=b\n").unwrap();
        tree
    }

    #[test]
    fn test_tar_entries_read_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let tree = sample_tree(dir.path());
        let tar_path = dir.path().join("tree.tar");
        fs::write(&tar_path, payload::create_tar_archive(&tree).unwrap()).unwrap();

        let archive = EmbeddedArchive::open_tar(&tar_path).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(read_all(archive.open_entry("foo/bar.txt").unwrap()), "bar");
        assert_eq!(read_all(archive.open_entry("launcher.properties").unwrap()), "a=b\n");
    }

    #[test]
    fn test_executable_payload_entries() {
        let dir = tempfile::tempdir().unwrap();
        let tree = sample_tree(dir.path());
        let exe = dir.path().join("app");
        payload::write_executable(&exe, b"boot binary bytes", &tree, "org.example.app").unwrap();

        let classpath = Classpath::from_paths(&[exe]).unwrap();
        assert_eq!(classpath.read_to_string("foo/bar.txt").unwrap(), "bar");
    }

    #[test]
    fn test_first_entry_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("x"), "first").unwrap();
        fs::write(second.join("x"), "second").unwrap();
        fs::write(second.join("y"), "only second").unwrap();

        let classpath = Classpath::from_paths(&[first, second]).unwrap();
        assert_eq!(classpath.read_to_string("x").unwrap(), "first");
        assert_eq!(classpath.read_to_string("y").unwrap(), "only second");
    }

    #[test]
    fn test_embedded_handler_path_forms() {
        let dir = tempfile::tempdir().unwrap();
        let tree = sample_tree(dir.path());
        let handler = EmbeddedResourceHandler::new(Rc::new(Classpath::from_paths(&[tree]).unwrap()));

        assert_eq!(read_all(handler.open("/foo/bar.txt").unwrap()), "bar");
        assert_eq!(read_all(handler.open("foo/bar.txt").unwrap()), "bar");

        for missing in ["foo/missing.txt", "/missing", "//foo/bar.txt", "foo/../foo/bar.txt", "foo"] {
            let err = handler.open(missing).err().unwrap();
            assert_eq!(err.kind(), io::ErrorKind::NotFound, "{}", missing);
        }
    }

    #[test]
    fn test_copy_to() {
        let dir = tempfile::tempdir().unwrap();
        let tree = sample_tree(dir.path());
        let classpath = Classpath::from_paths(&[tree]).unwrap();

        let dest = dir.path().join("out/nested/bar.txt");
        assert_eq!(classpath.copy_to("foo/bar.txt", &dest).unwrap(), 3);
        assert_eq!(fs::read_to_string(dest).unwrap(), "bar");
    }
}
