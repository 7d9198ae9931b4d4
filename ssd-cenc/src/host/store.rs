use crate::{Error, Result, lock};
use log::trace;
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

/// Named storage for opaque backend blobs (device certificates, session state).
pub trait BlobStore: Send + Sync {
    /// Read a blob, [`Error::BlobNotFound`] if it does not exist.
    fn read(&self, name: &str) -> Result<Vec<u8>>;
    fn write(&self, name: &str, data: &[u8]) -> Result<()>;
    fn exists(&self, name: &str) -> bool;
    /// Remove a blob, removing a missing blob is not an error.
    fn remove(&self, name: &str) -> Result<()>;
    fn size(&self, name: &str) -> Option<u64>;
    fn list(&self) -> Result<Vec<String>>;
}

/// Blob store backed by one directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under `base/<hash>` where the hash is derived from the host of
    /// `license_url`, so that every license domain gets its own directory.
    /// Anything after the first `|` of a license template is ignored.
    pub fn for_license_url<P: AsRef<Path>>(base: P, license_url: &str) -> Self {
        Self::new(base.as_ref().join(domain_hash(license_url)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("'{}' is not a valid blob name", name),
            )));
        }

        Ok(self.dir.join(name))
    }
}

impl BlobStore for FileStore {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path(name)?;
        trace!("reading blob {}", path.display());

        fs::read(&path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Error::BlobNotFound(name.to_owned()),
            _ => Error::Io(e),
        })
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path(name)?;
        trace!("writing blob {}", path.display());

        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }

        fs::write(path, data)?;
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).map(|x| x.is_file()).unwrap_or(false)
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        trace!("removing blob {}", path.display());

        match fs::remove_file(path) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(Error::Io(e)),
            _ => Ok(()),
        }
    }

    fn size(&self, name: &str) -> Option<u64> {
        fs::metadata(self.path(name).ok()?).ok().map(|x| x.len())
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        names.sort();
        Ok(names)
    }
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn read(&self, name: &str) -> Result<Vec<u8>> {
        lock(&self.blobs)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::BlobNotFound(name.to_owned()))
    }

    fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        lock(&self.blobs).insert(name.to_owned(), data.to_vec());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        lock(&self.blobs).contains_key(name)
    }

    fn remove(&self, name: &str) -> Result<()> {
        lock(&self.blobs).remove(name);
        Ok(())
    }

    fn size(&self, name: &str) -> Option<u64> {
        lock(&self.blobs).get(name).map(|x| x.len() as u64)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(lock(&self.blobs).keys().cloned().collect())
    }
}

/// Short folder name for the host part of a license url.
pub fn domain_hash(license_url: &str) -> String {
    let url = license_url.split('|').next().unwrap_or_default();
    let rest = url.split_once("://").map(|(_, x)| x).unwrap_or(url);
    let host = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    blake3::hash(host.as_bytes()).to_hex()[..16].to_owned()
}
