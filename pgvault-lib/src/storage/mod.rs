//! Uniform storage interface with a pluggable driver and filtered IO.
//!
//! A [`Storage`] wraps a [`StorageDriver`] with a base path and a
//! path-expression resolver, so callers name repository locations with
//! expressions such as `<REPO:ARCHIVE>/16-1/0000000100000001` and stay
//! independent of the repository layout. Every read and write can carry a
//! [`FilterGroup`]; see the [`filter`](crate::filter) module.
//!
//! Only the POSIX driver is provided here; object-store drivers implement
//! the same trait out of tree.

pub mod posix;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filter::{FilterGroup, BUFFER_SIZE};

pub use posix::PosixDriver;

// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    File,
    Path,
    Link,
    Special,
}

/// Metadata for one file, path, or link.
#[derive(Debug, Clone)]
pub struct StorageInfo {
    /// Name relative to the listed path (or the full resolved path for
    /// single-file queries).
    pub name: String,
    pub file_type: FileType,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: i64,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
    pub link_target: Option<PathBuf>,
}

/// Parameters for [`Storage::new_write`].
#[derive(Debug, Clone, Default)]
pub struct WriteParams {
    pub mode: Option<u32>,
    pub no_create_path: bool,
    pub no_sync_file: bool,
    pub no_sync_path: bool,
    pub no_atomic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// A driver-level write handle. Dropping without [`DriverWrite::close`]
/// abandons the write (atomic writes leave no trace at the final path).
pub trait DriverWrite: Write + Send {
    fn close(self: Box<Self>) -> Result<()>;
}

/// The capability set a storage backend must provide.
pub trait StorageDriver: Send + Sync {
    /// `None` when the file does not exist.
    fn info(&self, path: &Path, follow_link: bool) -> Result<Option<StorageInfo>>;

    /// Immediate children of `path`; `None` when the path does not exist.
    fn list(&self, path: &Path) -> Result<Option<Vec<StorageInfo>>>;

    /// `None` when the file does not exist.
    fn read(&self, path: &Path) -> Result<Option<Box<dyn Read + Send>>>;

    fn write(&self, path: &Path, params: &WriteParams) -> Result<Box<dyn DriverWrite>>;

    /// `false` when the file did not exist.
    fn remove(&self, path: &Path) -> Result<bool>;

    fn path_create(&self, path: &Path, mode: u32, error_on_exists: bool) -> Result<()>;

    /// `false` when the path did not exist.
    fn path_remove(&self, path: &Path, recurse: bool) -> Result<bool>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn link_create(&self, target: &Path, link: &Path) -> Result<()>;

    fn owner_set(&self, path: &Path, user: Option<&str>, group: Option<&str>) -> Result<()>;

    fn mode_set(&self, path: &Path, mode: u32) -> Result<()>;

    fn path_sync(&self, path: &Path) -> Result<()>;
}

// ----------------------------------------------------------------------------

/// A storage location: driver + base path + path expressions.
#[derive(Clone)]
pub struct Storage {
    driver: Arc<dyn StorageDriver>,
    base: PathBuf,
    expressions: HashMap<String, PathBuf>,
}

impl Storage {
    pub fn new(driver: Arc<dyn StorageDriver>, base: impl Into<PathBuf>) -> Self {
        Self { driver, base: base.into(), expressions: HashMap::new() }
    }

    /// POSIX storage rooted at `base` with no expressions.
    pub fn posix(base: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(PosixDriver::new()), base)
    }

    /// Register a path expression, e.g. `REPO:ARCHIVE` → `archive/main`.
    pub fn with_expression(mut self, name: &str, target: impl Into<PathBuf>) -> Self {
        self.expressions.insert(name.to_owned(), target.into());
        self
    }

    /// Repository storage for one stanza, with the `<REPO:...>`
    /// expressions registered.
    pub fn repo(base: impl Into<PathBuf>, stanza: &str) -> Self {
        Self::posix(base)
            .with_expression("REPO:ARCHIVE", format!("archive/{stanza}"))
            .with_expression("REPO:BACKUP", format!("backup/{stanza}"))
    }

    /// Spool storage for one stanza, with the `<SPOOL:...>` expressions
    /// registered.
    pub fn spool(base: impl Into<PathBuf>, stanza: &str) -> Self {
        Self::posix(base)
            .with_expression("SPOOL:ARCHIVE_IN", format!("archive/{stanza}/in"))
            .with_expression("SPOOL:ARCHIVE_OUT", format!("archive/{stanza}/out"))
    }

    /// Resolve a path that may begin with an `<EXPRESSION>`.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        if let Some(rest) = path.strip_prefix('<') {
            let (name, remainder) = rest.split_once('>').ok_or_else(|| {
                Error::Assert(format!("invalid path expression in '{path}'"))
            })?;
            let target = self.expressions.get(name).ok_or_else(|| {
                Error::Assert(format!("unknown path expression '<{name}>'"))
            })?;
            let remainder = remainder.trim_start_matches('/');
            let mut resolved = self.base.join(target);
            if !remainder.is_empty() {
                resolved = resolved.join(remainder);
            }
            Ok(resolved)
        } else if path.starts_with('/') {
            Ok(PathBuf::from(path))
        } else if path.is_empty() {
            Ok(self.base.clone())
        } else {
            Ok(self.base.join(path))
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    // ------------------------------------------------------------------

    /// Does a file exist at `path`?
    pub fn exists(&self, path: &str) -> Result<bool> {
        let info = self.driver.info(&self.resolve(path)?, true)?;
        Ok(matches!(info, Some(info) if info.file_type == FileType::File))
    }

    pub fn path_exists(&self, path: &str) -> Result<bool> {
        let info = self.driver.info(&self.resolve(path)?, true)?;
        Ok(matches!(info, Some(info) if info.file_type == FileType::Path))
    }

    pub fn info(&self, path: &str, follow_link: bool) -> Result<Option<StorageInfo>> {
        self.driver.info(&self.resolve(path)?, follow_link)
    }

    /// Names of the immediate children of `path`, sorted ascending. An
    /// absent path lists as empty.
    pub fn list(&self, path: &str) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .driver
            .list(&self.resolve(path)?)?
            .unwrap_or_default()
            .into_iter()
            .map(|info| info.name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Info for children of `path`, optionally recursive, sorted by name.
    /// Recursive names are `/`-joined relative paths. An absent path lists
    /// as empty.
    pub fn info_list(&self, path: &str, recurse: bool, sort: SortOrder) -> Result<Vec<StorageInfo>> {
        let resolved = self.resolve(path)?;
        let mut result = Vec::new();
        self.info_list_at(&resolved, "", recurse, &mut result)?;
        match sort {
            SortOrder::Asc => result.sort_by(|a, b| a.name.cmp(&b.name)),
            SortOrder::Desc => result.sort_by(|a, b| b.name.cmp(&a.name)),
        }
        Ok(result)
    }

    fn info_list_at(
        &self,
        path: &Path,
        prefix: &str,
        recurse: bool,
        result: &mut Vec<StorageInfo>,
    ) -> Result<()> {
        let entries = match self.driver.list(path)? {
            Some(entries) => entries,
            None => return Ok(()),
        };
        for mut info in entries {
            let child = info.name.clone();
            let name = if prefix.is_empty() {
                child.clone()
            } else {
                format!("{prefix}/{child}")
            };
            info.name = name.clone();
            let is_path = info.file_type == FileType::Path;
            result.push(info);
            if recurse && is_path {
                self.info_list_at(&path.join(&child), &name, recurse, result)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------

    /// Open a filtered read. `None` when missing and `ignore_missing`.
    pub fn new_read(
        &self,
        path: &str,
        ignore_missing: bool,
        filters: FilterGroup,
    ) -> Result<Option<StorageRead>> {
        let resolved = self.resolve(path)?;
        match self.driver.read(&resolved)? {
            Some(inner) => Ok(Some(StorageRead::new(inner, filters, resolved))),
            None if ignore_missing => Ok(None),
            None => Err(Error::FileMissing(format!(
                "unable to open missing file '{}' for read",
                resolved.display()
            ))),
        }
    }

    /// Open a filtered write.
    pub fn new_write(
        &self,
        path: &str,
        params: WriteParams,
        filters: FilterGroup,
    ) -> Result<StorageWrite> {
        let resolved = self.resolve(path)?;
        let inner = self.driver.write(&resolved, &params)?;
        Ok(StorageWrite::new(inner, filters, resolved))
    }

    /// Read a whole file through `filters`. `None` when missing and
    /// `ignore_missing`.
    pub fn get(
        &self,
        path: &str,
        ignore_missing: bool,
        filters: FilterGroup,
    ) -> Result<Option<Vec<u8>>> {
        match self.new_read(path, ignore_missing, filters)? {
            None => Ok(None),
            Some(mut read) => {
                let mut data = Vec::new();
                read.read_to_end(&mut data).map_err(|err| {
                    Error::FileRead(format!("unable to read '{path}': {err}"))
                })?;
                Ok(Some(data))
            }
        }
    }

    /// Write a whole file through `filters` with default parameters.
    pub fn put(&self, path: &str, data: &[u8], filters: FilterGroup) -> Result<()> {
        let mut write = self.new_write(path, WriteParams::default(), filters)?;
        write.write_all(data).map_err(|err| {
            Error::FileWrite(format!("unable to write '{path}': {err}"))
        })?;
        write.close()?;
        Ok(())
    }

    /// Drive `read` to EOF into `write`, closing the write. Returns the
    /// filter results of both sides.
    pub fn copy(
        &self,
        mut read: StorageRead,
        mut write: StorageWrite,
    ) -> Result<(serde_json::Map<String, serde_json::Value>, serde_json::Map<String, serde_json::Value>)>
    {
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let n = read.read(&mut buffer).map_err(|err| {
                Error::FileRead(format!(
                    "unable to read '{}': {err}",
                    read.path().display()
                ))
            })?;
            if n == 0 {
                break;
            }
            write.write_all(&buffer[..n]).map_err(|err| {
                Error::FileWrite(format!(
                    "unable to write '{}': {err}",
                    write.path().display()
                ))
            })?;
        }
        let read_results = read.results()?;
        let write_results = write.close()?;
        Ok((read_results, write_results))
    }

    /// Remove a file. Missing is an error only when `error_on_missing`.
    pub fn remove(&self, path: &str, error_on_missing: bool) -> Result<()> {
        let resolved = self.resolve(path)?;
        let removed = self.driver.remove(&resolved)?;
        if !removed && error_on_missing {
            return Err(Error::FileMissing(format!(
                "unable to remove missing file '{}'",
                resolved.display()
            )));
        }
        Ok(())
    }

    pub fn path_create(&self, path: &str, mode: u32) -> Result<()> {
        self.driver.path_create(&self.resolve(path)?, mode, false)
    }

    pub fn path_remove(&self, path: &str, recurse: bool) -> Result<bool> {
        self.driver.path_remove(&self.resolve(path)?, recurse)
    }

    /// Rename within the storage; falls back to copy+remove across
    /// devices.
    pub fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let from_resolved = self.resolve(from)?;
        let to_resolved = self.resolve(to)?;
        match self.driver.rename(&from_resolved, &to_resolved) {
            Ok(()) => Ok(()),
            Err(Error::FileWrite(message)) if message.contains("cross-device") => {
                let read = self
                    .new_read(from, false, FilterGroup::new())?
                    .expect("source exists for move");
                let write = self.new_write(to, WriteParams::default(), FilterGroup::new())?;
                self.copy(read, write)?;
                self.remove(from, true)
            }
            Err(err) => Err(err),
        }
    }

    pub fn link_create(&self, target: &str, link: &str) -> Result<()> {
        // The link target is used verbatim; only the link path resolves.
        self.driver.link_create(Path::new(target), &self.resolve(link)?)
    }

    pub fn owner_set(&self, path: &str, user: Option<&str>, group: Option<&str>) -> Result<()> {
        self.driver.owner_set(&self.resolve(path)?, user, group)
    }

    pub fn mode_set(&self, path: &str, mode: u32) -> Result<()> {
        self.driver.mode_set(&self.resolve(path)?, mode)
    }

    pub fn path_sync(&self, path: &str) -> Result<()> {
        self.driver.path_sync(&self.resolve(path)?)
    }
}

// ----------------------------------------------------------------------------

/// A filtered read handle.
pub struct StorageRead {
    inner: Box<dyn Read + Send>,
    filters: FilterGroup,
    path: PathBuf,
    buffer: Vec<u8>,
    offset: usize,
    eof: bool,
}

impl StorageRead {
    fn new(inner: Box<dyn Read + Send>, filters: FilterGroup, path: PathBuf) -> Self {
        Self { inner, filters, path, buffer: Vec::new(), offset: 0, eof: false }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filter results; drives the stream to EOF first if needed.
    pub fn results(&mut self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut sink = [0u8; BUFFER_SIZE];
        while !self.eof {
            self.read(&mut sink)
                .map_err(|err| Error::FileRead(format!(
                    "unable to read '{}': {err}",
                    self.path.display()
                )))?;
        }
        Ok(self.filters.results())
    }

    fn fill(&mut self) -> std::io::Result<()> {
        let mut chunk = vec![0u8; BUFFER_SIZE];
        loop {
            let n = self.inner.read(&mut chunk)?;
            self.buffer.clear();
            self.offset = 0;
            if n == 0 {
                self.filters
                    .flush(&mut self.buffer)
                    .map_err(std::io::Error::other)?;
                self.eof = true;
                return Ok(());
            }
            self.filters
                .process(&chunk[..n], &mut self.buffer)
                .map_err(std::io::Error::other)?;
            if !self.buffer.is_empty() {
                return Ok(());
            }
            // Filters consumed the chunk without output (e.g. a cipher
            // header); read more.
        }
    }
}

impl Read for StorageRead {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.buffer.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
            if self.offset >= self.buffer.len() {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buffer.len() - self.offset);
        out[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// A filtered write handle. Call [`StorageWrite::close`] to flush filters
/// and commit the file; dropping without closing abandons an atomic write.
pub struct StorageWrite {
    inner: Option<Box<dyn DriverWrite>>,
    filters: FilterGroup,
    path: PathBuf,
}

impl StorageWrite {
    fn new(inner: Box<dyn DriverWrite>, filters: FilterGroup, path: PathBuf) -> Self {
        Self { inner: Some(inner), filters, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush filters, sync and commit the file, and return filter results.
    pub fn close(mut self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut tail = Vec::new();
        self.filters.flush(&mut tail)?;
        let mut inner = self.inner.take().expect("write closed only once");
        if !tail.is_empty() {
            inner.write_all(&tail).map_err(|err| {
                Error::FileWrite(format!(
                    "unable to write '{}': {err}",
                    self.path.display()
                ))
            })?;
        }
        inner.close()?;
        Ok(self.filters.results())
    }
}

impl Write for StorageWrite {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        let mut out = Vec::new();
        self.filters
            .process(data, &mut out)
            .map_err(std::io::Error::other)?;
        if !out.is_empty() {
            self.inner
                .as_mut()
                .expect("write open")
                .write_all(&out)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.as_mut().expect("write open").flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{CompressFilter, CompressType, DecompressFilter, HashFilter, SizeFilter};

    #[test]
    fn path_expressions_resolve() {
        let storage = Storage::repo("/repo", "main");
        assert_eq!(
            storage.resolve("<REPO:ARCHIVE>/16-1/0000000100000001").unwrap(),
            PathBuf::from("/repo/archive/main/16-1/0000000100000001")
        );
        assert_eq!(
            storage.resolve("<REPO:BACKUP>").unwrap(),
            PathBuf::from("/repo/backup/main")
        );
        assert_eq!(storage.resolve("plain/file").unwrap(), PathBuf::from("/repo/plain/file"));
        assert_eq!(storage.resolve("/abs/file").unwrap(), PathBuf::from("/abs/file"));
        assert!(storage.resolve("<NO:SUCH>/x").is_err());
    }

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        storage.put("a/b/file.txt", b"hello", FilterGroup::new()).unwrap();
        let data = storage.get("a/b/file.txt", false, FilterGroup::new()).unwrap();
        assert_eq!(data.unwrap(), b"hello");
        assert!(storage.exists("a/b/file.txt").unwrap());
        assert!(!storage.exists("a/b/other.txt").unwrap());
        assert!(storage.get("a/b/other.txt", true, FilterGroup::new()).unwrap().is_none());
        assert!(storage.get("a/b/other.txt", false, FilterGroup::new()).is_err());
    }

    #[test]
    fn copy_applies_filters_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        let payload: Vec<u8> = (0..200_000u32).map(|n| (n % 13) as u8).collect();
        storage.put("source", &payload, FilterGroup::new()).unwrap();

        // Compress on the way in, recording size and hash of the source.
        let read = storage
            .new_read(
                "source",
                false,
                FilterGroup::new()
                    .add(Box::new(SizeFilter::new()))
                    .add(Box::new(HashFilter::sha1()))
                    .add(Box::new(CompressFilter::new(CompressType::Gz, 6))),
            )
            .unwrap()
            .unwrap();
        let write = storage
            .new_write("dest.gz", WriteParams::default(), FilterGroup::new())
            .unwrap();
        let (read_results, _) = storage.copy(read, write).unwrap();
        assert_eq!(read_results["size"], serde_json::json!(payload.len()));

        // And back out.
        let out = storage
            .get(
                "dest.gz",
                false,
                FilterGroup::new().add(Box::new(DecompressFilter::new(CompressType::Gz))),
            )
            .unwrap()
            .unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn info_list_recurses_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        storage.put("top/z.txt", b"z", FilterGroup::new()).unwrap();
        storage.put("top/sub/a.txt", b"a", FilterGroup::new()).unwrap();
        let names: Vec<String> = storage
            .info_list("top", true, SortOrder::Asc)
            .unwrap()
            .into_iter()
            .map(|info| info.name)
            .collect();
        assert_eq!(names, ["sub", "sub/a.txt", "z.txt"]);
        assert!(storage.info_list("missing", true, SortOrder::Asc).unwrap().is_empty());
    }
}
