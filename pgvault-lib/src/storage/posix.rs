//! POSIX filesystem driver.
//!
//! Writes are atomic by default: content materializes at `<path>.tmp` and
//! is renamed over the final path at close, after the file (and then its
//! parent directory) have been fsync'd. A reader therefore never observes
//! a half-written repository file.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Group, Uid, User};

use super::{DriverWrite, FileType, StorageDriver, StorageInfo, WriteParams};
use crate::error::{Error, Result};

pub const PATH_MODE_DEFAULT: u32 = 0o750;
pub const FILE_MODE_DEFAULT: u32 = 0o640;

#[derive(Debug, Default)]
pub struct PosixDriver;

impl PosixDriver {
    pub fn new() -> Self {
        Self
    }
}

fn info_from_metadata(name: String, metadata: &std::fs::Metadata, link_target: Option<PathBuf>) -> StorageInfo {
    let file_type = if metadata.file_type().is_symlink() {
        FileType::Link
    } else if metadata.is_dir() {
        FileType::Path
    } else if metadata.is_file() {
        FileType::File
    } else {
        FileType::Special
    };
    StorageInfo {
        name,
        file_type,
        size: metadata.len(),
        modified: metadata.mtime(),
        mode: metadata.permissions().mode() & 0o7777,
        user: User::from_uid(Uid::from_raw(metadata.uid())).ok().flatten().map(|u| u.name),
        group: Group::from_gid(Gid::from_raw(metadata.gid())).ok().flatten().map(|g| g.name),
        link_target,
    }
}

impl StorageDriver for PosixDriver {
    fn info(&self, path: &Path, follow_link: bool) -> Result<Option<StorageInfo>> {
        let metadata = if follow_link {
            path.metadata()
        } else {
            path.symlink_metadata()
        };
        match metadata {
            Ok(metadata) => {
                let link_target = if metadata.file_type().is_symlink() {
                    std::fs::read_link(path).ok()
                } else {
                    None
                };
                let name = path.to_string_lossy().into_owned();
                Ok(Some(info_from_metadata(name, &metadata, link_target)))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::FileOpen(format!(
                "unable to stat '{}': {err}",
                path.display()
            ))),
        }
    }

    fn list(&self, path: &Path) -> Result<Option<Vec<StorageInfo>>> {
        let entries = match std::fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(Error::PathOpen(format!(
                    "unable to list path '{}': {err}",
                    path.display()
                )))
            }
        };
        let mut result = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                Error::PathOpen(format!("unable to list path '{}': {err}", path.display()))
            })?;
            let entry_path = entry.path();
            let metadata = match entry_path.symlink_metadata() {
                Ok(metadata) => metadata,
                // Deleted while listing; skip.
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(Error::FileOpen(format!(
                        "unable to stat '{}': {err}",
                        entry_path.display()
                    )))
                }
            };
            let link_target = if metadata.file_type().is_symlink() {
                std::fs::read_link(&entry_path).ok()
            } else {
                None
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            result.push(info_from_metadata(name, &metadata, link_target));
        }
        Ok(Some(result))
    }

    fn read(&self, path: &Path) -> Result<Option<Box<dyn Read + Send>>> {
        match File::open(path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::FileOpen(format!(
                "unable to open '{}' for read: {err}",
                path.display()
            ))),
        }
    }

    fn write(&self, path: &Path, params: &WriteParams) -> Result<Box<dyn DriverWrite>> {
        if !params.no_create_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    Error::PathOpen(format!(
                        "unable to create path '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        let write_path = if params.no_atomic {
            path.to_path_buf()
        } else {
            let mut tmp = path.as_os_str().to_owned();
            tmp.push(".tmp");
            PathBuf::from(tmp)
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&write_path)
            .map_err(|err| {
                Error::FileOpen(format!(
                    "unable to open '{}' for write: {err}",
                    write_path.display()
                ))
            })?;
        let mode = params.mode.unwrap_or(FILE_MODE_DEFAULT);
        file.set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|err| {
                Error::FileWrite(format!(
                    "unable to set mode on '{}': {err}",
                    write_path.display()
                ))
            })?;
        Ok(Box::new(PosixWrite {
            file: Some(file),
            write_path,
            final_path: path.to_path_buf(),
            atomic: !params.no_atomic,
            sync_file: !params.no_sync_file,
            sync_path: !params.no_sync_path,
        }))
    }

    fn remove(&self, path: &Path) -> Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::FileWrite(format!(
                "unable to remove '{}': {err}",
                path.display()
            ))),
        }
    }

    fn path_create(&self, path: &Path, mode: u32, error_on_exists: bool) -> Result<()> {
        match std::fs::create_dir_all(path) {
            Ok(()) => {
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
                    |err| {
                        Error::PathOpen(format!(
                            "unable to set mode on path '{}': {err}",
                            path.display()
                        ))
                    },
                )?;
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if error_on_exists {
                    Err(Error::PathOpen(format!(
                        "path '{}' already exists",
                        path.display()
                    )))
                } else {
                    Ok(())
                }
            }
            Err(err) => Err(Error::PathOpen(format!(
                "unable to create path '{}': {err}",
                path.display()
            ))),
        }
    }

    fn path_remove(&self, path: &Path, recurse: bool) -> Result<bool> {
        let result = if recurse {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_dir(path)
        };
        match result {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::PathOpen(format!(
                "unable to remove path '{}': {err}",
                path.display()
            ))),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to).map_err(|err| {
            let detail = if err.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32) {
                "cross-device rename"
            } else {
                "rename failed"
            };
            Error::FileWrite(format!(
                "unable to move '{}' to '{}': {detail}: {err}",
                from.display(),
                to.display()
            ))
        })
    }

    fn link_create(&self, target: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link).map_err(|err| {
            Error::FileWrite(format!(
                "unable to create link '{}' -> '{}': {err}",
                link.display(),
                target.display()
            ))
        })
    }

    fn owner_set(&self, path: &Path, user: Option<&str>, group: Option<&str>) -> Result<()> {
        let uid = match user {
            Some(name) => Some(
                User::from_name(name)
                    .map_err(|err| Error::FileOwner(format!("unable to look up user '{name}': {err}")))?
                    .ok_or_else(|| Error::FileOwner(format!("unknown user '{name}'")))?
                    .uid,
            ),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(
                Group::from_name(name)
                    .map_err(|err| Error::FileOwner(format!("unable to look up group '{name}': {err}")))?
                    .ok_or_else(|| Error::FileOwner(format!("unknown group '{name}'")))?
                    .gid,
            ),
            None => None,
        };
        if uid.is_none() && gid.is_none() {
            return Ok(());
        }
        nix::unistd::chown(path, uid, gid).map_err(|err| {
            Error::FileOwner(format!(
                "unable to set ownership on '{}': {err}",
                path.display()
            ))
        })
    }

    fn mode_set(&self, path: &Path, mode: u32) -> Result<()> {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|err| {
            Error::FileWrite(format!(
                "unable to set mode on '{}': {err}",
                path.display()
            ))
        })
    }

    fn path_sync(&self, path: &Path) -> Result<()> {
        let dir = File::open(path).map_err(|err| {
            Error::PathOpen(format!("unable to open path '{}': {err}", path.display()))
        })?;
        dir.sync_all().map_err(|err| {
            Error::PathOpen(format!("unable to sync path '{}': {err}", path.display()))
        })
    }
}

// ----------------------------------------------------------------------------

struct PosixWrite {
    file: Option<File>,
    write_path: PathBuf,
    final_path: PathBuf,
    atomic: bool,
    sync_file: bool,
    sync_path: bool,
}

impl Write for PosixWrite {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.file.as_mut().expect("file open").write(data)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.as_mut().expect("file open").flush()
    }
}

impl DriverWrite for PosixWrite {
    fn close(mut self: Box<Self>) -> Result<()> {
        let file = self.file.take().expect("file open");
        if self.sync_file {
            file.sync_all().map_err(|err| {
                Error::FileWrite(format!(
                    "unable to sync '{}': {err}",
                    self.write_path.display()
                ))
            })?;
        }
        drop(file);
        if self.atomic {
            std::fs::rename(&self.write_path, &self.final_path).map_err(|err| {
                Error::FileWrite(format!(
                    "unable to move '{}' to '{}': {err}",
                    self.write_path.display(),
                    self.final_path.display()
                ))
            })?;
        }
        if self.sync_path {
            if let Some(parent) = self.final_path.parent() {
                if let Ok(dir) = File::open(parent) {
                    dir.sync_all().map_err(|err| {
                        Error::PathOpen(format!(
                            "unable to sync path '{}': {err}",
                            parent.display()
                        ))
                    })?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for PosixWrite {
    fn drop(&mut self) {
        // An unclosed atomic write leaves no trace at the final path.
        if self.file.take().is_some() && self.atomic {
            let _ = std::fs::remove_file(&self.write_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Storage, WriteParams};
    use crate::filter::FilterGroup;

    #[test]
    fn atomic_write_commits_on_close_only() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        let mut write = storage
            .new_write("file.bin", WriteParams::default(), FilterGroup::new())
            .unwrap();
        use std::io::Write as _;
        write.write_all(b"payload").unwrap();
        // Before close, only the temp file exists.
        assert!(!dir.path().join("file.bin").exists());
        assert!(dir.path().join("file.bin.tmp").exists());
        write.close().unwrap();
        assert!(dir.path().join("file.bin").exists());
        assert!(!dir.path().join("file.bin.tmp").exists());
    }

    #[test]
    fn abandoned_write_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        let mut write = storage
            .new_write("file.bin", WriteParams::default(), FilterGroup::new())
            .unwrap();
        use std::io::Write as _;
        write.write_all(b"payload").unwrap();
        drop(write);
        assert!(!dir.path().join("file.bin").exists());
        assert!(!dir.path().join("file.bin.tmp").exists());
    }

    #[test]
    fn write_mode_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        let write = storage
            .new_write(
                "file.bin",
                WriteParams { mode: Some(0o600), ..WriteParams::default() },
                FilterGroup::new(),
            )
            .unwrap();
        write.close().unwrap();
        let info = storage.info("file.bin", true).unwrap().unwrap();
        assert_eq!(info.mode, 0o600);
    }
}
