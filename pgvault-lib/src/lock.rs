//! Advisory file locks and stop files, using
//! [`flock(2)`](https://linux.die.net/man/2/flock).
//!
//! Each stanza has two lock classes, [`LockType::Archive`] and
//! [`LockType::Backup`]; a lock file lives at
//! `<lock-path>/<stanza>-<type>.lock` and holds the owning PID while
//! locked. Locks are advisory and released when the holding process exits,
//! so a crashed process never leaves a stanza wedged.
//!
//! Stop files (`<lock-path>/<stanza>.stop` or `<lock-path>/all.stop`)
//! block all non-control commands for one stanza or for every stanza.

// Ignore deprecation warnings, for now, regarding `nix::fcntl::flock`, since
// the suggested replacement, `nix::fcntl::Flock`, does not provide the same
// functionality. This change was made in the `nix` crate on 2023-12-03; see
// https://github.com/nix-rust/nix/pull/2170. Some limitations of the new API
// reported 2024-04-07; see https://github.com/nix-rust/nix/issues/2356.
#![allow(deprecated)]

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use either::{Either, Left, Right};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};

use crate::error::{Error, Result};

// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Archive,
    Backup,
}

impl LockType {
    /// Both lock types, in acquisition order. Stanza commands take both.
    pub const ALL: [LockType; 2] = [LockType::Archive, LockType::Backup];

    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Archive => "archive",
            LockType::Backup => "backup",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// Path of the lock file for `(stanza, lock_type)`.
pub fn lock_file_path(lock_path: &Path, stanza: &str, lock_type: LockType) -> PathBuf {
    lock_path.join(format!("{stanza}-{lock_type}.lock"))
}

// ----------------------------------------------------------------------------

/// An exclusively held lock. The flock is released (and the file removed)
/// on [`LockHeld::release`] or drop, whichever comes first.
#[derive(Debug)]
pub struct LockHeld {
    file: Option<File>,
    path: PathBuf,
}

impl LockHeld {
    /// Release explicitly. Idempotent; also performed on drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            // Remove the file before dropping the flock so that a waiter
            // that acquires the stale inode cannot be confused by content
            // we wrote.
            let _ = std::fs::remove_file(&self.path);
            drop(file);
        }
    }

    /// Replace the progress blob stored after the PID line.
    pub fn write_progress(&mut self, progress: &str) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            let content = format!("{}\n{progress}\n", std::process::id());
            file.set_len(0)
                .and_then(|()| {
                    use std::io::Seek;
                    file.seek(std::io::SeekFrom::Start(0))?;
                    file.write_all(content.as_bytes())
                })
                .map_err(|err| {
                    Error::FileWrite(format!(
                        "unable to write lock file '{}': {err}",
                        self.path.display()
                    ))
                })?;
        }
        Ok(())
    }
}

impl Drop for LockHeld {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Attempt to acquire the `(stanza, lock_type)` lock without blocking.
///
/// Returns `Right(held)` on success, or `Left(pid)` when another process
/// holds the lock (with its PID when the holder wrote one).
pub fn try_acquire(
    lock_path: &Path,
    stanza: &str,
    lock_type: LockType,
) -> Result<Either<Option<u32>, LockHeld>> {
    std::fs::create_dir_all(lock_path).map_err(|err| {
        Error::PathOpen(format!(
            "unable to create lock path '{}': {err}",
            lock_path.display()
        ))
    })?;
    let path = lock_file_path(lock_path, stanza, lock_type);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|err| {
            Error::FileOpen(format!(
                "unable to open lock file '{}': {err}",
                path.display()
            ))
        })?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = write!(file, "{}\n", std::process::id());
            let _ = file.flush();
            Ok(Right(LockHeld { file: Some(file), path }))
        }
        Err(Errno::EAGAIN) | Err(Errno::EACCES) => {
            let mut content = String::new();
            let _ = file.read_to_string(&mut content);
            let pid = content.lines().next().and_then(|line| line.trim().parse().ok());
            Ok(Left(pid))
        }
        Err(err) => Err(Error::LockAcquire(format!(
            "unable to lock '{}': {err}",
            path.display()
        ))),
    }
}

/// Acquire the `(stanza, lock_type)` lock or fail with
/// [`Error::LockAcquire`].
pub fn acquire(lock_path: &Path, stanza: &str, lock_type: LockType) -> Result<LockHeld> {
    match try_acquire(lock_path, stanza, lock_type)? {
        Right(held) => Ok(held),
        Left(pid) => {
            let path = lock_file_path(lock_path, stanza, lock_type);
            let holder = match pid {
                Some(pid) => format!(" held by process {pid}"),
                None => String::new(),
            };
            Err(Error::LockAcquire(format!(
                "unable to acquire lock on file '{}'{holder}",
                path.display()
            )))
        }
    }
}

/// Acquire both stanza locks, archive first. Stanza commands hold both.
pub fn acquire_all(lock_path: &Path, stanza: &str) -> Result<Vec<LockHeld>> {
    LockType::ALL
        .iter()
        .map(|lock_type| acquire(lock_path, stanza, *lock_type))
        .collect()
}

// ----------------------------------------------------------------------------

/// Path of the stop file for a stanza, or for all stanzas when `None`.
pub fn stop_file_path(lock_path: &Path, stanza: Option<&str>) -> PathBuf {
    lock_path.join(format!("{}.stop", stanza.unwrap_or("all")))
}

/// Fail with [`Error::Stop`] when a stop file blocks `stanza`.
///
/// The all-stanza stop file blocks every stanza.
pub fn stop_check(lock_path: &Path, stanza: Option<&str>) -> Result<()> {
    if stop_file_path(lock_path, None).exists() {
        return Err(Error::Stop("stop file exists for all stanzas".into()));
    }
    if let Some(stanza) = stanza {
        if stop_file_path(lock_path, Some(stanza)).exists() {
            return Err(Error::Stop(format!("stop file exists for stanza '{stanza}'")));
        }
    }
    Ok(())
}

/// Create the stop file. Returns `false` when it already existed.
pub fn stop_create(lock_path: &Path, stanza: Option<&str>) -> Result<bool> {
    std::fs::create_dir_all(lock_path).map_err(|err| {
        Error::PathOpen(format!(
            "unable to create lock path '{}': {err}",
            lock_path.display()
        ))
    })?;
    let path = stop_file_path(lock_path, stanza);
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(&path, b"").map_err(|err| {
        Error::FileWrite(format!(
            "unable to write stop file '{}': {err}",
            path.display()
        ))
    })?;
    Ok(true)
}

/// SIGTERM every process holding a lock for `stanza` (or any stanza when
/// `None`). Returns the number of processes signalled.
pub fn stop_kill(lock_path: &Path, stanza: Option<&str>) -> Result<usize> {
    let entries = match std::fs::read_dir(lock_path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(Error::PathOpen(format!(
                "unable to list lock path '{}': {err}",
                lock_path.display()
            )))
        }
    };
    let mut killed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let matches_stanza = LockType::ALL.iter().any(|lock_type| match stanza {
            Some(stanza) => name == format!("{stanza}-{lock_type}.lock"),
            None => name.ends_with(&format!("-{lock_type}.lock")),
        });
        if !matches_stanza {
            continue;
        }
        // Only a file still flocked elsewhere has a live holder.
        if let Ok(Left(Some(pid))) = try_acquire_path(&entry.path()) {
            if pid != std::process::id() {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
                killed += 1;
            }
        }
    }
    Ok(killed)
}

/// Probe an existing lock file: `Left(pid)` when held elsewhere,
/// `Right(())` (released immediately) when free.
fn try_acquire_path(path: &Path) -> Result<Either<Option<u32>, ()>> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| {
            Error::FileOpen(format!(
                "unable to open lock file '{}': {err}",
                path.display()
            ))
        })?;
    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(Right(())),
        Err(Errno::EAGAIN) | Err(Errno::EACCES) => {
            let mut content = String::new();
            let _ = file.read_to_string(&mut content);
            Ok(Left(content.lines().next().and_then(|line| line.trim().parse().ok())))
        }
        Err(err) => Err(Error::LockAcquire(format!(
            "unable to probe '{}': {err}",
            path.display()
        ))),
    }
}

/// Remove the stop file. Returns `false` when it did not exist.
pub fn stop_remove(lock_path: &Path, stanza: Option<&str>) -> Result<bool> {
    let path = stop_file_path(lock_path, stanza);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(Error::FileWrite(format!(
            "unable to remove stop file '{}': {err}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_within_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let held = acquire(dir.path(), "main", LockType::Archive).unwrap();

        // A second acquisition through a separate descriptor must fail.
        match try_acquire(dir.path(), "main", LockType::Archive).unwrap() {
            Left(pid) => assert_eq!(pid, Some(std::process::id())),
            Right(_) => panic!("lock was acquired twice"),
        }

        // The backup lock is independent.
        let backup = acquire(dir.path(), "main", LockType::Backup).unwrap();
        backup.release();

        held.release();
        let reheld = acquire(dir.path(), "main", LockType::Archive).unwrap();
        reheld.release();
    }

    #[test]
    fn release_removes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_file_path(dir.path(), "main", LockType::Backup);
        let held = acquire(dir.path(), "main", LockType::Backup).unwrap();
        assert!(path.exists());
        held.release();
        assert!(!path.exists());
    }

    #[test]
    fn stop_files_block_and_unblock() {
        let dir = tempfile::tempdir().unwrap();
        stop_check(dir.path(), Some("main")).unwrap();

        assert!(stop_create(dir.path(), Some("main")).unwrap());
        assert!(!stop_create(dir.path(), Some("main")).unwrap());
        assert!(stop_check(dir.path(), Some("main")).is_err());
        stop_check(dir.path(), Some("other")).unwrap();

        // The all-stanza stop file blocks everything.
        assert!(stop_create(dir.path(), None).unwrap());
        assert!(stop_check(dir.path(), Some("other")).is_err());

        assert!(stop_remove(dir.path(), None).unwrap());
        assert!(stop_remove(dir.path(), Some("main")).unwrap());
        assert!(!stop_remove(dir.path(), Some("main")).unwrap());
        stop_check(dir.path(), Some("main")).unwrap();
    }
}
