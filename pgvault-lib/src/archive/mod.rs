//! The WAL archive protocol: asynchronous push/get through a spool queue
//! with per-segment status files, arbitrated by the archive lock.
//!
//! For any segment at most one status file exists and the async worker is
//! its sole writer. A `.ok` file may carry a `0\n<message>` payload: a
//! warning for push, "no such segment" for get. A `.error` file carries
//! `<code>\n<message>` and is re-raised in the waiting process, except
//! on its very first poll, which tolerates a stale error long enough for
//! a freshly started worker to sweep and retry.

pub mod get;
pub mod push;

pub use get::{cmd_archive_get, ArchiveGetResult};
pub use push::cmd_archive_push;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::filter::{CompressType, FilterGroup};
use crate::pg::wal::WAL_SEGMENT_NAME_RE;
use crate::repo::Repo;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    Push,
    Get,
}

impl ArchiveMode {
    /// Spool directory expression for this direction.
    pub fn spool_expr(&self) -> &'static str {
        match self {
            ArchiveMode::Push => "<SPOOL:ARCHIVE_OUT>",
            ArchiveMode::Get => "<SPOOL:ARCHIVE_IN>",
        }
    }
}

/// Everything an archive command needs, assembled by the caller.
#[derive(Clone)]
pub struct ArchiveConfig {
    pub stanza: String,
    pub pg_path: PathBuf,
    pub spool_path: PathBuf,
    pub lock_path: PathBuf,
    pub repos: Vec<Repo>,
    pub compress_type: Option<CompressType>,
    pub compress_level: Option<i32>,
    pub archive_async: bool,
    pub archive_timeout: Duration,
    pub protocol_timeout: Duration,
    /// Spool queue ceiling in bytes.
    pub queue_max: u64,
    pub process_max: usize,
}

impl ArchiveConfig {
    pub fn pg_storage(&self) -> Storage {
        Storage::posix(&self.pg_path)
    }

    pub fn spool_storage(&self) -> Storage {
        Storage::spool(&self.spool_path, &self.stanza)
    }

    /// Projected queue depth in segments: at least the caller's segment
    /// plus one readahead.
    pub fn queue_size(&self, wal_segment_size: u32) -> usize {
        ((self.queue_max / u64::from(wal_segment_size)) as usize).max(2)
    }
}

/// Is this a bare WAL segment name (as opposed to a history file)?
pub fn is_segment_name(name: &str) -> bool {
    WAL_SEGMENT_NAME_RE.is_match(name)
}

/// Repository path of an archived file: segments live under their
/// 16-character prefix directory, history files at the archive-id root.
pub fn archive_repo_path(archive_id: &str, file_name: &str) -> String {
    if is_segment_name(&file_name[..24.min(file_name.len())])
        && file_name.len() >= 24
        && !file_name.ends_with(".history")
    {
        format!("<REPO:ARCHIVE>/{archive_id}/{}/{file_name}", &file_name[..16])
    } else {
        format!("<REPO:ARCHIVE>/{archive_id}/{file_name}")
    }
}

/// Find archived copies of `segment` (any checksum/extension) in one
/// repository. Returns file names sorted ascending.
pub fn segment_find(repo: &Repo, archive_id: &str, segment: &str) -> Result<Vec<String>> {
    let dir = format!("<REPO:ARCHIVE>/{archive_id}/{}", &segment[..16]);
    let mut found: Vec<String> = repo
        .storage
        .list(&dir)?
        .into_iter()
        .filter(|name| name.len() >= 24 && &name[..24] == segment)
        .collect();
    found.sort();
    Ok(found)
}

// ----------------------------------------------------------------------------
// Status files

/// Decoded status for one segment in the spool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// `.ok`, with an optional message (push: warning; get: no data).
    Ok(Option<String>),
    /// `.error` with the code/message it carried.
    Error { code: i32, message: String },
}

/// Write a status file for `segment`, replacing any existing status.
pub fn status_write(
    spool: &Storage,
    mode: ArchiveMode,
    segment: &str,
    status: &ArchiveStatus,
) -> Result<()> {
    status_clear(spool, mode, segment)?;
    let (ext, content) = match status {
        ArchiveStatus::Ok(None) => ("ok", String::new()),
        ArchiveStatus::Ok(Some(message)) => ("ok", format!("0\n{message}")),
        ArchiveStatus::Error { code, message } => ("error", format!("{code}\n{message}")),
    };
    let path = format!("{}/{segment}.{ext}", mode.spool_expr());
    spool.put(&path, content.as_bytes(), FilterGroup::new())
}

/// Remove both status files for `segment`.
pub fn status_clear(spool: &Storage, mode: ArchiveMode, segment: &str) -> Result<()> {
    for ext in ["ok", "error"] {
        spool.remove(&format!("{}/{segment}.{ext}", mode.spool_expr()), false)?;
    }
    Ok(())
}

/// Read the status for `segment`, if any.
pub fn status_read(
    spool: &Storage,
    mode: ArchiveMode,
    segment: &str,
) -> Result<Option<ArchiveStatus>> {
    let ok_path = format!("{}/{segment}.ok", mode.spool_expr());
    let error_path = format!("{}/{segment}.error", mode.spool_expr());

    if let Some(data) = spool.get(&ok_path, true, FilterGroup::new())? {
        let content = String::from_utf8_lossy(&data);
        let message = content
            .split_once('\n')
            .map(|(_code, message)| message.trim().to_owned())
            .filter(|message| !message.is_empty());
        return Ok(Some(ArchiveStatus::Ok(message)));
    }
    if let Some(data) = spool.get(&error_path, true, FilterGroup::new())? {
        let content = String::from_utf8_lossy(&data);
        let (code, message) = content
            .split_once('\n')
            .ok_or_else(|| {
                Error::Format(format!("status file for '{segment}' missing error code"))
            })?;
        let code: i32 = code.trim().parse().map_err(|_| {
            Error::Format(format!("invalid error code in status file for '{segment}'"))
        })?;
        return Ok(Some(ArchiveStatus::Error { code, message: message.trim().to_owned() }));
    }
    Ok(None)
}
