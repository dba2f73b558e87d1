//! archive-get: fetch a WAL file from the repository for the cluster's
//! `restore_command`.
//!
//! A segment that does not exist is a valid answer (recovery probes past
//! the end of archived WAL), so "not found" is reported as a result, not
//! an error. Asynchronous mode prefetches a readahead queue into the
//! spool so recovery does not wait on the repository for every segment.

use either::{Left, Right};

use super::{
    is_segment_name, segment_find, status_clear, status_read, status_write, ArchiveConfig,
    ArchiveMode, ArchiveStatus,
};
use crate::error::{Error, Result};
use crate::filter::{CipherFilter, CipherMode, CompressType, DecompressFilter, FilterGroup};
use crate::info::InfoArchive;
use crate::lock::{self, LockType};
use crate::pg::wal::timeline_history_parse;
use crate::pg::{PgControl, WalSegment};
use crate::repo::Repo;
use crate::storage::Storage;
use crate::wait::Wait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveGetResult {
    /// Found; carries the repository file name for logging.
    Found(String),
    NotFound,
}

/// Fetch `wal_file` (segment or history file) to `dest` (a path the
/// server passed as `%p`, relative to the data directory or absolute).
pub fn cmd_archive_get(cfg: &ArchiveConfig, wal_file: &str, dest: &str) -> Result<ArchiveGetResult> {
    if wal_file.is_empty() || wal_file.contains('/') {
        return Err(Error::ParamInvalid(format!("invalid WAL file name '{wal_file}'")));
    }
    let pg_storage = cfg.pg_storage();

    if cfg.archive_async && is_segment_name(wal_file) {
        get_async(cfg, wal_file, dest, &pg_storage)
    } else {
        let control = PgControl::read(&pg_storage)?;
        match resolve(cfg, &control, wal_file)? {
            Some(found) => {
                let data = fetch(&found)?;
                pg_storage.put(dest, &data, FilterGroup::new())?;
                Ok(ArchiveGetResult::Found(found.file_name))
            }
            None => Ok(ArchiveGetResult::NotFound),
        }
    }
}

// ----------------------------------------------------------------------------

/// A located archive file: which repo, which path, how to decode it.
struct Located {
    repo: Repo,
    repo_path: String,
    file_name: String,
    wal_cipher_pass: Option<String>,
}

/// Search every repository (in order) for `wal_file`, following timeline
/// history when the segment is missing on its own timeline.
fn resolve(cfg: &ArchiveConfig, control: &PgControl, wal_file: &str) -> Result<Option<Located>> {
    for repo in &cfg.repos {
        let info = repo.load_archive_info()?;

        // Newest first across incarnations matching this cluster.
        let mut archive_ids: Vec<String> = info
            .history
            .records()
            .iter()
            .rev()
            .filter(|record| {
                record.version == control.version && record.system_id == control.system_id
            })
            .map(|record| record.archive_id())
            .collect();
        if archive_ids.is_empty() {
            return Err(Error::ArchiveMismatch(format!(
                "unable to retrieve the archive id for database version '{}' and system-id \
                 '{}'",
                control.version, control.system_id
            )));
        }
        // History files may predate the newest incarnation.
        if !is_segment_name(wal_file) {
            for archive_id in archive_ids.clone() {
                let repo_path = format!("<REPO:ARCHIVE>/{archive_id}/{wal_file}");
                if repo.storage.exists(&repo_path)? {
                    return Ok(Some(Located {
                        repo: repo.clone(),
                        repo_path,
                        file_name: wal_file.to_owned(),
                        wal_cipher_pass: info.cipher_pass.clone(),
                    }));
                }
            }
            continue;
        }

        for archive_id in archive_ids.drain(..) {
            if let Some(located) =
                segment_locate(repo, &info, &archive_id, control, wal_file)?
            {
                return Ok(Some(located));
            }
        }
    }
    Ok(None)
}

fn segment_locate(
    repo: &Repo,
    info: &InfoArchive,
    archive_id: &str,
    control: &PgControl,
    segment: &str,
) -> Result<Option<Located>> {
    let mut candidates = vec![segment.to_owned()];

    // The requested timeline may have been created after this segment was
    // written; its history file names the ancestor active back then.
    let requested = WalSegment::parse(segment, control.wal_segment_size)?;
    let history_path = format!("<REPO:ARCHIVE>/{archive_id}/{:08X}.history", requested.timeline);
    if let Some(data) = repo.storage.get(&history_path, true, FilterGroup::new())? {
        let items = timeline_history_parse(&String::from_utf8_lossy(&data))?;
        for item in items {
            let switch_segno = item.lsn.0 / u64::from(control.wal_segment_size);
            if requested.segno < switch_segno
                || (requested.segno == switch_segno && item.lsn.0 % u64::from(control.wal_segment_size) != 0)
            {
                let ancestor =
                    WalSegment { timeline: item.timeline, segno: requested.segno };
                candidates.push(ancestor.name(control.wal_segment_size));
                break;
            }
        }
    }

    for candidate in candidates {
        let found = segment_find(repo, archive_id, &candidate)?;
        if found.len() > 1 {
            return Err(Error::ArchiveMismatch(format!(
                "duplicates found in archive for WAL segment '{candidate}': {}",
                found.join(", ")
            )));
        }
        if let Some(file_name) = found.into_iter().next() {
            return Ok(Some(Located {
                repo: repo.clone(),
                repo_path: super::archive_repo_path(archive_id, &file_name),
                file_name,
                wal_cipher_pass: info.cipher_pass.clone(),
            }));
        }
    }
    Ok(None)
}

/// Read and decode a located file back to raw WAL bytes.
fn fetch(located: &Located) -> Result<Vec<u8>> {
    let mut filters = FilterGroup::new();
    if let Some(pass) = &located.wal_cipher_pass {
        filters = filters.add(Box::new(CipherFilter::new(CipherMode::Decrypt, pass)?));
    }
    if let Some(compress_type) = CompressType::from_name(&located.file_name) {
        filters = filters.add(Box::new(DecompressFilter::new(compress_type)));
    }
    Ok(located
        .repo
        .storage
        .get(&located.repo_path, false, filters)?
        .expect("missing file errors"))
}

// ----------------------------------------------------------------------------

fn get_async(
    cfg: &ArchiveConfig,
    segment: &str,
    dest: &str,
    pg_storage: &Storage,
) -> Result<ArchiveGetResult> {
    let spool = cfg.spool_storage();
    let payload = format!("{}/{segment}", ArchiveMode::Get.spool_expr());

    let mut forked = false;
    let mut confess_on_error = false;
    let mut wait = Wait::new(cfg.archive_timeout);

    loop {
        // A spooled payload wins: take it and consume its status.
        if spool.exists(&payload)? {
            let dest_resolved = pg_storage.resolve(dest)?;
            spool.move_file(&payload, &dest_resolved.to_string_lossy())?;
            status_clear(&spool, ArchiveMode::Get, segment)?;
            return Ok(ArchiveGetResult::Found(segment.to_owned()));
        }
        match status_read(&spool, ArchiveMode::Get, segment)? {
            Some(ArchiveStatus::Ok(Some(_message))) => {
                // The worker looked and the segment does not exist.
                status_clear(&spool, ArchiveMode::Get, segment)?;
                return Ok(ArchiveGetResult::NotFound);
            }
            Some(ArchiveStatus::Ok(None)) => {
                // Status precedes the payload; loop for the payload.
            }
            Some(ArchiveStatus::Error { code, message }) if confess_on_error => {
                return Err(Error::from_code(code, message));
            }
            _ => {}
        }

        if !forked {
            match lock::try_acquire(&cfg.lock_path, &cfg.stanza, LockType::Archive)? {
                Right(held) => {
                    let worker_cfg = cfg.clone();
                    let anchor = segment.to_owned();
                    std::thread::Builder::new()
                        .name(format!("archive-get:{}", cfg.stanza))
                        .spawn(move || {
                            get_async_worker(&worker_cfg, held, &anchor);
                        })
                        .map_err(|err| {
                            Error::Runtime(format!("unable to start worker: {err}"))
                        })?;
                }
                Left(_pid) => {}
            }
            forked = true;
        }
        confess_on_error = true;

        if !wait.more() {
            return Err(Error::ArchiveTimeout(format!(
                "unable to get WAL file '{segment}' asynchronously after {}s",
                cfg.archive_timeout.as_secs()
            )));
        }
    }
}

/// Prefetch the requested segment and its successors into the spool.
fn get_async_worker(cfg: &ArchiveConfig, lock: lock::LockHeld, anchor: &str) {
    if let Err(err) = get_async_worker_run(cfg, anchor) {
        let spool = cfg.spool_storage();
        let status = ArchiveStatus::Error { code: err.code(), message: err.to_string() };
        if let Err(status_err) = status_write(&spool, ArchiveMode::Get, anchor, &status) {
            log::warn!("unable to write status for '{anchor}': {status_err}");
        }
    }
    lock.release();
}

fn get_async_worker_run(cfg: &ArchiveConfig, anchor: &str) -> Result<()> {
    let pg_storage = cfg.pg_storage();
    let spool = cfg.spool_storage();
    let control = PgControl::read(&pg_storage)?;

    let queue_size = cfg.queue_size(control.wal_segment_size);
    let mut candidates = Vec::with_capacity(queue_size);
    let mut segment = WalSegment::parse(anchor, control.wal_segment_size)?;
    for _ in 0..queue_size {
        candidates.push(segment.name(control.wal_segment_size));
        segment = segment.next(control.version, control.wal_segment_size);
    }

    // Sweep: drop spool entries outside the projected queue.
    for name in spool.list(ArchiveMode::Get.spool_expr())? {
        let base = name.trim_end_matches(".ok").trim_end_matches(".error");
        if !candidates.iter().any(|candidate| candidate == base) {
            spool.remove(&format!("{}/{name}", ArchiveMode::Get.spool_expr()), false)?;
        }
    }

    for candidate in &candidates {
        let payload = format!("{}/{candidate}", ArchiveMode::Get.spool_expr());
        if spool.exists(&payload)?
            || matches!(
                status_read(&spool, ArchiveMode::Get, candidate)?,
                Some(ArchiveStatus::Ok(_))
            )
        {
            continue;
        }
        match resolve(cfg, &control, candidate)? {
            Some(found) => {
                let data = fetch(&found)?;
                spool.put(&payload, &data, FilterGroup::new())?;
                status_write(&spool, ArchiveMode::Get, candidate, &ArchiveStatus::Ok(None))?;
            }
            None => {
                // End of archived WAL: report it for the requested segment
                // and stop prefetching.
                status_write(
                    &spool,
                    ArchiveMode::Get,
                    candidate,
                    &ArchiveStatus::Ok(Some(format!(
                        "unable to find '{candidate}' in the archive"
                    ))),
                )?;
                break;
            }
        }
    }
    Ok(())
}
