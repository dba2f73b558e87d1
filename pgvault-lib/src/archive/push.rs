//! archive-push: move a WAL file from the cluster to every repository.
//!
//! Synchronous mode copies directly. Asynchronous mode rendezvouses with
//! (or starts) a worker that pushes the caller's segment plus a projected
//! readahead queue, then waits for the segment's status file.

use either::{Left, Right};

use super::{
    archive_repo_path, is_segment_name, segment_find, status_read, status_write, ArchiveConfig,
    ArchiveMode, ArchiveStatus,
};
use crate::error::{Error, Result};
use crate::filter::hash::sha1_hex;
use crate::filter::{CipherFilter, CipherMode, CompressFilter, FilterGroup};
use crate::lock::{self, LockType};
use crate::parallel;
use crate::pg::{PgControl, WalHeader, WalSegment};
use crate::protocol::{ProtoCommand, ProtoJob, ProtoValue};
use crate::repo::Repo;
use crate::storage::Storage;
use crate::wait::Wait;

/// Per-repository data resolved once per command.
struct RepoArchive {
    repo: Repo,
    archive_id: String,
    wal_cipher_pass: Option<String>,
}

fn repo_archive_load(cfg: &ArchiveConfig, control: &PgControl) -> Result<Vec<RepoArchive>> {
    cfg.repos
        .iter()
        .map(|repo| {
            let info = repo.load_archive_info()?;
            info.check_pg(control.version, control.system_id)?;
            Ok(RepoArchive {
                repo: repo.clone(),
                archive_id: info.archive_id(),
                wal_cipher_pass: info.cipher_pass,
            })
        })
        .collect()
}

/// Push one WAL file to every repository. Returns a warning when the file
/// already existed with the same checksum in some repository.
fn push_file(
    cfg: &ArchiveConfig,
    pg_storage: &Storage,
    control: &PgControl,
    repos: &[RepoArchive],
    source: &str,
    file_name: &str,
) -> Result<Option<String>> {
    let data = pg_storage
        .get(source, false, FilterGroup::new())?
        .expect("missing file errors");
    let segment = is_segment_name(file_name);

    if segment {
        let header = WalHeader::from_bytes(&data)?;
        if header.version != control.version || header.system_id != control.system_id {
            return Err(Error::ArchiveMismatch(format!(
                "WAL file '{file_name}' version {}, system-id {} does not match cluster version \
                 {}, system-id {}\nHINT: are you archiving to the correct stanza?",
                header.version, header.system_id, control.version, control.system_id
            )));
        }
    }

    let checksum = sha1_hex(&data);
    let repo_name = if segment {
        let ext = cfg
            .compress_type
            .map(|t| format!(".{}", t.extension()))
            .unwrap_or_default();
        format!("{file_name}-{checksum}{ext}")
    } else {
        file_name.to_owned()
    };

    let mut warning = None;
    for repo in repos {
        if segment {
            let existing = segment_find(&repo.repo, &repo.archive_id, file_name)?;
            if let Some(found) = existing.first() {
                // Name layout: <24-name>-<40-sha1>[.<ext>]
                let found_checksum = found.get(25..65).unwrap_or_default();
                if found_checksum == checksum {
                    warning = Some(format!(
                        "WAL file '{file_name}' already exists in the archive with the same \
                         checksum\nHINT: this is valid in some recovery scenarios but may also \
                         indicate a problem."
                    ));
                    continue;
                }
                return Err(Error::ArchiveMismatch(format!(
                    "WAL file '{file_name}' already exists in the archive with a different \
                     checksum"
                )));
            }
        }

        let mut filters = FilterGroup::new();
        if segment {
            if let Some(compress_type) = cfg.compress_type {
                let level = cfg.compress_level.unwrap_or_else(|| compress_type.default_level());
                filters = filters.add(Box::new(CompressFilter::new(compress_type, level)));
            }
            if let Some(pass) = &repo.wal_cipher_pass {
                filters = filters.add(Box::new(CipherFilter::new(CipherMode::Encrypt, pass)?));
            }
        }
        repo.repo
            .storage
            .put(&archive_repo_path(&repo.archive_id, &repo_name), &data, filters)?;
    }
    Ok(warning)
}

// ----------------------------------------------------------------------------

/// Push a WAL file; `wal_path` is the path the server passed to
/// `archive_command` (`%p`), relative to the data directory or absolute.
/// Returns the log message for the completed push.
pub fn cmd_archive_push(cfg: &ArchiveConfig, wal_path: &str) -> Result<String> {
    let file_name = wal_path
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::ParamInvalid(format!("invalid WAL path '{wal_path}'")))?
        .to_owned();
    let pg_storage = cfg.pg_storage();

    // History and other non-segment files are never worth a queue.
    if cfg.archive_async && is_segment_name(&file_name) {
        push_async(cfg, wal_path, &file_name)
    } else {
        let control = PgControl::read(&pg_storage)?;
        let repos = repo_archive_load(cfg, &control)?;
        let warning = push_file(cfg, &pg_storage, &control, &repos, wal_path, &file_name)?;
        if let Some(warning) = warning {
            log::warn!("{warning}");
        }
        Ok(format!("pushed WAL file '{file_name}' to the archive"))
    }
}

fn push_async(cfg: &ArchiveConfig, wal_path: &str, segment: &str) -> Result<String> {
    let spool = cfg.spool_storage();
    let mut forked = false;
    // Errors are not confessed on the first poll so a freshly started
    // worker gets the chance to sweep a stale error and retry.
    let mut confess_on_error = false;
    let mut wait = Wait::new(cfg.archive_timeout);

    loop {
        match status_read(&spool, ArchiveMode::Push, segment)? {
            Some(ArchiveStatus::Ok(warning)) => {
                if let Some(warning) = warning {
                    log::warn!("{warning}");
                }
                return Ok(format!(
                    "pushed WAL file '{segment}' to the archive asynchronously"
                ));
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
                    let source_dir = wal_path
                        .rsplit_once('/')
                        .map(|(dir, _)| dir.to_owned())
                        .unwrap_or_default();
                    std::thread::Builder::new()
                        .name(format!("archive-push:{}", cfg.stanza))
                        .spawn(move || {
                            push_async_worker(&worker_cfg, held, &anchor, &source_dir);
                        })
                        .map_err(|err| {
                            Error::Runtime(format!("unable to start worker: {err}"))
                        })?;
                }
                // Another worker already runs; just wait on it.
                Left(_pid) => {}
            }
            forked = true;
        }
        confess_on_error = true;

        if !wait.more() {
            return Err(Error::ArchiveTimeout(format!(
                "unable to push WAL file '{segment}' asynchronously after {}s",
                cfg.archive_timeout.as_secs()
            )));
        }
    }
}

// ----------------------------------------------------------------------------

/// The async worker: project the queue, sweep the spool, push every
/// candidate, and leave one status file per segment. Holds the archive
/// lock for its whole run; it is the spool's only writer.
fn push_async_worker(cfg: &ArchiveConfig, lock: lock::LockHeld, anchor: &str, source_dir: &str) {
    if let Err(err) = push_async_worker_run(cfg, anchor, source_dir) {
        // A worker-level failure marks the anchor so the waiter confesses
        // something rather than timing out.
        let spool = cfg.spool_storage();
        let status =
            ArchiveStatus::Error { code: err.code(), message: err.to_string() };
        if let Err(status_err) = status_write(&spool, ArchiveMode::Push, anchor, &status) {
            log::warn!("unable to write status for '{anchor}': {status_err}");
        }
    }
    lock.release();
}

fn push_async_worker_run(cfg: &ArchiveConfig, anchor: &str, source_dir: &str) -> Result<()> {
    let pg_storage = cfg.pg_storage();
    let spool = cfg.spool_storage();
    let control = PgControl::read(&pg_storage)?;
    let repos = repo_archive_load(cfg, &control)?;

    // Project the queue: the anchor segment plus readahead successors.
    let queue_size = cfg.queue_size(control.wal_segment_size);
    let mut candidates = Vec::with_capacity(queue_size);
    let mut segment = WalSegment::parse(anchor, control.wal_segment_size)?;
    for _ in 0..queue_size {
        candidates.push(segment.name(control.wal_segment_size));
        segment = segment.next(control.version, control.wal_segment_size);
    }

    // Sweep the spool: drop status files for segments outside the
    // projected set (and any stray payloads).
    for name in spool.list(ArchiveMode::Push.spool_expr())? {
        let base = name.trim_end_matches(".ok").trim_end_matches(".error");
        if !candidates.iter().any(|candidate| candidate == base) {
            spool.remove(&format!("{}/{name}", ArchiveMode::Push.spool_expr()), false)?;
        }
    }

    // Keep only candidates that exist in pg_wal and are not yet pushed.
    let mut pending = Vec::new();
    for candidate in candidates {
        let source = if source_dir.is_empty() {
            candidate.clone()
        } else {
            format!("{source_dir}/{candidate}")
        };
        if matches!(
            status_read(&spool, ArchiveMode::Push, &candidate)?,
            Some(ArchiveStatus::Ok(_))
        ) {
            continue;
        }
        if pg_storage.exists(&source)? {
            pending.push((candidate, source));
        }
    }

    // Push in parallel across segments; the handler reports failure as
    // data so every segment gets its own status file.
    let mut queue = pending.into_iter();
    let handler = |command: &ProtoCommand| -> Result<Vec<ProtoValue>> {
        let source = command.param(0)?.as_str()?.to_owned();
        let file_name = command.param(1)?.as_str()?.to_owned();
        match push_file(cfg, &pg_storage, &control, &repos, &source, &file_name) {
            Ok(warning) => Ok(vec![
                ProtoValue::Bool(true),
                ProtoValue::I64(0),
                ProtoValue::OptStr(warning),
            ]),
            Err(err) => Ok(vec![
                ProtoValue::Bool(false),
                ProtoValue::I64(i64::from(err.code())),
                ProtoValue::OptStr(Some(err.to_string())),
            ]),
        }
    };
    parallel::execute(
        cfg.process_max,
        "push WAL file",
        cfg.protocol_timeout,
        |_worker| {
            Ok(queue.next().map(|(candidate, source)| ProtoJob {
                key: candidate.clone(),
                command: ProtoCommand::new(
                    "archive-push-file",
                    vec![ProtoValue::Str(source), ProtoValue::Str(candidate)],
                ),
            }))
        },
        &handler,
        |outcome| {
            let ok = outcome.output[0].as_bool()?;
            let status = if ok {
                ArchiveStatus::Ok(outcome.output[2].as_opt_str()?.map(str::to_owned))
            } else {
                ArchiveStatus::Error {
                    code: outcome.output[1].as_i64()? as i32,
                    message: outcome.output[2]
                        .as_opt_str()?
                        .unwrap_or("unknown error")
                        .to_owned(),
                }
            };
            status_write(&spool, ArchiveMode::Push, &outcome.key, &status)
        },
    )
}
