//! The backup engine: the start/stop protocol with the database, the
//! manifest-driven parallel file copier, bundling, and standby
//! coordination.

pub mod file;

pub use file::{BackupCopyResult, BackupFileContext, BackupFileResult};

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::error::{Error, Result};
use crate::expire;
use crate::filter::CompressType;
use crate::info::{backup_label, BackupRecord, BackupType, InfoArchive};
use crate::lock::{self, LockType};
use crate::manifest::{Manifest, ManifestFile};
use crate::parallel;
use crate::pg::{DbClient, Lsn, PgControl, WalSegment};
use crate::protocol::{ProtoCommand, ProtoJob, ProtoValue};
use crate::repo::Repo;
use crate::storage::Storage;
use crate::wait::Wait;

/// Default ceiling for files that join a bundle rather than getting
/// their own repository object.
pub const BUNDLE_LIMIT_DEFAULT: u64 = 2 * 1024 * 1024;
/// Default target size of one bundle object.
pub const BUNDLE_SIZE_DEFAULT: u64 = 20 * 1024 * 1024;

pub struct BackupConfig {
    pub stanza: String,
    pub pg_path: PathBuf,
    pub lock_path: PathBuf,
    pub repo: Repo,
    pub backup_type: BackupType,
    pub compress_type: Option<CompressType>,
    pub compress_level: Option<i32>,
    pub process_max: usize,
    pub start_fast: bool,
    pub stop_auto: bool,
    pub archive_check: bool,
    pub archive_timeout: Duration,
    pub db_timeout: Duration,
    pub protocol_timeout: Duration,
    pub backup_standby: bool,
    pub bundle: bool,
    pub bundle_limit: u64,
    pub bundle_size: u64,
    pub block_incr: bool,
    /// Run retention expiry after a successful backup.
    pub expire_auto: bool,
    pub retention_full: Option<usize>,
    pub retention_diff: Option<usize>,
    pub retention_archive: Option<usize>,
}

/// What a completed backup looks like to the caller.
#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub label: String,
    pub backup_type: BackupType,
    pub files_total: usize,
    pub files_copied: usize,
    pub size: u64,
    pub size_repo: u64,
}

/// Run a backup against the cluster behind `primary` (and, when
/// `backup_standby`, copy after `standby` has replayed past the start).
pub fn cmd_backup(
    cfg: &BackupConfig,
    primary: &mut dyn DbClient,
    mut standby: Option<&mut dyn DbClient>,
) -> Result<BackupSummary> {
    lock::stop_check(&cfg.lock_path, Some(&cfg.stanza))?;
    let mut backup_lock = lock::acquire(&cfg.lock_path, &cfg.stanza, LockType::Backup)?;

    let pg_storage = Storage::posix(&cfg.pg_path);
    let control = PgControl::read(&pg_storage)?;

    let mut info_backup = cfg.repo.load_backup_info()?;
    info_backup.check_pg(
        control.version,
        control.system_id,
        control.catalog_version,
        control.control_version,
    )?;
    let info_archive = cfg.repo.load_archive_info()?;
    info_archive.check_pg(control.version, control.system_id)?;

    // ------------------------------------------------------------------
    // Start protocol

    let checkpoint_timeout = primary.session_init("pgvault [backup]")?;
    if !cfg.start_fast && cfg.db_timeout < checkpoint_timeout {
        log::warn!(
            "db-timeout ({}s) is smaller than checkpoint_timeout ({}s) - timeout may occur \
             before the backup starts\nHINT: consider --start-fast",
            cfg.db_timeout.as_secs(),
            checkpoint_timeout.as_secs()
        );
    }
    if primary.is_in_recovery()? {
        return Err(Error::DbMismatch(
            "the primary database connection points at a cluster in recovery\nHINT: is the \
             primary host configured correctly?"
                .into(),
        ));
    }
    if !primary.advisory_lock()? {
        return Err(Error::LockAcquire(
            "unable to acquire the backup advisory lock\nHINT: is another backup already \
             running on the cluster?"
                .into(),
        ));
    }
    if cfg.stop_auto && control.version < crate::pg::version::PG_VERSION_96 {
        // A prior exclusive backup left running blocks a new start.
        if primary.backup_stop().is_ok() {
            log::warn!("a prior backup was in progress and has been stopped");
        }
    }

    // Capture the live segment first so archive-check can tell whether
    // the start produced a new one.
    let segment_before = if cfg.archive_check {
        primary.wal_segment_current().ok()
    } else {
        None
    };

    let started = primary.backup_start(cfg.start_fast)?;

    // The on-disk control file must reflect the start checkpoint, or the
    // cluster's view and ours have diverged.
    let control = PgControl::read(&pg_storage)?;
    if control.checkpoint < started.lsn {
        return Err(Error::DbMismatch(format!(
            "current checkpoint '{}' is less than backup start '{}'",
            control.checkpoint, started.lsn
        )));
    }
    if cfg.archive_check && segment_before.as_deref() == Some(started.wal_segment_name.as_str()) {
        // No segment boundary was crossed; force one so the start segment
        // becomes archivable.
        primary.switch_wal()?;
    }
    let start_segment = WalSegment::parse(&started.wal_segment_name, control.wal_segment_size)?;
    if start_segment.timeline != control.timeline {
        return Err(Error::DbMismatch(format!(
            "WAL segment timeline {:X} in '{}' does not match pg_control timeline {:X}",
            start_segment.timeline, started.wal_segment_name, control.timeline
        )));
    }

    // ------------------------------------------------------------------
    // Standby replay wait

    if cfg.backup_standby {
        let standby = standby
            .as_deref_mut()
            .ok_or_else(|| Error::DbConnect("backup-standby requires a standby connection".into()))?;
        standby.session_init("pgvault [backup]")?;
        if !standby.is_in_recovery()? {
            return Err(Error::DbMismatch(
                "the standby database connection points at a primary".into(),
            ));
        }
        standby_replay_wait(standby, started.lsn, cfg.archive_timeout)?;
    }

    // ------------------------------------------------------------------
    // Label and manifest

    let mut backup_type = cfg.backup_type;
    let prior_record = info_backup.latest_prior(backup_type).cloned();
    if backup_type != BackupType::Full && prior_record.is_none() {
        log::warn!("no prior backup exists, {backup_type} backup has been changed to full");
        backup_type = BackupType::Full;
    }
    let label = backup_label(backup_type, prior_record.as_ref().map(|r| r.label.as_str()), Utc::now());
    log::info!("new backup label = {label}");
    backup_lock.write_progress(&label)?;

    let mut manifest = Manifest::build(&pg_storage, &control, info_backup.history.current().id)?;
    manifest.backup.label = label.clone();
    manifest.backup.backup_type = Some(backup_type);
    manifest.backup.prior = prior_record.as_ref().map(|record| record.label.clone());
    manifest.backup.timestamp_start = Utc::now().timestamp();
    manifest.backup.lsn_start = started.lsn.to_string();
    manifest.backup.archive_start = started.wal_segment_name.clone();
    manifest.options.compress_type = cfg.compress_type.map(|t| t.extension().to_owned());
    manifest.options.bundle = cfg.bundle;
    manifest.options.block_incr = cfg.block_incr;
    manifest.options.page_checksum = control.page_checksum_version != 0;
    if cfg.repo.cipher_pass.is_some() {
        manifest.cipher_pass = Some(crate::info::cipher_pass_gen());
    }

    // Deduplicate against the prior manifest: a file with the same size
    // and timestamp is inherited by reference instead of re-copied.
    if let Some(prior_record) = &prior_record {
        let prior_manifest = Manifest::load(
            &cfg.repo.storage,
            &prior_record.label,
            info_backup.cipher_pass.as_deref(),
        )?;
        for entry in &mut manifest.files {
            if let Some(prior) = prior_manifest.file(&entry.name) {
                if prior.size == entry.size
                    && prior.timestamp == entry.timestamp
                    && prior.checksum.is_some()
                {
                    entry.reference =
                        Some(prior.reference.clone().unwrap_or_else(|| prior_record.label.clone()));
                    entry.checksum = prior.checksum.clone();
                    entry.size_repo = prior.size_repo;
                    entry.bundle_id = prior.bundle_id;
                    entry.bundle_offset = prior.bundle_offset;
                } else if cfg.block_incr {
                    entry.block_incr_ref = Some(prior_record.label.clone());
                }
            }
        }
    }
    manifest.validate()?;

    // ------------------------------------------------------------------
    // Parallel copy

    let context = BackupFileContext {
        pg_storage: pg_storage.clone(),
        repo_storage: cfg.repo.storage.clone(),
        label: label.clone(),
        compress_type: cfg.compress_type,
        compress_level: cfg.compress_level,
        cipher_pass: manifest.cipher_pass.clone(),
        page_checksum: control.page_checksum_version != 0,
        lsn_limit: started.lsn.0,
        segment_page_total: (1024 * 1024 * 1024) / control.page_size.max(1),
    };
    let copied = dispatch_files(cfg, &context, &mut manifest)?;

    // ------------------------------------------------------------------
    // Stop protocol

    // A primary that silently dropped into recovery mid-copy (failover
    // under our feet) invalidates everything copied so far.
    if primary.is_in_recovery()? {
        return Err(Error::DbMismatch(
            "the primary entered recovery during the backup".into(),
        ));
    }
    let stopped = primary.backup_stop()?;
    manifest.backup.lsn_stop = stopped.lsn.to_string();
    manifest.backup.archive_stop = stopped.wal_segment_name.clone();
    manifest.backup.timestamp_stop = Utc::now().timestamp();

    if cfg.backup_standby {
        if let Some(standby) = standby.as_deref_mut() {
            standby_replay_wait(standby, stopped.lsn, cfg.archive_timeout)?;
        }
    }

    // backup_label (and tablespace_map) are synthesized into the backup
    // rather than copied from disk.
    if let Some(content) = &stopped.backup_label {
        synthesize_file(&context, &mut manifest, "pg_data/backup_label", content)?;
    }
    if let Some(content) = &stopped.tablespace_map {
        synthesize_file(&context, &mut manifest, "pg_data/tablespace_map", content)?;
    }

    // The stop segment must land in the archive before the backup can be
    // called consistent.
    if cfg.archive_check {
        archive_ready_wait(cfg, &info_archive, &stopped.wal_segment_name)?;
    }

    // Record databases for selective restore.
    manifest.databases = primary
        .database_list()?
        .into_iter()
        .map(|db| crate::manifest::ManifestDb {
            name: db.name,
            oid: db.oid,
            last_system_oid: db.last_system_oid,
        })
        .collect();
    manifest.databases.sort_by_key(|db| db.oid);

    // ------------------------------------------------------------------
    // Persist

    manifest.save(&cfg.repo.storage, info_backup.cipher_pass.as_deref())?;

    let size: u64 = manifest.files.iter().map(|f| f.size).sum();
    let size_repo: u64 = manifest.files.iter().map(|f| f.size_repo).sum();
    info_backup.add(BackupRecord {
        label: label.clone(),
        backup_type,
        prior: manifest.backup.prior.clone(),
        timestamp_start: manifest.backup.timestamp_start,
        timestamp_stop: manifest.backup.timestamp_stop,
        lsn_start: manifest.backup.lsn_start.clone(),
        lsn_stop: manifest.backup.lsn_stop.clone(),
        archive_start: manifest.backup.archive_start.clone(),
        archive_stop: manifest.backup.archive_stop.clone(),
        pg_id: manifest.pg_id,
        size,
        size_repo,
        reference: manifest.reference_list(),
    });
    info_backup.save(&cfg.repo.storage, cfg.repo.cipher_pass())?;

    if cfg.expire_auto {
        expire::cmd_expire(&expire::ExpireConfig {
            repo: cfg.repo.clone(),
            retention_full: cfg.retention_full,
            retention_diff: cfg.retention_diff,
            retention_archive: cfg.retention_archive,
        })?;
    }

    Ok(BackupSummary {
        label,
        backup_type,
        files_total: manifest.files.len(),
        files_copied: copied,
        size,
        size_repo,
    })
}

// ----------------------------------------------------------------------------

/// Dispatch every not-yet-referenced file over the worker pool; update
/// the manifest from the results. Returns the number of files copied.
fn dispatch_files(
    cfg: &BackupConfig,
    context: &BackupFileContext,
    manifest: &mut Manifest,
) -> Result<usize> {
    // Largest files first keeps the pool busy to the end.
    let mut singles: Vec<(String, u64)> = Vec::new();
    let mut bundled: Vec<(String, u64)> = Vec::new();
    for entry in &manifest.files {
        if entry.reference.is_some() {
            continue;
        }
        if cfg.bundle && entry.size < cfg.bundle_limit {
            bundled.push((entry.name.clone(), entry.size));
        } else {
            singles.push((entry.name.clone(), entry.size));
        }
    }
    singles.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    // Pack small files into bundles in name order for locality.
    let mut bundles: Vec<(u64, Vec<(String, u64)>)> = Vec::new();
    let mut current: Vec<(String, u64)> = Vec::new();
    let mut current_size = 0u64;
    for (name, size) in bundled {
        if current_size + size > cfg.bundle_size && !current.is_empty() {
            bundles.push((bundles.len() as u64 + 1, std::mem::take(&mut current)));
            current_size = 0;
        }
        current_size += size;
        current.push((name, size));
    }
    if !current.is_empty() {
        bundles.push((bundles.len() as u64 + 1, current));
    }

    let mut jobs: Vec<ProtoJob> = Vec::new();
    for (name, size) in &singles {
        jobs.push(ProtoJob {
            key: name.clone(),
            command: ProtoCommand::new(
                "backup-file",
                vec![ProtoValue::Str(name.clone()), ProtoValue::U64(*size)],
            ),
        });
    }
    for (bundle_id, members) in &bundles {
        jobs.push(ProtoJob {
            key: format!("bundle/{bundle_id}"),
            command: ProtoCommand::new(
                "backup-bundle",
                vec![
                    ProtoValue::U64(*bundle_id),
                    ProtoValue::StrList(members.iter().map(|(name, _)| name.clone()).collect()),
                    ProtoValue::List(members.iter().map(|(_, size)| ProtoValue::U64(*size)).collect()),
                ],
            ),
        });
    }

    let bundle_of: std::collections::HashMap<String, u64> = bundles
        .iter()
        .flat_map(|(id, members)| members.iter().map(move |(name, _)| (name.clone(), *id)))
        .collect();

    let mut queue = jobs.into_iter();
    let handler =
        |command: &ProtoCommand| -> Result<Vec<ProtoValue>> { file::execute(context, command) };
    let mut copied = 0usize;
    let mut vanished: Vec<String> = Vec::new();
    parallel::execute(
        cfg.process_max,
        "back up file",
        cfg.protocol_timeout,
        |_worker| Ok(queue.next()),
        &handler,
        |outcome| {
            for value in &outcome.output {
                let result = file::result_from_proto(value)?;
                apply_result(manifest, &bundle_of, &result, &mut vanished, &mut copied)?;
            }
            Ok(())
        },
    )?;

    // Files that vanished mid-backup are dropped from the manifest.
    manifest.files.retain(|entry| !vanished.contains(&entry.name));
    Ok(copied)
}

fn apply_result(
    manifest: &mut Manifest,
    bundle_of: &std::collections::HashMap<String, u64>,
    result: &BackupFileResult,
    vanished: &mut Vec<String>,
    copied: &mut usize,
) -> Result<()> {
    if result.result == BackupCopyResult::Noop {
        log::info!("file '{}' was removed during the backup", result.name);
        vanished.push(result.name.clone());
        return Ok(());
    }
    if result.result == BackupCopyResult::Checksum {
        log::warn!(
            "file '{}' changed size (to {}) during the backup",
            result.name,
            result.copy_size
        );
    }
    *copied += 1;
    let bundle_id = bundle_of.get(&result.name).copied();
    let entry = manifest
        .file_mut(&result.name)
        .ok_or_else(|| Error::Assert(format!("result for unknown file '{}'", result.name)))?;
    entry.size = result.copy_size;
    entry.size_repo = result.repo_size;
    entry.checksum = result.checksum.clone();
    entry.bundle_id = bundle_id;
    entry.bundle_offset = result.bundle_offset;
    if let Some(page) = &result.page_checksum {
        entry.checksum_page = page["valid"].as_bool();
        if let Some(error) = page.get("error") {
            entry.checksum_page_error = Some(error.clone());
            log::warn!(
                "invalid page checksums found in file '{}': {error}",
                result.name
            );
        }
    }
    Ok(())
}

/// Write synthesized content (backup_label, tablespace_map) into the
/// backup as a first-class manifest file.
fn synthesize_file(
    context: &BackupFileContext,
    manifest: &mut Manifest,
    name: &str,
    content: &str,
) -> Result<()> {
    let mut filters = crate::filter::FilterGroup::new();
    if let Some(compress_type) = context.compress_type {
        let level = context
            .compress_level
            .unwrap_or_else(|| compress_type.default_level());
        filters = filters.add(Box::new(crate::filter::CompressFilter::new(compress_type, level)));
    }
    if let Some(pass) = &context.cipher_pass {
        filters = filters.add(Box::new(crate::filter::CipherFilter::new(
            crate::filter::CipherMode::Encrypt,
            pass,
        )?));
    }
    filters = filters.add(Box::new(crate::filter::SizeFilter::new()));
    let repo_path = context.repo_file(name);
    let mut write = context
        .repo_storage
        .new_write(&repo_path, crate::storage::WriteParams::default(), filters)?;
    use std::io::Write as _;
    write
        .write_all(content.as_bytes())
        .map_err(|err| Error::FileWrite(format!("unable to write '{repo_path}': {err}")))?;
    let results = write.close()?;

    manifest.files.push(ManifestFile {
        name: name.to_owned(),
        size: content.len() as u64,
        size_repo: results["size"].as_u64().unwrap_or(0),
        timestamp: Utc::now().timestamp(),
        mode: 0o600,
        user: None,
        group: None,
        checksum: Some(crate::filter::hash::sha1_hex(content.as_bytes())),
        checksum_page: None,
        checksum_page_error: None,
        reference: None,
        bundle_id: None,
        bundle_offset: None,
        block_incr_ref: None,
    });
    manifest.files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(())
}

/// Wait until the standby has replayed past `target`, resetting the
/// deadline whenever replay advances.
fn standby_replay_wait(standby: &mut dyn DbClient, target: Lsn, timeout: Duration) -> Result<()> {
    let mut last: Option<Lsn> = None;
    let mut wait = Wait::new(timeout);
    loop {
        let replayed = standby.replay_lsn()?.ok_or_else(|| {
            Error::DbQuery(
                "unable to query replay lsn on the standby\nHINT: is the standby actually in \
                 recovery?"
                    .into(),
            )
        })?;
        if replayed >= target {
            return Ok(());
        }
        // Progress resets the clock; only a stalled standby times out.
        if last.map(|lsn| replayed > lsn).unwrap_or(false) {
            wait = Wait::new(timeout);
        }
        last = Some(replayed);
        if !wait.more() {
            return Err(Error::Timeout(format!(
                "timeout before standby replayed to {target} - only reached {replayed}"
            )));
        }
    }
}

/// Wait for `segment` to appear in the archive.
fn archive_ready_wait(cfg: &BackupConfig, info: &InfoArchive, segment: &str) -> Result<()> {
    let archive_id = info.archive_id();
    let mut wait = Wait::new(cfg.archive_timeout);
    loop {
        if !crate::archive::segment_find(&cfg.repo, &archive_id, segment)?.is_empty() {
            return Ok(());
        }
        if !wait.more() {
            return Err(Error::ArchiveTimeout(format!(
                "WAL segment '{segment}' was not archived before the {}s timeout\nHINT: is \
                 archive_command configured and working?",
                cfg.archive_timeout.as_secs()
            )));
        }
    }
}
