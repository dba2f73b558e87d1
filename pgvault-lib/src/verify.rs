//! The repository verifier: a read-only audit of one repository's WAL
//! archive and backups.
//!
//! WAL segments are grouped into contiguous ranges (a break wherever a
//! name is not its predecessor's successor), duplicates and impossible
//! names are culled, and every remaining file is re-read through its
//! decode pipeline and checked against the checksum embedded in its
//! name. Backups get the symmetric treatment against their manifests,
//! and finally each backup's required WAL range is reconciled against
//! the valid ranges.

use std::collections::{HashMap, HashSet};

use serde_json::json;

use crate::archive::archive_repo_path;
use crate::error::{Error, Result};
use crate::filter::{
    CipherFilter, CipherMode, CompressType, DecompressFilter, FilterGroup, HashFilter, SizeFilter,
};
use crate::info::{InfoArchive, InfoBackup};
use crate::manifest::Manifest;
use crate::parallel;
use crate::pg::version::{PgVersion, PG_VERSION_92};
use crate::pg::wal::{wal_segment_prefix, WalSegment, WAL_SEGMENT_FILE_RE};
use crate::protocol::{ProtoCommand, ProtoJob, ProtoValue};
use crate::repo::Repo;

pub struct VerifyConfig {
    pub repo: Repo,
    pub process_max: usize,
    /// Verify a single backup set (and the WAL it needs) when set.
    pub set: Option<String>,
    /// Assumed segment size when building ranges; verify runs without a
    /// cluster to ask.
    pub wal_segment_size: u32,
    pub protocol_timeout: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyFileStatus {
    Ok,
    Missing,
    ChecksumMismatch,
    SizeInvalid,
    Other,
}

impl VerifyFileStatus {
    fn as_str(&self) -> &'static str {
        match self {
            VerifyFileStatus::Ok => "ok",
            VerifyFileStatus::Missing => "missing",
            VerifyFileStatus::ChecksumMismatch => "checksum-mismatch",
            VerifyFileStatus::SizeInvalid => "size-invalid",
            VerifyFileStatus::Other => "other",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "ok" => VerifyFileStatus::Ok,
            "missing" => VerifyFileStatus::Missing,
            "checksum-mismatch" => VerifyFileStatus::ChecksumMismatch,
            "size-invalid" => VerifyFileStatus::SizeInvalid,
            _ => VerifyFileStatus::Other,
        }
    }
}

/// A contiguous run of archived WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRange {
    pub start: String,
    pub stop: String,
    /// Segment names within the range that failed verification.
    pub invalid: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerifyArchiveResult {
    pub archive_id: String,
    pub total: usize,
    pub valid: usize,
    pub missing: usize,
    pub checksum_invalid: usize,
    pub size_invalid: usize,
    pub other: usize,
    pub ranges: Vec<WalRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyBackupStatus {
    Ok,
    /// One or more files failed verification.
    Invalid,
    /// The newest backup with no manifest yet; assumed still running.
    InProgress,
    /// Files verify but required WAL is missing or invalid.
    WalMissing,
}

#[derive(Debug, Clone)]
pub struct VerifyBackupResult {
    pub label: String,
    pub status: VerifyBackupStatus,
    pub files_checked: usize,
    pub files_invalid: usize,
}

#[derive(Debug, Clone)]
pub struct VerifyResult {
    pub archive: Vec<VerifyArchiveResult>,
    pub backups: Vec<VerifyBackupResult>,
    /// Total problems found, including structural ones (duplicates,
    /// unexpected files).
    pub errors: usize,
}

impl VerifyResult {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "archive": self
                .archive
                .iter()
                .map(|a| {
                    json!({
                        "archive-id": a.archive_id,
                        "total": a.total,
                        "valid": a.valid,
                        "missing": a.missing,
                        "checksum-invalid": a.checksum_invalid,
                        "size-invalid": a.size_invalid,
                        "other": a.other,
                        "ranges": a
                            .ranges
                            .iter()
                            .map(|r| json!({
                                "start": r.start,
                                "stop": r.stop,
                                "invalid": r.invalid,
                            }))
                            .collect::<Vec<_>>(),
                    })
                })
                .collect::<Vec<_>>(),
            "backups": self
                .backups
                .iter()
                .map(|b| {
                    json!({
                        "label": b.label,
                        "status": match b.status {
                            VerifyBackupStatus::Ok => "ok",
                            VerifyBackupStatus::Invalid => "invalid",
                            VerifyBackupStatus::InProgress => "in-progress",
                            VerifyBackupStatus::WalMissing => "wal-missing",
                        },
                        "files-checked": b.files_checked,
                        "files-invalid": b.files_invalid,
                    })
                })
                .collect::<Vec<_>>(),
            "errors": self.errors,
        })
    }
}

// ----------------------------------------------------------------------------

pub fn cmd_verify(cfg: &VerifyConfig) -> Result<VerifyResult> {
    let info_archive = InfoArchive::load(&cfg.repo.storage, cfg.repo.cipher_pass())?;
    let info_backup = InfoBackup::load(&cfg.repo.storage, cfg.repo.cipher_pass())?;
    crate::info::pg::PgHistory::check_pair(&info_archive.history, &info_backup.history)?;

    let mut errors = 0usize;
    let mut archive_results = Vec::new();
    // Valid segments per archive id, for backup WAL reconciliation.
    let mut valid_segments: HashMap<String, HashSet<String>> = HashMap::new();

    let known_ids: HashMap<String, PgVersion> = info_archive
        .history
        .records()
        .iter()
        .map(|record| (record.archive_id(), record.version))
        .collect();

    for archive_id in cfg.repo.storage.list("<REPO:ARCHIVE>")? {
        if archive_id.ends_with(".copy") || archive_id == "archive.info" {
            continue;
        }
        let version = match known_ids.get(&archive_id) {
            Some(version) => *version,
            None => {
                log::warn!("archive id '{archive_id}' is not in the archive.info history");
                errors += 1;
                continue;
            }
        };
        let (result, valid) = verify_archive_id(cfg, &info_archive, &archive_id, version, &mut errors)?;
        valid_segments.insert(archive_id.clone(), valid);
        archive_results.push(result);
    }

    let mut backup_results = Vec::new();
    let latest = info_backup.latest().map(|record| record.label.clone());
    for record in info_backup.backups() {
        if let Some(set) = &cfg.set {
            if &record.label != set {
                continue;
            }
        }
        let result = verify_backup(
            cfg,
            &info_backup,
            record,
            latest.as_deref() == Some(record.label.as_str()),
            &valid_segments,
            &mut errors,
        )?;
        backup_results.push(result);
    }

    Ok(VerifyResult { archive: archive_results, backups: backup_results, errors })
}

// ----------------------------------------------------------------------------

/// Build ranges for one archive id, then verify each surviving segment.
fn verify_archive_id(
    cfg: &VerifyConfig,
    info: &InfoArchive,
    archive_id: &str,
    version: PgVersion,
    errors: &mut usize,
) -> Result<(VerifyArchiveResult, HashSet<String>)> {
    let root = format!("<REPO:ARCHIVE>/{archive_id}");
    let mut files: Vec<String> = Vec::new();
    for dir in cfg.repo.storage.list(&root)? {
        if dir.len() != 16 || !dir.chars().all(|c| c.is_ascii_hexdigit()) {
            continue;
        }
        for file in cfg.repo.storage.list(&format!("{root}/{dir}"))? {
            if WAL_SEGMENT_FILE_RE.is_match(&file) {
                files.push(file);
            } else {
                log::warn!("unexpected file '{file}' in archive '{archive_id}'");
                *errors += 1;
            }
        }
    }
    files.sort();

    // Cull duplicates (same 24-char name, different payloads) and names
    // a ≤9.2 cluster could never have produced.
    let mut culled: Vec<String> = Vec::new();
    let mut index = 0;
    while index < files.len() {
        let prefix = wal_segment_prefix(&files[index]).to_owned();
        let duplicates = files[index..]
            .iter()
            .take_while(|file| wal_segment_prefix(file) == prefix)
            .count();
        if duplicates > 1 {
            log::warn!("duplicate WAL '{prefix}' for '{archive_id}' exists, skipping");
            *errors += 1;
            index += duplicates;
            continue;
        }
        if version <= PG_VERSION_92 && prefix.ends_with("FF") {
            log::warn!("invalid WAL '{prefix}' for '{archive_id}' exists, skipping");
            *errors += 1;
            index += 1;
            continue;
        }
        culled.push(files[index].clone());
        index += 1;
    }

    // Ranges break wherever a name is not its predecessor's successor.
    let mut ranges: Vec<WalRange> = Vec::new();
    let mut prev: Option<WalSegment> = None;
    for file in &culled {
        let segment = WalSegment::parse(wal_segment_prefix(file), cfg.wal_segment_size)?;
        let continues = prev
            .map(|prev| prev.next(version, cfg.wal_segment_size) == segment)
            .unwrap_or(false);
        let name = segment.name(cfg.wal_segment_size);
        if continues {
            ranges.last_mut().expect("range exists while continuing").stop = name;
        } else {
            ranges.push(WalRange { start: name.clone(), stop: name, invalid: Vec::new() });
        }
        prev = Some(segment);
    }

    // Verify each segment's content in parallel.
    let mut result = VerifyArchiveResult {
        archive_id: archive_id.to_owned(),
        total: culled.len(),
        valid: 0,
        missing: 0,
        checksum_invalid: 0,
        size_invalid: 0,
        other: 0,
        ranges,
    };
    let mut valid_set = HashSet::new();

    let cipher_pass = info.cipher_pass.clone();
    let wal_segment_size = cfg.wal_segment_size;
    let handler = |command: &ProtoCommand| -> Result<Vec<ProtoValue>> {
        let path = command.param(0)?.as_str()?;
        let expected_checksum = command.param(1)?.as_opt_str()?;
        let expected_size = command.param(2)?.as_u64()?;
        let status = verify_file(
            &cfg.repo,
            path,
            expected_checksum,
            (expected_size > 0).then_some(expected_size),
            cipher_pass.as_deref(),
        );
        Ok(vec![ProtoValue::Str(status.as_str().to_owned())])
    };

    let mut queue = culled.iter().map(|file| {
        let checksum = file.get(25..65).map(str::to_owned);
        ProtoJob {
            key: file.clone(),
            command: ProtoCommand::new(
                "verify-file",
                vec![
                    ProtoValue::Str(archive_repo_path(archive_id, file)),
                    ProtoValue::OptStr(checksum),
                    ProtoValue::U64(u64::from(wal_segment_size)),
                ],
            ),
        }
    });
    parallel::execute(
        cfg.process_max,
        "verify file",
        cfg.protocol_timeout,
        |_worker| Ok(queue.next()),
        &handler,
        |outcome| {
            let status = VerifyFileStatus::parse(outcome.output[0].as_str()?);
            let segment = wal_segment_prefix(&outcome.key).to_owned();
            match status {
                VerifyFileStatus::Ok => {
                    result.valid += 1;
                    valid_set.insert(segment);
                    return Ok(());
                }
                VerifyFileStatus::Missing => result.missing += 1,
                VerifyFileStatus::ChecksumMismatch => result.checksum_invalid += 1,
                VerifyFileStatus::SizeInvalid => result.size_invalid += 1,
                VerifyFileStatus::Other => result.other += 1,
            }
            log::warn!(
                "invalid WAL file '{}' in archive '{archive_id}': {}",
                outcome.key,
                status.as_str()
            );
            for range in &mut result.ranges {
                if segment >= range.start && segment <= range.stop {
                    range.invalid.push(segment.clone());
                }
            }
            Ok(())
        },
    )?;

    *errors += result.total - result.valid;
    Ok((result, valid_set))
}

// ----------------------------------------------------------------------------

fn verify_backup(
    cfg: &VerifyConfig,
    info_backup: &InfoBackup,
    record: &crate::info::BackupRecord,
    newest: bool,
    valid_segments: &HashMap<String, HashSet<String>>,
    errors: &mut usize,
) -> Result<VerifyBackupResult> {
    let manifest = match Manifest::load(
        &cfg.repo.storage,
        &record.label,
        info_backup.cipher_pass.as_deref(),
    ) {
        Ok(manifest) => manifest,
        Err(Error::FileMissing(_)) if newest => {
            // The newest backup may legitimately still be running.
            return Ok(VerifyBackupResult {
                label: record.label.clone(),
                status: VerifyBackupStatus::InProgress,
                files_checked: 0,
                files_invalid: 0,
            });
        }
        Err(err) => {
            log::warn!("unable to load manifest for backup '{}': {err}", record.label);
            *errors += 1;
            return Ok(VerifyBackupResult {
                label: record.label.clone(),
                status: VerifyBackupStatus::Invalid,
                files_checked: 0,
                files_invalid: 0,
            });
        }
    };

    let compress_ext = manifest.options.compress_type.clone();
    let cipher_pass = manifest.cipher_pass.clone();
    let label = record.label.clone();

    let mut files_checked = 0usize;
    let mut files_invalid = 0usize;

    let handler = |command: &ProtoCommand| -> Result<Vec<ProtoValue>> {
        let path = command.param(0)?.as_str()?;
        let expected_checksum = command.param(1)?.as_opt_str()?;
        let expected_size = command.param(2)?.as_u64()?;
        let bundle = match command.param(3)?.as_list()? {
            [] => None,
            [offset, repo_size] => Some((offset.as_u64()?, repo_size.as_u64()?)),
            _ => return Err(Error::Protocol("malformed bundle parameter".into())),
        };
        let status = verify_backup_file(
            &cfg.repo,
            path,
            expected_checksum,
            Some(expected_size),
            cipher_pass.as_deref(),
            compress_ext.as_deref(),
            bundle,
        );
        Ok(vec![ProtoValue::Str(status.as_str().to_owned())])
    };

    // Only files this backup stores itself; referenced files verify with
    // the backup that owns them.
    let mut queue = manifest
        .files
        .iter()
        .filter(|file| file.reference.is_none())
        .map(|file| {
            let (path, bundle) = match (file.bundle_id, file.bundle_offset) {
                (Some(id), Some(offset)) => (
                    format!("<REPO:BACKUP>/{label}/bundle/{id}"),
                    vec![ProtoValue::U64(offset), ProtoValue::U64(file.size_repo)],
                ),
                _ => {
                    let ext = compress_ext
                        .as_ref()
                        .map(|e| format!(".{e}"))
                        .unwrap_or_default();
                    (format!("<REPO:BACKUP>/{label}/{}{ext}", file.name), vec![])
                }
            };
            ProtoJob {
                key: file.name.clone(),
                command: ProtoCommand::new(
                    "verify-file",
                    vec![
                        ProtoValue::Str(path),
                        ProtoValue::OptStr(file.checksum.clone()),
                        ProtoValue::U64(file.size),
                        ProtoValue::List(bundle),
                    ],
                ),
            }
        });
    parallel::execute(
        cfg.process_max,
        "verify file",
        cfg.protocol_timeout,
        |_worker| Ok(queue.next()),
        &handler,
        |outcome| {
            files_checked += 1;
            let status = VerifyFileStatus::parse(outcome.output[0].as_str()?);
            if status != VerifyFileStatus::Ok {
                files_invalid += 1;
                log::warn!(
                    "invalid file '{}' in backup '{label}': {}",
                    outcome.key,
                    status.as_str()
                );
            }
            Ok(())
        },
    )?;
    *errors += files_invalid;

    // Reconcile the WAL this backup needs against the valid set.
    let mut status = if files_invalid > 0 {
        VerifyBackupStatus::Invalid
    } else {
        VerifyBackupStatus::Ok
    };
    if status == VerifyBackupStatus::Ok {
        if let Some(pg_record) = info_backup.history.find_id(record.pg_id) {
            let archive_id = pg_record.archive_id();
            let valid = valid_segments.get(&archive_id);
            let version = pg_record.version;
            let mut segment = WalSegment::parse(&record.archive_start, cfg.wal_segment_size)?;
            let stop = WalSegment::parse(&record.archive_stop, cfg.wal_segment_size)?;
            loop {
                let name = segment.name(cfg.wal_segment_size);
                if !valid.map(|set| set.contains(&name)).unwrap_or(false) {
                    log::warn!(
                        "backup '{label}' requires WAL segment '{name}' which is missing or \
                         invalid in archive '{archive_id}'"
                    );
                    *errors += 1;
                    status = VerifyBackupStatus::WalMissing;
                    break;
                }
                if segment.segno >= stop.segno {
                    break;
                }
                segment = segment.next(version, cfg.wal_segment_size);
            }
        }
    }

    Ok(VerifyBackupResult { label, status, files_checked, files_invalid })
}

// ----------------------------------------------------------------------------

/// Verify one backup file, which may live inside a bundle object.
#[allow(clippy::too_many_arguments)]
fn verify_backup_file(
    repo: &Repo,
    path: &str,
    expected_checksum: Option<&str>,
    expected_size: Option<u64>,
    cipher_pass: Option<&str>,
    compress_ext: Option<&str>,
    bundle: Option<(u64, u64)>,
) -> VerifyFileStatus {
    let (offset, repo_size) = match bundle {
        Some(span) => span,
        None => return verify_file(repo, path, expected_checksum, expected_size, cipher_pass),
    };
    let data = match repo.storage.get(path, true, FilterGroup::new()) {
        Ok(Some(data)) => data,
        Ok(None) => return VerifyFileStatus::Missing,
        Err(_) => return VerifyFileStatus::Other,
    };
    let end = (offset + repo_size) as usize;
    if end > data.len() {
        return VerifyFileStatus::SizeInvalid;
    }
    let mut filters = FilterGroup::new();
    if let Some(pass) = cipher_pass {
        match CipherFilter::new(CipherMode::Decrypt, pass) {
            Ok(filter) => filters = filters.add(Box::new(filter)),
            Err(_) => return VerifyFileStatus::Other,
        }
    }
    if let Some(ext) = compress_ext {
        if let Ok(compress_type) = ext.parse::<CompressType>() {
            filters = filters.add(Box::new(DecompressFilter::new(compress_type)));
        }
    }
    filters = filters
        .add(Box::new(HashFilter::sha1()))
        .add(Box::new(SizeFilter::new()));
    let mut out = Vec::new();
    if filters.process(&data[offset as usize..end], &mut out).is_err()
        || filters.flush(&mut out).is_err()
    {
        return VerifyFileStatus::Other;
    }
    let results = filters.results();
    if let Some(expected) = expected_checksum {
        if results["hash"].as_str() != Some(expected) {
            return VerifyFileStatus::ChecksumMismatch;
        }
    }
    if let Some(expected) = expected_size {
        if results["size"].as_u64() != Some(expected) {
            return VerifyFileStatus::SizeInvalid;
        }
    }
    VerifyFileStatus::Ok
}

/// Re-read one repository object through its decode pipeline and compare
/// digest and decoded size.
fn verify_file(
    repo: &Repo,
    path: &str,
    expected_checksum: Option<&str>,
    expected_size: Option<u64>,
    cipher_pass: Option<&str>,
) -> VerifyFileStatus {
    let mut filters = FilterGroup::new();
    if let Some(pass) = cipher_pass {
        match CipherFilter::new(CipherMode::Decrypt, pass) {
            Ok(filter) => filters = filters.add(Box::new(filter)),
            Err(_) => return VerifyFileStatus::Other,
        }
    }
    if let Some(compress_type) = CompressType::from_name(path) {
        filters = filters.add(Box::new(DecompressFilter::new(compress_type)));
    }
    filters = filters
        .add(Box::new(HashFilter::sha1()))
        .add(Box::new(SizeFilter::new()));

    let mut read = match repo.storage.new_read(path, true, filters) {
        Ok(Some(read)) => read,
        Ok(None) => return VerifyFileStatus::Missing,
        Err(_) => return VerifyFileStatus::Other,
    };
    let results = match read.results() {
        Ok(results) => results,
        Err(_) => return VerifyFileStatus::Other,
    };

    if let Some(expected) = expected_checksum {
        if results["hash"].as_str() != Some(expected) {
            return VerifyFileStatus::ChecksumMismatch;
        }
    }
    if let Some(expected) = expected_size {
        if results["size"].as_u64() != Some(expected) {
            return VerifyFileStatus::SizeInvalid;
        }
    }
    VerifyFileStatus::Ok
}
