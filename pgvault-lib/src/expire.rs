//! Retention: expire backups past the configured counts and trim the
//! archive behind the oldest retained backup.
//!
//! Backups are deleted oldest-first, always taking dependents with their
//! anchor, so a full backup is never removed while a live differential or
//! incremental still references it.

use std::collections::HashSet;

use crate::archive::is_segment_name;
use crate::error::Result;
use crate::info::{BackupType, InfoBackup};
use crate::repo::Repo;

pub struct ExpireConfig {
    pub repo: Repo,
    /// Number of full backups to retain.
    pub retention_full: Option<usize>,
    /// Number of differential backups to retain.
    pub retention_diff: Option<usize>,
    /// Number of backups to retain WAL for; defaults to all remaining.
    pub retention_archive: Option<usize>,
}

/// Apply retention. Returns the labels expired, oldest first.
pub fn cmd_expire(cfg: &ExpireConfig) -> Result<Vec<String>> {
    let mut info = cfg.repo.load_backup_info()?;
    let mut expired: Vec<String> = Vec::new();

    if let Some(retention) = cfg.retention_full {
        expire_by_type(&mut info, BackupType::Full, retention.max(1), &mut expired);
    }
    if let Some(retention) = cfg.retention_diff {
        expire_by_type(&mut info, BackupType::Diff, retention.max(1), &mut expired);
    }

    for label in &expired {
        // Remove the label directory after the info entry so a crash
        // leaves an orphan directory, not a phantom record.
        cfg.repo
            .storage
            .path_remove(&format!("<REPO:BACKUP>/{label}"), true)?;
        log::info!("expired backup '{label}' on repo{}", cfg.repo.index);
    }
    if !expired.is_empty() {
        info.save(&cfg.repo.storage, cfg.repo.cipher_pass())?;
    }

    expire_archive(cfg, &info)?;
    Ok(expired)
}

/// Expire all but the newest `retention` backups of `backup_type`, along
/// with every backup that references an expired one.
fn expire_by_type(
    info: &mut InfoBackup,
    backup_type: BackupType,
    retention: usize,
    expired: &mut Vec<String>,
) {
    let of_type: Vec<String> = info
        .backups()
        .iter()
        .filter(|record| record.backup_type == backup_type)
        .map(|record| record.label.clone())
        .collect();
    if of_type.len() <= retention {
        return;
    }
    for label in &of_type[..of_type.len() - retention] {
        let mut to_remove = info.dependents(label);
        to_remove.insert(0, label.clone());
        for label in to_remove {
            if !expired.contains(&label) {
                info.remove(&label);
                expired.push(label);
            }
        }
    }
    // Oldest first, dependents alongside their anchors.
    expired.sort();
}

/// Remove archived WAL no retained backup can need: everything before
/// the start segment of the oldest backup within the archive retention
/// window, plus whole archive ids no remaining backup refers to.
fn expire_archive(cfg: &ExpireConfig, info: &InfoBackup) -> Result<()> {
    let backups = info.backups();
    if backups.is_empty() {
        return Ok(());
    }

    let window = cfg.retention_archive.unwrap_or(backups.len()).max(1);
    let oldest_kept = &backups[backups.len().saturating_sub(window)];
    let floor = oldest_kept.archive_start.clone();

    let live_pg_ids: HashSet<u32> = backups.iter().map(|record| record.pg_id).collect();
    let current_id = info.history.current().id;

    for record in info.history.records() {
        let archive_id = record.archive_id();
        let root = format!("<REPO:ARCHIVE>/{archive_id}");
        if !cfg.repo.storage.path_exists(&root)? {
            continue;
        }
        // An incarnation with no remaining backups (and which is not
        // current) can lose its whole archive.
        if !live_pg_ids.contains(&record.id) && record.id != current_id {
            cfg.repo.storage.path_remove(&root, true)?;
            log::info!("expired archive '{archive_id}' on repo{}", cfg.repo.index);
            continue;
        }
        // Otherwise trim segments strictly older than the floor. The
        // floor segment only applies to the incarnation that owns it.
        if record.id != oldest_kept.pg_id {
            continue;
        }
        for dir in cfg.repo.storage.list(&root)? {
            if dir.len() != 16 || !dir.chars().all(|c| c.is_ascii_hexdigit()) {
                continue;
            }
            for file in cfg.repo.storage.list(&format!("{root}/{dir}"))? {
                if file.len() >= 24 && is_segment_name(&file[..24]) && file[..24] < floor[..] {
                    cfg.repo
                        .storage
                        .remove(&format!("{root}/{dir}/{file}"), false)?;
                }
            }
            if cfg.repo.storage.list(&format!("{root}/{dir}"))?.is_empty() {
                cfg.repo.storage.path_remove(&format!("{root}/{dir}"), false)?;
            }
        }
        log::info!(
            "expired WAL older than '{floor}' for archive '{archive_id}' on repo{}",
            cfg.repo.index
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterGroup;
    use crate::info::BackupRecord;
    use crate::pg::version::PG_VERSION_16;
    use crate::pg::PgControl;
    use crate::storage::Storage;

    fn record(label: &str, backup_type: BackupType, prior: Option<&str>, start: &str) -> BackupRecord {
        BackupRecord {
            label: label.to_owned(),
            backup_type,
            prior: prior.map(str::to_owned),
            timestamp_start: 0,
            timestamp_stop: 0,
            lsn_start: "0/0".into(),
            lsn_stop: "0/0".into(),
            archive_start: start.to_owned(),
            archive_stop: start.to_owned(),
            pg_id: 1,
            size: 0,
            size_repo: 0,
            reference: Vec::new(),
        }
    }

    fn fixture() -> (tempfile::TempDir, ExpireConfig) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::new(1, dir.path(), "main", None);
        let control = PgControl::for_version(PG_VERSION_16, 42);
        let mut info = InfoBackup::create(&control, false);
        for (label, backup_type, prior, start) in [
            ("20250101-000000F", BackupType::Full, None, "000000010000000100000001"),
            (
                "20250101-000000F_20250102-000000I",
                BackupType::Incr,
                Some("20250101-000000F"),
                "000000010000000100000003",
            ),
            ("20250103-000000F", BackupType::Full, None, "000000010000000100000005"),
            ("20250105-000000F", BackupType::Full, None, "000000010000000100000009"),
        ] {
            info.add(record(label, backup_type, prior, start));
            repo.storage
                .put(
                    &format!("<REPO:BACKUP>/{label}/backup.manifest"),
                    b"stub",
                    FilterGroup::new(),
                )
                .unwrap();
        }
        info.save(&repo.storage, None).unwrap();
        let cfg = ExpireConfig {
            repo,
            retention_full: Some(2),
            retention_diff: None,
            retention_archive: None,
        };
        (dir, cfg)
    }

    #[test]
    fn full_retention_takes_dependents_along() {
        let (_dir, cfg) = fixture();
        let expired = cmd_expire(&cfg).unwrap();
        assert_eq!(
            expired,
            vec![
                "20250101-000000F".to_owned(),
                "20250101-000000F_20250102-000000I".to_owned(),
            ]
        );
        let info = cfg.repo.load_backup_info().unwrap();
        assert_eq!(info.backups().len(), 2);
        assert!(!cfg
            .repo
            .storage
            .exists("<REPO:BACKUP>/20250101-000000F/backup.manifest")
            .unwrap());
        assert!(cfg
            .repo
            .storage
            .exists("<REPO:BACKUP>/20250103-000000F/backup.manifest")
            .unwrap());
    }

    #[test]
    fn archive_trims_behind_the_oldest_kept_backup() {
        let (_dir, cfg) = fixture();
        // Segments 1..=9 exist in the archive.
        for n in 1..=9u32 {
            let name = format!("0000000100000001{n:08X}");
            cfg.repo
                .storage
                .put(
                    &format!("<REPO:ARCHIVE>/16-1/0000000100000001/{name}-{}", "ab".repeat(20)),
                    b"wal",
                    FilterGroup::new(),
                )
                .unwrap();
        }
        cmd_expire(&cfg).unwrap();

        // Oldest kept backup starts at segment 5; 1-4 expire.
        let remaining = cfg
            .repo
            .storage
            .list("<REPO:ARCHIVE>/16-1/0000000100000001")
            .unwrap();
        assert_eq!(remaining.len(), 5);
        assert!(remaining.iter().all(|name| &name[..24] >= "000000010000000100000005"));
    }

    #[test]
    fn no_retention_expires_nothing() {
        let (_dir, cfg) = fixture();
        let cfg = ExpireConfig { retention_full: None, ..cfg };
        assert!(cmd_expire(&cfg).unwrap().is_empty());
        assert_eq!(cfg.repo.load_backup_info().unwrap().backups().len(), 4);
    }
}
