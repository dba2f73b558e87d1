//! Stanza lifecycle: create, upgrade, and delete the repository metadata
//! for one cluster.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::info::{archive::INFO_ARCHIVE_PATH, backup::INFO_BACKUP_PATH};
use crate::info::{InfoArchive, InfoBackup, INFO_COPY_EXT};
use crate::lock;
use crate::pg::{PgControl, PG_FILE_POSTMTRPID};
use crate::repo::Repo;
use crate::storage::Storage;

pub struct StanzaConfig {
    pub stanza: String,
    pub pg_path: PathBuf,
    pub lock_path: PathBuf,
    pub repos: Vec<Repo>,
}

impl StanzaConfig {
    fn pg_storage(&self) -> Storage {
        Storage::posix(&self.pg_path)
    }
}

/// Create the stanza in every repository: write fresh info files, or
/// validate (and repair the dual copies of) existing ones.
pub fn cmd_stanza_create(cfg: &StanzaConfig) -> Result<String> {
    let _locks = lock::acquire_all(&cfg.lock_path, &cfg.stanza)?;
    let control = PgControl::read(&cfg.pg_storage())?;

    for repo in &cfg.repos {
        let archive = InfoArchive::load_opt(&repo.storage, repo.cipher_pass())?;
        let backup = InfoBackup::load_opt(&repo.storage, repo.cipher_pass())?;

        match (archive, backup) {
            (None, None) => {
                // Refuse to adopt a repository that already holds data
                // without its info files.
                for (what, path) in [("archive", "<REPO:ARCHIVE>"), ("backup", "<REPO:BACKUP>")] {
                    if !repo.storage.list(path)?.is_empty() {
                        return Err(Error::FileMissing(format!(
                            "{what} information missing on repo{} but the {what} path is not \
                             empty\nHINT: use stanza-delete to clean up an old stanza first",
                            repo.index
                        )));
                    }
                }
                let encrypted = repo.cipher_pass.is_some();
                InfoArchive::create(&control, encrypted).save(&repo.storage, repo.cipher_pass())?;
                InfoBackup::create(&control, encrypted).save(&repo.storage, repo.cipher_pass())?;
                log::info!("stanza '{}' created on repo{}", cfg.stanza, repo.index);
            }
            (Some(archive), Some(backup)) => {
                archive.check_pg(control.version, control.system_id)?;
                backup.check_pg(
                    control.version,
                    control.system_id,
                    control.catalog_version,
                    control.control_version,
                )?;
                crate::info::pg::PgHistory::check_pair(&archive.history, &backup.history)?;

                // Re-save when either file of a pair has gone missing so
                // primary and copy exist again.
                let pair_incomplete = [INFO_ARCHIVE_PATH, INFO_BACKUP_PATH].iter().any(|path| {
                    let copy = format!("{path}{INFO_COPY_EXT}");
                    !matches!(repo.storage.exists(path), Ok(true))
                        || !matches!(repo.storage.exists(&copy), Ok(true))
                });
                if pair_incomplete {
                    archive.save(&repo.storage, repo.cipher_pass())?;
                    backup.save(&repo.storage, repo.cipher_pass())?;
                    log::info!(
                        "stanza '{}' repaired missing info file copies on repo{}",
                        cfg.stanza,
                        repo.index
                    );
                } else {
                    log::info!(
                        "stanza '{}' already exists on repo{} and is valid",
                        cfg.stanza,
                        repo.index
                    );
                }
            }
            (archive, _backup) => {
                let (present, missing) = if archive.is_some() {
                    ("archive.info", "backup.info")
                } else {
                    ("backup.info", "archive.info")
                };
                return Err(Error::FileMissing(format!(
                    "{present} exists on repo{} but {missing} is missing\nHINT: use \
                     stanza-delete then stanza-create to rebuild the stanza",
                    repo.index
                )));
            }
        }
    }
    Ok(format!("stanza-create for stanza '{}' completed", cfg.stanza))
}

/// Append a new history row wherever the live cluster no longer matches
/// the current info file entries.
pub fn cmd_stanza_upgrade(cfg: &StanzaConfig) -> Result<String> {
    let _locks = lock::acquire_all(&cfg.lock_path, &cfg.stanza)?;
    let control = PgControl::read(&cfg.pg_storage())?;

    for repo in &cfg.repos {
        let mut archive = repo.load_archive_info()?;
        let mut backup = repo.load_backup_info()?;
        let mut upgraded = false;

        if archive.check_pg(control.version, control.system_id).is_err() {
            archive.history.add(&control);
            archive.save(&repo.storage, repo.cipher_pass())?;
            upgraded = true;
        }
        if backup
            .check_pg(
                control.version,
                control.system_id,
                control.catalog_version,
                control.control_version,
            )
            .is_err()
        {
            backup.history.add(&control);
            backup.save(&repo.storage, repo.cipher_pass())?;
            upgraded = true;
        }

        if upgraded {
            log::info!(
                "stanza '{}' upgraded on repo{} to version {}, system-id {}",
                cfg.stanza,
                repo.index,
                control.version,
                control.system_id
            );
        } else {
            log::info!("stanza '{}' is already up to date on repo{}", cfg.stanza, repo.index);
        }
        crate::info::pg::PgHistory::check_pair(&archive.history, &backup.history)?;
    }
    Ok(format!("stanza-upgrade for stanza '{}' completed", cfg.stanza))
}

/// Remove the stanza from every repository. Requires a stop file (or
/// `force`) and refuses while the cluster runs (unless `force`).
pub fn cmd_stanza_delete(cfg: &StanzaConfig, force: bool) -> Result<String> {
    if !force && !lock::stop_file_path(&cfg.lock_path, Some(&cfg.stanza)).exists() {
        return Err(Error::FileMissing(format!(
            "stop file does not exist for stanza '{}'\nHINT: run the stop command, or use \
             --force",
            cfg.stanza
        )));
    }
    if !force && cfg.pg_path.join(PG_FILE_POSTMTRPID).exists() {
        return Err(Error::PgRunning(format!(
            "stanza '{}' cannot be deleted while the cluster is running\nHINT: stop the \
             cluster, or use --force",
            cfg.stanza
        )));
    }

    let _locks = lock::acquire_all(&cfg.lock_path, &cfg.stanza)?;
    for repo in &cfg.repos {
        // Info files first: a crash mid-delete leaves an obviously broken
        // stanza rather than a plausible-but-partial one.
        for path in [INFO_ARCHIVE_PATH, INFO_BACKUP_PATH] {
            repo.storage.remove(path, false)?;
            repo.storage.remove(&format!("{path}{INFO_COPY_EXT}"), false)?;
        }
        repo.storage.path_remove("<REPO:ARCHIVE>", true)?;
        repo.storage.path_remove("<REPO:BACKUP>", true)?;
        log::info!("stanza '{}' deleted from repo{}", cfg.stanza, repo.index);
    }

    // The stop file goes last so nothing restarts mid-delete.
    lock::stop_remove(&cfg.lock_path, Some(&cfg.stanza))?;
    Ok(format!("stanza-delete for stanza '{}' completed", cfg.stanza))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterGroup;
    use crate::pg::version::PG_VERSION_16;

    fn fixture(system_id: u64) -> (tempfile::TempDir, StanzaConfig) {
        let dir = tempfile::tempdir().unwrap();
        let pg = Storage::posix(dir.path().join("pg"));
        let control = PgControl::for_version(PG_VERSION_16, system_id);
        pg.put("global/pg_control", &control.to_bytes(), FilterGroup::new()).unwrap();
        let cfg = StanzaConfig {
            stanza: "main".into(),
            pg_path: dir.path().join("pg"),
            lock_path: dir.path().join("lock"),
            repos: vec![Repo::new(1, dir.path().join("repo"), "main", None)],
        };
        (dir, cfg)
    }

    #[test]
    fn create_writes_both_info_pairs() {
        let (_dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();
        let repo = &cfg.repos[0];
        for path in [INFO_ARCHIVE_PATH, INFO_BACKUP_PATH] {
            assert!(repo.storage.exists(path).unwrap());
            assert!(repo.storage.exists(&format!("{path}{INFO_COPY_EXT}")).unwrap());
        }
        let archive = repo.load_archive_info().unwrap();
        assert_eq!(archive.archive_id(), "16-1");
    }

    #[test]
    fn create_is_idempotent_and_repairs_missing_copy() {
        let (_dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();
        cmd_stanza_create(&cfg).unwrap();

        let repo = &cfg.repos[0];
        repo.storage.remove(&format!("{INFO_ARCHIVE_PATH}{INFO_COPY_EXT}"), true).unwrap();
        cmd_stanza_create(&cfg).unwrap();
        assert!(repo
            .storage
            .exists(&format!("{INFO_ARCHIVE_PATH}{INFO_COPY_EXT}"))
            .unwrap());
    }

    #[test]
    fn create_rejects_mismatched_cluster() {
        let (dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();

        // Re-initdb: same version, different system id.
        let control = PgControl::for_version(PG_VERSION_16, 9999);
        Storage::posix(dir.path().join("pg"))
            .put("global/pg_control", &control.to_bytes(), FilterGroup::new())
            .unwrap();
        let err = cmd_stanza_create(&cfg).unwrap_err();
        assert_eq!(err.name(), "FileInvalidError");
        assert!(err.to_string().contains("9999"));
        assert!(err.to_string().contains("1000"));
    }

    #[test]
    fn create_rejects_half_a_stanza() {
        let (_dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();
        let repo = &cfg.repos[0];
        repo.storage.remove(INFO_BACKUP_PATH, true).unwrap();
        repo.storage.remove(&format!("{INFO_BACKUP_PATH}{INFO_COPY_EXT}"), true).unwrap();
        let err = cmd_stanza_create(&cfg).unwrap_err();
        assert_eq!(err.name(), "FileMissingError");
    }

    #[test]
    fn upgrade_appends_history() {
        let (dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();

        let control = PgControl::for_version(PG_VERSION_16, 2000);
        Storage::posix(dir.path().join("pg"))
            .put("global/pg_control", &control.to_bytes(), FilterGroup::new())
            .unwrap();
        cmd_stanza_upgrade(&cfg).unwrap();

        let archive = cfg.repos[0].load_archive_info().unwrap();
        assert_eq!(archive.archive_id(), "16-2");
        assert_eq!(archive.history.records().len(), 2);

        // Idempotent.
        cmd_stanza_upgrade(&cfg).unwrap();
        assert_eq!(cfg.repos[0].load_archive_info().unwrap().history.records().len(), 2);
    }

    #[test]
    fn delete_requires_stop_file_and_removes_everything() {
        let (_dir, cfg) = fixture(1000);
        cmd_stanza_create(&cfg).unwrap();

        let err = cmd_stanza_delete(&cfg, false).unwrap_err();
        assert_eq!(err.name(), "FileMissingError");

        lock::stop_create(&cfg.lock_path, Some("main")).unwrap();
        cmd_stanza_delete(&cfg, false).unwrap();
        let repo = &cfg.repos[0];
        assert!(!repo.storage.exists(INFO_ARCHIVE_PATH).unwrap());
        assert!(!repo.storage.path_exists("<REPO:ARCHIVE>").unwrap());
        assert!(!lock::stop_file_path(&cfg.lock_path, Some("main")).exists());
    }
}
