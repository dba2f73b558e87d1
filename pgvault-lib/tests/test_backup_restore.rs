//! End-to-end backup and restore against a temp-dir repository, with a
//! scripted database client standing in for the cluster.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use pgvault::backup::{cmd_backup, BackupConfig};
use pgvault::filter::hash::sha1_hex;
use pgvault::filter::{CompressType, FilterGroup};
use pgvault::info::BackupType;
use pgvault::manifest::Manifest;
use pgvault::pg::Lsn;
use pgvault::restore::{cmd_restore, RestoreConfig, RestoreType};

use common::{Fixture, ScriptedDb};

fn backup_config(fixture: &Fixture, backup_type: BackupType) -> BackupConfig {
    BackupConfig {
        stanza: fixture.stanza.clone(),
        pg_path: fixture.pg_path(),
        lock_path: fixture.lock_path(),
        repo: fixture.repo(),
        backup_type,
        compress_type: Some(CompressType::Gz),
        compress_level: None,
        process_max: 2,
        start_fast: true,
        stop_auto: false,
        archive_check: false,
        archive_timeout: Duration::from_secs(5),
        db_timeout: Duration::from_secs(60),
        protocol_timeout: Duration::from_secs(30),
        backup_standby: false,
        bundle: false,
        bundle_limit: pgvault::backup::BUNDLE_LIMIT_DEFAULT,
        bundle_size: pgvault::backup::BUNDLE_SIZE_DEFAULT,
        block_incr: false,
        expire_auto: false,
        retention_full: None,
        retention_diff: None,
        retention_archive: None,
    }
}

fn restore_config(fixture: &Fixture, dest: &std::path::Path) -> RestoreConfig {
    RestoreConfig {
        stanza: fixture.stanza.clone(),
        pg_path: dest.to_path_buf(),
        repo: fixture.repo(),
        set: None,
        delta: false,
        force: false,
        restore_type: RestoreType::Default,
        target: None,
        target_timeline: None,
        target_action: None,
        target_inclusive: None,
        tablespace_map: HashMap::new(),
        tablespace_map_all: None,
        link_map: HashMap::new(),
        link_all: false,
        db_include: Vec::new(),
        db_exclude: Vec::new(),
        process_max: 2,
        protocol_timeout: Duration::from_secs(30),
        cmd: "pgvault".to_owned(),
        repo_path_opt: fixture.repo_path().to_string_lossy().into_owned(),
    }
}

#[test]
fn full_backup_then_restore_round_trips() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    let summary = cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();
    assert_eq!(summary.backup_type, BackupType::Full);
    assert!(summary.files_copied > 0);

    // The manifest exists in dual copy and covers the cluster files.
    let info = fixture.repo().load_backup_info().unwrap();
    assert_eq!(info.backups().len(), 1);
    let manifest =
        Manifest::load(&fixture.repo().storage, &summary.label, info.cipher_pass.as_deref())
            .unwrap();
    assert!(manifest.file("pg_data/base/1/112").is_some());
    assert!(manifest.file("pg_data/backup_label").is_some());
    assert!(manifest.file("pg_data/postmaster.opts").is_none());

    // Restore into an empty directory.
    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    let restored = cmd_restore(&restore_config(&fixture, &dest)).unwrap();
    assert_eq!(restored.label, summary.label);
    assert_eq!(restored.files_zeroed, 0);

    // Every manifest file round-trips bytewise.
    for file in &manifest.files {
        let rel = file.name.strip_prefix("pg_data/").unwrap();
        let data = common::read_file(&dest.join(rel));
        assert_eq!(data.len() as u64, file.size, "{}", file.name);
        assert_eq!(Some(sha1_hex(&data)), file.checksum, "{}", file.name);
    }

    // Recovery configuration for a v16 cluster: auto.conf + signal file.
    assert!(dest.join("recovery.signal").exists());
    let auto_conf = String::from_utf8(common::read_file(&dest.join("postgresql.auto.conf"))).unwrap();
    assert!(auto_conf.contains("restore_command"));
    assert!(auto_conf.contains("archive-get"));

    // The manifest was saved into the restored directory for delta.
    assert!(dest.join("backup.manifest").exists());
}

#[test]
fn incremental_references_unchanged_files() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    let full = cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    // Change one file, then take an incremental.
    fixture
        .pg_storage()
        .put("base/16384/3000", &vec![9u8; 32768], FilterGroup::new())
        .unwrap();
    let incr = cmd_backup(&backup_config(&fixture, BackupType::Incr), &mut db, None).unwrap();
    assert_eq!(incr.backup_type, BackupType::Incr);

    let info = fixture.repo().load_backup_info().unwrap();
    let manifest =
        Manifest::load(&fixture.repo().storage, &incr.label, info.cipher_pass.as_deref()).unwrap();

    // The unchanged catalog file is inherited, the changed one copied.
    let unchanged = manifest.file("pg_data/base/1/112").unwrap();
    assert_eq!(unchanged.reference.as_deref(), Some(full.label.as_str()));
    let changed = manifest.file("pg_data/base/16384/3000").unwrap();
    assert_eq!(changed.reference, None);
    assert_eq!(changed.size, 32768);

    let record = info.find(&incr.label).unwrap();
    assert_eq!(record.prior.as_deref(), Some(full.label.as_str()));
    assert_eq!(record.reference, vec![full.label.clone()]);

    // Restoring the incremental pulls referenced files from the full.
    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    cmd_restore(&restore_config(&fixture, &dest)).unwrap();
    assert_eq!(common::read_file(&dest.join("base/16384/3000")), vec![9u8; 32768]);
    assert_eq!(common::read_file(&dest.join("base/1/112")), b"template catalog one");
}

#[test]
fn incremental_without_prior_becomes_full() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    let summary = cmd_backup(&backup_config(&fixture, BackupType::Incr), &mut db, None).unwrap();
    assert_eq!(summary.backup_type, BackupType::Full);
    assert!(summary.label.ends_with('F'));
}

#[test]
fn backup_rejects_checkpoint_behind_start() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    // pg_control says the checkpoint is older than the backup start.
    let mut control = fixture.control;
    control.checkpoint = Lsn(0x1_0050_0000);
    db.start.lsn = Lsn(0x1_0100_0000);
    fixture.write_control(&control);

    let err = cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap_err();
    assert_eq!(err.name(), "DbMismatchError");
    assert_eq!(
        err.to_string(),
        "current checkpoint '1/500000' is less than backup start '1/1000000'"
    );
}

#[test]
fn backup_refuses_concurrent_advisory_holder() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    db.advisory = false;
    let err = cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap_err();
    assert_eq!(err.name(), "LockAcquireError");
}

#[test]
fn bundled_backup_restores_small_files() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    let mut cfg = backup_config(&fixture, BackupType::Full);
    cfg.bundle = true;
    let summary = cmd_backup(&cfg, &mut db, None).unwrap();

    let info = fixture.repo().load_backup_info().unwrap();
    let manifest =
        Manifest::load(&fixture.repo().storage, &summary.label, info.cipher_pass.as_deref())
            .unwrap();
    // Everything in the fixture is small enough to bundle.
    let bundled = manifest.files.iter().filter(|f| f.bundle_id.is_some()).count();
    assert!(bundled > 0, "no files were bundled");
    assert!(fixture
        .repo()
        .storage
        .exists(&format!("<REPO:BACKUP>/{}/bundle/1", summary.label))
        .unwrap());

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    cmd_restore(&restore_config(&fixture, &dest)).unwrap();
    assert_eq!(common::read_file(&dest.join("base/1/113")), b"template catalog two");
}

#[test]
fn selective_restore_zeroes_excluded_databases() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    let mut cfg = restore_config(&fixture, &dest);
    cfg.db_include = vec!["template1".to_owned(), "postgres".to_owned()];
    let summary = cmd_restore(&cfg).unwrap();
    assert!(summary.files_zeroed > 0);

    // exclude_me (oid 16384) is zero-filled at original sizes.
    assert_eq!(common::read_file(&dest.join("base/16384/3000")), vec![0u8; 16384]);
    assert_eq!(
        common::read_file(&dest.join("base/16384/pg_filenode.map")),
        vec![0u8; 512]
    );
    // System databases restore normally.
    assert_eq!(common::read_file(&dest.join("base/1/112")), b"template catalog one");
}

#[test]
fn restore_refuses_non_empty_destination_without_delta() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("leftover"), b"junk").unwrap();

    let err = cmd_restore(&restore_config(&fixture, &dest)).unwrap_err();
    assert_eq!(err.name(), "PathNotEmptyError");
}

#[test]
fn delta_restore_reconciles_existing_destination() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    // First restore, then tamper with the result.
    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    cmd_restore(&restore_config(&fixture, &dest)).unwrap();
    std::fs::write(dest.join("base/1/112"), b"corrupted!").unwrap();
    std::fs::write(dest.join("rogue_file"), b"not in the manifest").unwrap();

    let mut cfg = restore_config(&fixture, &dest);
    cfg.delta = true;
    let summary = cmd_restore(&cfg).unwrap();

    // The tampered file was re-restored, the intact ones preserved, and
    // the rogue file removed.
    assert_eq!(common::read_file(&dest.join("base/1/112")), b"template catalog one");
    assert!(summary.files_preserved > 0);
    assert!(!dest.join("rogue_file").exists());
}

#[test]
fn restore_refuses_running_cluster() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    std::fs::write(dest.join("postmaster.pid"), b"1234").unwrap();

    let err = cmd_restore(&restore_config(&fixture, &dest)).unwrap_err();
    assert_eq!(err.name(), "PostmasterRunningError");
}

#[test]
fn restore_of_unknown_set_is_rejected() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    cmd_backup(&backup_config(&fixture, BackupType::Full), &mut db, None).unwrap();

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    let mut cfg = restore_config(&fixture, &dest);
    cfg.set = Some("20990101-000000F".to_owned());
    let err = cmd_restore(&cfg).unwrap_err();
    assert_eq!(err.name(), "BackupSetInvalidError");
}

#[test]
fn encrypted_repository_round_trips() {
    let fixture = Fixture::new();
    // Recreate the stanza with encryption on a second repo path.
    let repo = pgvault::repo::Repo::new(
        1,
        fixture.dir.path().join("repo-enc"),
        &fixture.stanza,
        Some("top-secret".to_owned()),
    );
    let stanza_cfg = pgvault::stanza::StanzaConfig {
        stanza: fixture.stanza.clone(),
        pg_path: fixture.pg_path(),
        lock_path: fixture.lock_path(),
        repos: vec![repo.clone()],
    };
    pgvault::stanza::cmd_stanza_create(&stanza_cfg).unwrap();

    let mut cfg = backup_config(&fixture, BackupType::Full);
    cfg.repo = repo.clone();
    let mut db = ScriptedDb::primary();
    let summary = cmd_backup(&cfg, &mut db, None).unwrap();

    // The manifest is unreadable without the passphrase.
    let plain = pgvault::repo::Repo::new(1, fixture.dir.path().join("repo-enc"), &fixture.stanza, None);
    assert!(plain.load_backup_info().is_err());

    let dest = fixture.dir.path().join("restore");
    std::fs::create_dir_all(&dest).unwrap();
    let mut restore_cfg = restore_config(&fixture, &dest);
    restore_cfg.repo = repo;
    let restored = cmd_restore(&restore_cfg).unwrap();
    assert_eq!(restored.label, summary.label);
    assert_eq!(common::read_file(&dest.join("base/1/112")), b"template catalog one");
}
