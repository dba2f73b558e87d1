//! End-to-end tests of the repository verifier.

mod common;

use std::time::Duration;

use pgvault::archive::cmd_archive_push;
use pgvault::backup::{cmd_backup, BackupConfig};
use pgvault::filter::FilterGroup;
use pgvault::info::BackupType;
use pgvault::verify::{cmd_verify, VerifyBackupStatus, VerifyConfig};

use common::{Fixture, ScriptedDb};

fn backup_config(fixture: &Fixture) -> BackupConfig {
    BackupConfig {
        stanza: fixture.stanza.clone(),
        pg_path: fixture.pg_path(),
        lock_path: fixture.lock_path(),
        repo: fixture.repo(),
        backup_type: BackupType::Full,
        compress_type: None,
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

fn verify_config(fixture: &Fixture) -> VerifyConfig {
    VerifyConfig {
        repo: fixture.repo(),
        process_max: 2,
        set: None,
        wal_segment_size: common::WAL_SEGMENT_SIZE,
        protocol_timeout: Duration::from_secs(30),
    }
}

fn push_segments(fixture: &Fixture, segnos: &[u64]) {
    let cfg = fixture.archive_config(false);
    for segno in segnos {
        let name = common::segment_name(1, *segno);
        let path = fixture.write_wal_segment(&name, (*segno % 251) as u8);
        cmd_archive_push(&cfg, &path).unwrap();
    }
}

#[test]
fn clean_archive_verifies_with_one_range() {
    let fixture = Fixture::new();
    push_segments(&fixture, &[4097, 4098, 4099]);

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert_eq!(result.errors, 0);
    assert_eq!(result.archive.len(), 1);
    let archive = &result.archive[0];
    assert_eq!(archive.archive_id, "16-1");
    assert_eq!(archive.total, 3);
    assert_eq!(archive.valid, 3);
    assert_eq!(archive.ranges.len(), 1);
    assert_eq!(archive.ranges[0].start, common::segment_name(1, 4097));
    assert_eq!(archive.ranges[0].stop, common::segment_name(1, 4099));
}

#[test]
fn gap_splits_the_range() {
    let fixture = Fixture::new();
    push_segments(&fixture, &[4097, 4098, 4101]);

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    let archive = &result.archive[0];
    assert_eq!(archive.ranges.len(), 2);
    assert_eq!(archive.ranges[0].stop, common::segment_name(1, 4098));
    assert_eq!(archive.ranges[1].start, common::segment_name(1, 4101));
}

#[test]
fn duplicate_wal_is_reported_and_skipped() {
    let fixture = Fixture::new();
    push_segments(&fixture, &[4097]);

    // A second copy of the same segment with a different checksum
    // suffix.
    let name = common::segment_name(1, 4097);
    fixture
        .repo()
        .storage
        .put(
            &format!("<REPO:ARCHIVE>/16-1/{}/{name}-{}", &name[..16], "cd".repeat(20)),
            b"different",
            FilterGroup::new(),
        )
        .unwrap();

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert!(result.errors > 0);
    // Both copies are culled: nothing checked, nothing valid.
    assert_eq!(result.archive[0].total, 0);
}

#[test]
fn corrupt_segment_fails_its_checksum() {
    let fixture = Fixture::new();
    push_segments(&fixture, &[4097, 4098]);

    // Truncate one archived segment in place.
    let name = common::segment_name(1, 4098);
    let dir = format!("<REPO:ARCHIVE>/16-1/{}", &name[..16]);
    let file = common::archive_dir_list(&fixture.repo(), "16-1", &name[..16])
        .into_iter()
        .find(|file| file.starts_with(&name))
        .unwrap();
    fixture
        .repo()
        .storage
        .put(&format!("{dir}/{file}"), b"not wal any more", FilterGroup::new())
        .unwrap();

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    let archive = &result.archive[0];
    assert_eq!(archive.valid, 1);
    assert_eq!(archive.checksum_invalid, 1);
    assert_eq!(archive.ranges[0].invalid, vec![name]);
    assert!(result.errors > 0);
}

#[test]
fn backup_files_and_required_wal_are_reconciled() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    // The scripted backup spans segments 8192..=8193.
    push_segments(&fixture, &[8192, 8193]);

    let summary = cmd_backup(&backup_config(&fixture), &mut db, None).unwrap();

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert_eq!(result.errors, 0);
    assert_eq!(result.backups.len(), 1);
    let backup = &result.backups[0];
    assert_eq!(backup.label, summary.label);
    assert_eq!(backup.status, VerifyBackupStatus::Ok);
    assert!(backup.files_checked > 0);
    assert_eq!(backup.files_invalid, 0);

    // Corrupt one backup file; verify flags the backup.
    fixture
        .repo()
        .storage
        .put(
            &format!("<REPO:BACKUP>/{}/pg_data/base/1/112", summary.label),
            b"oops",
            FilterGroup::new(),
        )
        .unwrap();
    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert_eq!(result.backups[0].status, VerifyBackupStatus::Invalid);
    assert!(result.backups[0].files_invalid > 0);
}

#[test]
fn missing_required_wal_marks_the_backup() {
    let fixture = Fixture::new();
    let mut db = ScriptedDb::primary();
    // Only the first required segment is archived.
    push_segments(&fixture, &[8192]);

    cmd_backup(&backup_config(&fixture), &mut db, None).unwrap();

    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert_eq!(result.backups[0].status, VerifyBackupStatus::WalMissing);
    assert!(result.errors > 0);
}

#[test]
fn unknown_archive_id_is_an_error() {
    let fixture = Fixture::new();
    fixture
        .repo()
        .storage
        .put("<REPO:ARCHIVE>/9.6-9/0000000100000001/junk", b"junk", FilterGroup::new())
        .unwrap();
    let result = cmd_verify(&verify_config(&fixture)).unwrap();
    assert!(result.errors > 0);
    assert!(result.archive.is_empty());
}
