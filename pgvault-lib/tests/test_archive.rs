//! End-to-end tests of the WAL archive protocol against a temp-dir
//! repository.

mod common;

use pgvault::archive::{
    cmd_archive_get, cmd_archive_push, status_read, ArchiveGetResult, ArchiveMode, ArchiveStatus,
};
use pgvault::error::Error;
use pgvault::filter::{CompressType, FilterGroup};
use pgvault::wait::Wait;

use common::Fixture;

#[test]
fn sync_push_lands_canonical_name() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xA1);

    cmd_archive_push(&fixture.archive_config(false), &wal_path).unwrap();

    let files = common::archive_dir_list(&fixture.repo(), "16-1", &segment[..16]);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(&format!("{segment}-")));
    assert_eq!(files[0].len(), 24 + 1 + 40);

    // Pushing the identical segment again is tolerated with a warning.
    cmd_archive_push(&fixture.archive_config(false), &wal_path).unwrap();
    assert_eq!(common::archive_dir_list(&fixture.repo(), "16-1", &segment[..16]).len(), 1);
}

#[test]
fn push_rejects_same_name_different_content() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xA1);
    cmd_archive_push(&fixture.archive_config(false), &wal_path).unwrap();

    // The cluster recycled the segment name with different content.
    fixture.write_wal_segment(&segment, 0xB2);
    let err = cmd_archive_push(&fixture.archive_config(false), &wal_path).unwrap_err();
    assert_eq!(err.name(), "ArchiveMismatchError");
    assert!(err.to_string().contains("different checksum"));
}

#[test]
fn push_rejects_wal_from_another_cluster() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let mut foreign = fixture.control;
    foreign.system_id ^= 1;
    fixture
        .pg_storage()
        .put(
            &format!("pg_wal/{segment}"),
            &common::wal_segment_bytes(&foreign, 0xA1),
            FilterGroup::new(),
        )
        .unwrap();

    let err =
        cmd_archive_push(&fixture.archive_config(false), &format!("pg_wal/{segment}")).unwrap_err();
    assert_eq!(err.name(), "ArchiveMismatchError");
}

#[test]
fn compressed_push_round_trips_through_get() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xC3);
    let original = fixture
        .pg_storage()
        .get(&wal_path, false, FilterGroup::new())
        .unwrap()
        .unwrap();

    let mut cfg = fixture.archive_config(false);
    cfg.compress_type = Some(CompressType::Gz);
    cmd_archive_push(&cfg, &wal_path).unwrap();

    let files = common::archive_dir_list(&fixture.repo(), "16-1", &segment[..16]);
    assert!(files[0].ends_with(".gz"));

    let result = cmd_archive_get(&cfg, &segment, "pg_wal/RECOVERYXLOG").unwrap();
    assert!(matches!(result, ArchiveGetResult::Found(_)));
    let fetched = fixture
        .pg_storage()
        .get("pg_wal/RECOVERYXLOG", false, FilterGroup::new())
        .unwrap()
        .unwrap();
    assert_eq!(fetched, original);
}

#[test]
fn get_of_unarchived_segment_is_not_found() {
    let fixture = Fixture::new();
    let result = cmd_archive_get(
        &fixture.archive_config(false),
        &common::segment_name(1, 9999),
        "pg_wal/RECOVERYXLOG",
    )
    .unwrap();
    assert_eq!(result, ArchiveGetResult::NotFound);
}

#[test]
fn history_files_are_stored_at_the_archive_root() {
    let fixture = Fixture::new();
    fixture
        .pg_storage()
        .put("pg_wal/00000002.history", b"1\t2/1000000\tswitch\n", FilterGroup::new())
        .unwrap();
    cmd_archive_push(&fixture.archive_config(false), "pg_wal/00000002.history").unwrap();
    assert!(fixture
        .repo()
        .storage
        .exists("<REPO:ARCHIVE>/16-1/00000002.history")
        .unwrap());

    cmd_archive_get(
        &fixture.archive_config(false),
        "00000002.history",
        "pg_wal/RECOVERYHISTORY",
    )
    .unwrap();
    assert!(fixture.pg_storage().exists("pg_wal/RECOVERYHISTORY").unwrap());
}

#[test]
fn get_follows_timeline_history() {
    let fixture = Fixture::new();
    // Segment archived on timeline 1.
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xD4);
    let cfg = fixture.archive_config(false);
    cmd_archive_push(&cfg, &wal_path).unwrap();

    // Timeline 2 branched later; its history file says so.
    fixture
        .repo()
        .storage
        .put(
            "<REPO:ARCHIVE>/16-1/00000002.history",
            b"1\t1/40000000\tbefore switch\n",
            FilterGroup::new(),
        )
        .unwrap();

    let requested = common::segment_name(2, 4097);
    let result = cmd_archive_get(&cfg, &requested, "pg_wal/RECOVERYXLOG").unwrap();
    match result {
        ArchiveGetResult::Found(found) => assert!(found.starts_with(&segment)),
        ArchiveGetResult::NotFound => panic!("segment not resolved through history"),
    }
}

// ----------------------------------------------------------------------------
// Asynchronous protocol

#[test]
fn async_push_happy_path() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xE5);

    let cfg = fixture.archive_config(true);
    cmd_archive_push(&cfg, &wal_path).unwrap();

    // The segment is in the repository with its canonical name.
    let files = common::archive_dir_list(&fixture.repo(), "16-1", &segment[..16]);
    assert_eq!(files.len(), 1);
    assert!(files[0].starts_with(&format!("{segment}-")));

    // And the worker left an ok status in the spool.
    let spool = cfg.spool_storage();
    assert!(matches!(
        status_read(&spool, ArchiveMode::Push, &segment).unwrap(),
        Some(ArchiveStatus::Ok(_))
    ));
}

#[test]
fn async_push_readahead_fills_the_queue() {
    let fixture = Fixture::new();
    let anchor = common::segment_name(1, 4097);
    let next = common::segment_name(1, 4098);
    let wal_path = fixture.write_wal_segment(&anchor, 0x01);
    fixture.write_wal_segment(&next, 0x02);

    let cfg = fixture.archive_config(true);
    cmd_archive_push(&cfg, &wal_path).unwrap();

    // The worker pushes successors that already exist in pg_wal. Wait
    // briefly: the caller only waits for its own segment.
    let spool = cfg.spool_storage();
    let mut wait = Wait::new(std::time::Duration::from_secs(5));
    loop {
        if matches!(
            status_read(&spool, ArchiveMode::Push, &next).unwrap(),
            Some(ArchiveStatus::Ok(_))
        ) {
            break;
        }
        assert!(wait.more(), "readahead segment was never pushed");
    }
    assert_eq!(common::archive_dir_list(&fixture.repo(), "16-1", &next[..16]).len(), 1);
}

#[test]
fn async_push_confesses_stale_error_when_worker_cannot_fix_it() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    // No source in pg_wal: the freshly started worker cannot overwrite
    // the stale status, so after the first tolerated poll it surfaces.
    let cfg = fixture.archive_config(true);
    let spool = cfg.spool_storage();
    spool
        .put(
            &format!("<SPOOL:ARCHIVE_OUT>/{segment}.error"),
            b"25\nBOGUS",
            FilterGroup::new(),
        )
        .unwrap();

    let err = cmd_archive_push(&cfg, &format!("pg_wal/{segment}")).unwrap_err();
    assert_eq!(err.name(), "AssertError");
    assert_eq!(err.code(), 25);
    assert_eq!(err.to_string(), "BOGUS");
}

#[test]
fn async_get_prefetches_into_the_spool() {
    let fixture = Fixture::new();
    let segment = common::segment_name(1, 4097);
    let wal_path = fixture.write_wal_segment(&segment, 0xF6);
    let sync_cfg = fixture.archive_config(false);
    cmd_archive_push(&sync_cfg, &wal_path).unwrap();

    let cfg = fixture.archive_config(true);
    let result = cmd_archive_get(&cfg, &segment, "pg_wal/RECOVERYXLOG").unwrap();
    assert!(matches!(result, ArchiveGetResult::Found(_)));
    let fetched = fixture
        .pg_storage()
        .get("pg_wal/RECOVERYXLOG", false, FilterGroup::new())
        .unwrap()
        .unwrap();
    assert_eq!(fetched.len(), common::WAL_SEGMENT_SIZE as usize);
}

#[test]
fn async_get_reports_end_of_archive() {
    let fixture = Fixture::new();
    let cfg = fixture.archive_config(true);
    let result = cmd_archive_get(
        &cfg,
        &common::segment_name(1, 8888),
        "pg_wal/RECOVERYXLOG",
    )
    .unwrap();
    assert_eq!(result, ArchiveGetResult::NotFound);
}

#[test]
fn stop_file_blocks_via_caller_gate() {
    let fixture = Fixture::new();
    pgvault::lock::stop_create(&fixture.lock_path(), Some(&fixture.stanza)).unwrap();
    let err = pgvault::lock::stop_check(&fixture.lock_path(), Some(&fixture.stanza)).unwrap_err();
    assert!(matches!(err, Error::Stop(_)));
}
