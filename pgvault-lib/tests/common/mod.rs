//! Shared fixtures: a miniature data directory, a scripted database
//! client, and WAL segment fabrication.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use pgvault::archive::ArchiveConfig;
use pgvault::error::Result;
use pgvault::filter::FilterGroup;
use pgvault::pg::client::{BackupStarted, BackupStopped, DbDatabase};
use pgvault::pg::version::PG_VERSION_16;
use pgvault::pg::{DbClient, Lsn, PgControl, WalHeader, WalSegment};
use pgvault::repo::Repo;
use pgvault::stanza::{cmd_stanza_create, StanzaConfig};
use pgvault::storage::Storage;

/// Small segments keep the fixtures fast; 1 MiB is the smallest size a
/// server can be built with.
pub const WAL_SEGMENT_SIZE: u32 = 1024 * 1024;
pub const SYSTEM_ID: u64 = 0x5D94_39A6_85A8_1C5F;

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub stanza: String,
    pub control: PgControl,
}

impl Fixture {
    /// A data directory with a control file, a few cluster files, and an
    /// initialized stanza in the repository.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut control = PgControl::for_version(PG_VERSION_16, SYSTEM_ID);
        control.wal_segment_size = WAL_SEGMENT_SIZE;
        control.page_checksum_version = 0;
        control.checkpoint = Lsn(0x2_0000_0000);

        let pg = Storage::posix(dir.path().join("pg"));
        pg.put("global/pg_control", &control.to_bytes(), FilterGroup::new()).unwrap();
        pg.put("PG_VERSION", b"16\n", FilterGroup::new()).unwrap();
        pg.put("base/1/112", b"template catalog one", FilterGroup::new()).unwrap();
        pg.put("base/1/113", b"template catalog two", FilterGroup::new()).unwrap();
        pg.put("base/5/117", b"postgres catalog", FilterGroup::new()).unwrap();
        pg.put("base/16384/3000", &vec![7u8; 16384], FilterGroup::new()).unwrap();
        pg.put("base/16384/pg_filenode.map", &vec![3u8; 512], FilterGroup::new()).unwrap();
        pg.put("base/16384/PG_VERSION", b"16\n", FilterGroup::new()).unwrap();
        pg.put("postmaster.opts", b"postgres", FilterGroup::new()).unwrap();
        pg.path_create("pg_wal", 0o700).unwrap();
        pg.path_create("pg_tblspc", 0o700).unwrap();

        let fixture = Self { dir, stanza: "main".to_owned(), control };
        cmd_stanza_create(&fixture.stanza_config()).expect("stanza create");
        fixture
    }

    pub fn pg_path(&self) -> PathBuf {
        self.dir.path().join("pg")
    }

    pub fn pg_storage(&self) -> Storage {
        Storage::posix(self.pg_path())
    }

    pub fn repo_path(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn repo(&self) -> Repo {
        Repo::new(1, self.repo_path(), &self.stanza, None)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.path().join("lock")
    }

    pub fn spool_path(&self) -> PathBuf {
        self.dir.path().join("spool")
    }

    pub fn stanza_config(&self) -> StanzaConfig {
        StanzaConfig {
            stanza: self.stanza.clone(),
            pg_path: self.pg_path(),
            lock_path: self.lock_path(),
            repos: vec![self.repo()],
        }
    }

    pub fn archive_config(&self, archive_async: bool) -> ArchiveConfig {
        ArchiveConfig {
            stanza: self.stanza.clone(),
            pg_path: self.pg_path(),
            spool_path: self.spool_path(),
            lock_path: self.lock_path(),
            repos: vec![self.repo()],
            compress_type: None,
            compress_level: None,
            archive_async,
            archive_timeout: Duration::from_secs(5),
            protocol_timeout: Duration::from_secs(30),
            queue_max: u64::from(WAL_SEGMENT_SIZE) * 4,
            process_max: 2,
        }
    }

    /// Fabricate a WAL segment in `pg_wal`, full size with a valid long
    /// page header.
    pub fn write_wal_segment(&self, name: &str, fill: u8) -> String {
        let data = wal_segment_bytes(&self.control, fill);
        let path = format!("pg_wal/{name}");
        self.pg_storage().put(&path, &data, FilterGroup::new()).unwrap();
        path
    }

    /// Overwrite the control file, e.g. to simulate a re-initdb.
    pub fn write_control(&self, control: &PgControl) {
        self.pg_storage()
            .put("global/pg_control", &control.to_bytes(), FilterGroup::new())
            .unwrap();
    }
}

pub fn wal_segment_bytes(control: &PgControl, fill: u8) -> Vec<u8> {
    let header = WalHeader { version: control.version, system_id: control.system_id };
    let mut data = vec![fill; control.wal_segment_size as usize];
    let head = header.to_bytes(control.wal_segment_size);
    data[..head.len()].copy_from_slice(&head);
    data
}

pub fn segment_name(timeline: u32, segno: u64) -> String {
    WalSegment { timeline, segno }.name(WAL_SEGMENT_SIZE)
}

/// List the repository archive directory for one 16-char prefix.
pub fn archive_dir_list(repo: &Repo, archive_id: &str, prefix: &str) -> Vec<String> {
    repo.storage
        .list(&format!("<REPO:ARCHIVE>/{archive_id}/{prefix}"))
        .unwrap()
}

// ----------------------------------------------------------------------------

/// A scripted cluster: every [`DbClient`] answer is preset.
pub struct ScriptedDb {
    pub in_recovery: bool,
    pub advisory: bool,
    pub start: BackupStarted,
    pub stop: BackupStopped,
    pub current_segment: String,
    pub replay: Option<Lsn>,
    pub databases: Vec<DbDatabase>,
    pub switch_count: usize,
}

impl ScriptedDb {
    /// A primary whose backup spans two segments.
    pub fn primary() -> Self {
        let start_lsn: Lsn = Lsn(0x2_0000_0000);
        let stop_lsn: Lsn = Lsn(0x2_0010_0000);
        let start_segment = WalSegment::from_lsn(start_lsn, 1, WAL_SEGMENT_SIZE);
        let stop_segment = WalSegment::from_lsn(stop_lsn, 1, WAL_SEGMENT_SIZE);
        Self {
            in_recovery: false,
            advisory: true,
            start: BackupStarted {
                lsn: start_lsn,
                wal_segment_name: start_segment.name(WAL_SEGMENT_SIZE),
            },
            stop: BackupStopped {
                lsn: stop_lsn,
                wal_segment_name: stop_segment.name(WAL_SEGMENT_SIZE),
                backup_label: Some("START WAL LOCATION: 2/0\n".to_owned()),
                tablespace_map: None,
            },
            current_segment: start_segment.name(WAL_SEGMENT_SIZE),
            replay: None,
            databases: vec![
                DbDatabase { oid: 1, name: "template1".into(), last_system_oid: 13000 },
                DbDatabase { oid: 4, name: "template0".into(), last_system_oid: 13000 },
                DbDatabase { oid: 5, name: "postgres".into(), last_system_oid: 13000 },
                DbDatabase { oid: 16384, name: "exclude_me".into(), last_system_oid: 13000 },
            ],
            switch_count: 0,
        }
    }
}

impl DbClient for ScriptedDb {
    fn session_init(&mut self, _application_name: &str) -> Result<Duration> {
        Ok(Duration::from_secs(300))
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        Ok(self.in_recovery)
    }

    fn advisory_lock(&mut self) -> Result<bool> {
        Ok(self.advisory)
    }

    fn backup_start(&mut self, _start_fast: bool) -> Result<BackupStarted> {
        Ok(self.start.clone())
    }

    fn backup_stop(&mut self) -> Result<BackupStopped> {
        Ok(self.stop.clone())
    }

    fn wal_segment_current(&mut self) -> Result<String> {
        Ok(self.current_segment.clone())
    }

    fn switch_wal(&mut self) -> Result<()> {
        self.switch_count += 1;
        Ok(())
    }

    fn replay_lsn(&mut self) -> Result<Option<Lsn>> {
        Ok(self.replay)
    }

    fn checkpoint(&mut self) -> Result<()> {
        Ok(())
    }

    fn checkpoint_lsn(&mut self) -> Result<Option<Lsn>> {
        Ok(Some(self.start.lsn))
    }

    fn database_list(&mut self) -> Result<Vec<DbDatabase>> {
        Ok(self.databases.clone())
    }

    fn create_restore_point(&mut self, _name: &str) -> Result<Lsn> {
        Ok(self.start.lsn)
    }
}

/// Read a restored file, as bytes.
pub fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("file readable")
}
