//! The fixed control-plane query set.
//!
//! Everything the engine ever asks a cluster is behind [`DbClient`], so
//! tests can script a cluster and the backup protocol stays auditable.
//! All queries are schema-qualified and the session pins `search_path`,
//! so a hostile database cannot shadow the functions used here.

use std::time::Duration;

use postgres::{Client, NoTls};

use super::version::{PgVersion, PG_VERSION_10, PG_VERSION_15, PG_VERSION_96};
use super::wal::Lsn;
use crate::error::{Error, Result};

/// The cluster-wide advisory lock serializing backups against a single
/// cluster, shared by every backup server.
pub const BACKUP_ADVISORY_LOCK: &str = "12340078987004321";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStarted {
    pub lsn: Lsn,
    pub wal_segment_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupStopped {
    pub lsn: Lsn,
    pub wal_segment_name: String,
    /// `backup_label` content; absent on pre-9.6 exclusive backups, where
    /// the server writes the file into the data directory itself.
    pub backup_label: Option<String>,
    pub tablespace_map: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbDatabase {
    pub oid: u32,
    pub name: String,
    pub last_system_oid: u32,
}

pub trait DbClient: Send {
    /// Pin the session: `search_path`, encoding, application name, and no
    /// parallel workers. Returns the cluster's `checkpoint_timeout`.
    fn session_init(&mut self, application_name: &str) -> Result<Duration>;

    fn is_in_recovery(&mut self) -> Result<bool>;

    /// Take the cluster-wide backup advisory lock; `false` means another
    /// backup holds it.
    fn advisory_lock(&mut self) -> Result<bool>;

    fn backup_start(&mut self, start_fast: bool) -> Result<BackupStarted>;

    fn backup_stop(&mut self) -> Result<BackupStopped>;

    /// The segment the cluster is currently writing. Primary only.
    fn wal_segment_current(&mut self) -> Result<String>;

    /// Force a segment switch so the current segment becomes archivable.
    fn switch_wal(&mut self) -> Result<()>;

    /// Last replayed location, or `None` when this is not a standby.
    fn replay_lsn(&mut self) -> Result<Option<Lsn>>;

    /// Request an immediate checkpoint.
    fn checkpoint(&mut self) -> Result<()>;

    /// The last checkpoint location as the server reports it; `None`
    /// before 9.6 where `pg_control_checkpoint()` does not exist.
    fn checkpoint_lsn(&mut self) -> Result<Option<Lsn>>;

    fn database_list(&mut self) -> Result<Vec<DbDatabase>>;

    fn create_restore_point(&mut self, name: &str) -> Result<Lsn>;
}

// ----------------------------------------------------------------------------

/// [`DbClient`] over a live connection.
pub struct PgPostgresClient {
    client: Client,
    version: PgVersion,
}

impl PgPostgresClient {
    /// Connect with a libpq-style connection string, e.g.
    /// `host=/var/run/postgresql port=5432 user=postgres dbname=postgres`.
    pub fn connect(conninfo: &str, version: PgVersion) -> Result<Self> {
        let client = Client::connect(conninfo, NoTls)
            .map_err(|err| Error::DbConnect(format!("unable to connect to '{conninfo}': {err}")))?;
        Ok(Self { client, version })
    }

    fn exec(&mut self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).map_err(Error::from)
    }

    fn wal_name(&self) -> &'static str {
        if self.version >= PG_VERSION_10 {
            "wal"
        } else {
            "xlog"
        }
    }

    fn lsn_name(&self) -> &'static str {
        if self.version >= PG_VERSION_10 {
            "lsn"
        } else {
            "location"
        }
    }
}

impl DbClient for PgPostgresClient {
    fn session_init(&mut self, application_name: &str) -> Result<Duration> {
        // All queries are schema-qualified as well; the search_path pin is
        // belt and braces against function overrides.
        self.exec("set search_path = 'pg_catalog'")?;
        self.exec("set client_encoding = 'UTF8'")?;
        self.exec(&format!(
            "set application_name = '{}'",
            application_name.replace('\'', "''")
        ))?;
        // 9.6 marks pg_stop_backup() parallel-safe but it fails when run
        // in a parallel worker.
        if self.version >= PG_VERSION_96 {
            self.exec("set max_parallel_workers_per_gather = 0")?;
        }
        let row = self.client.query_one(
            "select (select setting from pg_catalog.pg_settings \
             where name = 'checkpoint_timeout')::int4",
            &[],
        )?;
        let seconds: i32 = row.get(0);
        Ok(Duration::from_secs(seconds.max(0) as u64))
    }

    fn is_in_recovery(&mut self) -> Result<bool> {
        let row = self
            .client
            .query_one("select pg_catalog.pg_is_in_recovery()", &[])?;
        Ok(row.get(0))
    }

    fn advisory_lock(&mut self) -> Result<bool> {
        let row = self.client.query_one(
            &format!("select pg_catalog.pg_try_advisory_lock({BACKUP_ADVISORY_LOCK})::bool"),
            &[],
        )?;
        Ok(row.get(0))
    }

    fn backup_start(&mut self, start_fast: bool) -> Result<BackupStarted> {
        let fast = if start_fast { "true" } else { "false" };
        let sql = if self.version >= PG_VERSION_15 {
            format!(
                "select lsn::text, pg_catalog.pg_walfile_name(lsn)::text \
                 from pg_catalog.pg_backup_start('pgvault', {fast}) as lsn"
            )
        } else if self.version >= PG_VERSION_96 {
            format!(
                "select lsn::text, pg_catalog.pg_{wal}file_name(lsn)::text \
                 from pg_catalog.pg_start_backup('pgvault', {fast}, false) as lsn",
                wal = self.wal_name()
            )
        } else {
            format!(
                "select lsn::text, pg_catalog.pg_{wal}file_name(lsn)::text \
                 from pg_catalog.pg_start_backup('pgvault', {fast}) as lsn",
                wal = self.wal_name()
            )
        };
        let row = self.client.query_one(&sql, &[])?;
        let lsn: String = row.get(0);
        Ok(BackupStarted { lsn: lsn.parse()?, wal_segment_name: row.get(1) })
    }

    fn backup_stop(&mut self) -> Result<BackupStopped> {
        if self.version >= PG_VERSION_96 {
            let sql = if self.version >= PG_VERSION_15 {
                "select lsn::text, pg_catalog.pg_walfile_name(lsn)::text, labelfile::text, \
                 spcmapfile::text from pg_catalog.pg_backup_stop(false)"
                    .to_owned()
            } else if self.version >= PG_VERSION_10 {
                "select lsn::text, pg_catalog.pg_walfile_name(lsn)::text, labelfile::text, \
                 spcmapfile::text from pg_catalog.pg_stop_backup(false, false)"
                    .to_owned()
            } else {
                "select lsn::text, pg_catalog.pg_xlogfile_name(lsn)::text, labelfile::text, \
                 spcmapfile::text from pg_catalog.pg_stop_backup(false)"
                    .to_owned()
            };
            let row = self.client.query_one(&sql, &[])?;
            let lsn: String = row.get(0);
            let tablespace_map: Option<String> = row.get(3);
            Ok(BackupStopped {
                lsn: lsn.parse()?,
                wal_segment_name: row.get(1),
                backup_label: row.get(2),
                tablespace_map: tablespace_map.filter(|map| !map.trim().is_empty()),
            })
        } else {
            let row = self.client.query_one(
                &format!(
                    "select lsn::text, pg_catalog.pg_{wal}file_name(lsn)::text \
                     from pg_catalog.pg_stop_backup() as lsn",
                    wal = self.wal_name()
                ),
                &[],
            )?;
            let lsn: String = row.get(0);
            Ok(BackupStopped {
                lsn: lsn.parse()?,
                wal_segment_name: row.get(1),
                backup_label: None,
                tablespace_map: None,
            })
        }
    }

    fn wal_segment_current(&mut self) -> Result<String> {
        let row = self.client.query_one(
            &format!(
                "select pg_catalog.pg_{wal}file_name(pg_catalog.pg_current_{wal}_{lsn}())::text",
                wal = self.wal_name(),
                lsn = self.lsn_name()
            ),
            &[],
        )?;
        Ok(row.get(0))
    }

    fn switch_wal(&mut self) -> Result<()> {
        self.exec(&format!(
            "select pg_catalog.pg_switch_{wal}()::text",
            wal = self.wal_name()
        ))
    }

    fn replay_lsn(&mut self) -> Result<Option<Lsn>> {
        let row = self.client.query_one(
            &format!(
                "select pg_catalog.pg_last_{wal}_replay_{lsn}()::text",
                wal = self.wal_name(),
                lsn = self.lsn_name()
            ),
            &[],
        )?;
        let lsn: Option<String> = row.get(0);
        lsn.map(|lsn| lsn.parse()).transpose()
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.exec("checkpoint")
    }

    fn checkpoint_lsn(&mut self) -> Result<Option<Lsn>> {
        if self.version < PG_VERSION_96 {
            return Ok(None);
        }
        let column = if self.version >= PG_VERSION_10 {
            "checkpoint_lsn"
        } else {
            "checkpoint_location"
        };
        let row = self.client.query_one(
            &format!("select {column}::text from pg_catalog.pg_control_checkpoint()"),
            &[],
        )?;
        let lsn: String = row.get(0);
        Ok(Some(lsn.parse()?))
    }

    fn database_list(&mut self) -> Result<Vec<DbDatabase>> {
        // template0's oid stands in for datlastsysoid, which PostgreSQL 15
        // removed.
        let rows = self.client.query(
            "select oid::oid, datname::text, \
             (select oid::oid from pg_catalog.pg_database where datname = 'template0') \
             as datlastsysoid from pg_catalog.pg_database order by oid",
            &[],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| DbDatabase {
                oid: row.get(0),
                name: row.get(1),
                last_system_oid: row.get(2),
            })
            .collect())
    }

    fn create_restore_point(&mut self, name: &str) -> Result<Lsn> {
        let row = self.client.query_one(
            &format!(
                "select pg_catalog.pg_create_restore_point('{}')::text",
                name.replace('\'', "''")
            ),
            &[],
        )?;
        let lsn: String = row.get(0);
        Ok(lsn.parse()?)
    }
}
