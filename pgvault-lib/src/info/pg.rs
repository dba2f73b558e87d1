//! The PostgreSQL version history embedded in `archive.info` and
//! `backup.info`.
//!
//! Each cluster incarnation (initdb, or a version upgrade) appends a row;
//! the surrogate `id` is strictly increasing and the last row is current.
//! `archive.info` and `backup.info` must agree on the whole history; the
//! pairwise check catches a repository spliced together from two
//! clusters.

use serde_json::{json, Value};

use super::IniDoc;
use crate::error::{Error, Result};
use crate::pg::{PgControl, PgVersion};

const SECTION_DB: &str = "db";
const SECTION_DB_HISTORY: &str = "db:history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgVersionRecord {
    pub id: u32,
    pub version: PgVersion,
    pub system_id: u64,
    pub catalog_version: u32,
    pub control_version: u32,
}

impl PgVersionRecord {
    pub fn from_control(id: u32, control: &PgControl) -> Self {
        Self {
            id,
            version: control.version,
            system_id: control.system_id,
            catalog_version: control.catalog_version,
            control_version: control.control_version,
        }
    }

    /// The archive directory this incarnation's WAL lives under.
    pub fn archive_id(&self) -> String {
        format!("{}-{}", self.version, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgHistory {
    /// Ascending by id; never empty; last is current.
    records: Vec<PgVersionRecord>,
}

impl PgHistory {
    pub fn new(record: PgVersionRecord) -> Self {
        Self { records: vec![record] }
    }

    pub fn current(&self) -> &PgVersionRecord {
        self.records.last().expect("history is never empty")
    }

    pub fn records(&self) -> &[PgVersionRecord] {
        &self.records
    }

    /// Append a new incarnation (stanza upgrade); the id advances by one.
    pub fn add(&mut self, control: &PgControl) -> &PgVersionRecord {
        let id = self.current().id + 1;
        self.records.push(PgVersionRecord::from_control(id, control));
        self.current()
    }

    /// The current record must match the live cluster.
    pub fn check_pg(&self, version: PgVersion, system_id: u64) -> Result<()> {
        let current = self.current();
        if current.version != version || current.system_id != system_id {
            return Err(Error::FileInvalid(format!(
                "database version = {}, system-id {} does not match backup version = {}, \
                 system-id = {}\nHINT: is this the correct stanza?",
                version, system_id, current.version, current.system_id
            )));
        }
        Ok(())
    }

    /// The newest record matching `{version, system_id}`, if any; used to
    /// resolve the archive id to fetch WAL from.
    pub fn find(&self, version: PgVersion, system_id: u64) -> Option<&PgVersionRecord> {
        self.records
            .iter()
            .rev()
            .find(|record| record.version == version && record.system_id == system_id)
    }

    pub fn find_id(&self, id: u32) -> Option<&PgVersionRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    // ------------------------------------------------------------------

    pub fn to_ini(&self, doc: &mut IniDoc) {
        let current = self.current();
        doc.set(SECTION_DB, "db-id", json!(current.id));
        doc.set(SECTION_DB, "db-system-id", json!(current.system_id));
        doc.set(SECTION_DB, "db-version", json!(current.version.to_string()));
        doc.set(SECTION_DB, "db-catalog-version", json!(current.catalog_version));
        doc.set(SECTION_DB, "db-control-version", json!(current.control_version));
        for record in &self.records {
            doc.set(
                SECTION_DB_HISTORY,
                &record.id.to_string(),
                json!({
                    "db-catalog-version": record.catalog_version,
                    "db-control-version": record.control_version,
                    "db-system-id": record.system_id,
                    "db-version": record.version.to_string(),
                }),
            );
        }
    }

    pub fn from_ini(doc: &IniDoc) -> Result<Self> {
        let mut records = Vec::new();
        for key in doc.section_keys(SECTION_DB_HISTORY) {
            let id: u32 = key
                .parse()
                .map_err(|_| Error::FileInvalid(format!("invalid history id '{key}'")))?;
            let value = doc.require(SECTION_DB_HISTORY, key)?;
            records.push(PgVersionRecord {
                id,
                version: str_field(value, "db-version")?.parse()?,
                system_id: u64_field(value, "db-system-id")?,
                catalog_version: u64_field(value, "db-catalog-version")? as u32,
                control_version: u64_field(value, "db-control-version")? as u32,
            });
        }
        records.sort_by_key(|record| record.id);
        if records.is_empty() {
            return Err(Error::FileInvalid("info file has no database history".into()));
        }
        for pair in records.windows(2) {
            if pair[1].id <= pair[0].id {
                return Err(Error::FileInvalid("database history ids are not increasing".into()));
            }
        }

        let history = Self { records };

        // The [db] section must agree with the last history row.
        let current = history.current();
        let id = doc.require(SECTION_DB, "db-id")?.as_u64().unwrap_or(0) as u32;
        let system_id = doc.require(SECTION_DB, "db-system-id")?.as_u64().unwrap_or(0);
        if id != current.id || system_id != current.system_id {
            return Err(Error::FileInvalid(
                "current database does not match the last history entry".into(),
            ));
        }
        Ok(history)
    }

    /// Pairwise equality between the archive and backup histories.
    pub fn check_pair(archive: &PgHistory, backup: &PgHistory) -> Result<()> {
        if archive.records.len() != backup.records.len() {
            return Err(Error::FileInvalid(format!(
                "archive and backup history length differs ({} vs {})",
                archive.records.len(),
                backup.records.len()
            )));
        }
        for (a, b) in archive.records.iter().zip(&backup.records) {
            if a.id != b.id || a.version != b.version || a.system_id != b.system_id {
                return Err(Error::FileInvalid(format!(
                    "archive history id {} (version {}, system-id {}) does not match backup \
                     history id {} (version {}, system-id {})",
                    a.id, a.version, a.system_id, b.id, b.version, b.system_id
                )));
            }
        }
        Ok(())
    }
}

fn str_field<'v>(value: &'v Value, field: &str) -> Result<&'v str> {
    value[field]
        .as_str()
        .ok_or_else(|| Error::FileInvalid(format!("missing field '{field}'")))
}

fn u64_field(value: &Value, field: &str) -> Result<u64> {
    value[field]
        .as_u64()
        .ok_or_else(|| Error::FileInvalid(format!("missing field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::version::{PG_VERSION_15, PG_VERSION_16};

    fn history() -> PgHistory {
        let control = PgControl::for_version(PG_VERSION_15, 1000);
        let mut history = PgHistory::new(PgVersionRecord::from_control(1, &control));
        history.add(&PgControl::for_version(PG_VERSION_16, 2000));
        history
    }

    #[test]
    fn ini_round_trip_preserves_history() {
        let history = history();
        let mut doc = IniDoc::new();
        history.to_ini(&mut doc);
        let parsed = PgHistory::from_ini(&doc).unwrap();
        assert_eq!(parsed, history);
        assert_eq!(parsed.current().id, 2);
        assert_eq!(parsed.current().archive_id(), "16-2");
    }

    #[test]
    fn check_pg_rejects_wrong_cluster() {
        let history = history();
        history.check_pg(PG_VERSION_16, 2000).unwrap();
        assert!(history.check_pg(PG_VERSION_16, 9999).is_err());
        assert!(history.check_pg(PG_VERSION_15, 2000).is_err());
    }

    #[test]
    fn find_resolves_older_incarnations() {
        let history = history();
        assert_eq!(history.find(PG_VERSION_15, 1000).unwrap().archive_id(), "15-1");
        assert!(history.find(PG_VERSION_15, 2000).is_none());
    }

    #[test]
    fn pair_check_rejects_mismatch() {
        let a = history();
        let mut b = history();
        PgHistory::check_pair(&a, &b).unwrap();
        b.add(&PgControl::for_version(PG_VERSION_16, 3000));
        assert!(PgHistory::check_pair(&a, &b).is_err());
    }
}
