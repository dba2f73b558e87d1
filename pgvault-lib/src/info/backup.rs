//! `backup.info`: the backup cipher sub-passphrase, the cluster version
//! history, and the list of completed backups with their WAL ranges and
//! summary sizes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;

use super::pg::{PgHistory, PgVersionRecord};
use super::IniDoc;
use crate::error::{Error, Result};
use crate::pg::{PgControl, PgVersion};
use crate::storage::Storage;

pub const INFO_BACKUP_FILE: &str = "backup.info";
/// Path expression form used with repository storage.
pub const INFO_BACKUP_PATH: &str = "<REPO:BACKUP>/backup.info";

const SECTION_CIPHER: &str = "cipher";
const KEY_CIPHER_PASS: &str = "cipher-pass";
const SECTION_CURRENT: &str = "backup:current";

lazy_static! {
    /// Backup labels: `YYYYMMDD-HHMMSSF` for fulls, with a
    /// `_YYYYMMDD-HHMMSS(D|I)` suffix for differentials and incrementals.
    pub static ref BACKUP_LABEL_RE: Regex =
        Regex::new("^[0-9]{8}-[0-9]{6}F(_[0-9]{8}-[0-9]{6}(D|I))?$").expect("valid regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Full,
    Diff,
    Incr,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            _ => Err(Error::OptionInvalidValue(format!(
                "'{s}' is not a valid backup type (expected full, diff, or incr)"
            ))),
        }
    }
}

/// Build a backup label. Dependent backups carry the full backup's label
/// as their prefix, so a label alone names its backup set.
pub fn backup_label(backup_type: BackupType, prior: Option<&str>, time: DateTime<Utc>) -> String {
    let stamp = time.format("%Y%m%d-%H%M%S");
    match backup_type {
        BackupType::Full => format!("{stamp}F"),
        BackupType::Diff | BackupType::Incr => {
            let full_part = prior
                .expect("dependent backups have a prior")
                .split('_')
                .next()
                .expect("split always yields one part");
            let suffix = if backup_type == BackupType::Diff { 'D' } else { 'I' };
            format!("{full_part}_{stamp}{suffix}")
        }
    }
}

// ----------------------------------------------------------------------------

/// One completed backup as summarized in `backup.info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub label: String,
    pub backup_type: BackupType,
    /// The directly prior backup this one references, when not full.
    pub prior: Option<String>,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub lsn_start: String,
    pub lsn_stop: String,
    pub archive_start: String,
    pub archive_stop: String,
    /// History id of the cluster incarnation backed up.
    pub pg_id: u32,
    /// Original (cluster) size in bytes.
    pub size: u64,
    /// Size in the repository after compression/encryption.
    pub size_repo: u64,
    /// Every backup label this backup references files from.
    pub reference: Vec<String>,
}

impl BackupRecord {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "backup-type": self.backup_type.as_str(),
            "backup-prior": self.prior,
            "backup-timestamp-start": self.timestamp_start,
            "backup-timestamp-stop": self.timestamp_stop,
            "backup-lsn-start": self.lsn_start,
            "backup-lsn-stop": self.lsn_stop,
            "backup-archive-start": self.archive_start,
            "backup-archive-stop": self.archive_stop,
            "db-id": self.pg_id,
            "backup-info-size": self.size,
            "backup-info-repo-size": self.size_repo,
            "backup-reference": self.reference,
        })
    }

    fn from_json(label: &str, value: &serde_json::Value) -> Result<Self> {
        let str_of = |field: &str| -> Result<String> {
            value[field]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| Error::FileInvalid(format!("backup '{label}' missing '{field}'")))
        };
        let u64_of = |field: &str| -> Result<u64> {
            value[field]
                .as_u64()
                .ok_or_else(|| Error::FileInvalid(format!("backup '{label}' missing '{field}'")))
        };
        Ok(Self {
            label: label.to_owned(),
            backup_type: str_of("backup-type")?.parse()?,
            prior: value["backup-prior"].as_str().map(str::to_owned),
            timestamp_start: u64_of("backup-timestamp-start")? as i64,
            timestamp_stop: u64_of("backup-timestamp-stop")? as i64,
            lsn_start: str_of("backup-lsn-start")?,
            lsn_stop: str_of("backup-lsn-stop")?,
            archive_start: str_of("backup-archive-start")?,
            archive_stop: str_of("backup-archive-stop")?,
            pg_id: u64_of("db-id")? as u32,
            size: u64_of("backup-info-size")?,
            size_repo: u64_of("backup-info-repo-size")?,
            reference: value["backup-reference"]
                .as_array()
                .map(|refs| {
                    refs.iter()
                        .filter_map(|r| r.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoBackup {
    pub history: PgHistory,
    /// Sub-passphrase for backup files when the repo is encrypted.
    pub cipher_pass: Option<String>,
    /// Completed backups, ascending by label (which is ascending by time).
    current: Vec<BackupRecord>,
}

impl InfoBackup {
    pub fn create(control: &PgControl, encrypted: bool) -> Self {
        Self {
            history: PgHistory::new(PgVersionRecord::from_control(1, control)),
            cipher_pass: encrypted.then(super::cipher_pass_gen),
            current: Vec::new(),
        }
    }

    pub fn load(storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<Self> {
        let doc = super::load(storage, INFO_BACKUP_PATH, repo_cipher_pass, false)?
            .expect("errors when missing");
        Self::from_ini(&doc)
    }

    pub fn load_opt(storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<Option<Self>> {
        match super::load(storage, INFO_BACKUP_PATH, repo_cipher_pass, true)? {
            Some(doc) => Self::from_ini(&doc).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<()> {
        super::save(storage, INFO_BACKUP_PATH, &self.to_ini(), repo_cipher_pass)
    }

    pub fn from_ini(doc: &IniDoc) -> Result<Self> {
        let mut current = Vec::new();
        for label in doc.section_keys(SECTION_CURRENT) {
            if !BACKUP_LABEL_RE.is_match(label) {
                return Err(Error::FileInvalid(format!("invalid backup label '{label}'")));
            }
            current.push(BackupRecord::from_json(label, doc.require(SECTION_CURRENT, label)?)?);
        }
        current.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(Self {
            history: PgHistory::from_ini(doc)?,
            cipher_pass: doc
                .get(SECTION_CIPHER, KEY_CIPHER_PASS)
                .and_then(|value| value.as_str())
                .map(str::to_owned),
            current,
        })
    }

    pub fn to_ini(&self) -> IniDoc {
        let mut doc = IniDoc::new();
        self.history.to_ini(&mut doc);
        if let Some(pass) = &self.cipher_pass {
            doc.set(SECTION_CIPHER, KEY_CIPHER_PASS, json!(pass));
        }
        for record in &self.current {
            doc.set(SECTION_CURRENT, &record.label, record.to_json());
        }
        doc
    }

    // ------------------------------------------------------------------

    pub fn backups(&self) -> &[BackupRecord] {
        &self.current
    }

    pub fn find(&self, label: &str) -> Option<&BackupRecord> {
        self.current.iter().find(|record| record.label == label)
    }

    pub fn latest(&self) -> Option<&BackupRecord> {
        self.current.last()
    }

    /// The latest backup usable as the prior for `backup_type`: the
    /// latest full for a differential, the latest of any type for an
    /// incremental.
    pub fn latest_prior(&self, backup_type: BackupType) -> Option<&BackupRecord> {
        match backup_type {
            BackupType::Full => None,
            BackupType::Diff => self
                .current
                .iter()
                .rev()
                .find(|record| record.backup_type == BackupType::Full),
            BackupType::Incr => self.current.last(),
        }
    }

    pub fn add(&mut self, record: BackupRecord) {
        self.current.retain(|existing| existing.label != record.label);
        self.current.push(record);
        self.current.sort_by(|a, b| a.label.cmp(&b.label));
    }

    pub fn remove(&mut self, label: &str) {
        self.current.retain(|record| record.label != label);
    }

    /// Labels of every live backup that (transitively) references
    /// `label`.
    pub fn dependents(&self, label: &str) -> Vec<String> {
        let mut dependents: Vec<String> = Vec::new();
        // Labels sort in dependency order, so one forward pass settles
        // the transitive closure.
        for record in &self.current {
            if let Some(prior) = &record.prior {
                if prior == label || dependents.iter().any(|dep| dep == prior) {
                    dependents.push(record.label.clone());
                }
            }
        }
        dependents
    }

    /// `backup.info` also checks the catalog and control versions, which
    /// the archive side does not track.
    pub fn check_pg(
        &self,
        version: PgVersion,
        system_id: u64,
        catalog_version: u32,
        control_version: u32,
    ) -> Result<()> {
        self.history.check_pg(version, system_id)?;
        let current = self.history.current();
        if current.catalog_version != catalog_version || current.control_version != control_version
        {
            return Err(Error::FileInvalid(format!(
                "database control-version = {control_version}, catalog-version = \
                 {catalog_version} does not match backup control-version = {}, catalog-version \
                 = {}\nHINT: is this the correct stanza?",
                current.control_version, current.catalog_version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::version::PG_VERSION_16;
    use chrono::TimeZone;

    fn record(label: &str, backup_type: BackupType, prior: Option<&str>) -> BackupRecord {
        BackupRecord {
            label: label.to_owned(),
            backup_type,
            prior: prior.map(str::to_owned),
            timestamp_start: 1_700_000_000,
            timestamp_stop: 1_700_000_060,
            lsn_start: "0/1000028".into(),
            lsn_stop: "0/1000130".into(),
            archive_start: "000000010000000000000001".into(),
            archive_stop: "000000010000000000000001".into(),
            pg_id: 1,
            size: 1000,
            size_repo: 500,
            reference: prior.map(|p| vec![p.to_owned()]).unwrap_or_default(),
        }
    }

    #[test]
    fn labels_follow_the_format() {
        let time = Utc.with_ymd_and_hms(2025, 8, 1, 12, 30, 0).unwrap();
        let full = backup_label(BackupType::Full, None, time);
        assert_eq!(full, "20250801-123000F");
        assert!(BACKUP_LABEL_RE.is_match(&full));

        let later = Utc.with_ymd_and_hms(2025, 8, 1, 12, 45, 0).unwrap();
        let diff = backup_label(BackupType::Diff, Some(&full), later);
        assert_eq!(diff, "20250801-123000F_20250801-124500D");
        assert!(BACKUP_LABEL_RE.is_match(&diff));

        // An incremental on the differential still carries the full part.
        let incr = backup_label(BackupType::Incr, Some(&diff), later);
        assert_eq!(incr, "20250801-123000F_20250801-124500I");
        assert!(BACKUP_LABEL_RE.is_match(&incr));
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::repo(dir.path(), "main");
        let control = PgControl::for_version(PG_VERSION_16, 42);
        let mut info = InfoBackup::create(&control, false);
        info.add(record("20250801-010000F", BackupType::Full, None));
        info.add(record(
            "20250801-010000F_20250801-020000I",
            BackupType::Incr,
            Some("20250801-010000F"),
        ));
        info.save(&storage, None).unwrap();

        let loaded = InfoBackup::load(&storage, None).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.latest().unwrap().label, "20250801-010000F_20250801-020000I");
    }

    #[test]
    fn dependents_follow_the_reference_chain() {
        let control = PgControl::for_version(PG_VERSION_16, 42);
        let mut info = InfoBackup::create(&control, false);
        info.add(record("20250801-010000F", BackupType::Full, None));
        info.add(record(
            "20250801-010000F_20250801-020000D",
            BackupType::Diff,
            Some("20250801-010000F"),
        ));
        info.add(record(
            "20250801-010000F_20250801-030000I",
            BackupType::Incr,
            Some("20250801-010000F_20250801-020000D"),
        ));
        info.add(record("20250802-010000F", BackupType::Full, None));

        let dependents = info.dependents("20250801-010000F");
        assert_eq!(
            dependents,
            vec![
                "20250801-010000F_20250801-020000D".to_owned(),
                "20250801-010000F_20250801-030000I".to_owned(),
            ]
        );
        assert!(info.dependents("20250802-010000F").is_empty());
    }

    #[test]
    fn latest_prior_by_type() {
        let control = PgControl::for_version(PG_VERSION_16, 42);
        let mut info = InfoBackup::create(&control, false);
        info.add(record("20250801-010000F", BackupType::Full, None));
        info.add(record(
            "20250801-010000F_20250801-020000D",
            BackupType::Diff,
            Some("20250801-010000F"),
        ));

        assert!(info.latest_prior(BackupType::Full).is_none());
        assert_eq!(
            info.latest_prior(BackupType::Diff).unwrap().label,
            "20250801-010000F"
        );
        assert_eq!(
            info.latest_prior(BackupType::Incr).unwrap().label,
            "20250801-010000F_20250801-020000D"
        );
    }
}
