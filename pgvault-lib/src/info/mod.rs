//! Repository info files: the ini+JSON text format, the trailing checksum
//! section, and the dual-copy persistence discipline shared by
//! `archive.info`, `backup.info`, and backup manifests.
//!
//! Files are UTF-8 text: `[section]` headers with `key=<json-value>`
//! lines, terminated by a `[backrest]` section whose final
//! `backrest-checksum` line holds the SHA-1 of every preceding byte. A
//! successful save writes the primary file and then its `.copy`; a load
//! tries the primary and falls back to the copy, so a torn write of
//! either never loses the file.

pub mod archive;
pub mod backup;
pub mod pg;

pub use archive::InfoArchive;
pub use backup::{backup_label, BackupRecord, BackupType, InfoBackup};
pub use pg::{PgHistory, PgVersionRecord};

use std::collections::BTreeMap;

use rand::RngCore;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::filter::hash::sha1_hex;
use crate::filter::{CipherFilter, CipherMode, FilterGroup};
use crate::storage::Storage;

/// Extension of the redundant copy written beside every info file.
pub const INFO_COPY_EXT: &str = ".copy";

const INFO_SECTION: &str = "backrest";
const INFO_KEY_CHECKSUM: &str = "backrest-checksum";
const INFO_KEY_FORMAT: &str = "backrest-format";
const INFO_KEY_VERSION: &str = "backrest-version";

/// On-disk format number; bumped only on incompatible layout changes.
pub const INFO_FORMAT: u64 = 5;

// ----------------------------------------------------------------------------

/// An ini document: ordered sections of ordered `key=<json>` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDoc {
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl IniDoc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    /// A value that must exist, with file context in the error.
    pub fn require(&self, section: &str, key: &str) -> Result<&Value> {
        self.get(section, key).ok_or_else(|| {
            Error::FileInvalid(format!("missing '{key}' in section '[{section}]'"))
        })
    }

    pub fn section(&self, section: &str) -> Option<&BTreeMap<String, Value>> {
        self.sections.get(section)
    }

    pub fn section_keys(&self, section: &str) -> Vec<&str> {
        self.sections
            .get(section)
            .map(|pairs| pairs.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, section: &str, key: &str) {
        if let Some(pairs) = self.sections.get_mut(section) {
            pairs.remove(key);
            if pairs.is_empty() {
                self.sections.remove(section);
            }
        }
    }

    /// Serialize with the terminal checksum section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut text = String::new();
        for (section, pairs) in &self.sections {
            debug_assert_ne!(section, INFO_SECTION);
            text.push_str(&format!("[{section}]\n"));
            for (key, value) in pairs {
                text.push_str(&format!("{key}={value}\n"));
            }
            text.push('\n');
        }
        text.push_str(&format!("[{INFO_SECTION}]\n"));
        text.push_str(&format!("{INFO_KEY_FORMAT}={INFO_FORMAT}\n"));
        text.push_str(&format!(
            "{INFO_KEY_VERSION}={}\n",
            Value::String(env!("CARGO_PKG_VERSION").to_owned())
        ));
        let checksum = sha1_hex(text.as_bytes());
        text.push_str(&format!("{INFO_KEY_CHECKSUM}=\"{checksum}\"\n"));
        text.into_bytes()
    }

    /// Parse and verify the terminal checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| Error::FileInvalid("info file is not valid UTF-8".into()))?;

        let checksum_line_start = text
            .rfind(&format!("{INFO_KEY_CHECKSUM}="))
            .ok_or_else(|| Error::FileInvalid("info file missing checksum".into()))?;
        let expected = sha1_hex(&text.as_bytes()[..checksum_line_start]);

        let mut doc = Self::new();
        let mut current: Option<String> = None;
        let mut actual: Option<String> = None;
        let mut format: Option<u64> = None;
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(section.to_owned());
                continue;
            }
            let section = current
                .as_deref()
                .ok_or_else(|| Error::FileInvalid(format!("key before any section: '{line}'")))?;
            let (key, raw) = line
                .split_once('=')
                .ok_or_else(|| Error::FileInvalid(format!("invalid line '{line}'")))?;
            let value: Value = serde_json::from_str(raw)
                .map_err(|_| Error::FileInvalid(format!("invalid value for '{key}'")))?;
            if section == INFO_SECTION {
                match key {
                    INFO_KEY_CHECKSUM => actual = value.as_str().map(str::to_owned),
                    INFO_KEY_FORMAT => format = value.as_u64(),
                    _ => {}
                }
            } else {
                doc.set(section, key, value);
            }
        }

        match actual {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Err(Error::Checksum(format!(
                    "info file checksum '{actual}' does not match expected '{expected}'"
                )))
            }
            None => return Err(Error::FileInvalid("info file missing checksum".into())),
        }
        if format != Some(INFO_FORMAT) {
            return Err(Error::FileInvalid(format!(
                "info file format {format:?} does not match expected {INFO_FORMAT}"
            )));
        }
        Ok(doc)
    }
}

// ----------------------------------------------------------------------------

fn cipher_filters(mode: CipherMode, pass: Option<&str>) -> Result<FilterGroup> {
    let mut filters = FilterGroup::new();
    if let Some(pass) = pass {
        filters = filters.add(Box::new(CipherFilter::new(mode, pass)?));
    }
    Ok(filters)
}

/// Write `doc` to `path` and then `path.copy`.
pub fn save(storage: &Storage, path: &str, doc: &IniDoc, cipher_pass: Option<&str>) -> Result<()> {
    let data = doc.to_bytes();
    storage.put(path, &data, cipher_filters(CipherMode::Encrypt, cipher_pass)?)?;
    storage.put(
        &format!("{path}{INFO_COPY_EXT}"),
        &data,
        cipher_filters(CipherMode::Encrypt, cipher_pass)?,
    )?;
    Ok(())
}

fn load_one(storage: &Storage, path: &str, cipher_pass: Option<&str>) -> Result<Option<IniDoc>> {
    match storage.get(path, true, cipher_filters(CipherMode::Decrypt, cipher_pass)?)? {
        None => Ok(None),
        Some(data) => IniDoc::from_bytes(&data).map(Some),
    }
}

/// Load an info file, falling back to its `.copy`.
///
/// A primary that is missing or corrupt is tolerated while the copy
/// loads (with a warning); both failing raises [`Error::FileMissing`]
/// when neither exists, or the primary's error otherwise. When
/// `ignore_missing`, a file where *neither* copy exists loads as `None`.
pub fn load(
    storage: &Storage,
    path: &str,
    cipher_pass: Option<&str>,
    ignore_missing: bool,
) -> Result<Option<IniDoc>> {
    let copy_path = format!("{path}{INFO_COPY_EXT}");
    let primary = load_one(storage, path, cipher_pass);
    match primary {
        Ok(Some(doc)) => Ok(Some(doc)),
        primary_result => {
            if let Ok(Some(doc)) = load_one(storage, &copy_path, cipher_pass) {
                if let Err(err) = &primary_result {
                    log::warn!("loaded '{path}' from copy: {err}");
                }
                return Ok(Some(doc));
            }
            match primary_result {
                Err(err) => Err(err),
                Ok(_) if ignore_missing => Ok(None),
                Ok(_) => Err(Error::FileMissing(format!(
                    "unable to load info file '{}' or '{}'",
                    storage.resolve(path)?.display(),
                    storage.resolve(&copy_path)?.display()
                ))),
            }
        }
    }
}

/// Generate a cipher sub-passphrase for next-level objects.
pub fn cipher_pass_gen() -> String {
    let mut key = [0u8; 24];
    rand::rng().fill_bytes(&mut key);
    hex::encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> IniDoc {
        let mut doc = IniDoc::new();
        doc.set("db", "db-id", Value::from(1));
        doc.set("db", "db-version", Value::from("16"));
        doc.set("db:history", "1", serde_json::json!({"db-id": 1, "db-version": "16"}));
        doc
    }

    #[test]
    fn serialize_parse_round_trip() {
        let doc = sample_doc();
        let parsed = IniDoc::from_bytes(&doc.to_bytes()).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn checksum_is_terminal_and_verified() {
        let doc = sample_doc();
        let mut data = doc.to_bytes();
        let text = String::from_utf8(data.clone()).unwrap();
        assert!(text.trim_end().lines().last().unwrap().starts_with("backrest-checksum="));

        // Corrupt one content byte.
        let at = text.find("16").unwrap();
        data[at] = b'7';
        assert!(matches!(IniDoc::from_bytes(&data), Err(Error::Checksum(_))));
    }

    #[test]
    fn dual_copy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        let doc = sample_doc();
        save(&storage, "archive.info", &doc, None).unwrap();
        assert!(storage.exists("archive.info").unwrap());
        assert!(storage.exists("archive.info.copy").unwrap());

        // The primary and the copy decode identically.
        let primary = load(&storage, "archive.info", None, false).unwrap().unwrap();
        storage.remove("archive.info", true).unwrap();
        let copy = load(&storage, "archive.info", None, false).unwrap().unwrap();
        assert_eq!(primary, copy);
    }

    #[test]
    fn corrupt_primary_falls_back_to_copy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        save(&storage, "backup.info", &sample_doc(), None).unwrap();
        storage.put("backup.info", b"garbage", FilterGroup::new()).unwrap();
        let doc = load(&storage, "backup.info", None, false).unwrap().unwrap();
        assert_eq!(doc, sample_doc());
    }

    #[test]
    fn both_missing_is_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        assert!(matches!(
            load(&storage, "backup.info", None, false),
            Err(Error::FileMissing(_))
        ));
        assert!(load(&storage, "backup.info", None, true).unwrap().is_none());
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::posix(dir.path());
        save(&storage, "archive.info", &sample_doc(), Some("repo-pass")).unwrap();

        let doc = load(&storage, "archive.info", Some("repo-pass"), false).unwrap().unwrap();
        assert_eq!(doc, sample_doc());

        // Wrong passphrase surfaces as an error, not garbage.
        assert!(load(&storage, "archive.info", Some("wrong"), false).is_err());
    }
}
