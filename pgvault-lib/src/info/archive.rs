//! `archive.info`: the WAL cipher sub-passphrase and the cluster version
//! history for the archive side of the repository.

use serde_json::json;

use super::pg::{PgHistory, PgVersionRecord};
use super::IniDoc;
use crate::error::{Error, Result};
use crate::pg::{PgControl, PgVersion};
use crate::storage::Storage;

pub const INFO_ARCHIVE_FILE: &str = "archive.info";
/// Path expression form used with repository storage.
pub const INFO_ARCHIVE_PATH: &str = "<REPO:ARCHIVE>/archive.info";

const SECTION_CIPHER: &str = "cipher";
const KEY_CIPHER_PASS: &str = "cipher-pass";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoArchive {
    pub history: PgHistory,
    /// Sub-passphrase for WAL segments when the repo is encrypted.
    pub cipher_pass: Option<String>,
}

impl InfoArchive {
    /// A fresh info file for a cluster, generating a WAL sub-passphrase
    /// when the repository is encrypted.
    pub fn create(control: &PgControl, encrypted: bool) -> Self {
        Self {
            history: PgHistory::new(PgVersionRecord::from_control(1, control)),
            cipher_pass: encrypted.then(super::cipher_pass_gen),
        }
    }

    pub fn load(storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<Self> {
        let doc = super::load(storage, INFO_ARCHIVE_PATH, repo_cipher_pass, false)?
            .expect("errors when missing");
        Self::from_ini(&doc)
    }

    pub fn load_opt(storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<Option<Self>> {
        match super::load(storage, INFO_ARCHIVE_PATH, repo_cipher_pass, true)? {
            Some(doc) => Self::from_ini(&doc).map(Some),
            None => Ok(None),
        }
    }

    pub fn save(&self, storage: &Storage, repo_cipher_pass: Option<&str>) -> Result<()> {
        super::save(storage, INFO_ARCHIVE_PATH, &self.to_ini(), repo_cipher_pass)
    }

    pub fn from_ini(doc: &IniDoc) -> Result<Self> {
        Ok(Self {
            history: PgHistory::from_ini(doc)?,
            cipher_pass: doc
                .get(SECTION_CIPHER, KEY_CIPHER_PASS)
                .and_then(|value| value.as_str())
                .map(str::to_owned),
        })
    }

    pub fn to_ini(&self) -> IniDoc {
        let mut doc = IniDoc::new();
        self.history.to_ini(&mut doc);
        if let Some(pass) = &self.cipher_pass {
            doc.set(SECTION_CIPHER, KEY_CIPHER_PASS, json!(pass));
        }
        doc
    }

    /// The current archive id, e.g. `16-1`.
    pub fn archive_id(&self) -> String {
        self.history.current().archive_id()
    }

    /// Resolve the archive id for a cluster `{version, system_id}`; used
    /// by archive-get to find WAL across incarnations.
    pub fn archive_id_for(&self, version: PgVersion, system_id: u64) -> Result<String> {
        self.history
            .find(version, system_id)
            .map(PgVersionRecord::archive_id)
            .ok_or_else(|| {
                Error::ArchiveMismatch(format!(
                    "unable to retrieve the archive id for database version '{version}' and \
                     system-id '{system_id}'"
                ))
            })
    }

    pub fn check_pg(&self, version: PgVersion, system_id: u64) -> Result<()> {
        self.history.check_pg(version, system_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::version::PG_VERSION_16;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::repo(dir.path(), "main");
        let control = PgControl::for_version(PG_VERSION_16, 42);
        let info = InfoArchive::create(&control, true);
        assert!(info.cipher_pass.is_some());
        info.save(&storage, None).unwrap();

        let loaded = InfoArchive::load(&storage, None).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.archive_id(), "16-1");
        assert_eq!(loaded.archive_id_for(PG_VERSION_16, 42).unwrap(), "16-1");
        assert!(loaded.archive_id_for(PG_VERSION_16, 43).is_err());
    }
}
