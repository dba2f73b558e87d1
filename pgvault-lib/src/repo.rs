//! A configured repository: storage rooted at the repo path plus the
//! repo-level cipher passphrase.
//!
//! Multiple repositories may be configured; `index` carries the
//! user-facing repo number for logging.

use std::path::PathBuf;

use crate::error::Result;
use crate::info::{InfoArchive, InfoBackup};
use crate::storage::Storage;

#[derive(Clone)]
pub struct Repo {
    pub index: usize,
    pub storage: Storage,
    /// Repository passphrase; unlocks the info files, whose sub-passes
    /// unlock WAL and backup data.
    pub cipher_pass: Option<String>,
}

impl Repo {
    pub fn new(index: usize, path: impl Into<PathBuf>, stanza: &str, cipher_pass: Option<String>) -> Self {
        Self { index, storage: Storage::repo(path, stanza), cipher_pass }
    }

    pub fn cipher_pass(&self) -> Option<&str> {
        self.cipher_pass.as_deref()
    }

    pub fn load_archive_info(&self) -> Result<InfoArchive> {
        InfoArchive::load(&self.storage, self.cipher_pass())
    }

    pub fn load_backup_info(&self) -> Result<InfoBackup> {
        InfoBackup::load(&self.storage, self.cipher_pass())
    }
}

impl std::fmt::Debug for Repo {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Repo")
            .field("index", &self.index)
            .field("base", &self.storage.base())
            .field("encrypted", &self.cipher_pass.is_some())
            .finish()
    }
}
