//! Prelude for `pgvault`.

pub use crate::{
    archive::{self, ArchiveConfig},
    backup::{self, BackupConfig},
    error::{Error, Result},
    expire::{self, ExpireConfig},
    info::{self, InfoArchive, InfoBackup},
    lock, manifest,
    manifest::Manifest,
    pg::{self, PgControl, PgVersion},
    repo::Repo,
    restore::{self, RestoreConfig},
    stanza::{self, StanzaConfig},
    storage::{self, Storage},
    verify::{self, VerifyConfig},
};

// Traits.
pub use crate::pg::DbClient;
pub use crate::storage::StorageDriver;
