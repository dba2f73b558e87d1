//! The PostgreSQL interface: `pg_control`, WAL naming, and the fixed
//! control-plane query set.

pub mod client;
pub mod control;
pub mod version;
pub mod wal;

pub use client::{BackupStarted, BackupStopped, DbClient, DbDatabase, PgPostgresClient};
pub use control::PgControl;
pub use version::PgVersion;
pub use wal::{Lsn, WalHeader, WalSegment};

/// Relative path of the control file within the data directory.
pub const PG_PATH_PGCONTROL: &str = "global/pg_control";

/// The data directory target name every manifest carries.
pub const MANIFEST_TARGET_PGDATA: &str = "pg_data";

/// Marker file left by a running postmaster.
pub const PG_FILE_POSTMTRPID: &str = "postmaster.pid";
