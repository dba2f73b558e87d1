//! The closed set of error kinds used across the engine.
//!
//! Every error carries a formatted message; the kind determines the process
//! exit code. Worker threads and status files serialize errors as
//! `(code, message)` pairs, so the code assignment here is part of the
//! on-disk and on-wire format and must stay stable.

use miette::Diagnostic;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("{0}")]
    Assert(String),
    #[error("{0}")]
    Format(String),
    #[error("{0}")]
    FileMissing(String),
    #[error("{0}")]
    FileOpen(String),
    #[error("{0}")]
    FileRead(String),
    #[error("{0}")]
    FileWrite(String),
    #[error("{0}")]
    FileInvalid(String),
    #[error("{0}")]
    FileOwner(String),
    #[error("{0}")]
    PathMissing(String),
    #[error("{0}")]
    PathOpen(String),
    #[error("{0}")]
    PathNotEmpty(String),
    #[error("{0}")]
    Crypto(String),
    #[error("{0}")]
    Checksum(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    OptionInvalid(String),
    #[error("{0}")]
    OptionInvalidValue(String),
    #[error("{0}")]
    ParamRequired(String),
    #[error("{0}")]
    ParamInvalid(String),
    #[error("{0}")]
    #[diagnostic(help("is another pgvault process running for this stanza?"))]
    LockAcquire(String),
    #[error("{0}")]
    ArchiveMismatch(String),
    #[error("{0}")]
    #[diagnostic(help("has archive_command been configured in postgresql.conf?"))]
    ArchiveTimeout(String),
    #[error("{0}")]
    #[diagnostic(help("has archive_mode been enabled in postgresql.conf?"))]
    ArchiveDisabled(String),
    #[error("{0}")]
    #[diagnostic(help("run the info command to list backup sets"))]
    BackupSetInvalid(String),
    #[error("{0}")]
    BackupMismatch(String),
    #[error("{0}")]
    DbMismatch(String),
    #[error("{0}")]
    DbQuery(String),
    #[error("{0}")]
    #[diagnostic(help("is the PostgreSQL cluster running and accepting connections?"))]
    DbConnect(String),
    #[error("{0}")]
    PgRunning(String),
    #[error("{0}")]
    #[diagnostic(help("stop the cluster before restoring, or use --delta with --force"))]
    PostmasterRunning(String),
    #[error("{0}")]
    HostInvalid(String),
    #[error("{0}")]
    RepoInvalid(String),
    #[error("{0}")]
    TablespaceMap(String),
    #[error("{0}")]
    LinkMap(String),
    #[error("{0}")]
    FeatureNotSupported(String),
    #[error("{0}")]
    Protocol(String),
    #[error("{0}")]
    Runtime(String),
    #[error("{0}")]
    #[diagnostic(help("run the start command to resume operations"))]
    Stop(String),
    #[error("{0}")]
    Term(String),
    #[error("{0}")]
    Timeout(String),
}

/// Kind name, exit code, and constructor for each variant, in code order.
macro_rules! error_kinds {
    ($(($variant:ident, $name:literal, $code:literal)),+ $(,)?) => {
        impl Error {
            /// The stable kind name, e.g. `FileMissingError`.
            pub fn name(&self) -> &'static str {
                match self {
                    $(Error::$variant(_) => $name,)+
                }
            }

            /// The stable process exit / wire code for this kind.
            pub fn code(&self) -> i32 {
                match self {
                    $(Error::$variant(_) => $code,)+
                }
            }

            /// Reconstruct an error from a serialized `(code, message)`
            /// pair. Unknown codes decode as [`Error::Runtime`] with the
            /// code preserved in the message.
            pub fn from_code(code: i32, message: impl Into<String>) -> Error {
                let message = message.into();
                match code {
                    $($code => Error::$variant(message),)+
                    _ => Error::Runtime(format!("[{code}] {message}")),
                }
            }
        }
    };
}

error_kinds![
    (Assert, "AssertError", 25),
    (Format, "FormatError", 26),
    (FileMissing, "FileMissingError", 27),
    (FileOpen, "FileOpenError", 28),
    (FileRead, "FileReadError", 29),
    (FileWrite, "FileWriteError", 30),
    (FileInvalid, "FileInvalidError", 31),
    (FileOwner, "FileOwnerError", 32),
    (PathMissing, "PathMissingError", 33),
    (PathOpen, "PathOpenError", 34),
    (PathNotEmpty, "PathNotEmptyError", 35),
    (Crypto, "CryptoError", 36),
    (Checksum, "ChecksumError", 37),
    (Config, "ConfigError", 38),
    (OptionInvalid, "OptionInvalidError", 39),
    (OptionInvalidValue, "OptionInvalidValueError", 40),
    (ParamRequired, "ParamRequiredError", 41),
    (ParamInvalid, "ParamInvalidError", 42),
    (LockAcquire, "LockAcquireError", 43),
    (ArchiveMismatch, "ArchiveMismatchError", 44),
    (ArchiveTimeout, "ArchiveTimeoutError", 45),
    (ArchiveDisabled, "ArchiveDisabledError", 46),
    (BackupSetInvalid, "BackupSetInvalidError", 47),
    (BackupMismatch, "BackupMismatchError", 48),
    (DbMismatch, "DbMismatchError", 49),
    (DbQuery, "DbQueryError", 50),
    (DbConnect, "DbConnectError", 51),
    (PgRunning, "PgRunningError", 52),
    (PostmasterRunning, "PostmasterRunningError", 53),
    (HostInvalid, "HostInvalidError", 54),
    (RepoInvalid, "RepoInvalidError", 55),
    (TablespaceMap, "TablespaceMapError", 56),
    (LinkMap, "LinkMapError", 57),
    (FeatureNotSupported, "FeatureNotSupportedError", 58),
    (Protocol, "ProtocolError", 59),
    (Runtime, "RuntimeError", 60),
    (Stop, "StopError", 61),
    (Term, "TermError", 62),
    (Timeout, "TimeoutError", 63),
];

impl Error {
    /// Wrap this error's message with additional context, keeping the kind.
    ///
    /// Used by the parallel dispatcher to prefix worker errors with
    /// `could not <verb> <key>`.
    pub fn context(self, context: &str) -> Error {
        let message = format!("{context}: [{}] {}", self.code(), self);
        Error::from_code(self.code(), message)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(error: openssl::error::ErrorStack) -> Error {
        Error::Crypto(format!("OpenSSL error: {error}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Error {
        Error::Format(format!("invalid JSON: {error}"))
    }
}

impl From<postgres::Error> for Error {
    fn from(error: postgres::Error) -> Error {
        Error::DbQuery(format!("database error: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn codes_round_trip_through_from_code() {
        let original = Error::Assert("BOGUS".into());
        let decoded = Error::from_code(original.code(), original.to_string());
        assert_eq!(decoded.code(), 25);
        assert_eq!(decoded.name(), "AssertError");
        assert_eq!(decoded.to_string(), "BOGUS");
    }

    #[test]
    fn unknown_code_decodes_as_runtime() {
        let decoded = Error::from_code(99, "whoops");
        assert_eq!(decoded.name(), "RuntimeError");
        assert!(decoded.to_string().contains("[99]"));
    }

    #[test]
    fn context_keeps_the_kind() {
        let err = Error::Checksum("digest mismatch".into());
        let err = err.context("could not verify file 'a/b'");
        assert_eq!(err.name(), "ChecksumError");
        assert_eq!(
            err.to_string(),
            "could not verify file 'a/b': [37] digest mismatch"
        );
    }
}
