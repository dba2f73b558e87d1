//! PostgreSQL version numbers and the control/catalog version table.
//!
//! Versions are held as `major * 10 + minor` for the 9.x series and
//! `major * 10` from 10 on, so `96` is 9.6 and `160` is 16. This keeps
//! comparisons plain integer comparisons.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PgVersion(pub u32);

pub const PG_VERSION_90: PgVersion = PgVersion(90);
pub const PG_VERSION_92: PgVersion = PgVersion(92);
pub const PG_VERSION_94: PgVersion = PgVersion(94);
pub const PG_VERSION_95: PgVersion = PgVersion(95);
pub const PG_VERSION_96: PgVersion = PgVersion(96);
pub const PG_VERSION_10: PgVersion = PgVersion(100);
pub const PG_VERSION_11: PgVersion = PgVersion(110);
pub const PG_VERSION_12: PgVersion = PgVersion(120);
pub const PG_VERSION_13: PgVersion = PgVersion(130);
pub const PG_VERSION_14: PgVersion = PgVersion(140);
pub const PG_VERSION_15: PgVersion = PgVersion(150);
pub const PG_VERSION_16: PgVersion = PgVersion(160);

/// Oldest and newest versions the engine will work with.
pub const PG_VERSION_MIN: PgVersion = PG_VERSION_90;
pub const PG_VERSION_MAX: PgVersion = PG_VERSION_16;

/// Objects with an oid below this belong to the system catalogs and are
/// always restored, regardless of `--db-include`.
pub const PG_USER_OBJECT_MIN_ID: u32 = 16384;

/// `(version, control_version, catalog_version)` for every supported
/// release. The pairs identify the release when reading `pg_control`.
pub const VERSION_TABLE: &[(PgVersion, u32, u32)] = &[
    (PG_VERSION_90, 903, 201008051),
    (PgVersion(91), 903, 201105231),
    (PG_VERSION_92, 922, 201204301),
    (PgVersion(93), 937, 201306121),
    (PG_VERSION_94, 942, 201409291),
    (PG_VERSION_95, 942, 201510051),
    (PG_VERSION_96, 960, 201608131),
    (PG_VERSION_10, 1002, 201707211),
    (PG_VERSION_11, 1100, 201809051),
    (PG_VERSION_12, 1201, 201909212),
    (PG_VERSION_13, 1300, 202007201),
    (PG_VERSION_14, 1300, 202107181),
    (PG_VERSION_15, 1300, 202209061),
    (PG_VERSION_16, 1300, 202307071),
];

impl PgVersion {
    /// Identify a release from the versions stored in `pg_control`.
    pub fn from_control(control_version: u32, catalog_version: u32) -> Result<PgVersion> {
        VERSION_TABLE
            .iter()
            .find(|(_, control, catalog)| *control == control_version && *catalog == catalog_version)
            .map(|(version, _, _)| *version)
            .ok_or_else(|| {
                Error::FeatureNotSupported(format!(
                    "unexpected control version = {control_version}, catalog version = \
                     {catalog_version}\nHINT: is this version of PostgreSQL supported?"
                ))
            })
    }

    pub fn control_version(&self) -> u32 {
        VERSION_TABLE
            .iter()
            .find(|(version, _, _)| version == self)
            .map(|(_, control, _)| *control)
            .unwrap_or(0)
    }

    pub fn catalog_version(&self) -> u32 {
        VERSION_TABLE
            .iter()
            .find(|(version, _, _)| version == self)
            .map(|(_, _, catalog)| *catalog)
            .unwrap_or(0)
    }

    /// Tablespace version directory, e.g. `PG_16_202307071`.
    pub fn tablespace_id(&self) -> String {
        format!("PG_{}_{}", self, self.catalog_version())
    }
}

impl fmt::Display for PgVersion {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.0 < 100 {
            write!(fmt, "{}.{}", self.0 / 10, self.0 % 10)
        } else {
            write!(fmt, "{}", self.0 / 10)
        }
    }
}

impl FromStr for PgVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let version = match s.split_once('.') {
            Some((major, minor)) => {
                let major: u32 = major.parse().map_err(|_| invalid(s))?;
                let minor: u32 = minor.parse().map_err(|_| invalid(s))?;
                if minor > 9 {
                    return Err(invalid(s));
                }
                major * 10 + minor
            }
            None => s.parse::<u32>().map_err(|_| invalid(s))? * 10,
        };
        Ok(PgVersion(version))
    }
}

fn invalid(s: &str) -> Error {
    Error::Format(format!("'{s}' is not a valid PostgreSQL version"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        assert_eq!(PG_VERSION_96.to_string(), "9.6");
        assert_eq!(PG_VERSION_16.to_string(), "16");
        assert_eq!("9.6".parse::<PgVersion>().unwrap(), PG_VERSION_96);
        assert_eq!("16".parse::<PgVersion>().unwrap(), PG_VERSION_16);
        assert!("banana".parse::<PgVersion>().is_err());
    }

    #[test]
    fn version_from_control_pair() {
        assert_eq!(PgVersion::from_control(1300, 202307071).unwrap(), PG_VERSION_16);
        assert_eq!(PgVersion::from_control(960, 201608131).unwrap(), PG_VERSION_96);
        assert!(PgVersion::from_control(9999, 1).is_err());
    }

    #[test]
    fn versions_order_naturally() {
        assert!(PG_VERSION_92 < PG_VERSION_96);
        assert!(PG_VERSION_96 < PG_VERSION_10);
        assert!(PG_VERSION_10 < PG_VERSION_16);
    }
}
