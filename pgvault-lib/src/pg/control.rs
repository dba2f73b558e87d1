//! Reading (and, for fixtures, writing) the cluster control file.
//!
//! Only the fields the engine consumes are decoded; the control and
//! catalog version pair identifies the release via
//! [`PgVersion::from_control`].

use byteorder::{ByteOrder, LittleEndian};

use super::version::PgVersion;
use super::wal::Lsn;
use super::PG_PATH_PGCONTROL;
use crate::error::{Error, Result};
use crate::filter::FilterGroup;
use crate::storage::Storage;

/// Control file length; content past the decoded header is padding.
const PG_CONTROL_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgControl {
    pub version: PgVersion,
    pub system_id: u64,
    pub control_version: u32,
    pub catalog_version: u32,
    pub checkpoint: Lsn,
    pub timeline: u32,
    pub page_checksum_version: u32,
    pub wal_segment_size: u32,
    pub page_size: u32,
}

impl PgControl {
    /// Read and decode `global/pg_control` from the data directory.
    pub fn read(pg_storage: &Storage) -> Result<Self> {
        let data = pg_storage
            .get(PG_PATH_PGCONTROL, false, FilterGroup::new())?
            .expect("missing file errors");
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 40 {
            return Err(Error::Format(format!(
                "control file is too small ({} bytes)",
                data.len()
            )));
        }
        let system_id = LittleEndian::read_u64(&data[0..8]);
        let control_version = LittleEndian::read_u32(&data[8..12]);
        let catalog_version = LittleEndian::read_u32(&data[12..16]);
        let version = PgVersion::from_control(control_version, catalog_version)?;
        Ok(Self {
            version,
            system_id,
            control_version,
            catalog_version,
            checkpoint: Lsn(LittleEndian::read_u64(&data[16..24])),
            timeline: LittleEndian::read_u32(&data[24..28]),
            page_checksum_version: LittleEndian::read_u32(&data[28..32]),
            wal_segment_size: LittleEndian::read_u32(&data[32..36]),
            page_size: LittleEndian::read_u32(&data[36..40]),
        })
    }

    /// Encode a control file; the counterpart of [`PgControl::from_bytes`]
    /// for fixtures and tests.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; PG_CONTROL_SIZE];
        LittleEndian::write_u64(&mut data[0..8], self.system_id);
        LittleEndian::write_u32(&mut data[8..12], self.control_version);
        LittleEndian::write_u32(&mut data[12..16], self.catalog_version);
        LittleEndian::write_u64(&mut data[16..24], self.checkpoint.0);
        LittleEndian::write_u32(&mut data[24..28], self.timeline);
        LittleEndian::write_u32(&mut data[28..32], self.page_checksum_version);
        LittleEndian::write_u32(&mut data[32..36], self.wal_segment_size);
        LittleEndian::write_u32(&mut data[36..40], self.page_size);
        data
    }

    /// A control file for a given release with typical defaults; fixture
    /// helper used throughout the tests.
    pub fn for_version(version: PgVersion, system_id: u64) -> Self {
        Self {
            version,
            system_id,
            control_version: version.control_version(),
            catalog_version: version.catalog_version(),
            checkpoint: Lsn(0x2_0000_0000),
            timeline: 1,
            page_checksum_version: 1,
            wal_segment_size: 16 * 1024 * 1024,
            page_size: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::version::PG_VERSION_16;

    #[test]
    fn control_round_trip() {
        let control = PgControl::for_version(PG_VERSION_16, 0x5D94_39A6_85A8_1C5F);
        let decoded = PgControl::from_bytes(&control.to_bytes()).unwrap();
        assert_eq!(decoded, control);
    }

    #[test]
    fn unknown_control_version_is_rejected() {
        let mut control = PgControl::for_version(PG_VERSION_16, 1);
        control.control_version = 12345;
        assert!(matches!(
            PgControl::from_bytes(&control.to_bytes()),
            Err(Error::FeatureNotSupported(_))
        ));
    }

    #[test]
    fn short_file_is_rejected() {
        assert!(matches!(PgControl::from_bytes(&[0u8; 10]), Err(Error::Format(_))));
    }
}
