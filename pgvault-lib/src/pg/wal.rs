//! WAL naming arithmetic: LSNs, the 24-hex segment names, successor
//! rules, and timeline history files.

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use lazy_static::lazy_static;
use regex::Regex;

use super::version::{PgVersion, PG_VERSION_92};
use crate::error::{Error, Result};

/// A WAL location, displayed PostgreSQL-style as `X/X`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| Error::Format(format!("'{s}' is not a valid LSN")))?;
        let high = u64::from_str_radix(high, 16)
            .map_err(|_| Error::Format(format!("'{s}' is not a valid LSN")))?;
        let low = u64::from_str_radix(low, 16)
            .map_err(|_| Error::Format(format!("'{s}' is not a valid LSN")))?;
        if high > u64::from(u32::MAX) || low > u64::from(u32::MAX) {
            return Err(Error::Format(format!("'{s}' is not a valid LSN")));
        }
        Ok(Lsn(high << 32 | low))
    }
}

// ----------------------------------------------------------------------------

lazy_static! {
    /// A bare 24-hex-character segment name.
    pub static ref WAL_SEGMENT_NAME_RE: Regex =
        Regex::new("^[0-9A-F]{24}$").expect("valid regex");
    /// A segment file in the repository: name, SHA-1 suffix, optional
    /// compression extension.
    pub static ref WAL_SEGMENT_FILE_RE: Regex =
        Regex::new("^[0-9A-F]{24}-[0-9a-f]{40}(\\.gz|\\.zst)?$").expect("valid regex");
    /// A timeline history file, e.g. `00000002.history`.
    pub static ref WAL_TIMELINE_HISTORY_RE: Regex =
        Regex::new("^[0-9A-F]{8}\\.history$").expect("valid regex");
}

/// One WAL segment: timeline plus absolute segment number.
///
/// The 24-character name is `TTTTTTTTLLLLLLLLSSSSSSSS`: timeline, then the
/// segment number split at the 4 GiB boundary, so the mapping between the
/// name and the number depends on the cluster's WAL segment size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WalSegment {
    pub timeline: u32,
    pub segno: u64,
}

fn segments_per_id(wal_segment_size: u32) -> u64 {
    0x1_0000_0000 / u64::from(wal_segment_size)
}

impl WalSegment {
    pub fn parse(name: &str, wal_segment_size: u32) -> Result<Self> {
        if !WAL_SEGMENT_NAME_RE.is_match(name) {
            return Err(Error::Format(format!("'{name}' is not a valid WAL segment name")));
        }
        let timeline = u32::from_str_radix(&name[0..8], 16).expect("8 hex chars");
        let major = u64::from_str_radix(&name[8..16], 16).expect("8 hex chars");
        let minor = u64::from_str_radix(&name[16..24], 16).expect("8 hex chars");
        let per_id = segments_per_id(wal_segment_size);
        if minor >= per_id {
            return Err(Error::Format(format!(
                "WAL segment '{name}' is out of range for a segment size of {wal_segment_size}"
            )));
        }
        Ok(Self { timeline, segno: major * per_id + minor })
    }

    pub fn name(&self, wal_segment_size: u32) -> String {
        let per_id = segments_per_id(wal_segment_size);
        format!(
            "{:08X}{:08X}{:08X}",
            self.timeline,
            self.segno / per_id,
            self.segno % per_id
        )
    }

    /// The segment containing `lsn`.
    pub fn from_lsn(lsn: Lsn, timeline: u32, wal_segment_size: u32) -> Self {
        Self { timeline, segno: lsn.0 / u64::from(wal_segment_size) }
    }

    /// The next segment the cluster will produce. Clusters at or before
    /// 9.2 never produce a segment name ending in `FF` (for the historical
    /// 16 MiB segment size), so that name is skipped.
    pub fn next(&self, version: PgVersion, wal_segment_size: u32) -> Self {
        let per_id = segments_per_id(wal_segment_size);
        let mut segno = self.segno + 1;
        if version <= PG_VERSION_92 && segno % per_id == per_id - 1 {
            segno += 1;
        }
        Self { timeline: self.timeline, segno }
    }

    /// Distance in segments from `self` to `other` (same timeline).
    pub fn distance(&self, other: &WalSegment) -> i64 {
        other.segno as i64 - self.segno as i64
    }
}

/// The repository directory a segment file lives under: the first 16
/// characters of its name.
pub fn wal_dir_name(segment_name: &str) -> &str {
    &segment_name[..16]
}

/// The 24-character prefix of a repository segment file name.
pub fn wal_segment_prefix(file_name: &str) -> &str {
    &file_name[..24.min(file_name.len())]
}

// ----------------------------------------------------------------------------

/// Decoded WAL page header, used to confirm a segment belongs to the
/// cluster being archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    pub version: PgVersion,
    pub system_id: u64,
}

/// `(version, wal page magic)` for every supported release.
const WAL_MAGIC_TABLE: &[(PgVersion, u16)] = &[
    (PgVersion(90), 0xD064),
    (PgVersion(91), 0xD066),
    (PgVersion(92), 0xD071),
    (PgVersion(93), 0xD075),
    (PgVersion(94), 0xD07E),
    (PgVersion(95), 0xD087),
    (PgVersion(96), 0xD093),
    (PgVersion(100), 0xD097),
    (PgVersion(110), 0xD098),
    (PgVersion(120), 0xD101),
    (PgVersion(130), 0xD106),
    (PgVersion(140), 0xD10D),
    (PgVersion(150), 0xD110),
    (PgVersion(160), 0xD113),
];

impl WalHeader {
    /// Decode the long page header at the start of a segment.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::Format("WAL segment header is too small".into()));
        }
        let magic = LittleEndian::read_u16(&data[0..2]);
        let version = WAL_MAGIC_TABLE
            .iter()
            .find(|(_, m)| *m == magic)
            .map(|(version, _)| *version)
            .ok_or_else(|| {
                Error::FeatureNotSupported(format!(
                    "unexpected WAL magic {magic:#06X}\nHINT: is this version of PostgreSQL \
                     supported?"
                ))
            })?;
        // The system id lives in the long-header extension.
        let system_id = LittleEndian::read_u64(&data[24..32]);
        Ok(Self { version, system_id })
    }

    /// Encode a long page header; the counterpart of
    /// [`WalHeader::from_bytes`] for fixtures and stanza checks.
    pub fn to_bytes(&self, wal_segment_size: u32) -> Vec<u8> {
        let magic = WAL_MAGIC_TABLE
            .iter()
            .find(|(version, _)| *version == self.version)
            .map(|(_, magic)| *magic)
            .expect("supported version");
        let mut data = vec![0u8; 40];
        LittleEndian::write_u16(&mut data[0..2], magic);
        LittleEndian::write_u16(&mut data[2..4], 0x0002); // long header flag
        LittleEndian::write_u64(&mut data[24..32], self.system_id);
        LittleEndian::write_u32(&mut data[32..36], wal_segment_size);
        data
    }
}

// ----------------------------------------------------------------------------

/// One line of a timeline history file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryItem {
    pub timeline: u32,
    /// End of this parent timeline (the switch point).
    pub lsn: Lsn,
}

/// Parse `<TLI>.history` content: `parentTLI  switchLSN  reason` lines,
/// comments and blanks ignored.
pub fn timeline_history_parse(content: &str) -> Result<Vec<TimelineHistoryItem>> {
    let mut items = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let timeline: u32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| Error::Format(format!("invalid timeline history line '{line}'")))?;
        let lsn: Lsn = fields
            .next()
            .ok_or_else(|| Error::Format(format!("invalid timeline history line '{line}'")))?
            .parse()?;
        items.push(TimelineHistoryItem { timeline, lsn });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pg::version::{PG_VERSION_16, PG_VERSION_92, PG_VERSION_96};

    const SEG_16MB: u32 = 16 * 1024 * 1024;

    #[test]
    fn lsn_display_and_parse() {
        let lsn: Lsn = "1/1000000".parse().unwrap();
        assert_eq!(lsn.0, 0x1_0100_0000);
        assert_eq!(lsn.to_string(), "1/1000000");
        assert!("nope".parse::<Lsn>().is_err());
        assert!("1/123456789".parse::<Lsn>().is_err());
    }

    #[test]
    fn segment_name_round_trip() {
        let segment = WalSegment::parse("000000010000000200000003", SEG_16MB).unwrap();
        assert_eq!(segment.timeline, 1);
        assert_eq!(segment.segno, 2 * 256 + 3);
        assert_eq!(segment.name(SEG_16MB), "000000010000000200000003");
    }

    #[test]
    fn successor_crosses_the_log_boundary() {
        let segment = WalSegment::parse("0000000100000001000000FF", SEG_16MB).unwrap();
        let next = segment.next(PG_VERSION_96, SEG_16MB);
        assert_eq!(next.name(SEG_16MB), "000000010000000200000000");
    }

    #[test]
    fn successor_skips_ff_before_93() {
        let segment = WalSegment::parse("0000000100000001000000FD", SEG_16MB).unwrap();
        let next = segment.next(PG_VERSION_92, SEG_16MB);
        assert_eq!(next.name(SEG_16MB), "0000000100000001000000FE");
        let next = next.next(PG_VERSION_92, SEG_16MB);
        assert_eq!(next.name(SEG_16MB), "000000010000000200000000");
    }

    #[test]
    fn segment_from_lsn() {
        let lsn: Lsn = "1/1000000".parse().unwrap();
        let segment = WalSegment::from_lsn(lsn, 1, SEG_16MB);
        assert_eq!(segment.name(SEG_16MB), "000000010000000100000001");
    }

    #[test]
    fn larger_segment_sizes_shrink_the_minor_range() {
        // 64 MiB segments: 64 per 4 GiB id.
        let seg = 64 * 1024 * 1024;
        let segment = WalSegment::parse("00000001000000010000003F", seg).unwrap();
        let next = segment.next(PG_VERSION_16, seg);
        assert_eq!(next.name(seg), "000000010000000200000000");
        assert!(WalSegment::parse("000000010000000100000040", seg).is_err());
    }

    #[test]
    fn wal_header_round_trip() {
        let header = WalHeader { version: PG_VERSION_16, system_id: 0x1234_5678_9ABC_DEF0 };
        let decoded = WalHeader::from_bytes(&header.to_bytes(SEG_16MB)).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn timeline_history_parses() {
        let content = "# comment\n1\t0/3000000\tbefore 2000-01-01\n\n2 0/4000000 reason\n";
        let items = timeline_history_parse(content).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].timeline, 1);
        assert_eq!(items[0].lsn.to_string(), "0/3000000");
        assert_eq!(items[1].timeline, 2);
    }

    #[test]
    fn repository_file_names_match() {
        assert!(WAL_SEGMENT_FILE_RE
            .is_match("000000010000000100000001-2b05e311c23e7b39b49a69e1dd393f62cb8380e5"));
        assert!(WAL_SEGMENT_FILE_RE
            .is_match("000000010000000100000001-2b05e311c23e7b39b49a69e1dd393f62cb8380e5.gz"));
        assert!(!WAL_SEGMENT_FILE_RE.is_match("000000010000000100000001"));
        assert!(WAL_TIMELINE_HISTORY_RE.is_match("00000002.history"));
        assert_eq!(wal_dir_name("000000010000000100000001"), "0000000100000001");
    }
}
