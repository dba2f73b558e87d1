//! Data-page checksum sink.
//!
//! Verifies PostgreSQL page checksums as relation segment files stream
//! through a backup copy. Pages whose LSN is at or past the backup start
//! LSN are skipped (they may legitimately be torn; WAL replay repairs
//! them), as are new pages (`pd_upper == 0`). A misaligned trailing
//! fragment of at least 512 bytes is treated as a partial write of the
//! final page; anything shorter marks the whole segment invalid.

use serde_json::{json, Value};

use super::{Filter, FilterIo};
use crate::error::{Error, Result};

pub const PG_PAGE_SIZE: usize = 8192;

#[derive(Debug)]
pub struct PageChecksumFilter {
    page_no_offset: u32,
    lsn_limit: u64,
    valid: bool,
    align: bool,
    /// `(page, lsn)` for every failed page, in stream order.
    error: Vec<(u32, u64)>,
    /// Partial page carried between process calls.
    pending: Vec<u8>,
}

impl PageChecksumFilter {
    /// `segment_no` is the relation segment ordinal (`.1`, `.2`, …) so
    /// that block numbers are relative to the whole relation.
    pub fn new(segment_no: u32, segment_page_total: u32, lsn_limit: u64) -> Self {
        Self {
            page_no_offset: segment_no * segment_page_total,
            lsn_limit,
            valid: true,
            align: true,
            error: Vec::new(),
            pending: Vec::new(),
        }
    }

    fn verify_page(&mut self, page: &[u8], block_no: u32, partial: bool) {
        let pd_lsn = u64::from(u32::from_le_bytes(page[0..4].try_into().expect("4 bytes"))) << 32
            | u64::from(u32::from_le_bytes(page[4..8].try_into().expect("4 bytes")));
        let pd_checksum = u16::from_le_bytes(page[8..10].try_into().expect("2 bytes"));
        let pd_upper = u16::from_le_bytes(page[14..16].try_into().expect("2 bytes"));

        // New page: nothing to verify.
        if pd_upper == 0 {
            return;
        }
        // The page may be torn; WAL replay will reconstruct it.
        if pd_lsn >= self.lsn_limit {
            return;
        }
        // A partial final page cannot be checksummed.
        if partial {
            self.error.push((block_no, pd_lsn));
            return;
        }
        if pd_checksum != page_checksum(page, block_no) {
            self.error.push((block_no, pd_lsn));
        }
    }

    fn process_data(&mut self, data: &[u8]) -> Result<()> {
        if !self.valid {
            return Ok(());
        }

        let mut buffer;
        let data = if self.pending.is_empty() {
            data
        } else {
            buffer = std::mem::take(&mut self.pending);
            buffer.extend_from_slice(data);
            &buffer[..]
        };

        let page_total = data.len() / PG_PAGE_SIZE;
        let remainder = data.len() % PG_PAGE_SIZE;

        for page_idx in 0..page_total {
            let page = &data[page_idx * PG_PAGE_SIZE..(page_idx + 1) * PG_PAGE_SIZE];
            let block_no = self.page_no_offset + page_idx as u32;
            self.verify_page(page, block_no, false);
        }
        self.page_no_offset += page_total as u32;

        if remainder != 0 {
            self.pending = data[data.len() - remainder..].to_vec();
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.pending.is_empty() || !self.valid {
            return Ok(());
        }
        // Misaligned data can only appear once, at the end of the file.
        if !self.align {
            return Err(Error::Assert(
                "should not be possible to see two misaligned pages in a row".into(),
            ));
        }
        self.align = false;
        let pending = std::mem::take(&mut self.pending);
        if pending.len() >= 512 {
            // Enough of the page survived to read its header; treat it as
            // a partial write of the final page.
            let mut page = pending;
            page.resize(PG_PAGE_SIZE, 0);
            let block_no = self.page_no_offset;
            self.verify_page(&page, block_no, true);
            self.page_no_offset += 1;
        } else {
            self.valid = false;
        }
        Ok(())
    }
}

impl Filter for PageChecksumFilter {
    fn name(&self) -> &'static str {
        "page-checksum"
    }

    fn process(&mut self, input: Option<&[u8]>, _output: &mut Vec<u8>) -> Result<FilterIo> {
        match input {
            Some(data) => {
                self.process_data(data)?;
                Ok(FilterIo::CONSUMED)
            }
            None => {
                self.finish()?;
                Ok(FilterIo::DONE)
            }
        }
    }

    fn result(&mut self) -> Value {
        let mut result = serde_json::Map::new();
        if !self.error.is_empty() {
            self.valid = false;
            // Compact runs of consecutive failed pages into [first, last]
            // pairs.
            let mut compact: Vec<Value> = Vec::new();
            let mut run_start = self.error[0].0;
            let mut run_end = run_start;
            for &(page, _lsn) in &self.error[1..] {
                if page == run_end + 1 {
                    run_end = page;
                } else {
                    compact.push(page_range(run_start, run_end));
                    run_start = page;
                    run_end = page;
                }
            }
            compact.push(page_range(run_start, run_end));
            result.insert("error".into(), Value::Array(compact));
        }
        result.insert("valid".into(), Value::Bool(self.valid));
        result.insert("align".into(), Value::Bool(self.align));
        Value::Object(result)
    }
}

fn page_range(start: u32, end: u32) -> Value {
    if start == end {
        json!(start)
    } else {
        json!([start, end])
    }
}

// ----------------------------------------------------------------------------
// PostgreSQL's block checksum: 32 parallel FNV-1a-style lanes over the page
// with the checksum field itself zeroed, mixed with the block number.

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE810F7BD, 0x2F2E70AD, 0x1AA653E9, 0x7B906612, 0xA2152C7D,
    0x8068619D, 0xBE98F631, 0xB6028278, 0x0DA1C4C4, 0xFC82D184, 0x6BEE5E7B, 0x9CC10B44, 0x4F7B3E06,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(page: &[u8]) -> u32 {
    debug_assert_eq!(page.len(), PG_PAGE_SIZE);
    let mut sums = CHECKSUM_BASE_OFFSETS;
    for row in page.chunks_exact(4 * N_SUMS) {
        for (j, word) in row.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes(word.try_into().expect("4 bytes"));
            sums[j] = checksum_comp(sums[j], value);
        }
    }
    // Two rounds of zeroes to flush the last input through the function.
    for _ in 0..2 {
        for sum in &mut sums {
            *sum = checksum_comp(*sum, 0);
        }
    }
    sums.iter().fold(0, |acc, sum| acc ^ sum)
}

/// The checksum PostgreSQL stores in `pd_checksum` for `page` at
/// `block_no`.
pub fn page_checksum(page: &[u8], block_no: u32) -> u16 {
    let mut copy = page.to_vec();
    // The stored checksum is not part of its own input.
    copy[8] = 0;
    copy[9] = 0;
    let checksum = checksum_block(&copy) ^ block_no;
    ((checksum % 65535) + 1) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A page with a valid header, the given LSN, and a correct checksum.
    pub(crate) fn valid_page(block_no: u32, lsn: u64) -> Vec<u8> {
        let mut page = vec![0u8; PG_PAGE_SIZE];
        page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
        page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
        // pd_lower / pd_upper frame an empty item area.
        page[12..14].copy_from_slice(&24u16.to_le_bytes());
        page[14..16].copy_from_slice(&8192u16.to_le_bytes());
        let checksum = page_checksum(&page, block_no);
        page[8..10].copy_from_slice(&checksum.to_le_bytes());
        page
    }

    fn run(filter: &mut PageChecksumFilter, data: &[u8]) -> Value {
        let mut out = Vec::new();
        filter.process(Some(data), &mut out).unwrap();
        filter.process(None, &mut out).unwrap();
        filter.result()
    }

    #[test]
    fn valid_pages_pass() {
        let mut data = valid_page(0, 0x1_0000_0000);
        data.extend(valid_page(1, 0x1_0000_0000));
        let mut filter = PageChecksumFilter::new(0, 131072, 0xFF_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(true));
        assert_eq!(result["align"], Value::Bool(true));
        assert!(result.get("error").is_none());
    }

    #[test]
    fn corrupted_page_is_reported() {
        let mut data = valid_page(0, 0x1_0000_0000);
        data.extend(valid_page(1, 0x1_0000_0000));
        data[9000] ^= 0xFF; // flip a bit in page 1
        let mut filter = PageChecksumFilter::new(0, 131072, 0xFF_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(false));
        assert_eq!(result["error"], serde_json::json!([1]));
    }

    #[test]
    fn consecutive_errors_compact_to_a_range() {
        let mut data = Vec::new();
        for block in 0..4u32 {
            data.extend(valid_page(block, 0x1_0000_0000));
        }
        data[8192 + 100] ^= 0xFF;
        data[2 * 8192 + 100] ^= 0xFF;
        data[3 * 8192 + 100] ^= 0xFF;
        let mut filter = PageChecksumFilter::new(0, 131072, 0xFF_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["error"], serde_json::json!([[1, 3]]));
    }

    #[test]
    fn page_past_lsn_limit_is_skipped() {
        let mut data = valid_page(0, 0x2_0000_0000);
        data[100] ^= 0xFF; // corrupt, but past the limit below
        let mut filter = PageChecksumFilter::new(0, 131072, 0x2_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(true));
    }

    #[test]
    fn new_page_is_skipped() {
        let data = vec![0u8; PG_PAGE_SIZE];
        let mut filter = PageChecksumFilter::new(0, 131072, 0x1_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(true));
    }

    #[test]
    fn tiny_trailing_fragment_invalidates_the_file() {
        let mut data = valid_page(0, 0x1_0000_0000);
        data.extend_from_slice(&[1u8; 100]);
        let mut filter = PageChecksumFilter::new(0, 131072, 0xFF_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(false));
        assert_eq!(result["align"], Value::Bool(false));
    }

    #[test]
    fn block_numbers_continue_across_segments() {
        // Segment 1 of a relation with 4 pages per segment: blocks 4..
        let data = valid_page(4, 0x1_0000_0000);
        let mut filter = PageChecksumFilter::new(1, 4, 0xFF_0000_0000);
        let result = run(&mut filter, &data);
        assert_eq!(result["valid"], Value::Bool(true));
    }
}
