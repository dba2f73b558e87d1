//! Streaming filters attached to storage reads and writes.
//!
//! A [`FilterGroup`] is an ordered chain: byte N of the logical stream
//! passes through filter 0, 1, 2, … in order before byte N+1. Filters are
//! either *sinks* that observe the stream and expose a [`Filter::result`]
//! (hash, size, page checksum) or *transforms* that rewrite it (compress,
//! decompress, cipher).
//!
//! Transforms produce bounded output per call and signal `input_same` when
//! more output is pending for the input they were given; the group keeps
//! re-driving them with the same input until it is consumed. On
//! end-of-input each filter is flushed until it reports `done`.

pub mod cipher;
pub mod compress;
pub mod hash;
pub mod page_checksum;
pub mod size;

pub use cipher::{CipherFilter, CipherMode};
pub use compress::{CompressFilter, CompressType, DecompressFilter};
pub use hash::HashFilter;
pub use page_checksum::PageChecksumFilter;
pub use size::SizeFilter;

use serde_json::Value;

use crate::error::Result;

/// Chunk size used when driving filter chains and storage copies.
pub const BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of one [`Filter::process`] call.
#[derive(Debug, Clone, Copy)]
pub struct FilterIo {
    /// The filter has more output pending for the same input; call again
    /// with identical input before providing new bytes.
    pub input_same: bool,
    /// The filter has emitted all output it ever will (meaningful while
    /// flushing).
    pub done: bool,
}

impl FilterIo {
    pub const CONSUMED: FilterIo = FilterIo { input_same: false, done: false };
    pub const AGAIN: FilterIo = FilterIo { input_same: true, done: false };
    pub const DONE: FilterIo = FilterIo { input_same: false, done: true };
}

pub trait Filter: Send {
    fn name(&self) -> &'static str;

    /// A transform rewrites the stream; a sink observes it and the group
    /// forwards its input unchanged.
    fn transforms(&self) -> bool {
        false
    }

    /// Process `input`, appending any output. `input = None` flushes.
    fn process(&mut self, input: Option<&[u8]>, output: &mut Vec<u8>) -> Result<FilterIo>;

    /// Typed result exposed once the stream completes (digest, byte count,
    /// page error map). Sinks override this.
    fn result(&mut self) -> Value {
        Value::Null
    }
}

// ----------------------------------------------------------------------------

pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    flushed: bool,
}

impl Default for FilterGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterGroup {
    pub fn new() -> Self {
        Self { filters: Vec::new(), flushed: false }
    }

    /// Append a filter. Order is fixed at construction time.
    pub fn add(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Pass one chunk through the whole chain, appending the final
    /// transform's output to `out`.
    pub fn process(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        debug_assert!(!self.flushed, "filter group used after flush");
        self.feed(0, input, out)
    }

    /// Signal end-of-input, draining every filter in order.
    pub fn flush(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if !self.flushed {
            self.flushed = true;
            self.feed_flush(0, out)?;
        }
        Ok(())
    }

    /// Results of every filter, keyed by filter name. Call after
    /// [`FilterGroup::flush`].
    pub fn results(&mut self) -> serde_json::Map<String, Value> {
        debug_assert!(self.flushed, "filter results read before flush");
        let mut results = serde_json::Map::new();
        for filter in &mut self.filters {
            let result = filter.result();
            if !result.is_null() {
                results.insert(filter.name().to_owned(), result);
            }
        }
        results
    }

    fn feed(&mut self, idx: usize, input: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if idx == self.filters.len() {
            out.extend_from_slice(input);
            return Ok(());
        }
        if !self.filters[idx].transforms() {
            let mut ignored = Vec::new();
            self.filters[idx].process(Some(input), &mut ignored)?;
            return self.feed(idx + 1, input, out);
        }
        loop {
            let mut produced = Vec::new();
            let io = self.filters[idx].process(Some(input), &mut produced)?;
            if !produced.is_empty() {
                self.feed(idx + 1, &produced, out)?;
            }
            if !io.input_same {
                return Ok(());
            }
        }
    }

    fn feed_flush(&mut self, idx: usize, out: &mut Vec<u8>) -> Result<()> {
        if idx == self.filters.len() {
            return Ok(());
        }
        if !self.filters[idx].transforms() {
            let mut ignored = Vec::new();
            self.filters[idx].process(None, &mut ignored)?;
            return self.feed_flush(idx + 1, out);
        }
        loop {
            let mut produced = Vec::new();
            let io = self.filters[idx].process(None, &mut produced)?;
            if !produced.is_empty() {
                self.feed(idx + 1, &produced, out)?;
            }
            if io.done {
                break;
            }
        }
        self.feed_flush(idx + 1, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_group_is_identity() {
        let mut group = FilterGroup::new();
        let mut out = Vec::new();
        group.process(b"some bytes", &mut out).unwrap();
        group.flush(&mut out).unwrap();
        assert_eq!(out, b"some bytes");
        assert!(group.results().is_empty());
    }

    #[test]
    fn sinks_observe_without_altering_the_stream() {
        let mut group = FilterGroup::new()
            .add(Box::new(HashFilter::sha1()))
            .add(Box::new(SizeFilter::new()));
        let mut out = Vec::new();
        group.process(b"0123456789", &mut out).unwrap();
        group.process(b"abcdef", &mut out).unwrap();
        group.flush(&mut out).unwrap();
        assert_eq!(out, b"0123456789abcdef");
        let results = group.results();
        assert_eq!(results["size"], serde_json::json!(16));
    }

    #[test]
    fn compress_then_decompress_is_identity() {
        for compress_type in [CompressType::Gz, CompressType::Zst] {
            let mut group = FilterGroup::new()
                .add(Box::new(CompressFilter::new(compress_type, 3)))
                .add(Box::new(DecompressFilter::new(compress_type)));
            let input: Vec<u8> = (0..100_000u32).map(|n| (n % 251) as u8).collect();
            let mut out = Vec::new();
            for chunk in input.chunks(BUFFER_SIZE) {
                group.process(chunk, &mut out).unwrap();
            }
            group.flush(&mut out).unwrap();
            assert_eq!(out, input, "{compress_type:?} round trip failed");
        }
    }

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let mut group = FilterGroup::new()
            .add(Box::new(CipherFilter::new(CipherMode::Encrypt, "s3cret").unwrap()))
            .add(Box::new(CipherFilter::new(CipherMode::Decrypt, "s3cret").unwrap()));
        let input: Vec<u8> = (0..10_000u32).map(|n| (n % 7) as u8).collect();
        let mut out = Vec::new();
        group.process(&input, &mut out).unwrap();
        group.flush(&mut out).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let mut encrypt =
            FilterGroup::new().add(Box::new(CipherFilter::new(CipherMode::Encrypt, "right").unwrap()));
        let mut encrypted = Vec::new();
        encrypt.process(b"payload payload payload", &mut encrypted).unwrap();
        encrypt.flush(&mut encrypted).unwrap();

        let mut decrypt =
            FilterGroup::new().add(Box::new(CipherFilter::new(CipherMode::Decrypt, "wrong").unwrap()));
        let mut out = Vec::new();
        let result = decrypt
            .process(&encrypted, &mut out)
            .and_then(|()| decrypt.flush(&mut out));
        assert!(result.is_err());
    }
}
