//! Compression and decompression transforms.
//!
//! Two formats are supported: gz (via `flate2`) and zst (via `zstd`). The
//! format is recorded in the repository as a file extension on WAL
//! segments and backup files.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use zstd::stream::raw::{Decoder as ZstDecoder, Encoder as ZstEncoder, Operation, OutBuffer};

use super::{Filter, FilterIo, BUFFER_SIZE};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressType {
    Gz,
    Zst,
}

impl CompressType {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressType::Gz => "gz",
            CompressType::Zst => "zst",
        }
    }

    /// Compression type implied by a repository file name, if any.
    pub fn from_name(name: &str) -> Option<CompressType> {
        if name.ends_with(".gz") {
            Some(CompressType::Gz)
        } else if name.ends_with(".zst") {
            Some(CompressType::Zst)
        } else {
            None
        }
    }

    pub fn default_level(&self) -> i32 {
        match self {
            CompressType::Gz => 6,
            CompressType::Zst => 3,
        }
    }
}

impl fmt::Display for CompressType {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.write_str(self.extension())
    }
}

impl FromStr for CompressType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gz" => Ok(CompressType::Gz),
            "zst" => Ok(CompressType::Zst),
            _ => Err(Error::OptionInvalidValue(format!(
                "'{s}' is not a valid compression type (expected gz or zst)"
            ))),
        }
    }
}

// ----------------------------------------------------------------------------

enum CompressState {
    Gz(GzEncoder<Vec<u8>>),
    Zst { encoder: ZstEncoder<'static>, offset: usize },
}

pub struct CompressFilter {
    state: CompressState,
}

impl CompressFilter {
    pub fn new(compress_type: CompressType, level: i32) -> Self {
        let state = match compress_type {
            CompressType::Gz => CompressState::Gz(GzEncoder::new(
                Vec::new(),
                Compression::new(level.clamp(0, 9) as u32),
            )),
            CompressType::Zst => CompressState::Zst {
                encoder: ZstEncoder::new(level).expect("zstd encoder context"),
                offset: 0,
            },
        };
        Self { state }
    }
}

impl Filter for CompressFilter {
    fn name(&self) -> &'static str {
        "compress"
    }

    fn transforms(&self) -> bool {
        true
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut Vec<u8>) -> Result<FilterIo> {
        match &mut self.state {
            CompressState::Gz(encoder) => match input {
                Some(data) => {
                    encoder
                        .write_all(data)
                        .map_err(|err| Error::Format(format!("gz compression failed: {err}")))?;
                    output.append(encoder.get_mut());
                    Ok(FilterIo::CONSUMED)
                }
                None => {
                    encoder
                        .try_finish()
                        .map_err(|err| Error::Format(format!("gz compression failed: {err}")))?;
                    output.append(encoder.get_mut());
                    Ok(FilterIo::DONE)
                }
            },
            CompressState::Zst { encoder, offset } => {
                let start = output.len();
                output.resize(start + BUFFER_SIZE, 0);
                match input {
                    Some(data) => {
                        let status = encoder
                            .run_on_buffers(&data[*offset..], &mut output[start..])
                            .map_err(|err| Error::Format(format!("zst compression failed: {err}")))?;
                        output.truncate(start + status.bytes_written);
                        *offset += status.bytes_read;
                        if *offset < data.len() {
                            Ok(FilterIo::AGAIN)
                        } else {
                            *offset = 0;
                            Ok(FilterIo::CONSUMED)
                        }
                    }
                    None => {
                        let mut out_buffer = OutBuffer::around(&mut output[start..]);
                        let remaining = encoder
                            .finish(&mut out_buffer, true)
                            .map_err(|err| Error::Format(format!("zst compression failed: {err}")))?;
                        let written = out_buffer.pos();
                        output.truncate(start + written);
                        if remaining == 0 {
                            Ok(FilterIo::DONE)
                        } else {
                            Ok(FilterIo::AGAIN)
                        }
                    }
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------

enum DecompressState {
    Gz(GzDecoder<Vec<u8>>),
    Zst { decoder: ZstDecoder<'static>, offset: usize },
}

pub struct DecompressFilter {
    state: DecompressState,
}

impl DecompressFilter {
    pub fn new(compress_type: CompressType) -> Self {
        let state = match compress_type {
            CompressType::Gz => DecompressState::Gz(GzDecoder::new(Vec::new())),
            CompressType::Zst => DecompressState::Zst {
                decoder: ZstDecoder::new().expect("zstd decoder context"),
                offset: 0,
            },
        };
        Self { state }
    }
}

impl Filter for DecompressFilter {
    fn name(&self) -> &'static str {
        "decompress"
    }

    fn transforms(&self) -> bool {
        true
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut Vec<u8>) -> Result<FilterIo> {
        match &mut self.state {
            DecompressState::Gz(decoder) => match input {
                Some(data) => {
                    decoder
                        .write_all(data)
                        .map_err(|err| Error::Format(format!("gz decompression failed: {err}")))?;
                    output.append(decoder.get_mut());
                    Ok(FilterIo::CONSUMED)
                }
                None => {
                    decoder
                        .try_finish()
                        .map_err(|err| Error::Format(format!("gz decompression failed: {err}")))?;
                    output.append(decoder.get_mut());
                    Ok(FilterIo::DONE)
                }
            },
            DecompressState::Zst { decoder, offset } => {
                let start = output.len();
                output.resize(start + BUFFER_SIZE, 0);
                match input {
                    Some(data) => {
                        let status = decoder
                            .run_on_buffers(&data[*offset..], &mut output[start..])
                            .map_err(|err| {
                                Error::Format(format!("zst decompression failed: {err}"))
                            })?;
                        output.truncate(start + status.bytes_written);
                        *offset += status.bytes_read;
                        if *offset < data.len() {
                            Ok(FilterIo::AGAIN)
                        } else {
                            *offset = 0;
                            Ok(FilterIo::CONSUMED)
                        }
                    }
                    None => {
                        let mut out_buffer = OutBuffer::around(&mut output[start..]);
                        let remaining = decoder.finish(&mut out_buffer, true).map_err(|err| {
                            Error::Format(format!("zst decompression failed: {err}"))
                        })?;
                        let written = out_buffer.pos();
                        output.truncate(start + written);
                        if remaining == 0 {
                            Ok(FilterIo::DONE)
                        } else if written == 0 {
                            Err(Error::Format(
                                "unexpected end of zst compressed stream".into(),
                            ))
                        } else {
                            Ok(FilterIo::AGAIN)
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterGroup;

    #[test]
    fn extension_round_trip() {
        assert_eq!(CompressType::Gz.extension(), "gz");
        assert_eq!("zst".parse::<CompressType>().unwrap(), CompressType::Zst);
        assert_eq!(
            CompressType::from_name("000000010000000100000001-abcd.gz"),
            Some(CompressType::Gz)
        );
        assert_eq!(CompressType::from_name("000000010000000100000001-abcd"), None);
    }

    #[test]
    fn truncated_gz_stream_is_an_error() {
        let mut compress = FilterGroup::new().add(Box::new(CompressFilter::new(CompressType::Gz, 6)));
        let mut compressed = Vec::new();
        compress.process(&[0u8; 4096], &mut compressed).unwrap();
        compress.flush(&mut compressed).unwrap();
        compressed.truncate(compressed.len() / 2);

        let mut decompress =
            FilterGroup::new().add(Box::new(DecompressFilter::new(CompressType::Gz)));
        let mut out = Vec::new();
        let result = decompress
            .process(&compressed, &mut out)
            .and_then(|()| decompress.flush(&mut out));
        assert!(result.is_err());
    }
}
