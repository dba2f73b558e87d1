//! Message digest sink.

use openssl::hash::{Hasher, MessageDigest};
use serde_json::Value;

use super::{Filter, FilterIo};
use crate::error::{Error, Result};

pub struct HashFilter {
    hasher: Hasher,
    digest: Option<String>,
}

impl HashFilter {
    /// SHA-1 is the digest recorded throughout the repository: canonical
    /// WAL names, manifest file checksums, and info file trailers.
    pub fn sha1() -> Self {
        Self::new(MessageDigest::sha1())
    }

    pub fn new(digest: MessageDigest) -> Self {
        Self {
            hasher: Hasher::new(digest).expect("digest type supported by libcrypto"),
            digest: None,
        }
    }

    /// The hex digest; finalizes the hasher on first call.
    pub fn digest(&mut self) -> Result<String> {
        if self.digest.is_none() {
            let bytes = self.hasher.finish().map_err(Error::from)?;
            self.digest = Some(hex::encode(&*bytes));
        }
        Ok(self.digest.clone().expect("digest just computed"))
    }
}

impl Filter for HashFilter {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn process(&mut self, input: Option<&[u8]>, _output: &mut Vec<u8>) -> Result<FilterIo> {
        match input {
            Some(data) => {
                self.hasher.update(data)?;
                Ok(FilterIo::CONSUMED)
            }
            None => Ok(FilterIo::DONE),
        }
    }

    fn result(&mut self) -> Value {
        match self.digest() {
            Ok(digest) => Value::String(digest),
            Err(_) => Value::Null,
        }
    }
}

/// One-shot SHA-1 over a byte slice, as a hex string.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Hasher::new(MessageDigest::sha1()).expect("sha1 supported by libcrypto");
    hasher.update(data).expect("hashing in-memory data");
    hex::encode(&*hasher.finish().expect("finalizing sha1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        // sha1("abc"), a fixed test vector.
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");

        let mut filter = HashFilter::sha1();
        let mut out = Vec::new();
        filter.process(Some(b"ab"), &mut out).unwrap();
        filter.process(Some(b"c"), &mut out).unwrap();
        filter.process(None, &mut out).unwrap();
        assert_eq!(
            filter.result(),
            Value::String("a9993e364706816aba3e25717850c26c9cd0d89d".into())
        );
        assert!(out.is_empty());
    }
}
