//! Repository encryption transform.
//!
//! The on-disk format is the `openssl enc` container: a `Salted__` magic,
//! an 8-byte random salt, then the AES-256-CBC stream. The key and IV are
//! derived from the passphrase and salt with one round of EVP_BytesToKey
//! over SHA-1, so repositories remain readable with stock openssl tooling.

use openssl::hash::MessageDigest;
use openssl::pkcs5::bytes_to_key;
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;

use super::{Filter, FilterIo};
use crate::error::{Error, Result};

const CIPHER_MAGIC: &[u8; 8] = b"Salted__";
const SALT_SIZE: usize = 8;
const HEADER_SIZE: usize = CIPHER_MAGIC.len() + SALT_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Encrypt,
    Decrypt,
}

pub struct CipherFilter {
    mode: CipherMode,
    pass: Vec<u8>,
    crypter: Option<Crypter>,
    /// Encrypt: header pending write. Decrypt: header bytes accumulated.
    header: Vec<u8>,
    done: bool,
}

impl CipherFilter {
    pub fn new(mode: CipherMode, pass: &str) -> Result<Self> {
        let mut this = Self {
            mode,
            pass: pass.as_bytes().to_vec(),
            crypter: None,
            header: Vec::with_capacity(HEADER_SIZE),
            done: false,
        };
        if mode == CipherMode::Encrypt {
            let mut salt = [0u8; SALT_SIZE];
            rand::rng().fill_bytes(&mut salt);
            this.header.extend_from_slice(CIPHER_MAGIC);
            this.header.extend_from_slice(&salt);
            this.crypter = Some(this.crypter_for(&salt, Mode::Encrypt)?);
        }
        Ok(this)
    }

    fn crypter_for(&self, salt: &[u8], mode: Mode) -> Result<Crypter> {
        let cipher = Cipher::aes_256_cbc();
        let derived = bytes_to_key(cipher, MessageDigest::sha1(), &self.pass, Some(salt), 1)?;
        let crypter = Crypter::new(cipher, mode, &derived.key, derived.iv.as_deref())?;
        Ok(crypter)
    }

    fn update(&mut self, data: &[u8], output: &mut Vec<u8>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let crypter = self.crypter.as_mut().expect("crypter initialized");
        let block = Cipher::aes_256_cbc().block_size();
        let start = output.len();
        output.resize(start + data.len() + block, 0);
        let written = crypter.update(data, &mut output[start..])?;
        output.truncate(start + written);
        Ok(())
    }
}

impl Filter for CipherFilter {
    fn name(&self) -> &'static str {
        "cipher"
    }

    fn transforms(&self) -> bool {
        true
    }

    fn process(&mut self, input: Option<&[u8]>, output: &mut Vec<u8>) -> Result<FilterIo> {
        match (self.mode, input) {
            (CipherMode::Encrypt, Some(data)) => {
                if !self.header.is_empty() {
                    output.append(&mut self.header);
                }
                self.update(data, output)?;
                Ok(FilterIo::CONSUMED)
            }
            (CipherMode::Encrypt, None) => {
                if self.done {
                    return Ok(FilterIo::DONE);
                }
                // An empty stream still gets a header so that decrypt can
                // validate the passphrase.
                if !self.header.is_empty() {
                    output.append(&mut self.header);
                }
                let crypter = self.crypter.as_mut().expect("crypter initialized");
                let block = Cipher::aes_256_cbc().block_size();
                let start = output.len();
                output.resize(start + block, 0);
                let written = crypter.finalize(&mut output[start..])?;
                output.truncate(start + written);
                self.done = true;
                Ok(FilterIo::DONE)
            }
            (CipherMode::Decrypt, Some(data)) => {
                let mut data = data;
                if self.crypter.is_none() {
                    let need = HEADER_SIZE - self.header.len();
                    let take = need.min(data.len());
                    self.header.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.header.len() < HEADER_SIZE {
                        return Ok(FilterIo::CONSUMED);
                    }
                    if &self.header[..CIPHER_MAGIC.len()] != CIPHER_MAGIC {
                        return Err(Error::Crypto("cipher header invalid".into()));
                    }
                    let salt = self.header[CIPHER_MAGIC.len()..].to_vec();
                    self.crypter = Some(self.crypter_for(&salt, Mode::Decrypt)?);
                }
                self.update(data, output)?;
                Ok(FilterIo::CONSUMED)
            }
            (CipherMode::Decrypt, None) => {
                if self.done {
                    return Ok(FilterIo::DONE);
                }
                let crypter = match self.crypter.as_mut() {
                    Some(crypter) => crypter,
                    None => return Err(Error::Crypto("cipher header missing".into())),
                };
                let block = Cipher::aes_256_cbc().block_size();
                let start = output.len();
                output.resize(start + block, 0);
                let written = crypter.finalize(&mut output[start..]).map_err(|_| {
                    Error::Crypto("unable to flush cipher (incorrect passphrase?)".into())
                })?;
                output.truncate(start + written);
                self.done = true;
                Ok(FilterIo::DONE)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(filter: &mut CipherFilter, chunks: &[&[u8]]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in chunks {
            filter.process(Some(chunk), &mut out)?;
        }
        filter.process(None, &mut out)?;
        Ok(out)
    }

    #[test]
    fn header_magic_is_enforced() {
        let mut decrypt = CipherFilter::new(CipherMode::Decrypt, "pass").unwrap();
        let result = run(&mut decrypt, &[b"NotSalt_12345678somedata"]);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn short_stream_fails_cleanly() {
        let mut decrypt = CipherFilter::new(CipherMode::Decrypt, "pass").unwrap();
        let result = run(&mut decrypt, &[b"Salted__"]);
        assert!(matches!(result, Err(Error::Crypto(_))));
    }

    #[test]
    fn split_header_round_trip() {
        let mut encrypt = CipherFilter::new(CipherMode::Encrypt, "pass").unwrap();
        let encrypted = run(&mut encrypt, &[b"attack at dawn"]).unwrap();
        assert_eq!(&encrypted[..8], CIPHER_MAGIC);

        // Feed the ciphertext one byte at a time to exercise header
        // accumulation.
        let mut decrypt = CipherFilter::new(CipherMode::Decrypt, "pass").unwrap();
        let chunks: Vec<&[u8]> = encrypted.chunks(1).collect();
        let decrypted = run(&mut decrypt, &chunks).unwrap();
        assert_eq!(decrypted, b"attack at dawn");
    }
}
