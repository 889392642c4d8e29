//! Authenticated encryption of backup archives.
//!
//! Envelope layout (the 7-byte magic is only present in files and sealed
//! buffers):
//!
//! ```text
//! BKENV02 | salt (32) | key check (32) | iv (16) | tag (32) | ciphertext
//! ```
//!
//! The base key is the master key, or PBKDF2-HMAC-SHA256 over the password
//! and salt. AES-256-CBC/PKCS7 encrypts under the base key. The MAC key is
//! HKDF-SHA256(base, salt, "mac") and is never written anywhere; the key
//! check is HMAC(mac key, "key-check") so a wrong key is reported as such,
//! and the tag is HMAC(mac key, salt | key check | iv | ciphertext).
//! Both are compared in constant time before any decryption happens.

pub mod keys;

pub use keys::{load_or_create_master_key, MasterKey, SecretKey};

use crate::utils::errors::{EngineError, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 7] = b"BKENV02";
pub const ENCRYPTION_TYPE: &str = "aes-256-cbc+hmac-sha256";

const SALT_LEN: usize = 32;
const CHECK_LEN: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const BLOCK_LEN: usize = 16;
pub const HEADER_LEN: usize = SALT_LEN + CHECK_LEN + IV_LEN + TAG_LEN;
const TAG_OFFSET: u64 = (SALT_LEN + CHECK_LEN + IV_LEN) as u64;

/// Plaintext processed per step; a multiple of the block size
const CHUNK_LEN: usize = 64 * 1024;

const MAC_INFO: &[u8] = b"mac";
const KEY_CHECK_LABEL: &[u8] = b"key-check";

pub struct Cipher {
    master: MasterKey,
    pbkdf2_iterations: u32,
}

impl Cipher {
    pub fn new(master: MasterKey, pbkdf2_iterations: u32) -> Self {
        Self {
            master,
            pbkdf2_iterations,
        }
    }

    /// Cipher over the master key kept in `keys_dir`
    pub fn open(keys_dir: &Path, pbkdf2_iterations: u32) -> Result<Self> {
        Ok(Self::new(load_or_create_master_key(keys_dir)?, pbkdf2_iterations))
    }

    fn base_key(&self, salt: &[u8], password: Option<&str>) -> Zeroizing<[u8; 32]> {
        let mut key = Zeroizing::new([0u8; 32]);
        match password {
            Some(password) => pbkdf2::pbkdf2_hmac::<Sha256>(
                password.as_bytes(),
                salt,
                self.pbkdf2_iterations,
                &mut key[..],
            ),
            None => key.copy_from_slice(self.master.as_bytes()),
        }
        key
    }

    fn mac_key(base: &[u8; 32], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        let mut key = Zeroizing::new([0u8; 32]);
        Hkdf::<Sha256>::new(Some(salt), base)
            .expand(MAC_INFO, &mut key[..])
            .map_err(|e| EngineError::crypto(format!("HKDF expand failed: {}", e)))?;
        Ok(key)
    }

    fn hmac(key: &[u8; 32]) -> Result<HmacSha256> {
        <HmacSha256 as Mac>::new_from_slice(key)
            .map_err(|e| EngineError::crypto(format!("HMAC init failed: {}", e)))
    }

    fn key_check(mac_key: &[u8; 32]) -> Result<HmacSha256> {
        let mut check = Self::hmac(mac_key)?;
        check.update(KEY_CHECK_LABEL);
        Ok(check)
    }

    /// Encrypt `reader` into an envelope (no magic) written at the writer's
    /// current position. Returns the envelope length.
    fn encrypt_stream<R: Read, W: Write + Seek>(
        &self,
        reader: &mut R,
        writer: &mut W,
        password: Option<&str>,
    ) -> Result<u64> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let base = self.base_key(&salt, password);
        let mac_key = Self::mac_key(&base, &salt)?;
        let key_check = Self::key_check(&mac_key)?.finalize().into_bytes();

        let start = writer.stream_position()?;
        writer.write_all(&salt)?;
        writer.write_all(&key_check)?;
        writer.write_all(&iv)?;
        // Tag placeholder, filled in once the ciphertext is known
        writer.write_all(&[0u8; TAG_LEN])?;

        let mut mac = Self::hmac(&mac_key)?;
        mac.update(&salt);
        mac.update(&key_check);
        mac.update(&iv);

        let mut cipher = Aes256CbcEnc::new_from_slices(&base[..], &iv)
            .map_err(|e| EngineError::crypto(format!("cipher init failed: {}", e)))?;
        let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN + BLOCK_LEN]);
        let mut length = HEADER_LEN as u64;

        let tail = loop {
            let n = read_full(reader, &mut buf[..CHUNK_LEN])?;
            if n < CHUNK_LEN {
                break n;
            }
            for block in buf[..CHUNK_LEN].chunks_exact_mut(BLOCK_LEN) {
                cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            mac.update(&buf[..CHUNK_LEN]);
            writer.write_all(&buf[..CHUNK_LEN])?;
            length += CHUNK_LEN as u64;
        };

        // The last chunk may be empty; padding always adds a block
        let last = cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buf[..], tail)
            .map_err(|_| EngineError::crypto("padding failed"))?;
        mac.update(last);
        writer.write_all(last)?;
        length += last.len() as u64;

        let tag = mac.finalize().into_bytes();
        writer.seek(SeekFrom::Start(start + TAG_OFFSET))?;
        writer.write_all(&tag)?;
        writer.seek(SeekFrom::Start(start + length))?;
        Ok(length)
    }

    /// Authenticate then decrypt an envelope (no magic) that runs from the
    /// reader's current position to its end. Any mismatch is an integrity
    /// error, raised before plaintext is written.
    fn decrypt_stream<R: Read + Seek, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        password: Option<&str>,
    ) -> Result<u64> {
        let start = reader.stream_position()?;
        let length = reader.seek(SeekFrom::End(0))?.saturating_sub(start);
        if length < (HEADER_LEN + BLOCK_LEN) as u64 || (length - HEADER_LEN as u64) % BLOCK_LEN as u64 != 0 {
            return Err(EngineError::crypto(format!("malformed envelope ({} bytes)", length)));
        }
        reader.seek(SeekFrom::Start(start))?;

        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header)?;
        let (salt, rest) = header.split_at(SALT_LEN);
        let (key_check, rest) = rest.split_at(CHECK_LEN);
        let (iv, tag) = rest.split_at(IV_LEN);

        let base = self.base_key(salt, password);
        let mac_key = Self::mac_key(&base, salt)?;
        Self::key_check(&mac_key)?
            .verify_slice(key_check)
            .map_err(|_| EngineError::integrity("key check failed: wrong key or password"))?;

        let header_mac = |mac_key: &[u8; 32]| -> Result<HmacSha256> {
            let mut mac = Self::hmac(mac_key)?;
            mac.update(salt);
            mac.update(key_check);
            mac.update(iv);
            Ok(mac)
        };
        let body_len = length - HEADER_LEN as u64;
        let mut buf = Zeroizing::new(vec![0u8; CHUNK_LEN]);

        // First pass authenticates the whole ciphertext
        let mut mac = header_mac(&mac_key)?;
        let mut remaining = body_len;
        while remaining > 0 {
            let take = remaining.min(CHUNK_LEN as u64) as usize;
            reader.read_exact(&mut buf[..take])?;
            mac.update(&buf[..take]);
            remaining -= take as u64;
        }
        mac.verify_slice(tag)
            .map_err(|_| EngineError::integrity("authentication tag mismatch"))?;

        // Second pass decrypts, re-checking the tag so a file rewritten
        // between passes is still caught
        reader.seek(SeekFrom::Start(start + HEADER_LEN as u64))?;
        let mut mac = header_mac(&mac_key)?;
        let mut cipher = Aes256CbcDec::new_from_slices(&base[..], iv)
            .map_err(|e| EngineError::crypto(format!("cipher init failed: {}", e)))?;
        let mut remaining = body_len;
        let mut written = 0u64;
        while remaining > CHUNK_LEN as u64 {
            reader.read_exact(&mut buf[..])?;
            mac.update(&buf[..]);
            for block in buf.chunks_exact_mut(BLOCK_LEN) {
                cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf[..])?;
            written += CHUNK_LEN as u64;
            remaining -= CHUNK_LEN as u64;
        }

        let last = &mut buf[..remaining as usize];
        reader.read_exact(last)?;
        mac.update(last);
        mac.verify_slice(tag)
            .map_err(|_| EngineError::integrity("envelope changed while it was being decrypted"))?;
        let plain = cipher
            .decrypt_padded_mut::<Pkcs7>(last)
            .map_err(|_| EngineError::crypto("invalid padding"))?;
        writer.write_all(plain)?;
        Ok(written + plain.len() as u64)
    }

    /// Encrypt `data`; the result carries no magic
    pub fn encrypt(&self, data: &[u8], password: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::with_capacity(HEADER_LEN + data.len() + BLOCK_LEN));
        self.encrypt_stream(&mut &data[..], &mut out, password)?;
        Ok(out.into_inner())
    }

    /// Authenticate then decrypt. Any mismatch is an integrity error and no
    /// plaintext is produced.
    pub fn decrypt(&self, envelope: &[u8], password: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(envelope.len());
        self.decrypt_stream(&mut Cursor::new(envelope), &mut out, password)?;
        Ok(out)
    }

    /// Encrypt and prefix the format magic
    pub fn seal(&self, data: &[u8], password: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::with_capacity(MAGIC.len() + HEADER_LEN + data.len() + BLOCK_LEN));
        self.seal_stream(&mut &data[..], &mut out, password)?;
        Ok(out.into_inner())
    }

    /// Check the format magic, then decrypt
    pub fn unseal(&self, sealed: &[u8], password: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(sealed.len());
        self.unseal_stream(&mut Cursor::new(sealed), &mut out, password)?;
        Ok(out)
    }

    /// Streaming [`Cipher::seal`]. Returns the sealed length.
    pub fn seal_stream<R: Read, W: Write + Seek>(
        &self,
        reader: &mut R,
        writer: &mut W,
        password: Option<&str>,
    ) -> Result<u64> {
        writer.write_all(MAGIC)?;
        Ok(MAGIC.len() as u64 + self.encrypt_stream(reader, writer, password)?)
    }

    /// Streaming [`Cipher::unseal`]. Returns the plaintext length.
    pub fn unseal_stream<R: Read + Seek, W: Write>(
        &self,
        reader: &mut R,
        writer: &mut W,
        password: Option<&str>,
    ) -> Result<u64> {
        let mut magic = [0u8; MAGIC.len()];
        if read_full(reader, &mut magic)? < MAGIC.len() || &magic != MAGIC {
            return Err(EngineError::crypto("missing envelope magic"));
        }
        self.decrypt_stream(reader, writer, password)
    }

    pub fn encrypt_file(&self, input: &Path, output: &Path, password: Option<&str>) -> Result<u64> {
        let mut reader = BufReader::new(File::open(input)?);
        let mut writer = BufWriter::new(File::create(output)?);
        let length = self.seal_stream(&mut reader, &mut writer, password)?;
        writer.flush()?;
        Ok(length)
    }

    /// Decrypt `input` into `output`. `output` is removed again when the
    /// envelope does not authenticate.
    pub fn decrypt_file(&self, input: &Path, output: &Path, password: Option<&str>) -> Result<u64> {
        let mut reader = BufReader::new(File::open(input)?);
        let result = File::create(output).map_err(EngineError::from).and_then(|file| {
            let mut writer = BufWriter::new(file);
            let length = self.unseal_stream(&mut reader, &mut writer, password)?;
            writer.flush()?;
            Ok(length)
        });
        if result.is_err() {
            if let Err(e) = std::fs::remove_file(output) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %output.display(), error = %e, "Could not remove rejected plaintext");
                }
            }
        }
        result
    }
}

/// Fill `buf` unless the reader ends first; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// True when `data` starts with the envelope magic
pub fn is_sealed(data: &[u8]) -> bool {
    data.starts_with(MAGIC)
}
