//! SHA-256 helpers shared by snapshots, manifests and restore checks.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex SHA-256 of a whole file, streamed.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Reader that hashes and counts everything passing through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Bytes read so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hex SHA-256 of everything read
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;
    use std::io::Write;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_file_hash_matches_bytes() -> io::Result<()> {
        let mut file = NamedTempFile::new()?;
        let data = vec![7u8; 200_000];
        file.write_all(&data)?;
        file.flush()?;

        assert_eq!(sha256_file(file.path())?, sha256_hex(&data));
        Ok(())
    }

    #[test]
    fn test_hashing_reader_sees_every_byte() -> io::Result<()> {
        let data = vec![5u8; 150_000];
        let mut reader = HashingReader::new(data.as_slice());
        io::copy(&mut reader, &mut io::sink())?;
        assert_eq!(HashingReader::bytes(&reader), 150_000);
        assert_eq!(reader.finish(), sha256_hex(&data));
        Ok(())
    }
}
