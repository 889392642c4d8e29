//! Signed manifest stored as `manifest.json` beside each backup output.

use super::signer::ManifestSigner;
use crate::utils::errors::Result;
use crate::utils::hashing::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub timestamp: String,
    pub total_files: u64,
    pub total_size: u64,
    pub compression_type: String,
    pub encryption_type: String,
    /// Output-relative path → SHA-256 hex
    pub file_hashes: BTreeMap<String, String>,
    pub metadata_hash: String,
    pub signature: String,
    /// Fingerprint of the key that signed this manifest. Informative only.
    pub signer_key_id: String,
}

/// Why a manifest cannot be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustFailure {
    MetadataHashMismatch,
    BadSignature,
}

impl std::fmt::Display for TrustFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrustFailure::MetadataHashMismatch => {
                f.write_str("manifest metadata hash does not match its file hashes")
            }
            TrustFailure::BadSignature => f.write_str("manifest signature is invalid"),
        }
    }
}

/// SHA-256 over `path:hash\n` lines in path order
pub fn metadata_hash(file_hashes: &BTreeMap<String, String>) -> String {
    let mut canonical = String::new();
    for (path, hash) in file_hashes {
        canonical.push_str(path);
        canonical.push(':');
        canonical.push_str(hash);
        canonical.push('\n');
    }
    sha256_hex(canonical.as_bytes())
}

/// Bytes covered by the signature. Binding the backup id stops a valid
/// manifest from being replayed next to another backup's output.
fn signing_message(backup_id: &str, metadata_hash: &str) -> Vec<u8> {
    format!("{}\n{}", backup_id, metadata_hash).into_bytes()
}

impl BackupManifest {
    pub fn new(
        backup_id: &str,
        timestamp: String,
        compression_type: &str,
        encryption_type: &str,
        file_hashes: BTreeMap<String, String>,
        total_size: u64,
        signer: &ManifestSigner,
    ) -> Self {
        let metadata_hash = metadata_hash(&file_hashes);
        let signature = signer.sign(&signing_message(backup_id, &metadata_hash));
        Self {
            backup_id: backup_id.to_string(),
            timestamp,
            total_files: file_hashes.len() as u64,
            total_size,
            compression_type: compression_type.to_string(),
            encryption_type: encryption_type.to_string(),
            file_hashes,
            metadata_hash,
            signature,
            signer_key_id: signer.key_id(),
        }
    }

    pub fn check_trust(&self, signer: &ManifestSigner) -> std::result::Result<(), TrustFailure> {
        if metadata_hash(&self.file_hashes) != self.metadata_hash {
            return Err(TrustFailure::MetadataHashMismatch);
        }
        if !signer.verify(&signing_message(&self.backup_id, &self.metadata_hash), &self.signature) {
            return Err(TrustFailure::BadSignature);
        }
        Ok(())
    }

    pub fn save(&self, output_dir: &Path) -> Result<()> {
        fs::write(output_dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(output_dir: &Path) -> Result<Self> {
        let raw = fs::read(output_dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hashes() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("b.dat".to_string(), sha256_hex(b"b")),
            ("a.dat".to_string(), sha256_hex(b"a")),
        ])
    }

    #[test]
    fn test_metadata_hash_is_order_independent() {
        let mut reversed = BTreeMap::new();
        for (k, v) in hashes().into_iter().rev() {
            reversed.insert(k, v);
        }
        assert_eq!(metadata_hash(&hashes()), metadata_hash(&reversed));
        assert_ne!(metadata_hash(&hashes()), metadata_hash(&BTreeMap::new()));
    }

    #[test]
    fn test_signed_manifest_trusted_until_edited() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let signer = ManifestSigner::load_or_create(temp_dir.path())?;
        let manifest = BackupManifest::new("b1", "t".into(), "zstd", "none", hashes(), 2, &signer);
        assert_eq!(manifest.check_trust(&signer), Ok(()));

        let mut edited = manifest.clone();
        edited.file_hashes.insert("a.dat".into(), sha256_hex(b"evil"));
        assert_eq!(edited.check_trust(&signer), Err(TrustFailure::MetadataHashMismatch));

        edited.metadata_hash = metadata_hash(&edited.file_hashes);
        assert_eq!(edited.check_trust(&signer), Err(TrustFailure::BadSignature));

        let mut moved = manifest;
        moved.backup_id = "b2".into();
        assert_eq!(moved.check_trust(&signer), Err(TrustFailure::BadSignature));
        Ok(())
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let signer = ManifestSigner::load_or_create(&temp_dir.path().join("keys"))?;
        let manifest = BackupManifest::new("b1", "t".into(), "lz4", "none", hashes(), 2, &signer);
        manifest.save(temp_dir.path())?;
        assert_eq!(BackupManifest::load(temp_dir.path())?, manifest);
        Ok(())
    }
}
