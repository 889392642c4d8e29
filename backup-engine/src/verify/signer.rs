//! Ed25519 manifest signing key, provisioned once per installation.
//!
//! The private seed lives in `manifest_signing.key` (mode 0600) and the
//! public key in `manifest_signing.pub` next to it. Verification only ever
//! trusts the local public key.

use crate::crypto::keys::{read_secret, write_key_file, write_secret, SecretKey, KEY_LEN};
use crate::utils::errors::{EngineError, Result};
use crate::utils::hashing::sha256_hex;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::info;

pub const SIGNING_KEY_FILE: &str = "manifest_signing.key";
pub const VERIFYING_KEY_FILE: &str = "manifest_signing.pub";

pub struct ManifestSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl ManifestSigner {
    /// Load the keypair from `keys_dir`, generating it on first use
    pub fn load_or_create(keys_dir: &Path) -> Result<Self> {
        let secret_path = keys_dir.join(SIGNING_KEY_FILE);
        let public_path = keys_dir.join(VERIFYING_KEY_FILE);

        let signing_key = match read_secret(&secret_path)? {
            Some(seed) => SigningKey::from_bytes(seed.as_bytes()),
            None => {
                let signing_key = SigningKey::generate(&mut OsRng);
                write_secret(&secret_path, SecretKey::new(signing_key.to_bytes()).as_bytes())?;
                info!(path = %secret_path.display(), "Generated manifest signing key");
                signing_key
            }
        };
        let verifying_key = signing_key.verifying_key();

        match fs::read(&public_path) {
            Ok(stored) => {
                if stored.as_slice() != verifying_key.as_bytes() {
                    return Err(EngineError::crypto(format!(
                        "{} does not match the signing key",
                        public_path.display()
                    )));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                write_key_file(&public_path, verifying_key.as_bytes(), 0o644)?;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            signing_key,
            verifying_key,
        })
    }

    /// Hex signature over `message`
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// True only for a well-formed signature by the local key
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes): std::result::Result<[u8; 64], _> = bytes.try_into() else {
            return false;
        };
        self.verifying_key
            .verify(message, &Signature::from_bytes(&bytes))
            .is_ok()
    }

    /// Short fingerprint of the public key, recorded in manifests
    pub fn key_id(&self) -> String {
        sha256_hex(self.verifying_key.as_bytes())[..16].to_string()
    }
}
