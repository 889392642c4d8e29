//! Key material on disk.
//!
//! Secret files are created once with mode `0600` inside a `0700`
//! directory and reloaded on every start. A file that exists but does not
//! hold exactly the expected number of bytes is an error, never a reason to
//! generate a replacement: silently rotating the master key would orphan
//! every archive written with the old one.

use crate::utils::errors::{EngineError, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_LEN: usize = 32;
pub const MASTER_KEY_FILE: &str = "master.key";

/// 32 bytes of secret material, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; KEY_LEN] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// The 256-bit key archives are encrypted under when no password is given
pub type MasterKey = SecretKey;

/// Load `<keys_dir>/master.key`, creating it on first use
pub fn load_or_create_master_key(keys_dir: &Path) -> Result<MasterKey> {
    let path = keys_dir.join(MASTER_KEY_FILE);
    match read_secret(&path)? {
        Some(key) => Ok(key),
        None => {
            let key = SecretKey::generate();
            match write_secret(&path, key.as_bytes()) {
                Ok(()) => {
                    info!(path = %path.display(), "Generated new master key");
                    Ok(key)
                }
                // Lost a creation race; use whichever key won
                Err(EngineError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {
                    read_secret(&path)?.ok_or_else(|| EngineError::crypto("master key vanished"))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Read a 32-byte secret. `None` when the file does not exist.
pub fn read_secret(path: &Path) -> Result<Option<SecretKey>> {
    let mut bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    warn_if_exposed(path);

    let key = SecretKey::from_slice(&bytes);
    bytes.zeroize();
    key.map(Some).ok_or_else(|| {
        EngineError::crypto(format!(
            "key file {} is malformed (expected {} bytes)",
            path.display(),
            KEY_LEN
        ))
    })
}

/// Create `path` exclusively with mode 0600. Fails if it already exists.
pub fn write_secret(path: &Path, bytes: &[u8]) -> Result<()> {
    write_key_file(path, bytes, 0o600)
}

/// Create `path` exclusively with the given mode. Fails if it already exists.
pub fn write_key_file(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn create_private_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    }
    #[cfg(not(unix))]
    fs::create_dir_all(dir)?;
    Ok(())
}

fn warn_if_exposed(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            if meta.permissions().mode() & 0o077 != 0 {
                warn!(path = %path.display(), "Key file is readable by group or others");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_master_key_persists() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = load_or_create_master_key(temp_dir.path())?;
        let second = load_or_create_master_key(temp_dir.path())?;
        assert_eq!(first.as_bytes(), second.as_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(temp_dir.path().join(MASTER_KEY_FILE))?.permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        Ok(())
    }

    #[test]
    fn test_malformed_key_is_not_replaced() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join(MASTER_KEY_FILE);
        fs::write(&path, b"too short")?;

        let result = load_or_create_master_key(temp_dir.path());
        assert!(matches!(result, Err(EngineError::Crypto(_))));
        assert_eq!(fs::read(&path)?, b"too short");
        Ok(())
    }
}
