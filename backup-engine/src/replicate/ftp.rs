use super::{remote_join, BackendConfig, RemoteEntry, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::fs::File;
use std::io::BufReader;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};

/// Directory levels followed when listing
const MAX_LIST_DEPTH: usize = 8;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Read/write timeout on the control connection
const IO_TIMEOUT: Duration = Duration::from_secs(60);

struct Settings {
    host: String,
    port: u16,
    username: String,
    password: String,
    base_dir: String,
}

/// Plain FTP. suppaftp is synchronous, so every call runs on the blocking pool
/// with a fresh control connection.
pub struct FtpBackend {
    settings: Arc<Settings>,
}

impl FtpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let BackendConfig::Ftp {
            host,
            port,
            username,
            password,
            base_dir,
        } = config
        else {
            return Err(EngineError::config("not an FTP destination"));
        };
        if host.is_empty() {
            return Err(EngineError::config("FTP destination needs a host"));
        }
        Ok(Self {
            settings: Arc::new(Settings {
                host: host.clone(),
                port: *port,
                username: if username.is_empty() { "anonymous".into() } else { username.clone() },
                password: password.clone(),
                base_dir: base_dir.clone(),
            }),
        })
    }

    async fn with_session<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut FtpStream, &Settings) -> suppaftp::FtpResult<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || {
            let endpoint = format!("ftp://{}:{}", settings.host, settings.port);
            let run = || -> suppaftp::FtpResult<T> {
                let mut ftp = connect(&settings)?;
                ftp.login(settings.username.as_str(), settings.password.as_str())?;
                ftp.transfer_type(FileType::Binary)?;
                let value = f(&mut ftp, &settings)?;
                let _ = ftp.quit();
                Ok(value)
            };
            run().map_err(|e| EngineError::replication(endpoint, e))
        })
        .await?
    }
}

fn connect(settings: &Settings) -> suppaftp::FtpResult<FtpStream> {
    let addr = (settings.host.as_str(), settings.port)
        .to_socket_addrs()
        .map_err(FtpError::ConnectionError)?
        .next()
        .ok_or_else(|| {
            FtpError::ConnectionError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "host did not resolve",
            ))
        })?;
    let ftp = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;
    let control = ftp.get_ref();
    control
        .set_read_timeout(Some(IO_TIMEOUT))
        .and_then(|()| control.set_write_timeout(Some(IO_TIMEOUT)))
        .map_err(FtpError::ConnectionError)?;
    Ok(ftp)
}

fn mkdir_all(ftp: &mut FtpStream, dir: &str) {
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if current.is_empty() && dir.starts_with('/') {
            current.push('/');
        } else if !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);
        // Exists already, or the server will report the real problem on upload
        let _ = ftp.mkdir(&current);
    }
}

fn list_recursive(
    ftp: &mut FtpStream,
    base: &str,
    relative: &str,
    depth: usize,
    out: &mut Vec<RemoteEntry>,
) -> suppaftp::FtpResult<()> {
    let dir = remote_join(base, relative);
    let listing = if dir.is_empty() { ftp.nlst(None)? } else { ftp.nlst(Some(dir.as_str()))? };

    for name in listing {
        let name = name.rsplit('/').next().unwrap_or(&name).to_string();
        if name == "." || name == ".." || name.is_empty() {
            continue;
        }
        let child = remote_join(relative, &name);
        let full = remote_join(base, &child);
        match ftp.size(&full) {
            Ok(size) => out.push(RemoteEntry {
                path: child,
                size: size as u64,
                modified: ftp.mdtm(&full).ok().map(|m| m.and_utc()),
            }),
            Err(_) if depth < MAX_LIST_DEPTH => list_recursive(ftp, base, &child, depth + 1, out)?,
            Err(_) => {}
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FtpBackend {
    async fn test_connection(&self) -> Result<()> {
        self.with_session(|ftp, _| ftp.pwd().map(|_| ())).await
    }

    async fn upload(&self, file: &Path, remote_path: &str) -> Result<u64> {
        let source: PathBuf = file.to_path_buf();
        let remote_path = remote_path.to_string();
        self.with_session(move |ftp, settings| {
            let target = remote_join(&settings.base_dir, &remote_path);
            if let Some((dir, _)) = target.rsplit_once('/') {
                mkdir_all(ftp, dir);
            }
            let staging = format!("{}.partial", target);
            let mut reader = BufReader::new(File::open(&source).map_err(suppaftp::FtpError::ConnectionError)?);
            let sent = ftp.put_file(&staging, &mut reader)?;
            ftp.rename(&staging, &target)?;
            Ok(sent)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = prefix.to_string();
        let mut entries = self
            .with_session(|ftp, settings| {
                let mut out = Vec::new();
                list_recursive(ftp, &settings.base_dir, "", 0, &mut out)?;
                Ok(out)
            })
            .await?;
        entries.retain(|e| e.path.starts_with(&prefix));
        Ok(entries)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let remote_path = remote_path.to_string();
        self.with_session(move |ftp, settings| ftp.rm(remote_join(&settings.base_dir, &remote_path)))
            .await
    }
}
