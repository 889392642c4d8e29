use super::{remote_join, BackendConfig, RemoteEntry, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{Session, Sftp};
use std::fs::File;
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Limit for any single blocking libssh2 call
const IO_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_LIST_DEPTH: usize = 8;

struct Settings {
    host: String,
    port: u16,
    username: String,
    password: Option<String>,
    private_key: Option<PathBuf>,
    base_dir: String,
}

pub struct SftpBackend {
    settings: Arc<Settings>,
}

impl SftpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let BackendConfig::Sftp {
            host,
            port,
            username,
            password,
            private_key,
            base_dir,
        } = config
        else {
            return Err(EngineError::config("not an SFTP destination"));
        };
        if password.is_none() && private_key.is_none() {
            return Err(EngineError::config(format!(
                "SFTP destination {} needs a password or a private key",
                host
            )));
        }
        Ok(Self {
            settings: Arc::new(Settings {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
                private_key: private_key.clone(),
                base_dir: base_dir.clone(),
            }),
        })
    }

    async fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp, &Settings) -> io::Result<T> + Send + 'static,
    {
        let settings = Arc::clone(&self.settings);
        tokio::task::spawn_blocking(move || {
            let endpoint = format!("sftp://{}@{}:{}", settings.username, settings.host, settings.port);
            open_session(&settings)
                .and_then(|session| {
                    let sftp = session.sftp()?;
                    f(&sftp, &settings)
                })
                .map_err(|e| EngineError::replication(endpoint, e))
        })
        .await?
    }
}

fn open_session(settings: &Settings) -> io::Result<Session> {
    let addr = std::net::ToSocketAddrs::to_socket_addrs(&(settings.host.as_str(), settings.port))?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "host did not resolve"))?;
    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    tcp.set_read_timeout(Some(IO_TIMEOUT))?;
    tcp.set_write_timeout(Some(IO_TIMEOUT))?;

    let mut session = Session::new()?;
    session.set_timeout(IO_TIMEOUT.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake()?;

    match (&settings.private_key, &settings.password) {
        (Some(key), passphrase) => {
            session.userauth_pubkey_file(&settings.username, None, key, passphrase.as_deref())?
        }
        (None, Some(password)) => session.userauth_password(&settings.username, password)?,
        (None, None) => {}
    }
    if !session.authenticated() {
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "SSH authentication failed"));
    }
    Ok(session)
}

fn mkdir_all(sftp: &Sftp, dir: &Path) {
    let mut current = PathBuf::new();
    for component in dir.components() {
        current.push(component);
        if sftp.stat(&current).is_err() {
            let _ = sftp.mkdir(&current, 0o750);
        }
    }
}

fn list_recursive(
    sftp: &Sftp,
    base: &str,
    relative: &str,
    depth: usize,
    out: &mut Vec<RemoteEntry>,
) -> io::Result<()> {
    let dir = remote_join(base, relative);
    let dir = if dir.is_empty() { ".".to_string() } else { dir };
    for (path, stat) in sftp.readdir(Path::new(&dir))? {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        let child = remote_join(relative, &name);
        if stat.is_dir() {
            if depth < MAX_LIST_DEPTH {
                list_recursive(sftp, base, &child, depth + 1, out)?;
            }
        } else if stat.is_file() {
            out.push(RemoteEntry {
                path: child,
                size: stat.size.unwrap_or(0),
                modified: stat
                    .mtime
                    .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for SftpBackend {
    async fn test_connection(&self) -> Result<()> {
        self.with_sftp(|sftp, settings| {
            let base = if settings.base_dir.is_empty() { "." } else { settings.base_dir.as_str() };
            sftp.stat(Path::new(base)).map(|_| ()).map_err(io::Error::from)
        })
        .await
    }

    async fn upload(&self, file: &Path, remote_path: &str) -> Result<u64> {
        let source = file.to_path_buf();
        let remote_path = remote_path.to_string();
        self.with_sftp(move |sftp, settings| {
            let target = PathBuf::from(remote_join(&settings.base_dir, &remote_path));
            if let Some(parent) = target.parent() {
                mkdir_all(sftp, parent);
            }
            let staging = target.with_extension("partial");
            let mut local = File::open(&source)?;
            let mut remote = sftp.create(&staging)?;
            let sent = io::copy(&mut local, &mut remote)?;
            drop(remote);
            // SFTP rename refuses to overwrite on most servers
            let _ = sftp.unlink(&target);
            sftp.rename(&staging, &target, None)?;
            Ok(sent)
        })
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = prefix.to_string();
        let mut entries = self
            .with_sftp(|sftp, settings| {
                let mut out = Vec::new();
                list_recursive(sftp, &settings.base_dir, "", 0, &mut out)?;
                Ok(out)
            })
            .await?;
        entries.retain(|e| e.path.starts_with(&prefix));
        Ok(entries)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        let remote_path = remote_path.to_string();
        self.with_sftp(move |sftp, settings| {
            let target = remote_join(&settings.base_dir, &remote_path);
            sftp.unlink(Path::new(&target)).map_err(io::Error::from)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_required() {
        let config = BackendConfig::Sftp {
            host: "backup.example.com".into(),
            port: 22,
            username: "backup".into(),
            password: None,
            private_key: None,
            base_dir: String::new(),
        };
        assert!(matches!(SftpBackend::new(&config), Err(EngineError::Configuration(_))));

        let config = BackendConfig::Sftp {
            host: "backup.example.com".into(),
            port: 22,
            username: "backup".into(),
            password: Some("secret".into()),
            private_key: None,
            base_dir: "/srv/backups".into(),
        };
        assert!(SftpBackend::new(&config).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_replication_error() {
        let config = BackendConfig::Sftp {
            host: "127.0.0.1".into(),
            port: 1,
            username: "backup".into(),
            password: Some("secret".into()),
            private_key: None,
            base_dir: String::new(),
        };
        let backend = SftpBackend::new(&config).expect("valid SFTP config");
        let result = backend.test_connection().await;
        assert!(matches!(result, Err(EngineError::Replication { .. })));
    }
}
