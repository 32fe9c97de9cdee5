use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::fs::File;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode};
use tracing::{debug, info, warn};

use super::{UploadReceipt, is_expired};
use crate::backup::DumpFile;
use crate::errors::{BackupError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Deserialize)]
pub struct FtpConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_passive")]
    pub passive_mode: bool,
}

fn default_port() -> u16 {
    21
}

fn default_passive() -> bool {
    true
}

/// Storage forms have historically saved the port as text.
fn port_from_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }
    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("passive_mode", &self.passive_mode)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FtpStorage {
    config: FtpConfig,
}

impl FtpStorage {
    pub fn new(config: FtpConfig) -> Result<Self> {
        if config.host.trim().is_empty() {
            return Err(BackupError::config("FTP host not configured"));
        }
        Ok(Self { config })
    }

    pub async fn upload(&self, folder_path: &str, files: &[DumpFile]) -> Result<UploadReceipt> {
        let config = self.config.clone();
        let remote_dir = remote_dir(folder_path);
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut ftp = connect(&config)?;
            let result = upload_session(&mut ftp, &config.host, &remote_dir, &files);
            close(ftp);
            result
        })
        .await?
    }

    pub async fn delete_older_than(&self, folder_path: &str, database: &str, cutoff: NaiveDateTime) -> usize {
        let config = self.config.clone();
        let remote_dir = remote_dir(folder_path);
        let database = database.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            let mut ftp = connect(&config)?;
            let deleted = delete_session(&mut ftp, &remote_dir, &database, cutoff);
            close(ftp);
            Ok::<_, BackupError>(deleted)
        })
        .await;

        match outcome {
            Ok(Ok(deleted)) => deleted,
            Ok(Err(e)) => {
                warn!(host = %self.config.host, error = %e, "FTP retention skipped");
                0
            }
            Err(e) => {
                warn!(error = %e, "FTP retention task failed");
                0
            }
        }
    }
}

fn connect(config: &FtpConfig) -> Result<FtpStream> {
    let addr: SocketAddr = (config.host.as_str(), config.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| BackupError::upload(format!("Cannot resolve FTP host {}", config.host)))?;
    let mut ftp = FtpStream::connect_timeout(addr, CONNECT_TIMEOUT)?;
    ftp.login(config.username.as_str(), config.password.as_str())?;
    ftp.set_mode(if config.passive_mode { Mode::Passive } else { Mode::Active });
    debug!(host = %config.host, port = config.port, passive = config.passive_mode, "Connected to FTP server");
    Ok(ftp)
}

fn close(mut ftp: FtpStream) {
    if let Err(e) = ftp.quit() {
        debug!(error = %e, "FTP quit failed");
    }
}

fn upload_session(ftp: &mut FtpStream, host: &str, remote_dir: &str, files: &[DumpFile]) -> Result<UploadReceipt> {
    ensure_remote_dir(ftp, remote_dir)?;
    ftp.transfer_type(FileType::Binary)?;

    let mut locators = Vec::with_capacity(files.len());
    let mut total_bytes = 0u64;
    for file in files {
        let remote_path = format!("{}/{}", remote_dir.trim_end_matches('/'), file.filename);
        let mut reader = File::open(&file.path)?;
        ftp.put_file(remote_path.as_str(), &mut reader)
            .map_err(|e| BackupError::upload(format!("FTP upload of {} failed: {}", file.filename, e)))?;
        let size = std::fs::metadata(&file.path)?.len();
        info!(file = %file.filename, remote = %remote_path, bytes = size, "Uploaded to FTP");
        total_bytes += size;
        locators.push(format!("ftp://{}{}", host, remote_path));
    }

    Ok(UploadReceipt {
        message: format!("Uploaded {} file(s) to ftp://{}{}", files.len(), host, remote_dir),
        locators,
        total_bytes,
    })
}

fn delete_session(ftp: &mut FtpStream, remote_dir: &str, database: &str, cutoff: NaiveDateTime) -> usize {
    if ftp.cwd(remote_dir).is_err() {
        return 0;
    }
    let names = match ftp.nlst(None) {
        Ok(names) => names,
        Err(e) => {
            warn!(dir = %remote_dir, error = %e, "Failed to list FTP directory");
            return 0;
        }
    };

    let mut deleted = 0;
    for entry in names {
        let name = entry.rsplit('/').next().unwrap_or(&entry);
        if is_expired(name, database, cutoff) != Some(true) {
            continue;
        }
        match ftp.rm(name) {
            Ok(()) => {
                info!(file = %name, "Deleted old FTP backup");
                deleted += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "Failed to delete old FTP backup"),
        }
    }
    deleted
}

/// Absolute remote directory for a folder path, e.g. `/backups/Daily`.
fn remote_dir(folder_path: &str) -> String {
    let parts = remote_components(folder_path);
    format!("/{}", parts.join("/"))
}

fn remote_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|part| !part.is_empty() && *part != ".").collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MkdirFailure {
    AlreadyExists,
    Fatal,
}

/// Servers answer a redundant MKD with a 550 mentioning the directory exists;
/// anything else, permission problems in particular, stops the upload.
fn classify_mkdir_error(message: &str) -> MkdirFailure {
    let lower = message.to_ascii_lowercase();
    let denied = lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed");
    if lower.contains("exist") && !denied {
        MkdirFailure::AlreadyExists
    } else {
        MkdirFailure::Fatal
    }
}

/// Creates each component of `remote_dir` starting at `/`.
fn ensure_remote_dir(ftp: &mut FtpStream, remote_dir: &str) -> Result<()> {
    ftp.cwd("/")?;
    for part in remote_components(remote_dir) {
        if ftp.cwd(part).is_ok() {
            continue;
        }
        match ftp.mkdir(part) {
            Ok(()) => debug!(dir = %part, "Created FTP directory"),
            Err(e) => match classify_mkdir_error(&e.to_string()) {
                MkdirFailure::AlreadyExists => debug!(dir = %part, "FTP directory already exists"),
                MkdirFailure::Fatal => {
                    return Err(BackupError::upload(format!(
                        "Cannot create FTP directory {} in {}: {}",
                        part, remote_dir, e
                    )));
                }
            },
        }
        ftp.cwd(part)?;
    }
    ftp.cwd("/")?;
    Ok(())
}
