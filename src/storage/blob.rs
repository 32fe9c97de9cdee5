//! Azure Blob container storage addressed through a SAS URL.
//!
//! The container client is built with `object_store`'s Azure builder from the
//! account, container and SAS pairs found in the URL. The SAS query carries
//! the credentials and is never logged.

use chrono::NaiveDateTime;
use futures_util::StreamExt;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ClientOptions, ObjectStore, PutPayload, WriteMultipart};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use url::Url;

use super::{UploadReceipt, is_expired};
use crate::backup::DumpFile;
use crate::errors::{BackupError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
/// Files up to one block go up in a single request, larger ones block by block.
const BLOCK_SIZE: usize = 8 * 1024 * 1024;
const MAX_BLOCKS_IN_FLIGHT: usize = 4;

#[derive(Clone, Deserialize)]
pub struct BlobConfig {
    /// SAS URL for the account or the container.
    pub connection_string: String,
    #[serde(default)]
    pub container: String,
}

impl fmt::Debug for BlobConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = Url::parse(&self.connection_string)
            .map(|url| redacted(&url))
            .unwrap_or_else(|_| "<invalid url>".to_string());
        f.debug_struct("BlobConfig")
            .field("connection_string", &shown)
            .field("container", &self.container)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BlobStorage {
    store: Arc<dyn ObjectStore>,
    account: String,
    container: String,
    block_size: usize,
}

impl BlobStorage {
    pub fn new(config: BlobConfig) -> Result<Self> {
        let url = Url::parse(config.connection_string.trim())
            .map_err(|e| BackupError::config(format!("Invalid blob SAS URL: {}", e)))?;
        let account = account_from_url(&url)
            .ok_or_else(|| BackupError::config("Blob SAS URL has no storage account host"))?;

        let url_container = url
            .path_segments()
            .and_then(|mut segments| segments.find(|s| !s.is_empty()))
            .map(str::to_string);
        let container = match (config.container.trim(), url_container) {
            ("", Some(from_url)) => from_url,
            ("", None) => return Err(BackupError::config("Blob container not configured")),
            (configured, _) => configured.to_string(),
        };

        let sas = sas_pairs(&url);
        if sas.is_empty() {
            return Err(BackupError::config("Blob SAS URL carries no SAS token"));
        }

        let store = MicrosoftAzureBuilder::new()
            .with_account(&account)
            .with_container_name(&container)
            .with_sas_authorization(sas)
            .with_client_options(ClientOptions::new().with_timeout(REQUEST_TIMEOUT))
            .build()
            .map_err(|e| BackupError::config(format!("Azure blob client: {}", e)))?;
        debug!(container = %redacted(&url), "Blob client configured");

        Ok(Self::from_store(Arc::new(store), account, container))
    }

    /// Wraps an already built container client.
    pub fn from_store(store: Arc<dyn ObjectStore>, account: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            store,
            account: account.into(),
            container: container.into(),
            block_size: BLOCK_SIZE,
        }
    }

    #[cfg(test)]
    fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Public HTTPS address of a blob, without credentials.
    pub fn locator(&self, blob_path: &str) -> String {
        format!(
            "https://{}.blob.core.windows.net/{}/{}",
            self.account, self.container, blob_path
        )
    }

    /// Lists a single blob to prove the container is reachable with these credentials.
    async fn check_access(&self) -> Result<()> {
        let mut listing = self.store.list(None);
        if let Some(Err(e)) = listing.next().await {
            return Err(BackupError::upload(format!(
                "Cannot access blob container {}: {}",
                self.container, e
            )));
        }
        Ok(())
    }

    pub async fn upload(&self, folder_path: &str, files: &[DumpFile]) -> Result<UploadReceipt> {
        self.check_access().await?;
        debug!(account = %self.account, container = %self.container, "Connected to blob container");

        let folder = folder_path.trim_matches('/');
        let mut locators = Vec::with_capacity(files.len());
        let mut total_bytes = 0u64;
        for file in files {
            let blob_path = if folder.is_empty() {
                file.filename.clone()
            } else {
                format!("{}/{}", folder, file.filename)
            };
            let size = self
                .put_file(&ObjectPath::from(blob_path.as_str()), &file.path)
                .await
                .map_err(|e| BackupError::upload(format!("Blob upload of {} failed: {}", file.filename, e)))?;

            info!(blob = %blob_path, bytes = size, "Uploaded to blob storage");
            total_bytes += size;
            locators.push(self.locator(&blob_path));
        }

        Ok(UploadReceipt {
            message: format!("Uploaded {} file(s) to blob container {}", files.len(), self.container),
            locators,
            total_bytes,
        })
    }

    async fn put_file(&self, location: &ObjectPath, source: &Path) -> Result<u64> {
        let size = tokio::fs::metadata(source).await?.len();
        if size <= self.block_size as u64 {
            let body = tokio::fs::read(source).await?;
            self.store.put(location, PutPayload::from(body)).await?;
            return Ok(size);
        }

        let upload = self.store.put_multipart(location).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, self.block_size);
        if let Err(e) = self.stream_blocks(&mut writer, source).await {
            if let Err(abort) = writer.abort().await {
                warn!(blob = %location, error = %abort, "Failed to abort block upload");
            }
            return Err(e);
        }
        writer.finish().await?;
        Ok(size)
    }

    async fn stream_blocks(&self, writer: &mut WriteMultipart, source: &Path) -> Result<()> {
        let mut file = tokio::fs::File::open(source).await?;
        let mut buffer = vec![0u8; self.block_size];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                return Ok(());
            }
            writer.wait_for_capacity(MAX_BLOCKS_IN_FLIGHT).await?;
            writer.write(&buffer[..read]);
        }
    }

    pub async fn delete_older_than(&self, folder_path: &str, database: &str, cutoff: NaiveDateTime) -> usize {
        let folder = folder_path.trim_matches('/');
        let prefix = (!folder.is_empty()).then(|| ObjectPath::from(folder));

        let mut candidates = Vec::new();
        let mut listing = self.store.list(prefix.as_ref());
        while let Some(entry) = listing.next().await {
            match entry {
                Ok(meta) => {
                    let expired = meta
                        .location
                        .filename()
                        .and_then(|name| is_expired(name, database, cutoff));
                    if expired == Some(true) {
                        candidates.push(meta.location);
                    }
                }
                Err(e) => {
                    warn!(container = %self.container, folder = %folder, error = %e, "Failed to list blobs");
                    return 0;
                }
            }
        }
        drop(listing);

        let mut deleted = 0;
        for location in candidates {
            match self.store.delete(&location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {
                    info!(blob = %location, "Deleted old blob backup");
                    deleted += 1;
                }
                Err(e) => warn!(blob = %location, error = %e, "Failed to delete old blob backup"),
            }
        }
        deleted
    }
}

/// Storage account name: the first label of the endpoint host.
fn account_from_url(url: &Url) -> Option<String> {
    url.host_str()
        .and_then(|host| host.split('.').next())
        .filter(|account| !account.is_empty())
        .map(str::to_string)
}

/// Decoded SAS query pairs.
fn sas_pairs(url: &Url) -> Vec<(String, String)> {
    url.query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// URL without its query string, safe to log.
fn redacted(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or(""), url.path())
}
