//! S3 and S3-compatible object storage (MinIO, Storj, Wasabi).

use super::{remote_join, BackendConfig, RemoteEntry, StorageBackend};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use chrono::DateTime;
use std::path::Path;

pub struct S3Backend {
    client: S3Client,
    bucket: String,
    prefix: String,
}

impl S3Backend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let BackendConfig::S3 {
            endpoint,
            region,
            bucket,
            access_key_id,
            secret_access_key,
            prefix,
        } = config
        else {
            return Err(EngineError::config("not an S3 destination"));
        };
        if bucket.is_empty() {
            return Err(EngineError::config("S3 destination needs a bucket"));
        }

        let credentials = Credentials::new(access_key_id, secret_access_key, None, None, "backup-engine");
        let mut builder = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.clone()))
            .credentials_provider(credentials);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: S3Client::from_conf(builder.build()),
            bucket: bucket.clone(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    fn key(&self, remote_path: &str) -> String {
        remote_join(&self.prefix, remote_path)
    }

    fn error(&self, e: impl std::fmt::Display) -> EngineError {
        EngineError::replication(format!("s3://{}", self.bucket), e)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    async fn test_connection(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| self.error(e.into_service_error()))?;
        Ok(())
    }

    async fn upload(&self, file: &Path, remote_path: &str) -> Result<u64> {
        let size = tokio::fs::metadata(file).await?.len();
        let body = ByteStream::from_path(file)
            .await
            .map_err(|e| EngineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(remote_path))
            .body(body)
            .content_length(size as i64)
            .send()
            .await
            .map_err(|e| self.error(e.into_service_error()))?;
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>> {
        let full_prefix = self.key(prefix);
        let strip = if self.prefix.is_empty() { 0 } else { self.prefix.len() + 1 };
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&full_prefix);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let resp = request
                .send()
                .await
                .map_err(|e| self.error(e.into_service_error()))?;

            for object in resp.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(RemoteEntry {
                    path: key.get(strip..).unwrap_or(key).to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        Ok(entries)
    }

    async fn delete(&self, remote_path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(remote_path))
            .send()
            .await
            .map_err(|e| self.error(e.into_service_error()))?;
        Ok(())
    }
}
