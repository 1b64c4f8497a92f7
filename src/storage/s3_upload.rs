// dbbackup/src/storage/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::primitives::ByteStream;
use std::io::{self, BufWriter, Write};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{Storage, StorageWriter, closed_writer_error};
use crate::config::SpacesConfig;
use crate::errors::StorageError;

/// S3-compatible object storage (AWS S3, DigitalOcean Spaces, MinIO).
///
/// Objects are spooled to a temporary file while the dump runs and uploaded
/// in one `PutObject` when the writer is closed. A writer that is dropped
/// without being closed uploads nothing.
#[derive(Clone)]
pub struct S3Storage {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3Storage {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest());
        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(region) = &spaces_config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let (Some(key_id), Some(secret)) = (
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
        ) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None, // expiry
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        Self {
            client: s3::Client::new(&sdk_config),
            bucket: spaces_config.bucket_name.clone(),
            folder_prefix: spaces_config.folder_prefix.clone(),
        }
    }

    fn object_key(&self, key: &str) -> String {
        object_key(self.folder_prefix.as_deref(), key)
    }
}

fn object_key(prefix: Option<&str>, key: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{key}"),
        None => key.to_string(),
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn open_writer(&self, key: &str) -> Result<Box<dyn StorageWriter>, StorageError> {
        let spool = NamedTempFile::new().map_err(|source| StorageError::Open {
            key: key.to_string(),
            source,
        })?;
        let object_key = self.object_key(key);
        debug!(
            bucket = %self.bucket,
            key = %object_key,
            spool = %spool.path().display(),
            "Spooling object for upload"
        );

        Ok(Box::new(S3Writer {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: object_key,
            spool: Some(BufWriter::new(spool)),
        }))
    }

    async fn check(&self) -> Result<(), StorageError> {
        // HeadBucket needs fewer permissions than ListBuckets.
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Target bucket is accessible");
                Ok(())
            }
            Err(e) => {
                warn!(bucket = %self.bucket, error = %e, "Could not verify target bucket");
                Err(StorageError::Unavailable(format!(
                    "could not access bucket '{}': {e}",
                    self.bucket
                )))
            }
        }
    }
}

struct S3Writer {
    client: s3::Client,
    bucket: String,
    key: String,
    spool: Option<BufWriter<NamedTempFile>>,
}

impl Write for S3Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.spool.as_mut() {
            Some(spool) => spool.write(buf),
            None => Err(closed_writer_error()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.spool.as_mut() {
            Some(spool) => spool.flush(),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageWriter for S3Writer {
    async fn close(&mut self) -> io::Result<()> {
        let Some(spool) = self.spool.take() else {
            return Ok(());
        };
        let spool = spool.into_inner().map_err(|e| e.into_error())?;

        let body = ByteStream::from_path(spool.path()).await.map_err(|e| {
            io::Error::other(format!(
                "failed to read spooled object {}: {e}",
                spool.path().display()
            ))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                io::Error::other(format!(
                    "failed to upload to S3 bucket {} with key {}: {e}",
                    self.bucket, self.key
                ))
            })?;

        info!(bucket = %self.bucket, key = %self.key, "Uploaded backup object");
        Ok(())
    }

    async fn abort(&mut self) -> io::Result<()> {
        // Dropping the spool deletes the temporary file; nothing is uploaded.
        if self.spool.take().is_some() {
            debug!(bucket = %self.bucket, key = %self.key, "Discarded spooled object");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_prefix() {
        assert_eq!(object_key(None, "users.sql.gz"), "users.sql.gz");
        assert_eq!(object_key(Some(""), "users.sql.gz"), "users.sql.gz");
        assert_eq!(object_key(Some("nightly/"), "users.sql.gz"), "nightly/users.sql.gz");
        assert_eq!(object_key(Some("/a/b"), "users.sql.gz"), "a/b/users.sql.gz");
    }
}
