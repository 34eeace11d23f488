use async_trait::async_trait;
use log::{error, info, warn};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::config::{AppConfig, BlobBackend, S3Config};
use crate::models::Id;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("duplicate")]
    Duplicate,
    #[error("not_found")]
    NotFound,
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("other: {0}")]
    Other(String),
}

/// Opaque binary storage for post photos. `put` returns a locator that is
/// later handed back to `load`/`delete`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Must fail with `Duplicate` rather than overwrite an existing key.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, BlobStoreError>;
    async fn load(&self, locator: &str) -> Result<(Vec<u8>, String), BlobStoreError>;
    /// Idempotent: an absent locator is not an error.
    async fn delete(&self, locator: &str) -> Result<(), BlobStoreError>;
}

fn sniff_mime(bytes: &[u8]) -> String {
    infer::get(bytes)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".into())
}

/// Storage key for one photo of `post_id`: scoped by post, randomized
/// suffix, extension from the sniffed content type.
pub fn blob_key(post_id: Id, bytes: &[u8]) -> String {
    let ext = infer::get(bytes).map(|t| t.extension()).unwrap_or("bin");
    format!("posts/{post_id}/{}.{ext}", uuid::Uuid::new_v4().simple())
}

/// Keys and locator tails must stay relative and inside the store root.
fn safe_relative(key: &str) -> Option<PathBuf> {
    let path = Path::new(key);
    if key.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(path.to_path_buf())
}

// ---------------- Local disk implementation ----------------
pub struct FsBlobStore {
    root: PathBuf,
    url_prefix: String,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: &str) -> Self {
        Self { root: root.into(), url_prefix: url_prefix.trim_end_matches('/').to_string() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for_key(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        safe_relative(key)
            .map(|rel| self.root.join(rel))
            .ok_or_else(|| BlobStoreError::InvalidLocator(key.to_string()))
    }

    fn path_for_locator(&self, locator: &str) -> Result<PathBuf, BlobStoreError> {
        let tail = locator
            .strip_prefix(&self.url_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| BlobStoreError::InvalidLocator(locator.to_string()))?;
        self.path_for_key(tail)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, BlobStoreError> {
        let path = self.path_for_key(key)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BlobStoreError::Other(format!("create_dir_all {}: {e}", dir.display())))?;
        }
        let mut file = match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(BlobStoreError::Duplicate),
            Err(e) => {
                error!("open failed path={} err={e}", path.display());
                return Err(BlobStoreError::Other(e.to_string()));
            }
        };
        let written = async {
            file.write_all(bytes).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            error!("write failed path={} err={e}", path.display());
            let _ = tokio::fs::remove_file(&path).await;
            return Err(BlobStoreError::Other(e.to_string()));
        }
        Ok(format!("{}/{}", self.url_prefix, key))
    }

    async fn load(&self, locator: &str) -> Result<(Vec<u8>, String), BlobStoreError> {
        let path = self.path_for_locator(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mime = sniff_mime(&bytes);
                Ok((bytes, mime))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobStoreError::NotFound),
            Err(e) => Err(BlobStoreError::Other(e.to_string())),
        }
    }

    async fn delete(&self, locator: &str) -> Result<(), BlobStoreError> {
        let path = self.path_for_locator(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobStoreError::Other(e.to_string())),
        }
    }
}

// ---------------- S3 Implementation (MinIO compatible) ----------------
pub struct S3BlobStore {
    bucket: String,
    client: aws_sdk_s3::Client,
    public_base: String,
}

impl S3BlobStore {
    pub async fn new(cfg: &S3Config) -> anyhow::Result<Self> {
        use aws_credential_types::provider::SharedCredentialsProvider;
        use aws_credential_types::Credentials;

        let bucket = cfg.bucket.clone();
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(cfg.region.clone()));
        loader = loader.endpoint_url(&cfg.endpoint);
        if let (Some(access), Some(secret)) = (&cfg.access_key, &cfg.secret_key) {
            let creds = Credentials::new(access, secret, None, None, "static");
            loader = loader.credentials_provider(SharedCredentialsProvider::new(creds));
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(true)
            .build();
        let client = aws_sdk_s3::Client::from_conf(s3_conf);
        info!("Initialized S3/MinIO client (path-style addressing enabled)");

        if let Err(e) = client.head_bucket().bucket(&bucket).send().await {
            warn!("head_bucket failed for '{bucket}' (will attempt create): {e:?}");
            let max_attempts = 8u32;
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match client.create_bucket().bucket(&bucket).send().await {
                    Ok(_) => {
                        info!("created bucket '{bucket}' (attempt {attempt})");
                        break;
                    }
                    Err(e2) if attempt >= max_attempts => {
                        error!("create_bucket failed for '{bucket}' after {attempt} attempts: {e2:?}");
                        return Err(anyhow::anyhow!("failed to ensure bucket '{bucket}': {e2}"));
                    }
                    Err(e2) => {
                        let backoff_ms = 200 * attempt.pow(2);
                        warn!("create_bucket attempt {attempt} failed for '{bucket}': {e2:?} (retrying in {backoff_ms}ms)");
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms as u64)).await;
                    }
                }
            }
        }

        Ok(Self { bucket, client, public_base: cfg.public_url.clone() })
    }

    fn key_for_locator(&self, locator: &str) -> Result<String, BlobStoreError> {
        locator
            .strip_prefix(&self.public_base)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|key| safe_relative(key).is_some())
            .map(str::to_string)
            .ok_or_else(|| BlobStoreError::InvalidLocator(locator.to_string()))
    }
}

/// Only a missing key is `NotFound`; auth and transport failures stay errors.
fn get_object_error(e: aws_sdk_s3::operation::get_object::GetObjectError) -> BlobStoreError {
    if e.is_no_such_key() {
        BlobStoreError::NotFound
    } else {
        error!("get_object failed err={e:?}");
        BlobStoreError::Other(e.to_string())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, BlobStoreError> {
        use aws_sdk_s3::primitives::ByteStream;
        if safe_relative(key).is_none() {
            return Err(BlobStoreError::InvalidLocator(key.to_string()));
        }
        if self.client.head_object().bucket(&self.bucket).key(key).send().await.is_ok() {
            return Err(BlobStoreError::Duplicate);
        }
        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes.to_vec()))
            .content_type(sniff_mime(bytes));
        if let Err(e) = put.send().await {
            error!("put_object failed key={key} bucket={} err={:?}", self.bucket, e);
            let hint = if e.to_string().contains("NoSuchBucket") {
                " (bucket missing or not yet propagated)"
            } else if e.to_string().contains("AccessDenied") {
                " (check S3_ACCESS_KEY/S3_SECRET_KEY permissions)"
            } else {
                ""
            };
            return Err(BlobStoreError::Other(format!("{e}{hint}")));
        }
        Ok(format!("{}/{}", self.public_base, key))
    }

    async fn load(&self, locator: &str) -> Result<(Vec<u8>, String), BlobStoreError> {
        let key = self.key_for_locator(locator)?;
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| get_object_error(e.into_service_error()))?;
        let data = obj
            .body
            .collect()
            .await
            .map_err(|e| BlobStoreError::Other(e.to_string()))?;
        let bytes = data.into_bytes().to_vec();
        let mime = sniff_mime(&bytes);
        Ok((bytes, mime))
    }

    async fn delete(&self, locator: &str) -> Result<(), BlobStoreError> {
        let key = self.key_for_locator(locator)?;
        // S3 DeleteObject already succeeds for absent keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| BlobStoreError::Other(e.to_string()))?;
        Ok(())
    }
}

pub async fn build_blob_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn BlobStore>> {
    match cfg.blob_backend {
        BlobBackend::Fs => {
            info!("Using local blob store at '{}'", cfg.upload_dir.display());
            Ok(Arc::new(FsBlobStore::new(&cfg.upload_dir, &cfg.upload_url_prefix)))
        }
        BlobBackend::S3 => {
            let s3 = cfg.s3.as_ref().ok_or_else(|| anyhow::anyhow!("BLOB_BACKEND=s3 without S3 settings"))?;
            Ok(Arc::new(S3BlobStore::new(s3).await?))
        }
    }
}
