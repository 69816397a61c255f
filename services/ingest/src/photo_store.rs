use crate::config::S3Config;
use crate::error::StoreError;
use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// A time-limited URL for a single PUT or GET of one object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

impl PresignedUrl {
    fn new(url: String, expires_in: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(expires_in)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or_else(Utc::now);
        Self { url, expires_at }
    }
}

/// Object storage for scan photos.
#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Store a photo under `path`, replacing any previous object.
    async fn put_photo(&self, path: &str, body: Bytes, content_type: &str) -> Result<(), StoreError>;

    async fn photo_exists(&self, path: &str) -> Result<bool, StoreError>;

    async fn presign_upload(
        &self,
        path: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUrl, StoreError>;

    async fn presign_download(&self, path: &str, expires_in: Duration) -> Result<PresignedUrl, StoreError>;

    /// Fully qualified location of `path`, e.g. `s3://bucket/path`.
    fn storage_uri(&self, path: &str) -> String;
}

/// S3-backed photo store
pub struct S3PhotoStore {
    client: S3Client,
    bucket: String,
}

impl S3PhotoStore {
    /// Create a new S3 photo store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 photo store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl PhotoStore for S3PhotoStore {
    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_photo(&self, path: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(StoreError::object_storage)?;

        debug!(path = %path, "Photo stored in S3");
        Ok(())
    }

    async fn photo_exists(&self, path: &str) -> Result<bool, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StoreError::object_storage(e))
                }
            }
        }
    }

    async fn presign_upload(
        &self,
        path: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUrl, StoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in).map_err(StoreError::object_storage)?;

        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(StoreError::object_storage)?;

        Ok(PresignedUrl::new(presigned.uri().to_string(), expires_in))
    }

    async fn presign_download(&self, path: &str, expires_in: Duration) -> Result<PresignedUrl, StoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in).map_err(StoreError::object_storage)?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(presigning_config)
            .await
            .map_err(StoreError::object_storage)?;

        Ok(PresignedUrl::new(presigned.uri().to_string(), expires_in))
    }

    fn storage_uri(&self, path: &str) -> String {
        format!("s3://{}/{}", self.bucket, path)
    }
}

#[derive(Debug, Clone)]
struct StoredPhoto {
    bytes: Bytes,
    content_type: String,
}

/// In-process photo store for local runs and tests.
///
/// Presigned URLs use a `memory://` scheme; they identify the object but
/// cannot be fetched over HTTP.
pub struct MemoryPhotoStore {
    bucket: String,
    objects: RwLock<HashMap<String, StoredPhoto>>,
}

impl MemoryPhotoStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Bytes and content type stored at `path`.
    pub fn get(&self, path: &str) -> Option<(Bytes, String)> {
        self.objects
            .read()
            .get(path)
            .map(|photo| (photo.bytes.clone(), photo.content_type.clone()))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn presign(&self, method: &str, path: &str, expires_in: Duration) -> PresignedUrl {
        PresignedUrl::new(
            format!(
                "memory://{}/{}?method={}&expires={}",
                self.bucket,
                path,
                method,
                expires_in.as_secs()
            ),
            expires_in,
        )
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn put_photo(&self, path: &str, body: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.objects.write().insert(
            path.to_string(),
            StoredPhoto {
                bytes: body,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn photo_exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn presign_upload(
        &self,
        path: &str,
        _content_type: &str,
        expires_in: Duration,
    ) -> Result<PresignedUrl, StoreError> {
        Ok(self.presign("PUT", path, expires_in))
    }

    async fn presign_download(&self, path: &str, expires_in: Duration) -> Result<PresignedUrl, StoreError> {
        Ok(self.presign("GET", path, expires_in))
    }

    fn storage_uri(&self, path: &str) -> String {
        format!("memory://{}/{}", self.bucket, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_overwrites() {
        let store = MemoryPhotoStore::new("local");
        let path = "user_uploads/u1/scans/s1/front.jpg";

        assert!(!store.photo_exists(path).await.unwrap());
        store.put_photo(path, Bytes::from_static(b"one"), "image/jpeg").await.unwrap();
        store.put_photo(path, Bytes::from_static(b"two"), "image/jpeg").await.unwrap();

        assert!(store.photo_exists(path).await.unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(path).unwrap().0, Bytes::from_static(b"two"));
        assert_eq!(store.storage_uri(path), format!("memory://local/{path}"));
    }

    #[tokio::test]
    async fn test_memory_presign_expiry() {
        let store = MemoryPhotoStore::new("local");
        let before = Utc::now();
        let url = store
            .presign_upload("a/b.jpg", "image/jpeg", Duration::from_secs(900))
            .await
            .unwrap();

        assert!(url.url.starts_with("memory://local/a/b.jpg?method=PUT"));
        assert!(url.expires_at >= before + chrono::Duration::seconds(900));
    }
}
