//! Object Store Adapter: upload/delete/URL-for against a single GCS bucket.
//! Stateless; no retry inside — retries are the caller's policy.

use async_trait::async_trait;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};

/// Errors surfaced by the Object Store Adapter.
#[derive(Debug, Clone, thiserror::Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

/// The Object Store Adapter contract.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// A public, read-only URL for an object already in the bucket. Pure
    /// string construction; does not check the object exists.
    fn url_for(&self, key: &str) -> String;
}

pub struct GcsObjectStore {
    client: Client,
    bucket: String,
}

impl GcsObjectStore {
    /// Build a client from the service-account credentials file named by
    /// `GC_CREDENTIALS_FILE_PATH`, via `ClientConfig::with_auth`.
    pub async fn new(bucket: String) -> Result<Self, StorageError> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| StorageError(format!("failed to build GCS auth config: {e}")))?;
        Ok(Self {
            client: Client::new(config),
            bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn upload(&self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        let request = UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };
        let media = Media::new(key.to_string());
        let upload_type = UploadType::Simple(media);
        self.client
            .upload_object(&request, bytes, &upload_type)
            .await
            .map(|_| ())
            .map_err(|e| StorageError(format!("upload {key} to {}: {e}", self.bucket)))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let request = DeleteObjectRequest {
            bucket: self.bucket.clone(),
            object: key.to_string(),
            ..Default::default()
        };
        match self.client.delete_object(&request).await {
            Ok(()) => Ok(()),
            Err(google_cloud_storage::http::Error::Response(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(StorageError(format!("delete {key} from {}: {e}", self.bucket))),
        }
    }

    fn url_for(&self, key: &str) -> String {
        format!("https://storage.googleapis.com/{}/{key}", self.bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStore {
        bucket: String,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn upload(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), StorageError> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Ok(())
        }
        fn url_for(&self, key: &str) -> String {
            format!("https://storage.googleapis.com/{}/{key}", self.bucket)
        }
    }

    #[test]
    fn url_for_includes_bucket_and_key() {
        let store = FakeStore {
            bucket: "my-bucket".to_string(),
        };
        assert_eq!(
            store.url_for("alpine-1000-output.zip"),
            "https://storage.googleapis.com/my-bucket/alpine-1000-output.zip"
        );
    }
}
