//! # Object Storage
//!
//! Key-addressed blobs for product images and order documents.
//!
//! ```text
//! ┌──────────────┐  put/get/list/delete  ┌──────────────────────────────┐
//! │   caller     │ ────────────────────► │ dyn ObjectStore              │
//! └──────────────┘                       │  ├─ LocalObjectStore (root/) │
//!                                        │  └─ s3 / minio: Unavailable  │
//!                                        └──────────────────────────────┘
//! ```
//!
//! Keys are relative, `/`-separated paths such as `products/p-1/front.jpg`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::types::new_id;
use keel_core::ValidationError;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use crate::config::{StorageConfig, StorageProvider};
use crate::error::{EngineError, EngineResult};

const MAX_KEY_LEN: usize = 512;

/// Metadata of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes `data` under `key`, replacing any previous object.
    async fn put(&self, key: &str, data: Vec<u8>) -> EngineResult<ObjectInfo>;

    async fn get(&self, key: &str) -> EngineResult<Vec<u8>>;

    /// Objects whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> EngineResult<Vec<ObjectInfo>>;

    async fn delete(&self, key: &str) -> EngineResult<()>;
}

/// Builds the store selected by `config`.
pub fn from_config(config: &StorageConfig) -> EngineResult<Arc<dyn ObjectStore>> {
    match config.provider {
        StorageProvider::Local => Ok(Arc::new(LocalObjectStore::new(&config.root))),
        provider @ (StorageProvider::S3 | StorageProvider::Minio) => {
            warn!(%provider, bucket = ?config.bucket, "Object storage provider not built in");
            Err(EngineError::Unavailable(format!(
                "{} object storage is not available in this build",
                provider
            )))
        }
    }
}

/// Checks that `key` is a relative path that stays under the root.
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    let invalid = |reason: &str| ValidationError::Invalid {
        field: "key".into(),
        reason: reason.to_string(),
    };
    if key.trim().is_empty() {
        return Err(ValidationError::Required { field: "key".into() });
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "key".into(),
            max: MAX_KEY_LEN,
        });
    }
    if key.contains('\\') || key.ends_with('/') {
        return Err(invalid("must be a /-separated file path"));
    }
    let normal = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !normal {
        return Err(invalid("must be relative and must not contain '.' or '..'"));
    }
    Ok(())
}

// =============================================================================
// Local Provider
// =============================================================================

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        LocalObjectStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> EngineResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn info(&self, key: String, path: &Path) -> EngineResult<ObjectInfo> {
        let meta = fs::metadata(path).await?;
        Ok(ObjectInfo {
            key,
            size: meta.len(),
            modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> EngineResult<ObjectInfo> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // Readers never see a partial object.
        let staging = path.with_extension(format!("{}.partial", new_id()));
        fs::write(&staging, &data).await?;
        fs::rename(&staging, &path).await?;
        debug!(key, bytes = data.len(), "Stored object");
        self.info(key.to_string(), &path).await
    }

    async fn get(&self, key: &str) -> EngineResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ObjectNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> EngineResult<Vec<ObjectInfo>> {
        let mut found = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(".partial") || !key.starts_with(prefix) {
                    continue;
                }
                found.push(self.info(key, &path).await?);
            }
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }

    async fn delete(&self, key: &str) -> EngineResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "Deleted object");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EngineError::ObjectNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ErrorCode;

    #[test]
    fn test_key_rules() {
        assert!(validate_key("products/p-1/front.jpg").is_ok());
        assert!(validate_key("invoice.pdf").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("a/../../b").is_err());
        assert!(validate_key("./a").is_err());
        assert!(validate_key("a\\b").is_err());
        assert!(validate_key("dir/").is_err());
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path());

        let info = store.put("orders/o-1/invoice.pdf", b"%PDF".to_vec()).await.unwrap();
        assert_eq!(info.size, 4);
        store.put("orders/o-2/invoice.pdf", b"x".to_vec()).await.unwrap();
        store.put("products/p-1.jpg", b"jpg".to_vec()).await.unwrap();

        assert_eq!(store.get("orders/o-1/invoice.pdf").await.unwrap(), b"%PDF");

        let keys: Vec<String> = store
            .list("orders/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["orders/o-1/invoice.pdf", "orders/o-2/invoice.pdf"]);
        assert_eq!(store.list("").await.unwrap().len(), 3);

        store.delete("orders/o-1/invoice.pdf").await.unwrap();
        let err = store.get("orders/o-1/invoice.pdf").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = store.delete("orders/o-1/invoice.pdf").await.unwrap_err();
        assert!(matches!(err, EngineError::ObjectNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("not-yet"));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[test]
    fn test_remote_providers_unavailable() {
        let config = StorageConfig {
            provider: StorageProvider::Minio,
            bucket: Some("keel".into()),
            endpoint: Some("http://localhost:9000".into()),
            ..StorageConfig::default()
        };
        let err = from_config(&config).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        let local = from_config(&StorageConfig::default());
        assert!(local.is_ok());
    }
}
