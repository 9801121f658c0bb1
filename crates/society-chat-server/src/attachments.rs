//! On-disk attachment storage for file messages.
//!
//! Each upload is written as `<uuid>` with its content type in a `<uuid>.type`
//! sidecar. Clients only ever see the public URL built from
//! `PUBLIC_BASE_URL`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const ROUTE_PREFIX: &str = "/attachments/";

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .or_else(|_| target.strip_prefix(&canonical_base))
        .unwrap_or(target)
        .components()
    {
        match component {
            std::path::Component::Normal(c) => resolved.push(c),
            std::path::Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Metadata returned after a successful upload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredAttachment {
    pub id: Uuid,
    pub url: String,
    pub mime_type: String,
    pub size: usize,
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    base_path: PathBuf,
    max_size: usize,
    public_base_url: String,
}

impl AttachmentStore {
    pub async fn new(
        base_path: PathBuf,
        max_size: usize,
        public_base_url: impl Into<String>,
    ) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!(
                "Failed to create attachment directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Attachment store initialized");

        Ok(Self {
            base_path,
            max_size,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store(
        &self,
        data: &[u8],
        mime_type: Option<&str>,
    ) -> Result<StoredAttachment, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::AttachmentTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let mime_type = mime_type
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        let path = self.safe_path(&id.to_string())?;
        fs::write(&path, data).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to write attachment {}: {}", id, e))
        })?;
        fs::write(self.safe_path(&format!("{id}.type"))?, mime_type.as_bytes())
            .await
            .map_err(|e| {
                ServerError::AttachmentStorage(format!(
                    "Failed to write content type for {}: {}",
                    id, e
                ))
            })?;

        debug!(id = %id, size = data.len(), mime = %mime_type, "Stored attachment");

        Ok(StoredAttachment {
            id,
            url: self.url_for(id),
            mime_type,
            size: data.len(),
        })
    }

    /// Returns the bytes and content type.
    pub async fn get(&self, id: Uuid) -> Result<(Vec<u8>, String), ServerError> {
        let path = self.safe_path(&id.to_string())?;
        if !path.exists() {
            return Err(ServerError::AttachmentNotFound(id));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to read attachment {}: {}", id, e))
        })?;
        let mime_type = fs::read_to_string(self.safe_path(&format!("{id}.type"))?)
            .await
            .unwrap_or_else(|_| DEFAULT_CONTENT_TYPE.to_string());

        Ok((data, mime_type))
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ServerError> {
        let path = self.safe_path(&id.to_string())?;
        if !path.exists() {
            return Err(ServerError::AttachmentNotFound(id));
        }

        fs::remove_file(&path).await.map_err(|e| {
            ServerError::AttachmentStorage(format!("Failed to delete attachment {}: {}", id, e))
        })?;
        let _ = fs::remove_file(self.safe_path(&format!("{id}.type"))?).await;

        debug!(id = %id, "Deleted attachment");
        Ok(())
    }

    pub fn url_for(&self, id: Uuid) -> String {
        format!("{}{}{}", self.public_base_url, ROUTE_PREFIX, id)
    }

    /// Recover the id from a URL this store handed out. Foreign URLs yield `None`.
    pub fn id_from_url(&self, url: &str) -> Option<Uuid> {
        let rest = url.strip_prefix(&self.public_base_url)?;
        let id = rest.strip_prefix(ROUTE_PREFIX)?;
        Uuid::parse_str(id).ok()
    }

    fn safe_path(&self, file_name: &str) -> Result<PathBuf, ServerError> {
        if file_name.contains('/') || file_name.contains('\\') || file_name.contains("..") {
            return Err(ServerError::BadRequest("Path traversal detected".to_string()));
        }
        ensure_within(&self.base_path, &self.base_path.join(file_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (AttachmentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::new(dir.path().to_path_buf(), 1024, "http://chat.test/")
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;

        let stored = store.store(b"png-bytes", Some("image/png")).await.unwrap();
        assert_eq!(stored.url, format!("http://chat.test/attachments/{}", stored.id));

        let (data, mime) = store.get(stored.id).await.unwrap();
        assert_eq!(data, b"png-bytes");
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn test_default_content_type() {
        let (store, _dir) = test_store().await;
        let stored = store.store(b"blob", None).await.unwrap();
        assert_eq!(stored.mime_type, DEFAULT_CONTENT_TYPE);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _dir) = test_store().await;
        let stored = store.store(b"delete-me", Some("text/plain")).await.unwrap();

        store.delete(stored.id).await.unwrap();
        assert!(matches!(
            store.get(stored.id).await,
            Err(ServerError::AttachmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_limits() {
        let (store, _dir) = test_store().await;
        assert!(store.store(b"", None).await.is_err());
        assert!(matches!(
            store.store(&[0u8; 2048], None).await,
            Err(ServerError::AttachmentTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_id_from_url() {
        let (store, _dir) = test_store().await;
        let id = Uuid::new_v4();
        assert_eq!(store.id_from_url(&store.url_for(id)), Some(id));
        assert_eq!(store.id_from_url("https://cdn.example.org/x.png"), None);
    }
}
