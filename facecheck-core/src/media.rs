use crate::config::StorageConfig;
use crate::store::CollaboratorError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Opaque id returned by the media store for an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaReference(String);

impl MediaReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// External media store.
pub trait MediaStore: Send + Sync {
    fn upload(&self, image_bytes: &[u8]) -> Result<MediaReference, CollaboratorError>;
}

/// Content-addressed JPEG store: the reference is the SHA-256 of the bytes.
pub struct DirMediaStore {
    base_path: PathBuf,
}

impl DirMediaStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.media_dir)
    }

    pub fn path_for(&self, reference: &MediaReference) -> PathBuf {
        self.base_path.join(format!("{}.jpg", reference))
    }

    fn digest(bytes: &[u8]) -> MediaReference {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = hasher.finalize();
        MediaReference(hash.iter().map(|b| format!("{:02x}", b)).collect())
    }
}

impl MediaStore for DirMediaStore {
    fn upload(&self, image_bytes: &[u8]) -> Result<MediaReference, CollaboratorError> {
        if image_bytes.is_empty() {
            return Err(CollaboratorError::Rejected("empty upload".to_string()));
        }

        fs::create_dir_all(&self.base_path)?;

        let reference = Self::digest(image_bytes);
        let path = self.path_for(&reference);
        if path.exists() {
            log::debug!("Media {} already stored", reference);
        } else {
            fs::write(&path, image_bytes)?;
        }
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_upload_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = DirMediaStore::new(dir.path().join("media"));

        let first = store.upload(b"jpeg bytes").unwrap();
        let again = store.upload(b"jpeg bytes").unwrap();
        let other = store.upload(b"other bytes").unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(first.as_str().len(), 64);
        assert_eq!(fs::read(store.path_for(&first)).unwrap(), b"jpeg bytes");
    }

    #[test]
    fn test_known_digest() {
        let reference = DirMediaStore::digest(b"abc");
        assert_eq!(
            reference.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_rejects_empty_upload() {
        let dir = TempDir::new().unwrap();
        let store = DirMediaStore::new(dir.path());
        assert!(matches!(
            store.upload(&[]),
            Err(CollaboratorError::Rejected(_))
        ));
    }
}
