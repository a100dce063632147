use crate::config::StorageConfig;
use crate::embed::FaceEncoding;
use crate::media::MediaReference;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Failure reported by an external collaborator (identity store, media
/// store, check-in sink).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Identity as held by the identity store.
///
/// `face` keeps the stored encoding exactly as persisted so that malformed
/// values can be reported instead of silently dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IdentityRecord {
    pub fn new(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            face: None,
            media_reference: None,
            updated_at: None,
        }
    }

    /// Whether anything was ever enrolled for this identity.
    pub fn has_encoding(&self) -> bool {
        match &self.face {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::Array(items)) => !items.is_empty(),
            Some(serde_json::Value::Object(fields)) => !fields.is_empty(),
            Some(serde_json::Value::String(text)) => !text.is_empty(),
            Some(_) => true,
        }
    }

    /// Record carrying a freshly enrolled encoding.
    pub fn enrolled(
        mut self,
        encoding: &FaceEncoding,
        media_reference: &MediaReference,
    ) -> Self {
        self.face = Some(encoding.to_json());
        self.media_reference = Some(media_reference.to_string());
        self.updated_at = Some(Utc::now());
        self
    }
}

/// External identity store.
pub trait IdentityStore: Send + Sync {
    /// `Ok(None)` when the identity does not exist.
    fn fetch(&self, identity_id: &str) -> Result<Option<IdentityRecord>, CollaboratorError>;

    fn persist(
        &self,
        identity_id: &str,
        encoding: &FaceEncoding,
        media_reference: &MediaReference,
    ) -> Result<(), CollaboratorError>;
}

/// Whether an identity id is safe to use as a file name.
pub fn is_valid_identity_id(identity_id: &str) -> bool {
    !identity_id.is_empty()
        && !identity_id.starts_with('.')
        && identity_id.len() <= 128
        && identity_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
}

/// Identity store keeping one JSON document per identity.
pub struct FileIdentityStore {
    base_path: PathBuf,
}

impl FileIdentityStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(&config.identity_dir)
    }

    fn record_path(&self, identity_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", identity_id))
    }

    fn ensure_dir(&self) -> Result<(), CollaboratorError> {
        if !self.base_path.exists() {
            fs::create_dir_all(&self.base_path)?;
            // Set permissions to 700 (owner only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&self.base_path, fs::Permissions::from_mode(0o700))?;
            }
        }
        Ok(())
    }

    /// Load a record; unknown or unusable ids are absent.
    pub fn load(&self, identity_id: &str) -> Result<Option<IdentityRecord>, CollaboratorError> {
        if !is_valid_identity_id(identity_id) {
            return Ok(None);
        }

        let path = self.record_path(identity_id);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        let record: IdentityRecord = serde_json::from_str(&contents)?;
        Ok(Some(record))
    }

    /// Write a record, replacing any previous version.
    pub fn save(&self, record: &IdentityRecord) -> Result<(), CollaboratorError> {
        if !is_valid_identity_id(&record.identity_id) {
            return Err(CollaboratorError::Rejected(format!(
                "invalid identity id {:?}",
                record.identity_id
            )));
        }
        self.ensure_dir()?;

        let path = self.record_path(&record.identity_id);
        let mut tmp = NamedTempFile::new_in(&self.base_path)?;
        tmp.write_all(&serde_json::to_vec_pretty(record)?)?;
        tmp.as_file().sync_all()?;

        // Set permissions to 600 (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o600))?;
        }

        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Delete a record. Returns false if there was nothing to delete.
    pub fn remove(&self, identity_id: &str) -> Result<bool, CollaboratorError> {
        if !is_valid_identity_id(identity_id) {
            return Ok(false);
        }

        let path = self.record_path(identity_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)?;
        Ok(true)
    }

    /// Ids of all stored identities, sorted.
    pub fn list(&self) -> Result<Vec<String>, CollaboratorError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

impl IdentityStore for FileIdentityStore {
    fn fetch(&self, identity_id: &str) -> Result<Option<IdentityRecord>, CollaboratorError> {
        self.load(identity_id)
    }

    fn persist(
        &self,
        identity_id: &str,
        encoding: &FaceEncoding,
        media_reference: &MediaReference,
    ) -> Result<(), CollaboratorError> {
        let record = self
            .load(identity_id)?
            .unwrap_or_else(|| IdentityRecord::new(identity_id))
            .enrolled(encoding, media_reference);
        self.save(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn encoding() -> FaceEncoding {
        FaceEncoding::from_vec(vec![0.6, 0.8, 0.0])
    }

    #[test]
    fn test_identity_id_validation() {
        assert!(is_valid_identity_id("alice"));
        assert!(is_valid_identity_id("user-42_b@shop.example"));
        assert!(!is_valid_identity_id(""));
        assert!(!is_valid_identity_id("../etc/passwd"));
        assert!(!is_valid_identity_id(".hidden"));
        assert!(!is_valid_identity_id("a/b"));
    }

    #[test]
    fn test_has_encoding() {
        let mut record = IdentityRecord::new("alice");
        assert!(!record.has_encoding());
        record.face = Some(json!(null));
        assert!(!record.has_encoding());
        record.face = Some(json!([]));
        assert!(!record.has_encoding());
        record.face = Some(json!(""));
        assert!(!record.has_encoding());
        record.face = Some(json!({}));
        assert!(!record.has_encoding());
        record.face = Some(json!([0.1]));
        assert!(record.has_encoding());
        // Malformed but present: left for shape validation to reject
        record.face = Some(json!("garbage"));
        assert!(record.has_encoding());
    }

    #[test]
    fn test_persist_and_fetch() {
        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path().join("identities"));

        assert!(store.fetch("alice").unwrap().is_none());

        let media = MediaReference::new("abc123");
        store.persist("alice", &encoding(), &media).unwrap();

        let record = store.fetch("alice").unwrap().unwrap();
        assert_eq!(record.identity_id, "alice");
        assert_eq!(record.media_reference.as_deref(), Some("abc123"));
        assert!(record.updated_at.is_some());

        let face: Vec<f32> = serde_json::from_value(record.face.unwrap()).unwrap();
        assert_eq!(face, vec![0.6, 0.8, 0.0]);
    }

    #[test]
    fn test_persist_keeps_existing_identity() {
        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path());

        store.save(&IdentityRecord::new("bob")).unwrap();
        assert!(!store.fetch("bob").unwrap().unwrap().has_encoding());

        store
            .persist("bob", &encoding(), &MediaReference::new("m1"))
            .unwrap();
        assert!(store.fetch("bob").unwrap().unwrap().has_encoding());
        assert_eq!(store.list().unwrap(), vec!["bob".to_string()]);
    }

    #[test]
    fn test_concurrent_persist_same_identity() {
        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path());

        std::thread::scope(|scope| {
            for t in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for round in 0..50 {
                        let media = MediaReference::new(format!("m-{}-{}", t, round));
                        store.persist("alice", &encoding(), &media).unwrap();
                    }
                });
            }
        });

        let record = store.fetch("alice").unwrap().unwrap();
        assert!(record.has_encoding());
        assert!(record.media_reference.unwrap().starts_with("m-"));
        assert_eq!(store.list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_remove_and_list() {
        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        store.save(&IdentityRecord::new("carol")).unwrap();
        store.save(&IdentityRecord::new("alice")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["alice", "carol"]);

        assert!(store.remove("carol").unwrap());
        assert!(!store.remove("carol").unwrap());
        assert_eq!(store.list().unwrap(), vec!["alice"]);
    }

    #[test]
    fn test_rejects_unsafe_identity_ids() {
        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path());

        assert!(store.fetch("../outside").unwrap().is_none());
        assert!(matches!(
            store.save(&IdentityRecord::new("../outside")),
            Err(CollaboratorError::Rejected(_))
        ));
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dave.json"), "{not json").unwrap();
        let store = FileIdentityStore::new(dir.path());
        assert!(matches!(
            store.fetch("dave"),
            Err(CollaboratorError::Serialization(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_record_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = FileIdentityStore::new(dir.path().join("ids"));
        store.save(&IdentityRecord::new("erin")).unwrap();

        let mode = fs::metadata(dir.path().join("ids").join("erin.json"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
