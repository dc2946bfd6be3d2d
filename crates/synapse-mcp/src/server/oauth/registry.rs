//! Durable client registry.
//!
//! Dynamically registered clients are persisted here so they survive
//! restarts. The file backend stores one JSON object keyed by `client_id`
//! and replaces it atomically (temp file + rename) on every write.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::types::ClientRegistration;
use crate::error::{RegistrationError, StorageResult};

/// Persistent store of client registrations.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Read every persisted registration.
    async fn load_all(&self) -> StorageResult<Vec<ClientRegistration>>;

    /// Upsert keyed by `client_id`.
    async fn save(&self, registration: &ClientRegistration) -> StorageResult<()>;

    /// Delete by id. Absent ids are not an error.
    async fn remove(&self, client_id: &str) -> StorageResult<()>;
}

/// JSON file registry.
pub struct FileClientRegistry {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileClientRegistry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> StorageResult<BTreeMap<String, ClientRegistration>> {
        match fs::read(&self.path).await {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &BTreeMap<String, ClientRegistration>) -> StorageResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(map)?;

        // Write atomically via temp file, flushed to disk before the rename
        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), clients = map.len(), "Saved client registry");
        Ok(())
    }
}

#[async_trait]
impl ClientRegistry for FileClientRegistry {
    async fn load_all(&self) -> StorageResult<Vec<ClientRegistration>> {
        Ok(self.read_map().await?.into_values().collect())
    }

    async fn save(&self, registration: &ClientRegistration) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(registration.client_id.clone(), registration.clone());
        self.write_map(&map).await
    }

    async fn remove(&self, client_id: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.read_map().await?;
        if map.remove(client_id).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileClientRegistry").field("path", &self.path).finish()
    }
}

/// Process-local registry, for tests and read-only deployments.
#[derive(Debug, Default)]
pub struct InMemoryClientRegistry {
    records: RwLock<HashMap<String, ClientRegistration>>,
}

impl InMemoryClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientRegistry for InMemoryClientRegistry {
    async fn load_all(&self) -> StorageResult<Vec<ClientRegistration>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn save(&self, registration: &ClientRegistration) -> StorageResult<()> {
        self.records
            .write()
            .await
            .insert(registration.client_id.clone(), registration.clone());
        Ok(())
    }

    async fn remove(&self, client_id: &str) -> StorageResult<()> {
        self.records.write().await.remove(client_id);
        Ok(())
    }
}

/// Parse the static client list (a JSON array of registrations).
///
/// Each entry is normalized and validated like a dynamic registration.
pub fn parse_static_clients(json: &str) -> Result<Vec<ClientRegistration>, RegistrationError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut clients: Vec<ClientRegistration> = serde_json::from_str(json)
        .map_err(|e| RegistrationError::invalid(format!("static client list: {e}")))?;
    for client in &mut clients {
        client.normalize_grant_types();
        client.validate()?;
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registration(id: &str) -> ClientRegistration {
        let mut reg = ClientRegistration::new(id, vec!["http://127.0.0.1:5000/callback".into()]);
        reg.normalize_grant_types();
        reg
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = FileClientRegistry::new(dir.path().join("clients.json"));
        assert!(registry.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_is_upsert_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("clients.json");

        let registry = FileClientRegistry::new(&path);
        registry.save(&registration("client-a")).await.unwrap();
        let mut updated = registration("client-a");
        updated.client_name = Some("Renamed".into());
        registry.save(&updated).await.unwrap();
        registry.save(&registration("client-b")).await.unwrap();

        let reopened = FileClientRegistry::new(&path);
        let mut all = reopened.load_all().await.unwrap();
        all.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].client_name.as_deref(), Some("Renamed"));

        // No temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_layout_is_keyed_by_client_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clients.json");
        FileClientRegistry::new(&path).save(&registration("client-xyz")).await.unwrap();

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved["client-xyz"]["client_id"], "client-xyz");
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = FileClientRegistry::new(dir.path().join("clients.json"));
        registry.save(&registration("gone")).await.unwrap();

        registry.remove("gone").await.unwrap();
        registry.remove("gone").await.unwrap();
        registry.remove("never-existed").await.unwrap();
        assert!(registry.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clients.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(FileClientRegistry::new(&path).load_all().await.is_err());
    }

    #[test]
    fn test_parse_static_clients() {
        let clients = parse_static_clients(
            r#"[{"client_id":"static-client","redirect_uris":["https://claude.ai/api/mcp/auth_callback"]}]"#,
        )
        .unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].grant_types, vec!["authorization_code", "refresh_token"]);

        assert!(parse_static_clients("").unwrap().is_empty());
        assert!(parse_static_clients("{}").is_err());
        assert!(parse_static_clients(r#"[{"client_id":"x","redirect_uris":[]}]"#).is_err());
    }
}
