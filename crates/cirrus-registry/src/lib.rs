//! Function registry: metadata rows in the state store, code blobs on disk.
//!
//! Each function owns a directory `<storage_dir>/<id>/` holding `handler.py`,
//! `requirements.txt` and `function.yaml`. Updates replace the blobs and bump
//! the patch version; deletion tombstones the row and removes the blobs, so
//! execution history stays resolvable while the code is gone.

use std::path::PathBuf;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use cirrus_common::{bump_patch_version, Error, FunctionCode, FunctionMetadata, Result};
use cirrus_state::{FunctionRecord, StateStore};

const HANDLER_FILE: &str = "handler.py";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const CONFIG_FILE: &str = "function.yaml";

/// Registration request, as received from the API layer.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterFunction {
    pub name: String,
    pub runtime: String,
    pub memory: u32,
    pub timeout: u64,
    pub code: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub config: String,
}

pub struct FunctionRegistry {
    state: StateStore,
    storage_dir: PathBuf,
}

impl FunctionRegistry {
    pub fn new(state: StateStore, storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self { state, storage_dir })
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn register(&self, request: RegisterFunction) -> Result<FunctionMetadata> {
        if request.name.is_empty() {
            return Err(Error::InvalidPayload("function name is required".to_string()));
        }
        if self
            .state
            .get_function_by_name(&request.name)
            .await?
            .is_some()
        {
            return Err(Error::FunctionAlreadyExists(request.name));
        }

        let id = Uuid::new_v4().to_string();
        self.write_blobs(&id, &request.code, &request.requirements, &request.config)
            .await?;

        let now = Utc::now();
        let record = FunctionRecord {
            id: id.clone(),
            name: request.name,
            runtime: request.runtime,
            memory: request.memory as i64,
            timeout: request.timeout as i64,
            created_at: now,
            updated_at: now,
            status: "ready".to_string(),
            version: "1.0.0".to_string(),
            code: request.code,
        };

        if let Err(err) = self.state.save_function(&record).await {
            // Roll the blobs back so a failed registration leaves no trace.
            let _ = tokio::fs::remove_dir_all(self.function_dir(&id)).await;
            return Err(err);
        }

        info!(%id, name = %record.name, "Registered function");
        Ok(to_metadata(&record))
    }

    /// Replace the code payload and bump the patch version.
    #[instrument(skip(self, code, requirements, config))]
    pub async fn update(
        &self,
        id: &str,
        code: String,
        requirements: String,
        config: String,
    ) -> Result<FunctionMetadata> {
        let mut record = self.live_record(id).await?;

        self.write_blobs(id, &code, &requirements, &config).await?;

        record.code = code;
        record.version = bump_patch_version(&record.version);
        record.updated_at = Utc::now();
        self.state.save_function(&record).await?;

        info!(%id, version = %record.version, "Updated function");
        Ok(to_metadata(&record))
    }

    pub async fn get_metadata(&self, id: &str) -> Result<FunctionMetadata> {
        Ok(to_metadata(&self.live_record(id).await?))
    }

    pub async fn get_metadata_by_name(&self, name: &str) -> Result<FunctionMetadata> {
        let record = self
            .state
            .get_function_by_name(name)
            .await?
            .filter(|r| r.status != "deleted")
            .ok_or_else(|| Error::FunctionNotFound(name.to_string()))?;
        Ok(to_metadata(&record))
    }

    /// Code payload for dispatch; read once per invocation.
    pub async fn get_code(&self, id: &str) -> Result<FunctionCode> {
        self.live_record(id).await?;

        let dir = self.function_dir(id);
        let code = tokio::fs::read_to_string(dir.join(HANDLER_FILE)).await?;
        let requirements = tokio::fs::read_to_string(dir.join(REQUIREMENTS_FILE)).await?;
        let config = tokio::fs::read_to_string(dir.join(CONFIG_FILE)).await?;
        Ok(FunctionCode {
            code,
            requirements,
            config,
        })
    }

    pub async fn list(&self) -> Result<Vec<FunctionMetadata>> {
        Ok(self
            .state
            .list_functions()
            .await?
            .iter()
            .filter(|r| r.status != "deleted")
            .map(to_metadata)
            .collect())
    }

    /// Tombstone the row and remove the stored code.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.state.get_function(id).await?.is_none() {
            return Err(Error::FunctionNotFound(id.to_string()));
        }

        if let Err(err) = tokio::fs::remove_dir_all(self.function_dir(id)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %err, %id, "Failed to remove function blobs");
            }
        }
        self.state.mark_function_deleted(id).await?;
        info!(%id, "Deleted function");
        Ok(())
    }

    async fn live_record(&self, id: &str) -> Result<FunctionRecord> {
        self.state
            .get_function(id)
            .await?
            .filter(|r| r.status != "deleted")
            .ok_or_else(|| Error::FunctionNotFound(id.to_string()))
    }

    fn function_dir(&self, id: &str) -> PathBuf {
        self.storage_dir.join(id)
    }

    async fn write_blobs(
        &self,
        id: &str,
        code: &str,
        requirements: &str,
        config: &str,
    ) -> Result<()> {
        let dir = self.function_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(HANDLER_FILE), code).await?;
        tokio::fs::write(dir.join(REQUIREMENTS_FILE), requirements).await?;
        tokio::fs::write(dir.join(CONFIG_FILE), config).await?;
        Ok(())
    }
}

fn to_metadata(record: &FunctionRecord) -> FunctionMetadata {
    FunctionMetadata {
        id: record.id.clone(),
        name: record.name.clone(),
        runtime: record.runtime.clone(),
        memory: record.memory as u32,
        timeout: record.timeout as u64,
        created_at: record.created_at,
        updated_at: record.updated_at,
        status: record.status.clone(),
        version: record.version.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (FunctionRegistry, tempfile::TempDir) {
        let state = StateStore::connect_in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let registry = FunctionRegistry::new(state, tmp.path()).unwrap();
        (registry, tmp)
    }

    fn greet_request() -> RegisterFunction {
        RegisterFunction {
            name: "greet".to_string(),
            runtime: "python3.9".to_string(),
            memory: 128,
            timeout: 30,
            code: "def handler(event, context):\n    return {\"hi\": event.get(\"name\", \"world\")}\n"
                .to_string(),
            requirements: String::new(),
            config: String::new(),
        }
    }

    #[tokio::test]
    async fn test_register_writes_blobs_and_metadata() {
        let (registry, tmp) = registry().await;
        let meta = registry.register(greet_request()).await.unwrap();

        assert_eq!(meta.name, "greet");
        assert_eq!(meta.version, "1.0.0");
        assert_eq!(meta.status, "ready");

        let dir = tmp.path().join(&meta.id);
        assert!(dir.join("handler.py").exists());
        assert!(dir.join("requirements.txt").exists());
        assert!(dir.join("function.yaml").exists());
    }

    #[tokio::test]
    async fn test_register_duplicate_name() {
        let (registry, _tmp) = registry().await;
        registry.register(greet_request()).await.unwrap();

        let err = registry.register(greet_request()).await.unwrap_err();
        assert!(matches!(err, Error::FunctionAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_patch_and_rewrites_code() {
        let (registry, _tmp) = registry().await;
        let meta = registry.register(greet_request()).await.unwrap();

        let updated = registry
            .update(
                &meta.id,
                "def handler(event, context):\n    return {\"hi\": \"v2\"}\n".to_string(),
                "requests\n".to_string(),
                String::new(),
            )
            .await
            .unwrap();
        assert_eq!(updated.version, "1.0.1");

        let code = registry.get_code(&meta.id).await.unwrap();
        assert!(code.code.contains("v2"));
        assert_eq!(code.requirements, "requests\n");
    }

    #[tokio::test]
    async fn test_get_code_round_trip() {
        let (registry, _tmp) = registry().await;
        let request = greet_request();
        let expected = request.code.clone();
        let meta = registry.register(request).await.unwrap();

        let code = registry.get_code(&meta.id).await.unwrap();
        assert_eq!(code.code, expected);
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let (registry, _tmp) = registry().await;
        let meta = registry.register(greet_request()).await.unwrap();

        let by_name = registry.get_metadata_by_name("greet").await.unwrap();
        assert_eq!(by_name.id, meta.id);

        let err = registry.get_metadata_by_name("missing").await.unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_removes_blobs() {
        let (registry, tmp) = registry().await;
        let meta = registry.register(greet_request()).await.unwrap();

        registry.delete(&meta.id).await.unwrap();

        assert!(!tmp.path().join(&meta.id).exists());
        assert!(matches!(
            registry.get_metadata(&meta.id).await.unwrap_err(),
            Error::FunctionNotFound(_)
        ));
        assert!(matches!(
            registry.get_metadata_by_name("greet").await.unwrap_err(),
            Error::FunctionNotFound(_)
        ));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_function() {
        let (registry, _tmp) = registry().await;
        let err = registry.delete("missing").await.unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }
}
