//! Configuration store: mapping rules and service configuration per tenant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ServiceConfiguration;
use crate::context::Tenant;
use crate::model::Mapping;

const MAPPINGS_FILE: &str = "mappings.json";
const CONFIGURATION_FILE: &str = "service-configuration.json";

// ------------------------------------------------------------------ //
//  Trait                                                              //
// ------------------------------------------------------------------ //

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn load_mappings(&self, tenant: &Tenant) -> Result<Vec<Mapping>>;
    async fn save_mappings(&self, tenant: &Tenant, mappings: &[Mapping]) -> Result<()>;
    async fn load_configuration(&self, tenant: &Tenant) -> Result<ServiceConfiguration>;
    async fn save_configuration(&self, tenant: &Tenant, configuration: &ServiceConfiguration) -> Result<()>;
}

// ------------------------------------------------------------------ //
//  InMemoryMappingStore (for tests)                                   //
// ------------------------------------------------------------------ //

#[derive(Debug, Default, Clone)]
pub struct InMemoryMappingStore {
    pub mappings: Arc<Mutex<HashMap<Tenant, Vec<Mapping>>>>,
    pub configurations: Arc<Mutex<HashMap<Tenant, ServiceConfiguration>>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn load_mappings(&self, tenant: &Tenant) -> Result<Vec<Mapping>> {
        Ok(self
            .mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_mappings(&self, tenant: &Tenant, mappings: &[Mapping]) -> Result<()> {
        self.mappings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.clone(), mappings.to_vec());
        Ok(())
    }

    async fn load_configuration(&self, tenant: &Tenant) -> Result<ServiceConfiguration> {
        Ok(self
            .configurations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tenant)
            .cloned()
            .unwrap_or_default())
    }

    async fn save_configuration(&self, tenant: &Tenant, configuration: &ServiceConfiguration) -> Result<()> {
        self.configurations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tenant.clone(), configuration.clone());
        Ok(())
    }
}

// ------------------------------------------------------------------ //
//  FileMappingStore (production)                                      //
// ------------------------------------------------------------------ //

/// JSON files under `<root>/<tenant>/`. A missing file reads as empty.
pub struct FileMappingStore {
    root: PathBuf,
}

impl FileMappingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, tenant: &Tenant, file: &str) -> PathBuf {
        self.root.join(tenant.as_str()).join(file)
    }

    async fn read<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Write through a temporary file so readers never see a partial file.
    async fn write<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl MappingStore for FileMappingStore {
    async fn load_mappings(&self, tenant: &Tenant) -> Result<Vec<Mapping>> {
        Self::read(&self.path(tenant, MAPPINGS_FILE)).await
    }

    async fn save_mappings(&self, tenant: &Tenant, mappings: &[Mapping]) -> Result<()> {
        Self::write(&self.path(tenant, MAPPINGS_FILE), mappings).await
    }

    async fn load_configuration(&self, tenant: &Tenant) -> Result<ServiceConfiguration> {
        Self::read(&self.path(tenant, CONFIGURATION_FILE)).await
    }

    async fn save_configuration(&self, tenant: &Tenant, configuration: &ServiceConfiguration) -> Result<()> {
        Self::write(&self.path(tenant, CONFIGURATION_FILE), configuration).await
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //
