//! JSON-file backed metadata store

use super::{ContainerRecord, ImageRecord, MemoryStore, MetadataStore, ServiceRecord, Tables};
use crate::error::{FleetError, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Store that rewrites one JSON document after every change
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: MemoryStore,
    flush: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tables = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            if content.trim().is_empty() {
                Tables::default()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Tables::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            tables: MemoryStore::from_tables(tables),
            flush: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist<T>(&self, change: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        // serialize writers so an older snapshot never lands after a newer one
        let _flush = self.flush.lock()
            .map_err(|_| FleetError::Lock("Failed to acquire store lock".to_string()))?;
        let (result, snapshot) = self.tables.update(change)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&snapshot)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(result)
    }
}

impl MetadataStore for JsonFileStore {
    fn put_container(&self, record: ContainerRecord) -> Result<()> {
        self.persist(|t| {
            t.containers.insert(record.runtime_id.clone(), record);
        })
    }

    fn get_container(&self, runtime_id: &str) -> Result<Option<ContainerRecord>> {
        self.tables.get_container(runtime_id)
    }

    fn delete_container(&self, runtime_id: &str) -> Result<bool> {
        self.persist(|t| t.containers.remove(runtime_id).is_some())
    }

    fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.tables.list_containers()
    }

    fn put_image(&self, record: ImageRecord) -> Result<()> {
        self.persist(|t| {
            t.images.insert(record.runtime_id.clone(), record);
        })
    }

    fn get_image(&self, runtime_id: &str) -> Result<Option<ImageRecord>> {
        self.tables.get_image(runtime_id)
    }

    fn delete_image(&self, runtime_id: &str) -> Result<bool> {
        self.persist(|t| t.images.remove(runtime_id).is_some())
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.tables.list_images()
    }

    fn put_service(&self, record: ServiceRecord) -> Result<()> {
        self.persist(|t| {
            t.services.insert(record.id.clone(), record);
        })
    }

    fn get_service(&self, id: &str) -> Result<Option<ServiceRecord>> {
        self.tables.get_service(id)
    }

    fn delete_service(&self, id: &str) -> Result<bool> {
        self.persist(|t| t.services.remove(id).is_some())
    }

    fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.tables.list_services()
    }
}
