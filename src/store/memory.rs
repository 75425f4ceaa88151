//! Volatile metadata store

use super::{ContainerRecord, ImageRecord, MetadataStore, ServiceRecord, Tables};
use crate::error::{FleetError, Result};
use std::sync::RwLock;

/// Store that lives as long as the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self { tables: RwLock::new(tables) }
    }

    /// Apply a change and return the resulting tables
    pub(crate) fn update<T>(&self, change: impl FnOnce(&mut Tables) -> T) -> Result<(T, Tables)> {
        let mut tables = self.tables.write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;
        let result = change(&mut tables);
        Ok((result, tables.clone()))
    }

    fn write<T>(&self, change: impl FnOnce(&mut Tables) -> T) -> Result<T> {
        let mut tables = self.tables.write()
            .map_err(|_| FleetError::Lock("Failed to acquire write lock".to_string()))?;
        Ok(change(&mut tables))
    }

    fn read<T>(&self, view: impl FnOnce(&Tables) -> T) -> Result<T> {
        let tables = self.tables.read()
            .map_err(|_| FleetError::Lock("Failed to acquire read lock".to_string()))?;
        Ok(view(&tables))
    }
}

impl MetadataStore for MemoryStore {
    fn put_container(&self, record: ContainerRecord) -> Result<()> {
        self.write(|t| {
            t.containers.insert(record.runtime_id.clone(), record);
        })
    }

    fn get_container(&self, runtime_id: &str) -> Result<Option<ContainerRecord>> {
        self.read(|t| t.containers.get(runtime_id).cloned())
    }

    fn delete_container(&self, runtime_id: &str) -> Result<bool> {
        self.write(|t| t.containers.remove(runtime_id).is_some())
    }

    fn list_containers(&self) -> Result<Vec<ContainerRecord>> {
        self.read(|t| t.containers.values().cloned().collect())
    }

    fn put_image(&self, record: ImageRecord) -> Result<()> {
        self.write(|t| {
            t.images.insert(record.runtime_id.clone(), record);
        })
    }

    fn get_image(&self, runtime_id: &str) -> Result<Option<ImageRecord>> {
        self.read(|t| t.images.get(runtime_id).cloned())
    }

    fn delete_image(&self, runtime_id: &str) -> Result<bool> {
        self.write(|t| t.images.remove(runtime_id).is_some())
    }

    fn list_images(&self) -> Result<Vec<ImageRecord>> {
        self.read(|t| t.images.values().cloned().collect())
    }

    fn put_service(&self, record: ServiceRecord) -> Result<()> {
        self.write(|t| {
            t.services.insert(record.id.clone(), record);
        })
    }

    fn get_service(&self, id: &str) -> Result<Option<ServiceRecord>> {
        self.read(|t| t.services.get(id).cloned())
    }

    fn delete_service(&self, id: &str) -> Result<bool> {
        self.write(|t| t.services.remove(id).is_some())
    }

    fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.read(|t| t.services.values().cloned().collect())
    }
}
