//! Persisted metadata for containers, images and services
//!
//! The store is a keyed lookup: containers by runtime ID, images by runtime
//! ID, services by service ID. Structured fields are kept as serialized JSON
//! strings so the records map one-to-one onto relational rows.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Persisted container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container name (the correlation UUID)
    pub name: String,
    /// Runtime container ID
    pub runtime_id: String,
    /// Serialized label map, including port mappings
    pub labels: String,
    /// Image reference
    pub image: String,
    /// Owner of the container
    pub owner_uid: String,
}

/// Persisted image usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Runtime image ID
    pub runtime_id: String,
    /// Image name
    pub name: String,
    /// Last time a launch required the image
    pub last_used: DateTime<Utc>,
}

/// Persisted service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    /// Serialized container list
    pub containers: String,
    /// Serialized network list
    pub networks: String,
    /// Serialized flag list
    pub flags: String,
}

/// All tables, as held in memory and written to disk
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    #[serde(default)]
    pub containers: BTreeMap<String, ContainerRecord>,
    #[serde(default)]
    pub images: BTreeMap<String, ImageRecord>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecord>,
}

/// Metadata persistence
pub trait MetadataStore: Send + Sync {
    fn put_container(&self, record: ContainerRecord) -> Result<()>;
    fn get_container(&self, runtime_id: &str) -> Result<Option<ContainerRecord>>;
    fn delete_container(&self, runtime_id: &str) -> Result<bool>;
    fn list_containers(&self) -> Result<Vec<ContainerRecord>>;

    /// Insert or replace an image record
    fn put_image(&self, record: ImageRecord) -> Result<()>;
    fn get_image(&self, runtime_id: &str) -> Result<Option<ImageRecord>>;
    fn delete_image(&self, runtime_id: &str) -> Result<bool>;
    fn list_images(&self) -> Result<Vec<ImageRecord>>;

    fn put_service(&self, record: ServiceRecord) -> Result<()>;
    fn get_service(&self, id: &str) -> Result<Option<ServiceRecord>>;
    fn delete_service(&self, id: &str) -> Result<bool>;
    fn list_services(&self) -> Result<Vec<ServiceRecord>>;
}
