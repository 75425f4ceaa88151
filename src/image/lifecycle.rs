//! Image presence and usage-based eviction
//!
//! Every launch goes through [`ImageLifecycleManager::require_image`], which
//! records when the image was last needed. When runtime storage fills up the
//! manager deletes images that have not been needed for the retention
//! window, children before parents, and never an image whose remaining
//! descendants are still in use.

use super::forest::DependencyForest;
use super::lock::{KeyGuard, KeyedLock};
use crate::config::ImagePolicy;
use crate::error::{FleetError, Result};
use crate::runtime::{ContainerRuntime, ImageInfo};
use crate::store::{ImageRecord, MetadataStore};
use chrono::Utc;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Keeps images present and evicts stale ones
pub struct ImageLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn MetadataStore>,
    locks: KeyedLock,
    policy: ImagePolicy,
    last_eviction: Mutex<Option<Instant>>,
}

impl ImageLifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn MetadataStore>,
        policy: ImagePolicy,
    ) -> Self {
        Self {
            runtime,
            store,
            locks: KeyedLock::new(),
            policy,
            last_eviction: Mutex::new(None),
        }
    }

    /// Make sure an image is present and record that it was needed now
    pub fn require_image(&self, reference: &str, on_progress: &mut dyn FnMut(&str)) -> Result<ImageInfo> {
        // an eviction may remove the image between the lookup and the lock;
        // the second round pulls it again
        for _ in 0..2 {
            let image = match self.runtime.inspect_image(reference)? {
                Some(image) => image,
                None => self.fetch(reference, on_progress)?,
            };
            if let Some(image) = self.touch(&image)? {
                return Ok(image);
            }
            tracing::debug!("Image {} vanished before it could be recorded, retrying", reference);
        }
        Err(FleetError::Image(format!("image {} keeps disappearing", reference)))
    }

    /// Pull an image explicitly, refreshing it when already present
    pub fn pull_image(&self, reference: &str, on_progress: &mut dyn FnMut(&str)) -> Result<ImageInfo> {
        let image = self.fetch(reference, on_progress)?;
        self.touch(&image)?
            .ok_or_else(|| FleetError::ImageNotFound(reference.to_string()))
    }

    /// Build an image from a local context and record it as used
    pub fn build_image(
        &self,
        tag: &str,
        context: &Path,
        on_progress: &mut dyn FnMut(&str),
    ) -> Result<ImageInfo> {
        if let Err(e) = self.maybe_evict() {
            tracing::warn!("Image eviction failed: {}", e);
        }
        tracing::info!("Building image {} from {}", tag, context.display());
        let image = self.runtime.build_image(tag, context, on_progress)?;
        self.touch(&image)?
            .ok_or_else(|| FleetError::ImageNotFound(tag.to_string()))
    }

    fn fetch(&self, reference: &str, on_progress: &mut dyn FnMut(&str)) -> Result<ImageInfo> {
        if let Err(e) = self.maybe_evict() {
            tracing::warn!("Image eviction failed: {}", e);
        }
        tracing::info!("Pulling image {}", reference);
        self.runtime.pull_image(reference, on_progress)?;
        self.runtime
            .inspect_image(reference)?
            .ok_or_else(|| FleetError::ImageNotFound(reference.to_string()))
    }

    /// Upsert the usage record under the image lock. `None` if the image is gone.
    fn touch(&self, image: &ImageInfo) -> Result<Option<ImageInfo>> {
        let _guard = self.locks.lock(&image.id)?;
        let Some(current) = self.runtime.inspect_image(&image.id)? else {
            return Ok(None);
        };
        self.store.put_image(ImageRecord {
            runtime_id: current.id.clone(),
            name: current.name().to_string(),
            last_used: Utc::now(),
        })?;
        Ok(Some(current))
    }

    /// Create usage records for images that have none, returning how many were added
    pub fn init_records(&self) -> Result<usize> {
        let mut created = 0;
        for image in self.runtime.list_images()? {
            let _guard = self.locks.lock(&image.id)?;
            if self.store.get_image(&image.id)?.is_none() {
                self.store.put_image(ImageRecord {
                    runtime_id: image.id.clone(),
                    name: image.name().to_string(),
                    last_used: Utc::now(),
                })?;
                created += 1;
            }
        }
        if created > 0 {
            tracing::info!("Recorded {} previously untracked image(s)", created);
        }
        Ok(created)
    }

    pub fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.runtime.list_images()
    }

    /// Delete one image under its lock
    pub fn delete_image(&self, id: &str) -> Result<Vec<String>> {
        let image = self
            .runtime
            .inspect_image(id)?
            .ok_or_else(|| FleetError::ImageNotFound(id.to_string()))?;
        let _guard = self.locks.lock(&image.id)?;
        let removed = self.runtime.remove_image(&image.id, false, true)?;
        self.forget(&removed);
        Ok(removed)
    }

    /// Evict when disk usage is over the threshold and the last sweep is old enough
    pub fn maybe_evict(&self) -> Result<Vec<String>> {
        let usage = self.runtime.disk_usage()?;
        if usage <= self.policy.disk_threshold {
            return Ok(Vec::new());
        }
        {
            let mut last = self.last_eviction.lock()
                .map_err(|_| FleetError::Lock("Failed to acquire eviction lock".to_string()))?;
            if let Some(at) = *last {
                if at.elapsed() < self.policy.eviction_interval() {
                    return Ok(Vec::new());
                }
            }
            *last = Some(Instant::now());
        }
        tracing::info!("Disk usage at {:.0}%, evicting unused images", usage * 100.0);
        self.evict_expired()
    }

    /// Delete every expired image whose remaining descendants are expired too.
    ///
    /// Returns the IDs the runtime removed.
    pub fn evict_expired(&self) -> Result<Vec<String>> {
        let images = self.runtime.list_images()?;
        let forest = DependencyForest::build(&images);
        let mut removed: HashSet<String> = HashSet::new();

        for id in forest.post_order() {
            if removed.contains(&id) {
                continue;
            }
            let descendants: Vec<String> = forest
                .descendants(&id)
                .into_iter()
                .filter(|d| !removed.contains(d))
                .collect();

            let mut guards: Vec<KeyGuard<'_>> = Vec::with_capacity(descendants.len() + 1);
            guards.push(self.locks.lock(&id)?);
            for descendant in &descendants {
                guards.push(self.locks.lock(descendant)?);
            }

            let outcome = self.evict_locked(&id, &descendants);

            while let Some(guard) = guards.pop() {
                drop(guard);
            }

            match outcome {
                Ok(Some(ids)) => {
                    tracing::info!("Evicted image {}", id);
                    self.forget(&ids);
                    removed.extend(ids);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to evict image {}: {}", id, e),
            }
        }

        let mut removed: Vec<String> = removed.into_iter().collect();
        removed.sort();
        Ok(removed)
    }

    /// Re-check expiry with the image and its descendants locked
    fn evict_locked(&self, id: &str, descendants: &[String]) -> Result<Option<Vec<String>>> {
        if !self.is_expired(id)? {
            return Ok(None);
        }
        for descendant in descendants {
            let present = self.runtime.inspect_image(descendant)?.is_some();
            if present && !self.is_expired(descendant)? {
                return Ok(None);
            }
        }
        self.runtime.remove_image(id, true, true).map(Some)
    }

    /// Untracked images are never expired
    fn is_expired(&self, id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_image(id)?
            .map(|record| Utc::now() - record.last_used > self.policy.retention())
            .unwrap_or(false))
    }

    fn forget(&self, ids: &[String]) {
        for id in ids {
            if let Err(e) = self.store.delete_image(id) {
                tracing::warn!("Failed to delete image record {}: {}", id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::LocalRuntime;
    use crate::store::MemoryStore;

    struct Fixture {
        runtime: Arc<LocalRuntime>,
        store: Arc<MemoryStore>,
        manager: ImageLifecycleManager,
    }

    fn fixture() -> Fixture {
        let runtime = Arc::new(LocalRuntime::new());
        let store = Arc::new(MemoryStore::new());
        let manager = ImageLifecycleManager::new(runtime.clone(), store.clone(), ImagePolicy::default());
        Fixture { runtime, store, manager }
    }

    fn record(store: &MemoryStore, id: &str, age_days: i64) {
        store
            .put_image(ImageRecord {
                runtime_id: id.to_string(),
                name: id.to_string(),
                last_used: Utc::now() - chrono::Duration::days(age_days),
            })
            .unwrap();
    }

    #[test]
    fn test_require_pulls_and_records() {
        let f = fixture();
        f.runtime.publish("web:1", None).unwrap();

        let mut progress = String::new();
        let image = f.manager.require_image("web:1", &mut |l| progress.push_str(l)).unwrap();
        assert!(progress.contains("Pull complete"));

        let record = f.store.get_image(&image.id).unwrap().unwrap();
        assert_eq!(record.name, "web:1");
        assert!(Utc::now() - record.last_used < chrono::Duration::seconds(5));

        // present now, no second pull
        let mut again = String::new();
        f.manager.require_image("web:1", &mut |l| again.push_str(l)).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_require_unknown_image() {
        let f = fixture();
        assert!(matches!(
            f.manager.require_image("nope", &mut |_| {}),
            Err(FleetError::ImageNotFound(_))
        ));
    }

    #[test]
    fn test_parent_kept_while_child_is_fresh() {
        let f = fixture();
        let a = f.runtime.add_image("base", None).unwrap();
        let b = f.runtime.add_image("app", Some(&a)).unwrap();
        record(&f.store, &a, 60);
        record(&f.store, &b, 1);

        assert!(f.manager.evict_expired().unwrap().is_empty());
        assert!(f.runtime.inspect_image(&a).unwrap().is_some());
        assert!(f.runtime.inspect_image(&b).unwrap().is_some());
    }

    #[test]
    fn test_expired_chain_removed_child_first() {
        let f = fixture();
        let a = f.runtime.add_image("base", None).unwrap();
        let b = f.runtime.add_image("app", Some(&a)).unwrap();
        let fresh = f.runtime.add_image("other", None).unwrap();
        record(&f.store, &a, 60);
        record(&f.store, &b, 45);
        record(&f.store, &fresh, 2);

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(f.manager.evict_expired().unwrap(), expected);
        assert!(f.store.get_image(&a).unwrap().is_none());
        assert!(f.runtime.inspect_image(&fresh).unwrap().is_some());
    }

    #[test]
    fn test_untracked_images_are_kept() {
        let f = fixture();
        let id = f.runtime.add_image("loose", None).unwrap();
        assert!(f.manager.evict_expired().unwrap().is_empty());
        assert!(f.runtime.inspect_image(&id).unwrap().is_some());

        assert_eq!(f.manager.init_records().unwrap(), 1);
        assert_eq!(f.manager.init_records().unwrap(), 0);
    }

    #[test]
    fn test_maybe_evict_respects_threshold_and_interval() {
        let f = fixture();
        let old = f.runtime.add_image("old", None).unwrap();
        record(&f.store, &old, 90);

        f.runtime.set_disk_usage(0.5).unwrap();
        assert!(f.manager.maybe_evict().unwrap().is_empty());
        assert!(f.runtime.inspect_image(&old).unwrap().is_some());

        f.runtime.set_disk_usage(0.95).unwrap();
        assert_eq!(f.manager.maybe_evict().unwrap(), vec![old]);

        let older = f.runtime.add_image("older", None).unwrap();
        record(&f.store, &older, 90);
        // rate limited for the next hour
        assert!(f.manager.maybe_evict().unwrap().is_empty());
        assert!(f.runtime.inspect_image(&older).unwrap().is_some());
    }

    #[test]
    fn test_eviction_waits_for_image_lock() {
        let f = fixture();
        let id = f.runtime.add_image("busy", None).unwrap();
        record(&f.store, &id, 60);

        let manager = Arc::new(f.manager);
        let guard = manager.locks.lock(&id).unwrap();
        let sweeper = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.evict_expired().unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        // a launch refreshes the record while the sweep is parked on the lock
        record(&f.store, &id, 0);
        drop(guard);

        assert!(sweeper.join().unwrap().is_empty());
        assert!(f.runtime.inspect_image(&id).unwrap().is_some());
    }
}
