//! Generic memoizing cache for GPU-backed resources

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::backend::GraphicsBackend;
use crate::error::EngineResult;

/// A resource owning GPU allocations that must be released exactly once
pub trait GpuResource {
    fn release(&self, backend: &mut dyn GraphicsBackend);
}

/// Lazily constructs and memoizes resources by key.
///
/// A hit hands out another reference to the same value and performs no GPU
/// work. A failed construction inserts nothing, so the next request for the
/// same key retries from scratch.
pub struct ResourceCache<K, V> {
    label: &'static str,
    entries: HashMap<K, Arc<V>>,
    constructions: usize,
}

impl<K, V> ResourceCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: HashMap::new(),
            constructions: 0,
        }
    }

    pub fn get_or_create<F>(&mut self, key: &K, create: F) -> EngineResult<Arc<V>>
    where
        F: FnOnce(&K) -> EngineResult<V>,
    {
        if let Some(existing) = self.entries.get(key) {
            return Ok(Arc::clone(existing));
        }

        self.constructions += 1;
        let value = Arc::new(create(key)?);
        log::debug!("{} cache: created {:?}", self.label, key);
        self.entries.insert(key.clone(), Arc::clone(&value));
        Ok(value)
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times a constructor has been invoked, successful or not
    pub fn constructions(&self) -> usize {
        self.constructions
    }
}

impl<K, V> ResourceCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: GpuResource,
{
    /// Release every cached resource. Only called when the owner shuts down.
    pub fn release_all(&mut self, backend: &mut dyn GraphicsBackend) {
        let count = self.entries.len();
        for (key, value) in self.entries.drain() {
            if Arc::strong_count(&value) > 1 {
                log::warn!(
                    "{} cache: {:?} still referenced at shutdown",
                    self.label,
                    key
                );
            }
            value.release(backend);
        }
        if count > 0 {
            log::info!("{} cache: released {} resources", self.label, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, HeadlessBackend};
    use crate::error::{EngineError, ErrorKind};

    struct Blob(BufferHandle);

    impl GpuResource for Blob {
        fn release(&self, backend: &mut dyn GraphicsBackend) {
            backend.destroy_buffer(self.0);
        }
    }

    fn upload(backend: &mut HeadlessBackend) -> EngineResult<Blob> {
        let desc = BufferDescriptor {
            label: None,
            size: 4,
            usage: BufferUsage::VERTEX,
        };
        Ok(Blob(backend.create_buffer_init(&desc, &[0; 4])?))
    }

    #[test]
    fn test_hit_returns_same_handle_without_reconstructing() {
        let mut backend = HeadlessBackend::default();
        let mut cache: ResourceCache<&str, Blob> = ResourceCache::new("test");

        let a = cache.get_or_create(&"a", |_| upload(&mut backend)).unwrap();
        let b = cache.get_or_create(&"a", |_| upload(&mut backend)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.constructions(), 1);
        assert_eq!(backend.live_buffers(), 1);
    }

    #[test]
    fn test_failed_construction_leaves_no_entry() {
        let mut cache: ResourceCache<String, Blob> = ResourceCache::new("test");
        let key = "broken".to_string();

        let result = cache.get_or_create(&key, |k| {
            Err(EngineError::new(ErrorKind::InvalidConfig(k.clone())))
        });

        assert!(result.is_err());
        assert!(!cache.contains(&key));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_release_all_frees_each_entry_once() {
        let mut backend = HeadlessBackend::default();
        let mut cache: ResourceCache<u32, Blob> = ResourceCache::new("test");
        for key in 0..3 {
            cache.get_or_create(&key, |_| upload(&mut backend)).unwrap();
        }
        assert_eq!(backend.live_buffers(), 3);

        cache.release_all(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
        assert!(cache.is_empty());
    }
}
