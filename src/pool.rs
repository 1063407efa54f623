//! Typed object pool.
//!
//! Sessions and filter chains churn through byte buffers; recycling them
//! avoids allocator traffic on the hot read/write path. The pool keeps one
//! free-list per stored type, keyed by `TypeId`, with O(1) get/put under a
//! per-type mutex.

use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A reusable value. Implementors clear themselves back to an empty state
/// when returned to the pool.
pub trait Poolable: Any + Send + Default {
    fn clear(&mut self);
}

impl Poolable for Vec<u8> {
    fn clear(&mut self) {
        Vec::clear(self);
    }
}

impl Poolable for String {
    fn clear(&mut self) {
        String::clear(self);
    }
}

type FreeList = Arc<Mutex<Vec<Box<dyn Any + Send>>>>;

/// Per-type caches of reusable objects.
///
/// The pool is server-scoped, not process-wide, so independent servers in
/// one process do not share caches.
pub struct ObjectPool {
    lists: Mutex<HashMap<TypeId, FreeList>>,
    max_per_type: usize,
}

impl Default for ObjectPool {
    fn default() -> Self {
        Self::new(crate::defaults::POOL_MAX_PER_TYPE)
    }
}

impl ObjectPool {
    pub fn new(max_per_type: usize) -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            max_per_type,
        }
    }

    fn list_for<T: Poolable>(&self) -> FreeList {
        let mut lists = self.lists.lock();
        lists
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Take an object from the pool, or default-construct one.
    pub fn get<T: Poolable>(self: &Arc<Self>) -> Pooled<T> {
        let list = self.list_for::<T>();
        let value = {
            let mut list = list.lock();
            list.pop()
        };
        let value = match value {
            Some(boxed) => *boxed.downcast::<T>().unwrap_or_default(),
            None => T::default(),
        };
        Pooled {
            value: Some(value),
            pool: Arc::clone(self),
        }
    }

    /// Return an object to the pool. Called from `Pooled::drop`.
    fn put<T: Poolable>(&self, mut value: T) {
        value.clear();
        let list = self.list_for::<T>();
        let mut list = list.lock();
        if list.len() < self.max_per_type {
            list.push(Box::new(value));
        }
    }

    /// Number of cached objects of type `T`, for tests and introspection.
    pub fn cached<T: Poolable>(&self) -> usize {
        let list = self.list_for::<T>();
        let len = list.lock().len();
        len
    }
}

/// RAII handle; returns the value to its pool on drop.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    pool: Arc<ObjectPool>,
}

impl<T: Poolable> Pooled<T> {
    /// Detach the value from the pool; it will not be recycled.
    pub fn into_inner(mut self) -> T {
        self.value.take().unwrap_or_default()
    }
}

impl<T: Poolable> std::ops::Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Poolable> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}
