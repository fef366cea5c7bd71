use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::StoreError;

/// Storage capability for per-key limiter state.
///
/// `update` must apply `f` atomically with respect to other updates of the same key: two
/// concurrent callers may never both observe the same pre-update state. A shared backend can
/// satisfy this with a compare-and-set loop, calling `f` again on a fresh copy after a conflict,
/// which is why `f` is `FnMut`.
#[async_trait]
pub trait KeyedStateStore<S>: Send + Sync + std::fmt::Debug
where
    S: Clone + Send + Sync + 'static,
{
    /// Apply `f` to the state for `key`, inserting `init` first if the key is new.
    async fn update(
        &self,
        key: &str,
        init: S,
        f: &mut (dyn for<'s> FnMut(&'s mut S) + Send),
    ) -> Result<(), StoreError>;

    /// Fetch a copy of the current state.
    async fn load(&self, key: &str) -> Result<Option<S>, StoreError>;

    /// Delete the state for `key`. Returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// Process-local store on a sharded concurrent map.
#[derive(Debug, Clone)]
pub struct InMemoryStore<S> {
    data: Arc<DashMap<String, S>>,
}

impl<S> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self { data: Arc::new(DashMap::new()) }
    }
}

impl<S> InMemoryStore<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S> KeyedStateStore<S> for InMemoryStore<S>
where
    S: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn update(
        &self,
        key: &str,
        init: S,
        f: &mut (dyn for<'s> FnMut(&'s mut S) + Send),
    ) -> Result<(), StoreError> {
        if let Some(mut existing) = self.data.get_mut(key) {
            f(existing.value_mut());
            return Ok(());
        }
        // Entry API holds the shard lock, so concurrent first writers agree on one state.
        let mut entry = self.data.entry(key.to_string()).or_insert(init);
        f(entry.value_mut());
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<S>, StoreError> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.data.remove(key).is_some())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.data.len())
    }
}
