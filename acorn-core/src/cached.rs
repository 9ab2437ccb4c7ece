use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::{CacheStrategy, LruStrategy};
use crate::error::AcornResult;
use crate::nut::Nut;
use crate::root::{Root, RootInfo};
use crate::trunk::{Trunk, TrunkCapabilities};

/// Trunk wrapper keeping a bounded read cache in front of a slower trunk.
/// Composes like [`crate::ResilientTrunk`]: wrap an adapter whose reads are
/// expensive, then hand the wrapper to a tree or use it directly.
///
/// The inner trunk stays authoritative; eviction only costs a re-read.
pub struct CachedTrunk<T> {
    inner: Arc<dyn Trunk<T>>,
    cache: RwLock<HashMap<String, Nut<T>>>,
    strategy: Arc<dyn CacheStrategy>,
}

impl<T> CachedTrunk<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn Trunk<T>>) -> Self {
        Self::with_strategy(inner, Arc::new(LruStrategy::new(10_000)))
    }

    pub fn with_strategy(inner: Arc<dyn Trunk<T>>, strategy: Arc<dyn CacheStrategy>) -> Self {
        CachedTrunk {
            inner,
            cache: RwLock::new(HashMap::new()),
            strategy,
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }

    /// Drop every cached entry; the next reads go to the inner trunk.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.strategy.reset();
    }

    fn remember(&self, nut: Nut<T>) {
        let id = nut.id.clone();
        let len = {
            let mut cache = self.cache.write();
            cache.insert(id.clone(), nut);
            cache.len()
        };
        self.strategy.on_stash(&id);
        let victims = self.strategy.eviction_candidates(len);
        if !victims.is_empty() {
            let mut cache = self.cache.write();
            for victim in &victims {
                cache.remove(victim);
                self.strategy.on_toss(victim);
            }
        }
    }

    fn forget(&self, id: &str) {
        self.cache.write().remove(id);
        self.strategy.on_toss(id);
    }
}

impl<T> Trunk<T> for CachedTrunk<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()> {
        self.inner.stash(id, nut.clone())?;
        self.remember(nut);
        Ok(())
    }

    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        if let Some(nut) = self.cache.read().get(id).cloned() {
            self.strategy.on_crack(id);
            return Ok(Some(nut));
        }
        match self.inner.crack(id)? {
            Some(nut) => {
                self.remember(nut.clone());
                Ok(Some(nut))
            }
            None => Ok(None),
        }
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        self.inner.toss(id)?;
        self.forget(id);
        Ok(())
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        self.inner.crack_all()
    }

    fn history(&self, id: &str) -> AcornResult<Vec<Nut<T>>> {
        self.inner.history(id)
    }

    fn import_changes(&self, nuts: Vec<Nut<T>>) -> AcornResult<()> {
        self.inner.import_changes(nuts)?;
        // Imported envelopes may shadow cached ones wholesale.
        self.clear_cache();
        Ok(())
    }

    fn capabilities(&self) -> TrunkCapabilities {
        self.inner.capabilities()
    }

    fn add_root(&self, root: Arc<dyn Root>) -> AcornResult<()> {
        self.inner.add_root(root)
    }

    fn remove_root(&self, name: &str) -> AcornResult<bool> {
        self.inner.remove_root(name)
    }

    fn roots(&self) -> Vec<RootInfo> {
        self.inner.roots()
    }

    fn flush(&self) -> AcornResult<()> {
        self.inner.flush()
    }
}
