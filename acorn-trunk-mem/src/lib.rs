//! In-memory trunk: a mapping from id to current envelope. Non-durable, no
//! history. Used for tests, hot tiers, and as the fallback behind resilient
//! wrappers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use acorn_core::{
    AcornResult, JsonCodec, Nut, NutCodec, Root, RootChain, RootInfo, Trunk, TrunkCapabilities,
};

/// Stored form of one entry. With no roots installed envelopes are kept
/// typed; once a chain is attached new writes hold the processed bytes so
/// the pipeline round-trips exactly as on byte-backed trunks.
enum Slot<T> {
    Plain(Nut<T>),
    Processed(Vec<u8>),
}

pub struct MemoryTrunk<T> {
    slots: RwLock<HashMap<String, Slot<T>>>,
    chain: RootChain,
    codec: JsonCodec,
}

impl<T> Default for MemoryTrunk<T> {
    fn default() -> Self {
        MemoryTrunk {
            slots: RwLock::new(HashMap::new()),
            chain: RootChain::new(),
            codec: JsonCodec,
        }
    }
}

impl<T> MemoryTrunk<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

impl<T> MemoryTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn materialize(&self, id: &str, slot: &Slot<T>) -> AcornResult<Nut<T>> {
        match slot {
            Slot::Plain(nut) => Ok(nut.clone()),
            Slot::Processed(bytes) => {
                let raw = self.chain.decode(id, bytes.clone())?;
                self.codec.decode(&raw)
            }
        }
    }
}

impl<T> Trunk<T> for MemoryTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()> {
        let slot = if self.chain.is_empty() {
            Slot::Plain(nut)
        } else {
            let raw = self.codec.encode(&nut)?;
            Slot::Processed(self.chain.encode(id, raw)?)
        };
        self.slots.write().insert(id.to_string(), slot);
        Ok(())
    }

    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        let slots = self.slots.read();
        match slots.get(id) {
            Some(slot) => Ok(Some(self.materialize(id, slot)?)),
            None => Ok(None),
        }
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        self.slots.write().remove(id);
        Ok(())
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        let slots = self.slots.read();
        let mut nuts = Vec::with_capacity(slots.len());
        for (id, slot) in slots.iter() {
            nuts.push(self.materialize(id, slot)?);
        }
        Ok(nuts)
    }

    fn capabilities(&self) -> TrunkCapabilities {
        TrunkCapabilities {
            history: false,
            sync: true,
            durable: false,
            async_io: false,
        }
    }

    fn add_root(&self, root: Arc<dyn Root>) -> AcornResult<()> {
        self.chain.add(root);
        Ok(())
    }

    fn remove_root(&self, name: &str) -> AcornResult<bool> {
        Ok(self.chain.remove(name))
    }

    fn roots(&self) -> Vec<RootInfo> {
        self.chain.infos()
    }
}
