use std::sync::Arc;

use tracing::debug;

use crate::branch::{Branch, BranchStatsSnapshot};
use crate::error::{AcornError, AcornResult};
use crate::event::{ChangeKind, Leaf};
use crate::tree::Tree;

/// A named per-peer connector pairing a local tree with an outbound branch.
/// Connecting registers the branch with the tree, so authored changes flow
/// automatically; the tangle adds explicit push operations and identity.
pub struct Tangle<T> {
    name: String,
    local: Tree<T>,
    branch: Arc<dyn Branch<T>>,
}

impl<T> Tangle<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn connect(name: impl Into<String>, local: &Tree<T>, branch: Arc<dyn Branch<T>>) -> Self {
        local.entangle(branch.clone());
        let name = name.into();
        debug!(tangle = %name, local = local.id(), remote = branch.remote_id(), "tangle connected");
        Tangle {
            name,
            local: local.clone(),
            branch,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remote_id(&self) -> &str {
        self.branch.remote_id()
    }

    /// Push the current version of one key to the peer.
    pub fn push(&self, id: &str) -> AcornResult<()> {
        let nut = self
            .local
            .crack_nut(id)?
            .ok_or_else(|| AcornError::NotFound(id.to_string()))?;
        let leaf = Leaf::authored(ChangeKind::Stash, id, Some(nut), self.local.id());
        self.branch.try_push(&leaf)
    }

    /// Push a tombstone for one key to the peer.
    pub fn push_delete(&self, id: &str) -> AcornResult<()> {
        let version = self.local.crack_nut(id)?.map(|n| n.version).unwrap_or(0);
        let tombstone = crate::nut::Nut::tombstone(id, version + 1, self.local.id());
        let leaf = Leaf::authored(ChangeKind::Toss, id, Some(tombstone), self.local.id());
        self.branch.try_delete(&leaf)
    }

    /// Push every current envelope to the peer. Returns how many were sent.
    pub fn push_all(&self) -> AcornResult<usize> {
        let mut sent = 0;
        for nut in self.local.crack_all()? {
            let id = nut.id.clone();
            let leaf = Leaf::authored(ChangeKind::Stash, &id, Some(nut), self.local.id());
            self.branch.try_push(&leaf)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Pull the peer's current set into the local tree.
    pub fn shake(&self) -> AcornResult<usize> {
        self.branch.shake(&self.local)
    }

    pub fn stats(&self) -> BranchStatsSnapshot {
        self.branch.stats()
    }
}
