use std::sync::Arc;

use crate::error::{AcornError, AcornResult};
use crate::nut::Nut;
use crate::root::{Root, RootInfo};

/// Immutable capability descriptor a trunk advertises at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunkCapabilities {
    /// Prior versions of a key are retained and readable.
    pub history: bool,
    /// Bulk export/import for replication is supported.
    pub sync: bool,
    /// Writes survive process restart.
    pub durable: bool,
    /// Backed by natively asynchronous storage.
    pub async_io: bool,
}

/// Pluggable persistence container mapping id to current envelope. The trunk
/// owns the bytes and its root pipeline; it never owns the tree.
pub trait Trunk<T>: Send + Sync {
    /// Write, replacing any current version. History-preserving trunks append
    /// the prior current version to history.
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()>;

    /// Read the current envelope.
    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>>;

    /// Delete. History-preserving trunks record a tombstone.
    fn toss(&self, id: &str) -> AcornResult<()>;

    /// All current envelopes.
    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>>;

    /// Prior envelopes for `id`, oldest first.
    fn history(&self, _id: &str) -> AcornResult<Vec<Nut<T>>> {
        Err(AcornError::Unsupported("history"))
    }

    /// Bulk transfer out, for sync.
    fn export_changes(&self) -> AcornResult<Vec<Nut<T>>> {
        self.crack_all()
    }

    /// Bulk transfer in, for sync. Each envelope replaces the stored current.
    fn import_changes(&self, nuts: Vec<Nut<T>>) -> AcornResult<()> {
        for nut in nuts {
            let id = nut.id.clone();
            self.stash(&id, nut)?;
        }
        Ok(())
    }

    fn capabilities(&self) -> TrunkCapabilities;

    /// Install a root into this trunk's byte pipeline.
    fn add_root(&self, _root: Arc<dyn Root>) -> AcornResult<()> {
        Err(AcornError::Unsupported("roots"))
    }

    /// Remove a root by name; returns whether one was removed.
    fn remove_root(&self, _name: &str) -> AcornResult<bool> {
        Err(AcornError::Unsupported("roots"))
    }

    /// Read-only enumeration of installed roots.
    fn roots(&self) -> Vec<RootInfo> {
        Vec::new()
    }

    /// Flush any buffered writes to the backing store.
    fn flush(&self) -> AcornResult<()> {
        Ok(())
    }
}
