use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::branch::InProcessBranch;
use crate::error::{AcornError, AcornResult};
use crate::tree::Tree;

/// Coordinator owning a set of trees and the undirected topology between
/// them. Edges are realized as in-process branches in both directions.
pub struct Mesh<T> {
    nodes: HashMap<String, Tree<T>>,
    /// Insertion order, for deterministic ring/star construction.
    order: Vec<String>,
    edges: HashSet<(String, String)>,
}

impl<T> Default for Mesh<T> {
    fn default() -> Self {
        Mesh {
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: HashSet::new(),
        }
    }
}

impl<T> Mesh<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, tree: Tree<T>) -> &mut Self {
        let id = tree.id().to_string();
        if self.nodes.insert(id.clone(), tree).is_none() {
            self.order.push(id);
        }
        self
    }

    pub fn node(&self, id: &str) -> Option<&Tree<T>> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn edge_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Connect two registered nodes with in-process branches both ways.
    pub fn connect_nodes(&mut self, a: &str, b: &str) -> AcornResult<()> {
        if a == b {
            return Err(AcornError::ConflictBlocked("cannot connect a node to itself".into()));
        }
        let key = Self::edge_key(a, b);
        if self.edges.contains(&key) {
            return Ok(());
        }
        let tree_a = self
            .nodes
            .get(a)
            .ok_or_else(|| AcornError::NotFound(format!("mesh node `{a}`")))?
            .clone();
        let tree_b = self
            .nodes
            .get(b)
            .ok_or_else(|| AcornError::NotFound(format!("mesh node `{b}`")))?
            .clone();
        tree_a.entangle(Arc::new(InProcessBranch::new(&tree_b)));
        tree_b.entangle(Arc::new(InProcessBranch::new(&tree_a)));
        self.edges.insert(key);
        debug!(a, b, "mesh edge created");
        Ok(())
    }

    /// Pairwise connect every registered node.
    pub fn create_full_mesh(&mut self) -> AcornResult<()> {
        let ids = self.order.clone();
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                self.connect_nodes(a, b)?;
            }
        }
        Ok(())
    }

    /// Connect each node to the next in registration order and close the loop.
    pub fn create_ring(&mut self) -> AcornResult<()> {
        let ids = self.order.clone();
        if ids.len() < 2 {
            return Ok(());
        }
        for pair in ids.windows(2) {
            self.connect_nodes(&pair[0], &pair[1])?;
        }
        if ids.len() > 2 {
            self.connect_nodes(&ids[ids.len() - 1], &ids[0])?;
        }
        Ok(())
    }

    /// Connect `hub` to every other registered node.
    pub fn create_star(&mut self, hub: &str) -> AcornResult<()> {
        if !self.nodes.contains_key(hub) {
            return Err(AcornError::NotFound(format!("mesh node `{hub}`")));
        }
        let ids = self.order.clone();
        for id in ids.iter().filter(|id| id.as_str() != hub) {
            self.connect_nodes(hub, id)?;
        }
        Ok(())
    }

    /// Shake every edge in both directions. Returns total envelopes accepted.
    pub fn synchronize_all(&self) -> usize {
        let mut accepted = 0;
        for (a, b) in &self.edges {
            accepted += self.shake_into(a, b);
            accepted += self.shake_into(b, a);
        }
        accepted
    }

    /// Pull `from`'s branches into `into`: runs shake on every branch of
    /// `into` that targets `from`.
    fn shake_into(&self, into: &str, from: &str) -> usize {
        let Some(tree) = self.nodes.get(into) else { return 0 };
        let mut accepted = 0;
        for branch in tree.branches() {
            if branch.remote_id() != from {
                continue;
            }
            match branch.shake(tree) {
                Ok(count) => accepted += count,
                Err(err) => {
                    warn!(into, from, %err, "mesh shake failed");
                }
            }
        }
        accepted
    }
}
