use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{AcornError, AcornResult};

/// Which trunk operation a root is observing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOp {
    Stash,
    Crack,
}

/// Processing context handed to every root in the chain. The metadata map is
/// shared down the chain, so earlier roots can annotate for later ones.
#[derive(Debug)]
pub struct RootContext {
    pub id: String,
    pub op: RootOp,
    pub metadata: HashMap<String, String>,
}

impl RootContext {
    pub fn new(id: impl Into<String>, op: RootOp) -> Self {
        RootContext {
            id: id.into(),
            op,
            metadata: HashMap::new(),
        }
    }
}

/// An ordered byte-level transform in a trunk's pipeline. `on_crack` must be
/// the inverse of `on_stash`.
pub trait Root: Send + Sync {
    fn name(&self) -> &str;
    /// Chain position. Bands: 10-99 policy, 100-199 compression,
    /// 200-299 encryption, 300-399 integrity, 400-499 signatures.
    fn sequence(&self) -> u32;
    fn signature(&self) -> String {
        format!("{}#{}", self.name(), self.sequence())
    }
    fn on_stash(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>>;
    fn on_crack(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>>;
}

/// Read-only description of an installed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInfo {
    pub name: String,
    pub sequence: u32,
    pub signature: String,
}

/// A trunk's ordered pipeline of roots. Traversed ascending by sequence on
/// stash and descending on crack. Read-mostly; add/remove are exclusive.
#[derive(Default)]
pub struct RootChain {
    roots: RwLock<Vec<Arc<dyn Root>>>,
}

impl RootChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, root: Arc<dyn Root>) {
        let mut roots = self.roots.write();
        roots.push(root);
        roots.sort_by_key(|r| r.sequence());
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut roots = self.roots.write();
        let before = roots.len();
        roots.retain(|r| r.name() != name);
        roots.len() != before
    }

    pub fn infos(&self) -> Vec<RootInfo> {
        self.roots
            .read()
            .iter()
            .map(|r| RootInfo {
                name: r.name().to_string(),
                sequence: r.sequence(),
                signature: r.signature(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.read().is_empty()
    }

    /// Apply the chain ascending for a stash.
    pub fn encode(&self, id: &str, bytes: Vec<u8>) -> AcornResult<Vec<u8>> {
        let roots: Vec<Arc<dyn Root>> = self.roots.read().clone();
        let mut ctx = RootContext::new(id, RootOp::Stash);
        let mut out = bytes;
        for root in roots.iter() {
            out = root.on_stash(&out, &mut ctx)?;
        }
        Ok(out)
    }

    /// Apply the chain descending for a crack.
    pub fn decode(&self, id: &str, bytes: Vec<u8>) -> AcornResult<Vec<u8>> {
        let roots: Vec<Arc<dyn Root>> = self.roots.read().clone();
        let mut ctx = RootContext::new(id, RootOp::Crack);
        let mut out = bytes;
        for root in roots.iter().rev() {
            out = root.on_crack(&out, &mut ctx)?;
        }
        Ok(out)
    }
}

/// What a policy root should do when a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Deny the operation with `PolicyDenied`.
    Strict,
    /// Pass through and count the violation.
    Permissive,
}

#[derive(Debug, Clone)]
pub struct PolicyOptions {
    pub mode: PolicyMode,
    /// Reject payloads larger than this many bytes, post-serialization.
    pub max_payload_bytes: Option<usize>,
    /// Reject ids beginning with any of these prefixes.
    pub denied_id_prefixes: Vec<String>,
    /// Record an annotation in the context metadata for every operation seen.
    pub annotate: bool,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        PolicyOptions {
            mode: PolicyMode::Strict,
            max_payload_bytes: None,
            denied_id_prefixes: Vec::new(),
            annotate: false,
        }
    }
}

/// Non-transforming root that permits, annotates, or denies operations based
/// on configured options. Sits in the 10-99 band so it runs before any
/// transforming root on stash.
pub struct PolicyRoot {
    sequence: u32,
    options: PolicyOptions,
    permitted: AtomicU64,
    denied: AtomicU64,
}

impl PolicyRoot {
    pub fn new(options: PolicyOptions) -> Self {
        PolicyRoot {
            sequence: 50,
            options,
            permitted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn permitted(&self) -> u64 {
        self.permitted.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    fn violation(&self, ctx: &RootContext, bytes: &[u8]) -> Option<String> {
        if let Some(limit) = self.options.max_payload_bytes {
            if ctx.op == RootOp::Stash && bytes.len() > limit {
                return Some(format!("payload of {} bytes exceeds limit {}", bytes.len(), limit));
            }
        }
        for prefix in &self.options.denied_id_prefixes {
            if ctx.id.starts_with(prefix.as_str()) {
                return Some(format!("id `{}` matches denied prefix `{}`", ctx.id, prefix));
            }
        }
        None
    }

    fn evaluate(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        if self.options.annotate {
            ctx.metadata.insert("policy.seen".to_string(), "true".to_string());
        }
        if let Some(reason) = self.violation(ctx, bytes) {
            self.denied.fetch_add(1, Ordering::Relaxed);
            match self.options.mode {
                PolicyMode::Strict => return Err(AcornError::PolicyDenied(reason)),
                PolicyMode::Permissive => {
                    debug!(id = %ctx.id, %reason, "policy violation passed through");
                    ctx.metadata.insert("policy.violation".to_string(), reason);
                }
            }
        } else {
            self.permitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(bytes.to_vec())
    }
}

impl Root for PolicyRoot {
    fn name(&self) -> &str {
        "policy"
    }

    fn sequence(&self) -> u32 {
        self.sequence
    }

    fn on_stash(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        self.evaluate(bytes, ctx)
    }

    fn on_crack(&self, bytes: &[u8], ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
        self.evaluate(bytes, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reversible test transform: XORs every byte with a fixed mask.
    struct XorRoot {
        sequence: u32,
        mask: u8,
    }

    impl Root for XorRoot {
        fn name(&self) -> &str {
            "xor"
        }

        fn sequence(&self) -> u32 {
            self.sequence
        }

        fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
            Ok(bytes.iter().map(|b| b ^ self.mask).collect())
        }

        fn on_crack(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
            Ok(bytes.iter().map(|b| b ^ self.mask).collect())
        }
    }

    /// Prepends a tag byte on stash, strips it on crack. Order-sensitive.
    struct TagRoot {
        sequence: u32,
        tag: u8,
    }

    impl Root for TagRoot {
        fn name(&self) -> &str {
            "tag"
        }

        fn sequence(&self) -> u32 {
            self.sequence
        }

        fn on_stash(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
            let mut out = Vec::with_capacity(bytes.len() + 1);
            out.push(self.tag);
            out.extend_from_slice(bytes);
            Ok(out)
        }

        fn on_crack(&self, bytes: &[u8], _ctx: &mut RootContext) -> AcornResult<Vec<u8>> {
            match bytes.split_first() {
                Some((first, rest)) if *first == self.tag => Ok(rest.to_vec()),
                _ => Err(AcornError::CorruptRecord("missing tag byte".into())),
            }
        }
    }

    #[test]
    fn chain_round_trips_in_sequence_order() {
        let chain = RootChain::new();
        // Added out of order on purpose; the chain sorts by sequence.
        chain.add(Arc::new(TagRoot { sequence: 300, tag: 0xEE }));
        chain.add(Arc::new(XorRoot { sequence: 100, mask: 0x5A }));

        let encoded = chain.encode("k", b"payload".to_vec()).unwrap();
        // Tag root ran last on stash, so the tag byte is outermost.
        assert_eq!(encoded[0], 0xEE);

        let decoded = chain.decode("k", encoded).unwrap();
        assert_eq!(decoded, b"payload");
    }

    #[test]
    fn infos_reflect_sorted_chain() {
        let chain = RootChain::new();
        chain.add(Arc::new(XorRoot { sequence: 250, mask: 1 }));
        chain.add(Arc::new(TagRoot { sequence: 10, tag: 1 }));
        let infos = chain.infos();
        assert_eq!(infos[0].name, "tag");
        assert_eq!(infos[1].name, "xor");
        assert!(chain.remove("tag"));
        assert!(!chain.remove("tag"));
    }

    #[test]
    fn strict_policy_denies_oversized_payload() {
        let root = PolicyRoot::new(PolicyOptions {
            max_payload_bytes: Some(4),
            ..PolicyOptions::default()
        });
        let mut ctx = RootContext::new("k", RootOp::Stash);
        let err = root.on_stash(b"too large", &mut ctx).unwrap_err();
        assert!(matches!(err, AcornError::PolicyDenied(_)));
        assert_eq!(root.denied(), 1);
    }

    #[test]
    fn permissive_policy_passes_through_and_counts() {
        let root = PolicyRoot::new(PolicyOptions {
            mode: PolicyMode::Permissive,
            denied_id_prefixes: vec!["secret/".into()],
            ..PolicyOptions::default()
        });
        let mut ctx = RootContext::new("secret/k", RootOp::Stash);
        let out = root.on_stash(b"data", &mut ctx).unwrap();
        assert_eq!(out, b"data");
        assert_eq!(root.denied(), 1);
        assert!(ctx.metadata.contains_key("policy.violation"));
    }

    #[test]
    fn policy_denies_by_id_prefix_on_crack_too() {
        let root = PolicyRoot::new(PolicyOptions {
            denied_id_prefixes: vec!["blocked-".into()],
            ..PolicyOptions::default()
        });
        let mut ctx = RootContext::new("blocked-1", RootOp::Crack);
        assert!(root.on_crack(b"data", &mut ctx).is_err());
    }
}
