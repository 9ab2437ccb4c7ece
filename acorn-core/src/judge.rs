use std::sync::Arc;

use crate::nut::Nut;

/// Which side of a squabble keeps the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Incoming,
}

#[derive(Debug, Clone)]
pub struct Verdict {
    pub winner: Winner,
    pub reason: &'static str,
}

/// Policy deciding which envelope wins a concurrent write. Pure and
/// deterministic; judges never touch the trunk.
pub trait Judge<T>: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, local: &Nut<T>, incoming: &Nut<T>) -> Verdict;
}

/// Later author timestamp wins; ties broken by version, then change id.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampJudge;

impl<T> Judge<T> for TimestampJudge {
    fn name(&self) -> &'static str {
        "timestamp"
    }

    fn resolve(&self, local: &Nut<T>, incoming: &Nut<T>) -> Verdict {
        if incoming.timestamp != local.timestamp {
            return if incoming.timestamp > local.timestamp {
                Verdict { winner: Winner::Incoming, reason: "later timestamp" }
            } else {
                Verdict { winner: Winner::Local, reason: "later timestamp" }
            };
        }
        if incoming.version != local.version {
            return if incoming.version > local.version {
                Verdict { winner: Winner::Incoming, reason: "higher version" }
            } else {
                Verdict { winner: Winner::Local, reason: "higher version" }
            };
        }
        if incoming.change_id > local.change_id {
            Verdict { winner: Winner::Incoming, reason: "change id tie-break" }
        } else {
            Verdict { winner: Winner::Local, reason: "change id tie-break" }
        }
    }
}

/// Higher version wins; ties broken by timestamp, then change id.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionJudge;

impl<T> Judge<T> for VersionJudge {
    fn name(&self) -> &'static str {
        "version"
    }

    fn resolve(&self, local: &Nut<T>, incoming: &Nut<T>) -> Verdict {
        if incoming.version != local.version {
            return if incoming.version > local.version {
                Verdict { winner: Winner::Incoming, reason: "higher version" }
            } else {
                Verdict { winner: Winner::Local, reason: "higher version" }
            };
        }
        if incoming.timestamp != local.timestamp {
            return if incoming.timestamp > local.timestamp {
                Verdict { winner: Winner::Incoming, reason: "later timestamp" }
            } else {
                Verdict { winner: Winner::Local, reason: "later timestamp" }
            };
        }
        if incoming.change_id > local.change_id {
            Verdict { winner: Winner::Incoming, reason: "change id tie-break" }
        } else {
            Verdict { winner: Winner::Local, reason: "change id tie-break" }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalWins;

impl<T> Judge<T> for LocalWins {
    fn name(&self) -> &'static str {
        "local-wins"
    }

    fn resolve(&self, _local: &Nut<T>, _incoming: &Nut<T>) -> Verdict {
        Verdict { winner: Winner::Local, reason: "local always wins" }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RemoteWins;

impl<T> Judge<T> for RemoteWins {
    fn name(&self) -> &'static str {
        "remote-wins"
    }

    fn resolve(&self, _local: &Nut<T>, _incoming: &Nut<T>) -> Verdict {
        Verdict { winner: Winner::Incoming, reason: "incoming always wins" }
    }
}

/// User-provided resolution function.
pub struct CustomJudge<T> {
    decide: Arc<dyn Fn(&Nut<T>, &Nut<T>) -> Winner + Send + Sync>,
}

impl<T> CustomJudge<T> {
    pub fn new<F>(decide: F) -> Self
    where
        F: Fn(&Nut<T>, &Nut<T>) -> Winner + Send + Sync + 'static,
    {
        CustomJudge { decide: Arc::new(decide) }
    }
}

impl<T> Judge<T> for CustomJudge<T> {
    fn name(&self) -> &'static str {
        "custom"
    }

    fn resolve(&self, local: &Nut<T>, incoming: &Nut<T>) -> Verdict {
        Verdict { winner: (self.decide)(local, incoming), reason: "custom" }
    }
}
