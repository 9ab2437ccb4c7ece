//! Reusable contract checks run against every trunk implementation. Each
//! check returns an error describing the violated expectation, so the trunk
//! crates can assert them inside ordinary tests.

use acorn_core::{AcornError, AcornResult, Nut, Trunk, TrunkCapabilities};

#[derive(Debug, Clone, Copy)]
pub struct TrunkContract;

impl TrunkContract {
    /// stash → crack returns the same envelope; toss → crack returns none.
    pub fn round_trip<S>(trunk: &S) -> AcornResult<()>
    where
        S: Trunk<String>,
    {
        let nut = Nut::new("contract-key", "contract-payload".to_string(), "contract-node");
        trunk.stash("contract-key", nut.clone())?;

        let fetched = trunk
            .crack("contract-key")?
            .ok_or_else(|| harness_err("stashed envelope missing on crack"))?;
        if fetched.payload != nut.payload {
            return Err(harness_err("payload mismatch after round trip"));
        }
        if fetched.version != nut.version {
            return Err(harness_err("version mismatch after round trip"));
        }
        if fetched.change_id != nut.change_id {
            return Err(harness_err("change id mismatch after round trip"));
        }

        trunk.toss("contract-key")?;
        if trunk.crack("contract-key")?.is_some() {
            return Err(harness_err("toss did not remove the envelope"));
        }
        Ok(())
    }

    /// After n stashes of one id, history holds n-1 priors in admission
    /// order and the current is the last stashed.
    pub fn history_order<S>(trunk: &S) -> AcornResult<()>
    where
        S: Trunk<String>,
    {
        let id = "contract-history";
        for version in 1..=3u64 {
            let mut nut = Nut::new(id, format!("v{version}"), "contract-node");
            nut.version = version;
            trunk.stash(id, nut)?;
        }

        let current = trunk
            .crack(id)?
            .ok_or_else(|| harness_err("current missing after stashes"))?;
        if current.payload.as_deref() != Some("v3") {
            return Err(harness_err("current is not the last stashed"));
        }

        let history = trunk.history(id)?;
        if history.len() != 2 {
            return Err(harness_err("history should hold exactly the prior versions"));
        }
        for (i, nut) in history.iter().enumerate() {
            if nut.payload.as_deref() != Some(format!("v{}", i + 1).as_str()) {
                return Err(harness_err("history is not in admission order"));
            }
        }
        Ok(())
    }

    /// Everything exported from one trunk imports into another intact.
    pub fn export_import<A, B>(source: &A, destination: &B) -> AcornResult<()>
    where
        A: Trunk<String>,
        B: Trunk<String>,
    {
        for i in 0..3 {
            let id = format!("contract-export-{i}");
            source.stash(&id, Nut::new(&id, format!("value-{i}"), "contract-node"))?;
        }
        destination.import_changes(source.export_changes()?)?;
        for i in 0..3 {
            let id = format!("contract-export-{i}");
            let nut = destination
                .crack(&id)?
                .ok_or_else(|| harness_err("imported envelope missing"))?;
            if nut.payload.as_deref() != Some(format!("value-{i}").as_str()) {
                return Err(harness_err("imported payload mismatch"));
            }
        }
        Ok(())
    }

    pub fn assert_capabilities<S>(trunk: &S, expected: TrunkCapabilities)
    where
        S: Trunk<String>,
    {
        let caps = trunk.capabilities();
        assert_eq!(caps, expected, "capability descriptor mismatch");
    }
}

fn harness_err(msg: &str) -> AcornError {
    AcornError::ConflictBlocked(format!("trunk contract violated: {msg}"))
}
