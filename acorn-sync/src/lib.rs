//! Remote replication over HTTP.
//!
//! A [`RemoteBranch`] speaks the sync protocol of a peer exposing, per typed
//! tree name:
//!
//! - `POST /<tree>/stash`: an envelope JSON body, admitted via squabble
//! - `DELETE /<tree>/toss/<id>`: a tombstone
//! - `GET /<tree>/export`: the current envelope set
//!
//! 2xx succeeds, 4xx fails without retry, 5xx and transport errors retry
//! with exponential backoff up to a bounded attempt count.

use std::marker::PhantomData;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument, warn};

use acorn_core::{
    AcornError, AcornResult, Branch, BranchStats, BranchStatsSnapshot, ChangeKind, ConflictDirection,
    Leaf, LocalWins, Nut, PushedSet, RemoteWins, SquabbleOutcome, SyncMode, Tree,
};

/// Connection settings for one remote peer.
#[derive(Debug, Clone)]
pub struct RemoteBranchConfig {
    /// Base URL of the peer, without a trailing slash.
    pub base_url: String,
    /// Typed tree name in the peer's URL space.
    pub tree_name: String,
    /// Remote node id used for loop prevention. Defaults to the base URL.
    pub remote_id: Option<String>,
    pub mode: SyncMode,
    pub direction: ConflictDirection,
    /// Per-request deadline.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RemoteBranchConfig {
    pub fn new(base_url: impl Into<String>, tree_name: impl Into<String>) -> Self {
        RemoteBranchConfig {
            base_url: base_url.into(),
            tree_name: tree_name.into(),
            remote_id: None,
            mode: SyncMode::Bidirectional,
            direction: ConflictDirection::UseJudge,
            timeout: Duration::from_secs(10),
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// Branch delivering envelopes to a remote peer over HTTP.
pub struct RemoteBranch<T> {
    config: RemoteBranchConfig,
    remote_id: String,
    client: reqwest::Client,
    pushed: PushedSet,
    stats: BranchStats,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RemoteBranch<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(config: RemoteBranchConfig) -> Self {
        let remote_id = config
            .remote_id
            .clone()
            .unwrap_or_else(|| config.base_url.clone());
        RemoteBranch {
            config,
            remote_id,
            client: reqwest::Client::new(),
            pushed: PushedSet::default(),
            stats: BranchStats::default(),
            _marker: PhantomData,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.config.base_url, self.config.tree_name, suffix)
    }

    fn block_on<F, R>(&self, fut: F) -> AcornResult<R>
    where
        F: std::future::Future<Output = Result<R, reqwest::Error>>,
    {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle
                .block_on(fut)
                .map_err(|err| AcornError::PeerUnavailable(err.to_string()))
        } else {
            tokio::runtime::Runtime::new()
                .map_err(|err| AcornError::TransientIo(format!("sync runtime: {err}")))?
                .block_on(fut)
                .map_err(|err| AcornError::PeerUnavailable(err.to_string()))
        }
    }

    /// Issue one request with the retry/backoff policy. The builder closure
    /// is re-invoked per attempt so request bodies can be re-serialized.
    fn execute<B>(&self, op: &'static str, build: B) -> AcornResult<reqwest::Response>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = self.block_on(build(&self.client).timeout(self.config.timeout).send());
            let err = match outcome {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status.is_client_error() {
                        return Err(AcornError::PermanentIo(format!(
                            "{op} rejected by peer: {status}"
                        )));
                    }
                    AcornError::TransientIo(format!("{op} failed at peer: {status}"))
                }
                Err(err) => err,
            };
            attempt += 1;
            if attempt >= self.config.max_attempts {
                return Err(err);
            }
            let delay = self.config.backoff.saturating_mul(1u32 << attempt.min(16));
            warn!(op, attempt, %err, ?delay, "retrying remote delivery");
            std::thread::sleep(delay);
        }
    }
}

impl<T> Branch<T> for RemoteBranch<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn mode(&self) -> SyncMode {
        self.config.mode
    }

    #[instrument(skip(self, leaf), fields(remote = %self.remote_id))]
    fn try_push(&self, leaf: &Leaf<T>) -> AcornResult<()> {
        if !self.config.mode.pushes() {
            return Ok(());
        }
        let Some(nut) = &leaf.nut else {
            return Ok(());
        };
        if self.pushed.contains(&nut.id, nut.timestamp) {
            debug!(id = %nut.id, "version already pushed; skipped");
            return Ok(());
        }
        self.execute("stash", |client| client.post(self.url("stash")).json(nut))?;
        self.pushed.mark(&nut.id, nut.timestamp);
        self.stats.record_push();
        Ok(())
    }

    #[instrument(skip(self, leaf), fields(remote = %self.remote_id))]
    fn try_delete(&self, leaf: &Leaf<T>) -> AcornResult<()> {
        if !self.config.mode.pushes() {
            return Ok(());
        }
        self.execute("toss", |client| {
            client.delete(self.url(&format!("toss/{}", leaf.id)))
        })?;
        self.stats.record_delete();
        Ok(())
    }

    #[instrument(skip(self, local), fields(remote = %self.remote_id))]
    fn shake(&self, local: &Tree<T>) -> AcornResult<usize> {
        if !self.config.mode.pulls() {
            return Ok(0);
        }
        let response = self.execute("export", |client| client.get(self.url("export")))?;
        let nuts: Vec<Nut<T>> = self.block_on(response.json())?;

        let mut accepted = 0;
        for nut in nuts {
            let leaf = Leaf::from_nut(ChangeKind::Update, nut);
            let outcome = match self.config.direction {
                ConflictDirection::UseJudge => local.squabble_leaf(leaf)?,
                ConflictDirection::PreferLocal => local.squabble_with(&LocalWins, leaf)?,
                ConflictDirection::PreferRemote => local.squabble_with(&RemoteWins, leaf)?,
            };
            match outcome {
                SquabbleOutcome::Accepted => accepted += 1,
                SquabbleOutcome::LocalWins => self.stats.record_conflict(),
                _ => {}
            }
        }
        self.stats.record_pulled(accepted as u64);
        Ok(accepted)
    }

    fn stats(&self) -> BranchStatsSnapshot {
        self.stats.snapshot()
    }
}
