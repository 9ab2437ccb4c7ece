use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{AcornError, AcornResult};
use crate::nut::Nut;
use crate::root::{Root, RootInfo};
use crate::trunk::{Trunk, TrunkCapabilities};

/// Exponential backoff schedule for retryable trunk failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        // Cheap xorshift off the clock; up to +50% spread.
        let mut seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 | 1)
            .unwrap_or(1);
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let spread = capped.as_millis() as u64 / 2;
        if spread == 0 {
            return capped;
        }
        capped + Duration::from_millis(seed % spread)
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum BreakerInner {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

/// closed -> open after a run of failures; open -> half-open once the
/// cooldown elapses; half-open -> closed on success, back to open on failure.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(BreakerInner::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> BreakerState {
        match *self.inner.lock() {
            BreakerInner::Closed { .. } => BreakerState::Closed,
            BreakerInner::Open { .. } => BreakerState::Open,
            BreakerInner::HalfOpen => BreakerState::HalfOpen,
        }
    }

    /// Whether a call may proceed right now. Transitions open -> half-open
    /// when the cooldown has elapsed.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match *inner {
            BreakerInner::Closed { .. } | BreakerInner::HalfOpen => true,
            BreakerInner::Open { since } => {
                if since.elapsed() >= self.config.cooldown {
                    *inner = BreakerInner::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.inner.lock() = BreakerInner::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        match *inner {
            BreakerInner::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.config.failure_threshold {
                    *inner = BreakerInner::Open { since: Instant::now() };
                } else {
                    *inner = BreakerInner::Closed { failures };
                }
            }
            BreakerInner::HalfOpen => {
                *inner = BreakerInner::Open { since: Instant::now() };
            }
            BreakerInner::Open { .. } => {}
        }
    }
}

/// Trunk wrapper that retries transient failures, trips a circuit breaker
/// on persistent ones, and optionally routes to a fallback trunk while the
/// circuit is open.
pub struct ResilientTrunk<T> {
    inner: Arc<dyn Trunk<T>>,
    fallback: Option<Arc<dyn Trunk<T>>>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl<T> ResilientTrunk<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(inner: Arc<dyn Trunk<T>>) -> Self {
        ResilientTrunk {
            inner,
            fallback: None,
            retry: RetryPolicy::default(),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(config);
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Trunk<T>>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    fn run<R>(
        &self,
        op: &'static str,
        primary: impl Fn(&dyn Trunk<T>) -> AcornResult<R>,
    ) -> AcornResult<R> {
        if !self.breaker.allow() {
            if let Some(fallback) = &self.fallback {
                debug!(op, "circuit open; using fallback trunk");
                return primary(fallback.as_ref());
            }
            return Err(AcornError::TransientIo(format!("circuit open for `{op}`")));
        }
        let mut attempt = 0;
        loop {
            match primary(self.inner.as_ref()) {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(op, attempt, %err, ?delay, "retrying trunk operation");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        self.breaker.record_failure();
                        if let Some(fallback) = &self.fallback {
                            if self.breaker.state() == BreakerState::Open {
                                debug!(op, "circuit tripped; using fallback trunk");
                                return primary(fallback.as_ref());
                            }
                        }
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl<T> Trunk<T> for ResilientTrunk<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()> {
        self.run("stash", move |trunk| trunk.stash(id, nut.clone()))
    }

    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        self.run("crack", move |trunk| trunk.crack(id))
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        self.run("toss", move |trunk| trunk.toss(id))
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        self.run("crack_all", |trunk| trunk.crack_all())
    }

    fn history(&self, id: &str) -> AcornResult<Vec<Nut<T>>> {
        self.run("history", move |trunk| trunk.history(id))
    }

    fn import_changes(&self, nuts: Vec<Nut<T>>) -> AcornResult<()> {
        self.run("import_changes", move |trunk| trunk.import_changes(nuts.clone()))
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
        self.run("flush", |trunk| trunk.flush())
    }
}
