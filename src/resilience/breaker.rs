use std::{collections::HashMap, future::Future, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};
use tokio::time::Instant;

use crate::{Error, Result};

/// Breaker state of one endpoint key.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    #[display("CLOSED")]
    Closed,
    #[display("OPEN")]
    Open,
    #[display("HALF_OPEN")]
    HalfOpen,
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    /// Failures are only acted upon once this many requests were observed.
    pub minimum_requests: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cooldown: Duration,
    /// Counters are reset once the last failure is older than this.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub window: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_requests: 10,
            cooldown: Duration::from_secs(60),
            window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct Record {
    state: CircuitState,
    failure_count: u32,
    request_count: u32,
    last_failure_at: Option<Instant>,
    reopen_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Record {
    fn expire_window(&mut self, now: Instant, window: Duration) {
        let stale = self
            .last_failure_at
            .is_some_and(|at| now.saturating_duration_since(at) > window);
        if stale {
            self.failure_count = 0;
            self.request_count = 0;
            self.last_failure_at = None;
        }
    }

    fn close(&mut self) {
        *self = Self::default();
    }

    fn open(&mut self, now: Instant, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.reopen_at = Some(crate::deadline(now, cooldown));
        self.trial_in_flight = false;
    }
}

/// Point-in-time view of one breaker record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub request_count: u32,
}

/// Per-endpoint circuit breaker.
///
/// Records are created lazily on the first verdict for a key. Share one
/// instance (behind an `Arc`) between every call site that talks to the same
/// endpoints.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    records: RwLock<HashMap<String, Record>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[inline]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Asks permission to send a request to `key`.
    ///
    /// Returns [`Error::CircuitOpen`] while the breaker is open, or while a
    /// half-open trial is already in flight. The returned [`Permit`] must be
    /// resolved with [`Permit::success`] or [`Permit::failure`]; dropping it
    /// leaves the state untouched.
    pub fn acquire(&self, key: &str) -> Result<Permit<'_>> {
        let now = Instant::now();
        let mut records = self.records.write();
        let Some(record) = records.get_mut(key) else {
            return Ok(Permit::new(self, key, false));
        };

        record.expire_window(now, self.config.window);

        match record.state {
            CircuitState::Closed => Ok(Permit::new(self, key, false)),
            CircuitState::Open if record.reopen_at.is_some_and(|at| now >= at) => {
                record.state = CircuitState::HalfOpen;
                record.trial_in_flight = true;
                log::info!("circuit {key}: OPEN -> HALF_OPEN");
                Ok(Permit::new(self, key, true))
            }
            CircuitState::HalfOpen if !record.trial_in_flight => {
                record.trial_in_flight = true;
                Ok(Permit::new(self, key, true))
            }
            CircuitState::Open | CircuitState::HalfOpen => Err(Error::CircuitOpen {
                endpoint: key.to_owned(),
            }),
        }
    }

    /// Runs `op` under the breaker of `key`.
    ///
    /// Only retryable errors count as failures. Any other outcome proves the
    /// endpoint answered and is recorded as a success.
    pub async fn call<T, F, Fut>(&self, key: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(key)?;
        let out = op().await;
        match &out {
            Err(err) if err.is_retryable() => permit.failure(),
            _ => permit.success(),
        }
        out
    }

    /// Current state of `key`. Unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        self.records
            .read()
            .get(key)
            .map_or(CircuitState::Closed, |record| record.state)
    }

    pub fn snapshot(&self) -> HashMap<String, BreakerSnapshot> {
        self.records
            .read()
            .iter()
            .map(|(key, record)| {
                (
                    key.clone(),
                    BreakerSnapshot {
                        state: record.state,
                        failure_count: record.failure_count,
                        request_count: record.request_count,
                    },
                )
            })
            .collect()
    }

    /// Forgets everything about `key`, closing its breaker.
    pub fn reset(&self, key: &str) {
        if self.records.write().remove(key).is_some() {
            log::info!("circuit {key}: reset");
        }
    }

    fn record_success(&self, key: &str, trial: bool) {
        let mut records = self.records.write();
        let record = records.entry(key.to_owned()).or_default();
        match record.state {
            CircuitState::Closed => {
                record.request_count = record.request_count.saturating_add(1);
            }
            CircuitState::HalfOpen if trial => {
                record.close();
                log::info!("circuit {key}: HALF_OPEN -> CLOSED");
            }
            _ => {}
        }
    }

    fn record_failure(&self, key: &str, trial: bool) {
        let now = Instant::now();
        let mut records = self.records.write();
        let record = records.entry(key.to_owned()).or_default();
        record.expire_window(now, self.config.window);
        record.last_failure_at = Some(now);

        match record.state {
            CircuitState::Closed => {
                record.failure_count = record.failure_count.saturating_add(1);
                record.request_count = record.request_count.saturating_add(1);
                if record.request_count >= self.config.minimum_requests
                    && record.failure_count >= self.config.failure_threshold
                {
                    record.open(now, self.config.cooldown);
                    log::warn!(
                        "circuit {key}: CLOSED -> OPEN after {} failures in {} requests",
                        record.failure_count,
                        record.request_count
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                record.open(now, self.config.cooldown);
                log::warn!("circuit {key}: HALF_OPEN -> OPEN, trial failed");
            }
            _ => {}
        }
    }

    fn release_trial(&self, key: &str) {
        if let Some(record) = self.records.write().get_mut(key) {
            if record.state == CircuitState::HalfOpen {
                record.trial_in_flight = false;
            }
        }
    }
}

/// Permission to issue one request through a [`CircuitBreaker`].
#[must_use = "a permit must be resolved with success() or failure()"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    key: String,
    trial: bool,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, key: &str, trial: bool) -> Self {
        Self {
            breaker,
            key: key.to_owned(),
            trial,
            resolved: false,
        }
    }

    /// Whether this permit is the single half-open trial.
    #[inline]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(&self.key, self.trial);
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(&self.key, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            self.breaker.release_trial(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    const KEY: &str = "https://rpc.test";

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            minimum_requests: 3,
            cooldown: Duration::from_secs(10),
            window: Duration::from_secs(60),
        })
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(KEY, || async { Err(Error::network("refused")) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = breaker();
        for _ in 0..2 {
            assert!(fail(&breaker).await.unwrap_err().is_network());
            assert_eq!(breaker.state(KEY), CircuitState::Closed);
        }
        fail(&breaker).await.unwrap_err();
        assert_eq!(breaker.state(KEY), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_cooldown_stays_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 3,
            minimum_requests: 3,
            cooldown: Duration::MAX,
            window: Duration::from_secs(60),
        });
        for _ in 0..3 {
            fail(&breaker).await.unwrap_err();
        }
        assert_eq!(breaker.state(KEY), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(86400 * 365)).await;
        assert!(fail(&breaker).await.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_calling() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = breaker
            .call(KEY, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            Error::CircuitOpen {
                endpoint: KEY.into()
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_runs_once() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let trial = breaker.acquire(KEY).unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(KEY), CircuitState::HalfOpen);
        // a second caller is rejected while the trial is in flight
        assert!(breaker.acquire(KEY).unwrap_err().is_circuit_open());

        trial.success();
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert_eq!(breaker.snapshot()[KEY].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;

        let calls = AtomicU32::new(0);
        let counter = &calls;
        let _ = breaker
            .call(KEY, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::timeout(Duration::from_secs(1)))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.state(KEY), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(breaker.acquire(KEY).unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        drop(breaker.acquire(KEY).unwrap());
        assert_eq!(breaker.state(KEY), CircuitState::HalfOpen);
        assert!(breaker.acquire(KEY).unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_requests_gate() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            minimum_requests: 5,
            ..BreakerConfig::default()
        });

        for _ in 0..4 {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(KEY), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failures_expire() {
        let breaker = breaker();
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        let _ = fail(&breaker).await;

        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert_eq!(breaker.snapshot()[KEY].failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_errors_do_not_trip() {
        let breaker = breaker();
        for _ in 0..5 {
            let _ = breaker
                .call(KEY, || async { Err::<(), _>(Error::validation("bad input")) })
                .await;
        }
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert_eq!(breaker.snapshot()[KEY].failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes() {
        let breaker = breaker();
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        breaker.reset(KEY);
        assert_eq!(breaker.state(KEY), CircuitState::Closed);
        assert!(breaker.snapshot().is_empty());
    }
}
