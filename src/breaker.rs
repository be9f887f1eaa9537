//! Per-provider circuit breaker with shared-store persistence.
//!
//! State machine per provider key: Closed → (failures ≥ threshold within
//! the rolling window) → Open → (recovery timeout elapses) → HalfOpen →
//! (success threshold reached) → Closed, with any half-open failure
//! returning straight to Open.
//!
//! All mutation goes through a compare-and-swap loop against the shared
//! store: every writer reloads the current statistics before persisting, so
//! a transition can never be clobbered by a stale snapshot, and the state
//! survives process restarts. Rolling failure counts drop entries older
//! than the window before every use.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::BreakerConfig;
use crate::errors::StoreError;
use crate::store::KeyValueStore;

const KEY_PREFIX: &str = "breaker:";
const CAS_RETRY_LIMIT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Persisted per-provider statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerRecord {
    state: CircuitState,
    /// Unix-millisecond timestamps of failures inside the rolling window.
    failure_times_ms: Vec<i64>,
    /// When the breaker last opened, unix milliseconds.
    opened_at_ms: Option<i64>,
    half_open_successes: u32,
    total_successes: u64,
    total_failures: u64,
    last_state_change_ms: i64,
}

impl BreakerRecord {
    fn new(now_ms: i64) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_times_ms: Vec::new(),
            opened_at_ms: None,
            half_open_successes: 0,
            total_successes: 0,
            total_failures: 0,
            last_state_change_ms: now_ms,
        }
    }

    fn prune_window(&mut self, now_ms: i64, window_ms: i64) {
        self.failure_times_ms.retain(|t| now_ms - t < window_ms);
    }

    fn set_state(&mut self, state: CircuitState, now_ms: i64) {
        if self.state != state {
            self.state = state;
            self.last_state_change_ms = now_ms;
        }
        if state == CircuitState::Open {
            self.opened_at_ms = Some(now_ms);
            self.half_open_successes = 0;
        }
        if state == CircuitState::Closed {
            self.failure_times_ms.clear();
            self.opened_at_ms = None;
            self.half_open_successes = 0;
        }
    }
}

/// Read-only view returned by `get_stats` and `list_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStats {
    pub provider: String,
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub failure_rate: f64,
    pub is_available: bool,
}

pub struct CircuitBreaker {
    store: Arc<dyn KeyValueStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KeyValueStore>, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    fn key(provider: &str) -> String {
        format!("{KEY_PREFIX}{provider}")
    }

    fn window_ms(&self) -> i64 {
        self.config.window_seconds as i64 * 1000
    }

    fn recovery_ms(&self) -> i64 {
        self.config.recovery_timeout_seconds as i64 * 1000
    }

    /// Load-modify-CAS loop. `apply` sees freshly pruned statistics and
    /// returns the value the caller wants back; on contention the whole
    /// closure re-runs against the reloaded record.
    async fn update<T>(
        &self,
        provider: &str,
        apply: impl Fn(&mut BreakerRecord, i64) -> T,
    ) -> Result<T, StoreError> {
        let key = Self::key(provider);
        for _ in 0..CAS_RETRY_LIMIT {
            let now_ms = Utc::now().timestamp_millis();
            let existing = self.store.get(&key).await?;
            let mut record: BreakerRecord = match &existing {
                Some(value) => serde_json::from_value(value.clone())?,
                None => BreakerRecord::new(now_ms),
            };
            record.prune_window(now_ms, self.window_ms());
            let result = apply(&mut record, now_ms);
            let new_value = serde_json::to_value(&record)?;
            if self
                .store
                .compare_and_swap(&key, existing.as_ref(), new_value, None)
                .await?
            {
                return Ok(result);
            }
        }
        Err(StoreError::Conflict(format!(
            "breaker update for {provider} lost {CAS_RETRY_LIMIT} CAS races"
        )))
    }

    /// Run the availability check, performing the Open → HalfOpen
    /// transition when the recovery timeout has elapsed.
    fn check_availability(&self, record: &mut BreakerRecord, now_ms: i64) -> bool {
        match record.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let opened_at = record.opened_at_ms.unwrap_or(record.last_state_change_ms);
                if now_ms - opened_at >= self.recovery_ms() {
                    record.set_state(CircuitState::HalfOpen, now_ms);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Whether a call to this provider may proceed right now.
    pub async fn is_call_allowed(&self, provider: &str) -> Result<bool, StoreError> {
        let recovery = |record: &mut BreakerRecord, now_ms: i64| {
            self.check_availability(record, now_ms)
        };
        self.update(provider, recovery).await
    }

    pub async fn record_success(&self, provider: &str) -> Result<(), StoreError> {
        let threshold = self.config.half_open_success_threshold;
        self.update(provider, move |record, now_ms| {
            record.total_successes += 1;
            if record.state == CircuitState::HalfOpen {
                record.half_open_successes += 1;
                if record.half_open_successes >= threshold {
                    record.set_state(CircuitState::Closed, now_ms);
                }
            }
        })
        .await
    }

    pub async fn record_failure(&self, provider: &str) -> Result<(), StoreError> {
        let failure_threshold = self.config.failure_threshold;
        self.update(provider, move |record, now_ms| {
            record.total_failures += 1;
            match record.state {
                CircuitState::HalfOpen => {
                    // A probe failed; go straight back to Open.
                    record.set_state(CircuitState::Open, now_ms);
                }
                CircuitState::Closed => {
                    record.failure_times_ms.push(now_ms);
                    if record.failure_times_ms.len() as u32 >= failure_threshold {
                        record.set_state(CircuitState::Open, now_ms);
                    }
                }
                CircuitState::Open => {
                    record.failure_times_ms.push(now_ms);
                }
            }
        })
        .await
    }

    /// Statistics for one provider. Runs the availability check first so
    /// the returned state reflects any just-performed transition.
    pub async fn get_stats(&self, provider: &str) -> Result<BreakerStats, StoreError> {
        let provider_name = provider.to_string();
        self.update(provider, move |record, now_ms| {
            let is_available = self.check_availability(record, now_ms);
            let total = record.total_successes + record.total_failures;
            BreakerStats {
                provider: provider_name.clone(),
                state: record.state,
                failures_in_window: record.failure_times_ms.len() as u32,
                total_successes: record.total_successes,
                total_failures: record.total_failures,
                failure_rate: if total == 0 {
                    0.0
                } else {
                    record.total_failures as f64 / total as f64
                },
                is_available,
            }
        })
        .await
    }

    /// Force the breaker open (operator action).
    pub async fn force_open(&self, provider: &str) -> Result<(), StoreError> {
        self.update(provider, |record, now_ms| {
            record.set_state(CircuitState::Open, now_ms);
        })
        .await
    }

    /// Reset to a fresh closed breaker.
    pub async fn reset(&self, provider: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(provider)).await?;
        Ok(())
    }

    /// Stats for every provider key present in the store.
    pub async fn list_all(&self) -> Result<Vec<BreakerStats>, StoreError> {
        let keys = self.store.keys_with_prefix(KEY_PREFIX).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let provider = key.trim_start_matches(KEY_PREFIX).to_string();
            out.push(self.get_stats(&provider).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;

    fn breaker(config: BreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(Arc::new(MemoryKeyValueStore::new()), config)
    }

    fn fast_recovery() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            window_seconds: 60,
            recovery_timeout_seconds: 0,
            half_open_success_threshold: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = breaker(BreakerConfig::default());
        for _ in 0..4 {
            cb.record_failure("apex").await.unwrap();
            assert!(cb.is_call_allowed("apex").await.unwrap());
        }
        cb.record_failure("apex").await.unwrap();
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::Open);
        assert!(!cb.is_call_allowed("apex").await.unwrap());
    }

    #[tokio::test]
    async fn recovers_through_half_open_after_timeout() {
        let cb = breaker(fast_recovery());
        for _ in 0..5 {
            cb.record_failure("apex").await.unwrap();
        }
        // Zero recovery timeout: the next availability check transitions.
        assert!(cb.is_call_allowed("apex").await.unwrap());
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::HalfOpen);

        cb.record_success("apex").await.unwrap();
        assert_eq!(
            cb.get_stats("apex").await.unwrap().state,
            CircuitState::HalfOpen
        );
        cb.record_success("apex").await.unwrap();
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures_in_window, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let cb = breaker(fast_recovery());
        for _ in 0..5 {
            cb.record_failure("apex").await.unwrap();
        }
        assert!(cb.is_call_allowed("apex").await.unwrap()); // now half-open
        cb.record_success("apex").await.unwrap();
        cb.record_failure("apex").await.unwrap();
        // get_stats runs the availability check; with zero recovery timeout
        // the reopened breaker immediately probes again, so inspect totals
        // to confirm the failure registered.
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.total_failures, 6);
        assert_ne!(stats.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn get_stats_performs_the_open_to_half_open_transition() {
        let cb = breaker(fast_recovery());
        cb.force_open("apex").await.unwrap();
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::HalfOpen);
        assert!(stats.is_available);
    }

    #[tokio::test]
    async fn failures_outside_window_are_pruned() {
        let store = Arc::new(MemoryKeyValueStore::new());
        let cb = CircuitBreaker::new(store.clone(), BreakerConfig::default());

        // Seed four stale failures well outside the 60s window.
        let stale = Utc::now().timestamp_millis() - 120_000;
        let record = serde_json::json!({
            "state": "closed",
            "failure_times_ms": [stale, stale + 1, stale + 2, stale + 3],
            "opened_at_ms": null,
            "half_open_successes": 0,
            "total_successes": 0,
            "total_failures": 4,
            "last_state_change_ms": stale,
        });
        store.set("breaker:apex", record, None).await.unwrap();

        // One fresh failure is not enough to open: stale entries dropped.
        cb.record_failure("apex").await.unwrap();
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failures_in_window, 1);
    }

    #[tokio::test]
    async fn state_is_a_pure_function_of_the_call_sequence() {
        // The same sequence replayed against fresh breakers always lands in
        // the same state.
        let sequence = [true, false, false, true, false, false, false, false, false];
        let mut states = Vec::new();
        for _ in 0..3 {
            let cb = breaker(BreakerConfig::default());
            for &success in &sequence {
                if success {
                    cb.record_success("p").await.unwrap();
                } else {
                    cb.record_failure("p").await.unwrap();
                }
            }
            states.push(cb.get_stats("p").await.unwrap().state);
        }
        assert!(states.windows(2).all(|w| w[0] == w[1]));
        // 7 failures in-window with threshold 5: breaker must be open.
        assert_eq!(states[0], CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_clears_persisted_state() {
        let cb = breaker(BreakerConfig::default());
        cb.force_open("apex").await.unwrap();
        cb.reset("apex").await.unwrap();
        let stats = cb.get_stats("apex").await.unwrap();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_failures, 0);
    }

    #[tokio::test]
    async fn list_all_reports_every_tracked_provider() {
        let cb = breaker(BreakerConfig::default());
        cb.record_failure("apex").await.unwrap();
        cb.record_success("structura").await.unwrap();
        let all = cb.list_all().await.unwrap();
        let providers: Vec<&str> = all.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(providers, vec!["apex", "structura"]);
    }
}
