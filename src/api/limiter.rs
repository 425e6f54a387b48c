//! Per-client rate limiting.
//!
//! Each client IP owns an independent token bucket held in a single registry
//! map. One mutex guards the whole map and is held for exactly one
//! lookup/update, never across an await. A background sweep evicts buckets
//! that have been idle past [`IDLE_EVICTION`] so the map stays bounded.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::api::{error::ApiError, AppState};

/// How often the background sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Clients unseen for this long have their throttle state removed.
pub const IDLE_EVICTION: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("requests per second must be a finite value greater than zero")]
    InvalidRate,
    #[error("burst must be at least 1")]
    InvalidBurst,
}

/// Validated limiter settings. Construction is the only place bad values can
/// be rejected; the hot path never re-checks them.
#[derive(Clone, Copy, Debug)]
pub struct LimiterConfig {
    requests_per_second: f64,
    burst: u32,
    enabled: bool,
}

impl LimiterConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the sustained rate is not a finite
    /// positive number or the burst is zero
    pub fn new(requests_per_second: f64, burst: u32, enabled: bool) -> Result<Self, ConfigError> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return Err(ConfigError::InvalidRate);
        }
        if burst == 0 {
            return Err(ConfigError::InvalidBurst);
        }
        Ok(Self {
            requests_per_second,
            burst,
            enabled,
        })
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }
}

/// One client's token bucket. Tokens refill continuously at the sustained
/// rate, capped at the burst capacity.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    fn try_consume(&mut self, now: Instant, rate: f64, capacity: u32) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(f64::from(capacity));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct ClientState {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Registry of per-client throttle state.
///
/// Owns its own lock; constructed once and shared by reference with the
/// middleware and the sweep loop. No ambient globals.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    config: LimiterConfig,
    clients: Mutex<HashMap<IpAddr, ClientState>>,
}

impl RateLimiterRegistry {
    #[must_use]
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token for `key`, creating fresh full-bucket state on the
    /// first sighting. Never blocks beyond the map lock.
    ///
    /// When the limiter is disabled this is a constant `true` with no
    /// bookkeeping at all.
    pub fn allow(&self, key: IpAddr) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: IpAddr, now: Instant) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut clients = self.clients.lock().unwrap_or_else(|poison| {
            // A panic while holding the lock cannot leave a bucket half
            // updated, the map is still structurally sound
            poison.into_inner()
        });

        let state = clients.entry(key).or_insert_with(|| ClientState {
            bucket: TokenBucket::full(self.config.burst, now),
            last_seen: now,
        });
        state.last_seen = now;
        state
            .bucket
            .try_consume(now, self.config.requests_per_second, self.config.burst)
    }

    /// Remove state for clients unseen within [`IDLE_EVICTION`]. Returns the
    /// number of entries dropped.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&self, now: Instant) -> usize {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = clients.len();
        clients.retain(|_, state| now.saturating_duration_since(state.last_seen) <= IDLE_EVICTION);
        before - clients.len()
    }

    /// Number of clients currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Spawn the eviction loop. Runs for the life of the process; sweeps and
/// `allow` calls are mutually exclusive through the registry lock.
pub fn spawn_sweeper(registry: std::sync::Arc<RateLimiterRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(SWEEP_INTERVAL).await;
            let removed = registry.sweep();
            if removed > 0 {
                debug!(removed, "rate limiter swept idle clients");
            }
        }
    })
}

/// Pipeline stage 1: throttle by peer address before anything else runs.
pub async fn throttle(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.allow(addr.ip()) {
        return ApiError::RateLimited.into_response();
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn config(rps: f64, burst: u32) -> LimiterConfig {
        LimiterConfig::new(rps, burst, true).unwrap()
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert_eq!(
            LimiterConfig::new(0.0, 4, true).unwrap_err(),
            ConfigError::InvalidRate
        );
        assert_eq!(
            LimiterConfig::new(-1.0, 4, true).unwrap_err(),
            ConfigError::InvalidRate
        );
        assert_eq!(
            LimiterConfig::new(f64::NAN, 4, true).unwrap_err(),
            ConfigError::InvalidRate
        );
        assert_eq!(
            LimiterConfig::new(f64::INFINITY, 4, true).unwrap_err(),
            ConfigError::InvalidRate
        );
        assert_eq!(
            LimiterConfig::new(2.0, 0, true).unwrap_err(),
            ConfigError::InvalidBurst
        );
    }

    #[test]
    fn test_burst_exhaustion_then_refill() {
        let registry = RateLimiterRegistry::new(config(2.0, 4));
        let now = Instant::now();

        // the full burst passes, the next request does not
        for _ in 0..4 {
            assert!(registry.allow_at(key(1), now));
        }
        assert!(!registry.allow_at(key(1), now));

        // one full refill interval buys exactly one more token
        let later = now + Duration::from_millis(500);
        assert!(registry.allow_at(key(1), later));
        assert!(!registry.allow_at(key(1), later));
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let registry = RateLimiterRegistry::new(config(100.0, 2));
        let now = Instant::now();

        assert!(registry.allow_at(key(1), now));

        // a long idle period must not bank more than the burst capacity
        let later = now + Duration::from_secs(60);
        assert!(registry.allow_at(key(1), later));
        assert!(registry.allow_at(key(1), later));
        assert!(!registry.allow_at(key(1), later));
    }

    #[test]
    fn test_clients_are_independent() {
        let registry = RateLimiterRegistry::new(config(1.0, 2));
        let now = Instant::now();

        assert!(registry.allow_at(key(1), now));
        assert!(registry.allow_at(key(1), now));
        assert!(!registry.allow_at(key(1), now));

        // a different key still has its full bucket
        assert!(registry.allow_at(key(2), now));
        assert!(registry.allow_at(key(2), now));
    }

    #[test]
    fn test_sweep_evicts_idle_clients_only() {
        let registry = RateLimiterRegistry::new(config(1.0, 1));
        let now = Instant::now();

        assert!(registry.allow_at(key(1), now));
        assert!(registry.allow_at(key(2), now + IDLE_EVICTION));
        assert_eq!(registry.tracked(), 2);

        let removed = registry.sweep_at(now + IDLE_EVICTION + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(registry.tracked(), 1);
    }

    #[test]
    fn test_fresh_state_after_eviction_has_full_bucket() {
        let registry = RateLimiterRegistry::new(config(0.001, 2));
        let now = Instant::now();

        assert!(registry.allow_at(key(1), now));
        assert!(registry.allow_at(key(1), now));
        assert!(!registry.allow_at(key(1), now));

        let later = now + IDLE_EVICTION + Duration::from_secs(1);
        registry.sweep_at(later);
        assert_eq!(registry.tracked(), 0);

        // fresh bucket, full burst again
        assert!(registry.allow_at(key(1), later));
        assert!(registry.allow_at(key(1), later));
    }

    #[test]
    fn test_disabled_limiter_keeps_no_state() {
        let registry = RateLimiterRegistry::new(LimiterConfig::new(1.0, 1, false).unwrap());
        let now = Instant::now();

        for _ in 0..100 {
            assert!(registry.allow_at(key(1), now));
        }
        assert_eq!(registry.tracked(), 0);
    }
}
