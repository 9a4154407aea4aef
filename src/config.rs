//! Recognized configuration options for the coordination core.
//!
//! Construct via [`CoordinationConfig::default`] and refine with the
//! builder-style `with_*` methods. [`CoordinationConfig::from_env`] layers
//! `.env` / environment overrides on top of the defaults, following the same
//! resolution order this codebase's runtime configuration uses elsewhere.

use std::time::Duration;

/// Recognized configuration options (see spec §6 "Configuration").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoordinationConfig {
    /// `session.lease_duration` — default 10 minutes.
    pub session_lease_duration: Duration,
    /// `session.renew_interval` — default `lease_duration / 2`.
    pub session_renew_interval: Duration,
    /// `gc.max_sweep_interval` — default 10 seconds.
    pub gc_max_sweep_interval: Duration,
    /// `reconnect.backoff_initial` — default 1 second.
    pub reconnect_backoff_initial: Duration,
    /// `reconnect.backoff_max` — default 12 seconds.
    pub reconnect_backoff_max: Duration,
    /// `cache.enabled` — default `true`. When `false`, `get` does not cache
    /// and does not take a read-lock.
    pub cache_enabled: bool,
    /// Bounded number of internal retries for transient store/transport
    /// failures before `StoreFailure` / `TransportFailure` surfaces.
    pub max_retry_attempts: u32,
    /// Safety margin before `lease_end` at which an unrenewable session
    /// self-terminates rather than risk racing the remote expiry.
    pub session_renew_safety_margin: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        let lease = Duration::from_secs(10 * 60);
        Self {
            session_lease_duration: lease,
            session_renew_interval: lease / 2,
            gc_max_sweep_interval: Duration::from_secs(10),
            reconnect_backoff_initial: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(12),
            cache_enabled: true,
            max_retry_attempts: 8,
            session_renew_safety_margin: Duration::from_secs(30),
        }
    }
}

impl CoordinationConfig {
    /// Start from defaults, then apply `PATHKEEPER_*` environment overrides
    /// loaded via `.env` (if present).
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Some(secs) = env_u64("PATHKEEPER_SESSION_LEASE_SECS") {
            config.session_lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PATHKEEPER_SESSION_RENEW_SECS") {
            config.session_renew_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PATHKEEPER_GC_MAX_SWEEP_SECS") {
            config.gc_max_sweep_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PATHKEEPER_BACKOFF_INITIAL_SECS") {
            config.reconnect_backoff_initial = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("PATHKEEPER_BACKOFF_MAX_SECS") {
            config.reconnect_backoff_max = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("PATHKEEPER_CACHE_ENABLED") {
            if let Ok(parsed) = val.parse() {
                config.cache_enabled = parsed;
            }
        }
        config
    }

    #[must_use]
    pub fn with_session_lease_duration(mut self, duration: Duration) -> Self {
        self.session_lease_duration = duration;
        self
    }

    #[must_use]
    pub fn with_session_renew_interval(mut self, duration: Duration) -> Self {
        self.session_renew_interval = duration;
        self
    }

    #[must_use]
    pub fn with_gc_max_sweep_interval(mut self, duration: Duration) -> Self {
        self.gc_max_sweep_interval = duration;
        self
    }

    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_backoff_initial = initial;
        self.reconnect_backoff_max = max;
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
