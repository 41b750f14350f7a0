//! Ambient tunables: dispatch cadence, heartbeat interval, peer expiry.
//!
//! Mirrors the way the rest of this corpus loads small operational knobs —
//! typed defaults, overridable from the environment, read once at
//! construction.

use std::time::Duration;

use tracing::warn;

const ENV_DISPATCH_TICK_MS: &str = "CRATOS_RATELIMIT_DISPATCH_TICK_MS";
const ENV_HEARTBEAT_INTERVAL_MS: &str = "CRATOS_RATELIMIT_HEARTBEAT_INTERVAL_MS";
const ENV_EXPIRY_MULTIPLIER: &str = "CRATOS_RATELIMIT_EXPIRY_MULTIPLIER";
const ENV_READY_QUIESCENCE_MS: &str = "CRATOS_RATELIMIT_READY_QUIESCENCE_MS";

const DEFAULT_DISPATCH_TICK_MS: u64 = 100;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_EXPIRY_MULTIPLIER: u32 = 3;
const DEFAULT_READY_QUIESCENCE_MS: u64 = 100;

/// Tunables for the dispatch loop and the peer-coordination protocol.
///
/// `Default` gives the values a standalone caller should expect; `from_env`
/// layers environment-variable overrides on top, the way
/// `TelemetryConfig::default_enabled` reads `CRATOS_TELEMETRY_ENABLED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterSettings {
    /// How often the dispatcher polls the quota manager for admission.
    pub dispatch_tick: Duration,
    /// How often a distributed instance broadcasts `HELLO`.
    pub heartbeat_interval: Duration,
    /// `k` in `expiry_horizon = k * heartbeat_interval`.
    pub expiry_multiplier: u32,
    /// Settle delay after entering READY, before trusting the first share.
    pub ready_quiescence: Duration,
}

impl LimiterSettings {
    /// The discovery window: how long a distributed manager without
    /// `fast_start` waits before declaring READY. Comfortably more than one
    /// heartbeat period so two peers starting on the same tick still
    /// converge (see the simultaneous-construction design note).
    pub fn discovery_window(&self) -> Duration {
        self.heartbeat_interval * 4
    }

    /// The age past which a silent peer is considered gone.
    pub fn expiry_horizon(&self) -> Duration {
        self.heartbeat_interval * self.expiry_multiplier
    }

    /// Load defaults, overridden by `CRATOS_RATELIMIT_*` environment
    /// variables where present and parseable. An unparseable override is
    /// logged and ignored rather than treated as fatal.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dispatch_tick: env_millis(ENV_DISPATCH_TICK_MS, defaults.dispatch_tick),
            heartbeat_interval: env_millis(ENV_HEARTBEAT_INTERVAL_MS, defaults.heartbeat_interval),
            expiry_multiplier: env_u32(ENV_EXPIRY_MULTIPLIER, defaults.expiry_multiplier),
            ready_quiescence: env_millis(ENV_READY_QUIESCENCE_MS, defaults.ready_quiescence),
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            dispatch_tick: Duration::from_millis(DEFAULT_DISPATCH_TICK_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            expiry_multiplier: DEFAULT_EXPIRY_MULTIPLIER,
            ready_quiescence: Duration::from_millis(DEFAULT_READY_QUIESCENCE_MS),
        }
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(value) => match value.parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => {
                warn!(env = key, value, "ignoring unparseable override");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(value) => match value.parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                warn!(env = key, value, "ignoring unparseable override");
                default
            }
        },
        Err(_) => default,
    }
}
