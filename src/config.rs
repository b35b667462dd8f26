//! Runtime configuration.
//!
//! DESIGN
//! ======
//! Every tuning knob of the room engine is an environment variable with a
//! sensible default, collected once at startup into a `Config` that rides
//! along in `AppState`. Tests construct `Config` literals directly to pin
//! timers down to milliseconds.

use tracing::info;

const DEFAULT_IDLE_GRACE_MS: u64 = 30_000;
const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_SNAPSHOT_RETRIES: usize = 3;
const DEFAULT_SNAPSHOT_RETRY_BASE_MS: u64 = 200;
const DEFAULT_MAX_FRAME_BYTES: usize = 65_536;

/// Tuning knobs for room lifecycle, fan-out, and snapshot persistence.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// How long an empty room lingers before retirement, in milliseconds.
    pub idle_grace_ms: u64,
    /// Bounded outbound queue size per connection. Overflow evicts the client.
    pub outbound_queue_capacity: usize,
    /// Period of the background snapshot save task, in milliseconds.
    pub snapshot_interval_ms: u64,
    /// Attempts per snapshot save before giving up for the cycle.
    pub snapshot_retries: usize,
    /// Base delay in milliseconds for linear snapshot retry back-off.
    pub snapshot_retry_base_ms: u64,
    /// Maximum accepted inbound frame size in bytes. Larger frames are
    /// rejected as malformed before parsing.
    pub max_frame_bytes: usize,
}

impl Config {
    #[must_use]
    pub fn from_env() -> Self {
        let config = Self {
            idle_grace_ms: env_parse("IDLE_GRACE_MS", DEFAULT_IDLE_GRACE_MS),
            outbound_queue_capacity: env_parse("OUTBOUND_QUEUE_CAPACITY", DEFAULT_OUTBOUND_QUEUE_CAPACITY),
            snapshot_interval_ms: env_parse("SNAPSHOT_INTERVAL_MS", DEFAULT_SNAPSHOT_INTERVAL_MS),
            snapshot_retries: env_parse("SNAPSHOT_RETRIES", DEFAULT_SNAPSHOT_RETRIES),
            snapshot_retry_base_ms: env_parse("SNAPSHOT_RETRY_BASE_MS", DEFAULT_SNAPSHOT_RETRY_BASE_MS),
            max_frame_bytes: env_parse("MAX_FRAME_BYTES", DEFAULT_MAX_FRAME_BYTES),
        };
        info!(
            idle_grace_ms = config.idle_grace_ms,
            outbound_queue_capacity = config.outbound_queue_capacity,
            snapshot_interval_ms = config.snapshot_interval_ms,
            snapshot_retries = config.snapshot_retries,
            snapshot_retry_base_ms = config.snapshot_retry_base_ms,
            max_frame_bytes = config.max_frame_bytes,
            "room engine configured"
        );
        config
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_grace_ms: DEFAULT_IDLE_GRACE_MS,
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            snapshot_interval_ms: DEFAULT_SNAPSHOT_INTERVAL_MS,
            snapshot_retries: DEFAULT_SNAPSHOT_RETRIES,
            snapshot_retry_base_ms: DEFAULT_SNAPSHOT_RETRY_BASE_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
