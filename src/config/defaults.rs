//! System-wide default constants.
//!
//! Every tunable in `RelayConfig` falls back to one of these values.
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Collector
// ============================================================================

/// Collector endpoint used when no config file sets one.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/collect";

/// Path appended to the endpoint origin for the reachability probe.
pub const DEFAULT_PROBE_PATH: &str = "/favicon.ico";

// ============================================================================
// Transport
// ============================================================================

/// Maximum full URL length for the pixel (GET) strategy.
pub const MAX_URL_LENGTH: usize = 2048;

/// Maximum encoded payload size for the beacon strategy (bytes). 128 KiB.
pub const MAX_BEACON_BYTES: usize = 64 * 2048;

/// Beacon channel capacity. A full channel counts as a refused enqueue.
pub const BEACON_BUFFER: usize = 64;

/// Query parameter carrying the send timestamp on pixel requests.
pub const PIXEL_TS_PARAM: &str = "_ts";

// ============================================================================
// Queue
// ============================================================================

/// Queue length that forces an immediate flush.
pub const QUEUE_MAX: usize = 10;

/// Wait before a partially-filled queue is flushed (ms).
pub const QUEUE_WAIT_MS: u64 = 5_000;

// ============================================================================
// Retry Store
// ============================================================================

/// Maximum number of records kept in the retry store.
pub const RETRY_MAX_ITEMS: usize = 1_000;

/// Records sent per replay slice.
pub const RETRY_SLICE_SIZE: usize = 5;

/// Pause between successful replay slices (ms).
pub const RETRY_PAUSE_MS: u64 = 500;

/// Default on-disk location of the retry store.
pub const RETRY_STORE_PATH: &str = "./data/retry";

/// Key holding the persisted JSON array.
pub const RETRY_STORE_KEY: &str = "RETRY_LOGS";

// ============================================================================
// Correlator
// ============================================================================

/// Quiet period after the last completion before tracked calls are reported (ms).
pub const CORRELATOR_DEBOUNCE_MS: u64 = 500;

/// Maximum number of calls tracked at once.
pub const CORRELATOR_MAX_TRACKED: usize = 1_000;

// ============================================================================
// Lifecycle
// ============================================================================

/// How long shutdown waits for queued beacons to drain (ms).
pub const SHUTDOWN_GRACE_MS: u64 = 2_000;
