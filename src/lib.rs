//! telemetry-relay: reliable client-side telemetry delivery
//!
//! Accepts event records from instrumentation producers and gets them to a
//! remote collector despite flaky connectivity, host teardown and payload
//! size limits.
//!
//! ## Architecture
//!
//! - **Delivery Queue**: batches records, flushes on size, timer or teardown
//! - **Transport Selector**: beacon → pixel → keep-alive POST → blocking POST
//! - **Retry Store**: durable sled-backed log of undelivered records, replayed
//!   in small paced slices once the collector is reachable again
//! - **Network Monitor**: probe-verified connectivity belief
//! - **Completion Correlator**: turns outbound call start/complete pairs into
//!   debounced aggregate reports

pub mod config;
pub mod correlator;
pub mod dispatch;
pub mod network;
pub mod pipeline;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod transport;
pub mod types;

// Re-export configuration
pub use config::{ConfigError, RelayConfig};

// Re-export the pipeline surface
pub use correlator::{CallKind, RequestKey};
pub use pipeline::{HostSignal, Pipeline, PipelineBuilder, PipelineError};

// Re-export extension points
pub use network::{HttpProber, Prober};
pub use store::{InMemoryBackend, ReplayOutcome, RetryBackend, SledBackend};
pub use transport::{DeliveryError, Strategy};

// Re-export data model
pub use types::{Batch, EventRecord, Payload, StatsSnapshot};
