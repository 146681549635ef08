#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Observability: Prometheus metrics. Structured logging uses `tracing`
//! directly at call sites rather than a wrapper module, matching the
//! teacher's layout.

pub mod metrics;

pub use metrics::{Metrics, MetricsError};
