// Copyright (c) 2026 bepd
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Prometheus counters and gauges for the BEP session layer: frame and
//! session activity, compression effectiveness, and request/response
//! outcomes. Incremented at the `Connection` and `Session` boundaries so a
//! deployment's dashboards line up with its `tracing` logs.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use thiserror::Error;

use crate::core::message::ResponseCode;

/// Errors registering metrics with the Prometheus registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric with this name is already registered, or the registry
    /// otherwise rejected it.
    #[error("failed to register metric: {0}")]
    Register(#[from] prometheus::Error),
}

/// Process-wide BEP metrics, constructed once and cloned (`Arc`) into every
/// `Connection` and `Session`.
#[derive(Clone)]
pub struct Metrics {
    /// The registry every metric below is registered against.
    pub registry: Registry,

    /// Number of sessions currently in `Ready` or earlier (not yet closed).
    pub sessions_active: IntGauge,
    /// Frames successfully written to the wire.
    pub frames_sent_total: IntCounter,
    /// Frames successfully decoded off the wire.
    pub frames_recv_total: IntCounter,
    /// Outgoing frames whose body was LZ4-compressed.
    pub frames_compressed_total: IntCounter,
    /// Frames that failed to decode (truncated, bad XDR, bad LZ4).
    pub decode_errors_total: IntCounter,
    /// Frames silently skipped for an unsupported version or unknown type.
    pub unknown_frames_total: IntCounter,
    /// `Request` messages received.
    pub requests_total: IntCounter,
    /// `Response` messages sent, labeled by status code.
    pub responses_total: IntCounterVec,
}

impl Metrics {
    /// Build a fresh registry and register every counter/gauge against it.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let sessions_active =
            IntGauge::new("bep_sessions_active", "Sessions not yet closed")?;
        let frames_sent_total =
            IntCounter::new("bep_frames_sent_total", "Frames written to the wire")?;
        let frames_recv_total =
            IntCounter::new("bep_frames_recv_total", "Frames decoded off the wire")?;
        let frames_compressed_total = IntCounter::new(
            "bep_frames_compressed_total",
            "Outgoing frames whose body was LZ4-compressed",
        )?;
        let decode_errors_total =
            IntCounter::new("bep_decode_errors_total", "Frames that failed to decode")?;
        let unknown_frames_total = IntCounter::new(
            "bep_unknown_frames_total",
            "Frames skipped for an unsupported version or unknown type",
        )?;
        let requests_total = IntCounter::new("bep_requests_total", "Request messages received")?;
        let responses_total = IntCounterVec::new(
            Opts::new("bep_responses_total", "Response messages sent, by status code"),
            &["code"],
        )?;

        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(frames_sent_total.clone()))?;
        registry.register(Box::new(frames_recv_total.clone()))?;
        registry.register(Box::new(frames_compressed_total.clone()))?;
        registry.register(Box::new(decode_errors_total.clone()))?;
        registry.register(Box::new(unknown_frames_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(responses_total.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            frames_sent_total,
            frames_recv_total,
            frames_compressed_total,
            decode_errors_total,
            unknown_frames_total,
            requests_total,
            responses_total,
        })
    }

    /// Bump `responses_total{code}` for the response code just sent.
    pub fn record_response(&self, code: ResponseCode) {
        let label = match code {
            ResponseCode::NoError => "no_error",
            ResponseCode::Error => "error",
            ResponseCode::NoSuchFile => "no_such_file",
            ResponseCode::Invalid => "invalid",
        };
        self.responses_total.with_label_values(&[label]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking() {
        let metrics = Metrics::new().unwrap();
        metrics.frames_sent_total.inc();
        metrics.record_response(ResponseCode::NoSuchFile);
        assert_eq!(metrics.frames_sent_total.get(), 1);
        assert_eq!(
            metrics
                .responses_total
                .with_label_values(&["no_such_file"])
                .get(),
            1
        );
    }
}
