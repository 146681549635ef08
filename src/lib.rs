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

//! `bepd`: a long-lived BEP (Block Exchange Protocol) master endpoint.
//!
//! This crate provides:
//! - Device identity derived from X.509 certificates, with the fleet's
//!   canonical check-digit string form.
//! - A versioned, XDR-encoded, optionally LZ4-compressed wire codec.
//! - Vector clocks governing file version ordering.
//! - A duplex framed-message `Connection` over any async byte stream.
//! - A per-peer `Session` state machine: handshake, steady-state dispatch,
//!   heartbeats, and request/response correlation.
//! - A `Model` routing decoded messages and local index changes between
//!   connected peers and a pluggable `Storage` backend.
//! - Prometheus metrics for session and frame activity.
//!
//! Out of scope (see `config` for the knobs a deployment supplies instead):
//! filesystem walking and block hashing, TLS listener bootstrap and
//! certificate loading, and discovery of peer network addresses.

/// Protocol-level primitives: device identity, vector clocks, the XDR
/// message schema, and the frame codec built on top of it.
pub mod core;
/// Deployment configuration: client identity, compression policy, and the
/// handful of knobs a composition root needs to construct a `Model`.
pub mod config;
/// The process-wide peer registry and index router sitting between the
/// session layer and persistence.
pub mod model;
/// Observability: Prometheus metrics.
pub mod monitoring;
/// The BEP session layer: framed `Connection` and per-peer `Session`.
pub mod networking;
/// Durable state behind the `Storage` collaborator interface.
pub mod storage;
