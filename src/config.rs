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

//! Deployment configuration for a `bepd` process: client identity, the
//! compression policy applied to outgoing frames, and the handful of knobs
//! the composition root reads to wire up a `Model` and its `Storage`
//! backend. CLI parsing, TLS certificate loading, and peer address
//! discovery are the bootstrap layer's job and stay out of this crate; see
//! §1 and §6 of the design notes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::codec::CompressionPolicy;

/// Errors loading a [`BepConfig`] from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// The file's contents did not parse as valid TOML for this shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A `bepd` process's static configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BepConfig {
    /// Announced in every outbound `ClusterConfig` as the sender's
    /// human-readable client name.
    pub client_name: String,
    /// Announced in every outbound `ClusterConfig` as the sender's client
    /// version string.
    pub client_version: String,
    /// Half the interval between heartbeat ticks; see `PING_IDLE_TIME` in
    /// the design notes (default 60s, so the tick itself fires every 30s).
    pub ping_idle_secs: u64,
    /// When to LZ4-compress outgoing frame bodies.
    pub compression: CompressionPolicy,
    /// Informational only: the address a bootstrap layer should bind its
    /// TLS listener to. This crate never binds a socket itself.
    pub listen_addr: String,
    /// Directory `SledStorage` persists its database under.
    pub data_dir: PathBuf,
}

impl Default for BepConfig {
    fn default() -> Self {
        Self {
            client_name: "bepd".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            ping_idle_secs: 60,
            compression: CompressionPolicy::Default,
            listen_addr: "0.0.0.0:22000".to_string(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl BepConfig {
    /// Load a config from a TOML file, falling back to [`Default`] for any
    /// field the file omits.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// This config's heartbeat interval, expressed as a
    /// `networking::session::HeartbeatConfig`.
    pub fn heartbeat(&self) -> crate::networking::session::HeartbeatConfig {
        crate::networking::session::HeartbeatConfig {
            ping_idle: std::time::Duration::from_secs(self.ping_idle_secs),
            idle_timeout_multiplier: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_through_toml() {
        let cfg = BepConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let parsed: BepConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let parsed: BepConfig = toml::from_str("client_name = \"custom\"\n").unwrap();
        assert_eq!(parsed.client_name, "custom");
        assert_eq!(parsed.ping_idle_secs, BepConfig::default().ping_idle_secs);
    }
}
