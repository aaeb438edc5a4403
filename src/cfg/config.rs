// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::models::frame::MAX_PAYLOAD;

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Acceptor-side settings for the service daemon.
    pub service: ServiceSettings,
    /// Defaults applied to initiator transfers.
    pub transfer: TransferSettings,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServiceSettings {
    #[serde(rename = "BindAddress", default = "default_bind_address")]
    /// Local address the listener binds.
    pub bind_address: String,

    #[serde(rename = "Port")]
    /// Listening port; 0 picks an ephemeral port.
    pub port: u16,

    #[serde(rename = "Backlog", default = "default_backlog")]
    /// Listen backlog.
    pub backlog: u32,

    #[serde(rename = "MaxClients", default = "default_max_clients")]
    /// Concurrent session cap; further connections are refused.
    pub max_clients: usize,

    #[serde(rename = "SessionTimeout", with = "serde_secs", default = "default_session_timeout")]
    /// Per-operation I/O timeout inside a session (seconds).
    pub session_timeout: Duration,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            backlog: default_backlog(),
            max_clients: default_max_clients(),
            session_timeout: default_session_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct TransferSettings {
    #[serde(rename = "RemoteAddress", default)]
    /// Remote service endpoint for initiator transfers.
    pub remote_address: String,

    #[serde(rename = "ChunkSize")]
    /// DATA payload size per frame.
    pub chunk_size: u16,

    #[serde(rename = "Timeout", with = "serde_secs")]
    /// Per-frame response timeout (seconds).
    pub timeout: Duration,

    #[serde(rename = "MaxRetries")]
    /// Retransmissions allowed per DATA frame before the transfer fails.
    pub max_retries: u8,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_backlog() -> u32 {
    5
}

fn default_max_clients() -> usize {
    4
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants across both sections.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(self.service.max_clients >= 1, "MaxClients must be >= 1");
        ensure!(self.service.backlog >= 1, "Backlog must be >= 1");
        ensure!(
            self.service.session_timeout > Duration::ZERO,
            "SessionTimeout must be > 0"
        );

        ensure!(
            self.transfer.chunk_size >= 1 && self.transfer.chunk_size as usize <= MAX_PAYLOAD,
            "ChunkSize must be between 1 and {MAX_PAYLOAD}"
        );
        ensure!(
            self.transfer.timeout > Duration::ZERO,
            "Timeout must be > 0"
        );

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
