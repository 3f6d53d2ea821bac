// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// CloudKeeper orchestration configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Time a cancelled execution gets to terminate before it is aborted
    pub cancel_grace_period: Duration,
    /// Capacity of the execution event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cancel_grace_period: Duration::from_secs(60),
            event_channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `CLOUDKEEPER_CANCEL_GRACE_PERIOD_SECS`: Grace period after cancellation (default: 60)
    /// - `CLOUDKEEPER_EVENT_CHANNEL_CAPACITY`: Event channel capacity (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        let grace_secs: u64 = std::env::var("CLOUDKEEPER_CANCEL_GRACE_PERIOD_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "CLOUDKEEPER_CANCEL_GRACE_PERIOD_SECS",
                    "must be a non-negative integer",
                )
            })?;

        let event_channel_capacity: usize = std::env::var("CLOUDKEEPER_EVENT_CHANNEL_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()
            .ok()
            .filter(|capacity| *capacity > 0)
            .ok_or(ConfigError::Invalid(
                "CLOUDKEEPER_EVENT_CHANNEL_CAPACITY",
                "must be a positive integer",
            ))?;

        Ok(Self {
            cancel_grace_period: Duration::from_secs(grace_secs),
            event_channel_capacity,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
