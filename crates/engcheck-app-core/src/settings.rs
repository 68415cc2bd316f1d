// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persisted settings for the live compliance monitor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::config::Setting;

/// Config key under which [`MonitorSettings`] are stored.
pub const MONITOR_KEY: &str = "monitor";

/// Everything the monitor needs besides the command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct MonitorSettings {
    /// Stream socket; `None` uses the runtime-dir default.
    pub socket_path: Option<PathBuf>,
    /// Categories to subscribe to (empty = all).
    pub categories: Vec<String>,
    /// Link lifecycle tuning.
    pub connection: ConnectionPrefs,
    /// Store and projection tuning.
    pub projections: ProjectionPrefs,
}

/// Timeouts, reconnect backoff and resync buffering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionPrefs {
    /// Handshake deadline (ms).
    pub handshake_timeout_ms: u64,
    /// Snapshot response deadline (ms).
    pub resync_timeout_ms: u64,
    /// First reconnect delay (ms).
    pub backoff_base_ms: u64,
    /// Reconnect delay cap (ms).
    pub backoff_max_ms: u64,
    /// Jitter ratio in `[0, 1]`.
    pub jitter: f64,
    /// Consecutive failures before a persistent-disconnection notice.
    pub max_retries: u32,
    /// Events buffered while awaiting a snapshot.
    pub buffer_capacity: usize,
}

impl Default for ConnectionPrefs {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            resync_timeout_ms: 10_000,
            backoff_base_ms: 250,
            backoff_max_ms: 30_000,
            jitter: 0.2,
            max_retries: 8,
            buffer_capacity: 4_096,
        }
    }
}

impl ConnectionPrefs {
    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Snapshot deadline.
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_millis(self.resync_timeout_ms)
    }

    /// First reconnect delay.
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Reconnect delay cap.
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// History, timeline and search tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProjectionPrefs {
    /// History entries kept per item.
    pub history_len: usize,
    /// Base timeline bucket width (s).
    pub bucket_secs: i64,
    /// Timeline lateness window (s).
    pub lateness_secs: i64,
    /// Edit budget cap per search token.
    pub max_typos: u8,
}

impl Default for ProjectionPrefs {
    fn default() -> Self {
        Self {
            history_len: 64,
            bucket_secs: 60,
            lateness_secs: 15 * 60,
            max_typos: 2,
        }
    }
}

/// Rejected settings.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    /// A duration or capacity that must be positive is zero.
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    /// Backoff base exceeds its cap.
    #[error("backoff base {base_ms}ms exceeds cap {max_ms}ms")]
    BackoffInverted {
        /// Base delay.
        base_ms: u64,
        /// Cap.
        max_ms: u64,
    },
    /// Jitter outside `[0, 1]`.
    #[error("jitter {0} is outside [0, 1]")]
    Jitter(f64),
    /// Negative lateness.
    #[error("lateness must not be negative")]
    NegativeLateness,
}

impl Setting for MonitorSettings {
    const KEY: &'static str = MONITOR_KEY;
    type Error = SettingsError;

    fn validate(&self) -> Result<(), SettingsError> {
        let c = &self.connection;
        let p = &self.projections;
        let positive = [
            ("handshake_timeout_ms", c.handshake_timeout_ms),
            ("resync_timeout_ms", c.resync_timeout_ms),
            ("backoff_base_ms", c.backoff_base_ms),
            ("buffer_capacity", c.buffer_capacity as u64),
            ("history_len", p.history_len as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(SettingsError::Zero(name));
        }
        if p.bucket_secs <= 0 {
            return Err(SettingsError::Zero("bucket_secs"));
        }
        if c.backoff_base_ms > c.backoff_max_ms {
            return Err(SettingsError::BackoffInverted {
                base_ms: c.backoff_base_ms,
                max_ms: c.backoff_max_ms,
            });
        }
        if !(0.0..=1.0).contains(&c.jitter) {
            return Err(SettingsError::Jitter(c.jitter));
        }
        if p.lateness_secs < 0 {
            return Err(SettingsError::NegativeLateness);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(MonitorSettings::default().validate(), Ok(()));
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let s: MonitorSettings =
            serde_json::from_str(r#"{"categories":["electrical"],"connection":{"max_retries":2}}"#).unwrap();
        assert_eq!(s.categories, vec!["electrical"]);
        assert_eq!(s.connection.max_retries, 2);
        assert_eq!(s.connection.backoff_max_ms, ConnectionPrefs::default().backoff_max_ms);
        assert_eq!(s.projections, ProjectionPrefs::default());
    }

    #[test]
    fn nonsense_is_rejected() {
        let mut s = MonitorSettings::default();
        s.connection.backoff_base_ms = 60_000;
        assert!(matches!(s.validate(), Err(SettingsError::BackoffInverted { .. })));

        let mut s = MonitorSettings::default();
        s.connection.jitter = 1.5;
        assert_eq!(s.validate(), Err(SettingsError::Jitter(1.5)));

        let mut s = MonitorSettings::default();
        s.connection.buffer_capacity = 0;
        assert_eq!(s.validate(), Err(SettingsError::Zero("buffer_capacity")));
    }
}
