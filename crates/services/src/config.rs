//! Runtime knobs for live sessions, read from `LIVE_*` environment variables.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use thiserror::Error;

use live_core::lifecycle::LifecyclePolicy;
use live_core::sync_policy::SyncPolicy;

pub const LOBBY_LEAD_KEY: &str = "LIVE_LOBBY_LEAD_SECS";
pub const DEFAULT_CAPACITY_KEY: &str = "LIVE_DEFAULT_CAPACITY";
pub const DEDUP_WINDOW_KEY: &str = "LIVE_DEDUP_WINDOW_SECS";
pub const POLL_ACTIVE_KEY: &str = "LIVE_POLL_ACTIVE_SECS";
pub const POLL_LOBBY_KEY: &str = "LIVE_POLL_LOBBY_SECS";
pub const POLL_IMMINENT_KEY: &str = "LIVE_POLL_IMMINENT_SECS";
pub const POLL_IDLE_KEY: &str = "LIVE_POLL_IDLE_SECS";

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{key} must be a non-negative whole number of seconds, got {value:?}")]
    InvalidSeconds { key: &'static str, value: String },

    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidCount { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    ZeroInterval { key: &'static str },
}

/// Settings shared by every live-session service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveConfig {
    pub lifecycle: LifecyclePolicy,
    pub sync: SyncPolicy,
    /// Cap applied to new sessions that do not set one.
    pub default_max_participants: Option<u32>,
}

impl LiveConfig {
    /// Reads settings from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, falling back to defaults for unset keys.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value is present but malformed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(secs) = seconds(&lookup, LOBBY_LEAD_KEY)? {
            let lead = ChronoDuration::from_std(secs).map_err(|_| ConfigError::InvalidSeconds {
                key: LOBBY_LEAD_KEY,
                value: secs.as_secs().to_string(),
            })?;
            config.lifecycle =
                LifecyclePolicy::new(lead).map_err(|_| ConfigError::InvalidSeconds {
                    key: LOBBY_LEAD_KEY,
                    value: secs.as_secs().to_string(),
                })?;
        }

        if let Some(raw) = lookup(DEFAULT_CAPACITY_KEY) {
            let max = raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|max| *max > 0)
                .ok_or(ConfigError::InvalidCount {
                    key: DEFAULT_CAPACITY_KEY,
                    value: raw.clone(),
                })?;
            config.default_max_participants = Some(max);
        }

        if let Some(window) = seconds(&lookup, DEDUP_WINDOW_KEY)? {
            config.sync.dedup_window = window;
        }

        let sync = &mut config.sync;
        for (key, slot) in [
            (POLL_ACTIVE_KEY, &mut sync.active_list),
            (POLL_LOBBY_KEY, &mut sync.lobby_list),
            (POLL_IMMINENT_KEY, &mut sync.imminent_list),
            (POLL_IDLE_KEY, &mut sync.idle_list),
        ] {
            if let Some(interval) = seconds(&lookup, key)? {
                if interval.is_zero() {
                    return Err(ConfigError::ZeroInterval { key });
                }
                *slot = interval;
            }
        }
        // Detail views poll at the same cadence as the matching list rows.
        sync.active_detail = sync.active_list;
        sync.lobby_detail = sync.lobby_list;

        Ok(config)
    }
}

fn seconds<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|secs| Some(Duration::from_secs(secs)))
        .map_err(|_| ConfigError::InvalidSeconds { key, value: raw })
}
