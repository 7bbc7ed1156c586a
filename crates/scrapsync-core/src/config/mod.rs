//! Runtime configuration for the sync engine.
//!
//! Values come from `SCRAPSYNC_*` environment variables. Timer intervals are not
//! read from the environment; they default to production values and can be
//! overridden in code.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::TenantId;
use crate::util::is_http_url;

pub const DEFAULT_TRANSFER_PORT: u16 = 8765;
pub const DEFAULT_TRANSFER_FALLBACK_PORT: u16 = 8766;
pub const DEFAULT_DISCOVERY_PORT: u16 = 41234;
/// One announce period plus slack, so a listening window always spans a
/// peer's broadcast
pub const DEFAULT_DISCOVERY_WINDOW_SECS: u64 = 6;
const DEFAULT_DEVICE_NAME: &str = "scrapsync-device";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fixed timer periods of the background scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncIntervals {
    /// Presence broadcast period
    pub announce: Duration,
    /// Upload-only sweep
    pub upload: Duration,
    /// Realtime mismatch poll
    pub realtime: Duration,
    /// Connectivity probe
    pub network: Duration,
    /// Minimum spacing between silent full pulls triggered by the realtime poll
    pub realtime_debounce: Duration,
}

impl Default for SyncIntervals {
    fn default() -> Self {
        Self {
            announce: Duration::from_secs(5),
            upload: Duration::from_secs(5 * 60),
            realtime: Duration::from_secs(30),
            network: Duration::from_secs(30),
            realtime_debounce: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct SyncSettings {
    pub tenant: TenantId,
    pub device_name: String,
    /// Base URL of the cloud store; `None` disables cloud sync
    pub cloud_url: Option<String>,
    pub transfer_port: u16,
    pub transfer_fallback_port: u16,
    pub discovery_port: u16,
    pub peer_sync_enabled: bool,
    pub discovery_window: Duration,
    /// Mismatches reported within this period after an upload are suppressed
    pub mismatch_suppression: Duration,
    pub intervals: SyncIntervals,
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("tenant", &"[REDACTED]")
            .field("device_name", &self.device_name)
            .field("cloud_url", &self.cloud_url)
            .field("transfer_port", &self.transfer_port)
            .field("transfer_fallback_port", &self.transfer_fallback_port)
            .field("discovery_port", &self.discovery_port)
            .field("peer_sync_enabled", &self.peer_sync_enabled)
            .field("discovery_window", &self.discovery_window)
            .field("mismatch_suppression", &self.mismatch_suppression)
            .field("intervals", &self.intervals)
            .finish()
    }
}

impl SyncSettings {
    /// Settings with defaults for everything but the tenant
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            cloud_url: None,
            transfer_port: DEFAULT_TRANSFER_PORT,
            transfer_fallback_port: DEFAULT_TRANSFER_FALLBACK_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            peer_sync_enabled: true,
            discovery_window: Duration::from_secs(DEFAULT_DISCOVERY_WINDOW_SECS),
            mismatch_suppression: Duration::from_secs(30 * 60),
            intervals: SyncIntervals::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let tenant = required_trimmed(&lookup, "SCRAPSYNC_ACTIVATION_ID")?
            .parse::<TenantId>()
            .map_err(|_| {
                ConfigError::Invalid("SCRAPSYNC_ACTIVATION_ID must be an integer".to_string())
            })?;

        let device_name = optional_trimmed(&lookup, "SCRAPSYNC_DEVICE_NAME")
            .or_else(|| optional_trimmed(&lookup, "HOSTNAME"))
            .or_else(|| optional_trimmed(&lookup, "COMPUTERNAME"))
            .unwrap_or_else(|| DEFAULT_DEVICE_NAME.to_string());

        let cloud_url = optional_trimmed(&lookup, "SCRAPSYNC_CLOUD_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = cloud_url.as_deref() {
            if !is_http_url(url) {
                return Err(ConfigError::Invalid(
                    "SCRAPSYNC_CLOUD_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let transfer_port = parse_port(&lookup, "SCRAPSYNC_TRANSFER_PORT", DEFAULT_TRANSFER_PORT)?;
        let transfer_fallback_port = parse_port(
            &lookup,
            "SCRAPSYNC_TRANSFER_FALLBACK_PORT",
            DEFAULT_TRANSFER_FALLBACK_PORT,
        )?;
        let discovery_port =
            parse_port(&lookup, "SCRAPSYNC_DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT)?;

        let peer_sync_enabled = match value_or_default(&lookup, "SCRAPSYNC_PEER_SYNC", "true")
            .to_ascii_lowercase()
            .as_str()
        {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Invalid(
                    "SCRAPSYNC_PEER_SYNC must be true or false".to_string(),
                ))
            }
        };

        let discovery_window_secs = optional_trimmed(&lookup, "SCRAPSYNC_DISCOVERY_WINDOW_SECS")
            .map_or(Ok(DEFAULT_DISCOVERY_WINDOW_SECS), |value| value.parse::<u64>())
            .map_err(|_| {
                ConfigError::Invalid(
                    "SCRAPSYNC_DISCOVERY_WINDOW_SECS must be an integer in [1, 60]".to_string(),
                )
            })?;
        if !(1..=60).contains(&discovery_window_secs) {
            return Err(ConfigError::Invalid(
                "SCRAPSYNC_DISCOVERY_WINDOW_SECS must be in [1, 60]".to_string(),
            ));
        }

        let suppression_mins =
            value_or_default(&lookup, "SCRAPSYNC_MISMATCH_SUPPRESSION_MINS", "30")
                .parse::<u64>()
                .map_err(|_| {
                    ConfigError::Invalid(
                        "SCRAPSYNC_MISMATCH_SUPPRESSION_MINS must be an integer in [0, 1440]"
                            .to_string(),
                    )
                })?;
        if suppression_mins > 1_440 {
            return Err(ConfigError::Invalid(
                "SCRAPSYNC_MISMATCH_SUPPRESSION_MINS must be in [0, 1440]".to_string(),
            ));
        }

        Ok(Self {
            tenant,
            device_name,
            cloud_url,
            transfer_port,
            transfer_fallback_port,
            discovery_port,
            peer_sync_enabled,
            discovery_window: Duration::from_secs(discovery_window_secs),
            mismatch_suppression: Duration::from_secs(suppression_mins * 60),
            intervals: SyncIntervals::default(),
        })
    }
}

fn parse_port(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u16,
) -> Result<u16, ConfigError> {
    let Some(value) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::Invalid(format!(
            "{name} must be a port number in [1, 65535]"
        ))),
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    crate::util::normalize_text_option(lookup(name))
}
