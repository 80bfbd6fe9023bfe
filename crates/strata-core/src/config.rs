// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Startup tunables for the device layer.
//!
//! Values are read once from a [`ConfigSource`], a flat key/value view over whatever
//! the host application uses for settings. Keys that are absent fall back to the
//! defaults of [`HalConfig::default`]; keys that are present but malformed or out of
//! range are rejected.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::time::Duration;

/// Key for the size of the upload staging area, in megabytes.
pub const KEY_STAGING_AREA_SIZE_MB: &str = "copy.staging_area_size_mb";
/// Key for the allocation granularity of the staging area, in bytes.
pub const KEY_STAGING_PAGE_SIZE: &str = "copy.staging_page_size";
/// Key for the smallest transient buffer ever created, in kilobytes.
pub const KEY_TRANSIENT_MIN_BUFFER_SIZE_KB: &str = "transient.min_buffer_size_kb";
/// Key for the rounding granularity of transient buffer sizes, in bytes.
pub const KEY_TRANSIENT_PAGE_SIZE: &str = "transient.page_size";
/// Key for the memory a transient pool may hold before evicting, in megabytes.
pub const KEY_TRANSIENT_BUDGET_MB: &str = "transient.budget_mb";
/// Key for the full-sync duration above which a warning is logged, in milliseconds.
pub const KEY_SLOW_SYNC_WARNING_MS: &str = "frame.slow_sync_warning_ms";
/// Key for the full-sync duration above which an error is logged, in milliseconds.
pub const KEY_SLOW_SYNC_ERROR_MS: &str = "frame.slow_sync_error_ms";
/// Key for the bounded GPU wait used by full synchronization, in milliseconds.
pub const KEY_SYNC_TIMEOUT_MS: &str = "frame.sync_timeout_ms";
/// Key for how long the command thread sleeps on an empty queue, in milliseconds.
pub const KEY_IDLE_TICK_MS: &str = "thread.idle_tick_ms";

const MB: u64 = 1024 * 1024;
const KB: u64 = 1024;

/// A read-only key/value view used to build a [`HalConfig`].
pub trait ConfigSource {
    /// Returns the raw value stored under `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// A [`ConfigSource`] backed by a flat JSON object.
///
/// ```ignore
/// let source = JsonConfigSource::from_json(r#"{ "copy.staging_area_size_mb": 64 }"#)?;
/// let config = HalConfig::from_source(&source)?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct JsonConfigSource {
    values: serde_json::Map<String, serde_json::Value>,
}

impl JsonConfigSource {
    /// Parses a JSON document whose root is an object of scalar values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_str(json).map_err(|e| ConfigError::Source(e.to_string()))?;
        match value {
            serde_json::Value::Object(values) => Ok(Self { values }),
            _ => Err(ConfigError::Source(
                "configuration root must be a JSON object".to_string(),
            )),
        }
    }
}

impl ConfigSource for JsonConfigSource {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

/// Tunables for the command thread, copy queue and transient pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HalConfig {
    /// Total size of the upload staging area in bytes.
    pub staging_area_size: u64,
    /// Allocation granularity of the staging area in bytes. Must be a power of two.
    pub staging_page_size: u64,
    /// Smallest transient buffer ever created, in bytes.
    pub transient_min_buffer_size: u64,
    /// Rounding granularity of transient buffer sizes in bytes. Must be a power of two.
    pub transient_page_size: u64,
    /// Bytes a single transient pool may hold (checked out plus free) before it
    /// starts evicting least-recently-used free buffers.
    pub transient_budget: u64,
    /// A full sync taking longer than this is reported with a warning.
    pub slow_sync_warning: Duration,
    /// A full sync taking longer than this is reported as an error.
    pub slow_sync_error: Duration,
    /// Upper bound for the GPU idle wait performed by a full sync.
    pub sync_timeout: Duration,
    /// How long the command thread blocks on an empty queue before ticking again.
    pub idle_tick: Duration,
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            staging_area_size: 256 * MB,
            staging_page_size: 4096,
            transient_min_buffer_size: 1024 * KB,
            transient_page_size: 256,
            transient_budget: 64 * MB,
            slow_sync_warning: Duration::from_millis(150),
            slow_sync_error: Duration::from_millis(500),
            sync_timeout: Duration::from_millis(5000),
            idle_tick: Duration::from_millis(5),
        }
    }
}

impl HalConfig {
    /// Builds a configuration from `source`, using defaults for missing keys.
    ///
    /// ## Errors
    /// * `ConfigError::Parse` - a value is not an unsigned integer.
    /// * `ConfigError::InvalidValue` - the resulting configuration fails [`HalConfig::validate`].
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = read_u64(source, KEY_STAGING_AREA_SIZE_MB)? {
            config.staging_area_size = v.saturating_mul(MB);
        }
        if let Some(v) = read_u64(source, KEY_STAGING_PAGE_SIZE)? {
            config.staging_page_size = v;
        }
        if let Some(v) = read_u64(source, KEY_TRANSIENT_MIN_BUFFER_SIZE_KB)? {
            config.transient_min_buffer_size = v.saturating_mul(KB);
        }
        if let Some(v) = read_u64(source, KEY_TRANSIENT_PAGE_SIZE)? {
            config.transient_page_size = v;
        }
        if let Some(v) = read_u64(source, KEY_TRANSIENT_BUDGET_MB)? {
            config.transient_budget = v.saturating_mul(MB);
        }
        if let Some(v) = read_u64(source, KEY_SLOW_SYNC_WARNING_MS)? {
            config.slow_sync_warning = Duration::from_millis(v);
        }
        if let Some(v) = read_u64(source, KEY_SLOW_SYNC_ERROR_MS)? {
            config.slow_sync_error = Duration::from_millis(v);
        }
        if let Some(v) = read_u64(source, KEY_SYNC_TIMEOUT_MS)? {
            config.sync_timeout = Duration::from_millis(v);
        }
        if let Some(v) = read_u64(source, KEY_IDLE_TICK_MS)? {
            config.idle_tick = Duration::from_millis(v);
        }

        config.validate()?;
        log::debug!("Loaded device configuration: {config:?}");
        Ok(config)
    }

    /// Builds a configuration from a flat JSON object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::from_source(&JsonConfigSource::from_json(json)?)
    }

    /// Builds a configuration from a JSON file on disk.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Source(format!("{path}: {e}")))?;
        Self::from_json(&content)
    }

    /// The level at which a full sync lasting `elapsed` is reported, if at all.
    pub fn slow_sync_level(&self, elapsed: Duration) -> Option<log::Level> {
        if elapsed > self.slow_sync_error {
            Some(log::Level::Error)
        } else if elapsed > self.slow_sync_warning {
            Some(log::Level::Warn)
        } else {
            None
        }
    }

    /// Checks every constraint on the tunables.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_power_of_two(KEY_STAGING_PAGE_SIZE, self.staging_page_size)?;
        require_power_of_two(KEY_TRANSIENT_PAGE_SIZE, self.transient_page_size)?;

        if self.staging_area_size == 0 {
            return Err(invalid(KEY_STAGING_AREA_SIZE_MB, "must be non-zero"));
        }
        if self.staging_area_size % self.staging_page_size != 0 {
            return Err(invalid(
                KEY_STAGING_AREA_SIZE_MB,
                format!(
                    "{} bytes is not a multiple of the staging page size {}",
                    self.staging_area_size, self.staging_page_size
                ),
            ));
        }
        if self.staging_area_size / self.staging_page_size > u32::MAX as u64 {
            return Err(invalid(KEY_STAGING_PAGE_SIZE, "too many staging pages"));
        }
        if self.transient_min_buffer_size == 0 {
            return Err(invalid(KEY_TRANSIENT_MIN_BUFFER_SIZE_KB, "must be non-zero"));
        }
        if self.transient_budget == 0 {
            return Err(invalid(KEY_TRANSIENT_BUDGET_MB, "must be non-zero"));
        }
        if self.slow_sync_error < self.slow_sync_warning {
            return Err(invalid(
                KEY_SLOW_SYNC_ERROR_MS,
                format!(
                    "{:?} is below the warning threshold {:?}",
                    self.slow_sync_error, self.slow_sync_warning
                ),
            ));
        }
        if self.idle_tick.is_zero() {
            return Err(invalid(KEY_IDLE_TICK_MS, "must be non-zero"));
        }
        Ok(())
    }
}

fn read_u64(source: &dyn ConfigSource, key: &str) -> Result<Option<u64>, ConfigError> {
    match source.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Parse {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn require_power_of_two(key: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(invalid(key, format!("{value} is not a power of two")));
    }
    Ok(())
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        reason: reason.into(),
    }
}
