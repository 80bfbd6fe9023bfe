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

//! Defines the hierarchy of error types for the device layer.
//!
//! Transient conditions (a full staging pool, a fence that is still pending) are never
//! reported through these types; they are resolved internally by retrying on a later
//! tick. What remains are configuration mistakes, invalid requests and device failures.

use std::fmt;
use std::time::Duration;

/// An error related to the creation or use of a GPU resource (buffers, images, samplers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// A generic resource could not be found.
    NotFound,
    /// The handle or ID used to reference a resource is invalid or stale.
    InvalidHandle,
    /// A zero or otherwise unusable size was requested.
    InvalidSize(u64),
    /// The resource must be mapped for CPU access but is not.
    NotMapped,
    /// An attempt was made to access a resource out of its bounds (e.g., in a buffer).
    OutOfBounds,
    /// An error originating from the specific graphics backend implementation.
    BackendError(String),
    /// The thread that owns the device is gone.
    DeviceUnavailable,
    /// Bound resources do not match the layout they are bound against.
    LayoutMismatch(String),
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::NotFound => write!(f, "Resource not found with ID."),
            ResourceError::InvalidHandle => write!(f, "Invalid resource handle or ID."),
            ResourceError::InvalidSize(size) => write!(f, "Invalid resource size: {size} bytes."),
            ResourceError::NotMapped => write!(f, "Resource is not mapped for CPU access."),
            ResourceError::OutOfBounds => write!(f, "Resource access out of bounds."),
            ResourceError::BackendError(msg) => {
                write!(f, "Backend-specific resource error: {msg}")
            }
            ResourceError::DeviceUnavailable => write!(f, "The device thread is not running."),
            ResourceError::LayoutMismatch(msg) => write!(f, "Layout mismatch: {msg}"),
        }
    }
}

impl std::error::Error for ResourceError {}

/// An error raised while reading or validating the device configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A key was present but its value could not be parsed.
    Parse {
        /// The configuration key.
        key: String,
        /// The raw value that failed to parse.
        value: String,
    },
    /// A value parsed correctly but violates a constraint.
    InvalidValue {
        /// The configuration key.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
    /// The configuration document itself could not be read or decoded.
    Source(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parse { key, value } => {
                write!(f, "Failed to parse value '{value}' for configuration key '{key}'")
            }
            ConfigError::InvalidValue { key, reason } => {
                write!(f, "Invalid value for configuration key '{key}': {reason}")
            }
            ConfigError::Source(msg) => write!(f, "Failed to read configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// An error related to scheduling an asynchronous upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyError {
    /// The destination object does not resolve to a live object.
    TargetNotFound,
    /// The destination object kind cannot receive uploads (e.g. a sampler).
    UnsupportedTarget,
    /// The requested range does not fit inside the destination object.
    InvalidRange(String),
    /// A single upload needs more staging memory than the whole staging pool holds.
    /// This can never succeed and indicates a configuration problem.
    StagingCapacityExceeded {
        /// The staging size needed by one job.
        requested: u64,
        /// The total capacity of the staging pool.
        capacity: u64,
    },
    /// The queue was stopped and no longer accepts work.
    QueueStopped,
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::TargetNotFound => write!(f, "Upload target object not found."),
            CopyError::UnsupportedTarget => write!(f, "Upload target cannot receive data."),
            CopyError::InvalidRange(msg) => write!(f, "Invalid upload range: {msg}"),
            CopyError::StagingCapacityExceeded {
                requested,
                capacity,
            } => write!(
                f,
                "Upload needs {requested} bytes of staging memory but the pool only holds {capacity} bytes"
            ),
            CopyError::QueueStopped => write!(f, "Copy queue has been stopped."),
        }
    }
}

impl std::error::Error for CopyError {}

/// A top-level error for the device and its command thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The device could not be created or the command thread could not start.
    InitializationFailed(String),
    /// The device was lost. The command thread stops when it observes this.
    DeviceLost,
    /// A command stream failed to execute.
    ExecutionFailed(String),
    /// A bounded wait on the GPU did not finish in time.
    Timeout(Duration),
    /// The command thread exited before the requested work ran.
    ThreadExited,
    /// An invalid configuration was supplied at startup.
    Config(ConfigError),
    /// A resource-level error occurred.
    Resource(ResourceError),
}

impl DeviceError {
    /// Returns `true` when the device can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeviceError::DeviceLost | DeviceError::InitializationFailed(_)
        )
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::InitializationFailed(msg) => {
                write!(f, "Device initialization failed: {msg}")
            }
            DeviceError::DeviceLost => write!(f, "The graphics device was lost."),
            DeviceError::ExecutionFailed(msg) => {
                write!(f, "Command stream execution failed: {msg}")
            }
            DeviceError::Timeout(waited) => {
                write!(f, "Timed out after {waited:?} waiting for the GPU")
            }
            DeviceError::ThreadExited => {
                write!(f, "The command thread exited before the job could run.")
            }
            DeviceError::Config(err) => write!(f, "Configuration error: {err}"),
            DeviceError::Resource(err) => write!(f, "Resource error: {err}"),
        }
    }
}

impl std::error::Error for DeviceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeviceError::Config(err) => Some(err),
            DeviceError::Resource(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ResourceError> for DeviceError {
    fn from(err: ResourceError) -> Self {
        DeviceError::Resource(err)
    }
}

impl From<ConfigError> for DeviceError {
    fn from(err: ConfigError) -> Self {
        DeviceError::Config(err)
    }
}
