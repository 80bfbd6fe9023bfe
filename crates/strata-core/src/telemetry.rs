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

//! Diagnostics for pooled device memory and the command thread.
//!
//! These are snapshots for logs and overlays. Nothing in the device layer makes a
//! correctness decision based on them.

use std::borrow::Cow;

/// A pooled resource that can report how much of it is in use.
pub trait ResourceMonitor: Send + Sync {
    /// Returns a unique, human-readable identifier for this monitor instance.
    fn monitor_id(&self) -> Cow<'static, str>;

    /// Returns the general type of resource being monitored.
    fn resource_type(&self) -> MonitoredResourceType;

    /// Returns a snapshot of the current usage.
    fn get_usage_report(&self) -> ResourceUsageReport;
}

/// The kinds of memory the device layer pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitoredResourceType {
    /// Upload staging memory owned by the copy queue.
    StagingMemory,
    /// Scratch buffers owned by a transient pool.
    TransientMemory,
    /// Memory held by live backend objects.
    DeviceMemory,
}

/// A generic usage report, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsageReport {
    /// The number of bytes currently in use.
    pub current_bytes: u64,
    /// The peak number of bytes ever in use simultaneously, if tracked.
    pub peak_bytes: Option<u64>,
    /// The total capacity of the resource in bytes, if bounded.
    pub total_capacity_bytes: Option<u64>,
}

impl ResourceUsageReport {
    /// Current usage as a fraction of capacity, if the capacity is known.
    pub fn utilization(&self) -> Option<f64> {
        match self.total_capacity_bytes {
            Some(total) if total > 0 => Some(self.current_bytes as f64 / total as f64),
            _ => None,
        }
    }
}

/// A snapshot of the command thread's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Index of the frame currently open for recording.
    pub current_frame: u64,
    /// Highest frame whose work the command thread has recorded.
    pub recorded_frame: Option<u64>,
    /// Highest frame the GPU has finished and that has retired.
    pub finished_frame: Option<u64>,
    /// Frames closed but not yet retired.
    pub pending_frames: usize,
    /// Frames whose fences completed and whose deletions ran.
    pub retired_frames: u64,
    /// Objects destroyed through deferred deletion.
    pub deleted_objects: u64,
    /// Fences that reported failure.
    pub failed_fences: u64,
    /// Jobs run by the command thread.
    pub executed_jobs: u64,
    /// Upload jobs waiting for staging memory.
    pub uploads_pending: usize,
    /// Upload jobs holding staging memory.
    pub uploads_in_flight: usize,
    /// Upload jobs that reached the finished state.
    pub uploads_finished: u64,
    /// Upload jobs that were canceled or dropped.
    pub uploads_canceled: u64,
    /// Live device objects.
    pub live_objects: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization() {
        let report = ResourceUsageReport {
            current_bytes: 256,
            peak_bytes: None,
            total_capacity_bytes: Some(1024),
        };
        assert_eq!(report.utilization(), Some(0.25));
        assert_eq!(ResourceUsageReport::default().utilization(), None);
    }
}
