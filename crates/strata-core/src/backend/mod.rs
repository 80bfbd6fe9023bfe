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

//! The contract between the device layer and a concrete graphics backend.
//!
//! - [`GpuBackend`]: the capability interface a backend implements. One implementation
//!   is chosen at startup and shared as an `Arc<dyn GpuBackend>`.
//! - [`BackendFactory`]: discovers and creates a backend, asynchronously.
//! - [`ObjectRegistry`]: the generation-checked table of live device objects.
//! - [`StagingPool`]: bounded upload memory, created through a backend hook.
//! - [`DeviceExecutor`]: runs backend calls on the thread that owns the device.

mod executor;
mod object;
mod staging;
mod types;

pub use self::executor::{call_on_device, BackendCall, DeviceExecutor, InlineExecutor};
pub use self::object::{DeviceObject, ObjectId, ObjectRegistry};
pub use self::staging::{StagingArea, StagingPool};
pub use self::types::*;

use crate::error::{DeviceError, ResourceError};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// The capability interface of a graphics backend.
///
/// `info` and `create_staging_pool` may be called from any thread. Every other method
/// creates, destroys or submits device state and is only called from the command
/// thread, so implementations never see concurrent device calls.
pub trait GpuBackend: Send + Sync + Debug + 'static {
    /// Returns information about the running backend.
    fn info(&self) -> BackendInfo;

    /// Creates a new GPU buffer.
    /// ## Arguments
    /// * `descriptor` - Size, usage and label of the buffer.
    /// ## Returns
    /// The ID of the created buffer or an error if the creation fails.
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError>;

    /// Destroys a GPU buffer.
    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError>;

    /// Writes `data` into a buffer at `offset`.
    /// ## Errors
    /// * `ResourceError::NotFound` - the buffer does not exist.
    /// * `ResourceError::OutOfBounds` - the write exceeds the buffer.
    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError>;

    /// Creates a new image.
    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageId, ResourceError>;

    /// Destroys an image.
    fn destroy_image(&self, id: ImageId) -> Result<(), ResourceError>;

    /// Creates a new sampler.
    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<SamplerId, ResourceError>;

    /// Destroys a sampler.
    fn destroy_sampler(&self, id: SamplerId) -> Result<(), ResourceError>;

    /// Creates a fence that signals once all work submitted so far has finished.
    fn create_frame_fence(&self) -> Result<FenceId, ResourceError>;

    /// Polls a fence without blocking.
    fn fence_status(&self, fence: FenceId) -> FenceStatus;

    /// Releases a fence that is no longer observed.
    fn release_fence(&self, fence: FenceId);

    /// Creates the staging pool used by the copy queue.
    ///
    /// The default implementation allocates host-visible memory managed by the core
    /// block allocator; backends with dedicated upload heaps may override it.
    fn create_staging_pool(
        &self,
        total_size: u64,
        page_size: u64,
    ) -> Result<StagingPool, ResourceError> {
        StagingPool::new(total_size, page_size)
    }

    /// Copies staged bytes into `target`.
    /// ## Arguments
    /// * `source` - The staged bytes, exactly `region.data_size()` long.
    /// * `target` - The destination object.
    /// * `region` - Where inside the destination the bytes go.
    fn upload(
        &self,
        source: &[u8],
        target: &DeviceObject,
        region: &CopyRegion,
    ) -> Result<(), ResourceError>;

    /// Executes a recorded command stream.
    /// ## Errors
    /// * `DeviceError::ExecutionFailed` - the stream could not be executed.
    /// * `DeviceError::DeviceLost` - the device became unusable.
    fn execute(&self, stream: Box<dyn CommandStream>) -> Result<(), DeviceError>;

    /// Blocks until the GPU has finished all submitted work, or `timeout` elapses.
    fn wait_idle(&self, timeout: Duration) -> Result<(), DeviceError>;
}

/// Discovers and creates one kind of backend.
///
/// Adapter enumeration and device creation can be slow, so creation is asynchronous.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// The kind of backend this factory creates.
    fn kind(&self) -> BackendKind;

    /// Synchronously checks if the backend is likely to be available on this platform.
    fn is_supported(&self) -> bool;

    /// Creates the backend.
    /// ## Errors
    /// * `DeviceError::InitializationFailed` - no usable device could be created.
    async fn create(&self) -> Result<Arc<dyn GpuBackend>, DeviceError>;
}
