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

//! A software backend that keeps every object in host memory.
//!
//! Work executes synchronously inside [`GpuBackend::execute`]; what the backend still
//! models is *when* the rest of the system learns about it. The [`FenceMode`] decides
//! how fences signal, which lets tests and tools exercise frame retirement and upload
//! backpressure deterministically without a GPU.

mod stream;

pub use self::stream::{HeadlessCommand, HeadlessCommandStream};

use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use strata_core::backend::{
    BackendInfo, BackendKind, BufferDescriptor, BufferId, BufferUsage, CommandStream, CopyRegion,
    DeviceObject, FenceId, FenceStatus, GpuBackend, ImageDescriptor, ImageId, SamplerDescriptor,
    SamplerId,
};
use strata_core::error::{DeviceError, ResourceError};
use strata_core::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};

/// How fences created by a [`HeadlessBackend`] signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceMode {
    /// Fences are complete as soon as they are created.
    #[default]
    Immediate,
    /// Fences complete after being polled this many times.
    AfterPolls(u32),
    /// Fences stay pending until [`HeadlessBackend::signal_fence`] or a wait-idle.
    Manual,
}

#[derive(Debug)]
struct HeadlessBuffer {
    data: Vec<u8>,
    usage: BufferUsage,
}

#[derive(Debug)]
struct HeadlessImage {
    descriptor: ImageDescriptor<'static>,
    /// One entry per `(mip, slice)`, mip-major.
    subresources: Vec<Vec<u8>>,
}

impl HeadlessImage {
    fn new(descriptor: ImageDescriptor<'static>) -> Self {
        let subresources = (0..descriptor.mips)
            .flat_map(|mip| {
                let size = descriptor.mip_data_size(mip) as usize;
                (0..descriptor.slices).map(move |_| vec![0u8; size])
            })
            .collect();
        Self {
            descriptor,
            subresources,
        }
    }

    fn subresource_mut(&mut self, mip: u32, slice: u32) -> Option<&mut Vec<u8>> {
        if mip >= self.descriptor.mips || slice >= self.descriptor.slices {
            return None;
        }
        let index = (mip * self.descriptor.slices + slice) as usize;
        self.subresources.get_mut(index)
    }

    fn byte_size(&self) -> u64 {
        self.subresources.iter().map(|s| s.len() as u64).sum()
    }
}

#[derive(Debug, Clone, Copy)]
struct HeadlessFence {
    status: FenceStatus,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct HeadlessState {
    buffers: HashMap<BufferId, HeadlessBuffer>,
    images: HashMap<ImageId, HeadlessImage>,
    samplers: HashMap<SamplerId, SamplerDescriptor<'static>>,
    fences: HashMap<FenceId, HeadlessFence>,
    allocated_bytes: u64,
    peak_bytes: u64,
    executed_streams: u64,
}

impl HeadlessState {
    fn track_allocation(&mut self, bytes: u64) {
        self.allocated_bytes += bytes;
        self.peak_bytes = self.peak_bytes.max(self.allocated_bytes);
    }

    fn buffer_range(
        &mut self,
        id: BufferId,
        offset: u64,
        size: u64,
    ) -> Result<&mut [u8], ResourceError> {
        let buffer = self.buffers.get_mut(&id).ok_or(ResourceError::NotFound)?;
        let end = offset.checked_add(size).ok_or(ResourceError::OutOfBounds)?;
        if end > buffer.data.len() as u64 {
            return Err(ResourceError::OutOfBounds);
        }
        Ok(&mut buffer.data[offset as usize..end as usize])
    }

    fn run(&mut self, command: HeadlessCommand) -> Result<(), ResourceError> {
        match command {
            HeadlessCommand::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => self.buffer_range(buffer, offset, size)?.fill(value),
            HeadlessCommand::CopyBuffer {
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                let bytes = self.buffer_range(source, source_offset, size)?.to_vec();
                self.buffer_range(destination, destination_offset, size)?
                    .copy_from_slice(&bytes);
            }
            HeadlessCommand::WriteBuffer {
                buffer,
                offset,
                data,
            } => self
                .buffer_range(buffer, offset, data.len() as u64)?
                .copy_from_slice(&data),
        }
        Ok(())
    }
}

/// The CPU-only implementation of [`GpuBackend`].
#[derive(Debug)]
pub struct HeadlessBackend {
    state: Mutex<HeadlessState>,
    fence_mode: FenceMode,
    next_id: AtomicUsize,
    lost: AtomicBool,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(FenceMode::default())
    }
}

impl HeadlessBackend {
    /// Creates an empty backend whose fences signal according to `fence_mode`.
    pub fn new(fence_mode: FenceMode) -> Self {
        log::info!("Headless backend created ({:?} fences)", fence_mode);
        Self {
            state: Mutex::new(HeadlessState::default()),
            fence_mode,
            next_id: AtomicUsize::new(1),
            lost: AtomicBool::new(false),
        }
    }

    /// The fence mode chosen at creation.
    pub fn fence_mode(&self) -> FenceMode {
        self.fence_mode
    }

    fn generate_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sets the status of a pending fence. Ignored for unknown fences.
    pub fn signal_fence(&self, fence: FenceId, status: FenceStatus) {
        if let Some(entry) = self.state.lock().fences.get_mut(&fence) {
            entry.status = status;
        }
    }

    /// Completes every pending fence.
    pub fn complete_all_fences(&self) {
        for fence in self.state.lock().fences.values_mut() {
            if fence.status == FenceStatus::Pending {
                fence.status = FenceStatus::Completed;
            }
        }
    }

    /// Number of fences created and not yet released.
    pub fn live_fences(&self) -> usize {
        self.state.lock().fences.len()
    }

    /// Makes every following submission fail with [`DeviceError::DeviceLost`].
    pub fn simulate_device_loss(&self) {
        log::warn!("Headless backend: simulating device loss");
        self.lost.store(true, Ordering::Release);
    }

    /// A copy of the contents of a buffer.
    pub fn read_buffer(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&id).map(|b| b.data.clone())
    }

    /// A copy of one mip level of one slice of an image.
    pub fn read_image(&self, id: ImageId, mip: u32, slice: u32) -> Option<Vec<u8>> {
        self.state
            .lock()
            .images
            .get_mut(&id)
            .and_then(|image| image.subresource_mut(mip, slice).cloned())
    }

    /// Number of live buffers, images and samplers.
    pub fn live_objects(&self) -> usize {
        let state = self.state.lock();
        state.buffers.len() + state.images.len() + state.samplers.len()
    }

    /// Number of command streams executed so far.
    pub fn executed_streams(&self) -> u64 {
        self.state.lock().executed_streams
    }

    fn check_lost(&self) -> Result<(), DeviceError> {
        if self.lost.load(Ordering::Acquire) {
            Err(DeviceError::DeviceLost)
        } else {
            Ok(())
        }
    }
}

impl GpuBackend for HeadlessBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Headless,
            adapter_name: "Strata Headless".to_string(),
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        if descriptor.size == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let id = BufferId(self.generate_id());
        let mut state = self.state.lock();
        state.track_allocation(descriptor.size);
        state.buffers.insert(
            id,
            HeadlessBuffer {
                data: vec![0; descriptor.size as usize],
                usage: descriptor.usage,
            },
        );
        log::debug!(
            "Headless: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.size
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        let buffer = state.buffers.remove(&id).ok_or(ResourceError::NotFound)?;
        state.allocated_bytes -= buffer.data.len() as u64;
        log::trace!(
            "Headless: Destroyed buffer {:?} (usage {:#x})",
            id,
            buffer.usage.bits()
        );
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        self.state
            .lock()
            .buffer_range(id, offset, data.len() as u64)?
            .copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageId, ResourceError> {
        if descriptor.width == 0 || descriptor.height == 0 || descriptor.depth == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let id = ImageId(self.generate_id());
        let image = HeadlessImage::new(descriptor.clone().into_owned());
        let mut state = self.state.lock();
        state.track_allocation(image.byte_size());
        state.images.insert(id, image);
        log::debug!(
            "Headless: Created image '{}' with ID: {:?}, {}x{}x{}, {} mips",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.width,
            descriptor.height,
            descriptor.depth,
            descriptor.mips
        );
        Ok(id)
    }

    fn destroy_image(&self, id: ImageId) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        let image = state.images.remove(&id).ok_or(ResourceError::NotFound)?;
        state.allocated_bytes -= image.byte_size();
        Ok(())
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<SamplerId, ResourceError> {
        let id = SamplerId(self.generate_id());
        let owned = SamplerDescriptor {
            label: descriptor.label.clone().map(|l| Cow::Owned(l.into_owned())),
            mag_filter: descriptor.mag_filter,
            min_filter: descriptor.min_filter,
        };
        self.state.lock().samplers.insert(id, owned);
        Ok(id)
    }

    fn destroy_sampler(&self, id: SamplerId) -> Result<(), ResourceError> {
        self.state
            .lock()
            .samplers
            .remove(&id)
            .map(|_| ())
            .ok_or(ResourceError::NotFound)
    }

    fn create_frame_fence(&self) -> Result<FenceId, ResourceError> {
        let id = FenceId(self.generate_id());
        let fence = match self.fence_mode {
            FenceMode::Immediate => HeadlessFence {
                status: FenceStatus::Completed,
                polls_left: 0,
            },
            FenceMode::AfterPolls(polls) => HeadlessFence {
                status: if polls == 0 {
                    FenceStatus::Completed
                } else {
                    FenceStatus::Pending
                },
                polls_left: polls,
            },
            FenceMode::Manual => HeadlessFence {
                status: FenceStatus::Pending,
                polls_left: 0,
            },
        };
        self.state.lock().fences.insert(id, fence);
        Ok(id)
    }

    fn fence_status(&self, fence: FenceId) -> FenceStatus {
        let mut state = self.state.lock();
        let Some(entry) = state.fences.get_mut(&fence) else {
            log::warn!("Headless: polled unknown fence {:?}", fence);
            return FenceStatus::Failed;
        };
        if entry.status == FenceStatus::Pending && entry.polls_left > 0 {
            entry.polls_left -= 1;
            if entry.polls_left == 0 && self.fence_mode != FenceMode::Manual {
                entry.status = FenceStatus::Completed;
            }
        }
        entry.status
    }

    fn release_fence(&self, fence: FenceId) {
        self.state.lock().fences.remove(&fence);
    }

    fn upload(
        &self,
        source: &[u8],
        target: &DeviceObject,
        region: &CopyRegion,
    ) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        match (target, region) {
            (DeviceObject::Buffer { id, .. }, CopyRegion::Buffer { offset, size }) => {
                let len = (*size as usize).min(source.len());
                state.buffer_range(*id, *offset, len as u64)?
                    .copy_from_slice(&source[..len]);
            }
            (DeviceObject::Image { id, .. }, CopyRegion::Image { mip, slice, .. }) => {
                let image = state.images.get_mut(id).ok_or(ResourceError::NotFound)?;
                let dest = image
                    .subresource_mut(*mip, *slice)
                    .ok_or(ResourceError::OutOfBounds)?;
                if source.len() != dest.len() {
                    return Err(ResourceError::OutOfBounds);
                }
                dest.copy_from_slice(source);
            }
            _ => {
                return Err(ResourceError::BackendError(format!(
                    "cannot upload {:?} into a {}",
                    region,
                    target.kind_name()
                )))
            }
        }
        Ok(())
    }

    fn execute(&self, stream: Box<dyn CommandStream>) -> Result<(), DeviceError> {
        self.check_lost()?;
        let label = stream.label().to_string();
        let stream = stream
            .into_any()
            .downcast::<HeadlessCommandStream>()
            .map_err(|_| {
                DeviceError::ExecutionFailed(format!(
                    "stream '{label}' was not recorded for the headless backend"
                ))
            })?;

        let mut state = self.state.lock();
        for command in stream.into_commands() {
            state
                .run(command)
                .map_err(|e| DeviceError::ExecutionFailed(format!("stream '{label}': {e}")))?;
        }
        state.executed_streams += 1;
        log::trace!("Headless: executed stream '{}'", label);
        Ok(())
    }

    fn wait_idle(&self, _timeout: Duration) -> Result<(), DeviceError> {
        self.check_lost()?;
        self.complete_all_fences();
        Ok(())
    }
}

impl ResourceMonitor for HeadlessBackend {
    fn monitor_id(&self) -> Cow<'static, str> {
        Cow::Borrowed("HeadlessDeviceMemory")
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::DeviceMemory
    }

    fn get_usage_report(&self) -> ResourceUsageReport {
        let state = self.state.lock();
        ResourceUsageReport {
            current_bytes: state.allocated_bytes,
            peak_bytes: Some(state.peak_bytes),
            total_capacity_bytes: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::backend::ImageFormat;

    fn buffer(backend: &HeadlessBackend, size: u64) -> BufferId {
        backend
            .create_buffer(&BufferDescriptor {
                label: Some(Cow::Borrowed("test")),
                size,
                usage: BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
            })
            .unwrap()
    }

    #[test]
    fn test_fence_modes() {
        let immediate = HeadlessBackend::new(FenceMode::Immediate);
        let fence = immediate.create_frame_fence().unwrap();
        assert_eq!(immediate.fence_status(fence), FenceStatus::Completed);

        let polled = HeadlessBackend::new(FenceMode::AfterPolls(2));
        let fence = polled.create_frame_fence().unwrap();
        assert_eq!(polled.fence_status(fence), FenceStatus::Pending);
        assert_eq!(polled.fence_status(fence), FenceStatus::Completed);

        let manual = HeadlessBackend::new(FenceMode::Manual);
        let fence = manual.create_frame_fence().unwrap();
        assert_eq!(manual.fence_status(fence), FenceStatus::Pending);
        manual.signal_fence(fence, FenceStatus::Failed);
        assert_eq!(manual.fence_status(fence), FenceStatus::Failed);

        manual.release_fence(fence);
        assert_eq!(manual.live_fences(), 0);
        assert_eq!(manual.fence_status(fence), FenceStatus::Failed);
    }

    #[test]
    fn test_stream_executes_in_order() {
        let backend = HeadlessBackend::default();
        let a = buffer(&backend, 8);
        let b = buffer(&backend, 8);

        let stream = HeadlessCommandStream::new("copy")
            .fill_buffer(a, 0, 8, 3)
            .write_buffer(a, 2, &[9, 9])
            .copy_buffer(a, 0, b, 0, 8);
        backend.execute(Box::new(stream)).unwrap();

        assert_eq!(backend.read_buffer(b).unwrap(), vec![3, 3, 9, 9, 3, 3, 3, 3]);
        assert_eq!(backend.executed_streams(), 1);
    }

    #[test]
    fn test_out_of_bounds_command_fails_stream() {
        let backend = HeadlessBackend::default();
        let a = buffer(&backend, 4);
        let stream = HeadlessCommandStream::new("overflow").fill_buffer(a, 2, 4, 1);
        let err = backend.execute(Box::new(stream)).unwrap_err();
        assert!(matches!(err, DeviceError::ExecutionFailed(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_device_loss_is_fatal() {
        let backend = HeadlessBackend::default();
        backend.simulate_device_loss();
        let err = backend
            .execute(Box::new(HeadlessCommandStream::new("late")))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_image_upload_targets_one_subresource() {
        let backend = HeadlessBackend::default();
        let descriptor = ImageDescriptor {
            label: None,
            width: 4,
            height: 4,
            depth: 1,
            mips: 2,
            slices: 2,
            format: ImageFormat::R8Unorm,
        };
        let id = backend.create_image(&descriptor).unwrap();
        let target = DeviceObject::Image {
            id,
            descriptor: descriptor.clone(),
        };
        let region = CopyRegion::Image {
            mip: 1,
            slice: 1,
            extent: (2, 2, 1),
            format: ImageFormat::R8Unorm,
        };
        backend.upload(&[1, 2, 3, 4], &target, &region).unwrap();

        assert_eq!(backend.read_image(id, 1, 1).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(backend.read_image(id, 1, 0).unwrap(), vec![0; 4]);
        assert_eq!(backend.get_usage_report().current_bytes, 2 * (16 + 4));
    }

    #[test]
    fn test_memory_accounting() {
        let backend = HeadlessBackend::default();
        let a = buffer(&backend, 100);
        let _b = buffer(&backend, 50);
        backend.destroy_buffer(a).unwrap();

        let report = backend.get_usage_report();
        assert_eq!(report.current_bytes, 50);
        assert_eq!(report.peak_bytes, Some(150));
        assert_eq!(backend.destroy_buffer(a), Err(ResourceError::NotFound));
    }
}
