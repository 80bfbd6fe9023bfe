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

//! A scriptable in-memory backend for unit tests.

use crate::backend::*;
use crate::error::{DeviceError, ResourceError};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Default)]
struct MockState {
    next_id: usize,
    auto_complete_fences: bool,
    buffers: HashMap<usize, (Vec<u8>, BufferUsage)>,
    images: HashSet<usize>,
    samplers: HashSet<usize>,
    fences: HashMap<usize, FenceStatus>,
    released_fences: HashSet<usize>,
    destroyed: Vec<DeviceObject>,
    uploads: Vec<(DeviceObject, CopyRegion, Vec<u8>)>,
    executed: Vec<String>,
    next_execute_error: Option<DeviceError>,
    created_buffers: usize,
    device_threads: HashSet<Option<String>>,
}

impl MockState {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn note_thread(&mut self) {
        self.device_threads
            .insert(std::thread::current().name().map(str::to_string));
    }
}

/// A backend whose fences resolve only when a test says so.
#[derive(Debug, Default)]
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
}

/// A labelled command stream understood by [`MockBackend`].
#[derive(Debug)]
pub(crate) struct MockStream(pub &'static str);

impl CommandStream for MockStream {
    fn label(&self) -> &str {
        self.0
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A backend whose fences are completed as soon as they are created.
    pub(crate) fn auto_completing() -> Self {
        let backend = Self::default();
        backend.state.lock().auto_complete_fences = true;
        backend
    }

    pub(crate) fn create_test_buffer(&self, size: u64) -> DeviceObject {
        let descriptor = BufferDescriptor {
            label: None,
            size,
            usage: BufferUsage::COPY_DST | BufferUsage::UNIFORM,
        };
        let id = self.create_buffer(&descriptor).unwrap();
        DeviceObject::Buffer {
            id,
            size,
            usage: descriptor.usage,
        }
    }

    pub(crate) fn signal_fence(&self, fence: FenceId, status: FenceStatus) {
        self.state.lock().fences.insert(fence.0, status);
    }

    pub(crate) fn complete_all_fences(&self) {
        for status in self.state.lock().fences.values_mut() {
            if *status == FenceStatus::Pending {
                *status = FenceStatus::Completed;
            }
        }
    }

    pub(crate) fn is_fence_released(&self, fence: FenceId) -> bool {
        self.state.lock().released_fences.contains(&fence.0)
    }

    pub(crate) fn destroy_count(&self, object: &DeviceObject) -> usize {
        self.state
            .lock()
            .destroyed
            .iter()
            .filter(|destroyed| *destroyed == object)
            .count()
    }

    pub(crate) fn destroyed_len(&self) -> usize {
        self.state.lock().destroyed.len()
    }

    pub(crate) fn created_buffers(&self) -> usize {
        self.state.lock().created_buffers
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub(crate) fn buffer_contents(&self, id: BufferId) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&id.0).map(|(data, _)| data.clone())
    }

    pub(crate) fn uploads(&self) -> Vec<(DeviceObject, CopyRegion, Vec<u8>)> {
        self.state.lock().uploads.clone()
    }

    pub(crate) fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// Names of the threads that created, wrote or destroyed buffers.
    pub(crate) fn device_threads(&self) -> HashSet<Option<String>> {
        self.state.lock().device_threads.clone()
    }

    pub(crate) fn fail_next_execute(&self, error: DeviceError) {
        self.state.lock().next_execute_error = Some(error);
    }
}

impl GpuBackend for MockBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Headless,
            adapter_name: "mock".to_string(),
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        if descriptor.size == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let mut state = self.state.lock();
        state.note_thread();
        let id = state.next_id();
        state
            .buffers
            .insert(id, (vec![0; descriptor.size as usize], descriptor.usage));
        state.created_buffers += 1;
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.note_thread();
        let (contents, usage) = state.buffers.remove(&id.0).ok_or(ResourceError::NotFound)?;
        state.destroyed.push(DeviceObject::Buffer {
            id,
            size: contents.len() as u64,
            usage,
        });
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        state.note_thread();
        let (buffer, _) = state.buffers.get_mut(&id.0).ok_or(ResourceError::NotFound)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > buffer.len() {
            return Err(ResourceError::OutOfBounds);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_image(&self, _descriptor: &ImageDescriptor) -> Result<ImageId, ResourceError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.images.insert(id);
        Ok(ImageId(id))
    }

    fn destroy_image(&self, id: ImageId) -> Result<(), ResourceError> {
        if self.state.lock().images.remove(&id.0) {
            Ok(())
        } else {
            Err(ResourceError::NotFound)
        }
    }

    fn create_sampler(&self, _descriptor: &SamplerDescriptor) -> Result<SamplerId, ResourceError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.samplers.insert(id);
        Ok(SamplerId(id))
    }

    fn destroy_sampler(&self, id: SamplerId) -> Result<(), ResourceError> {
        let mut state = self.state.lock();
        if !state.samplers.remove(&id.0) {
            return Err(ResourceError::NotFound);
        }
        state.destroyed.push(DeviceObject::Sampler { id });
        Ok(())
    }

    fn create_frame_fence(&self) -> Result<FenceId, ResourceError> {
        let mut state = self.state.lock();
        let id = state.next_id();
        let status = if state.auto_complete_fences {
            FenceStatus::Completed
        } else {
            FenceStatus::Pending
        };
        state.fences.insert(id, status);
        Ok(FenceId(id))
    }

    fn fence_status(&self, fence: FenceId) -> FenceStatus {
        self.state
            .lock()
            .fences
            .get(&fence.0)
            .copied()
            .unwrap_or(FenceStatus::Failed)
    }

    fn release_fence(&self, fence: FenceId) {
        let mut state = self.state.lock();
        state.fences.remove(&fence.0);
        state.released_fences.insert(fence.0);
    }

    fn upload(
        &self,
        source: &[u8],
        target: &DeviceObject,
        region: &CopyRegion,
    ) -> Result<(), ResourceError> {
        if let (DeviceObject::Buffer { id, .. }, CopyRegion::Buffer { offset, .. }) =
            (target, region)
        {
            self.write_buffer(*id, *offset, source)?;
        }
        self.state
            .lock()
            .uploads
            .push((target.clone(), *region, source.to_vec()));
        Ok(())
    }

    fn execute(&self, stream: Box<dyn CommandStream>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if let Some(error) = state.next_execute_error.take() {
            return Err(error);
        }
        state.executed.push(stream.label().to_string());
        Ok(())
    }

    fn wait_idle(&self, _timeout: Duration) -> Result<(), DeviceError> {
        self.complete_all_fences();
        Ok(())
    }
}
