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

use super::conversions::{texture_shape, IntoWgpu};
use super::stream::WgpuCommandStream;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strata_core::backend::{
    BackendInfo, BackendKind, BufferDescriptor, BufferId, CommandStream, CopyRegion, DeviceObject,
    FenceId, FenceStatus, GpuBackend, ImageDescriptor, ImageId, SamplerDescriptor, SamplerId,
};
use strata_core::error::{DeviceError, ResourceError};
use strata_core::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};

const FENCE_PENDING: u8 = 0;
const FENCE_SIGNALED: u8 = 1;

#[derive(Debug)]
struct WgpuBufferEntry {
    wgpu_buffer: Arc<wgpu::Buffer>,
    size: u64,
}

#[derive(Debug)]
struct WgpuImageEntry {
    wgpu_texture: Arc<wgpu::Texture>,
    descriptor: ImageDescriptor<'static>,
    size: u64,
}

/// The [`GpuBackend`] implementation on top of a `wgpu` device and queue.
///
/// Fences are built from `Queue::on_submitted_work_done`: creating one submits an empty
/// batch and registers a callback that flips an atomic flag. Polling a fence first
/// polls the device so pending callbacks get a chance to run.
#[derive(Debug)]
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    buffers: Mutex<HashMap<BufferId, WgpuBufferEntry>>,
    textures: Mutex<HashMap<ImageId, WgpuImageEntry>>,
    samplers: Mutex<HashMap<SamplerId, Arc<wgpu::Sampler>>>,
    fences: Mutex<HashMap<FenceId, Arc<AtomicU8>>>,
    next_id: AtomicUsize,
    vram_allocated_bytes: AtomicU64,
    vram_peak_bytes: AtomicU64,
}

impl WgpuBackend {
    /// Creates the logical device and queue on `adapter`.
    ///
    /// ## Arguments
    /// * `adapter` - The pre-selected `wgpu::Adapter` to use.
    ///
    /// ## Returns
    /// * `Result<Self>` - The initialized backend or the device creation error.
    pub async fn new(adapter: &wgpu::Adapter) -> Result<Self> {
        let adapter_info = adapter.get_info();
        log::info!(
            "Using graphics adapter: \"{}\" (Backend: {:?})",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Strata Logical Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                experimental_features: wgpu::ExperimentalFeatures::disabled(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| anyhow!("Failed to create logical device: {}", e))?;
        log::info!("Logical device and command queue created.");

        device.on_uncaptured_error(Arc::new(|e| {
            log::error!("WGPU Uncaptured Error: {e:?}");
        }));

        Ok(Self {
            device,
            queue,
            adapter_name: adapter_info.name,
            buffers: Mutex::new(HashMap::new()),
            textures: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            fences: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
            vram_allocated_bytes: AtomicU64::new(0),
            vram_peak_bytes: AtomicU64::new(0),
        })
    }

    /// The underlying device, for recording command streams.
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Starts a command encoder for a [`WgpuCommandStream`].
    pub fn create_encoder(&self, label: Option<&str>) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label })
    }

    /// The wgpu buffer behind `id`.
    pub fn get_wgpu_buffer(&self, id: BufferId) -> Option<Arc<wgpu::Buffer>> {
        self.buffers
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.wgpu_buffer))
    }

    /// The wgpu texture behind `id`.
    pub fn get_wgpu_texture(&self, id: ImageId) -> Option<Arc<wgpu::Texture>> {
        self.textures
            .lock()
            .get(&id)
            .map(|entry| Arc::clone(&entry.wgpu_texture))
    }

    fn generate_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn track_allocation(&self, bytes: u64) {
        let current = self.vram_allocated_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.vram_peak_bytes.fetch_max(current, Ordering::Relaxed);
    }

    fn poll_device_non_blocking(&self) {
        // PollType::Poll runs the callbacks of work that already completed.
        if let Err(e) = self.device.poll(wgpu::PollType::Poll) {
            log::warn!("Failed to poll device (non-blocking): {:?}", e);
        }
    }
}

impl GpuBackend for WgpuBackend {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            kind: BackendKind::Wgpu,
            adapter_name: self.adapter_name.clone(),
        }
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<BufferId, ResourceError> {
        if descriptor.size == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let wgpu_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: descriptor.label.as_deref(),
            size: descriptor.size,
            usage: descriptor.usage.into_wgpu(),
            mapped_at_creation: false,
        });
        let id = BufferId(self.generate_id());
        self.track_allocation(descriptor.size);
        self.buffers.lock().insert(
            id,
            WgpuBufferEntry {
                wgpu_buffer: Arc::new(wgpu_buffer),
                size: descriptor.size,
            },
        );

        log::debug!(
            "WgpuBackend: Created buffer '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            descriptor.size
        );
        Ok(id)
    }

    fn destroy_buffer(&self, id: BufferId) -> Result<(), ResourceError> {
        let entry = self
            .buffers
            .lock()
            .remove(&id)
            .ok_or(ResourceError::NotFound)?;
        entry.wgpu_buffer.destroy();
        self.vram_allocated_bytes
            .fetch_sub(entry.size, Ordering::Relaxed);
        log::debug!("WgpuBackend: Destroyed buffer with ID: {id:?}");
        Ok(())
    }

    fn write_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        let buffer = self.get_wgpu_buffer(id).ok_or(ResourceError::NotFound)?;
        if offset + data.len() as u64 > buffer.size() {
            return Err(ResourceError::OutOfBounds);
        }
        self.queue.write_buffer(&buffer, offset, data);
        Ok(())
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ImageId, ResourceError> {
        let (dimension, size) = texture_shape(descriptor);
        let wgpu_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: descriptor.label.as_deref(),
            size,
            mip_level_count: descriptor.mips,
            sample_count: 1,
            dimension,
            format: descriptor.format.into_wgpu(),
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let bytes: u64 = (0..descriptor.mips)
            .map(|mip| descriptor.mip_data_size(mip) * descriptor.slices as u64)
            .sum();
        let id = ImageId(self.generate_id());
        self.track_allocation(bytes);
        self.textures.lock().insert(
            id,
            WgpuImageEntry {
                wgpu_texture: Arc::new(wgpu_texture),
                descriptor: descriptor.clone().into_owned(),
                size: bytes,
            },
        );

        log::debug!(
            "WgpuBackend: Created texture '{}' with ID: {:?}, size: {} bytes",
            descriptor.label.as_deref().unwrap_or_default(),
            id,
            bytes
        );
        Ok(id)
    }

    fn destroy_image(&self, id: ImageId) -> Result<(), ResourceError> {
        let entry = self
            .textures
            .lock()
            .remove(&id)
            .ok_or(ResourceError::NotFound)?;
        entry.wgpu_texture.destroy();
        self.vram_allocated_bytes
            .fetch_sub(entry.size, Ordering::Relaxed);
        log::debug!("WgpuBackend: Destroyed texture with ID: {id:?}");
        Ok(())
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<SamplerId, ResourceError> {
        let wgpu_sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: descriptor.label.as_deref(),
            mag_filter: descriptor.mag_filter.into_wgpu(),
            min_filter: descriptor.min_filter.into_wgpu(),
            ..Default::default()
        });
        let id = SamplerId(self.generate_id());
        self.samplers.lock().insert(id, Arc::new(wgpu_sampler));
        Ok(id)
    }

    fn destroy_sampler(&self, id: SamplerId) -> Result<(), ResourceError> {
        self.samplers
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(ResourceError::NotFound)
    }

    fn create_frame_fence(&self) -> Result<FenceId, ResourceError> {
        let flag = Arc::new(AtomicU8::new(FENCE_PENDING));
        let signal = Arc::clone(&flag);

        self.queue.submit(std::iter::empty());
        self.queue.on_submitted_work_done(move || {
            signal.store(FENCE_SIGNALED, Ordering::Release);
        });

        let id = FenceId(self.generate_id());
        self.fences.lock().insert(id, flag);
        Ok(id)
    }

    fn fence_status(&self, fence: FenceId) -> FenceStatus {
        let Some(flag) = self.fences.lock().get(&fence).cloned() else {
            return FenceStatus::Failed;
        };
        if flag.load(Ordering::Acquire) == FENCE_PENDING {
            self.poll_device_non_blocking();
        }
        match flag.load(Ordering::Acquire) {
            FENCE_PENDING => FenceStatus::Pending,
            _ => FenceStatus::Completed,
        }
    }

    fn release_fence(&self, fence: FenceId) {
        self.fences.lock().remove(&fence);
    }

    fn upload(
        &self,
        source: &[u8],
        target: &DeviceObject,
        region: &CopyRegion,
    ) -> Result<(), ResourceError> {
        match (target, region) {
            (DeviceObject::Buffer { id, .. }, CopyRegion::Buffer { offset, .. }) => {
                self.write_buffer(*id, *offset, source)
            }
            (
                DeviceObject::Image { id, .. },
                CopyRegion::Image {
                    mip,
                    slice,
                    extent,
                    format,
                },
            ) => {
                let textures = self.textures.lock();
                let entry = textures.get(id).ok_or(ResourceError::NotFound)?;
                let layer = if entry.descriptor.depth > 1 { 0 } else { *slice };
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &entry.wgpu_texture,
                        mip_level: *mip,
                        origin: wgpu::Origin3d {
                            x: 0,
                            y: 0,
                            z: layer,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    source,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(extent.0 * format.bytes_per_texel()),
                        rows_per_image: Some(extent.1),
                    },
                    wgpu::Extent3d {
                        width: extent.0,
                        height: extent.1,
                        depth_or_array_layers: extent.2,
                    },
                );
                Ok(())
            }
            _ => Err(ResourceError::BackendError(format!(
                "cannot upload {:?} into a {}",
                region,
                target.kind_name()
            ))),
        }
    }

    fn execute(&self, stream: Box<dyn CommandStream>) -> Result<(), DeviceError> {
        let label = stream.label().to_string();
        let stream = stream
            .into_any()
            .downcast::<WgpuCommandStream>()
            .map_err(|_| {
                DeviceError::ExecutionFailed(format!(
                    "stream '{label}' was not recorded for the wgpu backend"
                ))
            })?;
        self.queue.submit(stream.into_buffers());
        log::trace!("WgpuBackend: submitted stream '{}'", label);
        Ok(())
    }

    fn wait_idle(&self, timeout: Duration) -> Result<(), DeviceError> {
        let started = Instant::now();
        let fence = self.create_frame_fence()?;
        let result = loop {
            match self.fence_status(fence) {
                FenceStatus::Completed => break Ok(()),
                FenceStatus::Failed => {
                    break Err(DeviceError::ExecutionFailed(
                        "idle fence was lost".to_string(),
                    ))
                }
                FenceStatus::Pending if started.elapsed() >= timeout => {
                    break Err(DeviceError::Timeout(timeout))
                }
                FenceStatus::Pending => thread::sleep(Duration::from_micros(250)),
            }
        };
        self.release_fence(fence);
        result
    }
}

impl ResourceMonitor for WgpuBackend {
    fn monitor_id(&self) -> Cow<'static, str> {
        Cow::Owned(format!("WgpuDeviceMemory({})", self.adapter_name))
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::DeviceMemory
    }

    fn get_usage_report(&self) -> ResourceUsageReport {
        ResourceUsageReport {
            current_bytes: self.vram_allocated_bytes.load(Ordering::Relaxed),
            peak_bytes: Some(self.vram_peak_bytes.load(Ordering::Relaxed)),
            total_capacity_bytes: None,
        }
    }
}
