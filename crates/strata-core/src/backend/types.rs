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

//! Descriptors and opaque IDs exchanged with a [`GpuBackend`](super::GpuBackend).

use std::any::Any;
use std::borrow::Cow;
use std::fmt::Debug;

/// Buffer copy offsets and sizes must be multiples of this many bytes.
pub const COPY_BUFFER_ALIGNMENT: u64 = 4;

/// A set of flags describing the allowed usages of a buffer.
///
/// Bit positions match the common native layout so backends can pass them through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage {
    bits: u32,
}

impl BufferUsage {
    /// The buffer can be mapped for writing on the CPU.
    pub const MAP_WRITE: Self = Self { bits: 1 << 1 };
    /// The buffer can be used as the source of a copy operation.
    pub const COPY_SRC: Self = Self { bits: 1 << 2 };
    /// The buffer can be used as the destination of a copy operation.
    pub const COPY_DST: Self = Self { bits: 1 << 3 };
    /// The buffer can be bound as an index buffer.
    pub const INDEX: Self = Self { bits: 1 << 4 };
    /// The buffer can be bound as a vertex buffer.
    pub const VERTEX: Self = Self { bits: 1 << 5 };
    /// The buffer can be bound as a uniform buffer.
    pub const UNIFORM: Self = Self { bits: 1 << 6 };
    /// The buffer can be bound as a storage buffer.
    pub const STORAGE: Self = Self { bits: 1 << 7 };

    /// Returns the raw bits.
    pub const fn bits(&self) -> u32 {
        self.bits
    }

    /// Combines two sets of flags.
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    /// Checks if every flag of `other` is set.
    pub const fn contains(&self, other: Self) -> bool {
        (self.bits & other.bits) == other.bits
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// A descriptor used to create a buffer.
#[derive(Debug, Clone)]
pub struct BufferDescriptor<'a> {
    /// An optional debug label for the buffer.
    pub label: Option<Cow<'a, str>>,
    /// The total size of the buffer in bytes.
    pub size: u64,
    /// How the buffer will be used.
    pub usage: BufferUsage,
}

impl BufferDescriptor<'_> {
    /// Returns a copy that owns its label.
    pub fn into_owned(self) -> BufferDescriptor<'static> {
        BufferDescriptor {
            label: self.label.map(|l| Cow::Owned(l.into_owned())),
            size: self.size,
            usage: self.usage,
        }
    }
}

/// The texel format of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// One 8-bit unsigned normalized channel.
    R8Unorm,
    /// Four 8-bit unsigned normalized channels.
    Rgba8Unorm,
    /// Four 16-bit float channels.
    Rgba16Float,
    /// One 32-bit float channel.
    R32Float,
    /// Four 32-bit float channels.
    Rgba32Float,
}

impl ImageFormat {
    /// Size of one texel in bytes.
    pub const fn bytes_per_texel(&self) -> u32 {
        match self {
            ImageFormat::R8Unorm => 1,
            ImageFormat::Rgba8Unorm | ImageFormat::R32Float => 4,
            ImageFormat::Rgba16Float => 8,
            ImageFormat::Rgba32Float => 16,
        }
    }
}

/// A descriptor used to create an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor<'a> {
    /// An optional debug label for the image.
    pub label: Option<Cow<'a, str>>,
    /// Width of mip 0 in texels.
    pub width: u32,
    /// Height of mip 0 in texels.
    pub height: u32,
    /// Depth of mip 0 in texels (1 for 2D images).
    pub depth: u32,
    /// Number of mip levels.
    pub mips: u32,
    /// Number of array slices.
    pub slices: u32,
    /// Texel format.
    pub format: ImageFormat,
}

impl ImageDescriptor<'_> {
    /// Extent of `mip` as `(width, height, depth)`, never smaller than one texel.
    pub fn mip_extent(&self, mip: u32) -> (u32, u32, u32) {
        (
            (self.width >> mip).max(1),
            (self.height >> mip).max(1),
            (self.depth >> mip).max(1),
        )
    }

    /// Size in bytes of one slice of `mip`.
    pub fn mip_data_size(&self, mip: u32) -> u64 {
        let (w, h, d) = self.mip_extent(mip);
        w as u64 * h as u64 * d as u64 * self.format.bytes_per_texel() as u64
    }

    /// Returns a copy that owns its label.
    pub fn into_owned(self) -> ImageDescriptor<'static> {
        ImageDescriptor {
            label: self.label.map(|l| Cow::Owned(l.into_owned())),
            width: self.width,
            height: self.height,
            depth: self.depth,
            mips: self.mips,
            slices: self.slices,
            format: self.format,
        }
    }
}

/// Texture filtering mode of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    /// Nearest texel.
    #[default]
    Nearest,
    /// Linear interpolation between texels.
    Linear,
}

/// A descriptor used to create a sampler.
#[derive(Debug, Clone, Default)]
pub struct SamplerDescriptor<'a> {
    /// An optional debug label for the sampler.
    pub label: Option<Cow<'a, str>>,
    /// Magnification filter.
    pub mag_filter: FilterMode,
    /// Minification filter.
    pub min_filter: FilterMode,
}

impl SamplerDescriptor<'_> {
    /// Returns a copy that owns its label.
    pub fn into_owned(self) -> SamplerDescriptor<'static> {
        SamplerDescriptor {
            label: self.label.map(|l| Cow::Owned(l.into_owned())),
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
        }
    }
}

/// An opaque handle to a backend buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub usize);

/// An opaque handle to a backend image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageId(pub usize);

/// An opaque handle to a backend sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerId(pub usize);

/// An opaque handle to a GPU-side completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceId(pub usize);

/// The observed state of a fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FenceStatus {
    /// The GPU has not reached the fence yet.
    Pending,
    /// All work submitted before the fence has finished.
    Completed,
    /// The GPU reported an error for the work guarded by the fence.
    Failed,
}

/// One destination region of a single upload job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyRegion {
    /// A byte range of a buffer.
    Buffer {
        /// Byte offset into the destination buffer.
        offset: u64,
        /// Number of bytes written.
        size: u64,
    },
    /// One whole mip level of one array slice of an image.
    Image {
        /// Mip level.
        mip: u32,
        /// Array slice.
        slice: u32,
        /// Extent of the mip level as `(width, height, depth)`.
        extent: (u32, u32, u32),
        /// Texel format of the destination.
        format: ImageFormat,
    },
}

impl CopyRegion {
    /// Number of bytes of source data this region needs.
    pub fn data_size(&self) -> u64 {
        match self {
            CopyRegion::Buffer { size, .. } => *size,
            CopyRegion::Image { extent, format, .. } => {
                extent.0 as u64
                    * extent.1 as u64
                    * extent.2 as u64
                    * format.bytes_per_texel() as u64
            }
        }
    }
}

/// Identifies which implementation a backend is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// The CPU-only software backend.
    Headless,
    /// The `wgpu` backend.
    Wgpu,
}

/// Basic information about an initialized backend.
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Which implementation is running.
    pub kind: BackendKind,
    /// The adapter or device name reported by the implementation.
    pub adapter_name: String,
}

/// An opaque, pre-recorded command stream.
///
/// The device layer only schedules a stream and tracks which frame it belongs to;
/// each backend downcasts the stream to its own recorded type on execution.
pub trait CommandStream: Send + Debug + 'static {
    /// A debug label for logs.
    fn label(&self) -> &str;

    /// Converts the boxed stream into `Any` so a backend can downcast it.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}
