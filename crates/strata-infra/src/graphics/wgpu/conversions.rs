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

use strata_core::backend::{BufferUsage, FilterMode, ImageDescriptor, ImageFormat};

/// A local extension trait to convert strata types into WGPU-compatible types.
pub trait IntoWgpu<T> {
    /// Consumes self and converts it into a WGPU-compatible type.
    fn into_wgpu(self) -> T;
}

impl IntoWgpu<wgpu::BufferUsages> for BufferUsage {
    fn into_wgpu(self) -> wgpu::BufferUsages {
        // Bit positions are shared with wgpu.
        wgpu::BufferUsages::from_bits_truncate(self.bits())
    }
}

impl IntoWgpu<wgpu::TextureFormat> for ImageFormat {
    fn into_wgpu(self) -> wgpu::TextureFormat {
        match self {
            ImageFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
            ImageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
            ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

impl IntoWgpu<wgpu::FilterMode> for FilterMode {
    fn into_wgpu(self) -> wgpu::FilterMode {
        match self {
            FilterMode::Nearest => wgpu::FilterMode::Nearest,
            FilterMode::Linear => wgpu::FilterMode::Linear,
        }
    }
}

/// Dimension and extent of the texture backing an image.
///
/// Images deeper than one texel become 3D textures; everything else is a 2D array
/// whose layers are the image slices.
pub fn texture_shape(descriptor: &ImageDescriptor) -> (wgpu::TextureDimension, wgpu::Extent3d) {
    if descriptor.depth > 1 {
        (
            wgpu::TextureDimension::D3,
            wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: descriptor.depth,
            },
        )
    } else {
        (
            wgpu::TextureDimension::D2,
            wgpu::Extent3d {
                width: descriptor.width,
                height: descriptor.height,
                depth_or_array_layers: descriptor.slices,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_bits_match() {
        let usage = BufferUsage::COPY_DST | BufferUsage::UNIFORM;
        assert_eq!(
            usage.into_wgpu(),
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::UNIFORM
        );
        assert_eq!(
            BufferUsage::MAP_WRITE.into_wgpu(),
            wgpu::BufferUsages::MAP_WRITE
        );
        assert_eq!(BufferUsage::STORAGE.into_wgpu(), wgpu::BufferUsages::STORAGE);
    }

    #[test]
    fn test_array_image_uses_layers() {
        let descriptor = ImageDescriptor {
            label: None,
            width: 64,
            height: 32,
            depth: 1,
            mips: 1,
            slices: 6,
            format: ImageFormat::Rgba8Unorm,
        };
        let (dimension, size) = texture_shape(&descriptor);
        assert_eq!(dimension, wgpu::TextureDimension::D2);
        assert_eq!(size.depth_or_array_layers, 6);
    }
}
