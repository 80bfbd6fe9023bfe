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

//! Sources of upload data.

use crate::backend::{CopyRegion, ImageDescriptor};
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cooperative cancellation flag shared between the copy queue and a provider.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not canceled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once the upload has been canceled.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }
}

/// Fills staging memory for an upload.
///
/// Providers are called on the command thread. Long-running providers should poll the
/// token and return early once it is canceled; the written data is then discarded.
pub trait SourceDataProvider: Send + Sync + Debug {
    /// A label used in logs.
    fn debug_label(&self) -> &str;

    /// Writes the source data of `region` into `dest`.
    ///
    /// `dest` is exactly `region.data_size()` bytes long. For image regions the data
    /// is tightly packed rows of texels.
    fn write_source_data(&self, dest: &mut [u8], token: &CancelToken, region: &CopyRegion);
}

/// Uploads bytes held in memory.
///
/// Buffer regions copy `region.size` bytes starting at the region's offset relative
/// to the first scheduled byte. Image data is tightly packed mip by mip, and inside
/// each mip slice by slice.
#[derive(Debug, Clone)]
pub struct SliceDataProvider {
    label: String,
    data: Arc<[u8]>,
    base_offset: u64,
    image: Option<ImageDescriptor<'static>>,
}

impl SliceDataProvider {
    /// Wraps `data`, which starts at buffer offset `base_offset`.
    pub fn new(label: impl Into<String>, data: impl Into<Arc<[u8]>>, base_offset: u64) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            base_offset,
            image: None,
        }
    }

    /// Wraps the packed texels of every mip and slice of an image.
    pub fn for_image(
        label: impl Into<String>,
        data: impl Into<Arc<[u8]>>,
        descriptor: &ImageDescriptor,
    ) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
            base_offset: 0,
            image: Some(descriptor.clone().into_owned()),
        }
    }

    fn image_offset(&self, mip: u32, slice: u32) -> u64 {
        let Some(image) = &self.image else {
            return 0;
        };
        let before: u64 = (0..mip)
            .map(|level| image.mip_data_size(level) * image.slices as u64)
            .sum();
        before + slice as u64 * image.mip_data_size(mip)
    }

    /// The wrapped bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl SourceDataProvider for SliceDataProvider {
    fn debug_label(&self) -> &str {
        &self.label
    }

    fn write_source_data(&self, dest: &mut [u8], _token: &CancelToken, region: &CopyRegion) {
        let start = match region {
            CopyRegion::Buffer { offset, .. } => offset.saturating_sub(self.base_offset) as usize,
            CopyRegion::Image { mip, slice, .. } => self.image_offset(*mip, *slice) as usize,
        };
        let available = self.data.len().saturating_sub(start).min(dest.len());
        if available > 0 {
            dest[..available].copy_from_slice(&self.data[start..start + available]);
        }
        dest[available..].fill(0);
    }
}

/// Fills a region by repeating a fixed pattern, typically one texel or one element.
#[derive(Debug, Clone)]
pub struct SolidFillProvider {
    label: String,
    pattern: Vec<u8>,
}

impl SolidFillProvider {
    /// Repeats `pattern`. An empty pattern fills with zeros.
    pub fn new(label: impl Into<String>, pattern: Vec<u8>) -> Self {
        Self {
            label: label.into(),
            pattern,
        }
    }

    /// Repeats the bytes of a plain-old-data value.
    pub fn from_pod<T: bytemuck::Pod>(label: impl Into<String>, value: &T) -> Self {
        Self::new(label, bytemuck::bytes_of(value).to_vec())
    }
}

impl SourceDataProvider for SolidFillProvider {
    fn debug_label(&self) -> &str {
        &self.label
    }

    fn write_source_data(&self, dest: &mut [u8], token: &CancelToken, _region: &CopyRegion) {
        if self.pattern.is_empty() {
            dest.fill(0);
            return;
        }
        for chunk in dest.chunks_mut(self.pattern.len()) {
            if token.is_canceled() {
                return;
            }
            chunk.copy_from_slice(&self.pattern[..chunk.len()]);
        }
    }
}
