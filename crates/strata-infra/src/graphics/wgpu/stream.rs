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

use std::any::Any;
use strata_core::backend::CommandStream;

/// Finished wgpu command buffers submitted together.
#[derive(Debug)]
pub struct WgpuCommandStream {
    label: String,
    buffers: Vec<wgpu::CommandBuffer>,
}

impl WgpuCommandStream {
    /// Finishes `encoder` into a single-buffer stream.
    pub fn from_encoder(label: impl Into<String>, encoder: wgpu::CommandEncoder) -> Self {
        Self {
            label: label.into(),
            buffers: vec![encoder.finish()],
        }
    }

    /// Wraps command buffers that were already finished.
    pub fn from_buffers(label: impl Into<String>, buffers: Vec<wgpu::CommandBuffer>) -> Self {
        Self {
            label: label.into(),
            buffers,
        }
    }

    pub(super) fn into_buffers(self) -> Vec<wgpu::CommandBuffer> {
        self.buffers
    }
}

impl CommandStream for WgpuCommandStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
