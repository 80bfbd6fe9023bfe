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

//! Vertex input layouts.

use super::LayoutShape;
use std::fmt::Write;

/// The format of a single vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    /// One 32-bit float.
    Float32,
    /// Two 32-bit floats.
    Float32x2,
    /// Three 32-bit floats.
    Float32x3,
    /// Four 32-bit floats.
    Float32x4,
    /// Four 8-bit unsigned normalized values.
    Unorm8x4,
    /// One 32-bit unsigned integer.
    Uint32,
}

impl VertexFormat {
    /// Size of the attribute in bytes.
    pub const fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Unorm8x4 | VertexFormat::Uint32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// One attribute read from a vertex stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    /// Shader input location.
    pub location: u32,
    /// Attribute format.
    pub format: VertexFormat,
    /// Byte offset inside one element of the stream.
    pub offset: u64,
}

/// One bound vertex buffer and the attributes read from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexStream {
    /// Distance in bytes between consecutive elements.
    pub stride: u64,
    /// Advance per instance instead of per vertex.
    pub instanced: bool,
    /// Attributes read from this stream.
    pub attributes: Vec<VertexAttribute>,
}

/// The full vertex input description of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexShape {
    streams: Vec<VertexStream>,
}

impl VertexShape {
    /// Creates a shape from its streams, in binding order.
    pub fn new(streams: Vec<VertexStream>) -> Self {
        Self { streams }
    }

    /// The streams of this shape.
    pub fn streams(&self) -> &[VertexStream] {
        &self.streams
    }
}

impl LayoutShape for VertexShape {
    fn entry_count(&self) -> usize {
        self.streams.iter().map(|s| s.attributes.len()).sum()
    }

    fn describe(&self) -> String {
        let mut out = String::new();
        for (index, stream) in self.streams.iter().enumerate() {
            if index > 0 {
                out.push_str(" | ");
            }
            let rate = if stream.instanced { "instance" } else { "vertex" };
            let _ = write!(out, "stride {} per {}:", stream.stride, rate);
            for attr in &stream.attributes {
                let _ = write!(out, " @{} {:?}+{}", attr.location, attr.format, attr.offset);
            }
        }
        out
    }
}
