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

use super::LayoutShape;

/// The kind of resource view bound at one slot of a binding layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    /// A read-only uniform block.
    ConstantBuffer,
    /// A read-only typed buffer.
    Buffer,
    /// A writable typed buffer.
    BufferWritable,
    /// A read-only structured buffer.
    BufferStructured,
    /// A writable structured buffer.
    BufferStructuredWritable,
    /// A sampled image.
    Image,
    /// A storage image.
    ImageWritable,
    /// A sampler.
    Sampler,
}

impl ViewKind {
    /// Returns `true` if shaders may write through this view.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            ViewKind::BufferWritable | ViewKind::BufferStructuredWritable | ViewKind::ImageWritable
        )
    }
}

/// An ordered list of view kinds. Slot order is significant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BindingShape {
    views: Vec<ViewKind>,
}

impl BindingShape {
    /// Creates a shape from its slots, in binding order.
    pub fn new(views: Vec<ViewKind>) -> Self {
        Self { views }
    }

    /// The view kind of every slot.
    pub fn views(&self) -> &[ViewKind] {
        &self.views
    }

    /// Number of slots shaders may write through.
    pub fn writable_count(&self) -> usize {
        self.views.iter().filter(|v| v.is_writable()).count()
    }
}

impl FromIterator<ViewKind> for BindingShape {
    fn from_iter<I: IntoIterator<Item = ViewKind>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl LayoutShape for BindingShape {
    fn entry_count(&self) -> usize {
        self.views.len()
    }

    fn describe(&self) -> String {
        format!("{:?}", self.views)
    }
}
