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

//! Resource sets bound against a registered layout.
//!
//! A [`BindingGroup`] pairs device objects with the binding layout they fill, and a
//! [`VertexInput`] pairs vertex buffers with the vertex layout that reads them. Each
//! carries exactly one [`LayoutId`], checked against the objects when it is built.

use super::{BindingShape, LayoutId, LayoutRegistry, VertexShape, ViewKind};
use crate::backend::{BufferUsage, DeviceObject, ObjectId, ObjectRegistry};
use crate::error::ResourceError;

/// Device objects bound to the slots of a binding layout, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingGroup {
    layout: LayoutId,
    resources: Vec<ObjectId>,
}

impl BindingGroup {
    /// Registers `shape` and binds `resources` to its slots.
    ///
    /// ## Arguments
    /// * `registry` - The registry that assigns the layout ID.
    /// * `shape` - The binding layout.
    /// * `resources` - One object per slot, in slot order.
    /// * `objects` - The live objects `resources` refer to.
    ///
    /// ## Errors
    /// * `ResourceError::LayoutMismatch` - the slot count differs, or an object does not
    ///   suit its slot's view kind.
    /// * `ResourceError::NotFound` - an object ID does not resolve.
    pub fn new(
        registry: &LayoutRegistry<BindingShape>,
        shape: &BindingShape,
        resources: Vec<ObjectId>,
        objects: &ObjectRegistry,
    ) -> Result<Self, ResourceError> {
        if resources.len() != shape.views().len() {
            return Err(ResourceError::LayoutMismatch(format!(
                "{} resources for {} binding slots",
                resources.len(),
                shape.views().len()
            )));
        }
        for (slot, (view, id)) in shape.views().iter().zip(&resources).enumerate() {
            let object = objects.resolve(*id).ok_or(ResourceError::NotFound)?;
            if !suits(*view, &object) {
                return Err(ResourceError::LayoutMismatch(format!(
                    "slot {slot} expects {view:?}, got a {}",
                    object.kind_name()
                )));
            }
        }

        Ok(Self {
            layout: registry.register(shape),
            resources,
        })
    }

    /// The binding layout of the group.
    pub fn layout(&self) -> LayoutId {
        self.layout
    }

    /// The bound objects, in slot order.
    pub fn resources(&self) -> &[ObjectId] {
        &self.resources
    }
}

/// Vertex buffers bound to the streams of a vertex layout, in stream order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    layout: LayoutId,
    buffers: Vec<ObjectId>,
}

impl VertexInput {
    /// Registers `shape` and binds one vertex buffer per stream.
    /// ## Errors
    /// * `ResourceError::LayoutMismatch` - the stream count differs, or an object is not
    ///   a buffer created with `BufferUsage::VERTEX`.
    /// * `ResourceError::NotFound` - an object ID does not resolve.
    pub fn new(
        registry: &LayoutRegistry<VertexShape>,
        shape: &VertexShape,
        buffers: Vec<ObjectId>,
        objects: &ObjectRegistry,
    ) -> Result<Self, ResourceError> {
        if buffers.len() != shape.streams().len() {
            return Err(ResourceError::LayoutMismatch(format!(
                "{} buffers for {} vertex streams",
                buffers.len(),
                shape.streams().len()
            )));
        }
        for (stream, id) in buffers.iter().enumerate() {
            match objects.resolve(*id).ok_or(ResourceError::NotFound)? {
                DeviceObject::Buffer { usage, .. } if usage.contains(BufferUsage::VERTEX) => {}
                other => {
                    return Err(ResourceError::LayoutMismatch(format!(
                        "stream {stream} needs a vertex buffer, got a {}",
                        other.kind_name()
                    )))
                }
            }
        }

        Ok(Self {
            layout: registry.register(shape),
            buffers,
        })
    }

    /// The vertex layout of the input.
    pub fn layout(&self) -> LayoutId {
        self.layout
    }

    /// The bound vertex buffers, in stream order.
    pub fn buffers(&self) -> &[ObjectId] {
        &self.buffers
    }
}

fn suits(view: ViewKind, object: &DeviceObject) -> bool {
    match (view, object) {
        (ViewKind::ConstantBuffer, DeviceObject::Buffer { usage, .. }) => {
            usage.contains(BufferUsage::UNIFORM)
        }
        (
            ViewKind::Buffer
            | ViewKind::BufferWritable
            | ViewKind::BufferStructured
            | ViewKind::BufferStructuredWritable,
            DeviceObject::Buffer { usage, .. },
        ) => usage.contains(BufferUsage::STORAGE),
        (ViewKind::Image | ViewKind::ImageWritable, DeviceObject::Image { .. }) => true,
        (ViewKind::Sampler, DeviceObject::Sampler { .. }) => true,
        _ => false,
    }
}
