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

//! The registry of live device objects.
//!
//! Every buffer, image and sampler created through the device is recorded here and
//! addressed by an [`ObjectId`]. Destroying an object unregisters it at once, so any
//! work that only holds the ID (an upload job, for instance) sees it disappear, while
//! the backend resource itself waits in a frame's deletion list until the GPU is done.

use super::types::{BufferId, BufferUsage, ImageDescriptor, ImageId, SamplerId};
use super::GpuBackend;
use crate::error::ResourceError;
use crate::handle::{Arena, Handle};
use parking_lot::Mutex;

/// A live backend object together with the data needed to validate uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceObject {
    /// A buffer of `size` bytes.
    Buffer {
        /// Backend ID.
        id: BufferId,
        /// Size in bytes.
        size: u64,
        /// Declared usage.
        usage: BufferUsage,
    },
    /// An image with its creation setup.
    Image {
        /// Backend ID.
        id: ImageId,
        /// Creation setup.
        descriptor: ImageDescriptor<'static>,
    },
    /// A sampler.
    Sampler {
        /// Backend ID.
        id: SamplerId,
    },
}

impl DeviceObject {
    /// A short name of the object kind, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            DeviceObject::Buffer { .. } => "buffer",
            DeviceObject::Image { .. } => "image",
            DeviceObject::Sampler { .. } => "sampler",
        }
    }

    /// Releases the backend resource.
    pub fn destroy(&self, backend: &dyn GpuBackend) -> Result<(), ResourceError> {
        match self {
            DeviceObject::Buffer { id, .. } => backend.destroy_buffer(*id),
            DeviceObject::Image { id, .. } => backend.destroy_image(*id),
            DeviceObject::Sampler { id } => backend.destroy_sampler(*id),
        }
    }
}

/// A generation-checked reference to a registered [`DeviceObject`].
pub type ObjectId = Handle<DeviceObject>;

/// Thread-safe table of live device objects.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: Mutex<Arena<DeviceObject>>,
}

impl ObjectRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a newly created object.
    pub fn register(&self, object: DeviceObject) -> ObjectId {
        self.objects.lock().insert(object)
    }

    /// Returns a copy of the object behind `id` if it is still alive.
    pub fn resolve(&self, id: ObjectId) -> Option<DeviceObject> {
        self.objects.lock().get(id).cloned()
    }

    /// Returns `true` if `id` still resolves.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.lock().contains(id)
    }

    /// Removes the object from the registry and hands it back for deferred destruction.
    pub fn unregister(&self, id: ObjectId) -> Option<DeviceObject> {
        self.objects.lock().remove(id)
    }

    /// Removes every object, returning them for destruction.
    pub fn drain(&self) -> Vec<DeviceObject> {
        self.objects.lock().drain()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Returns `true` if no object is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(id: usize) -> DeviceObject {
        DeviceObject::Buffer {
            id: BufferId(id),
            size: 64,
            usage: BufferUsage::COPY_DST,
        }
    }

    #[test]
    fn test_unregistered_object_stops_resolving() {
        let registry = ObjectRegistry::new();
        let id = registry.register(buffer(1));
        assert_eq!(registry.resolve(id), Some(buffer(1)));

        assert_eq!(registry.unregister(id), Some(buffer(1)));
        assert!(registry.resolve(id).is_none());
        assert!(registry.unregister(id).is_none());
    }

    #[test]
    fn test_recycled_slot_does_not_alias_old_id() {
        let registry = ObjectRegistry::new();
        let old = registry.register(buffer(1));
        registry.unregister(old);
        let new = registry.register(buffer(2));

        assert!(!registry.contains(old));
        assert_eq!(registry.resolve(new), Some(buffer(2)));
        assert_eq!(registry.len(), 1);
    }
}
