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

//! Routing of backend calls to the thread that owns the device.

use super::GpuBackend;
use crate::error::DeviceError;
use std::fmt::Debug;
use std::sync::Arc;

/// A backend call waiting to run on the device thread.
pub type BackendCall = Box<dyn FnOnce(&dyn GpuBackend) + Send + 'static>;

/// Runs backend calls on the thread that owns the device.
///
/// Calls dispatched through one executor run in dispatch order.
pub trait DeviceExecutor: Send + Sync + Debug {
    /// Queues `call`.
    /// ## Returns
    /// `false` if the device thread is gone; `call` is dropped without running.
    fn dispatch(&self, call: BackendCall) -> bool;
}

/// Runs `call` through `executor` and blocks until it has returned.
/// ## Errors
/// * `DeviceError::ThreadExited` - the call was dropped without running.
pub fn call_on_device<R: Send + 'static>(
    executor: &dyn DeviceExecutor,
    call: impl FnOnce(&dyn GpuBackend) -> R + Send + 'static,
) -> Result<R, DeviceError> {
    let (completer, handle) = crate::thread::task_pair();
    executor.dispatch(Box::new(move |backend| completer.complete(Ok(call(backend)))));
    handle.wait()
}

/// Runs every call immediately on the calling thread.
///
/// For owners that drive a backend from a single thread, such as tools and tests.
#[derive(Debug, Clone)]
pub struct InlineExecutor {
    backend: Arc<dyn GpuBackend>,
}

impl InlineExecutor {
    /// Wraps `backend`.
    pub fn new(backend: Arc<dyn GpuBackend>) -> Self {
        Self { backend }
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }
}

impl DeviceExecutor for InlineExecutor {
    fn dispatch(&self, call: BackendCall) -> bool {
        call(self.backend.as_ref());
        true
    }
}
