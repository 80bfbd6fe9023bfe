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

//! Concrete graphics backends and their selection.

pub mod headless;
pub mod selector;
#[cfg(feature = "wgpu-backend")]
pub mod wgpu;

pub use self::headless::{FenceMode, HeadlessBackend, HeadlessCommandStream};
pub use self::selector::{BackendPreference, BackendSelector, HeadlessFactory};
#[cfg(feature = "wgpu-backend")]
pub use self::selector::WgpuFactory;
