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

//! # Strata Core
//!
//! The backend-independent half of the GPU abstraction: the backend contract, the
//! command thread that owns submission, frame sequencing with deferred deletion, the
//! staged upload queue, transient buffer pooling and layout interning.

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod copy;
pub mod error;
pub mod frame;
pub mod handle;
pub mod layout;
pub mod telemetry;
pub mod thread;
pub mod transient;

#[cfg(test)]
mod test_support;

pub use config::HalConfig;
pub use thread::CommandThread;
