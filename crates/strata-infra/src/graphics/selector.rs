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

//! Backend selection with fallback support.
//!
//! Factories are tried in order of preference; the first one that creates a backend
//! wins. `Auto` prefers a real GPU and falls back to the headless backend, so a
//! machine without an adapter still gets a working device.

use super::headless::{FenceMode, HeadlessBackend};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use strata_core::backend::{BackendFactory, BackendKind, GpuBackend};
use strata_core::error::DeviceError;

/// Which backend the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendPreference {
    /// A GPU backend when one is available, otherwise headless.
    #[default]
    Auto,
    /// Always the headless backend.
    Headless,
    /// Only the wgpu backend.
    Wgpu,
}

impl FromStr for BackendPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendPreference::Auto),
            "headless" => Ok(BackendPreference::Headless),
            "wgpu" => Ok(BackendPreference::Wgpu),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Creates a [`HeadlessBackend`].
#[derive(Debug, Default)]
pub struct HeadlessFactory {
    fence_mode: FenceMode,
}

impl HeadlessFactory {
    /// A factory whose backends signal fences according to `fence_mode`.
    pub fn new(fence_mode: FenceMode) -> Self {
        Self { fence_mode }
    }
}

#[async_trait]
impl BackendFactory for HeadlessFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Headless
    }

    fn is_supported(&self) -> bool {
        true
    }

    async fn create(&self) -> Result<Arc<dyn GpuBackend>, DeviceError> {
        Ok(Arc::new(HeadlessBackend::new(self.fence_mode)))
    }
}

/// Creates a [`WgpuBackend`](super::wgpu::WgpuBackend) on the best adapter found.
#[cfg(feature = "wgpu-backend")]
#[derive(Debug)]
pub struct WgpuFactory {
    instance: wgpu::Instance,
}

#[cfg(feature = "wgpu-backend")]
impl WgpuFactory {
    /// Create a factory with a shared instance.
    pub fn new(instance: wgpu::Instance) -> Self {
        Self { instance }
    }
}

#[cfg(feature = "wgpu-backend")]
impl Default for WgpuFactory {
    fn default() -> Self {
        Self::new(wgpu::Instance::new(wgpu::InstanceDescriptor::new_without_display_handle()))
    }
}

#[cfg(feature = "wgpu-backend")]
#[async_trait]
impl BackendFactory for WgpuFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::Wgpu
    }

    fn is_supported(&self) -> bool {
        cfg!(not(target_arch = "wasm32"))
    }

    async fn create(&self) -> Result<Arc<dyn GpuBackend>, DeviceError> {
        let adapter = self
            .instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| {
                DeviceError::InitializationFailed(format!("Failed to find suitable adapter: {e}"))
            })?;
        let backend = super::wgpu::WgpuBackend::new(&adapter)
            .await
            .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?;
        Ok(Arc::new(backend))
    }
}

/// Tries backend factories in order until one succeeds.
pub struct BackendSelector {
    factories: Vec<Box<dyn BackendFactory>>,
}

impl BackendSelector {
    /// The factory order for `preference`.
    pub fn new(preference: BackendPreference) -> Self {
        let mut factories: Vec<Box<dyn BackendFactory>> = Vec::new();
        if preference != BackendPreference::Headless {
            #[cfg(feature = "wgpu-backend")]
            factories.push(Box::new(WgpuFactory::default()));
        }
        if preference != BackendPreference::Wgpu {
            factories.push(Box::new(HeadlessFactory::default()));
        }
        Self { factories }
    }

    /// An explicit factory list.
    pub fn with_factories(factories: Vec<Box<dyn BackendFactory>>) -> Self {
        Self { factories }
    }

    /// The kinds that will be attempted, in order.
    pub fn candidates(&self) -> Vec<BackendKind> {
        self.factories.iter().map(|f| f.kind()).collect()
    }

    /// Creates the first backend that initializes.
    /// ## Errors
    /// Fails when every factory is unsupported or failed.
    pub async fn select(&self) -> Result<Arc<dyn GpuBackend>> {
        let start_time = Instant::now();
        let mut attempted = Vec::new();

        for factory in &self.factories {
            let kind = factory.kind();
            if !factory.is_supported() {
                log::debug!("Skipping unsupported {:?} backend.", kind);
                continue;
            }
            attempted.push(kind);
            log::info!("Attempting to initialize {kind:?} backend...");

            match factory.create().await {
                Ok(backend) => {
                    log::info!(
                        "Selected {:?} backend with adapter \"{}\" in {} ms",
                        kind,
                        backend.info().adapter_name,
                        start_time.elapsed().as_millis()
                    );
                    return Ok(backend);
                }
                Err(e) => {
                    log::warn!("Failed to initialize {:?} backend: {}", kind, e);
                }
            }
        }

        Err(anyhow!(
            "All backend attempts failed. Attempted: {attempted:?}"
        ))
    }

    /// Blocking version of [`select`](Self::select).
    pub fn select_blocking(&self) -> Result<Arc<dyn GpuBackend>> {
        pollster::block_on(self.select())
    }
}
