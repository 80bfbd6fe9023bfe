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

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use std::borrow::Cow;
use std::sync::Arc;
use strata_core::backend::{
    BufferDescriptor, BufferUsage, FilterMode, ImageDescriptor, ImageFormat, SamplerDescriptor,
};
use strata_core::copy::{CopyRange, SliceDataProvider, SolidFillProvider};
use strata_core::layout::{
    BindingGroup, BindingShape, LayoutRegistry, VertexAttribute, VertexFormat, VertexInput,
    VertexShape, VertexStream, ViewKind,
};
use strata_core::transient::TransientBufferKind;
use strata_core::{CommandThread, HalConfig};
use strata_infra::graphics::{BackendPreference, BackendSelector};

const FRAMES: u64 = 8;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: [f32; 3],
    uv: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameConstants {
    time: f32,
    frame: u32,
    _padding: [u32; 2],
}

fn load_config() -> Result<HalConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            HalConfig::from_file(&path).with_context(|| format!("loading config '{path}'"))
        }
        None => Ok(HalConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    let preference = match std::env::var("STRATA_BACKEND") {
        Ok(value) => value.parse().map_err(anyhow::Error::msg)?,
        Err(_) => BackendPreference::Auto,
    };
    let backend = BackendSelector::new(preference).select_blocking()?;
    let mut device = CommandThread::start(backend, config)?;

    let quad = [
        Vertex { position: [-1.0, -1.0, 0.0], uv: [0.0, 1.0] },
        Vertex { position: [1.0, -1.0, 0.0], uv: [1.0, 1.0] },
        Vertex { position: [1.0, 1.0, 0.0], uv: [1.0, 0.0] },
        Vertex { position: [-1.0, 1.0, 0.0], uv: [0.0, 0.0] },
    ];
    let vertex_buffer = device.create_buffer(&BufferDescriptor {
        label: Some(Cow::Borrowed("quad vertices")),
        size: std::mem::size_of_val(&quad) as u64,
        usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
    })?;
    let vertex_upload = device.schedule_upload(
        vertex_buffer,
        CopyRange::Whole,
        Arc::new(SliceDataProvider::new(
            "quad vertices",
            bytemuck::cast_slice::<Vertex, u8>(&quad).to_vec(),
            0,
        )),
    )?;

    let checker = ImageDescriptor {
        label: Some(Cow::Borrowed("checker")),
        width: 64,
        height: 64,
        depth: 1,
        mips: 4,
        slices: 1,
        format: ImageFormat::Rgba8Unorm,
    };
    let image = device.create_image(&checker)?;
    let image_upload = device.schedule_upload(
        image,
        CopyRange::Whole,
        Arc::new(SolidFillProvider::new("checker", vec![0xFF, 0x00, 0xFF, 0xFF])),
    )?;

    let material_constants = device.create_buffer(&BufferDescriptor {
        label: Some(Cow::Borrowed("material constants")),
        size: 256,
        usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
    })?;
    let sampler = device.create_sampler(&SamplerDescriptor {
        label: Some(Cow::Borrowed("linear")),
        mag_filter: FilterMode::Linear,
        min_filter: FilterMode::Linear,
    })?;

    let bindings = LayoutRegistry::<BindingShape>::new();
    let material = BindingGroup::new(
        &bindings,
        &BindingShape::new(vec![ViewKind::ConstantBuffer, ViewKind::Image, ViewKind::Sampler]),
        vec![material_constants, image, sampler],
        device.context().objects(),
    )?;
    let vertex_layouts = LayoutRegistry::<VertexShape>::new();
    let mesh = VertexInput::new(
        &vertex_layouts,
        &VertexShape::new(vec![VertexStream {
            stride: std::mem::size_of::<Vertex>() as u64,
            instanced: false,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 12,
                },
            ],
        }]),
        vec![vertex_buffer],
        device.context().objects(),
    )?;
    log::info!(
        "Layouts: material {:?} = {}, mesh {:?} = {}",
        material.layout(),
        bindings.name_for(material.layout()).unwrap_or_default(),
        mesh.layout(),
        vertex_layouts.name_for(mesh.layout()).unwrap_or_default()
    );

    for frame in 0..FRAMES {
        let mut constants = device.begin_transient_frame(TransientBufferKind::Constants);
        let data = FrameConstants {
            time: frame as f32 / 60.0,
            frame: frame as u32,
            _padding: [0; 2],
        };
        constants
            .allocate(std::mem::size_of::<FrameConstants>() as u64)?
            .write_data(0, bytemuck::bytes_of(&data))?;
        constants.flush()?;
        device.end_transient_frame(constants);
        device.advance_frame();
    }

    device.full_sync()?;
    let vertices = vertex_upload.wait()?;
    let texels = image_upload.wait()?;
    log::info!(
        "Uploads done: vertices {} jobs ({} canceled), image {} jobs ({} canceled)",
        vertices.finished_jobs,
        vertices.canceled_jobs,
        texels.finished_jobs,
        texels.canceled_jobs
    );

    device.destroy_object(image);
    device.advance_frame();
    device.full_sync()?;

    log::info!("{:#?}", device.stats());
    for monitor in device.monitors() {
        let report = monitor.get_usage_report();
        log::info!(
            "{} ({:?}): {} bytes, peak {:?}, capacity {:?}",
            monitor.monitor_id(),
            monitor.resource_type(),
            report.current_bytes,
            report.peak_bytes,
            report.total_capacity_bytes
        );
    }

    device.shutdown()?;
    Ok(())
}
