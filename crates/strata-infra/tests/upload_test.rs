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

//! Integration tests for staged uploads through the command thread.

use std::borrow::Cow;
use std::sync::Arc;
use strata_core::backend::{
    BufferDescriptor, BufferUsage, DeviceObject, ImageDescriptor, ImageFormat, ObjectId,
};
use strata_core::copy::{CopyRange, SliceDataProvider, SolidFillProvider, SourceDataProvider};
use strata_core::error::CopyError;
use strata_core::telemetry::ResourceMonitor;
use strata_core::transient::TransientBufferKind;
use strata_core::{CommandThread, HalConfig};
use strata_infra::graphics::{FenceMode, HeadlessBackend};

const PAGE: u64 = 1024;
const STAGING: u64 = 4 * PAGE;

fn start(fence_mode: FenceMode) -> (Arc<HeadlessBackend>, CommandThread) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(HeadlessBackend::new(fence_mode));
    let config = HalConfig {
        staging_area_size: STAGING,
        staging_page_size: PAGE,
        ..HalConfig::default()
    };
    let thread = CommandThread::start(backend.clone(), config).unwrap();
    (backend, thread)
}

fn buffer(thread: &CommandThread, size: u64) -> ObjectId {
    thread
        .create_buffer(&BufferDescriptor {
            label: Some(Cow::Borrowed("upload target")),
            size,
            usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
        })
        .unwrap()
}

fn read_back(backend: &HeadlessBackend, thread: &CommandThread, id: ObjectId) -> Vec<u8> {
    match thread.context().objects().resolve(id) {
        Some(DeviceObject::Buffer { id, .. }) => backend.read_buffer(id).unwrap(),
        other => panic!("expected a buffer, got {other:?}"),
    }
}

/// Lets the command thread run at least one full copy queue update.
fn tick(thread: &CommandThread) {
    for _ in 0..2 {
        thread.run_on_thread_and_wait(|_| ()).wait().unwrap();
    }
}

#[test]
fn test_buffer_upload_lands_after_sync() {
    let (backend, thread) = start(FenceMode::Immediate);
    let target = buffer(&thread, 16);
    let vertices: [f32; 4] = [1.0, -1.0, 0.5, 2.0];

    let ticket = thread
        .schedule_upload(
            target,
            CopyRange::Whole,
            Arc::new(SliceDataProvider::new(
                "quad",
                bytemuck::cast_slice::<f32, u8>(&vertices).to_vec(),
                0,
            )),
        )
        .unwrap();
    tick(&thread);
    thread.full_sync().unwrap();

    let outcome = ticket.wait().unwrap();
    assert!(outcome.is_complete());
    let bytes = read_back(&backend, &thread, target);
    assert_eq!(bytemuck::cast_slice::<u8, f32>(&bytes), &vertices);
}

#[test]
fn test_image_upload_writes_every_mip() {
    let (backend, thread) = start(FenceMode::Immediate);
    let descriptor = ImageDescriptor {
        label: Some(Cow::Borrowed("albedo")),
        width: 4,
        height: 4,
        depth: 1,
        mips: 2,
        slices: 1,
        format: ImageFormat::Rgba8Unorm,
    };
    let image = thread.create_image(&descriptor).unwrap();
    let texels: Vec<u8> = (0..80).collect();

    let ticket = thread
        .schedule_upload(
            image,
            CopyRange::Whole,
            Arc::new(SliceDataProvider::for_image(
                "albedo",
                texels.clone(),
                &descriptor,
            )),
        )
        .unwrap();
    assert_eq!(ticket.jobs().len(), 2);
    tick(&thread);
    thread.full_sync().unwrap();
    assert_eq!(ticket.wait().unwrap().finished_jobs, 2);

    let Some(DeviceObject::Image { id, .. }) = thread.context().objects().resolve(image) else {
        panic!("image disappeared");
    };
    assert_eq!(backend.read_image(id, 0, 0).unwrap(), texels[..64].to_vec());
    assert_eq!(backend.read_image(id, 1, 0).unwrap(), texels[64..].to_vec());
}

#[test]
fn test_staging_backpressure_never_fails() {
    let (backend, thread) = start(FenceMode::Manual);
    let fill: Arc<dyn SourceDataProvider> = Arc::new(SolidFillProvider::new("twos", vec![2]));
    let targets: Vec<ObjectId> = (0..3).map(|_| buffer(&thread, STAGING)).collect();
    let mut tickets: Vec<_> = targets
        .iter()
        .map(|&target| {
            thread
                .schedule_upload(target, CopyRange::Whole, Arc::clone(&fill))
                .unwrap()
        })
        .collect();

    let mut most_in_flight = 0;
    for _ in 0..50 {
        tick(&thread);
        most_in_flight = most_in_flight.max(thread.stats().uploads_in_flight);
        if tickets.iter().all(|t| t.is_finished()) {
            break;
        }
        backend.complete_all_fences();
        thread.advance_frame();
    }

    assert_eq!(most_in_flight, 1, "only one upload fits in staging at a time");
    for ticket in tickets.drain(..) {
        assert!(ticket.wait().unwrap().is_complete());
    }
    for target in targets {
        assert_eq!(read_back(&backend, &thread, target), vec![2; STAGING as usize]);
    }
    tick(&thread);
    let staging = thread.context().copy_queue().staging().get_usage_report();
    assert_eq!(staging.current_bytes, 0);
    assert_eq!(staging.peak_bytes, Some(STAGING));
}

#[test]
fn test_cancel_only_affects_uncopied_jobs() {
    let (backend, thread) = start(FenceMode::Manual);
    let fill: Arc<dyn SourceDataProvider> = Arc::new(SolidFillProvider::new("ones", vec![1]));
    let first = buffer(&thread, STAGING);
    let second = buffer(&thread, STAGING);

    let copying = thread
        .schedule_upload(first, CopyRange::Whole, Arc::clone(&fill))
        .unwrap();
    let waiting = thread
        .schedule_upload(second, CopyRange::Whole, fill)
        .unwrap();
    tick(&thread);

    assert_eq!(thread.cancel_upload(&waiting), 1);
    assert_eq!(thread.cancel_upload(&waiting), 0);
    assert_eq!(thread.cancel_upload(&copying), 0);
    assert_eq!(waiting.wait().unwrap().canceled_jobs, 1);

    thread.full_sync().unwrap();
    tick(&thread);
    assert_eq!(copying.wait().unwrap().finished_jobs, 1);
    assert_eq!(read_back(&backend, &thread, first), vec![1; STAGING as usize]);
    assert_eq!(read_back(&backend, &thread, second), vec![0; STAGING as usize]);
}

#[test]
fn test_impossible_uploads_are_rejected() {
    let (_backend, thread) = start(FenceMode::Immediate);
    let fill: Arc<dyn SourceDataProvider> = Arc::new(SolidFillProvider::new("zeros", vec![]));
    let huge = buffer(&thread, STAGING * 2);
    let small = buffer(&thread, 64);

    assert!(matches!(
        thread.schedule_upload(huge, CopyRange::Whole, Arc::clone(&fill)),
        Err(CopyError::StagingCapacityExceeded { .. })
    ));
    assert!(matches!(
        thread.schedule_upload(
            small,
            CopyRange::Buffer {
                offset: 32,
                size: 64
            },
            Arc::clone(&fill)
        ),
        Err(CopyError::InvalidRange(_))
    ));
    assert!(matches!(
        thread.schedule_upload(
            small,
            CopyRange::Buffer {
                offset: 1,
                size: 3
            },
            Arc::clone(&fill)
        ),
        Err(CopyError::InvalidRange(_))
    ));

    thread.destroy_object(small);
    assert_eq!(
        thread
            .schedule_upload(small, CopyRange::Whole, fill)
            .unwrap_err(),
        CopyError::TargetNotFound
    );
}

#[test]
fn test_transient_constants_reach_the_backend() {
    let (backend, thread) = start(FenceMode::Immediate);
    let mut frame = thread.begin_transient_frame(TransientBufferKind::Constants);

    let buffer = frame.allocate(64).unwrap();
    buffer.write_data(8, &[5, 6, 7]).unwrap();
    let id = buffer.id();
    assert_eq!(frame.flush().unwrap(), 4);
    tick(&thread);
    assert_eq!(&backend.read_buffer(id).unwrap()[8..12], &[5, 6, 7, 0]);

    thread.end_transient_frame(frame);
    thread.full_sync().unwrap();

    let pool = thread.transient_pool(TransientBufferKind::Constants);
    assert_eq!(pool.stats().free, 1);
    let mut next = thread.begin_transient_frame(TransientBufferKind::Constants);
    assert_eq!(next.allocate(32).unwrap().id(), id);
    thread.end_transient_frame(next);
}
