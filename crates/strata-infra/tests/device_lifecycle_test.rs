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

//! Integration tests for the command thread driving the headless backend.
//!
//! These cover frame retirement, deferred deletion, stream submission and shutdown
//! against a backend whose fences are signalled by hand.

use std::borrow::Cow;
use std::sync::Arc;
use strata_core::backend::{
    BufferDescriptor, BufferId, BufferUsage, DeviceObject, FilterMode, ObjectId, SamplerDescriptor,
};
use strata_core::error::DeviceError;
use strata_core::transient::TransientBufferKind;
use strata_core::{CommandThread, HalConfig};
use strata_infra::graphics::{FenceMode, HeadlessBackend, HeadlessCommandStream};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start(fence_mode: FenceMode) -> (Arc<HeadlessBackend>, CommandThread) {
    init_logger();
    let backend = Arc::new(HeadlessBackend::new(fence_mode));
    let thread = CommandThread::start(backend.clone(), HalConfig::default()).unwrap();
    (backend, thread)
}

fn storage_buffer(thread: &CommandThread, size: u64) -> (ObjectId, BufferId) {
    let id = thread
        .create_buffer(&BufferDescriptor {
            label: Some(Cow::Borrowed("storage")),
            size,
            usage: BufferUsage::STORAGE | BufferUsage::COPY_DST | BufferUsage::COPY_SRC,
        })
        .unwrap();
    match thread.context().objects().resolve(id) {
        Some(DeviceObject::Buffer { id: buffer, .. }) => (id, buffer),
        other => panic!("expected a buffer, got {other:?}"),
    }
}

/// Blocks until every job queued so far has run.
fn drain(thread: &CommandThread) {
    thread.run_on_thread_and_wait(|_| ()).wait().unwrap();
}

#[test]
fn test_deletion_waits_for_the_frame_fence() {
    let (backend, thread) = start(FenceMode::Manual);
    let (id, _) = storage_buffer(&thread, 128);
    assert_eq!(backend.live_objects(), 1);

    assert!(thread.destroy_object(id));
    thread.advance_frame();
    drain(&thread);
    assert_eq!(
        backend.live_objects(),
        1,
        "the buffer must outlive its frame's fence"
    );

    backend.complete_all_fences();
    thread.advance_frame();
    drain(&thread);
    assert_eq!(backend.live_objects(), 0);

    let stats = thread.stats();
    assert_eq!(stats.deleted_objects, 1);
    assert_eq!(stats.retired_frames, 1);
    assert_eq!(stats.pending_frames, 1);
}

#[test]
fn test_frames_retire_when_fences_are_polled_out() {
    let (_backend, thread) = start(FenceMode::AfterPolls(1));
    for _ in 0..4 {
        thread.advance_frame();
    }
    drain(&thread);
    thread.full_sync().unwrap();

    let stats = thread.stats();
    assert_eq!(stats.pending_frames, 0);
    assert_eq!(stats.retired_frames, 5);
    assert_eq!(stats.current_frame, 5);
}

#[test]
fn test_submitted_stream_runs_before_its_frame_retires() {
    let (backend, thread) = start(FenceMode::Manual);
    let (_, buffer) = storage_buffer(&thread, 16);

    let stream = HeadlessCommandStream::new("clear").fill_buffer(buffer, 0, 16, 0xAB);
    let done = thread.submit(Box::new(stream));
    thread.advance_frame();
    done.wait().unwrap();

    assert_eq!(backend.read_buffer(buffer).unwrap(), vec![0xAB; 16]);
    drain(&thread);
    assert_eq!(thread.stats().pending_frames, 1);

    thread.full_sync().unwrap();
    assert_eq!(thread.stats().pending_frames, 0);
    assert_eq!(backend.executed_streams(), 1);
}

#[test]
fn test_foreign_stream_is_rejected() {
    #[derive(Debug)]
    struct Foreign;

    impl strata_core::backend::CommandStream for Foreign {
        fn label(&self) -> &str {
            "foreign"
        }

        fn into_any(self: Box<Self>) -> Box<dyn std::any::Any + Send> {
            self
        }
    }

    let (_backend, thread) = start(FenceMode::Immediate);
    let result = thread.submit(Box::new(Foreign)).wait();
    assert!(matches!(result, Err(DeviceError::ExecutionFailed(_))));
    assert!(!thread.is_device_lost());
    thread.full_sync().unwrap();
}

#[test]
fn test_device_loss_stops_submission() {
    let (backend, thread) = start(FenceMode::Immediate);
    backend.simulate_device_loss();

    let result = thread
        .submit(Box::new(HeadlessCommandStream::new("doomed")))
        .wait();
    assert_eq!(result, Err(DeviceError::DeviceLost));
    assert!(thread.is_device_lost());
    assert!(!thread.enqueue(|_| ()));
}

#[test]
fn test_shutdown_releases_everything() {
    let (backend, mut thread) = start(FenceMode::Manual);
    let (kept, _) = storage_buffer(&thread, 64);
    let (dropped, _) = storage_buffer(&thread, 64);
    thread
        .create_sampler(&SamplerDescriptor {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
        })
        .unwrap();
    thread.destroy_object(dropped);

    let mut frame = thread.begin_transient_frame(TransientBufferKind::Constants);
    frame.allocate(256).unwrap();
    thread.end_transient_frame(frame);
    thread.advance_frame();

    thread.shutdown().unwrap();
    assert_eq!(backend.live_objects(), 0);
    assert_eq!(backend.live_fences(), 0);
    assert!(thread.context().objects().resolve(kept).is_none());
    assert_eq!(
        thread.run_on_thread_and_wait(|_| 7).wait(),
        Err(DeviceError::ThreadExited)
    );
}
