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

//! Frame sequencing and deferred deletion.
//!
//! A [`Frame`] groups the GPU work submitted between two frame boundaries. Each
//! sub-submission is first *declared* (when the main thread queues it) and later
//! *recorded* (when the command thread has executed it and created a fence). A frame
//! can only retire once every declared submission has been recorded and every fence
//! has resolved.
//!
//! Objects destroyed by the application are not released immediately: they go into the
//! deletion list of the frame that is open at that moment, and are destroyed when that
//! frame retires. Completion callbacks attached to a frame run just before its
//! deletions.
//!
//! Callbacks can also observe the two earlier points of a frame's life, see
//! [`FrameEvent`]. [`SyncInfo`] reports how far each side has progressed.

use crate::backend::{DeviceObject, FenceId, FenceStatus, GpuBackend};
use crate::handle::{Arena, Handle};
use parking_lot::Mutex;
use std::fmt;

/// A callback run on the command thread once a frame's GPU work has completed.
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// A reference to a frame owned by a [`FrameSequencer`].
pub type FrameHandle = Handle<Frame>;

/// A point in the life of a frame at which callbacks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEvent {
    /// The main thread closed the frame. Runs on the closing thread.
    CpuFinished,
    /// The command thread recorded every submission of the closed frame.
    GpuRecorded,
    /// The GPU finished the frame's work and the frame retired.
    GpuFinished,
}

/// How far the main thread, the command thread and the GPU have progressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncInfo {
    /// Index of the frame the main thread is recording.
    pub cpu_frame: u64,
    /// Highest frame index the command thread has fully recorded.
    pub recorded_frame: Option<u64>,
    /// Highest frame index the GPU has finished.
    pub finished_frame: Option<u64>,
}

/// The bookkeeping of one frame.
pub struct Frame {
    index: u64,
    declared: u32,
    recorded: u32,
    closed: bool,
    fences: Vec<FenceId>,
    failed_fences: u32,
    cpu_callbacks: Vec<CompletionCallback>,
    recorded_callbacks: Vec<CompletionCallback>,
    callbacks: Vec<CompletionCallback>,
    deletions: Vec<DeviceObject>,
}

impl Frame {
    /// Creates an empty frame.
    pub fn new(index: u64) -> Self {
        Self {
            index,
            declared: 0,
            recorded: 0,
            closed: false,
            fences: Vec::new(),
            failed_fences: 0,
            cpu_callbacks: Vec::new(),
            recorded_callbacks: Vec::new(),
            callbacks: Vec::new(),
            deletions: Vec::new(),
        }
    }

    /// The monotonically increasing frame index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Declares one more sub-submission whose fence will be recorded later.
    pub fn attach_pending(&mut self) {
        self.declared += 1;
    }

    /// Records a declared sub-submission.
    ///
    /// `fence` is `None` when the submission produced no fence (it failed before
    /// reaching the GPU); the submission still counts as recorded.
    pub fn attach_recorded(&mut self, fence: Option<FenceId>) {
        debug_assert!(
            self.recorded < self.declared,
            "frame {} recorded more submissions than it declared",
            self.index
        );
        self.recorded += 1;
        if let Some(fence) = fence {
            self.fences.push(fence);
        }
    }

    /// Defers the destruction of `object` until this frame retires.
    pub fn register_object_for_deletion(&mut self, object: DeviceObject) {
        if self.deletions.contains(&object) {
            log::error!(
                "{} {:?} registered for deletion twice in frame {}",
                object.kind_name(),
                object,
                self.index
            );
            debug_assert!(false, "object registered for deletion twice");
            return;
        }
        self.deletions.push(object);
    }

    /// Runs `callback` when this frame retires.
    pub fn register_completion_callback(&mut self, callback: CompletionCallback) {
        self.callbacks.push(callback);
    }

    /// Runs `callback` when this frame reaches `event`.
    pub fn register_callback(&mut self, event: FrameEvent, callback: CompletionCallback) {
        match event {
            FrameEvent::CpuFinished => self.cpu_callbacks.push(callback),
            FrameEvent::GpuRecorded => self.recorded_callbacks.push(callback),
            FrameEvent::GpuFinished => self.callbacks.push(callback),
        }
    }

    /// Marks the frame closed.
    /// ## Returns
    /// The callbacks waiting for [`FrameEvent::CpuFinished`].
    pub fn close(&mut self) -> Vec<CompletionCallback> {
        self.closed = true;
        std::mem::take(&mut self.cpu_callbacks)
    }

    /// Returns `true` once the frame is closed and all its declared submissions are
    /// recorded.
    pub fn is_recorded(&self) -> bool {
        self.closed && self.declared == self.recorded
    }

    /// Polls the frame's fences, dropping every fence that has resolved.
    ///
    /// A failed fence is logged and treated as resolved.
    /// ## Returns
    /// `true` once every declared submission is recorded and no fence is pending.
    pub fn check_fences(&mut self, backend: &dyn GpuBackend) -> bool {
        let index = self.index;
        let mut failed = 0;
        self.fences.retain(|&fence| match backend.fence_status(fence) {
            FenceStatus::Pending => true,
            FenceStatus::Completed => {
                backend.release_fence(fence);
                false
            }
            FenceStatus::Failed => {
                log::error!("Fence {:?} of frame {} reported a GPU failure", fence, index);
                backend.release_fence(fence);
                failed += 1;
                false
            }
        });
        self.failed_fences += failed;
        self.is_finished()
    }

    /// Returns `true` if the frame is fully recorded and has no pending fence left.
    pub fn is_finished(&self) -> bool {
        self.declared == self.recorded && self.fences.is_empty()
    }

    /// Number of fences still observed.
    pub fn pending_fences(&self) -> usize {
        self.fences.len()
    }

    /// Number of objects waiting for this frame to retire.
    pub fn pending_deletions(&self) -> usize {
        self.deletions.len()
    }

    /// Runs the completion callbacks, then destroys the deferred objects.
    ///
    /// Remaining fences are released without being observed. Callbacks of earlier
    /// events that never fired run first, in event order.
    /// ## Returns
    /// The number of objects destroyed.
    pub fn retire(self, backend: &dyn GpuBackend) -> usize {
        for fence in &self.fences {
            backend.release_fence(*fence);
        }
        let callbacks = self
            .cpu_callbacks
            .into_iter()
            .chain(self.recorded_callbacks)
            .chain(self.callbacks);
        for callback in callbacks {
            callback();
        }

        let mut destroyed = 0;
        for object in self.deletions {
            match object.destroy(backend) {
                Ok(()) => destroyed += 1,
                Err(e) => log::warn!(
                    "Failed to destroy {} {:?} after frame {}: {}",
                    object.kind_name(),
                    object,
                    self.index,
                    e
                ),
            }
        }
        log::trace!("Retired frame {}, {} objects destroyed", self.index, destroyed);
        destroyed
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("declared", &self.declared)
            .field("recorded", &self.recorded)
            .field("closed", &self.closed)
            .field("fences", &self.fences)
            .field("callbacks", &self.callbacks.len())
            .field("deletions", &self.deletions.len())
            .finish()
    }
}

/// Counters kept by a [`FrameSequencer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Index of the frame open for recording.
    pub current_index: u64,
    /// Frames closed but not retired.
    pub pending_frames: usize,
    /// Frames retired so far.
    pub retired_frames: u64,
    /// Objects destroyed through deferred deletion.
    pub deleted_objects: u64,
    /// Fences that reported failure.
    pub failed_fences: u64,
    /// Highest frame index fully recorded by the command thread.
    pub recorded_index: Option<u64>,
    /// Highest frame index retired.
    pub finished_index: Option<u64>,
}

#[derive(Debug)]
struct SequencerState {
    frames: Arena<Frame>,
    current: FrameHandle,
    /// Closed frames, in index order.
    pending: Vec<FrameHandle>,
    stats: FrameStats,
}

impl SequencerState {
    fn open_frame(&mut self, index: u64) -> FrameHandle {
        self.stats.current_index = index;
        self.frames.insert(Frame::new(index))
    }

    fn current_mut(&mut self) -> &mut Frame {
        let current = self.current;
        match self.frames.get_mut(current) {
            Some(frame) => frame,
            None => unreachable!("the current frame is always alive"),
        }
    }
}

/// Tracks the open frame and every closed frame still in flight.
///
/// All methods take `&self`; the state lives behind one lock held only for in-memory
/// bookkeeping. Frame retirement (callbacks and object destruction) runs after the
/// lock has been released, so callbacks may use the sequencer again.
#[derive(Debug)]
pub struct FrameSequencer {
    state: Mutex<SequencerState>,
}

impl FrameSequencer {
    /// Creates a sequencer whose first open frame has index 0.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a sequencer whose first open frame has index `first_index`.
    pub fn starting_at(first_index: u64) -> Self {
        let mut frames = Arena::new();
        let current = frames.insert(Frame::new(first_index));
        Self {
            state: Mutex::new(SequencerState {
                frames,
                current,
                pending: Vec::new(),
                stats: FrameStats {
                    current_index: first_index,
                    ..FrameStats::default()
                },
            }),
        }
    }

    /// The handle of the frame open for recording.
    pub fn current(&self) -> FrameHandle {
        self.state.lock().current
    }

    /// The index of the frame open for recording.
    pub fn current_index(&self) -> u64 {
        self.state.lock().stats.current_index
    }

    /// Number of closed frames not yet retired.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> FrameStats {
        let state = self.state.lock();
        FrameStats {
            pending_frames: state.pending.len(),
            ..state.stats
        }
    }

    /// A snapshot of the progress of each side.
    pub fn sync_info(&self) -> SyncInfo {
        let state = self.state.lock();
        SyncInfo {
            cpu_frame: state.stats.current_index,
            recorded_frame: state.stats.recorded_index,
            finished_frame: state.stats.finished_index,
        }
    }

    /// Closes the open frame and opens the next one.
    ///
    /// The closed frame declares one submission for its boundary fence, which the
    /// caller records with [`attach_recorded_frame`](Self::attach_recorded_frame).
    /// [`FrameEvent::CpuFinished`] callbacks run on the calling thread before this
    /// returns.
    /// ## Returns
    /// The handle of the frame that was closed.
    pub fn close_current(&self) -> FrameHandle {
        let (closed, callbacks) = {
            let mut state = self.state.lock();
            let frame = state.current_mut();
            frame.attach_pending();
            let callbacks = frame.close();

            let closed = state.current;
            let next_index = state.stats.current_index + 1;
            state.pending.push(closed);
            state.current = state.open_frame(next_index);
            log::trace!("Closed frame {}, opened frame {}", next_index - 1, next_index);
            (closed, callbacks)
        };

        for callback in callbacks {
            callback();
        }
        closed
    }

    /// Declares a sub-submission on the open frame.
    /// ## Returns
    /// The handle to pass to [`attach_recorded_frame`](Self::attach_recorded_frame).
    pub fn attach_pending_frame(&self) -> FrameHandle {
        let mut state = self.state.lock();
        state.current_mut().attach_pending();
        state.current
    }

    /// Records a declared sub-submission of `frame` and the fence that guards it.
    ///
    /// When this completes the recording of a closed frame, its
    /// [`FrameEvent::GpuRecorded`] callbacks run before this returns.
    pub fn attach_recorded_frame(&self, frame: FrameHandle, fence: Option<FenceId>) {
        let callbacks = {
            let mut state = self.state.lock();
            let SequencerState { frames, stats, .. } = &mut *state;
            match frames.get_mut(frame) {
                Some(frame) => {
                    frame.attach_recorded(fence);
                    if frame.is_recorded() {
                        stats.recorded_index = stats.recorded_index.max(Some(frame.index));
                        std::mem::take(&mut frame.recorded_callbacks)
                    } else {
                        Vec::new()
                    }
                }
                None => {
                    log::error!("Recorded a submission on retired frame {:?}", frame);
                    debug_assert!(false, "submission recorded on a retired frame");
                    Vec::new()
                }
            }
        };

        for callback in callbacks {
            callback();
        }
    }

    /// Defers the destruction of `object` until the open frame retires.
    pub fn register_object_for_deletion(&self, object: DeviceObject) {
        self.state
            .lock()
            .current_mut()
            .register_object_for_deletion(object);
    }

    /// Runs `callback` once the open frame retires.
    pub fn register_completion_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.state
            .lock()
            .current_mut()
            .register_completion_callback(Box::new(callback));
    }

    /// Runs `callback` once the open frame reaches `event`.
    pub fn register_callback(&self, event: FrameEvent, callback: impl FnOnce() + Send + 'static) {
        self.state
            .lock()
            .current_mut()
            .register_callback(event, Box::new(callback));
    }

    /// Checks every closed frame and retires those whose GPU work has completed.
    ///
    /// Frames retire in index order among those that are finished; a finished frame
    /// does not wait for an older, unfinished one.
    /// ## Returns
    /// The number of frames retired.
    pub fn collect_finished(&self, backend: &dyn GpuBackend) -> usize {
        let finished = {
            let mut state = self.state.lock();
            let SequencerState {
                frames, pending, ..
            } = &mut *state;

            let mut finished = Vec::new();
            pending.retain(|&handle| match frames.get_mut(handle) {
                Some(frame) => {
                    if frame.check_fences(backend) {
                        finished.push(handle);
                        false
                    } else {
                        true
                    }
                }
                None => false,
            });
            finished
                .into_iter()
                .filter_map(|handle| frames.remove(handle))
                .collect::<Vec<_>>()
        };

        self.retire_frames(finished, backend)
    }

    /// Retires every frame, including the open one, without waiting on fences.
    ///
    /// Used at shutdown after the GPU has gone idle. A fresh frame is opened so the
    /// sequencer stays usable.
    pub fn retire_all(&self, backend: &dyn GpuBackend) -> usize {
        let frames = {
            let mut state = self.state.lock();
            let mut handles = std::mem::take(&mut state.pending);
            handles.push(state.current);
            let frames = handles
                .into_iter()
                .filter_map(|handle| state.frames.remove(handle))
                .collect::<Vec<_>>();
            let next_index = state.stats.current_index + 1;
            state.current = state.open_frame(next_index);
            frames
        };

        self.retire_frames(frames, backend)
    }

    fn retire_frames(&self, frames: Vec<Frame>, backend: &dyn GpuBackend) -> usize {
        let count = frames.len();
        let mut deleted = 0u64;
        let mut failed = 0u64;
        let mut highest = None;
        for frame in frames {
            failed += frame.failed_fences as u64;
            highest = highest.max(Some(frame.index));
            deleted += frame.retire(backend) as u64;
        }

        if count > 0 {
            let mut state = self.state.lock();
            state.stats.retired_frames += count as u64;
            state.stats.deleted_objects += deleted;
            state.stats.failed_fences += failed;
            state.stats.finished_index = state.stats.finished_index.max(highest);
        }
        count
    }
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferId, BufferUsage};
    use crate::test_support::MockBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn buffer(id: usize) -> DeviceObject {
        DeviceObject::Buffer {
            id: BufferId(id),
            size: 256,
            usage: BufferUsage::UNIFORM,
        }
    }

    #[test]
    fn test_frame_five_with_two_fences() {
        let backend = MockBackend::new();
        let object = backend.create_test_buffer(256);

        let mut frame = Frame::new(5);
        frame.register_object_for_deletion(object.clone());
        frame.attach_pending();
        frame.attach_pending();
        let first = backend.create_frame_fence().unwrap();
        let second = backend.create_frame_fence().unwrap();
        frame.attach_recorded(Some(first));
        frame.attach_recorded(Some(second));

        backend.signal_fence(first, FenceStatus::Completed);
        assert!(!frame.check_fences(&backend));
        assert_eq!(frame.pending_fences(), 1);

        backend.signal_fence(second, FenceStatus::Completed);
        assert!(frame.check_fences(&backend));

        assert_eq!(frame.retire(&backend), 1);
        assert_eq!(backend.destroy_count(&object), 1);
    }

    #[test]
    fn test_unrecorded_submission_keeps_frame_open() {
        let backend = MockBackend::new();
        let mut frame = Frame::new(0);
        frame.attach_pending();
        assert!(!frame.check_fences(&backend));
        frame.attach_recorded(None);
        assert!(frame.check_fences(&backend));
    }

    #[test]
    fn test_failed_fence_counts_as_resolved() {
        let backend = MockBackend::new();
        let mut frame = Frame::new(0);
        frame.attach_pending();
        let fence = backend.create_frame_fence().unwrap();
        frame.attach_recorded(Some(fence));

        backend.signal_fence(fence, FenceStatus::Failed);
        assert!(frame.check_fences(&backend));
        assert_eq!(frame.failed_fences, 1);
        assert!(backend.is_fence_released(fence));
    }

    #[test]
    fn test_callbacks_run_before_deletions() {
        let backend = Arc::new(MockBackend::new());
        let object = backend.create_test_buffer(64);
        let mut frame = Frame::new(1);

        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let backend = Arc::clone(&backend);
            let object = object.clone();
            let observed = Arc::clone(&observed);
            frame.register_completion_callback(Box::new(move || {
                observed.store(backend.destroy_count(&object), Ordering::SeqCst);
            }));
        }
        frame.register_object_for_deletion(object.clone());
        frame.retire(backend.as_ref());

        assert_eq!(observed.load(Ordering::SeqCst), 0);
        assert_eq!(backend.destroy_count(&object), 1);
    }

    #[test]
    fn test_sequencer_retires_out_of_order() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::starting_at(5);

        let a = backend.create_test_buffer(16);
        sequencer.register_object_for_deletion(a.clone());
        let frame5 = sequencer.close_current();
        let fence5 = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(frame5, Some(fence5));

        let b = backend.create_test_buffer(16);
        sequencer.register_object_for_deletion(b.clone());
        let frame6 = sequencer.close_current();
        let fence6 = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(frame6, Some(fence6));
        assert_eq!(sequencer.current_index(), 7);

        backend.signal_fence(fence6, FenceStatus::Completed);
        assert_eq!(sequencer.collect_finished(&backend), 1);
        assert_eq!(backend.destroy_count(&a), 0);
        assert_eq!(backend.destroy_count(&b), 1);

        backend.signal_fence(fence5, FenceStatus::Completed);
        assert_eq!(sequencer.collect_finished(&backend), 1);
        assert_eq!(backend.destroy_count(&a), 1);
        assert_eq!(sequencer.collect_finished(&backend), 0);

        let stats = sequencer.stats();
        assert_eq!(stats.retired_frames, 2);
        assert_eq!(stats.deleted_objects, 2);
        assert_eq!(stats.pending_frames, 0);
    }

    #[test]
    fn test_deletion_waits_for_sub_submissions() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::new();

        let object = backend.create_test_buffer(32);
        let submission = sequencer.attach_pending_frame();
        sequencer.register_object_for_deletion(object.clone());
        let closed = sequencer.close_current();
        assert_eq!(submission, closed);

        let boundary = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(closed, Some(boundary));
        backend.signal_fence(boundary, FenceStatus::Completed);
        assert_eq!(sequencer.collect_finished(&backend), 0);

        let work = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(submission, Some(work));
        assert_eq!(sequencer.collect_finished(&backend), 0);

        backend.signal_fence(work, FenceStatus::Completed);
        assert_eq!(sequencer.collect_finished(&backend), 1);
        assert_eq!(backend.destroy_count(&object), 1);
    }

    #[test]
    fn test_callback_may_reenter_the_sequencer() {
        let backend = MockBackend::new();
        let sequencer = Arc::new(FrameSequencer::new());
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let inner = Arc::clone(&sequencer);
            let ran = Arc::clone(&ran);
            sequencer.register_completion_callback(move || {
                ran.fetch_add(1, Ordering::SeqCst);
                let ran = Arc::clone(&ran);
                inner.register_completion_callback(move || {
                    ran.fetch_add(10, Ordering::SeqCst);
                });
            });
        }

        let closed = sequencer.close_current();
        sequencer.attach_recorded_frame(closed, None);
        assert_eq!(sequencer.collect_finished(&backend), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let closed = sequencer.close_current();
        sequencer.attach_recorded_frame(closed, None);
        sequencer.collect_finished(&backend);
        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_retire_all_ignores_pending_fences() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::new();
        sequencer.register_object_for_deletion(buffer(100));
        let closed = sequencer.close_current();
        let fence = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(closed, Some(fence));
        sequencer.register_object_for_deletion(buffer(101));

        assert_eq!(sequencer.retire_all(&backend), 2);
        assert_eq!(sequencer.pending_count(), 0);
        assert!(backend.is_fence_released(fence));
        assert_eq!(sequencer.current_index(), 2);
    }

    #[test]
    fn test_frame_events_fire_in_order() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for event in [
            FrameEvent::GpuFinished,
            FrameEvent::GpuRecorded,
            FrameEvent::CpuFinished,
        ] {
            let log = Arc::clone(&log);
            sequencer.register_callback(event, move || log.lock().push(event));
        }

        let submission = sequencer.attach_pending_frame();
        let closed = sequencer.close_current();
        assert_eq!(*log.lock(), vec![FrameEvent::CpuFinished]);

        let boundary = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(closed, Some(boundary));
        assert_eq!(log.lock().len(), 1, "a declared submission is still unrecorded");

        sequencer.attach_recorded_frame(submission, None);
        assert_eq!(
            *log.lock(),
            vec![FrameEvent::CpuFinished, FrameEvent::GpuRecorded]
        );

        backend.signal_fence(boundary, FenceStatus::Completed);
        sequencer.collect_finished(&backend);
        assert_eq!(
            *log.lock(),
            vec![
                FrameEvent::CpuFinished,
                FrameEvent::GpuRecorded,
                FrameEvent::GpuFinished
            ]
        );
    }

    #[test]
    fn test_sync_info_tracks_each_side() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::new();
        assert_eq!(sequencer.sync_info(), SyncInfo::default());

        let frame0 = sequencer.close_current();
        let fence0 = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(frame0, Some(fence0));
        let frame1 = sequencer.close_current();

        let info = sequencer.sync_info();
        assert_eq!(info.cpu_frame, 2);
        assert_eq!(info.recorded_frame, Some(0));
        assert_eq!(info.finished_frame, None);

        sequencer.attach_recorded_frame(frame1, None);
        backend.signal_fence(fence0, FenceStatus::Completed);
        sequencer.collect_finished(&backend);
        let info = sequencer.sync_info();
        assert_eq!(info.recorded_frame, Some(1));
        assert_eq!(info.finished_frame, Some(1));
    }

    #[test]
    fn test_retire_all_runs_unfired_callbacks() {
        let backend = MockBackend::new();
        let sequencer = FrameSequencer::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            sequencer.register_callback(FrameEvent::GpuRecorded, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        sequencer.close_current();

        sequencer.retire_all(&backend);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
