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

//! The asynchronous copy queue.
//!
//! Any thread may [`schedule`](CopyQueue::schedule) an upload. The command thread
//! drives every job through its lifecycle from [`update`](CopyQueue::update), which
//! runs four phases in order:
//!
//! 1. **Promote**: reserve staging memory for pending jobs, oldest first. When the
//!    pool is exhausted the remaining jobs simply wait for a later tick.
//! 2. **Write**: let each job's provider fill its staging area.
//! 3. **Copy**: issue the GPU copy and tie the release of the staging area to the
//!    completion of the frame currently being recorded.
//! 4. **Reclaim**: free the staging of copies whose frame has completed.
//!
//! The destination of a job is held by [`ObjectId`] only. If the object is destroyed
//! before the copy is issued, the job is dropped with a warning.

mod job;
mod provider;

pub use self::job::{UploadJob, UploadJobHandle, UploadOutcome, UploadState};
pub use self::provider::{CancelToken, SliceDataProvider, SolidFillProvider, SourceDataProvider};

use self::job::UploadProgress;
use crate::backend::{
    CopyRegion, DeviceObject, GpuBackend, COPY_BUFFER_ALIGNMENT, ImageDescriptor, ObjectId, ObjectRegistry, StagingArea,
    StagingPool,
};
use crate::error::{CopyError, DeviceError};
use crate::frame::FrameSequencer;
use crate::handle::Arena;
use crate::thread::TaskHandle;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// The part of a destination object an upload writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyRange {
    /// The whole object: every byte of a buffer, every mip and slice of an image.
    Whole,
    /// A byte range of a buffer.
    Buffer {
        /// Byte offset into the buffer.
        offset: u64,
        /// Number of bytes.
        size: u64,
    },
    /// Whole mips of a range of slices of an image. One job is created per pair.
    Image {
        /// Mip levels.
        mips: Range<u32>,
        /// Array slices.
        slices: Range<u32>,
    },
}

/// The receipt of one [`CopyQueue::schedule`] call.
///
/// It resolves, as a future or through [`wait`](Self::wait), once every job of the
/// request has finished or been canceled.
#[derive(Debug)]
pub struct UploadTicket {
    jobs: Vec<UploadJobHandle>,
    progress: Arc<UploadProgress>,
    done: TaskHandle<UploadOutcome>,
}

impl UploadTicket {
    /// The jobs created for this request.
    pub fn jobs(&self) -> &[UploadJobHandle] {
        &self.jobs
    }

    /// Returns `true` once no job of the request is outstanding.
    pub fn is_finished(&self) -> bool {
        self.progress.remaining() == 0
    }

    /// Blocks until every job has finished or been canceled.
    pub fn wait(self) -> Result<UploadOutcome, DeviceError> {
        self.done.wait()
    }

    /// Blocks for at most `timeout`.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<UploadOutcome, DeviceError>> {
        self.done.wait_timeout(timeout)
    }
}

impl Future for UploadTicket {
    type Output = Result<UploadOutcome, DeviceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.done).poll(cx)
    }
}

/// Counters of a [`CopyQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyQueueStats {
    /// Jobs waiting for staging memory.
    pub pending: usize,
    /// Jobs holding staging memory.
    pub in_flight: usize,
    /// Jobs finished over the queue's lifetime.
    pub finished: u64,
    /// Jobs canceled or dropped over the queue's lifetime.
    pub canceled: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: Arena<UploadJob>,
    pending: VecDeque<UploadJobHandle>,
    processing: Vec<UploadJobHandle>,
    stopped: bool,
    finished: u64,
    canceled: u64,
}

impl QueueState {
    /// Ends `handle` in `state`, returning its staging area for release.
    fn retire(&mut self, handle: UploadJobHandle, state: UploadState) -> Option<StagingArea> {
        let mut job = self.jobs.remove(handle)?;
        job.transition(state);
        match state {
            UploadState::Finished => self.finished += 1,
            _ => self.canceled += 1,
        }
        job.staging.take()
    }

    /// Forgets handles of jobs that no longer exist.
    fn compact(&mut self) {
        let jobs = &self.jobs;
        self.processing.retain(|handle| jobs.contains(*handle));
    }
}

struct WriteTask {
    area: StagingArea,
    region: CopyRegion,
    provider: Arc<dyn SourceDataProvider>,
    token: CancelToken,
}

struct CopyTask {
    handle: UploadJobHandle,
    area: StagingArea,
    region: CopyRegion,
    target: DeviceObject,
    label: String,
}

/// Schedules uploads and drives them through staging memory.
#[derive(Debug)]
pub struct CopyQueue {
    objects: Arc<ObjectRegistry>,
    staging: Arc<StagingPool>,
    state: Mutex<QueueState>,
    completed_tx: flume::Sender<UploadJobHandle>,
    completed_rx: flume::Receiver<UploadJobHandle>,
}

impl CopyQueue {
    /// Creates a queue uploading into objects of `objects` through `staging`.
    pub fn new(objects: Arc<ObjectRegistry>, staging: Arc<StagingPool>) -> Self {
        let (completed_tx, completed_rx) = flume::unbounded();
        Self {
            objects,
            staging,
            state: Mutex::new(QueueState::default()),
            completed_tx,
            completed_rx,
        }
    }

    /// The staging pool the queue allocates from.
    pub fn staging(&self) -> &Arc<StagingPool> {
        &self.staging
    }

    /// Schedules an upload of `range` of `target`, filled by `provider`.
    ///
    /// Returns immediately. Requests that could be satisfied later are always
    /// accepted; only requests that can never succeed are rejected.
    /// ## Errors
    /// * `CopyError::TargetNotFound` - `target` does not resolve.
    /// * `CopyError::UnsupportedTarget` - `target` is a sampler.
    /// * `CopyError::InvalidRange` - `range` does not fit inside `target`.
    /// * `CopyError::StagingCapacityExceeded` - one job is larger than the staging pool.
    /// * `CopyError::QueueStopped` - the queue has been stopped.
    pub fn schedule(
        &self,
        target: ObjectId,
        range: CopyRange,
        provider: Arc<dyn SourceDataProvider>,
    ) -> Result<UploadTicket, CopyError> {
        let object = self.objects.resolve(target).ok_or(CopyError::TargetNotFound)?;
        let regions = regions_for(&object, &range)?;
        if regions.is_empty() {
            return Err(CopyError::InvalidRange("empty upload".to_string()));
        }

        let capacity = self.staging.capacity();
        if let Some(largest) = regions.iter().map(CopyRegion::data_size).max() {
            if largest > capacity {
                return Err(CopyError::StagingCapacityExceeded {
                    requested: largest,
                    capacity,
                });
            }
        }

        let (progress, done) = UploadProgress::new(regions.len());
        let mut state = self.state.lock();
        if state.stopped {
            return Err(CopyError::QueueStopped);
        }
        let jobs = regions
            .into_iter()
            .map(|region| {
                let job = UploadJob::new(
                    target,
                    region,
                    Arc::clone(&provider),
                    Arc::clone(&progress),
                );
                let handle = state.jobs.insert(job);
                state.pending.push_back(handle);
                handle
            })
            .collect::<Vec<_>>();

        log::debug!(
            "Scheduled upload '{}' of {} {:?} as {} jobs",
            provider.debug_label(),
            object.kind_name(),
            target,
            jobs.len()
        );

        Ok(UploadTicket {
            jobs,
            progress,
            done,
        })
    }

    /// Runs the four update phases once. Called by the command thread.
    pub fn update(&self, backend: &dyn GpuBackend, sequencer: &FrameSequencer) {
        let writes = self.promote_and_begin_writes();
        for (_, task) in &writes {
            self.staging.write(&task.area, |dest| {
                task.provider.write_source_data(dest, &task.token, &task.region)
            });
        }

        let copies = self.collect_copies(writes.into_iter().map(|(handle, _)| handle));
        self.issue_copies(copies, backend, sequencer);
        self.reclaim();
    }

    /// Cancels every job of `ticket` that has not been copied yet.
    ///
    /// Calling it again, or after the upload finished, has no effect.
    /// ## Returns
    /// The number of jobs newly canceled.
    pub fn cancel(&self, ticket: &UploadTicket) -> usize {
        let mut released = Vec::new();
        let mut count = 0;
        {
            let mut state = self.state.lock();
            for &handle in &ticket.jobs {
                let Some(job) = state.jobs.get_mut(handle) else {
                    continue;
                };
                match job.state() {
                    UploadState::Pending | UploadState::Allocated => {
                        released.extend(state.retire(handle, UploadState::Canceled));
                        count += 1;
                    }
                    UploadState::Writing => {
                        // The staging area is released by the next update.
                        job.token.cancel();
                        job.transition(UploadState::Canceled);
                        state.canceled += 1;
                        count += 1;
                    }
                    UploadState::Copying | UploadState::Finished | UploadState::Canceled => {}
                }
            }
            state.compact();
        }

        for area in released {
            self.staging.free(area);
        }
        count
    }

    /// Stops the queue: every outstanding job is canceled and its staging released.
    ///
    /// Jobs whose copy was already issued are reported finished. Later calls to
    /// [`schedule`](Self::schedule) fail with `CopyError::QueueStopped`.
    pub fn stop(&self) {
        let released = {
            let mut state = self.state.lock();
            state.stopped = true;
            let handles = state
                .jobs
                .iter()
                .map(|(handle, job)| (handle, job.state()))
                .collect::<Vec<_>>();

            let mut released = Vec::new();
            for (handle, job_state) in handles {
                let terminal = match job_state {
                    UploadState::Copying => UploadState::Finished,
                    UploadState::Canceled => {
                        // Canceled while writing; only the staging is left to free.
                        if let Some(mut job) = state.jobs.remove(handle) {
                            released.extend(job.staging.take());
                        }
                        continue;
                    }
                    _ => UploadState::Canceled,
                };
                released.extend(state.retire(handle, terminal));
            }
            state.pending.clear();
            state.processing.clear();
            released
        };

        while self.completed_rx.try_recv().is_ok() {}
        if !released.is_empty() {
            log::debug!("Copy queue stopped, released {} staging areas", released.len());
        }
        for area in released {
            self.staging.free(area);
        }
    }

    /// The state of a job, or `None` once it has ended.
    pub fn job_state(&self, handle: UploadJobHandle) -> Option<UploadState> {
        self.state.lock().jobs.get(handle).map(UploadJob::state)
    }

    /// A snapshot of the counters.
    pub fn stats(&self) -> CopyQueueStats {
        let state = self.state.lock();
        CopyQueueStats {
            pending: state.pending.len(),
            in_flight: state.processing.len(),
            finished: state.finished,
            canceled: state.canceled,
        }
    }

    /// Phase 1, then the bookkeeping half of phase 2.
    fn promote_and_begin_writes(&self) -> Vec<(UploadJobHandle, WriteTask)> {
        let mut released = Vec::new();
        let mut state = self.state.lock();

        while let Some(&handle) = state.pending.front() {
            let Some(job) = state.jobs.get_mut(handle) else {
                state.pending.pop_front();
                continue;
            };
            if !self.objects.contains(job.target) {
                log::warn!(
                    "Upload '{}' dropped, its target {:?} no longer exists",
                    job.provider.debug_label(),
                    job.target
                );
                state.pending.pop_front();
                released.extend(state.retire(handle, UploadState::Canceled));
                continue;
            }

            let Some(area) = self
                .staging
                .allocate(job.staging_size(), job.provider.debug_label())
            else {
                break;
            };
            job.staging = Some(area);
            job.transition(UploadState::Allocated);
            state.pending.pop_front();
            state.processing.push(handle);
        }

        let QueueState {
            jobs, processing, ..
        } = &mut *state;
        let writes = processing
            .iter()
            .filter_map(|&handle| {
                let job = jobs.get_mut(handle)?;
                if job.state() != UploadState::Allocated {
                    return None;
                }
                let area = job.staging.clone()?;
                job.transition(UploadState::Writing);
                Some((
                    handle,
                    WriteTask {
                        area,
                        region: job.region,
                        provider: Arc::clone(&job.provider),
                        token: job.token.clone(),
                    },
                ))
            })
            .collect();
        drop(state);

        for area in released {
            self.staging.free(area);
        }
        writes
    }

    /// First half of phase 3: resolve targets and release jobs canceled while writing.
    fn collect_copies(&self, written: impl Iterator<Item = UploadJobHandle>) -> Vec<CopyTask> {
        let mut released = Vec::new();
        let mut copies = Vec::new();
        {
            let mut state = self.state.lock();
            for handle in written {
                let Some(job) = state.jobs.get_mut(handle) else {
                    continue;
                };
                if job.state() == UploadState::Canceled {
                    if let Some(mut job) = state.jobs.remove(handle) {
                        released.extend(job.staging.take());
                    }
                    continue;
                }

                let target = self.objects.resolve(job.target);
                match (target, job.staging.clone()) {
                    (Some(target), Some(area)) => copies.push(CopyTask {
                        handle,
                        area,
                        region: job.region,
                        target,
                        label: job.provider.debug_label().to_string(),
                    }),
                    _ => {
                        log::warn!(
                            "Upload '{}' dropped, its target {:?} no longer exists",
                            job.provider.debug_label(),
                            job.target
                        );
                        released.extend(state.retire(handle, UploadState::Canceled));
                    }
                }
            }
            state.compact();
        }

        for area in released {
            self.staging.free(area);
        }
        copies
    }

    /// Second half of phase 3: issue the copies outside the lock.
    fn issue_copies(
        &self,
        copies: Vec<CopyTask>,
        backend: &dyn GpuBackend,
        sequencer: &FrameSequencer,
    ) {
        for task in copies {
            let result = self
                .staging
                .read(&task.area, |source| backend.upload(source, &task.target, &task.region));

            let mut state = self.state.lock();
            let still_writing = state
                .jobs
                .get(task.handle)
                .is_some_and(|job| job.state() == UploadState::Writing);

            match result {
                Ok(()) if still_writing => {
                    if let Some(job) = state.jobs.get_mut(task.handle) {
                        job.transition(UploadState::Copying);
                    }
                    drop(state);
                    let tx = self.completed_tx.clone();
                    let handle = task.handle;
                    sequencer.register_completion_callback(move || {
                        let _ = tx.send(handle);
                    });
                }
                Ok(()) => {
                    // Canceled while the copy was being issued.
                    let area = state.jobs.remove(task.handle).and_then(|mut job| job.staging.take());
                    state.compact();
                    drop(state);
                    if let Some(area) = area {
                        self.staging.free(area);
                    }
                }
                Err(e) => {
                    log::error!("Upload '{}' failed: {}", task.label, e);
                    let area = if still_writing {
                        state.retire(task.handle, UploadState::Canceled)
                    } else {
                        state.jobs.remove(task.handle).and_then(|mut job| job.staging.take())
                    };
                    state.compact();
                    drop(state);
                    if let Some(area) = area {
                        self.staging.free(area);
                    }
                }
            }
        }
    }

    /// Phase 4.
    fn reclaim(&self) {
        let completed = self.completed_rx.try_iter().collect::<Vec<_>>();
        if completed.is_empty() {
            return;
        }

        let released = {
            let mut state = self.state.lock();
            let released = completed
                .into_iter()
                .filter_map(|handle| state.retire(handle, UploadState::Finished))
                .collect::<Vec<_>>();
            state.compact();
            released
        };
        for area in released {
            self.staging.free(area);
        }
    }
}

/// Splits `range` of `object` into one region per job.
fn require_copy_alignment(offset: u64, size: u64) -> Result<(), CopyError> {
    if offset % COPY_BUFFER_ALIGNMENT != 0 || size % COPY_BUFFER_ALIGNMENT != 0 {
        return Err(CopyError::InvalidRange(format!(
            "{size} bytes at offset {offset} are not {COPY_BUFFER_ALIGNMENT}-byte aligned"
        )));
    }
    Ok(())
}

fn regions_for(object: &DeviceObject, range: &CopyRange) -> Result<Vec<CopyRegion>, CopyError> {
    match (object, range) {
        (DeviceObject::Sampler { .. }, _) => Err(CopyError::UnsupportedTarget),
        (DeviceObject::Buffer { size, .. }, CopyRange::Whole) => {
            require_copy_alignment(0, *size)?;
            Ok(vec![CopyRegion::Buffer {
                offset: 0,
                size: *size,
            }])
        }
        (DeviceObject::Buffer { size: capacity, .. }, CopyRange::Buffer { offset, size }) => {
            let fits = offset
                .checked_add(*size)
                .is_some_and(|end| end <= *capacity);
            if *size == 0 || !fits {
                return Err(CopyError::InvalidRange(format!(
                    "{size} bytes at offset {offset} in a buffer of {capacity} bytes"
                )));
            }
            require_copy_alignment(*offset, *size)?;
            Ok(vec![CopyRegion::Buffer {
                offset: *offset,
                size: *size,
            }])
        }
        (DeviceObject::Image { descriptor, .. }, CopyRange::Whole) => {
            Ok(image_regions(descriptor, 0..descriptor.mips, 0..descriptor.slices))
        }
        (DeviceObject::Image { descriptor, .. }, CopyRange::Image { mips, slices }) => {
            if mips.is_empty()
                || slices.is_empty()
                || mips.end > descriptor.mips
                || slices.end > descriptor.slices
            {
                return Err(CopyError::InvalidRange(format!(
                    "mips {:?} slices {:?} in an image with {} mips and {} slices",
                    mips, slices, descriptor.mips, descriptor.slices
                )));
            }
            Ok(image_regions(descriptor, mips.clone(), slices.clone()))
        }
        (DeviceObject::Buffer { .. }, CopyRange::Image { .. }) => Err(CopyError::InvalidRange(
            "image range on a buffer".to_string(),
        )),
        (DeviceObject::Image { .. }, CopyRange::Buffer { .. }) => Err(CopyError::InvalidRange(
            "buffer range on an image".to_string(),
        )),
    }
}

fn image_regions(
    descriptor: &ImageDescriptor,
    mips: Range<u32>,
    slices: Range<u32>,
) -> Vec<CopyRegion> {
    mips.flat_map(|mip| {
        slices.clone().map(move |slice| CopyRegion::Image {
            mip,
            slice,
            extent: descriptor.mip_extent(mip),
            format: descriptor.format,
        })
    })
    .collect()
}
