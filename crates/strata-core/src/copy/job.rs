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

use super::provider::{CancelToken, SourceDataProvider};
use crate::backend::{CopyRegion, ObjectId, StagingArea};
use crate::handle::Handle;
use crate::thread::{TaskCompleter, TaskHandle};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// The lifecycle of one upload job.
///
/// ```text
/// Pending -> Allocated -> Writing -> Copying -> Finished
///    \___________\___________\
///                             -> Canceled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    /// Waiting for staging memory.
    Pending,
    /// Staging memory reserved.
    Allocated,
    /// The provider is filling staging memory.
    Writing,
    /// The GPU copy has been issued; staging is held until its frame completes.
    Copying,
    /// The copy completed and staging memory was reclaimed.
    Finished,
    /// The job was canceled or its destination disappeared.
    Canceled,
}

impl UploadState {
    const COUNT: usize = 6;

    fn slot(self) -> usize {
        self as usize
    }

    /// Returns `true` for `Finished` and `Canceled`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadState::Finished | UploadState::Canceled)
    }

    fn can_become(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Pending, Allocated)
                | (Allocated, Writing)
                | (Writing, Copying)
                | (Copying, Finished)
                | (Pending | Allocated | Writing, Canceled)
        )
    }
}

/// How the jobs of one upload request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadOutcome {
    /// Jobs whose copy completed.
    pub finished_jobs: usize,
    /// Jobs canceled or dropped before their copy was issued.
    pub canceled_jobs: usize,
}

impl UploadOutcome {
    /// Returns `true` if every job of the request was copied.
    pub fn is_complete(&self) -> bool {
        self.canceled_jobs == 0
    }
}

/// Progress shared by the jobs of one upload request.
pub(crate) struct UploadProgress {
    remaining: AtomicUsize,
    finished: AtomicUsize,
    canceled: AtomicUsize,
    completer: Mutex<Option<TaskCompleter<UploadOutcome>>>,
}

impl UploadProgress {
    pub(crate) fn new(jobs: usize) -> (Arc<Self>, TaskHandle<UploadOutcome>) {
        let (completer, handle) = crate::thread::task_pair();
        let progress = Arc::new(Self {
            remaining: AtomicUsize::new(jobs),
            finished: AtomicUsize::new(0),
            canceled: AtomicUsize::new(0),
            completer: Mutex::new(Some(completer)),
        });
        (progress, handle)
    }

    pub(crate) fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    fn record(&self, state: UploadState) {
        match state {
            UploadState::Finished => self.finished.fetch_add(1, Ordering::AcqRel),
            _ => self.canceled.fetch_add(1, Ordering::AcqRel),
        };
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = UploadOutcome {
                finished_jobs: self.finished.load(Ordering::Acquire),
                canceled_jobs: self.canceled.load(Ordering::Acquire),
            };
            if let Some(completer) = self.completer.lock().take() {
                completer.complete(Ok(outcome));
            }
        }
    }
}

impl fmt::Debug for UploadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadProgress")
            .field("remaining", &self.remaining())
            .field("finished", &self.finished.load(Ordering::Acquire))
            .field("canceled", &self.canceled.load(Ordering::Acquire))
            .finish()
    }
}

/// A reference to a job owned by a [`CopyQueue`](super::CopyQueue).
pub type UploadJobHandle = Handle<UploadJob>;

/// One region of one upload request.
pub struct UploadJob {
    pub(crate) target: ObjectId,
    pub(crate) region: CopyRegion,
    pub(crate) provider: Arc<dyn SourceDataProvider>,
    pub(crate) staging: Option<StagingArea>,
    pub(crate) token: CancelToken,
    state: UploadState,
    entered: [Option<Instant>; UploadState::COUNT],
    progress: Arc<UploadProgress>,
}

impl UploadJob {
    pub(crate) fn new(
        target: ObjectId,
        region: CopyRegion,
        provider: Arc<dyn SourceDataProvider>,
        progress: Arc<UploadProgress>,
    ) -> Self {
        let mut entered = [None; UploadState::COUNT];
        entered[UploadState::Pending.slot()] = Some(Instant::now());
        Self {
            target,
            region,
            provider,
            staging: None,
            token: CancelToken::new(),
            state: UploadState::Pending,
            entered,
            progress,
        }
    }

    /// The current state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Number of staging bytes this job needs.
    pub fn staging_size(&self) -> u64 {
        self.region.data_size()
    }

    /// When the job entered `state`, if it ever did.
    pub fn entered_at(&self, state: UploadState) -> Option<Instant> {
        self.entered[state.slot()]
    }

    /// Moves the job to `next`, timestamping the transition.
    ///
    /// Reaching a terminal state reports to the request's progress.
    pub(crate) fn transition(&mut self, next: UploadState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid upload transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!(
            "Upload '{}' {:?} -> {:?}",
            self.provider.debug_label(),
            self.state,
            next
        );
        self.state = next;
        self.entered[next.slot()] = Some(Instant::now());
        if next.is_terminal() {
            self.progress.record(next);
        }
    }
}

impl fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadJob")
            .field("target", &self.target)
            .field("region", &self.region)
            .field("provider", &self.provider.debug_label())
            .field("state", &self.state)
            .field("staging", &self.staging)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::copy::SolidFillProvider;

    fn job(progress: &Arc<UploadProgress>) -> UploadJob {
        let mut arena = crate::handle::Arena::<crate::backend::DeviceObject>::new();
        let target = arena.insert(crate::backend::DeviceObject::Sampler {
            id: crate::backend::SamplerId(1),
        });
        UploadJob::new(
            target,
            CopyRegion::Buffer { offset: 0, size: 4 },
            Arc::new(SolidFillProvider::new("zeros", vec![0])),
            Arc::clone(progress),
        )
    }

    #[test]
    fn test_transitions_are_timestamped() {
        let (progress, _handle) = UploadProgress::new(1);
        let mut job = job(&progress);
        assert!(job.entered_at(UploadState::Pending).is_some());
        assert!(job.entered_at(UploadState::Allocated).is_none());

        job.transition(UploadState::Allocated);
        job.transition(UploadState::Writing);
        let writing = job.entered_at(UploadState::Writing).unwrap();
        assert!(writing >= job.entered_at(UploadState::Allocated).unwrap());
        assert_eq!(job.state(), UploadState::Writing);
    }

    #[test]
    fn test_progress_resolves_after_last_job() {
        let (progress, handle) = UploadProgress::new(2);
        let mut first = job(&progress);
        let mut second = job(&progress);

        first.transition(UploadState::Canceled);
        assert!(!handle.is_ready());
        assert_eq!(progress.remaining(), 1);

        for state in [
            UploadState::Allocated,
            UploadState::Writing,
            UploadState::Copying,
            UploadState::Finished,
        ] {
            second.transition(state);
        }
        let outcome = handle.wait().unwrap();
        assert_eq!(
            outcome,
            UploadOutcome {
                finished_jobs: 1,
                canceled_jobs: 1
            }
        );
        assert!(!outcome.is_complete());
    }
}
