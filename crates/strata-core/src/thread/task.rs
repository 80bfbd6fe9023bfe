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

//! A one-shot result produced on the command thread.

use crate::error::DeviceError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

struct TaskSlot<T> {
    outcome: Option<Result<T, DeviceError>>,
    done: bool,
    // The Waker to wake up the Future when the result is ready
    waker: Option<Waker>,
}

struct TaskState<T> {
    slot: Mutex<TaskSlot<T>>,
    ready: Condvar,
}

impl<T> TaskState<T> {
    fn resolve(&self, outcome: Result<T, DeviceError>) {
        let waker = {
            let mut slot = self.slot.lock();
            if slot.done {
                return;
            }
            slot.outcome = Some(outcome);
            slot.done = true;
            slot.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Creates a connected completer and handle.
pub fn task_pair<T>() -> (TaskCompleter<T>, TaskHandle<T>) {
    let state = Arc::new(TaskState {
        slot: Mutex::new(TaskSlot {
            outcome: None,
            done: false,
            waker: None,
        }),
        ready: Condvar::new(),
    });
    (
        TaskCompleter {
            state: Some(Arc::clone(&state)),
        },
        TaskHandle { state },
    )
}

/// The receiving side of a task.
///
/// It can be awaited as a [`Future`] or waited on synchronously. The outcome can be
/// taken only once; polling again after it was taken stays pending.
pub struct TaskHandle<T> {
    state: Arc<TaskState<T>>,
}

impl<T> TaskHandle<T> {
    /// A handle that is already resolved.
    pub fn ready(outcome: Result<T, DeviceError>) -> Self {
        let (completer, handle) = task_pair();
        completer.complete(outcome);
        handle
    }

    /// Returns `true` once the task has been resolved.
    pub fn is_ready(&self) -> bool {
        self.state.slot.lock().done
    }

    /// Blocks the calling thread until the task is resolved.
    pub fn wait(self) -> Result<T, DeviceError> {
        let mut slot = self.state.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.take() {
                return outcome;
            }
            if slot.done {
                return Err(DeviceError::ThreadExited);
            }
            self.state.ready.wait(&mut slot);
        }
    }

    /// Blocks for at most `timeout`.
    /// ## Returns
    /// `None` if the task was not resolved in time; the handle stays usable.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T, DeviceError>> {
        let mut slot = self.state.slot.lock();
        if !slot.done {
            let _ = self
                .state
                .ready
                .wait_while_for(&mut slot, |slot| !slot.done, timeout);
        }
        if slot.done {
            slot.outcome.take()
        } else {
            None
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, DeviceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.state.slot.lock();
        if let Some(outcome) = slot.outcome.take() {
            Poll::Ready(outcome)
        } else {
            // Store the waker so the completer can wake this Future later
            slot.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// The producing side of a task.
///
/// Dropping a completer without calling [`complete`](Self::complete) resolves the
/// task with [`DeviceError::ThreadExited`].
pub struct TaskCompleter<T> {
    state: Option<Arc<TaskState<T>>>,
}

impl<T> TaskCompleter<T> {
    /// Resolves the task.
    pub fn complete(mut self, outcome: Result<T, DeviceError>) {
        if let Some(state) = self.state.take() {
            state.resolve(outcome);
        }
    }
}

impl<T> Drop for TaskCompleter<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.resolve(Err(DeviceError::ThreadExited));
        }
    }
}

impl<T> fmt::Debug for TaskCompleter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCompleter")
            .field("pending", &self.state.is_some())
            .finish()
    }
}
