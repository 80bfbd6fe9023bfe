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

//! The command thread: the single owner of device submission.
//!
//! Every call that creates, destroys or submits device state runs on one dedicated
//! thread. Producers on any thread hand it jobs through a FIFO queue; the thread runs
//! them in order and, between jobs, ticks the copy queue. Transient pools reach the
//! thread through a [`DeviceExecutor`] that feeds the same queue.
//!
//! ```text
//! main thread                       command thread
//! -----------                       --------------
//! submit(stream) ── job ──────────▶ execute, fence, record
//! advance_frame() ─ close frame N
//!                 └ cleanup job ──▶ fence N, retire finished frames
//! full_sync()     ─ job ──────────▶ fence, wait idle, retire  ─▶ result
//!                                   (each loop: copy_queue.update)
//! ```
//!
//! Shutdown sets an exit flag. From then on the queue yields nothing: outstanding
//! jobs are dropped (their task handles resolve with `DeviceError::ThreadExited`),
//! uploads are canceled, the GPU is waited on, every frame is retired and the
//! remaining transient buffers and device objects are destroyed, all on the command
//! thread.

mod task;

pub use self::task::{task_pair, TaskCompleter, TaskHandle};

use crate::backend::{
    BackendCall, BufferDescriptor, CommandStream, DeviceExecutor, DeviceObject, GpuBackend,
    ImageDescriptor, ObjectId, ObjectRegistry, SamplerDescriptor,
};
use crate::config::HalConfig;
use crate::copy::{CopyQueue, CopyRange, SourceDataProvider, UploadTicket};
use crate::error::{CopyError, DeviceError, ResourceError};
use crate::frame::{FrameEvent, FrameSequencer, SyncInfo};
use crate::telemetry::{DeviceStats, ResourceMonitor};
use crate::transient::{TransientBufferKind, TransientBufferPool, TransientFrame};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

type Job = Box<dyn FnOnce(&DeviceContext) + Send + 'static>;

/// Feeds backend calls into the command thread's job queue.
///
/// Calls made on the command thread itself run inline.
struct ThreadExecutor {
    sender: flume::Sender<Job>,
    backend: Arc<dyn GpuBackend>,
    owner: Arc<OnceLock<ThreadId>>,
}

impl DeviceExecutor for ThreadExecutor {
    fn dispatch(&self, call: BackendCall) -> bool {
        if self.owner.get() == Some(&thread::current().id()) {
            call(self.backend.as_ref());
            return true;
        }
        self.sender
            .send(Box::new(move |context: &DeviceContext| call(context.backend())))
            .is_ok()
    }
}

impl fmt::Debug for ThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadExecutor")
            .field("owner", &self.owner.get())
            .finish()
    }
}

/// What a job running on the command thread can reach.
pub struct DeviceContext {
    backend: Arc<dyn GpuBackend>,
    sequencer: Arc<FrameSequencer>,
    copy_queue: Arc<CopyQueue>,
    objects: Arc<ObjectRegistry>,
    constants: Arc<TransientBufferPool>,
    scratch: Arc<TransientBufferPool>,
    lost: AtomicBool,
}

impl DeviceContext {
    /// The active backend.
    pub fn backend(&self) -> &dyn GpuBackend {
        self.backend.as_ref()
    }

    /// The frame sequencer.
    pub fn sequencer(&self) -> &FrameSequencer {
        &self.sequencer
    }

    /// The copy queue.
    pub fn copy_queue(&self) -> &CopyQueue {
        &self.copy_queue
    }

    /// The registry of live device objects.
    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// The transient pool of `kind`.
    pub fn transient_pool(&self, kind: TransientBufferKind) -> &Arc<TransientBufferPool> {
        match kind {
            TransientBufferKind::Constants => &self.constants,
            TransientBufferKind::Staging => &self.scratch,
        }
    }

    /// Returns `true` once a fatal device error was observed.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.backend.info().kind)
            .field("current_frame", &self.sequencer.current_index())
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Owns the device context and the thread that submits work to it.
pub struct CommandThread {
    config: HalConfig,
    context: Arc<DeviceContext>,
    sender: Option<flume::Sender<Job>>,
    exit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
    main_thread: ThreadId,
    cleanup: Mutex<Option<TaskHandle<()>>>,
    executed_jobs: Arc<AtomicU64>,
}

impl CommandThread {
    /// Validates `config`, builds the device context and starts the thread.
    ///
    /// The calling thread becomes the main thread: only it may call
    /// [`advance_frame`](Self::advance_frame).
    /// ## Errors
    /// * `DeviceError::Config` - the configuration is invalid.
    /// * `DeviceError::Resource` - the staging pool could not be created.
    /// * `DeviceError::InitializationFailed` - the thread could not be spawned.
    pub fn start(backend: Arc<dyn GpuBackend>, config: HalConfig) -> Result<Self, DeviceError> {
        config.validate()?;

        let staging = Arc::new(
            backend.create_staging_pool(config.staging_area_size, config.staging_page_size)?,
        );
        let (sender, receiver) = flume::unbounded::<Job>();
        let owner = Arc::new(OnceLock::new());
        let executor: Arc<dyn DeviceExecutor> = Arc::new(ThreadExecutor {
            sender: sender.clone(),
            backend: Arc::clone(&backend),
            owner: Arc::clone(&owner),
        });

        let objects = Arc::new(ObjectRegistry::new());
        let context = Arc::new(DeviceContext {
            copy_queue: Arc::new(CopyQueue::new(Arc::clone(&objects), staging)),
            sequencer: Arc::new(FrameSequencer::new()),
            objects,
            constants: Arc::new(TransientBufferPool::new(
                TransientBufferKind::Constants,
                Arc::clone(&executor),
                &config,
            )?),
            scratch: Arc::new(TransientBufferPool::new(
                TransientBufferKind::Staging,
                executor,
                &config,
            )?),
            backend: Arc::clone(&backend),
            lost: AtomicBool::new(false),
        });

        let exit = Arc::new(AtomicBool::new(false));
        let executed_jobs = Arc::new(AtomicU64::new(0));

        let handle = {
            let context = Arc::clone(&context);
            let exit = Arc::clone(&exit);
            let executed_jobs = Arc::clone(&executed_jobs);
            let config = config.clone();
            thread::Builder::new()
                .name("strata-command".to_string())
                .spawn(move || {
                    let _ = owner.set(thread::current().id());
                    run_loop(&context, &receiver, &exit, &executed_jobs, &config)
                })
                .map_err(|e| DeviceError::InitializationFailed(e.to_string()))?
        };

        log::info!(
            "Command thread running on {} backend '{}'",
            format!("{:?}", backend.info().kind).to_lowercase(),
            backend.info().adapter_name
        );

        Ok(Self {
            thread_id: handle.thread().id(),
            main_thread: thread::current().id(),
            config,
            context,
            sender: Some(sender),
            exit,
            handle: Some(handle),
            cleanup: Mutex::new(None),
            executed_jobs,
        })
    }

    /// The device context shared with the command thread.
    pub fn context(&self) -> &Arc<DeviceContext> {
        &self.context
    }

    /// The configuration the thread was started with.
    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    /// Returns `true` once a fatal device error stopped the thread.
    pub fn is_device_lost(&self) -> bool {
        self.context.is_lost()
    }

    /// Returns `true` when called from the command thread itself.
    pub fn is_command_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Appends a job to the queue. Never blocks.
    /// ## Returns
    /// `false` if the thread is gone; the job is dropped.
    pub fn enqueue(&self, job: impl FnOnce(&DeviceContext) + Send + 'static) -> bool {
        let Some(sender) = &self.sender else {
            log::warn!("Job enqueued after the command thread shut down");
            return false;
        };
        if self.context.is_lost() {
            log::warn!("Job enqueued after the device was lost");
            return false;
        }
        sender.send(Box::new(job)).is_ok()
    }

    /// Runs `callback` on the command thread and returns a handle to its result.
    ///
    /// Called from the command thread itself, the callback runs inline.
    pub fn run_on_thread_and_wait<R: Send + 'static>(
        &self,
        callback: impl FnOnce(&DeviceContext) -> R + Send + 'static,
    ) -> TaskHandle<R> {
        if self.is_command_thread() {
            return TaskHandle::ready(Ok(callback(&self.context)));
        }

        let (completer, handle) = task_pair();
        self.enqueue(move |context| completer.complete(Ok(callback(context))));
        handle
    }

    /// Closes the current frame and queues its cleanup. Main thread only.
    ///
    /// Waits for the cleanup job of the previous frame first, so the command thread
    /// never lags more than one frame boundary behind.
    pub fn advance_frame(&self) {
        if thread::current().id() != self.main_thread {
            log::error!("advance_frame called from a thread other than the main thread");
            debug_assert!(false, "advance_frame called off the main thread");
            return;
        }
        self.wait_for_cleanup();

        let closed = self.context.sequencer.close_current();
        let (completer, handle) = task_pair();
        self.enqueue(move |context| {
            let fence = create_fence(context);
            context.sequencer.attach_recorded_frame(closed, fence);
            context.sequencer.collect_finished(context.backend());
            completer.complete(Ok(()));
        });
        *self.cleanup.lock() = Some(handle);
    }

    /// Closes the current frame, waits for the GPU to go idle and retires every frame.
    /// ## Errors
    /// * `DeviceError::Timeout` - the GPU did not go idle within the sync timeout.
    /// * `DeviceError::ThreadExited` - the command thread is gone.
    pub fn full_sync(&self) -> Result<(), DeviceError> {
        let started = Instant::now();
        self.wait_for_cleanup();

        let closed = self.context.sequencer.close_current();
        let timeout = self.config.sync_timeout;
        let pending = self
            .run_on_thread_and_wait(move |context| {
                let fence = create_fence(context);
                context.sequencer.attach_recorded_frame(closed, fence);
                context.backend.wait_idle(timeout)?;
                context.sequencer.collect_finished(context.backend());
                context
                    .copy_queue
                    .update(context.backend(), &context.sequencer);
                Ok::<_, DeviceError>(context.sequencer.pending_count())
            })
            .wait()??;

        if pending != 0 {
            log::error!("{} frames still pending after a full sync", pending);
            debug_assert_eq!(pending, 0, "frames left pending after a full sync");
        }

        let elapsed = started.elapsed();
        if let Some(level) = self.config.slow_sync_level(elapsed) {
            log::log!(level, "Full sync took {:?}", elapsed);
        }
        Ok(())
    }

    /// Executes `stream` as part of the current frame.
    ///
    /// The frame cannot retire before the stream has run and its fence completed.
    pub fn submit(&self, stream: Box<dyn CommandStream>) -> TaskHandle<()> {
        let frame = self.context.sequencer.attach_pending_frame();
        let (completer, handle) = task_pair();
        self.enqueue(move |context| {
            let label = stream.label().to_string();
            let result = context.backend.execute(stream);
            let fence = match &result {
                Ok(()) => create_fence(context),
                Err(_) => None,
            };
            context.sequencer.attach_recorded_frame(frame, fence);

            if let Err(e) = &result {
                log::error!("Command stream '{}' failed: {}", label, e);
                if e.is_fatal() {
                    context.mark_lost();
                }
            }
            completer.complete(result);
        });
        handle
    }

    /// Creates a buffer on the command thread and registers it.
    ///
    /// Blocks until the command thread has run the creation.
    /// ## Errors
    /// * `ResourceError::DeviceUnavailable` - the command thread is gone.
    /// * Any error of the backend while creating the buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<ObjectId, ResourceError> {
        let descriptor = descriptor.clone().into_owned();
        self.create_on_thread(move |context| {
            let id = context.backend.create_buffer(&descriptor)?;
            Ok(DeviceObject::Buffer {
                id,
                size: descriptor.size,
                usage: descriptor.usage,
            })
        })
    }

    /// Creates an image on the command thread and registers it.
    pub fn create_image(&self, descriptor: &ImageDescriptor) -> Result<ObjectId, ResourceError> {
        if descriptor.width == 0 || descriptor.mips == 0 || descriptor.slices == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let descriptor = descriptor.clone().into_owned();
        self.create_on_thread(move |context| {
            let id = context.backend.create_image(&descriptor)?;
            Ok(DeviceObject::Image { id, descriptor })
        })
    }

    /// Creates a sampler on the command thread and registers it.
    pub fn create_sampler(&self, descriptor: &SamplerDescriptor) -> Result<ObjectId, ResourceError> {
        let descriptor = descriptor.clone().into_owned();
        self.create_on_thread(move |context| {
            let id = context.backend.create_sampler(&descriptor)?;
            Ok(DeviceObject::Sampler { id })
        })
    }

    fn create_on_thread(
        &self,
        create: impl FnOnce(&DeviceContext) -> Result<DeviceObject, ResourceError> + Send + 'static,
    ) -> Result<ObjectId, ResourceError> {
        self.run_on_thread_and_wait(move |context| {
            create(context).map(|object| context.objects.register(object))
        })
        .wait()
        .map_err(|e| {
            log::warn!("Device object not created: {}", e);
            ResourceError::DeviceUnavailable
        })?
    }

    /// Destroys an object once the GPU can no longer be using it.
    ///
    /// The ID stops resolving immediately; the backend object is released when the
    /// current frame retires.
    /// ## Returns
    /// `false` if `id` did not resolve.
    pub fn destroy_object(&self, id: ObjectId) -> bool {
        match self.context.objects.unregister(id) {
            Some(object) => {
                self.context.sequencer.register_object_for_deletion(object);
                true
            }
            None => {
                log::warn!("Destroy requested for unknown object {:?}", id);
                false
            }
        }
    }

    /// Schedules an upload into `target`.
    pub fn schedule_upload(
        &self,
        target: ObjectId,
        range: CopyRange,
        provider: Arc<dyn SourceDataProvider>,
    ) -> Result<UploadTicket, CopyError> {
        self.context.copy_queue.schedule(target, range, provider)
    }

    /// Cancels the outstanding jobs of an upload.
    pub fn cancel_upload(&self, ticket: &UploadTicket) -> usize {
        self.context.copy_queue.cancel(ticket)
    }

    /// The transient pool of `kind`.
    pub fn transient_pool(&self, kind: TransientBufferKind) -> &Arc<TransientBufferPool> {
        self.context.transient_pool(kind)
    }

    /// Starts collecting transient buffers of `kind` for the current frame.
    pub fn begin_transient_frame(&self, kind: TransientBufferKind) -> TransientFrame {
        TransientFrame::new(Arc::clone(self.transient_pool(kind)))
    }

    /// Returns the buffers of `frame` to their pool once the current frame retires.
    pub fn end_transient_frame(&self, frame: TransientFrame) {
        frame.finish(&self.context.sequencer);
    }

    /// Every pooled resource that reports its usage.
    pub fn monitors(&self) -> Vec<Arc<dyn ResourceMonitor>> {
        vec![
            Arc::clone(self.context.copy_queue.staging()) as Arc<dyn ResourceMonitor>,
            Arc::clone(&self.context.constants) as Arc<dyn ResourceMonitor>,
            Arc::clone(&self.context.scratch) as Arc<dyn ResourceMonitor>,
        ]
    }

    /// The last frame indices reached by the main thread, the command thread and the GPU.
    pub fn sync_info(&self) -> SyncInfo {
        self.context.sequencer.sync_info()
    }

    /// Runs `callback` once the current frame reaches `event`.
    ///
    /// `GpuFinished` callbacks run on the command thread; the others run on whichever
    /// thread moved the frame forward.
    pub fn register_frame_callback(
        &self,
        event: FrameEvent,
        callback: impl FnOnce() + Send + 'static,
    ) {
        self.context.sequencer.register_callback(event, callback);
    }

    /// A snapshot of the device bookkeeping.
    pub fn stats(&self) -> DeviceStats {
        let frames = self.context.sequencer.stats();
        let uploads = self.context.copy_queue.stats();
        DeviceStats {
            current_frame: frames.current_index,
            recorded_frame: frames.recorded_index,
            finished_frame: frames.finished_index,
            pending_frames: frames.pending_frames,
            retired_frames: frames.retired_frames,
            deleted_objects: frames.deleted_objects,
            failed_fences: frames.failed_fences,
            executed_jobs: self.executed_jobs.load(Ordering::Relaxed),
            uploads_pending: uploads.pending,
            uploads_in_flight: uploads.in_flight,
            uploads_finished: uploads.finished,
            uploads_canceled: uploads.canceled,
            live_objects: self.context.objects.len(),
        }
    }

    /// Stops the thread, which releases every remaining device object on its way out.
    /// ## Errors
    /// * `DeviceError::ThreadExited` - the thread panicked.
    pub fn shutdown(&mut self) -> Result<(), DeviceError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.exit.store(true, Ordering::Release);
        self.sender = None;
        *self.cleanup.lock() = None;
        handle.join().map_err(|_| DeviceError::ThreadExited)
    }

    fn wait_for_cleanup(&self) {
        let previous = self.cleanup.lock().take();
        if let Some(previous) = previous {
            if let Err(e) = previous.wait() {
                log::warn!("Frame cleanup did not run: {}", e);
            }
        }
    }
}

impl Drop for CommandThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Command thread shutdown failed: {}", e);
        }
    }
}

impl fmt::Debug for CommandThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandThread")
            .field("context", &self.context)
            .field("running", &self.handle.is_some())
            .finish()
    }
}

fn create_fence(context: &DeviceContext) -> Option<crate::backend::FenceId> {
    match context.backend.create_frame_fence() {
        Ok(fence) => Some(fence),
        Err(e) => {
            log::error!("Failed to create frame fence: {}", e);
            None
        }
    }
}

fn run_loop(
    context: &DeviceContext,
    receiver: &flume::Receiver<Job>,
    exit: &AtomicBool,
    executed_jobs: &AtomicU64,
    config: &HalConfig,
) {
    log::info!("Command thread started.");

    loop {
        context
            .copy_queue
            .update(context.backend(), &context.sequencer);

        if exit.load(Ordering::Acquire) {
            break;
        }
        match receiver.recv_timeout(config.idle_tick) {
            Ok(job) => {
                executed_jobs.fetch_add(1, Ordering::Relaxed);
                job(context);
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }

        if context.is_lost() {
            log::error!("Device lost, stopping the command thread");
            break;
        }
    }

    context.copy_queue.stop();
    let dropped = receiver.drain().count();
    if dropped > 0 {
        log::debug!("Dropped {} jobs queued after exit", dropped);
    }
    if !context.is_lost() {
        if let Err(e) = context.backend.wait_idle(config.sync_timeout) {
            log::warn!("GPU did not go idle before shutdown: {}", e);
        }
    }
    let retired = context.sequencer.retire_all(context.backend());
    log::trace!("Retired {} frames at shutdown", retired);

    let released =
        context.constants.release_free_buffers() + context.scratch.release_free_buffers();
    log::debug!("Released {} pooled transient buffers", released);
    let leaked = context.objects.drain();
    if !leaked.is_empty() {
        log::warn!("Destroying {} objects still alive at shutdown", leaked.len());
    }
    for object in leaked {
        if let Err(e) = object.destroy(context.backend()) {
            log::warn!("Failed to destroy {} {:?}: {}", object.kind_name(), object, e);
        }
    }

    log::info!("Command thread stopped.");
}
