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

//! Pools of reusable, short-lived GPU buffers.
//!
//! Per-draw constants and scratch staging data are written every frame. Creating a
//! fresh buffer for each of them would thrash the backend allocator, so each
//! [`TransientBufferPool`] keeps the buffers it created on a free list and hands them
//! out again once the frame that used them has retired.
//!
//! - Sizes are rounded up to the pool's page size and never go below its minimum.
//! - A request is served by the smallest free buffer that fits; among equal sizes the
//!   most recently returned one wins.
//! - On a miss, least-recently-used free buffers are destroyed until the pool's byte
//!   budget leaves room for the new buffer.
//! - A checked-out buffer that is dropped instead of returned is destroyed.
//!
//! Backend calls go through the pool's [`DeviceExecutor`], so creation, writes and
//! destruction all run on the thread that owns the device, in the order they were made.

use crate::backend::{
    call_on_device, BufferDescriptor, BufferId, BufferUsage, DeviceExecutor,
    COPY_BUFFER_ALIGNMENT,
};
use crate::config::HalConfig;
use crate::error::ResourceError;
use crate::frame::FrameSequencer;
use crate::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Weak};

/// What a transient pool's buffers are used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientBufferKind {
    /// Shader constants, bound as uniform buffers.
    Constants,
    /// Scratch data copied to other resources.
    Staging,
}

impl TransientBufferKind {
    /// The usage flags of buffers of this kind.
    pub fn usage(&self) -> BufferUsage {
        match self {
            TransientBufferKind::Constants => BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            TransientBufferKind::Staging => BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            TransientBufferKind::Constants => "TransientConstants",
            TransientBufferKind::Staging => "TransientStaging",
        }
    }
}

/// A buffer checked out of a [`TransientBufferPool`].
///
/// While checked out the buffer is mapped: writes go to a host-side shadow and
/// [`flush`](Self::flush) sends the dirty range to the GPU.
///
/// Dropping a checked-out buffer destroys it; hand it back with
/// [`TransientBufferPool::release_after_frame`] to keep it for reuse.
pub struct TransientBuffer {
    id: BufferId,
    size: u64,
    kind: TransientBufferKind,
    host: Vec<u8>,
    mapped: bool,
    dirty_min: u64,
    dirty_max: u64,
    pool: Weak<TransientBufferPool>,
}

impl TransientBuffer {
    fn new(
        id: BufferId,
        size: u64,
        kind: TransientBufferKind,
        pool: Weak<TransientBufferPool>,
    ) -> Self {
        Self {
            id,
            size,
            kind,
            host: vec![0; size as usize],
            mapped: true,
            dirty_min: u64::MAX,
            dirty_max: 0,
            pool,
        }
    }

    /// The backend buffer.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Capacity in bytes, a multiple of the pool's page size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The kind of the pool this buffer belongs to.
    pub fn kind(&self) -> TransientBufferKind {
        self.kind
    }

    /// Returns `true` while the buffer is checked out.
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// The range written since the last flush, if any.
    pub fn dirty_range(&self) -> Option<Range<u64>> {
        (self.dirty_min < self.dirty_max).then_some(self.dirty_min..self.dirty_max)
    }

    /// Writes `data` at `offset` and extends the dirty range.
    /// ## Errors
    /// * `ResourceError::NotMapped` - the buffer is not checked out.
    /// * `ResourceError::OutOfBounds` - the write exceeds the buffer.
    pub fn write_data(&mut self, offset: u64, data: &[u8]) -> Result<(), ResourceError> {
        if !self.mapped {
            return Err(ResourceError::NotMapped);
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= self.size)
            .ok_or(ResourceError::OutOfBounds)?;
        if data.is_empty() {
            return Ok(());
        }

        self.host[offset as usize..end as usize].copy_from_slice(data);
        self.dirty_min = self.dirty_min.min(offset);
        self.dirty_max = self.dirty_max.max(end);
        Ok(())
    }

    /// Queues the dirty range for the GPU and clears it.
    ///
    /// The range is widened to [`COPY_BUFFER_ALIGNMENT`], as buffer writes require.
    /// The write runs on the device thread ahead of any work submitted after this call;
    /// a backend failure there is logged.
    /// ## Returns
    /// The number of bytes queued, `0` when nothing was dirty.
    /// ## Errors
    /// * `ResourceError::NotMapped` - the buffer is not checked out.
    /// * `ResourceError::DeviceUnavailable` - the pool or its device thread is gone.
    pub fn flush(&mut self) -> Result<u64, ResourceError> {
        if !self.mapped {
            return Err(ResourceError::NotMapped);
        }
        let Some(range) = self.dirty_range() else {
            return Ok(0);
        };
        let pool = self.pool.upgrade().ok_or(ResourceError::DeviceUnavailable)?;

        let start = range.start - range.start % COPY_BUFFER_ALIGNMENT;
        let end = range.end.next_multiple_of(COPY_BUFFER_ALIGNMENT).min(self.size);
        let id = self.id;
        let data = self.host[start as usize..end as usize].to_vec();
        let queued = pool.executor.dispatch(Box::new(move |backend| {
            if let Err(e) = backend.write_buffer(id, start, &data) {
                log::error!("Failed to flush transient buffer {:?}: {}", id, e);
            }
        }));
        if !queued {
            return Err(ResourceError::DeviceUnavailable);
        }
        self.reset_dirty();
        Ok(end - start)
    }

    fn reset_dirty(&mut self) {
        self.dirty_min = u64::MAX;
        self.dirty_max = 0;
    }

    /// Moves the buffer out of `self`, leaving an unmapped husk to drop.
    fn detach(&mut self) -> TransientBuffer {
        self.mapped = false;
        TransientBuffer {
            id: self.id,
            size: self.size,
            kind: self.kind,
            host: std::mem::take(&mut self.host),
            mapped: true,
            dirty_min: self.dirty_min,
            dirty_max: self.dirty_max,
            pool: std::mem::take(&mut self.pool),
        }
    }
}

impl Drop for TransientBuffer {
    fn drop(&mut self) {
        if !self.mapped {
            return;
        }
        match self.pool.upgrade() {
            Some(pool) => {
                log::debug!(
                    "{} buffer {:?} dropped while checked out, destroying it",
                    self.kind.label(),
                    self.id
                );
                pool.discard(self.detach());
            }
            None => log::warn!(
                "{} buffer {:?} outlived its pool and is leaked",
                self.kind.label(),
                self.id
            ),
        }
    }
}

impl fmt::Debug for TransientBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientBuffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("mapped", &self.mapped)
            .field("dirty", &self.dirty_range())
            .finish()
    }
}

/// Counters of a [`TransientBufferPool`].
///
/// `created - evicted == checked_out + free` holds at every observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransientPoolStats {
    /// Buffers created over the pool's lifetime.
    pub created: u64,
    /// Buffers destroyed by eviction.
    pub evicted: u64,
    /// Buffers currently checked out.
    pub checked_out: u64,
    /// Buffers on the free list.
    pub free: u64,
    /// Bytes held by checked-out buffers.
    pub checked_out_bytes: u64,
    /// Bytes held by free buffers.
    pub free_bytes: u64,
    /// Requests served from the free list.
    pub reused: u64,
    /// Highest number of bytes ever held.
    pub peak_bytes: u64,
}

impl TransientPoolStats {
    fn held_bytes(&self) -> u64 {
        self.checked_out_bytes + self.free_bytes
    }
}

#[derive(Debug)]
struct FreeEntry {
    buffer: TransientBuffer,
    last_used: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<FreeEntry>,
    clock: u64,
    stats: TransientPoolStats,
}

/// A pool of reusable buffers of one [`TransientBufferKind`].
///
/// Remaining free buffers are destroyed when the pool drops.
pub struct TransientBufferPool {
    kind: TransientBufferKind,
    executor: Arc<dyn DeviceExecutor>,
    page_size: u64,
    min_size: u64,
    budget: u64,
    state: Mutex<PoolState>,
}

impl TransientBufferPool {
    /// Creates a pool using the transient settings of `config`.
    pub fn new(
        kind: TransientBufferKind,
        executor: Arc<dyn DeviceExecutor>,
        config: &HalConfig,
    ) -> Result<Self, ResourceError> {
        Self::with_limits(
            kind,
            executor,
            config.transient_page_size,
            config.transient_min_buffer_size,
            config.transient_budget,
        )
    }

    /// Creates a pool with explicit limits.
    /// ## Errors
    /// * `ResourceError::InvalidSize` - the page size is not a power of two.
    pub fn with_limits(
        kind: TransientBufferKind,
        executor: Arc<dyn DeviceExecutor>,
        page_size: u64,
        min_size: u64,
        budget: u64,
    ) -> Result<Self, ResourceError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(ResourceError::InvalidSize(page_size));
        }
        Ok(Self {
            kind,
            executor,
            page_size,
            min_size: round_up(min_size.max(1), page_size),
            budget,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// The kind of buffers this pool hands out.
    pub fn kind(&self) -> TransientBufferKind {
        self.kind
    }

    /// Checks out a buffer of at least `required` bytes.
    ///
    /// Exceeding the budget is not an error: once every free buffer has been evicted
    /// the new buffer is created anyway.
    /// Blocks until the device thread has created the buffer on a miss.
    /// ## Errors
    /// * `ResourceError::InvalidSize` - `required` is zero.
    /// * `ResourceError::DeviceUnavailable` - the device thread is gone.
    /// * Any error of the backend while creating a buffer.
    pub fn allocate(self: &Arc<Self>, required: u64) -> Result<TransientBuffer, ResourceError> {
        if required == 0 {
            return Err(ResourceError::InvalidSize(0));
        }
        let size = round_up(required, self.page_size).max(self.min_size);

        let evicted = {
            let mut state = self.state.lock();
            if let Some(mut buffer) = state.take_best_fit(size) {
                buffer.mapped = true;
                state.stats.reused += 1;
                state.stats.checked_out += 1;
                state.stats.checked_out_bytes += buffer.size;
                return Ok(buffer);
            }
            state.evict_for(size, self.budget)
        };

        self.destroy_buffers(evicted.iter().map(|buffer| buffer.id).collect());

        let descriptor = BufferDescriptor {
            label: Some(Cow::Borrowed(self.kind.label())),
            size,
            usage: self.kind.usage(),
        };
        let id = call_on_device(self.executor.as_ref(), move |backend| {
            backend.create_buffer(&descriptor)
        })
        .map_err(|_| ResourceError::DeviceUnavailable)??;

        let mut state = self.state.lock();
        let stats = &mut state.stats;
        stats.created += 1;
        stats.checked_out += 1;
        stats.checked_out_bytes += size;
        stats.peak_bytes = stats.peak_bytes.max(stats.held_bytes());
        if stats.held_bytes() > self.budget {
            log::debug!(
                "{} pool holds {} bytes, over its budget of {} bytes",
                self.kind.label(),
                stats.held_bytes(),
                self.budget
            );
        }
        log::trace!("Created {} buffer {:?} of {} bytes", self.kind.label(), id, size);
        Ok(TransientBuffer::new(id, size, self.kind, Arc::downgrade(self)))
    }

    /// Puts a buffer back on the free list.
    ///
    /// Only call this once the GPU no longer reads the buffer; see
    /// [`release_after_frame`](Self::release_after_frame).
    pub fn return_to_pool(&self, mut buffer: TransientBuffer) {
        debug_assert_eq!(buffer.kind, self.kind, "buffer returned to the wrong pool");
        buffer.mapped = false;
        buffer.reset_dirty();

        let mut state = self.state.lock();
        state.clock += 1;
        let last_used = state.clock;
        state.stats.checked_out -= 1;
        state.stats.checked_out_bytes -= buffer.size;
        state.stats.free += 1;
        state.stats.free_bytes += buffer.size;
        state.free.push(FreeEntry { buffer, last_used });
    }

    /// Destroys a checked-out buffer instead of keeping it.
    fn discard(&self, mut buffer: TransientBuffer) {
        buffer.mapped = false;
        {
            let mut state = self.state.lock();
            state.stats.checked_out -= 1;
            state.stats.checked_out_bytes -= buffer.size;
            state.stats.evicted += 1;
        }
        self.destroy_buffers(vec![buffer.id]);
    }

    fn destroy_buffers(&self, ids: Vec<BufferId>) {
        if ids.is_empty() {
            return;
        }
        let label = self.kind.label();
        let count = ids.len();
        let queued = self.executor.dispatch(Box::new(move |backend| {
            for id in ids {
                if let Err(e) = backend.destroy_buffer(id) {
                    log::warn!("Failed to destroy {} buffer {:?}: {}", label, id, e);
                }
            }
        }));
        if !queued {
            log::warn!("Device thread gone, {} {} buffers leaked", count, label);
        }
    }

    /// Returns `buffer` to the pool once the frame open in `sequencer` retires.
    pub fn release_after_frame(self: &Arc<Self>, buffer: TransientBuffer, sequencer: &FrameSequencer) {
        let pool = Arc::clone(self);
        sequencer.register_completion_callback(move || pool.return_to_pool(buffer));
    }

    /// Destroys every free buffer.
    /// ## Returns
    /// The number of buffers destroyed.
    pub fn release_free_buffers(&self) -> usize {
        let released = {
            let mut state = self.state.lock();
            let released = std::mem::take(&mut state.free);
            state.stats.evicted += released.len() as u64;
            state.stats.free = 0;
            state.stats.free_bytes = 0;
            released
        };
        let count = released.len();
        self.destroy_buffers(released.iter().map(|entry| entry.buffer.id).collect());
        count
    }

    /// A snapshot of the pool counters.
    pub fn stats(&self) -> TransientPoolStats {
        self.state.lock().stats
    }
}

impl PoolState {
    fn take_best_fit(&mut self, size: u64) -> Option<TransientBuffer> {
        let index = self
            .free
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.buffer.size >= size)
            .min_by(|(_, a), (_, b)| {
                a.buffer
                    .size
                    .cmp(&b.buffer.size)
                    .then(b.last_used.cmp(&a.last_used))
            })
            .map(|(index, _)| index)?;

        let entry = self.free.swap_remove(index);
        self.stats.free -= 1;
        self.stats.free_bytes -= entry.buffer.size;
        Some(entry.buffer)
    }

    /// Removes least-recently-used free buffers until `size` more bytes fit the budget.
    fn evict_for(&mut self, size: u64, budget: u64) -> Vec<TransientBuffer> {
        let mut evicted = Vec::new();
        while budget.saturating_sub(self.stats.held_bytes()) < size {
            let oldest = self
                .free
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(index, _)| index);
            let Some(oldest) = oldest else {
                break;
            };

            let entry = self.free.swap_remove(oldest);
            self.stats.free -= 1;
            self.stats.free_bytes -= entry.buffer.size;
            self.stats.evicted += 1;
            evicted.push(entry.buffer);
        }
        evicted
    }
}

impl ResourceMonitor for TransientBufferPool {
    fn monitor_id(&self) -> Cow<'static, str> {
        Cow::Borrowed(self.kind.label())
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::TransientMemory
    }

    fn get_usage_report(&self) -> ResourceUsageReport {
        let stats = self.stats();
        ResourceUsageReport {
            current_bytes: stats.held_bytes(),
            peak_bytes: Some(stats.peak_bytes),
            total_capacity_bytes: Some(self.budget),
        }
    }
}

impl Drop for TransientBufferPool {
    fn drop(&mut self) {
        let released = self.release_free_buffers();
        if released > 0 {
            log::trace!("Released {} {} buffers with their pool", released, self.kind.label());
        }
    }
}

impl fmt::Debug for TransientBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientBufferPool")
            .field("kind", &self.kind)
            .field("page_size", &self.page_size)
            .field("min_size", &self.min_size)
            .field("budget", &self.budget)
            .field("stats", &self.stats())
            .finish()
    }
}

/// The transient buffers used while recording one frame.
///
/// [`finish`](Self::finish) hands them back to their pool once the frame retires.
#[derive(Debug)]
pub struct TransientFrame {
    pool: Arc<TransientBufferPool>,
    buffers: Vec<TransientBuffer>,
}

impl TransientFrame {
    /// Starts collecting buffers from `pool`.
    pub fn new(pool: Arc<TransientBufferPool>) -> Self {
        Self {
            pool,
            buffers: Vec::new(),
        }
    }

    /// Checks out a buffer for this frame.
    pub fn allocate(&mut self, required: u64) -> Result<&mut TransientBuffer, ResourceError> {
        let buffer = self.pool.allocate(required)?;
        let index = self.buffers.len();
        self.buffers.push(buffer);
        Ok(&mut self.buffers[index])
    }

    /// The buffers checked out so far.
    pub fn buffers(&self) -> &[TransientBuffer] {
        &self.buffers
    }

    /// Flushes every buffer.
    pub fn flush(&mut self) -> Result<u64, ResourceError> {
        let mut flushed = 0;
        for buffer in &mut self.buffers {
            flushed += buffer.flush()?;
        }
        Ok(flushed)
    }

    /// Schedules every buffer to return to the pool when the open frame retires.
    pub fn finish(mut self, sequencer: &FrameSequencer) {
        for buffer in self.buffers.drain(..) {
            self.pool.release_after_frame(buffer, sequencer);
        }
    }
}

impl Drop for TransientFrame {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            log::warn!(
                "Transient frame dropped with {} buffers still checked out, destroying them",
                self.buffers.len()
            );
            self.buffers.clear();
        }
    }
}

fn round_up(value: u64, page_size: u64) -> u64 {
    value.div_ceil(page_size) * page_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, GpuBackend, InlineExecutor};
    use crate::test_support::MockBackend;

    fn pool(backend: &Arc<MockBackend>, budget: u64) -> Arc<TransientBufferPool> {
        let executor = Arc::new(InlineExecutor::new(backend.clone()));
        Arc::new(
            TransientBufferPool::with_limits(
                TransientBufferKind::Constants,
                executor,
                256,
                1024,
                budget,
            )
            .unwrap(),
        )
    }

    /// Runs calls inline until `hold` is set, then queues them for `run_all`.
    struct HeldExecutor {
        backend: Arc<MockBackend>,
        hold: std::sync::atomic::AtomicBool,
        calls: Mutex<Vec<BackendCall>>,
    }

    impl HeldExecutor {
        fn run_all(&self) {
            let calls = std::mem::take(&mut *self.calls.lock());
            for call in calls {
                call(self.backend.as_ref());
            }
        }
    }

    impl fmt::Debug for HeldExecutor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("HeldExecutor")
                .field("queued", &self.calls.lock().len())
                .finish()
        }
    }

    impl DeviceExecutor for HeldExecutor {
        fn dispatch(&self, call: BackendCall) -> bool {
            if self.hold.load(std::sync::atomic::Ordering::Acquire) {
                self.calls.lock().push(call);
            } else {
                call(self.backend.as_ref());
            }
            true
        }
    }

    fn assert_conserved(pool: &TransientBufferPool) {
        let stats = pool.stats();
        assert_eq!(stats.created - stats.evicted, stats.checked_out + stats.free);
    }

    #[test]
    fn test_sizes_round_to_page_and_minimum() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        assert_eq!(pool.allocate(1).unwrap().size(), 1024);
        assert_eq!(pool.allocate(1025).unwrap().size(), 1280);
        assert_eq!(pool.allocate(0).unwrap_err(), ResourceError::InvalidSize(0));
    }

    #[test]
    fn test_rejects_non_power_of_two_page() {
        let backend: Arc<dyn GpuBackend> = Arc::new(MockBackend::new());
        let executor = Arc::new(InlineExecutor::new(backend));
        let err = TransientBufferPool::with_limits(TransientBufferKind::Staging, executor, 300, 0, 0)
            .unwrap_err();
        assert_eq!(err, ResourceError::InvalidSize(300));
    }

    #[test]
    fn test_returned_buffer_is_reused() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let first = pool.allocate(512).unwrap();
        let id = first.id();
        pool.return_to_pool(first);

        let again = pool.allocate(700).unwrap();
        assert_eq!(again.id(), id);
        assert!(again.is_mapped());
        assert_eq!(backend.created_buffers(), 1);
        assert_eq!(pool.stats().reused, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_best_fit_prefers_most_recent_on_ties() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let large = pool.allocate(4096).unwrap();
        let older = pool.allocate(2048).unwrap();
        let newer = pool.allocate(2048).unwrap();
        let newer_id = newer.id();

        pool.return_to_pool(large);
        pool.return_to_pool(older);
        pool.return_to_pool(newer);

        assert_eq!(pool.allocate(1500).unwrap().id(), newer_id);
    }

    #[test]
    fn test_miss_evicts_least_recently_used() {
        let backend = Arc::new(MockBackend::new());
        // Room for exactly two 1 KiB buffers.
        let pool = pool(&backend, 2048);
        let a = pool.allocate(1024).unwrap();
        let b = pool.allocate(1024).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.return_to_pool(a);
        pool.return_to_pool(b);

        // A larger request misses and must evict the oldest buffer first.
        let big = pool.allocate(2048).unwrap();
        assert_eq!(big.size(), 2048);
        assert!(backend.buffer_contents(a_id).is_none());
        assert!(backend.buffer_contents(b_id).is_none());
        assert_eq!(pool.stats().evicted, 2);
        assert_conserved(&pool);
    }

    #[test]
    fn test_eviction_stops_once_budget_fits() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, 3072);
        let a = pool.allocate(1024).unwrap();
        let b = pool.allocate(1024).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.return_to_pool(a);
        pool.return_to_pool(b);

        let _c = pool.allocate(2048).unwrap();
        assert!(backend.buffer_contents(a_id).is_none());
        assert!(backend.buffer_contents(b_id).is_some());
        assert_eq!(pool.stats().evicted, 1);
    }

    #[test]
    fn test_over_budget_still_allocates() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, 1024);
        let _a = pool.allocate(1024).unwrap();
        let b = pool.allocate(1024).unwrap();
        assert_eq!(b.size(), 1024);
        assert_eq!(pool.get_usage_report().current_bytes, 2048);
        assert_conserved(&pool);
    }

    #[test]
    fn test_write_requires_mapping_and_bounds() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let mut buffer = pool.allocate(1024).unwrap();
        assert_eq!(buffer.write_data(1020, &[0; 8]), Err(ResourceError::OutOfBounds));

        buffer.mapped = false;
        assert_eq!(buffer.write_data(0, &[1]), Err(ResourceError::NotMapped));
    }

    #[test]
    fn test_flush_sends_only_the_dirty_range() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let mut buffer = pool.allocate(1024).unwrap();

        buffer.write_data(10, &[1, 2]).unwrap();
        buffer.write_data(17, &[3]).unwrap();
        assert_eq!(buffer.dirty_range(), Some(10..18));

        assert_eq!(buffer.flush().unwrap(), 12);
        assert_eq!(buffer.dirty_range(), None);
        assert_eq!(buffer.flush().unwrap(), 0);

        let contents = backend.buffer_contents(buffer.id()).unwrap();
        assert_eq!(&contents[10..12], &[1, 2]);
        assert_eq!(contents[17], 3);
    }

    #[test]
    fn test_returned_buffer_is_clean() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let mut buffer = pool.allocate(1024).unwrap();
        buffer.write_data(0, &[9; 4]).unwrap();
        pool.return_to_pool(buffer);

        let buffer = pool.allocate(1024).unwrap();
        assert_eq!(buffer.dirty_range(), None);
    }

    #[test]
    fn test_transient_frame_returns_buffers_after_retirement() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let sequencer = FrameSequencer::new();

        let mut frame = TransientFrame::new(Arc::clone(&pool));
        frame.allocate(100).unwrap().write_data(0, &[7; 4]).unwrap();
        frame.allocate(2000).unwrap();
        assert_eq!(frame.flush().unwrap(), 4);
        frame.finish(&sequencer);
        assert_eq!(pool.stats().checked_out, 2);

        let closed = sequencer.close_current();
        let fence = backend.create_frame_fence().unwrap();
        sequencer.attach_recorded_frame(closed, Some(fence));
        sequencer.collect_finished(backend.as_ref());
        assert_eq!(pool.stats().checked_out, 2);

        backend.signal_fence(fence, crate::backend::FenceStatus::Completed);
        sequencer.collect_finished(backend.as_ref());
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.free, 2);
        assert_conserved(&pool);
    }

    #[test]
    fn test_release_free_buffers() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let a = pool.allocate(1).unwrap();
        pool.return_to_pool(a);
        assert_eq!(pool.release_free_buffers(), 1);
        assert_eq!(backend.live_buffers(), 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_dropped_checked_out_buffer_is_destroyed() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        drop(pool.allocate(256).unwrap());
        pool.release_free_buffers();

        assert_eq!(backend.live_buffers(), 0);
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.evicted, 1);
        assert_conserved(&pool);
    }

    #[test]
    fn test_dropped_frame_destroys_its_buffers() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let mut frame = TransientFrame::new(Arc::clone(&pool));
        frame.allocate(64).unwrap();
        frame.allocate(64).unwrap();
        drop(frame);

        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(pool.stats().checked_out, 0);
        assert_conserved(&pool);
    }

    #[test]
    fn test_dropping_the_pool_releases_free_buffers() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let buffer = pool.allocate(64).unwrap();
        pool.return_to_pool(buffer);
        assert_eq!(backend.live_buffers(), 1);

        drop(pool);
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn test_flush_runs_on_the_executor() {
        let backend = Arc::new(MockBackend::new());
        let executor = Arc::new(HeldExecutor {
            backend: backend.clone(),
            hold: std::sync::atomic::AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        });
        let pool = Arc::new(
            TransientBufferPool::with_limits(
                TransientBufferKind::Staging,
                executor.clone(),
                256,
                256,
                u64::MAX,
            )
            .unwrap(),
        );
        let mut buffer = pool.allocate(256).unwrap();
        let id = buffer.id();

        executor.hold.store(true, std::sync::atomic::Ordering::Release);
        buffer.write_data(0, &[5; 8]).unwrap();
        assert_eq!(buffer.flush().unwrap(), 8);
        assert_eq!(&backend.buffer_contents(id).unwrap()[..8], &[0; 8]);

        executor.run_all();
        assert_eq!(&backend.buffer_contents(id).unwrap()[..8], &[5; 8]);
        pool.return_to_pool(buffer);
    }

    #[test]
    fn test_flush_fails_once_the_pool_is_gone() {
        let backend = Arc::new(MockBackend::new());
        let pool = pool(&backend, u64::MAX);
        let mut buffer = pool.allocate(64).unwrap();
        buffer.write_data(0, &[1; 4]).unwrap();

        drop(pool);
        assert_eq!(buffer.flush(), Err(ResourceError::DeviceUnavailable));
    }
}
