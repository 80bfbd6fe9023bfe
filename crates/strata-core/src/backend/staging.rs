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

//! Bounded, page-granular staging memory for uploads.
//!
//! The pool owns one persistently mapped block of host-visible memory and hands out
//! contiguous runs of pages from it. Allocation is first-fit over a sorted list of
//! free runs; freeing coalesces a run with its neighbours.
//!
//! ```text
//! pages:  [ A A A | . . | B B | . . . . . . ]
//! free runs:       (3,2)        (7,6)
//! ```
//!
//! A failed allocation is not an error: the caller simply retries once earlier areas
//! have been released.

use crate::error::ResourceError;
use crate::telemetry::{MonitoredResourceType, ResourceMonitor, ResourceUsageReport};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::time::Instant;

/// A reserved run of pages inside a [`StagingPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingArea {
    offset: u64,
    size: u64,
    first_page: u32,
    page_count: u32,
    allocated_at: Instant,
}

impl StagingArea {
    /// Byte offset of the area inside the pool.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of usable bytes (the requested size, not the page-rounded size).
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of pages reserved for this area.
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// When the area was reserved.
    pub fn allocated_at(&self) -> Instant {
        self.allocated_at
    }
}

#[derive(Debug)]
struct BlockState {
    /// Sorted, non-adjacent `(first_page, page_count)` runs.
    free_runs: Vec<(u32, u32)>,
    allocated_pages: u32,
    allocated_blocks: u32,
    peak_pages: u32,
}

/// Host-visible staging memory with a page-granular block allocator.
#[derive(Debug)]
pub struct StagingPool {
    label: Cow<'static, str>,
    total_size: u64,
    page_size: u64,
    page_count: u32,
    blocks: Mutex<BlockState>,
    memory: Mutex<Vec<u8>>,
}

impl StagingPool {
    /// Creates a pool of `total_size` bytes split into `page_size` pages.
    ///
    /// ## Errors
    /// * `ResourceError::InvalidSize` - the page size is not a power of two, or the
    ///   total size is zero or not a multiple of the page size.
    pub fn new(total_size: u64, page_size: u64) -> Result<Self, ResourceError> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(ResourceError::InvalidSize(page_size));
        }
        if total_size == 0 || total_size % page_size != 0 {
            return Err(ResourceError::InvalidSize(total_size));
        }
        let page_count = u32::try_from(total_size / page_size)
            .map_err(|_| ResourceError::InvalidSize(total_size))?;
        let memory_len =
            usize::try_from(total_size).map_err(|_| ResourceError::InvalidSize(total_size))?;

        log::info!(
            "Allocated staging pool of {} bytes, {} pages of {} bytes",
            total_size,
            page_count,
            page_size
        );

        Ok(Self {
            label: Cow::Borrowed("CopyStagingPool"),
            total_size,
            page_size,
            page_count,
            blocks: Mutex::new(BlockState {
                free_runs: vec![(0, page_count)],
                allocated_pages: 0,
                allocated_blocks: 0,
                peak_pages: 0,
            }),
            memory: Mutex::new(vec![0u8; memory_len]),
        })
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.total_size
    }

    /// Allocation granularity in bytes.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Reserves a contiguous area of at least `size` bytes.
    ///
    /// Returns `None` when `size` is zero, exceeds the pool, or no contiguous run is
    /// free right now.
    pub fn allocate(&self, size: u64, label: &str) -> Option<StagingArea> {
        if size == 0 || size > self.total_size {
            return None;
        }
        let pages = size.div_ceil(self.page_size) as u32;

        let mut state = self.blocks.lock();
        let slot = state.free_runs.iter().position(|&(_, count)| count >= pages);
        let Some(slot) = slot else {
            log::trace!(
                "Staging allocation of {size} bytes for '{label}' failed, {} pages in use",
                state.allocated_pages
            );
            return None;
        };

        let (first_page, count) = state.free_runs[slot];
        if count == pages {
            state.free_runs.remove(slot);
        } else {
            state.free_runs[slot] = (first_page + pages, count - pages);
        }
        state.allocated_pages += pages;
        state.allocated_blocks += 1;
        state.peak_pages = state.peak_pages.max(state.allocated_pages);

        log::trace!(
            "Allocated staging block of {size} bytes @ {} for '{label}', {} blocks allocated",
            first_page as u64 * self.page_size,
            state.allocated_blocks
        );

        Some(StagingArea {
            offset: first_page as u64 * self.page_size,
            size,
            first_page,
            page_count: pages,
            allocated_at: Instant::now(),
        })
    }

    /// Returns an area to the pool.
    pub fn free(&self, area: StagingArea) {
        debug_assert!(area.first_page + area.page_count <= self.page_count);

        let mut state = self.blocks.lock();
        let runs = &mut state.free_runs;
        let insert_at = runs.partition_point(|&(first, _)| first < area.first_page);
        debug_assert!(
            insert_at == runs.len() || runs[insert_at].0 >= area.first_page + area.page_count,
            "staging area freed twice"
        );
        runs.insert(insert_at, (area.first_page, area.page_count));

        // Merge with the following run, then with the preceding one.
        if insert_at + 1 < runs.len() {
            let (first, count) = runs[insert_at];
            let (next_first, next_count) = runs[insert_at + 1];
            if first + count == next_first {
                runs[insert_at].1 += next_count;
                runs.remove(insert_at + 1);
            }
        }
        if insert_at > 0 {
            let (prev_first, prev_count) = runs[insert_at - 1];
            let (first, count) = runs[insert_at];
            if prev_first + prev_count == first {
                runs[insert_at - 1].1 += count;
                runs.remove(insert_at);
            }
        }

        state.allocated_pages -= area.page_count;
        state.allocated_blocks -= 1;
        log::trace!(
            "Freed staging block of {} bytes @ {}, {} blocks allocated",
            area.size,
            area.offset,
            state.allocated_blocks
        );
    }

    /// Gives `write` mutable access to the bytes of `area`.
    pub fn write<R>(&self, area: &StagingArea, write: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut memory = self.memory.lock();
        let start = area.offset as usize;
        write(&mut memory[start..start + area.size as usize])
    }

    /// Gives `read` access to the bytes of `area`.
    pub fn read<R>(&self, area: &StagingArea, read: impl FnOnce(&[u8]) -> R) -> R {
        let memory = self.memory.lock();
        let start = area.offset as usize;
        read(&memory[start..start + area.size as usize])
    }

    /// Number of bytes currently reserved, rounded to whole pages.
    pub fn allocated_bytes(&self) -> u64 {
        self.blocks.lock().allocated_pages as u64 * self.page_size
    }

    /// Number of areas currently reserved.
    pub fn allocated_blocks(&self) -> u32 {
        self.blocks.lock().allocated_blocks
    }
}

impl ResourceMonitor for StagingPool {
    fn monitor_id(&self) -> Cow<'static, str> {
        self.label.clone()
    }

    fn resource_type(&self) -> MonitoredResourceType {
        MonitoredResourceType::StagingMemory
    }

    fn get_usage_report(&self) -> ResourceUsageReport {
        let state = self.blocks.lock();
        ResourceUsageReport {
            current_bytes: state.allocated_pages as u64 * self.page_size,
            peak_bytes: Some(state.peak_pages as u64 * self.page_size),
            total_capacity_bytes: Some(self.total_size),
        }
    }
}
