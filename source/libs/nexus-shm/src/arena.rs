// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: First-fit page allocator over the shared region
//! OWNERS: @runtime
//!
//! The allocation list is kept sorted by physical address so the first-fit scan
//! walks the gaps in ascending order. The list only answers "where is free
//! memory"; request identity lives with the channel registry.

use core::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{pages_for, MapError, PhysAddr, PhysMapper, Result, ShmError, ShmWindow, VirtAddr, PAGE_SIZE};

/// Platform default physical base of the shared region.
pub const DEFAULT_SHM_BASE: PhysAddr = PhysAddr::new(0xA000_0000);
/// Platform default size of the shared region.
pub const DEFAULT_SHM_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Allocation {
    first_page: usize,
    pages: usize,
}

impl Allocation {
    const fn end(&self) -> usize {
        self.first_page + self.pages
    }
}

struct ArenaState {
    allocations: Vec<Allocation>,
    mapped: bool,
}

/// Page-granular allocator over one non-cacheable region shared with the remote core.
pub struct Arena {
    mapper: Arc<dyn PhysMapper>,
    window: Arc<dyn ShmWindow>,
    phys_base: PhysAddr,
    virt_base: VirtAddr,
    pages: usize,
    state: Mutex<ArenaState>,
}

impl Arena {
    /// Maps the shared region and returns an empty arena.
    ///
    /// `base` and `size` fall back to [`DEFAULT_SHM_BASE`] and [`DEFAULT_SHM_SIZE`].
    pub fn init(
        mapper: Arc<dyn PhysMapper>,
        base: Option<PhysAddr>,
        size: Option<usize>,
    ) -> Result<Self> {
        let base = base.unwrap_or(DEFAULT_SHM_BASE);
        let size = size.unwrap_or(DEFAULT_SHM_SIZE);
        let fits_bus = size.checked_sub(1).and_then(|last| base.checked_add(last)).is_some();
        if !fits_bus || !base.is_page_aligned() || size % PAGE_SIZE != 0 {
            return Err(ShmError::InvalidRegion { base, size });
        }

        let window = mapper
            .map_non_cacheable(base, size)
            .map_err(|source| ShmError::ResourceExhausted { phys: base, size, source })?;
        if window.len() < size {
            mapper.unmap(&window);
            return Err(ShmError::ResourceExhausted {
                phys: base,
                size,
                source: MapError::Rejected("short mapping"),
            });
        }

        let virt_base = window.virt_base();
        info!("shm: mapped {base}+{size:#x} at {virt_base}");
        Ok(Self {
            mapper,
            window,
            phys_base: base,
            virt_base,
            pages: size / PAGE_SIZE,
            state: Mutex::new(ArenaState { allocations: Vec::new(), mapped: true }),
        })
    }

    /// Allocates `size` bytes rounded up to whole pages.
    ///
    /// Returns `None` when `size` is zero, the arena is torn down, or no single gap is
    /// large enough.
    pub fn allocate(&self, size: usize) -> Option<ShmBuffer> {
        let pages = pages_for(size);
        if pages == 0 {
            debug!("shm: zero-sized allocation refused");
            return None;
        }

        let mut state = self.state.lock();
        if !state.mapped {
            warn!("shm: allocation after teardown");
            return None;
        }
        let Some((index, first_page)) = first_fit(&state.allocations, self.pages, pages) else {
            debug!("shm: no gap of {pages} pages (arena has {} pages)", self.pages);
            return None;
        };
        state.allocations.insert(index, Allocation { first_page, pages });
        drop(state);

        Some(self.buffer_at(first_page, pages))
    }

    /// Frees the allocation whose range contains `phys`.
    ///
    /// Unknown addresses are ignored with a diagnostic.
    pub fn free(&self, phys: PhysAddr, virt: VirtAddr, size: usize) {
        let Some(page) = phys
            .offset_from(self.phys_base)
            .map(|offset| offset / PAGE_SIZE)
            .filter(|page| *page < self.pages)
        else {
            warn!("shm: free of {phys} outside the arena");
            return;
        };

        let mut state = self.state.lock();
        let index = state.allocations.partition_point(|a| a.end() <= page);
        let found = state.allocations.get(index).filter(|a| a.first_page <= page).copied();
        let Some(allocation) = found else {
            warn!("shm: free of {phys} matches no allocation");
            return;
        };
        state.allocations.remove(index);
        drop(state);

        let start_virt = self.virt_base.checked_add(allocation.first_page * PAGE_SIZE);
        let phys_virt = self.virt_base.checked_add(page * PAGE_SIZE);
        if Some(virt) != start_virt && Some(virt) != phys_virt {
            warn!("shm: free of {phys} with mismatched virtual address {virt}");
        }
        if pages_for(size) != allocation.pages {
            debug!(
                "shm: free of {phys} released {} pages, caller passed {size:#x} bytes",
                allocation.pages
            );
        }
    }

    /// Frees a buffer returned by [`Arena::allocate`].
    pub fn release(&self, buffer: ShmBuffer) {
        self.free(buffer.phys(), buffer.virt(), buffer.len());
    }

    /// Drops every remaining allocation and unmaps the region. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        if !state.mapped {
            return;
        }
        if !state.allocations.is_empty() {
            warn!("shm: teardown with {} live allocations", state.allocations.len());
        }
        state.allocations.clear();
        state.mapped = false;
        drop(state);

        self.mapper.unmap(&self.window);
        info!("shm: unmapped {}", self.phys_base);
    }

    /// Physical base of the region.
    pub fn phys_base(&self) -> PhysAddr {
        self.phys_base
    }

    /// Virtual base of the region.
    pub fn virt_base(&self) -> VirtAddr {
        self.virt_base
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    /// Bytes not covered by any live allocation.
    pub fn free_bytes(&self) -> usize {
        let used: usize = self.state.lock().allocations.iter().map(|a| a.pages).sum();
        (self.pages - used) * PAGE_SIZE
    }

    /// Size in bytes of the largest single gap.
    pub fn largest_gap(&self) -> usize {
        let state = self.state.lock();
        let mut cursor = 0;
        let mut largest = 0;
        for allocation in &state.allocations {
            largest = largest.max(allocation.first_page - cursor);
            cursor = allocation.end();
        }
        largest.max(self.pages - cursor) * PAGE_SIZE
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    fn buffer_at(&self, first_page: usize, pages: usize) -> ShmBuffer {
        let offset = first_page * PAGE_SIZE;
        // Region bounds were validated against the 32-bit bus in `init`.
        let phys = PhysAddr::new(self.phys_base.as_u32().wrapping_add(offset as u32));
        let virt = VirtAddr::new(self.virt_base.as_usize().wrapping_add(offset));
        ShmBuffer {
            block: ShmBlock { window: Arc::clone(&self.window), offset, phys, len: pages * PAGE_SIZE },
            virt,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("phys_base", &self.phys_base)
            .field("pages", &self.pages)
            .field("allocations", &self.allocation_count())
            .finish()
    }
}

/// Returns the insertion index and first page of the lowest gap holding `pages`.
fn first_fit(allocations: &[Allocation], total: usize, pages: usize) -> Option<(usize, usize)> {
    let mut cursor = 0;
    for (index, allocation) in allocations.iter().enumerate() {
        if allocation.first_page - cursor >= pages {
            return Some((index, cursor));
        }
        cursor = allocation.end();
    }
    (total - cursor >= pages).then_some((allocations.len(), cursor))
}

/// An allocation handed out by [`Arena::allocate`].
///
/// Buffers are not freed on drop; pass them back through [`Arena::release`].
#[derive(Clone)]
pub struct ShmBuffer {
    block: ShmBlock,
    virt: VirtAddr,
}

impl ShmBuffer {
    /// Physical address of the first byte.
    pub fn phys(&self) -> PhysAddr {
        self.block.phys
    }

    /// Virtual address of the first byte.
    pub fn virt(&self) -> VirtAddr {
        self.virt
    }

    /// Length in bytes (a whole number of pages).
    pub fn len(&self) -> usize {
        self.block.len
    }

    /// Always `false`; the arena never hands out empty buffers.
    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    /// Word view over the whole buffer.
    pub fn as_block(&self) -> &ShmBlock {
        &self.block
    }

    /// Word view over `len` bytes starting `offset` bytes into the buffer.
    pub fn block(&self, offset: usize, len: usize) -> Option<ShmBlock> {
        self.block.sub_block(offset, len)
    }
}

impl fmt::Debug for ShmBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBuffer")
            .field("phys", &self.block.phys)
            .field("virt", &self.virt)
            .field("len", &self.block.len)
            .finish()
    }
}

/// Word-addressed view of a range of shared memory.
#[derive(Clone)]
pub struct ShmBlock {
    window: Arc<dyn ShmWindow>,
    offset: usize,
    phys: PhysAddr,
    len: usize,
}

impl ShmBlock {
    /// Physical address of word 0.
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` for an empty block.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of 32-bit words in the block.
    pub fn words(&self) -> usize {
        self.len / 4
    }

    /// Reads word `index`.
    pub fn read(&self, index: usize) -> u32 {
        debug_assert!(index < self.words(), "word {index} outside block of {}", self.words());
        self.window.load(self.offset + index * 4)
    }

    /// Writes word `index`.
    pub fn write(&self, index: usize, value: u32) {
        debug_assert!(index < self.words(), "word {index} outside block of {}", self.words());
        self.window.store(self.offset + index * 4, value);
    }

    /// Writes `value` to every word.
    pub fn fill(&self, value: u32) {
        for index in 0..self.words() {
            self.write(index, value);
        }
    }

    /// Narrows the view to `len` bytes at byte `offset`; both must be word aligned.
    pub fn sub_block(&self, offset: usize, len: usize) -> Option<ShmBlock> {
        if offset % 4 != 0 || len % 4 != 0 || offset.checked_add(len)? > self.len {
            return None;
        }
        Some(ShmBlock {
            window: Arc::clone(&self.window),
            offset: self.offset + offset,
            phys: self.phys.checked_add(offset)?,
            len,
        })
    }
}

impl fmt::Debug for ShmBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmBlock").field("phys", &self.phys).field("len", &self.len).finish()
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::HostMapper;

    fn arena(pages: usize) -> Arena {
        let mapper = Arc::new(HostMapper::new());
        Arena::init(mapper, Some(PhysAddr::new(0x8000_0000)), Some(pages * PAGE_SIZE))
            .expect("arena maps")
    }

    #[test]
    fn first_fit_reuses_lowest_gap() {
        let arena = arena(8);
        let a = arena.allocate(PAGE_SIZE).unwrap();
        let b = arena.allocate(2 * PAGE_SIZE).unwrap();
        let c = arena.allocate(PAGE_SIZE).unwrap();
        assert_eq!(a.phys(), PhysAddr::new(0x8000_0000));
        assert_eq!(b.phys(), PhysAddr::new(0x8000_1000));
        assert_eq!(c.phys(), PhysAddr::new(0x8000_3000));

        arena.release(b);
        let d = arena.allocate(10).unwrap();
        assert_eq!(d.phys(), PhysAddr::new(0x8000_1000));
        assert_eq!(d.len(), PAGE_SIZE);
    }

    #[test]
    fn fragmentation_blocks_large_request() {
        let arena = arena(4);
        let bufs: Vec<_> = (0..4).map(|_| arena.allocate(PAGE_SIZE).unwrap()).collect();
        arena.release(bufs[0].clone());
        arena.release(bufs[2].clone());
        assert_eq!(arena.free_bytes(), 2 * PAGE_SIZE);
        assert_eq!(arena.largest_gap(), PAGE_SIZE);
        assert!(arena.allocate(2 * PAGE_SIZE).is_none());
        assert_eq!(arena.allocation_count(), 2);
    }

    #[test]
    fn free_by_interior_address() {
        let arena = arena(4);
        let buf = arena.allocate(3 * PAGE_SIZE).unwrap();
        let inner = buf.phys().checked_add(PAGE_SIZE + 8).unwrap();
        arena.free(inner, buf.virt(), buf.len());
        assert_eq!(arena.allocation_count(), 0);
        assert_eq!(arena.free_bytes(), arena.capacity());
    }

    #[test]
    fn unmatched_free_is_a_noop() {
        let arena = arena(4);
        let buf = arena.allocate(PAGE_SIZE).unwrap();
        arena.free(PhysAddr::new(0x8000_3000), VirtAddr::new(0), PAGE_SIZE);
        arena.free(PhysAddr::new(0x1000), VirtAddr::new(0), PAGE_SIZE);
        assert_eq!(arena.allocation_count(), 1);
        arena.release(buf);
    }

    #[test]
    fn zero_size_and_teardown_refuse() {
        let arena = arena(2);
        assert!(arena.allocate(0).is_none());
        let _live = arena.allocate(1).unwrap();
        arena.teardown();
        assert!(arena.allocate(1).is_none());
        arena.teardown();
    }

    #[test]
    fn blocks_read_back_writes() {
        let arena = arena(1);
        let buf = arena.allocate(64).unwrap();
        let block = buf.block(16, 16).unwrap();
        block.write(0, 0xdead_beef);
        assert_eq!(buf.as_block().read(4), 0xdead_beef);
        assert_eq!(block.phys(), buf.phys().checked_add(16).unwrap());
        assert!(buf.block(4090, 8).is_none());
        assert!(buf.block(2, 4).is_none());
    }
}
