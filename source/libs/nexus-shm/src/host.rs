// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Heap-backed physical memory for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - struct HostMapper: PhysMapper handing out heap windows at fake bus addresses
//!   - struct PhysView: bus-side accessor used by simulated remote firmware
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code; shared words are atomics
//!   - Overlapping mappings are refused
//!   - Accesses outside any mapping read as `None` and are dropped on write

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use crate::{MapError, PhysAddr, PhysMapper, ShmWindow, VirtAddr, PAGE_SIZE};

const HOST_VIRT_BASE: usize = 0x1000_0000;

/// Heap-backed window; every word is an atomic so both "cores" may touch it.
pub struct HostWindow {
    phys: PhysAddr,
    virt: VirtAddr,
    words: Box<[AtomicU32]>,
}

impl HostWindow {
    fn contains(&self, phys: PhysAddr) -> Option<usize> {
        phys.offset_from(self.phys).filter(|offset| *offset < self.words.len() * 4)
    }

    fn overlaps(&self, phys: PhysAddr, size: usize) -> bool {
        let start = u64::from(self.phys.as_u32());
        let end = start + (self.words.len() * 4) as u64;
        let other_start = u64::from(phys.as_u32());
        let other_end = other_start + size as u64;
        start < other_end && other_start < end
    }
}

impl ShmWindow for HostWindow {
    fn phys_base(&self) -> PhysAddr {
        self.phys
    }

    fn virt_base(&self) -> VirtAddr {
        self.virt
    }

    fn len(&self) -> usize {
        self.words.len() * 4
    }

    fn load(&self, offset: usize) -> u32 {
        self.words.get(offset / 4).map_or(0, |word| word.load(Ordering::Acquire))
    }

    fn store(&self, offset: usize, value: u32) {
        if let Some(word) = self.words.get(offset / 4) {
            word.store(value, Ordering::Release);
        }
    }
}

#[derive(Default)]
struct HostState {
    windows: Vec<Arc<HostWindow>>,
    next_virt: usize,
    unavailable: bool,
}

/// [`PhysMapper`] backed by heap allocations.
#[derive(Clone, Default)]
pub struct HostMapper {
    state: Arc<Mutex<HostState>>,
}

impl HostMapper {
    /// Creates a mapper with no live windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent mapping attempt fail with [`MapError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of windows currently mapped.
    pub fn mapped_windows(&self) -> usize {
        self.state.lock().windows.len()
    }

    /// Returns a bus-side accessor for the mapped memory.
    pub fn phys_view(&self) -> PhysView {
        PhysView { state: Arc::clone(&self.state) }
    }
}

impl PhysMapper for HostMapper {
    fn map_non_cacheable(
        &self,
        phys: PhysAddr,
        size: usize,
    ) -> core::result::Result<Arc<dyn ShmWindow>, MapError> {
        let mut state = self.state.lock();
        if state.unavailable {
            return Err(MapError::Unavailable);
        }
        if size == 0 || size % 4 != 0 {
            return Err(MapError::Rejected("size must be a non-zero multiple of 4"));
        }
        if state.windows.iter().any(|w| w.overlaps(phys, size)) {
            return Err(MapError::Unavailable);
        }

        let virt = VirtAddr::new(HOST_VIRT_BASE + state.next_virt);
        // Leave a guard page between windows so stray virtual math is visible in logs.
        state.next_virt += size.next_multiple_of(PAGE_SIZE) + PAGE_SIZE;
        let words = (0..size / 4).map(|_| AtomicU32::new(0)).collect();
        let window = Arc::new(HostWindow { phys, virt, words });
        state.windows.push(Arc::clone(&window));
        Ok(window)
    }

    fn unmap(&self, window: &Arc<dyn ShmWindow>) {
        let mut state = self.state.lock();
        let before = state.windows.len();
        state.windows.retain(|w| w.phys != window.phys_base());
        if state.windows.len() == before {
            warn!("host-shm: unmap of unknown window {}", window.phys_base());
        }
    }
}

/// Bus-side access to host "physical" memory, as the remote core would see it.
#[derive(Clone)]
pub struct PhysView {
    state: Arc<Mutex<HostState>>,
}

impl PhysView {
    /// Reads the word at `phys`, or `None` if nothing is mapped there.
    pub fn read(&self, phys: PhysAddr) -> Option<u32> {
        let (window, offset) = self.locate(phys)?;
        Some(window.load(offset))
    }

    /// Writes the word at `phys`; returns `false` if nothing is mapped there.
    pub fn write(&self, phys: PhysAddr, value: u32) -> bool {
        match self.locate(phys) {
            Some((window, offset)) => {
                window.store(offset, value);
                true
            }
            None => false,
        }
    }

    /// Reads word `index` of the block starting at `base`.
    pub fn read_word(&self, base: PhysAddr, index: usize) -> Option<u32> {
        self.read(base.checked_add(index * 4)?)
    }

    /// Writes word `index` of the block starting at `base`.
    pub fn write_word(&self, base: PhysAddr, index: usize, value: u32) -> bool {
        base.checked_add(index * 4).is_some_and(|phys| self.write(phys, value))
    }

    fn locate(&self, phys: PhysAddr) -> Option<(Arc<HostWindow>, usize)> {
        let state = self.state.lock();
        state.windows.iter().find_map(|w| w.contains(phys).map(|offset| (Arc::clone(w), offset)))
    }
}
