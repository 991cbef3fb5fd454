// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Platform seam: mapping physical memory shared with the remote core.

use std::sync::Arc;

use crate::{PhysAddr, VirtAddr};

/// Failures reported by a [`PhysMapper`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The range is reserved, already mapped, or absent on this platform.
    #[error("physical range unavailable")]
    Unavailable,
    /// Address or size not representable by the mapper.
    #[error("mapping rejected: {0}")]
    Rejected(&'static str),
}

/// A mapped, non-cacheable view of shared physical memory.
///
/// Offsets are in bytes from the start of the window and must be word aligned.
/// Stores must become visible to the remote core without cache maintenance.
pub trait ShmWindow: Send + Sync {
    /// Physical base of the window.
    fn phys_base(&self) -> PhysAddr;

    /// Local virtual base of the window.
    fn virt_base(&self) -> VirtAddr;

    /// Window length in bytes.
    fn len(&self) -> usize;

    /// Returns `true` for a zero-length window.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads the 32-bit word at `offset`.
    fn load(&self, offset: usize) -> u32;

    /// Writes the 32-bit word at `offset`.
    fn store(&self, offset: usize, value: u32);
}

/// Maps and unmaps physical ranges as non-cacheable memory.
pub trait PhysMapper: Send + Sync {
    /// Maps `size` bytes starting at `phys`.
    fn map_non_cacheable(
        &self,
        phys: PhysAddr,
        size: usize,
    ) -> core::result::Result<Arc<dyn ShmWindow>, MapError>;

    /// Releases a window previously returned by [`PhysMapper::map_non_cacheable`].
    fn unmap(&self, window: &Arc<dyn ShmWindow>);
}
