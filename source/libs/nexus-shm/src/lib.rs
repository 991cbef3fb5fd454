// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory arena for cross-core command blocks
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + proptest (host)
//!
//! PUBLIC API:
//!   - Arena: first-fit, page-granular allocator over one mapped region
//!   - ShmBuffer / ShmBlock: word views into arena memory
//!   - PhysMapper / ShmWindow: seam for non-cacheable physical mappings
//!   - PhysAddr / VirtAddr: address newtypes
//!
//! DEPENDENCIES:
//!   - parking_lot::Mutex: allocation list lock
//!   - log: diagnostics for unmatched frees and leaked allocations
//!
//! INVARIANTS:
//!   - Live allocations never overlap
//!   - Allocation failure never yields a partially valid buffer
//!   - The mapped region is the only memory handed out

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod addr;
mod arena;
mod window;

#[cfg(feature = "backend-host")]
pub mod host;

pub use addr::{pages_for, PhysAddr, VirtAddr, PAGE_SIZE};
pub use arena::{Arena, ShmBlock, ShmBuffer, DEFAULT_SHM_BASE, DEFAULT_SHM_SIZE};
pub use window::{MapError, PhysMapper, ShmWindow};

/// Result alias for arena operations.
pub type Result<T> = core::result::Result<T, ShmError>;

/// Errors produced while bringing up or tearing down the arena.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// The platform refused to map the requested physical range.
    #[error("cannot map shared region {phys}+{size:#x}: {source}")]
    ResourceExhausted {
        /// Requested physical base.
        phys: PhysAddr,
        /// Requested size in bytes.
        size: usize,
        /// Failure reported by the mapper.
        source: MapError,
    },
    /// Base or size violate page granularity or the 32-bit physical window.
    #[error("invalid shared region {base}+{size:#x}")]
    InvalidRegion {
        /// Requested physical base.
        base: PhysAddr,
        /// Requested size in bytes.
        size: usize,
    },
}
