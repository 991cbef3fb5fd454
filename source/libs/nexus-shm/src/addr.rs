// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

/// Allocation granularity of the arena.
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `bytes`.
pub const fn pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

/// Physical address as seen by the remote core (32-bit bus).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(u32);

impl PhysAddr {
    /// Wraps a raw bus address.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw bus address, suitable for a notification payload word.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `self + bytes`, or `None` when the result leaves the 32-bit bus.
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        let bytes = u32::try_from(bytes).ok()?;
        self.0.checked_add(bytes).map(Self)
    }

    /// Byte distance from `base` when `self >= base`.
    pub fn offset_from(self, base: PhysAddr) -> Option<usize> {
        self.0.checked_sub(base.0).map(|d| d as usize)
    }

    /// Returns `true` when the address sits on a page boundary.
    pub const fn is_page_aligned(self) -> bool {
        (self.0 as usize) % PAGE_SIZE == 0
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Local virtual address of a mapped window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Wraps a raw virtual address.
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    /// Raw virtual address.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `self + bytes` if it does not overflow.
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
