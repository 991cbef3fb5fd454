// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Property tests for the shared-memory arena allocator
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 property tests, 3 integration tests
//!
//! TEST_SCOPE:
//!   - Non-overlap of live allocations under arbitrary allocate/free interleavings
//!   - Exact free-space restoration after matched frees
//!   - All-or-nothing allocation failure
//!   - Region bring-up failures
//!
//! DEPENDENCIES:
//!   - nexus_shm::host::HostMapper: heap-backed mapper

use std::sync::Arc;

use nexus_shm::host::HostMapper;
use nexus_shm::{Arena, PhysAddr, ShmBuffer, ShmError, PAGE_SIZE};
use proptest::prelude::*;

const BASE: PhysAddr = PhysAddr::new(0x9000_0000);
const PAGES: usize = 32;

fn arena() -> Arena {
    Arena::init(Arc::new(HostMapper::new()), Some(BASE), Some(PAGES * PAGE_SIZE)).unwrap()
}

fn assert_disjoint(live: &[ShmBuffer]) {
    let mut ranges: Vec<(u32, u32)> = live
        .iter()
        .map(|b| (b.phys().as_u32(), b.phys().as_u32() + b.len() as u32))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlap between {:x?} and {:x?}", pair[0], pair[1]);
    }
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..3 * PAGE_SIZE).prop_map(Op::Alloc),
        any::<usize>().prop_map(Op::Free),
    ]
}

proptest! {
    #[test]
    fn live_allocations_never_overlap(ops in proptest::collection::vec(op(), 1..64)) {
        let arena = arena();
        let mut live: Vec<ShmBuffer> = Vec::new();
        for op in ops {
            match op {
                Op::Alloc(size) => {
                    let gap = arena.largest_gap();
                    match arena.allocate(size) {
                        Some(buf) => {
                            prop_assert!(buf.len() >= size);
                            prop_assert_eq!(buf.len() % PAGE_SIZE, 0);
                            live.push(buf);
                        }
                        None => prop_assert!(gap < size.next_multiple_of(PAGE_SIZE)),
                    }
                }
                Op::Free(pick) if !live.is_empty() => {
                    let buf = live.swap_remove(pick % live.len());
                    arena.release(buf);
                }
                Op::Free(_) => {}
            }
            assert_disjoint(&live);
            let used: usize = live.iter().map(ShmBuffer::len).sum();
            prop_assert_eq!(arena.free_bytes(), arena.capacity() - used);
        }
    }

    #[test]
    fn matched_free_restores_free_space(sizes in proptest::collection::vec(1usize..2 * PAGE_SIZE, 1..12)) {
        let arena = arena();
        let before = arena.free_bytes();
        let bufs: Vec<_> = sizes.iter().filter_map(|s| arena.allocate(*s)).collect();
        for buf in bufs.into_iter().rev() {
            arena.free(buf.phys(), buf.virt(), buf.len());
        }
        prop_assert_eq!(arena.free_bytes(), before);
        prop_assert_eq!(arena.allocation_count(), 0);
    }
}

#[test]
fn allocation_fails_without_single_gap() {
    let arena = arena();
    let bufs: Vec<_> = (0..PAGES).map(|_| arena.allocate(PAGE_SIZE).unwrap()).collect();
    for buf in bufs.iter().step_by(2) {
        arena.release(buf.clone());
    }
    assert_eq!(arena.free_bytes(), PAGES / 2 * PAGE_SIZE);
    assert!(arena.allocate(2 * PAGE_SIZE).is_none());
    assert!(arena.allocate(PAGE_SIZE).is_some());
}

#[test]
fn mapping_failure_is_resource_exhaustion() {
    let mapper = HostMapper::new();
    mapper.set_unavailable(true);
    let err = Arena::init(Arc::new(mapper), None, None).unwrap_err();
    assert!(matches!(err, ShmError::ResourceExhausted { .. }), "{err}");
}

#[test]
fn misaligned_region_rejected_and_teardown_unmaps() {
    let mapper = HostMapper::new();
    let err = Arena::init(Arc::new(mapper.clone()), Some(PhysAddr::new(0x9000_0010)), None)
        .unwrap_err();
    assert!(matches!(err, ShmError::InvalidRegion { .. }));

    let arena = Arena::init(Arc::new(mapper.clone()), None, None).unwrap();
    assert_eq!(mapper.mapped_windows(), 1);
    arena.teardown();
    assert_eq!(mapper.mapped_windows(), 0);
}
