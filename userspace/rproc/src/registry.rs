// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fixed pool of channel control blocks
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host arena)
//!
//! Every slot owns one arena allocation carved into its envelope, callback block
//! and five parameter blocks. The pool size and the envelope index are fixed at
//! init; only per-slot state changes afterwards.
//!
//! INVARIANTS:
//!   - A handle is valid only while pool id, index and generation match an in-use slot
//!   - Generations bump on acquire and on release
//!   - Sequence numbers survive release so a late ack never matches a new request

use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nexus_shm::{Arena, ShmBuffer};
use parking_lot::{Mutex, MutexGuard};

use crate::firmware::FirmwareVersion;
use crate::transport::{EventKey, LineId, ProcId};
use crate::wait::Doorbell;
use crate::wire::{
    layout, CallbackBlock, Envelope, ParamBlock, CALLBACK_BYTES, CHANNEL_BYTES, ENVELOPE_BYTES,
    HANDLE_NONE, PARAM_BLOCK_BYTES,
};
use crate::{ChannelState, Error, Resource, Result, Verb};

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Generation-checked reference to a pooled channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pool: u32,
    index: u16,
    generation: u32,
}

impl ChannelHandle {
    /// Slot index inside the pool.
    pub fn index(self) -> usize {
        usize::from(self.index)
    }

    /// Slot generation the handle was issued for.
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}.g{}", self.index, self.generation)
    }
}

/// Kind of a remote-initiated channel event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackKind {
    /// Frames completed.
    Complete,
    /// Driver reported an error.
    Error,
}

/// Event passed to an application callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallbackEvent {
    /// What happened.
    pub kind: CallbackKind,
    /// Kind-specific word written by the remote.
    pub aux: u32,
}

/// Application callback; runs in notification context.
pub type CallbackFn = Arc<dyn Fn(ChannelHandle, CallbackEvent) + Send + Sync>;

/// Callbacks attached to an open channel.
#[derive(Clone)]
pub struct AppCallbacks {
    pub(crate) on_complete: CallbackFn,
    pub(crate) on_error: Option<CallbackFn>,
}

impl AppCallbacks {
    /// Callbacks with a completion handler only; error events are rejected.
    pub fn new(on_complete: impl Fn(ChannelHandle, CallbackEvent) + Send + Sync + 'static) -> Self {
        Self { on_complete: Arc::new(on_complete), on_error: None }
    }

    /// Adds an error handler.
    pub fn with_error(
        mut self,
        on_error: impl Fn(ChannelHandle, CallbackEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    pub(crate) fn for_kind(&self, kind: CallbackKind) -> Option<&CallbackFn> {
        match kind {
            CallbackKind::Complete => Some(&self.on_complete),
            CallbackKind::Error => self.on_error.as_ref(),
        }
    }
}

impl fmt::Debug for AppCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCallbacks").field("on_error", &self.on_error.is_some()).finish()
    }
}

/// Shared-memory blocks wired to one slot.
pub(crate) struct ChannelBlocks {
    buffer: ShmBuffer,
    pub envelope: Envelope,
    pub callback: CallbackBlock,
    create: ParamBlock,
    delete: ParamBlock,
    control: ParamBlock,
    queue: ParamBlock,
    dequeue: ParamBlock,
}

impl ChannelBlocks {
    fn carve(buffer: ShmBuffer) -> core::result::Result<Self, ShmBuffer> {
        let param = |offset| buffer.block(offset, PARAM_BLOCK_BYTES).map(ParamBlock::new);
        let carved = (|| {
            Some((
                Envelope::new(buffer.block(layout::ENVELOPE, ENVELOPE_BYTES)?),
                CallbackBlock::new(buffer.block(layout::CALLBACK, CALLBACK_BYTES)?),
                [
                    param(layout::CREATE)?,
                    param(layout::DELETE)?,
                    param(layout::CONTROL)?,
                    param(layout::QUEUE)?,
                    param(layout::DEQUEUE)?,
                ],
            ))
        })();
        match carved {
            Some((envelope, callback, [create, delete, control, queue, dequeue])) => Ok(Self {
                buffer,
                envelope,
                callback,
                create,
                delete,
                control,
                queue,
                dequeue,
            }),
            None => Err(buffer),
        }
    }

    pub fn param(&self, verb: Verb) -> &ParamBlock {
        match verb {
            Verb::Create => &self.create,
            Verb::Delete => &self.delete,
            Verb::Control => &self.control,
            Verb::Queue => &self.queue,
            Verb::Dequeue => &self.dequeue,
        }
    }
}

/// Mutable part of a slot.
pub(crate) struct SlotState {
    pub in_use: bool,
    pub generation: u32,
    pub state: ChannelState,
    pub remote_handle: u32,
    pub proc_id: ProcId,
    pub line_id: LineId,
    pub event_id: Option<u32>,
    /// Event key registered with the transport, if any.
    pub route: Option<EventKey>,
    pub seq: u32,
    pub firmware: FirmwareVersion,
    pub callbacks: Option<AppCallbacks>,
}

impl SlotState {
    /// Next request sequence; never 0.
    pub fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        if self.seq == 0 {
            self.seq = 1;
        }
        self.seq
    }

    fn clear_transient(&mut self) {
        self.state = ChannelState::Free;
        self.remote_handle = HANDLE_NONE;
        self.event_id = None;
        self.route = None;
        self.callbacks = None;
    }
}

/// One pooled channel.
pub(crate) struct Slot {
    pub blocks: ChannelBlocks,
    pub doorbell: Doorbell,
    state: Mutex<SlotState>,
}

impl Slot {
    /// Locks the slot if `handle` still names it.
    pub fn lock_valid(&self, handle: ChannelHandle) -> Result<MutexGuard<'_, SlotState>> {
        let state = self.state.lock();
        if state.in_use && state.generation == handle.generation {
            Ok(state)
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

/// Fixed-capacity channel pool backed by the arena.
pub(crate) struct ChannelRegistry {
    id: u32,
    arena: Arc<Arena>,
    slots: Box<[Slot]>,
    /// Serialises the acquire scan; `false` once torn down.
    live: Mutex<bool>,
    by_envelope: HashMap<u32, usize>,
    firmware: AtomicU32,
}

impl ChannelRegistry {
    /// Carves `capacity` channels out of `arena`.
    pub fn init(arena: Arc<Arena>, capacity: usize) -> Result<Self> {
        if capacity == 0 || capacity > usize::from(u16::MAX) {
            return Err(Error::ResourceExhausted(Resource::ChannelPool));
        }

        let mut slots: Vec<Slot> = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let carved = arena.allocate(CHANNEL_BYTES).map(ChannelBlocks::carve);
            let blocks = match carved {
                Some(Ok(blocks)) => blocks,
                failed => {
                    if let Some(Err(buffer)) = failed {
                        arena.release(buffer);
                    }
                    warn!("rproc: arena holds only {index} of {capacity} channels");
                    for slot in slots {
                        arena.release(slot.blocks.buffer);
                    }
                    return Err(Error::ResourceExhausted(Resource::Arena));
                }
            };
            blocks.callback.clear();
            slots.push(Slot {
                blocks,
                doorbell: Doorbell::new(),
                state: Mutex::new(SlotState {
                    in_use: false,
                    generation: 0,
                    state: ChannelState::Free,
                    remote_handle: HANDLE_NONE,
                    proc_id: 0,
                    line_id: 0,
                    event_id: None,
                    route: None,
                    seq: 0,
                    firmware: FirmwareVersion::from_raw(0),
                    callbacks: None,
                }),
            });
        }

        let by_envelope = slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (slot.blocks.envelope.phys().as_u32(), index))
            .collect();
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!("rproc: pool {id} wired {capacity} channels");
        Ok(Self {
            id,
            arena,
            slots: slots.into_boxed_slice(),
            live: Mutex::new(true),
            by_envelope,
            firmware: AtomicU32::new(0),
        })
    }

    /// Claims the first free slot for processor `proc_id`/`line_id`.
    pub fn acquire(&self, proc_id: ProcId, line_id: LineId) -> Option<ChannelHandle> {
        let live = self.live.lock();
        if !*live {
            return None;
        }
        for (index, slot) in self.slots.iter().enumerate() {
            let mut state = slot.state.lock();
            if state.in_use {
                continue;
            }
            state.clear_transient();
            state.in_use = true;
            state.generation = state.generation.wrapping_add(1);
            state.state = ChannelState::Creating;
            state.proc_id = proc_id;
            state.line_id = line_id;
            state.firmware = FirmwareVersion::from_raw(self.firmware.load(Ordering::Acquire));
            slot.blocks.callback.clear();
            return Some(self.handle(index, state.generation));
        }
        None
    }

    /// Returns the slot to the pool. Returns `false` for invalid handles.
    pub fn release(&self, handle: ChannelHandle) -> bool {
        let Ok(slot) = self.slot(handle) else {
            return false;
        };
        let Ok(mut state) = slot.lock_valid(handle) else {
            return false;
        };
        state.clear_transient();
        state.in_use = false;
        state.generation = state.generation.wrapping_add(1);
        true
    }

    pub fn validate(&self, handle: ChannelHandle) -> bool {
        self.slot(handle).is_ok_and(|slot| slot.lock_valid(handle).is_ok())
    }

    /// Slot named by `handle`; the generation is checked by [`Slot::lock_valid`].
    pub fn slot(&self, handle: ChannelHandle) -> Result<&Slot> {
        if handle.pool != self.id {
            return Err(Error::InvalidHandle);
        }
        self.slots.get(handle.index()).ok_or(Error::InvalidHandle)
    }

    pub fn slot_by_envelope(&self, phys: u32) -> Option<&Slot> {
        self.by_envelope.get(&phys).and_then(|index| self.slots.get(*index))
    }

    /// Finds the in-use channel registered on `key` whose callback block is `payload`.
    pub fn find_route(
        &self,
        key: EventKey,
        payload: u32,
    ) -> Option<(ChannelHandle, &Slot, Option<AppCallbacks>)> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            let state = slot.state.lock();
            let matches = state.in_use
                && state.route == Some(key)
                && slot.blocks.callback.phys().as_u32() == payload;
            matches.then(|| (self.handle(index, state.generation), slot, state.callbacks.clone()))
        })
    }

    pub fn in_use_handles(&self) -> Vec<ChannelHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let state = slot.state.lock();
                state.in_use.then(|| self.handle(index, state.generation))
            })
            .collect()
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.state.lock().in_use).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Firmware version stamped on channels acquired from now on.
    pub fn set_firmware(&self, version: FirmwareVersion) {
        self.firmware.store(version.raw(), Ordering::Release);
    }

    /// Frees every slot's memory back to the arena. Idempotent.
    pub fn teardown(&self) {
        let mut live = self.live.lock();
        if !*live {
            return;
        }
        *live = false;
        for slot in self.slots.iter() {
            let mut state = slot.state.lock();
            if state.in_use {
                state.clear_transient();
                state.in_use = false;
                state.generation = state.generation.wrapping_add(1);
            }
            self.arena.release(slot.blocks.buffer.clone());
        }
        debug!("rproc: pool {} torn down", self.id);
    }

    fn handle(&self, index: usize, generation: u32) -> ChannelHandle {
        // `init` caps the pool at u16::MAX slots.
        ChannelHandle { pool: self.id, index: index as u16, generation }
    }
}

impl Drop for ChannelRegistry {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use nexus_shm::host::HostMapper;
    use nexus_shm::PAGE_SIZE;
    use proptest::prelude::*;

    use super::*;

    fn registry(pages: usize, capacity: usize) -> (Arc<Arena>, Result<ChannelRegistry>) {
        let arena = Arc::new(
            Arena::init(Arc::new(HostMapper::new()), None, Some(pages * PAGE_SIZE)).unwrap(),
        );
        let registry = ChannelRegistry::init(Arc::clone(&arena), capacity);
        (arena, registry)
    }

    #[test]
    fn acquire_until_exhausted_then_reuse() {
        let (_arena, registry) = registry(4, 2);
        let registry = registry.unwrap();
        let a = registry.acquire(1, 0).unwrap();
        let b = registry.acquire(1, 0).unwrap();
        assert_ne!(a.index(), b.index());
        assert!(registry.acquire(1, 0).is_none());

        assert!(registry.release(a));
        assert!(!registry.validate(a));
        let c = registry.acquire(1, 0).unwrap();
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(!registry.release(a));
    }

    #[test]
    fn pool_larger_than_arena_frees_partial_allocations() {
        let (arena, registry) = registry(3, 4);
        assert!(matches!(registry, Err(Error::ResourceExhausted(Resource::Arena))));
        assert_eq!(arena.allocation_count(), 0);
    }

    #[test]
    fn envelope_index_and_foreign_handles() {
        let (_arena, first) = registry(4, 2);
        let first = first.unwrap();
        let (_other_arena, second) = registry(4, 2);
        let second = second.unwrap();

        let handle = first.acquire(1, 0).unwrap();
        assert!(!second.validate(handle));
        let envelope = first.slot(handle).unwrap().blocks.envelope.phys().as_u32();
        assert!(first.slot_by_envelope(envelope).is_some());
        assert!(first.slot_by_envelope(envelope + 4).is_none());
    }

    #[test]
    fn sequence_survives_release() {
        let (_arena, registry) = registry(2, 1);
        let registry = registry.unwrap();
        let a = registry.acquire(1, 0).unwrap();
        let first = registry.slot(a).unwrap().lock_valid(a).unwrap().next_seq();
        registry.release(a);
        let b = registry.acquire(1, 0).unwrap();
        let second = registry.slot(b).unwrap().lock_valid(b).unwrap().next_seq();
        assert!(second > first);
    }

    proptest! {
        #[test]
        fn live_handles_stay_unique(ops in prop::collection::vec(prop::option::of(0usize..8), 1..64)) {
            let (_arena, registry) = registry(8, 4);
            let registry = registry.unwrap();
            let mut live: Vec<ChannelHandle> = Vec::new();
            let mut retired: Vec<ChannelHandle> = Vec::new();
            for op in ops {
                match op {
                    None => match registry.acquire(1, 0) {
                        Some(handle) => live.push(handle),
                        None => prop_assert_eq!(live.len(), registry.capacity()),
                    },
                    Some(pick) if !live.is_empty() => {
                        let handle = live.swap_remove(pick % live.len());
                        prop_assert!(registry.release(handle));
                        retired.push(handle);
                    }
                    Some(_) => {}
                }
                let mut indices: Vec<usize> = live.iter().map(|h| h.index()).collect();
                indices.sort_unstable();
                indices.dedup();
                prop_assert_eq!(indices.len(), live.len());
                prop_assert!(live.iter().all(|h| registry.validate(*h)));
                prop_assert!(retired.iter().all(|h| !registry.validate(*h)));
            }
        }
    }

    #[test]
    fn teardown_returns_memory() {
        let (arena, registry) = registry(4, 3);
        let registry = registry.unwrap();
        assert_eq!(arena.allocation_count(), 3);
        registry.acquire(1, 0).unwrap();
        registry.teardown();
        assert_eq!(arena.allocation_count(), 0);
        assert!(registry.acquire(1, 0).is_none());
        assert_eq!(registry.in_use_count(), 0);
    }
}
