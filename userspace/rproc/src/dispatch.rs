// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Routing of remote-initiated events
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/dispatch.rs
//!
//! Two kinds of events arrive from the remote core:
//!   - reply events carry an envelope address and wake the waiting caller
//!   - channel events carry a callback block address and invoke the
//!     application callback of the matching channel
//!
//! Handlers run in notification context. They take short slot locks, never
//! wait on a request and never issue a verb.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use nexus_shm::PhysAddr;
use parking_lot::Mutex;

use crate::registry::{CallbackEvent, CallbackKind, ChannelHandle, ChannelRegistry};
use crate::transport::{EventKey, Notification};
use crate::wait::Doorbell;
use crate::wire::{CB_COMPLETE, CB_ERROR};

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Returns `true` on a thread currently running a notification handler.
pub fn in_notification_context() -> bool {
    IN_DISPATCH.with(Cell::get)
}

struct DispatchScope {
    outer: bool,
}

impl DispatchScope {
    fn enter() -> Self {
        Self { outer: IN_DISPATCH.with(|flag| flag.replace(true)) }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(self.outer));
    }
}

/// Event dropped by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// No in-use channel is registered for the event and payload.
    #[error("no channel for {key} payload {payload:#010x}")]
    NoMatchingChannel {
        /// Event address.
        key: EventKey,
        /// Payload received.
        payload: u32,
    },
    /// The channel has no callback for this kind of event.
    #[error("{channel} has no {kind:?} callback")]
    NoCallback {
        /// Matching channel.
        channel: ChannelHandle,
        /// Kind read from the callback block.
        kind: CallbackKind,
    },
    /// Callback block carried an unknown kind.
    #[error("{channel} callback block has unknown kind {kind}")]
    UnknownKind {
        /// Matching channel.
        channel: ChannelHandle,
        /// Raw kind word.
        kind: u32,
    },
    /// Reply payload is not the envelope of any channel or pending query.
    #[error("reply for unknown envelope {0:#010x}")]
    UnknownReply(u32),
}

/// Dispatcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Application callbacks invoked.
    pub callbacks: u64,
    /// Reply events routed to a waiter.
    pub replies: u64,
    /// Events dropped with a [`ProtocolError`].
    pub rejected: u64,
}

pub(crate) struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    watchers: Mutex<Vec<(u32, Arc<Doorbell>)>>,
    callbacks: AtomicU64,
    replies: AtomicU64,
    rejected: AtomicU64,
}

impl Dispatcher {
    pub fn new(registry: Arc<ChannelRegistry>) -> Self {
        Self {
            registry,
            watchers: Mutex::new(Vec::new()),
            callbacks: AtomicU64::new(0),
            replies: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Reply event: payload is the envelope of the answered request.
    pub fn on_reply(&self, notification: Notification) {
        let _scope = DispatchScope::enter();
        let payload = notification.payload;
        if let Some(slot) = self.registry.slot_by_envelope(payload) {
            slot.doorbell.ring();
            self.replies.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let watcher = self
            .watchers
            .lock()
            .iter()
            .find(|(envelope, _)| *envelope == payload)
            .map(|(_, doorbell)| Arc::clone(doorbell));
        match watcher {
            Some(doorbell) => {
                doorbell.ring();
                self.replies.fetch_add(1, Ordering::Relaxed);
            }
            None => self.reject(ProtocolError::UnknownReply(payload)),
        }
    }

    /// Channel event: payload is the callback block of the signalling channel.
    pub fn on_channel_event(&self, notification: Notification) {
        let _scope = DispatchScope::enter();
        let Notification { key, payload } = notification;
        let Some((channel, slot, callbacks)) = self.registry.find_route(key, payload) else {
            self.reject(ProtocolError::NoMatchingChannel { key, payload });
            return;
        };

        let kind = match slot.blocks.callback.kind() {
            CB_COMPLETE => CallbackKind::Complete,
            CB_ERROR => CallbackKind::Error,
            other => {
                self.reject(ProtocolError::UnknownKind { channel, kind: other });
                return;
            }
        };
        let Some(callback) = callbacks.as_ref().and_then(|cbs| cbs.for_kind(kind)) else {
            self.reject(ProtocolError::NoCallback { channel, kind });
            return;
        };
        let event = CallbackEvent { kind, aux: slot.blocks.callback.aux() };
        debug!(
            "rproc: {channel} {kind:?} from remote {:#x} aux {:#x}",
            slot.blocks.callback.handle(),
            event.aux
        );
        callback(channel, event);
        self.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Routes replies for an envelope outside the channel pool to `doorbell`.
    pub fn watch(&self, envelope: PhysAddr, doorbell: Arc<Doorbell>) {
        self.watchers.lock().push((envelope.as_u32(), doorbell));
    }

    pub fn unwatch(&self, envelope: PhysAddr) {
        self.watchers.lock().retain(|(watched, _)| *watched != envelope.as_u32());
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            callbacks: self.callbacks.load(Ordering::Relaxed),
            replies: self.replies.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, err: ProtocolError) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        warn!("rproc: dropped event: {err}");
    }
}
