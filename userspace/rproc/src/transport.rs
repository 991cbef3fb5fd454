// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Notification transport seam consumed by the RPC layer
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! The transport delivers one 32-bit payload per event; the RPC layer always
//! passes a physical address. Callbacks run in notification context and must
//! not block.

use core::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// Numeric id of a remote processor.
pub type ProcId = u16;
/// Notification line between the cores.
pub type LineId = u16;

/// Full address of a notification event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    /// Remote processor.
    pub proc_id: ProcId,
    /// Line on that processor.
    pub line_id: LineId,
    /// Event number on the line.
    pub event_id: u32,
}

impl EventKey {
    /// Builds a key.
    pub const fn new(proc_id: ProcId, line_id: LineId, event_id: u32) -> Self {
        Self { proc_id, line_id, event_id }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc {} line {} event {}", self.proc_id, self.line_id, self.event_id)
    }
}

/// One delivered event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Notification {
    /// Where it arrived.
    pub key: EventKey,
    /// 32-bit payload.
    pub payload: u32,
}

/// Delivery priority requested on send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Ordinary delivery.
    #[default]
    Normal,
    /// Ask the transport to wait for the remote to drain its previous event.
    Urgent,
}

/// Non-zero status returned by a transport operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("notify status {0}")]
pub struct NotifyStatus(pub i32);

/// Callback invoked for each event on a registered key.
pub type EventCallback = Arc<dyn Fn(Notification) + Send + Sync>;

/// Interrupt-style notification transport.
pub trait NotifyTransport: Send + Sync {
    /// Sends `payload` on `key`. Returns once the event is posted, not handled.
    fn send_event(
        &self,
        key: EventKey,
        payload: u32,
        priority: Priority,
    ) -> Result<(), NotifyStatus>;

    /// Registers `callback` for events arriving on `key`.
    fn register_event(&self, key: EventKey, callback: EventCallback) -> Result<(), NotifyStatus>;

    /// Removes the callback for `key`.
    fn unregister_event(&self, key: EventKey) -> Result<(), NotifyStatus>;
}

/// Resolves a remote processor name to its numeric id.
pub trait ProcResolver: Send + Sync {
    /// Returns `None` for unknown names.
    fn resolve(&self, name: &str) -> Option<ProcId>;
}
