// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Command/control RPC to the display co-processor
//! OWNERS: @runtime @graphics
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + host integration tests (SimRemote)
//!
//! PUBLIC API:
//!   - Rproc: subsystem handle; create/delete/control/queue/dequeue verbs
//!   - ChannelHandle: generation-checked reference to a pooled channel
//!   - AppCallbacks: per-channel completion/error callbacks
//!   - NotifyTransport / ProcResolver: injected platform seams
//!   - RprocConfig: TOML-backed configuration
//!   - global: optional process-wide instance
//!
//! DEPENDENCIES:
//!   - nexus-shm: shared region allocator and mapper seam
//!   - parking_lot: slot/pool locks, doorbell condvars
//!   - thiserror/log: error taxonomy and diagnostics
//!   - serde/toml: configuration
//!
//! INVARIANTS:
//!   - At most one outstanding request per channel
//!   - PENDING never equals a legitimate result
//!   - A reply counts only if its echoed sequence matches the request
//!   - Notification context never blocks on a request or issues a verb

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use core::fmt;

mod client;
mod config;
mod dispatch;
mod firmware;
pub mod global;
mod registry;
mod transport;
mod wait;
pub mod wire;

#[cfg(feature = "backend-host")]
pub mod host;

pub use client::{ChannelInfo, CreateParams, Platform, Rproc};
pub use config::{ConfigError, RprocConfig, MAX_CHANNELS};
pub use dispatch::{in_notification_context, DispatchStats, ProtocolError};
pub use firmware::{FirmwareVersion, NegotiationError, FIRMWARE_VERSION, MIN_FIRMWARE_VERSION};
pub use registry::{AppCallbacks, CallbackEvent, CallbackFn, CallbackKind, ChannelHandle};
pub use transport::{
    EventCallback, EventKey, LineId, Notification, NotifyStatus, NotifyTransport, Priority,
    ProcId, ProcResolver,
};
pub use wait::RpcTimeout;

/// Result alias for subsystem operations.
pub type Result<T> = core::result::Result<T, Error>;

/// The five remote verbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Open a driver instance on the remote core.
    Create,
    /// Close a driver instance.
    Delete,
    /// Driver-specific control command.
    Control,
    /// Hand a frame list to the driver.
    Queue,
    /// Take a processed frame list back.
    Dequeue,
}

impl Verb {
    /// Command tag written into the parameter block.
    pub const fn tag(self) -> u32 {
        match self {
            Self::Create => wire::CMD_CREATE,
            Self::Delete => wire::CMD_DELETE,
            Self::Control => wire::CMD_CONTROL,
            Self::Queue => wire::CMD_QUEUE,
            Self::Dequeue => wire::CMD_DEQUEUE,
        }
    }

    /// Channel state while this verb is outstanding.
    pub const fn state(self) -> ChannelState {
        match self {
            Self::Create => ChannelState::Creating,
            Self::Delete => ChannelState::Deleting,
            Self::Control => ChannelState::Controlling,
            Self::Queue => ChannelState::Queuing,
            Self::Dequeue => ChannelState::Dequeuing,
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Delete => "delete",
            Self::Control => "control",
            Self::Queue => "queue",
            Self::Dequeue => "dequeue",
        })
    }
}

/// Lifecycle of a pooled channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Slot is in the pool.
    Free,
    /// Create outstanding.
    Creating,
    /// Open and idle.
    Ready,
    /// Control outstanding.
    Controlling,
    /// Queue outstanding.
    Queuing,
    /// Dequeue outstanding.
    Dequeuing,
    /// Delete outstanding.
    Deleting,
}

impl ChannelState {
    /// Returns `true` while a request occupies the channel.
    pub const fn is_outstanding(self) -> bool {
        !matches!(self, Self::Free | Self::Ready)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Free => "free",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Controlling => "controlling",
            Self::Queuing => "queuing",
            Self::Dequeuing => "dequeuing",
            Self::Deleting => "deleting",
        })
    }
}

/// Pooled resources that can run out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource {
    /// Shared-memory arena.
    Arena,
    /// Fixed channel pool.
    ChannelPool,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Arena => "shared memory arena",
            Self::ChannelPool => "channel pool",
        })
    }
}

/// Errors surfaced to RPC callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The notification send failed synchronously.
    #[error("notify send failed with status {0}")]
    Transport(i32),
    /// No reply before the configured timeout; the channel stays in-use.
    #[error("{verb} on {channel} timed out after {timeout_ms} ms")]
    Timeout {
        /// Verb that was outstanding.
        verb: Verb,
        /// Channel left occupied; recover it with [`Rproc::force_release`].
        channel: ChannelHandle,
        /// Configured timeout.
        timeout_ms: u64,
    },
    /// Arena or channel pool exhausted.
    #[error("{0} exhausted")]
    ResourceExhausted(Resource),
    /// The remote answered with a negative status.
    #[error("remote {verb} failed with status {status}")]
    RemoteStatus {
        /// Verb that failed.
        verb: Verb,
        /// Status written by the remote.
        status: i32,
    },
    /// Handle is stale, foreign, or refers to a free slot.
    #[error("stale or foreign channel handle")]
    InvalidHandle,
    /// Another request is outstanding, or the channel is not ready.
    #[error("channel is {state}")]
    Busy {
        /// State observed.
        state: ChannelState,
    },
    /// Verbs may not be issued from a notification callback.
    #[error("verb issued from notification context")]
    Reentrant,
    /// More inline arguments than a parameter block holds.
    #[error("{given} arguments exceed the inline limit of {max}")]
    TooManyArgs {
        /// Arguments supplied.
        given: usize,
        /// Block capacity.
        max: usize,
    },
    /// The remote completed a request with inconsistent output.
    #[error("malformed reply: {0}")]
    MalformedReply(&'static str),
    /// The transport refused the channel event callback.
    #[error("event callback registration failed with status {0}")]
    CallbackRegistration(i32),
    /// The subsystem was shut down.
    #[error("rproc subsystem is shut down")]
    ShutDown,
    /// Remote processor name did not resolve.
    #[error("unknown remote processor {0:?}")]
    UnknownProcessor(String),
    /// Firmware version negotiation failed.
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    /// Shared region could not be brought up.
    #[error(transparent)]
    Shm(#[from] nexus_shm::ShmError),
    /// Configuration rejected at start.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
