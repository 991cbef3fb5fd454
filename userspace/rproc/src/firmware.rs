// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Firmware version negotiation at start
//! OWNERS: @runtime
//!
//! One get-version query runs before the channel pool is used. It borrows a
//! scratch arena allocation outside the pool and a temporary reply watcher.

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use log::{info, warn};
use nexus_shm::Arena;

use crate::dispatch::Dispatcher;
use crate::transport::{EventKey, NotifyTransport, Priority};
use crate::wait::{wait_completion, Doorbell, RpcTimeout};
use crate::wire::{
    version, Envelope, ParamBlock, CMD_GET_VERSION, ENVELOPE_BYTES, HANDLE_NONE,
    PARAM_BLOCK_BYTES,
};
use crate::{Error, Resource, Result};

/// Packed `major.minor.patch.build` firmware version, one byte each.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion(u32);

impl FirmwareVersion {
    /// Packs the four components.
    pub const fn new(major: u8, minor: u8, patch: u8, build: u8) -> Self {
        Self(u32::from_be_bytes([major, minor, patch, build]))
    }

    /// Wraps a word read from the remote.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Packed value.
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.0.to_be_bytes();
        write!(f, "{major}.{minor:02}.{patch:02}.{build:02}")
    }
}

/// Oldest firmware this side can drive.
pub const MIN_FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion::new(1, 0, 1, 0);
/// Firmware this side was built against.
pub const FIRMWARE_VERSION: FirmwareVersion = FirmwareVersion::new(1, 0, 2, 0);

/// Reasons the version query failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// Remote runs firmware older than [`MIN_FIRMWARE_VERSION`].
    #[error("firmware {found} is older than required {required}")]
    TooOld {
        /// Version reported by the remote.
        found: FirmwareVersion,
        /// Minimum supported version.
        required: FirmwareVersion,
    },
    /// The remote never answered.
    #[error("firmware version query timed out after {timeout_ms} ms")]
    Timeout {
        /// Configured timeout.
        timeout_ms: u64,
    },
    /// The remote refused the query.
    #[error("firmware version query failed with status {0}")]
    Rejected(i32),
}

/// The version query is the first request on its scratch block.
const QUERY_SEQ: u32 = 1;

/// Asks the remote for its firmware version and checks it against this build.
pub(crate) fn negotiate(
    arena: &Arena,
    dispatcher: &Dispatcher,
    transport: &dyn NotifyTransport,
    command: EventKey,
    priority: Priority,
    timeout: RpcTimeout,
    poll: Duration,
) -> Result<FirmwareVersion> {
    let scratch = arena
        .allocate(ENVELOPE_BYTES + PARAM_BLOCK_BYTES)
        .ok_or(Error::ResourceExhausted(Resource::Arena))?;
    let blocks =
        scratch.block(0, ENVELOPE_BYTES).zip(scratch.block(ENVELOPE_BYTES, PARAM_BLOCK_BYTES));
    let Some((envelope, param)) = blocks else {
        arena.release(scratch);
        return Err(Error::ResourceExhausted(Resource::Arena));
    };
    let envelope = Envelope::new(envelope);
    let param = ParamBlock::new(param);

    param.arm(CMD_GET_VERSION, QUERY_SEQ, HANDLE_NONE);
    envelope.point_at(QUERY_SEQ, param.phys());

    let doorbell = Arc::new(Doorbell::new());
    dispatcher.watch(envelope.phys(), Arc::clone(&doorbell));
    let answer = match transport.send_event(command, envelope.phys().as_u32(), priority) {
        Ok(()) => Ok(wait_completion(&doorbell, &param, QUERY_SEQ, timeout, poll)),
        Err(status) => Err(Error::Transport(status.0)),
    };
    let reported = param.get(version::VERSION);
    dispatcher.unwatch(envelope.phys());
    arena.release(scratch);

    let status = answer?
        .ok_or(NegotiationError::Timeout { timeout_ms: timeout.as_millis() })?;
    if status < 0 {
        return Err(NegotiationError::Rejected(status).into());
    }
    check(FirmwareVersion::from_raw(reported))
}

fn check(found: FirmwareVersion) -> Result<FirmwareVersion> {
    if found < MIN_FIRMWARE_VERSION {
        return Err(NegotiationError::TooOld { found, required: MIN_FIRMWARE_VERSION }.into());
    }
    if found > FIRMWARE_VERSION {
        warn!("rproc: firmware {found} is newer than {FIRMWARE_VERSION}; continuing");
    } else {
        info!("rproc: firmware {found}");
    }
    Ok(found)
}
