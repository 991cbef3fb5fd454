// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Shared-memory layout of command envelopes and parameter blocks
//! OWNERS: @runtime
//!
//! All fields are little-endian 32-bit words. The remote core writes `RESULT`
//! before `ACK`; a block is complete only once `RESULT != PENDING` and `ACK`
//! echoes the request sequence. Sequence 0 is never issued.

use nexus_shm::{PhysAddr, ShmBlock};

/// Result value meaning "not yet answered".
pub const PENDING: u32 = 0xAAAA_AAAA;
/// Remote handle value meaning "no instance".
pub const HANDLE_NONE: u32 = 0xAAAA_AAAA;
/// Envelope kind: exactly one command block follows.
pub const ENVELOPE_SINGLE: u32 = 1;
/// Inline argument capacity of create/control blocks.
pub const MAX_INLINE_ARGS: usize = 16;

/// Opens a driver instance.
pub const CMD_CREATE: u32 = 0x1;
/// Closes a driver instance.
pub const CMD_DELETE: u32 = 0x2;
/// Driver-specific control.
pub const CMD_CONTROL: u32 = 0x3;
/// Queues a frame list.
pub const CMD_QUEUE: u32 = 0x4;
/// Dequeues a processed frame list.
pub const CMD_DEQUEUE: u32 = 0x5;
/// Firmware version query, issued once at start.
pub const CMD_GET_VERSION: u32 = 0x10;

/// Byte size reserved for an envelope.
pub const ENVELOPE_BYTES: usize = 64;
/// Byte size reserved for a callback block.
pub const CALLBACK_BYTES: usize = 64;
/// Byte size reserved for each parameter block.
pub const PARAM_BLOCK_BYTES: usize = 128;
/// Bytes of shared memory wired to one channel.
pub const CHANNEL_BYTES: usize = ENVELOPE_BYTES + CALLBACK_BYTES + 5 * PARAM_BLOCK_BYTES;

/// Envelope word indices.
pub mod envelope {
    /// Envelope kind.
    pub const KIND: usize = 0;
    /// Request sequence.
    pub const SEQ: usize = 1;
    /// Physical address of the parameter block.
    pub const PARAM: usize = 2;
}

/// Header words shared by every parameter block.
pub mod header {
    /// Command tag.
    pub const COMMAND: usize = 0;
    /// Request sequence.
    pub const SEQ: usize = 1;
    /// Remote instance handle (written by the remote on create).
    pub const HANDLE: usize = 2;
    /// Signed status, [`super::PENDING`] until answered.
    pub const RESULT: usize = 3;
    /// Sequence echoed by the remote after `RESULT`.
    pub const ACK: usize = 4;
    /// First payload word.
    pub const PAYLOAD: usize = 5;
}

/// Create payload.
pub mod create {
    /// Remote driver id.
    pub const DRIVER_ID: usize = 5;
    /// Driver instance id.
    pub const INSTANCE_ID: usize = 6;
    /// Physical address of the channel callback block.
    pub const CALLBACK_BLOCK: usize = 7;
    /// Event id assigned by the remote.
    pub const EVENT_ID: usize = 8;
    /// Number of inline arguments.
    pub const ARG_COUNT: usize = 9;
    /// First inline argument.
    pub const ARGS: usize = 10;
}

/// Control payload.
pub mod control {
    /// Driver command.
    pub const CMD: usize = 5;
    /// Number of inline arguments.
    pub const ARG_COUNT: usize = 6;
    /// First inline argument.
    pub const ARGS: usize = 7;
}

/// Queue payload.
pub mod queue {
    /// Physical address of the frame list.
    pub const FRAME_LIST: usize = 5;
    /// Stream id.
    pub const STREAM_ID: usize = 6;
}

/// Dequeue payload.
pub mod dequeue {
    /// Physical address of the frame list to fill.
    pub const FRAME_LIST: usize = 5;
    /// Stream id.
    pub const STREAM_ID: usize = 6;
    /// Remote-side wait, in remote ticks.
    pub const REMOTE_TIMEOUT: usize = 7;
}

/// Version query payload.
pub mod version {
    /// Packed firmware version written by the remote.
    pub const VERSION: usize = 5;
}

/// Callback block words, written by the remote before raising a channel event.
pub mod callback {
    /// [`super::CB_COMPLETE`] or [`super::CB_ERROR`].
    pub const KIND: usize = 0;
    /// Remote handle of the signalling instance.
    pub const HANDLE: usize = 1;
    /// Kind-specific word (frame count, error list address).
    pub const AUX: usize = 2;
}

/// Callback kind: frames completed.
pub const CB_COMPLETE: u32 = 1;
/// Callback kind: driver error.
pub const CB_ERROR: u32 = 2;

/// Byte offsets of a channel's blocks inside its allocation.
pub(crate) mod layout {
    use super::{CALLBACK_BYTES, ENVELOPE_BYTES, PARAM_BLOCK_BYTES};

    pub const ENVELOPE: usize = 0;
    pub const CALLBACK: usize = ENVELOPE + ENVELOPE_BYTES;
    pub const CREATE: usize = CALLBACK + CALLBACK_BYTES;
    pub const DELETE: usize = CREATE + PARAM_BLOCK_BYTES;
    pub const CONTROL: usize = DELETE + PARAM_BLOCK_BYTES;
    pub const QUEUE: usize = CONTROL + PARAM_BLOCK_BYTES;
    pub const DEQUEUE: usize = QUEUE + PARAM_BLOCK_BYTES;
}

/// Command envelope: the single word-pointer handed to the remote.
#[derive(Clone, Debug)]
pub(crate) struct Envelope(ShmBlock);

impl Envelope {
    pub fn new(block: ShmBlock) -> Self {
        Self(block)
    }

    pub fn phys(&self) -> PhysAddr {
        self.0.phys()
    }

    pub fn point_at(&self, seq: u32, param: PhysAddr) {
        self.0.write(envelope::PARAM, param.as_u32());
        self.0.write(envelope::SEQ, seq);
        self.0.write(envelope::KIND, ENVELOPE_SINGLE);
    }
}

/// Verb parameter block.
#[derive(Clone, Debug)]
pub(crate) struct ParamBlock(ShmBlock);

impl ParamBlock {
    pub fn new(block: ShmBlock) -> Self {
        Self(block)
    }

    pub fn phys(&self) -> PhysAddr {
        self.0.phys()
    }

    /// Clears the payload and writes a fresh header with `RESULT = PENDING`.
    pub fn arm(&self, command: u32, seq: u32, handle: u32) {
        for index in header::PAYLOAD..self.0.words() {
            self.0.write(index, 0);
        }
        self.0.write(header::ACK, 0);
        self.0.write(header::RESULT, PENDING);
        self.0.write(header::HANDLE, handle);
        self.0.write(header::SEQ, seq);
        self.0.write(header::COMMAND, command);
    }

    pub fn set(&self, index: usize, value: u32) {
        self.0.write(index, value);
    }

    pub fn get(&self, index: usize) -> u32 {
        self.0.read(index)
    }

    /// Writes `args` starting at `first` and their count at `count`.
    pub fn set_args(&self, count: usize, first: usize, args: &[u32]) {
        debug_assert!(args.len() <= MAX_INLINE_ARGS);
        for (offset, value) in args.iter().enumerate() {
            self.0.write(first + offset, *value);
        }
        self.0.write(count, args.len() as u32);
    }

    /// Returns the signed result once the remote has answered request `seq`.
    pub fn completion(&self, seq: u32) -> Option<i32> {
        if self.0.read(header::ACK) != seq {
            return None;
        }
        let result = self.0.read(header::RESULT);
        (result != PENDING).then_some(result as i32)
    }
}

/// Callback block of a channel.
#[derive(Clone, Debug)]
pub(crate) struct CallbackBlock(ShmBlock);

impl CallbackBlock {
    pub fn new(block: ShmBlock) -> Self {
        Self(block)
    }

    pub fn phys(&self) -> PhysAddr {
        self.0.phys()
    }

    pub fn clear(&self) {
        self.0.fill(0);
    }

    pub fn kind(&self) -> u32 {
        self.0.read(callback::KIND)
    }

    pub fn handle(&self) -> u32 {
        self.0.read(callback::HANDLE)
    }

    pub fn aux(&self) -> u32 {
        self.0.read(callback::AUX)
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use std::sync::Arc;

    use nexus_shm::host::HostMapper;
    use nexus_shm::Arena;

    use super::*;

    #[test]
    fn channel_layout_fits_one_page() {
        assert!(CHANNEL_BYTES <= nexus_shm::PAGE_SIZE);
        assert!((create::ARGS + MAX_INLINE_ARGS) * 4 <= PARAM_BLOCK_BYTES);
        assert!((control::ARGS + MAX_INLINE_ARGS) * 4 <= PARAM_BLOCK_BYTES);
        assert_eq!(layout::DEQUEUE + PARAM_BLOCK_BYTES, CHANNEL_BYTES);
    }

    #[test]
    fn completion_requires_matching_ack() {
        let mapper = HostMapper::new();
        let arena = Arena::init(Arc::new(mapper), None, Some(nexus_shm::PAGE_SIZE)).unwrap();
        let buf = arena.allocate(PARAM_BLOCK_BYTES).unwrap();
        let block = ParamBlock::new(buf.block(0, PARAM_BLOCK_BYTES).unwrap());

        block.arm(CMD_CONTROL, 7, 0x1000);
        assert_eq!(block.completion(7), None);

        // Late answer for an older request.
        block.set(header::RESULT, 0);
        block.set(header::ACK, 6);
        assert_eq!(block.completion(7), None);

        block.set(header::RESULT, (-3i32) as u32);
        block.set(header::ACK, 7);
        assert_eq!(block.completion(7), Some(-3));
        arena.release(buf);
    }
}
