// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bounded waits for remote completions
//! OWNERS: @runtime
//!
//! A caller parks on its channel doorbell in slices of at most the poll interval
//! and re-reads the parameter block after every wake-up, so a reply that races
//! ahead of the doorbell costs at most one slice.

use core::time::Duration;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::wire::ParamBlock;

/// Per-request wait budget.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcTimeout {
    /// Wait until the remote answers.
    Forever,
    /// Give up after the duration.
    After(Duration),
}

impl RpcTimeout {
    /// Maps a millisecond count; `0` means [`RpcTimeout::Forever`].
    pub const fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self::Forever
        } else {
            Self::After(Duration::from_millis(ms))
        }
    }

    /// Milliseconds, `0` for [`RpcTimeout::Forever`].
    pub fn as_millis(self) -> u64 {
        match self {
            Self::Forever => 0,
            Self::After(budget) => u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Deadline counted from `start`, `None` when unbounded or past the clock range.
    pub fn deadline_from(self, start: Instant) -> Option<Instant> {
        match self {
            Self::Forever => None,
            Self::After(budget) => start.checked_add(budget),
        }
    }
}

/// Wake-up source for one waiter at a time.
#[derive(Default)]
pub(crate) struct Doorbell {
    rings: AtomicU64,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Doorbell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring count; pass it to [`Doorbell::wait`] to detect rings in between.
    pub fn rings(&self) -> u64 {
        self.rings.load(Ordering::Acquire)
    }

    pub fn ring(&self) {
        let _guard = self.lock.lock();
        self.rings.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_all();
    }

    /// Parks for at most `slice` unless the doorbell rang since `seen`.
    pub fn wait(&self, seen: u64, slice: Duration) {
        let mut guard = self.lock.lock();
        if self.rings.load(Ordering::Acquire) != seen {
            return;
        }
        let _ = self.cond.wait_for(&mut guard, slice);
    }
}

/// Waits until `block` completes request `seq` or the timeout expires.
pub(crate) fn wait_completion(
    doorbell: &Doorbell,
    block: &ParamBlock,
    seq: u32,
    timeout: RpcTimeout,
    poll: Duration,
) -> Option<i32> {
    let deadline = timeout.deadline_from(Instant::now());
    loop {
        let seen = doorbell.rings();
        if let Some(result) = block.completion(seq) {
            return Some(result);
        }
        let slice = match deadline {
            None => poll,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return block.completion(seq);
                }
                poll.min(deadline - now)
            }
        };
        doorbell.wait(seen, slice);
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use nexus_shm::host::HostMapper;
    use nexus_shm::{Arena, PAGE_SIZE};

    use super::*;
    use crate::wire::{header, CMD_QUEUE, PARAM_BLOCK_BYTES};

    fn block() -> (Arena, ParamBlock) {
        let arena = Arena::init(Arc::new(HostMapper::new()), None, Some(PAGE_SIZE)).unwrap();
        let buf = arena.allocate(PARAM_BLOCK_BYTES).unwrap();
        let block = ParamBlock::new(buf.block(0, PARAM_BLOCK_BYTES).unwrap());
        (arena, block)
    }

    #[test]
    fn zero_millis_is_forever() {
        assert_eq!(RpcTimeout::from_millis(0), RpcTimeout::Forever);
        assert_eq!(RpcTimeout::from_millis(5).as_millis(), 5);
        assert!(RpcTimeout::Forever.deadline_from(Instant::now()).is_none());
    }

    #[test]
    fn unrepresentable_deadline_waits_forever() {
        let now = Instant::now();
        assert!(RpcTimeout::After(Duration::MAX).deadline_from(now).is_none());
        if let Some(deadline) = RpcTimeout::from_millis(u64::MAX).deadline_from(now) {
            assert!(deadline > now);
        }
        assert_eq!(
            RpcTimeout::from_millis(10).deadline_from(now),
            Some(now + Duration::from_millis(10))
        );
    }

    #[test]
    fn expires_without_reply() {
        let (_arena, block) = block();
        block.arm(CMD_QUEUE, 1, 0);
        let doorbell = Doorbell::new();
        let start = Instant::now();
        let result = wait_completion(
            &doorbell,
            &block,
            1,
            RpcTimeout::from_millis(30),
            Duration::from_millis(5),
        );
        assert_eq!(result, None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn doorbell_wakes_waiter() {
        let (_arena, block) = block();
        block.arm(CMD_QUEUE, 3, 0);
        let doorbell = Arc::new(Doorbell::new());

        let remote = {
            let doorbell = Arc::clone(&doorbell);
            let block = block.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                block.set(header::RESULT, 4);
                block.set(header::ACK, 3);
                doorbell.ring();
            })
        };
        let result = wait_completion(
            &doorbell,
            &block,
            3,
            RpcTimeout::Forever,
            Duration::from_secs(5),
        );
        remote.join().unwrap();
        assert_eq!(result, Some(4));
    }
}
