// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: End-to-end verb tests against the simulated remote
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: 10 integration tests
//!
//! TEST_SCOPE:
//!   - create/control/queue/dequeue/delete lifecycle and wire contents
//!   - pool exhaustion and slot reuse
//!   - remote, transport and malformed-reply failures
//!   - callback registration failure compensation

mod common;

use nexus_rproc::host::{Reply, E_FAIL, HOST_PROC_ID};
use nexus_rproc::wire::{
    control, create, dequeue, header, queue, CMD_CONTROL, CMD_CREATE, CMD_DELETE, CMD_DEQUEUE,
    CMD_QUEUE, HANDLE_NONE, MAX_INLINE_ARGS,
};
use nexus_rproc::{ChannelState, CreateParams, Error, EventKey, Resource, Verb, FIRMWARE_VERSION};
use nexus_shm::PhysAddr;

/// Payload word `index` (a parameter block word index) of a recorded command.
fn word(payload: &[u32], index: usize) -> u32 {
    payload[index - header::PAYLOAD]
}

#[test]
fn lifecycle_round_trip() {
    let (rig, rproc) = common::start(common::config());
    assert_eq!(rproc.firmware(), FIRMWARE_VERSION);

    let handle = rproc.create(&CreateParams::new(7, 1).args(&[0x10, 0x20])).unwrap();
    let info = rproc.channel_info(handle).unwrap();
    assert_eq!(info.state, ChannelState::Ready);
    assert_eq!(info.remote_handle, 0x1000);
    assert_eq!(info.event_id, Some(42));
    assert_eq!(info.proc_id, HOST_PROC_ID);
    assert_eq!(info.firmware, FIRMWARE_VERSION);
    assert!(rig.notify.is_registered(EventKey::new(HOST_PROC_ID, 0, 42)));

    let created = &rig.remote.commands_with(CMD_CREATE)[0];
    assert_eq!(word(&created.payload, create::DRIVER_ID), 7);
    assert_eq!(word(&created.payload, create::INSTANCE_ID), 1);
    assert_eq!(word(&created.payload, create::ARG_COUNT), 2);
    assert_eq!(word(&created.payload, create::ARGS + 1), 0x20);
    assert_eq!(created.handle, HANDLE_NONE);

    let mut args = [1, 2, 3];
    assert_eq!(rproc.control(handle, 0x55, &mut args).unwrap(), 0);
    assert_eq!(args, [2, 3, 4]);
    let ctl = &rig.remote.commands_with(CMD_CONTROL)[0];
    assert_eq!(ctl.handle, 0x1000);
    assert_eq!(word(&ctl.payload, control::CMD), 0x55);

    let frames = PhysAddr::new(0x8100_0000);
    assert_eq!(rproc.queue(handle, frames, 2).unwrap(), 0);
    assert_eq!(rproc.dequeue(handle, frames, 2, 33).unwrap(), 0);
    let queued = &rig.remote.commands_with(CMD_QUEUE)[0];
    assert_eq!(word(&queued.payload, queue::FRAME_LIST), 0x8100_0000);
    assert_eq!(word(&queued.payload, queue::STREAM_ID), 2);
    let dequeued = &rig.remote.commands_with(CMD_DEQUEUE)[0];
    assert_eq!(word(&dequeued.payload, dequeue::REMOTE_TIMEOUT), 33);

    assert_eq!(rproc.delete(handle).unwrap(), 0);
    assert_eq!(rig.remote.open_instances(), 0);
    assert!(!rig.notify.is_registered(EventKey::new(HOST_PROC_ID, 0, 42)));
    assert_eq!(rproc.channels_in_use(), 0);
}

#[test]
fn sequence_numbers_increase_per_channel() {
    let (rig, rproc) = common::start(common::config());
    let handle = rproc.create(&CreateParams::new(1, 0)).unwrap();
    for _ in 0..3 {
        rproc.queue(handle, PhysAddr::new(0x8000_0000), 0).unwrap();
    }
    let seqs: Vec<u32> = rig.remote.commands_with(CMD_QUEUE).iter().map(|c| c.seq).collect();
    assert!(seqs.windows(2).all(|pair| pair[1] > pair[0]), "{seqs:?}");
    assert!(seqs.iter().all(|seq| *seq != 0));
}

#[test]
fn stale_handle_after_delete() {
    let (_rig, rproc) = common::start(common::config());
    let handle = rproc.create(&CreateParams::new(1, 0)).unwrap();
    rproc.delete(handle).unwrap();
    assert!(!rproc.is_valid(handle));
    assert!(matches!(rproc.queue(handle, PhysAddr::new(0), 0), Err(Error::InvalidHandle)));
    assert!(matches!(rproc.delete(handle), Err(Error::InvalidHandle)));

    let reused = rproc.create(&CreateParams::new(1, 0)).unwrap();
    assert_eq!(reused.index(), handle.index());
    assert_ne!(reused.generation(), handle.generation());
}

#[test]
fn pool_exhaustion_and_reuse() {
    let (_rig, rproc) = common::start(common::config());
    let handles: Vec<_> = (0..rproc.capacity() as u32)
        .map(|instance| rproc.create(&CreateParams::new(1, instance)).unwrap())
        .collect();
    assert!(matches!(
        rproc.create(&CreateParams::new(1, 99)),
        Err(Error::ResourceExhausted(Resource::ChannelPool))
    ));
    rproc.delete(handles[1]).unwrap();
    let again = rproc.create(&CreateParams::new(1, 99)).unwrap();
    assert_eq!(again.index(), handles[1].index());
}

#[test]
fn remote_failure_on_create_releases_slot() {
    let (rig, rproc) = common::start(common::config());
    rig.remote.set_reply(CMD_CREATE, Reply::Now(-22));
    let err = rproc.create(&CreateParams::new(1, 0)).unwrap_err();
    assert!(matches!(err, Error::RemoteStatus { verb: Verb::Create, status: -22 }), "{err}");
    assert_eq!(rproc.channels_in_use(), 0);
}

#[test]
fn remote_failure_keeps_channel_open() {
    let (rig, rproc) = common::start(common::config());
    let handle = rproc.create(&CreateParams::new(1, 0)).unwrap();
    rig.remote.set_reply(CMD_QUEUE, Reply::Now(-5));
    let err = rproc.queue(handle, PhysAddr::new(0), 0).unwrap_err();
    assert!(matches!(err, Error::RemoteStatus { verb: Verb::Queue, status: -5 }));
    assert_eq!(rproc.channel_info(handle).unwrap().state, ChannelState::Ready);

    rig.remote.set_reply(CMD_DELETE, Reply::Now(-1));
    assert!(matches!(rproc.delete(handle), Err(Error::RemoteStatus { verb: Verb::Delete, .. })));
    assert!(!rproc.is_valid(handle));
}

#[test]
fn transport_failure_reports_code() {
    let (rig, rproc) = common::start(common::config());
    let handle = rproc.create(&CreateParams::new(1, 0)).unwrap();
    rig.notify.fail_sends(Some(E_FAIL));
    assert!(matches!(rproc.control(handle, 1, &mut []), Err(Error::Transport(E_FAIL))));
    assert_eq!(rproc.channel_info(handle).unwrap().state, ChannelState::Ready);
    assert!(matches!(rproc.create(&CreateParams::new(1, 1)), Err(Error::Transport(E_FAIL))));
    assert_eq!(rproc.channels_in_use(), 1);

    rig.notify.fail_sends(None);
    assert_eq!(rproc.control(handle, 1, &mut []).unwrap(), 0);
}

#[test]
fn argument_limit_enforced() {
    let (rig, rproc) = common::start(common::config());
    let too_many = vec![0u32; MAX_INLINE_ARGS + 1];
    assert!(matches!(
        rproc.create(&CreateParams::new(1, 0).args(&too_many)),
        Err(Error::TooManyArgs { given: 17, max: 16 })
    ));
    let handle = rproc.create(&CreateParams::new(1, 0)).unwrap();
    let mut args = too_many;
    assert!(matches!(rproc.control(handle, 1, &mut args), Err(Error::TooManyArgs { .. })));
    assert!(rig.remote.commands_with(CMD_CONTROL).is_empty());
}

#[test]
fn create_without_remote_handle_is_malformed() {
    let (rig, rproc) = common::start(common::config());
    rig.remote.set_next_handle(HANDLE_NONE);
    assert!(matches!(rproc.create(&CreateParams::new(1, 0)), Err(Error::MalformedReply(_))));
    assert_eq!(rproc.channels_in_use(), 0);
}

#[test]
fn callback_registration_failure_deletes_remote_instance() {
    let (rig, rproc) = common::start(common::config());
    rig.notify.fail_registrations(Some(E_FAIL));
    let err = rproc.create(&CreateParams::new(1, 0)).unwrap_err();
    assert!(matches!(err, Error::CallbackRegistration(E_FAIL)), "{err}");
    assert_eq!(rig.remote.commands_with(CMD_DELETE).len(), 1);
    assert_eq!(rig.remote.open_instances(), 0);
    assert_eq!(rproc.channels_in_use(), 0);
}
