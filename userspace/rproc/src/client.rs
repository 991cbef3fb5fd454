// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RPC client for the remote display co-processor
//! OWNERS: @runtime @graphics
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests + tests/verbs.rs, tests/timeout.rs, tests/dispatch.rs
//!
//! Every verb follows the same exchange:
//!   1. move the channel from `Ready` into the verb state
//!   2. arm the parameter block (`RESULT = PENDING`, fresh sequence)
//!   3. point the envelope at the block and post it on the command event
//!   4. park on the channel doorbell until the block completes or the timeout expires
//!
//! A timed-out request leaves its channel in the verb state; the remote may still
//! own the parameter block. [`Rproc::force_release`] returns such a channel.
//!
//! Channels may share a remote event id. The transport sees one registration per
//! distinct event key, counted across the channels bound to it; dispatch tells
//! the channels apart by callback block address.

use core::fmt;
use core::time::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use nexus_shm::{Arena, PhysAddr, PhysMapper};
use parking_lot::Mutex;

use crate::config::RprocConfig;
use crate::dispatch::{in_notification_context, DispatchStats, Dispatcher};
use crate::firmware::{self, FirmwareVersion};
use crate::registry::{AppCallbacks, ChannelHandle, ChannelRegistry, Slot};
use crate::transport::{
    EventCallback, EventKey, LineId, Notification, NotifyStatus, NotifyTransport, Priority,
    ProcId, ProcResolver,
};
use crate::wait::{wait_completion, RpcTimeout};
use crate::wire::{
    control, create, dequeue, header, queue, ParamBlock, HANDLE_NONE, MAX_INLINE_ARGS,
};
use crate::{ChannelState, Error, Resource, Result, Verb};

/// Platform services injected at start.
#[derive(Clone)]
pub struct Platform {
    /// Maps the shared region non-cacheable.
    pub mapper: Arc<dyn PhysMapper>,
    /// Interrupt-style notification transport.
    pub transport: Arc<dyn NotifyTransport>,
    /// Remote processor name lookup.
    pub resolver: Arc<dyn ProcResolver>,
}

/// Arguments of [`Rproc::create`].
#[derive(Clone, Debug)]
pub struct CreateParams {
    driver_id: u32,
    instance_id: u32,
    args: Vec<u32>,
    callbacks: Option<AppCallbacks>,
}

impl CreateParams {
    /// Opens instance `instance_id` of remote driver `driver_id`.
    pub fn new(driver_id: u32, instance_id: u32) -> Self {
        Self { driver_id, instance_id, args: Vec::new(), callbacks: None }
    }

    /// Driver-specific create arguments, at most [`MAX_INLINE_ARGS`].
    pub fn args(mut self, args: &[u32]) -> Self {
        self.args = args.to_vec();
        self
    }

    /// Callbacks for remote-initiated events on the channel.
    pub fn callbacks(mut self, callbacks: AppCallbacks) -> Self {
        self.callbacks = Some(callbacks);
        self
    }
}

/// Snapshot of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Opaque remote instance handle, [`HANDLE_NONE`] before create completes.
    pub remote_handle: u32,
    /// Event id assigned by the remote at create.
    pub event_id: Option<u32>,
    /// Current state.
    pub state: ChannelState,
    /// Remote processor.
    pub proc_id: ProcId,
    /// Notification line.
    pub line_id: LineId,
    /// Firmware version negotiated at start.
    pub firmware: FirmwareVersion,
    /// Whether application callbacks are attached.
    pub has_callbacks: bool,
}

#[derive(Clone, Copy, Debug)]
struct Link {
    proc_id: ProcId,
    line_id: LineId,
    command: EventKey,
    reply: EventKey,
    priority: Priority,
}

/// Request in flight on one channel.
struct Request<'a> {
    handle: ChannelHandle,
    verb: Verb,
    slot: &'a Slot,
    seq: u32,
    remote_handle: u32,
    route: Option<EventKey>,
}

impl Request<'_> {
    fn block(&self) -> &ParamBlock {
        self.slot.blocks.param(self.verb)
    }
}

/// Command/control RPC subsystem for one remote processor.
pub struct Rproc {
    config: RprocConfig,
    timeout: RpcTimeout,
    poll: Duration,
    link: Link,
    arena: Arc<Arena>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn NotifyTransport>,
    /// Channel-event keys registered with the transport and their channel count.
    /// Locked across register/unregister calls.
    routes: Mutex<HashMap<EventKey, usize>>,
    firmware: FirmwareVersion,
    shut_down: AtomicBool,
}

impl Rproc {
    /// Maps the shared region, wires the channel pool, hooks the reply event and
    /// negotiates the firmware version.
    pub fn start(config: RprocConfig, platform: Platform) -> Result<Self> {
        config.validate()?;
        let proc_id = platform
            .resolver
            .resolve(&config.remote_processor)
            .ok_or_else(|| Error::UnknownProcessor(config.remote_processor.clone()))?;
        let link = Link {
            proc_id,
            line_id: config.line_id,
            command: EventKey::new(proc_id, config.line_id, config.command_event),
            reply: EventKey::new(proc_id, config.line_id, config.reply_event),
            priority: config.priority,
        };

        let arena = Arc::new(Arena::init(
            platform.mapper,
            config.shm_base.map(PhysAddr::new),
            config.shm_size,
        )?);
        let registry = Arc::new(ChannelRegistry::init(Arc::clone(&arena), config.channels)?);
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        platform
            .transport
            .register_event(link.reply, route(&dispatcher, Dispatcher::on_reply))
            .map_err(|status| Error::CallbackRegistration(status.0))?;

        let mut rproc = Self {
            timeout: config.timeout(),
            poll: config.poll_interval(),
            config,
            link,
            arena,
            registry,
            dispatcher,
            transport: platform.transport,
            routes: Mutex::new(HashMap::new()),
            firmware: FirmwareVersion::from_raw(0),
            shut_down: AtomicBool::new(false),
        };
        let negotiated = firmware::negotiate(
            &rproc.arena,
            &rproc.dispatcher,
            rproc.transport.as_ref(),
            rproc.link.command,
            rproc.link.priority,
            rproc.timeout,
            rproc.poll,
        );
        match negotiated {
            Ok(version) => rproc.firmware = version,
            Err(err) => {
                rproc.shutdown();
                return Err(err);
            }
        }
        rproc.registry.set_firmware(rproc.firmware);
        info!(
            "rproc: {} ready (proc {}, {} channels, firmware {})",
            rproc.config.remote_processor,
            proc_id,
            rproc.registry.capacity(),
            rproc.firmware
        );
        Ok(rproc)
    }

    /// Opens a driver instance on the remote core.
    pub fn create(&self, params: &CreateParams) -> Result<ChannelHandle> {
        self.ensure_caller()?;
        if params.args.len() > MAX_INLINE_ARGS {
            return Err(Error::TooManyArgs { given: params.args.len(), max: MAX_INLINE_ARGS });
        }
        let handle = self
            .registry
            .acquire(self.link.proc_id, self.link.line_id)
            .ok_or(Error::ResourceExhausted(Resource::ChannelPool))?;

        let (remote_handle, event_id) = match self.open(handle, params) {
            Ok(opened) => opened,
            Err(err @ Error::Timeout { .. }) => return Err(err),
            Err(err) => {
                self.registry.release(handle);
                return Err(err);
            }
        };

        let key = EventKey::new(self.link.proc_id, self.link.line_id, event_id);
        match self.bind_route(handle, key) {
            Ok(()) => {}
            Err(Error::CallbackRegistration(status)) => {
                warn!("rproc: {handle} event {event_id} registration failed ({status}); closing");
                if let Err(err) = self.delete(handle) {
                    warn!("rproc: compensating delete of {handle} failed: {err}");
                }
                self.registry.release(handle);
                return Err(Error::CallbackRegistration(status));
            }
            Err(err) => return Err(err),
        }
        info!(
            "rproc: {handle} opened driver {} instance {} (remote {remote_handle:#x}, event {event_id})",
            params.driver_id, params.instance_id
        );
        Ok(handle)
    }

    /// Closes the remote instance and returns the channel to the pool.
    ///
    /// The channel is released on every outcome except [`Error::Timeout`].
    pub fn delete(&self, handle: ChannelHandle) -> Result<i32> {
        self.ensure_caller()?;
        let request = self.begin(handle, Verb::Delete)?;
        if let Some(key) = request.route {
            self.detach_route(handle, key);
        }
        let outcome = self.exchange(&request, |_| {});
        if matches!(outcome, Err(Error::Timeout { .. })) {
            return outcome;
        }
        self.registry.release(handle);
        info!("rproc: {handle} closed");
        remote_status(Verb::Delete, outcome?)
    }

    /// Issues driver command `cmd`. `args` is written to the remote and overwritten
    /// with the words it returns.
    pub fn control(&self, handle: ChannelHandle, cmd: u32, args: &mut [u32]) -> Result<i32> {
        if args.len() > MAX_INLINE_ARGS {
            return Err(Error::TooManyArgs { given: args.len(), max: MAX_INLINE_ARGS });
        }
        let inputs = args.to_vec();
        self.invoke(
            handle,
            Verb::Control,
            |block| {
                block.set(control::CMD, cmd);
                block.set_args(control::ARG_COUNT, control::ARGS, &inputs);
            },
            |block| {
                for (index, arg) in args.iter_mut().enumerate() {
                    *arg = block.get(control::ARGS + index);
                }
            },
        )
    }

    /// Hands the frame list at `frame_list` to stream `stream_id`.
    pub fn queue(&self, handle: ChannelHandle, frame_list: PhysAddr, stream_id: u32) -> Result<i32> {
        self.invoke(
            handle,
            Verb::Queue,
            |block| {
                block.set(queue::FRAME_LIST, frame_list.as_u32());
                block.set(queue::STREAM_ID, stream_id);
            },
            |_| {},
        )
    }

    /// Takes a processed frame list back from stream `stream_id`.
    ///
    /// `remote_timeout` bounds the wait on the remote side and is independent of the
    /// configured RPC timeout.
    pub fn dequeue(
        &self,
        handle: ChannelHandle,
        frame_list: PhysAddr,
        stream_id: u32,
        remote_timeout: u32,
    ) -> Result<i32> {
        self.invoke(
            handle,
            Verb::Dequeue,
            |block| {
                block.set(dequeue::FRAME_LIST, frame_list.as_u32());
                block.set(dequeue::STREAM_ID, stream_id);
                block.set(dequeue::REMOTE_TIMEOUT, remote_timeout);
            },
            |_| {},
        )
    }

    /// Attaches or detaches the application callbacks of an open channel.
    pub fn set_callbacks(
        &self,
        handle: ChannelHandle,
        callbacks: Option<AppCallbacks>,
    ) -> Result<()> {
        self.registry.slot(handle)?.lock_valid(handle)?.callbacks = callbacks;
        Ok(())
    }

    /// Returns a channel left outstanding by a timeout to the pool without
    /// contacting the remote.
    pub fn force_release(&self, handle: ChannelHandle) -> Result<()> {
        let slot = self.registry.slot(handle)?;
        let (route, state) = {
            let mut guard = slot.lock_valid(handle)?;
            (guard.route.take(), guard.state)
        };
        if let Some(key) = route {
            self.detach_route(handle, key);
        }
        self.registry.release(handle);
        warn!("rproc: {handle} force-released while {state}");
        Ok(())
    }

    /// Snapshot of a channel.
    pub fn channel_info(&self, handle: ChannelHandle) -> Result<ChannelInfo> {
        let state = self.registry.slot(handle)?.lock_valid(handle)?;
        Ok(ChannelInfo {
            remote_handle: state.remote_handle,
            event_id: state.event_id,
            state: state.state,
            proc_id: state.proc_id,
            line_id: state.line_id,
            firmware: state.firmware,
            has_callbacks: state.callbacks.is_some(),
        })
    }

    /// Whether `handle` names an open channel of this instance.
    pub fn is_valid(&self, handle: ChannelHandle) -> bool {
        self.registry.validate(handle)
    }

    /// Firmware version reported by the remote at start.
    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    /// Configuration the subsystem was started with.
    pub fn config(&self) -> &RprocConfig {
        &self.config
    }

    /// Size of the channel pool.
    pub fn capacity(&self) -> usize {
        self.registry.capacity()
    }

    /// Channels currently out of the pool.
    pub fn channels_in_use(&self) -> usize {
        self.registry.in_use_count()
    }

    /// Dispatcher counters.
    pub fn dispatch_stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Releases every channel without remote traffic, unhooks the reply event and
    /// unmaps the shared region. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.registry.in_use_handles() {
            let route = self
                .registry
                .slot(handle)
                .ok()
                .and_then(|slot| slot.lock_valid(handle).ok().and_then(|mut s| s.route.take()));
            if let Some(key) = route {
                self.detach_route(handle, key);
            }
            self.registry.release(handle);
        }
        if let Err(status) = self.transport.unregister_event(self.link.reply) {
            warn!("rproc: reply event unregister failed ({status})");
        }
        self.registry.teardown();
        self.arena.teardown();
        info!("rproc: {} shut down", self.config.remote_processor);
    }

    fn ensure_caller(&self) -> Result<()> {
        if in_notification_context() {
            return Err(Error::Reentrant);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }
        Ok(())
    }

    /// Registers the channel event `key` for `handle` and records it on the slot.
    fn bind_route(&self, handle: ChannelHandle, key: EventKey) -> Result<()> {
        self.attach_route(key).map_err(|status| Error::CallbackRegistration(status.0))?;
        let bound = self
            .registry
            .slot(handle)
            .and_then(|slot| slot.lock_valid(handle).map(|mut state| state.route = Some(key)));
        if bound.is_err() {
            // Released underneath us, e.g. by shutdown.
            self.detach_route(handle, key);
        }
        bound
    }

    fn attach_route(&self, key: EventKey) -> core::result::Result<(), NotifyStatus> {
        let mut routes = self.routes.lock();
        if let Some(channels) = routes.get_mut(&key) {
            *channels += 1;
            return Ok(());
        }
        self.transport.register_event(key, route(&self.dispatcher, Dispatcher::on_channel_event))?;
        routes.insert(key, 1);
        Ok(())
    }

    /// Drops one channel from `key`; the last one unregisters it.
    fn detach_route(&self, handle: ChannelHandle, key: EventKey) {
        let mut routes = self.routes.lock();
        let Some(channels) = routes.get_mut(&key) else {
            return;
        };
        *channels -= 1;
        if *channels > 0 {
            return;
        }
        routes.remove(&key);
        if let Err(status) = self.transport.unregister_event(key) {
            warn!("rproc: {handle} unregister of {key} failed ({status})");
        }
    }

    /// Runs the create exchange on a freshly acquired channel.
    fn open(&self, handle: ChannelHandle, params: &CreateParams) -> Result<(u32, u32)> {
        let request = self.begin(handle, Verb::Create)?;
        let callback_block = request.slot.blocks.callback.phys().as_u32();
        let status = self.exchange(&request, |block| {
            block.set(create::DRIVER_ID, params.driver_id);
            block.set(create::INSTANCE_ID, params.instance_id);
            block.set(create::CALLBACK_BLOCK, callback_block);
            block.set_args(create::ARG_COUNT, create::ARGS, &params.args);
        })?;
        remote_status(Verb::Create, status)?;

        let block = request.block();
        let remote_handle = block.get(header::HANDLE);
        let event_id = block.get(create::EVENT_ID);
        if remote_handle == HANDLE_NONE {
            return Err(Error::MalformedReply("create completed without a remote handle"));
        }

        let mut state = request.slot.lock_valid(handle)?;
        state.remote_handle = remote_handle;
        state.event_id = Some(event_id);
        state.callbacks = params.callbacks.clone();
        state.state = ChannelState::Ready;
        Ok((remote_handle, event_id))
    }

    /// Runs a verb on an open channel and returns it to `Ready` unless it timed out.
    fn invoke(
        &self,
        handle: ChannelHandle,
        verb: Verb,
        populate: impl FnOnce(&ParamBlock),
        collect: impl FnOnce(&ParamBlock),
    ) -> Result<i32> {
        self.ensure_caller()?;
        let request = self.begin(handle, verb)?;
        let outcome = self.exchange(&request, populate);
        match outcome {
            Err(Error::Timeout { .. }) => return outcome,
            Ok(_) => collect(request.block()),
            Err(_) => {}
        }
        self.settle(&request, ChannelState::Ready);
        remote_status(verb, outcome?)
    }

    /// Moves the channel into the verb state and reserves a sequence number.
    fn begin(&self, handle: ChannelHandle, verb: Verb) -> Result<Request<'_>> {
        let slot = self.registry.slot(handle)?;
        let mut state = slot.lock_valid(handle)?;
        let expected = match verb {
            Verb::Create => ChannelState::Creating,
            _ => ChannelState::Ready,
        };
        if state.state != expected {
            return Err(Error::Busy { state: state.state });
        }
        state.state = verb.state();
        let seq = state.next_seq();
        let route = match verb {
            Verb::Delete => state.route.take(),
            _ => None,
        };
        Ok(Request { handle, verb, slot, seq, remote_handle: state.remote_handle, route })
    }

    /// Publishes the request and waits for the remote to complete it.
    fn exchange(&self, request: &Request<'_>, populate: impl FnOnce(&ParamBlock)) -> Result<i32> {
        let block = request.block();
        block.arm(request.verb.tag(), request.seq, request.remote_handle);
        populate(block);
        let envelope = &request.slot.blocks.envelope;
        envelope.point_at(request.seq, block.phys());

        debug!("rproc: {} {} seq {}", request.handle, request.verb, request.seq);
        self.transport
            .send_event(self.link.command, envelope.phys().as_u32(), self.link.priority)
            .map_err(|status| {
                warn!("rproc: {} {} send failed ({status})", request.handle, request.verb);
                Error::Transport(status.0)
            })?;

        let doorbell = &request.slot.doorbell;
        match wait_completion(doorbell, block, request.seq, self.timeout, self.poll) {
            Some(status) => Ok(status),
            None => {
                warn!(
                    "rproc: {} {} seq {} timed out; channel stays {}",
                    request.handle,
                    request.verb,
                    request.seq,
                    request.verb.state()
                );
                Err(Error::Timeout {
                    verb: request.verb,
                    channel: request.handle,
                    timeout_ms: self.timeout.as_millis(),
                })
            }
        }
    }

    /// Leaves the verb state unless the channel was released meanwhile.
    fn settle(&self, request: &Request<'_>, next: ChannelState) {
        if let Ok(mut state) = request.slot.lock_valid(request.handle) {
            if state.state == request.verb.state() {
                state.state = next;
            }
        }
    }
}

impl Drop for Rproc {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Rproc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rproc")
            .field("remote", &self.config.remote_processor)
            .field("proc_id", &self.link.proc_id)
            .field("firmware", &self.firmware)
            .field("channels", &self.registry.capacity())
            .field("in_use", &self.registry.in_use_count())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

fn remote_status(verb: Verb, status: i32) -> Result<i32> {
    if status < 0 {
        Err(Error::RemoteStatus { verb, status })
    } else {
        Ok(status)
    }
}

/// Transport callback forwarding to `handler` while the dispatcher is alive.
fn route(dispatcher: &Arc<Dispatcher>, handler: fn(&Dispatcher, Notification)) -> EventCallback {
    let dispatcher: Weak<Dispatcher> = Arc::downgrade(dispatcher);
    Arc::new(move |notification: Notification| {
        if let Some(dispatcher) = dispatcher.upgrade() {
            handler(&dispatcher, notification);
        }
    })
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use nexus_shm::PAGE_SIZE;

    use super::*;
    use crate::host::{HostRig, HOST_PROC_ID};

    fn started() -> (HostRig, Rproc) {
        let config = RprocConfig {
            timeout_ms: 200,
            shm_size: Some(16 * PAGE_SIZE),
            channels: 4,
            ..RprocConfig::default()
        };
        let rig = HostRig::new(&config);
        let rproc = Rproc::start(config, rig.platform()).unwrap();
        (rig, rproc)
    }

    #[test]
    fn route_to_released_channel_is_undone() {
        let (rig, rproc) = started();
        let stale = rproc.registry.acquire(HOST_PROC_ID, 0).unwrap();
        rproc.registry.release(stale);

        let key = EventKey::new(HOST_PROC_ID, 0, 77);
        assert!(matches!(rproc.bind_route(stale, key), Err(Error::InvalidHandle)));
        assert!(!rig.notify.is_registered(key));
        assert!(rproc.routes.lock().is_empty());
    }

    #[test]
    fn undone_route_keeps_shared_registration() {
        let (rig, rproc) = started();
        rig.remote.set_fixed_event(Some(77));
        let open = rproc.create(&CreateParams::new(1, 0)).unwrap();
        let key = EventKey::new(HOST_PROC_ID, 0, 77);

        let stale = rproc.registry.acquire(HOST_PROC_ID, 0).unwrap();
        rproc.registry.release(stale);
        assert!(rproc.bind_route(stale, key).is_err());
        assert!(rig.notify.is_registered(key));
        assert_eq!(rproc.routes.lock().get(&key), Some(&1));

        rproc.delete(open).unwrap();
        assert!(!rig.notify.is_registered(key));
    }
}
