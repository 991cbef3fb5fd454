// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process remote core emulation for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - struct LoopbackNotify: NotifyTransport with in-memory callback table
//!   - struct SimRemote: scripted firmware running on its own thread
//!   - struct StaticResolver: fixed processor name table
//!   - struct HostRig: mapper + transport + remote wired for one config
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code; the remote touches shared memory through PhysView only
//!   - Callbacks are invoked without the transport lock held
//!
//! SimRemote answers every command on a worker thread: it decodes the envelope,
//! applies the scripted [`Reply`] for the command tag, writes `RESULT` then `ACK`
//! and posts the envelope address on the reply event.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use nexus_shm::host::{HostMapper, PhysView};
use nexus_shm::PhysAddr;
use parking_lot::Mutex;

use crate::client::Platform;
use crate::config::RprocConfig;
use crate::firmware::{FirmwareVersion, FIRMWARE_VERSION};
use crate::transport::{
    EventCallback, EventKey, Notification, NotifyStatus, NotifyTransport, Priority, ProcId,
    ProcResolver,
};
use crate::wire::{
    callback, control, create, envelope, header, version, CMD_CONTROL, CMD_CREATE, CMD_DELETE,
    CMD_GET_VERSION, ENVELOPE_SINGLE, MAX_INLINE_ARGS, PARAM_BLOCK_BYTES,
};

/// Generic failure.
pub const E_FAIL: i32 = -1;
/// Event already has a callback.
pub const E_ALREADY: i32 = -2;
/// Event has no callback.
pub const E_NOT_FOUND: i32 = -3;
/// Nothing listens on the remote side.
pub const E_NOT_READY: i32 = -4;

/// Processor id [`HostRig`] assigns to the configured remote.
pub const HOST_PROC_ID: ProcId = 3;

#[derive(Default)]
struct LoopbackState {
    callbacks: HashMap<EventKey, EventCallback>,
    remote: Option<Sender<Notification>>,
    sends: usize,
    fail_sends: Option<i32>,
    fail_registrations: Option<i32>,
}

/// [`NotifyTransport`] that forwards sends to an attached remote and delivers
/// remote events to registered callbacks on the calling thread.
#[derive(Default)]
pub struct LoopbackNotify {
    state: Mutex<LoopbackState>,
}

impl LoopbackNotify {
    /// Creates a transport with no remote attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes every subsequent send to `remote`.
    pub fn attach_remote(&self, remote: Sender<Notification>) {
        self.state.lock().remote = Some(remote);
    }

    /// Delivers an event as if raised by the remote. Returns `false` if no
    /// callback is registered for `key`.
    pub fn deliver(&self, key: EventKey, payload: u32) -> bool {
        let callback = self.state.lock().callbacks.get(&key).cloned();
        match callback {
            Some(callback) => {
                callback(Notification { key, payload });
                true
            }
            None => {
                debug!("loopback: no callback for {key}");
                false
            }
        }
    }

    /// Makes sends fail with `status` until cleared with `None`.
    pub fn fail_sends(&self, status: Option<i32>) {
        self.state.lock().fail_sends = status;
    }

    /// Makes registrations fail with `status` until cleared with `None`.
    pub fn fail_registrations(&self, status: Option<i32>) {
        self.state.lock().fail_registrations = status;
    }

    /// Successful sends so far.
    pub fn sends(&self) -> usize {
        self.state.lock().sends
    }

    /// Whether a callback is registered for `key`.
    pub fn is_registered(&self, key: EventKey) -> bool {
        self.state.lock().callbacks.contains_key(&key)
    }

    /// Number of registered callbacks.
    pub fn registered(&self) -> usize {
        self.state.lock().callbacks.len()
    }
}

impl NotifyTransport for LoopbackNotify {
    fn send_event(
        &self,
        key: EventKey,
        payload: u32,
        _priority: Priority,
    ) -> Result<(), NotifyStatus> {
        let mut state = self.state.lock();
        if let Some(status) = state.fail_sends {
            return Err(NotifyStatus(status));
        }
        let remote = state.remote.as_ref().ok_or(NotifyStatus(E_NOT_READY))?;
        remote.send(Notification { key, payload }).map_err(|_| NotifyStatus(E_NOT_READY))?;
        state.sends += 1;
        Ok(())
    }

    fn register_event(&self, key: EventKey, callback: EventCallback) -> Result<(), NotifyStatus> {
        let mut state = self.state.lock();
        if let Some(status) = state.fail_registrations {
            return Err(NotifyStatus(status));
        }
        if state.callbacks.contains_key(&key) {
            return Err(NotifyStatus(E_ALREADY));
        }
        state.callbacks.insert(key, callback);
        Ok(())
    }

    fn unregister_event(&self, key: EventKey) -> Result<(), NotifyStatus> {
        match self.state.lock().callbacks.remove(&key) {
            Some(_) => Ok(()),
            None => Err(NotifyStatus(E_NOT_FOUND)),
        }
    }
}

/// How [`SimRemote`] answers a command tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Complete immediately with the status.
    Now(i32),
    /// Complete with the status after the delay.
    After(Duration, i32),
    /// Never complete.
    Never,
}

/// Command observed by [`SimRemote`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    /// Command tag.
    pub tag: u32,
    /// Request sequence from the parameter block.
    pub seq: u32,
    /// Remote handle the request addressed.
    pub handle: u32,
    /// Envelope address posted on the command event.
    pub envelope: u32,
    /// Payload words after the header.
    pub payload: Vec<u32>,
}

struct Instance {
    event_id: u32,
    callback_block: PhysAddr,
}

struct Script {
    replies: HashMap<u32, Reply>,
    version: FirmwareVersion,
    next_handle: u32,
    next_event: u32,
    fixed_event: Option<u32>,
    instances: HashMap<u32, Instance>,
    commands: Vec<Command>,
}

struct RemoteCore {
    view: PhysView,
    notify: Weak<LoopbackNotify>,
    command: EventKey,
    reply: EventKey,
    script: Mutex<Script>,
}

/// Scripted remote firmware.
///
/// Defaults: every command completes with status 0, create hands out remote
/// handles from `0x1000` and events from 42, control returns each argument plus
/// one, and the reported firmware is [`FIRMWARE_VERSION`].
#[derive(Clone)]
pub struct SimRemote {
    core: Arc<RemoteCore>,
}

impl SimRemote {
    /// Attaches a remote to `notify` that serves commands posted on `command`
    /// and answers on `reply`.
    pub fn spawn(
        notify: &Arc<LoopbackNotify>,
        view: PhysView,
        command: EventKey,
        reply: EventKey,
    ) -> Self {
        let core = Arc::new(RemoteCore {
            view,
            notify: Arc::downgrade(notify),
            command,
            reply,
            script: Mutex::new(Script {
                replies: HashMap::new(),
                version: FIRMWARE_VERSION,
                next_handle: 0x1000,
                next_event: 42,
                fixed_event: None,
                instances: HashMap::new(),
                commands: Vec::new(),
            }),
        });
        let (tx, rx) = mpsc::channel();
        notify.attach_remote(tx);
        let worker = Arc::clone(&core);
        thread::spawn(move || worker.serve(rx));
        Self { core }
    }

    /// Scripts the answer for command `tag`.
    pub fn set_reply(&self, tag: u32, reply: Reply) {
        self.core.script.lock().replies.insert(tag, reply);
    }

    /// Firmware version reported to the version query.
    pub fn set_version(&self, version: FirmwareVersion) {
        self.core.script.lock().version = version;
    }

    /// Remote handle the next successful create returns.
    pub fn set_next_handle(&self, handle: u32) {
        self.core.script.lock().next_handle = handle;
    }

    /// Makes every create report `event` instead of a fresh id; `None` restores
    /// fresh ids.
    pub fn set_fixed_event(&self, event: Option<u32>) {
        self.core.script.lock().fixed_event = event;
    }

    /// Commands received so far, in arrival order.
    pub fn commands(&self) -> Vec<Command> {
        self.core.script.lock().commands.clone()
    }

    /// Commands received with `tag`.
    pub fn commands_with(&self, tag: u32) -> Vec<Command> {
        self.commands().into_iter().filter(|cmd| cmd.tag == tag).collect()
    }

    /// Number of open remote instances.
    pub fn open_instances(&self) -> usize {
        self.core.script.lock().instances.len()
    }

    /// Writes the callback block of `remote_handle` and raises its channel event.
    ///
    /// Returns `false` if the handle is unknown or nobody listens on the event.
    pub fn raise_callback(&self, remote_handle: u32, kind: u32, aux: u32) -> bool {
        let target = self
            .core
            .script
            .lock()
            .instances
            .get(&remote_handle)
            .map(|instance| (instance.event_id, instance.callback_block));
        let Some((event_id, block)) = target else {
            return false;
        };
        let view = &self.core.view;
        view.write_word(block, callback::AUX, aux);
        view.write_word(block, callback::HANDLE, remote_handle);
        view.write_word(block, callback::KIND, kind);
        let key = EventKey::new(self.core.command.proc_id, self.core.command.line_id, event_id);
        self.core.notify.upgrade().is_some_and(|notify| notify.deliver(key, block.as_u32()))
    }
}

impl RemoteCore {
    fn serve(self: Arc<Self>, rx: Receiver<Notification>) {
        while let Ok(notification) = rx.recv() {
            if notification.key != self.command {
                warn!("sim-remote: event on unexpected {}", notification.key);
                continue;
            }
            Arc::clone(&self).handle(PhysAddr::new(notification.payload));
        }
    }

    fn handle(self: Arc<Self>, envelope_phys: PhysAddr) {
        let view = &self.view;
        let word = |base, index| view.read_word(base, index).unwrap_or(0);
        if word(envelope_phys, envelope::KIND) != ENVELOPE_SINGLE {
            warn!("sim-remote: bad envelope at {envelope_phys}");
            return;
        }
        let param = PhysAddr::new(word(envelope_phys, envelope::PARAM));
        let command = Command {
            tag: word(param, header::COMMAND),
            seq: word(param, header::SEQ),
            handle: word(param, header::HANDLE),
            envelope: envelope_phys.as_u32(),
            payload: (header::PAYLOAD..PARAM_BLOCK_BYTES / 4).map(|i| word(param, i)).collect(),
        };

        let reply = {
            let mut script = self.script.lock();
            script.commands.push(command.clone());
            script.replies.get(&command.tag).copied().unwrap_or(Reply::Now(0))
        };
        match reply {
            Reply::Now(status) => self.complete(param, &command, status),
            Reply::After(delay, status) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    self.complete(param, &command, status);
                });
            }
            Reply::Never => debug!("sim-remote: dropping command {:#x}", command.tag),
        }
    }

    fn complete(&self, param: PhysAddr, command: &Command, status: i32) {
        let view = &self.view;
        if status >= 0 {
            self.apply(param, command);
        }
        view.write_word(param, header::RESULT, status as u32);
        view.write_word(param, header::ACK, command.seq);
        if let Some(notify) = self.notify.upgrade() {
            notify.deliver(self.reply, command.envelope);
        }
    }

    fn apply(&self, param: PhysAddr, command: &Command) {
        let view = &self.view;
        let payload = |index: usize| command.payload[index - header::PAYLOAD];
        let mut script = self.script.lock();
        match command.tag {
            CMD_CREATE => {
                let handle = script.next_handle;
                let event_id = script.fixed_event.unwrap_or(script.next_event);
                script.next_handle = handle.wrapping_add(0x100);
                if script.fixed_event.is_none() {
                    script.next_event += 1;
                }
                let callback_block = PhysAddr::new(payload(create::CALLBACK_BLOCK));
                script.instances.insert(handle, Instance { event_id, callback_block });
                view.write_word(param, header::HANDLE, handle);
                view.write_word(param, create::EVENT_ID, event_id);
            }
            CMD_DELETE => {
                script.instances.remove(&command.handle);
            }
            CMD_CONTROL => {
                let count = (payload(control::ARG_COUNT) as usize).min(MAX_INLINE_ARGS);
                for index in 0..count {
                    let arg = payload(control::ARGS + index);
                    view.write_word(param, control::ARGS + index, arg.wrapping_add(1));
                }
            }
            CMD_GET_VERSION => {
                view.write_word(param, version::VERSION, script.version.raw());
            }
            _ => {}
        }
    }
}

/// Resolver over a fixed name table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    names: HashMap<String, ProcId>,
}

impl StaticResolver {
    /// Builds the table from `(name, id)` pairs.
    pub fn new(entries: &[(&str, ProcId)]) -> Self {
        Self { names: entries.iter().map(|(name, id)| (name.to_string(), *id)).collect() }
    }
}

impl ProcResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<ProcId> {
        self.names.get(name).copied()
    }
}

/// Host platform for one configuration: heap-backed shared memory, loopback
/// transport and a simulated remote listening on the configured events.
pub struct HostRig {
    /// Shared memory mapper; its physical view backs the remote.
    pub mapper: HostMapper,
    /// Transport between the cores.
    pub notify: Arc<LoopbackNotify>,
    /// Simulated firmware.
    pub remote: SimRemote,
    /// Resolves the configured remote name to [`HOST_PROC_ID`].
    pub resolver: Arc<StaticResolver>,
}

impl HostRig {
    /// Wires a rig for `config`.
    pub fn new(config: &RprocConfig) -> Self {
        let mapper = HostMapper::new();
        let notify = Arc::new(LoopbackNotify::new());
        let command = EventKey::new(HOST_PROC_ID, config.line_id, config.command_event);
        let reply = EventKey::new(HOST_PROC_ID, config.line_id, config.reply_event);
        let remote = SimRemote::spawn(&notify, mapper.phys_view(), command, reply);
        let resolver =
            Arc::new(StaticResolver::new(&[(config.remote_processor.as_str(), HOST_PROC_ID)]));
        Self { mapper, notify, remote, resolver }
    }

    /// Platform handles for [`crate::Rproc::start`].
    pub fn platform(&self) -> Platform {
        Platform {
            mapper: Arc::new(self.mapper.clone()),
            transport: Arc::clone(&self.notify) as Arc<dyn NotifyTransport>,
            resolver: Arc::clone(&self.resolver) as Arc<dyn ProcResolver>,
        }
    }
}
