//! Link handles.
//!
//! A [`LinkHandle`] is the stable identity of a transport, independent of the
//! worker thread that owns the endpoint. The handle exposes queued `connect`
//! / `disconnect` / `write` operations that are safe to call from any thread,
//! and carries the parser channel id allocated to the link.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use mavio::protocol::MavLinkVersion;

use crate::channel::{ChannelId, INVALID_CHANNEL};
use crate::consts::DISCONNECT_TIMEOUT;
use crate::errors::{Error, Result};
use crate::link::config::{LinkConfig, LinkKind};
use crate::link::{serial, udp, LinkEvent, WorkerCommand, WorkerContext};
use crate::utils::{mpmc, Closable, SharedCloser};

pub struct LinkHandle {
    config: Arc<LinkConfig>,
    channel: AtomicU8,
    out_mavlink1: AtomicBool,
    connected: Arc<AtomicBool>,
    commands: mpsc::Sender<WorkerCommand>,
    events: mpmc::Sender<LinkEvent>,
    state: SharedCloser,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LinkHandle {
    /// Spawns the variant-appropriate worker for `config` and returns its
    /// handle. The worker starts idle; issue [`LinkHandle::connect`] to open
    /// the endpoint.
    pub(crate) fn start(config: Arc<LinkConfig>) -> Arc<Self> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let events = mpmc::Sender::new();
        let connected = Arc::new(AtomicBool::new(false));
        let state = SharedCloser::new();

        let ctx = WorkerContext {
            config: config.clone(),
            commands: commands_rx,
            events: events.clone(),
            connected: connected.clone(),
            state: state.to_closable(),
        };

        let worker = match config.kind() {
            LinkKind::Serial(_) => serial::spawn(ctx),
            LinkKind::Udp(_) => udp::spawn(ctx),
        };

        Arc::new(Self {
            config,
            channel: AtomicU8::new(INVALID_CHANNEL),
            out_mavlink1: AtomicBool::new(false),
            connected,
            commands: commands_tx,
            events,
            state,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &Arc<LinkConfig> {
        &self.config
    }

    /// Parser channel id, or [`INVALID_CHANNEL`] until the link is opened.
    pub fn channel(&self) -> ChannelId {
        self.channel.load(Ordering::Acquire)
    }

    pub fn channel_is_set(&self) -> bool {
        self.channel() != INVALID_CHANNEL
    }

    /// MAVLink version the bridge packs outgoing frames with on this link's
    /// channel.
    pub fn out_version(&self) -> MavLinkVersion {
        if self.out_mavlink1.load(Ordering::Acquire) {
            MavLinkVersion::V1
        } else {
            MavLinkVersion::V2
        }
    }

    pub(crate) fn set_channel(&self, channel: ChannelId, out_version: MavLinkVersion) {
        self.channel.store(channel, Ordering::Release);
        self.out_mavlink1
            .store(matches!(out_version, MavLinkVersion::V1), Ordering::Release);
    }

    /// Clears the channel slot, returning the id that was set.
    pub(crate) fn take_channel(&self) -> ChannelId {
        self.channel.swap(INVALID_CHANNEL, Ordering::AcqRel)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Subscribes to this link's event stream. Only events emitted after the
    /// subscription are observed.
    pub fn events(&self) -> mpmc::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Read-only view of the link's teardown state, for tasks that must not
    /// outlive the handle.
    pub(crate) fn closed_state(&self) -> Closable {
        self.state.to_closable()
    }

    /// Queues a connection attempt on the worker.
    pub fn connect(&self) -> Result<()> {
        self.commands
            .send(WorkerCommand::Connect)
            .map_err(Error::from)
    }

    /// Queues a disconnect. Idempotent: once the worker has released its
    /// endpoint further calls are ignored.
    pub fn disconnect(&self) {
        let _ = self.commands.send(WorkerCommand::Disconnect);
    }

    /// Queues `bytes` for transmission. Safe to call from any thread; the
    /// worker performs the actual write on its own context.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::InvalidArgument("data to send is empty"));
        }
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.commands
            .send(WorkerCommand::Write(bytes.to_vec()))
            .map_err(Error::from)
    }

    /// Tears the link down: releases the endpoint and waits for the worker
    /// thread to exit, up to [`DISCONNECT_TIMEOUT`].
    pub(crate) fn shutdown(&self) {
        self.state.close();
        let _ = self.commands.send(WorkerCommand::Disconnect);

        let Some(worker) = self.worker.lock().unwrap().take() else {
            return;
        };

        let deadline = Instant::now() + DISCONNECT_TIMEOUT;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(10));
        }

        if worker.is_finished() {
            let _ = worker.join();
        } else {
            log::warn!(
                "[{}] worker thread did not stop within {DISCONNECT_TIMEOUT:?}",
                self.config.name()
            );
        }
    }
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("name", &self.config.name())
            .field("channel", &self.channel())
            .field("connected", &self.is_connected())
            .finish()
    }
}
