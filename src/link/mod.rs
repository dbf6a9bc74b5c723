//! Links: transport workers, handles, and the registry that owns them.
//!
//! Every link pairs a [`LinkHandle`], the stable identity its owners keep,
//! with a worker running on a dedicated thread that owns the actual endpoint.
//! The two sides talk exclusively through queues: commands flow in
//! ([`WorkerCommand`]), events flow out ([`LinkEvent`]).

pub mod config;
pub mod handle;
pub mod registry;

mod serial;
mod udp;

pub use config::{LinkConfig, LinkKind, SerialSettings, UdpPeer, UdpSettings};
pub use handle::LinkHandle;
pub use registry::LinkRegistry;

use std::sync::atomic::AtomicBool;
use std::sync::{mpsc, Arc};

use crate::utils::{mpmc, Closable};

/// Commands accepted by a transport worker, processed in FIFO order on the
/// worker's own thread.
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Connect,
    Disconnect,
    Write(Vec<u8>),
}

/// Events emitted by a transport worker, delivered out of the worker's
/// context. Receivers are free to re-enter the worker with further commands.
#[derive(Clone, Debug)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    BytesReceived(Vec<u8>),
    BytesSent(Vec<u8>),
    Error(String),
}

/// Everything a worker needs from its handle.
pub(crate) struct WorkerContext {
    pub(crate) config: Arc<LinkConfig>,
    pub(crate) commands: mpsc::Receiver<WorkerCommand>,
    pub(crate) events: mpmc::Sender<LinkEvent>,
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) state: Closable,
}

impl WorkerContext {
    /// Emits an event, ignoring the absence of subscribers.
    pub(crate) fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}
