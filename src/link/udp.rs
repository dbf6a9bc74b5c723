//! UDP transport worker.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Mutex};
use std::thread;

use crate::consts::{UDP_MULTICAST_GROUP, UDP_READ_TIMEOUT, UDP_RECV_BUFFER_SIZE, WORKER_IDLE_POLL};
use crate::link::config::UdpSettings;
use crate::link::{LinkEvent, WorkerCommand, WorkerContext};
use crate::utils::net::normalize_sender;

pub(crate) fn spawn(ctx: WorkerContext) -> thread::JoinHandle<()> {
    thread::spawn(move || UdpWorker::new(ctx).run())
}

struct UdpWorker {
    ctx: WorkerContext,
    settings: UdpSettings,
    socket: Option<UdpSocket>,
    /// Peers discovered from received datagrams. Guarded so the send fan-out
    /// iterates a consistent snapshot while receives append.
    session_targets: Mutex<Vec<SocketAddr>>,
    error_emitted: bool,
}

impl UdpWorker {
    fn new(ctx: WorkerContext) -> Self {
        let settings = ctx
            .config
            .udp_settings()
            .expect("UDP worker requires a UDP configuration")
            .clone();
        Self {
            ctx,
            settings,
            socket: None,
            session_targets: Mutex::new(Vec::new()),
            error_emitted: false,
        }
    }

    fn name(&self) -> &str {
        self.ctx.config.name()
    }

    fn run(mut self) {
        log::debug!("[{}] UDP worker started", self.name());

        loop {
            if self.ctx.state.is_closed() {
                break;
            }

            let mut exit = false;
            loop {
                match self.ctx.commands.try_recv() {
                    Ok(command) => {
                        if self.handle_command(command) {
                            exit = true;
                            break;
                        }
                    }
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        exit = true;
                        break;
                    }
                }
            }
            if exit {
                break;
            }

            if self.socket.is_some() {
                self.poll_read();
            } else {
                match self.ctx.commands.recv_timeout(WORKER_IDLE_POLL) {
                    Ok(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }

        self.release();
        log::debug!("[{}] UDP worker stopped", self.name());
    }

    /// Returns `true` when the worker should exit.
    fn handle_command(&mut self, command: WorkerCommand) -> bool {
        match command {
            WorkerCommand::Connect => {
                self.connect();
                false
            }
            WorkerCommand::Disconnect => true,
            WorkerCommand::Write(data) => {
                self.write(&data);
                false
            }
        }
    }

    fn connect(&mut self) {
        if self.socket.is_some() {
            log::warn!("[{}] already bound to port {}", self.name(), self.settings.local_port);
            return;
        }

        self.error_emitted = false;

        log::debug!("[{}] binding to port {}", self.name(), self.settings.local_port);
        let socket = match bind_reusable(self.settings.local_port) {
            Ok(socket) => socket,
            Err(err) => {
                log::warn!(
                    "[{}] failed to bind UDP socket to port {}: {err}",
                    self.name(),
                    self.settings.local_port
                );
                self.emit_error(format!("Failed to bind UDP socket to port: {err}"));
                return;
            }
        };

        if let Err(err) = socket.set_read_timeout(Some(UDP_READ_TIMEOUT)) {
            log::warn!("[{}] failed to set read timeout: {err}", self.name());
        }

        // Local peers find each other through the all-hosts group; a failed
        // join is not fatal.
        match socket.join_multicast_v4(&UDP_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => log::debug!("[{}] joined multicast group {UDP_MULTICAST_GROUP}", self.name()),
            Err(err) => log::warn!(
                "[{}] failed to join multicast group {UDP_MULTICAST_GROUP}: {err}",
                self.name()
            ),
        }

        self.socket = Some(socket);
        self.ctx.connected.store(true, Ordering::Release);
        self.error_emitted = false;
        self.ctx.emit(LinkEvent::Connected);
        log::debug!("[{}] bound to port {}", self.name(), self.settings.local_port);
    }

    fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.emit_error("Data to send is empty".to_string());
            return;
        }

        let Some(socket) = self.socket.as_ref() else {
            self.emit_error("Could not send data - link is disconnected".to_string());
            return;
        };

        // Snapshot under the lock: configured peers that have not announced
        // themselves as session peers, then every session peer.
        let targets: Vec<SocketAddr> = {
            let session = self.session_targets.lock().unwrap();
            self.settings
                .hosts()
                .iter()
                .map(|peer| peer.socket_addr())
                .filter(|addr| !session.contains(addr))
                .chain(session.iter().copied())
                .collect()
        };

        for target in targets {
            if let Err(err) = socket.send_to(data, target) {
                if err.kind() == io::ErrorKind::ConnectionRefused {
                    // ICMP unreachable from an absent peer; UDP has no
                    // connection to lose.
                    log::trace!("[{}] send to {target} refused", self.name());
                } else {
                    log::warn!("[{}] could not send data to {target}: {err}", self.name());
                }
            }
        }

        self.ctx.emit(LinkEvent::BytesSent(data.to_vec()));
    }

    fn poll_read(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };

        let mut buf = [0u8; UDP_RECV_BUFFER_SIZE];
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => {}
            Ok((n, sender)) => {
                self.ctx.emit(LinkEvent::BytesReceived(buf[..n].to_vec()));

                let sender = normalize_sender(sender);
                let mut session = self.session_targets.lock().unwrap();
                if !session.contains(&sender) {
                    log::debug!("[{}] adding session target {sender}", self.name());
                    session.push(sender);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {}
            Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                log::trace!("[{}] receive observed ICMP unreachable", self.name());
            }
            Err(err) => {
                log::warn!("[{}] socket receive error: {err}", self.name());
                self.emit_error(format!("Socket receive failed: {err}"));
            }
        }
    }

    fn release(&mut self) {
        if let Some(socket) = self.socket.take() {
            let _ = socket.leave_multicast_v4(&UDP_MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED);
            drop(socket);
        }
        self.session_targets.lock().unwrap().clear();
        if self.ctx.connected.swap(false, Ordering::AcqRel) {
            self.error_emitted = false;
            self.ctx.emit(LinkEvent::Disconnected);
            log::debug!("[{}] unbound from port {}", self.name(), self.settings.local_port);
        }
    }

    /// At most one error event per connected session.
    fn emit_error(&mut self, message: String) {
        log::warn!("[{}] {message}", self.name());
        if !self.error_emitted {
            self.ctx.emit(LinkEvent::Error(message));
            self.error_emitted = true;
        }
    }
}

/// Binds an any-IPv4 UDP socket with address reuse, so several workers (or
/// several bridge instances on one machine) can share a port.
fn bind_reusable(port: u16) -> io::Result<UdpSocket> {
    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
