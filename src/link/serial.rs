//! Serial transport worker.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use serialport::SerialPort;

use crate::boards;
use crate::consts::{PORT_AVAILABILITY_INTERVAL, SERIAL_READ_TIMEOUT, WORKER_IDLE_POLL};
use crate::link::config::SerialSettings;
use crate::link::{LinkEvent, WorkerCommand, WorkerContext};

pub(crate) fn spawn(ctx: WorkerContext) -> thread::JoinHandle<()> {
    thread::spawn(move || SerialWorker::new(ctx).run())
}

struct SerialWorker {
    ctx: WorkerContext,
    settings: SerialSettings,
    port: Option<Box<dyn SerialPort>>,
    error_emitted: bool,
    last_availability_check: Instant,
}

impl SerialWorker {
    fn new(ctx: WorkerContext) -> Self {
        let settings = ctx
            .config
            .serial_settings()
            .expect("serial worker requires a serial configuration")
            .clone();
        Self {
            ctx,
            settings,
            port: None,
            error_emitted: false,
            last_availability_check: Instant::now(),
        }
    }

    fn name(&self) -> &str {
        self.ctx.config.name()
    }

    fn run(mut self) {
        log::debug!("[{}] serial worker started", self.name());

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

            if self.port.is_some() {
                self.poll_read();
                self.check_port_availability();
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
        log::debug!("[{}] serial worker stopped", self.name());
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
        if self.port.is_some() {
            log::warn!("[{}] already connected to {}", self.name(), self.settings.port_path);
            return;
        }

        // A board still in its bootloader must not be opened: the autoconnect
        // probe would latch onto a transient DFU device. Diagnostic only, no
        // error event.
        if let Some(info) = boards::port_info(&self.settings.port_path) {
            if boards::is_bootloader(&info) {
                log::info!(
                    "[{}] bootloader detected on {}, not opening",
                    self.name(),
                    self.settings.port_path
                );
                return;
            }
        }

        self.error_emitted = false;

        log::debug!("[{}] opening port {}", self.name(), self.settings.port_path);
        let port = serialport::new(&self.settings.port_path, self.settings.baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .open();

        let mut port = match port {
            Ok(port) => port,
            Err(err) => {
                log::warn!(
                    "[{}] opening port {} failed: {err}",
                    self.name(),
                    self.settings.port_path
                );
                // Auto-connect links see permission and resource failures
                // whenever a board is rebooting or a cable was pulled; the
                // port will reappear on its own.
                if !(self.ctx.config.is_auto_connect() && is_transient_open_error(&err)) {
                    self.emit_error(format!("Could not open port: {err}"));
                }
                return;
            }
        };

        // The device is ready once `open` returns; assert DTR first, then
        // apply the configured framing.
        if let Err(err) = port.write_data_terminal_ready(true) {
            log::warn!("[{}] failed to assert DTR: {err}", self.name());
        }
        apply_settings(port.as_mut(), &self.settings);

        self.port = Some(port);
        self.ctx.connected.store(true, Ordering::Release);
        self.error_emitted = false;
        self.ctx.emit(LinkEvent::Connected);
        log::debug!("[{}] port connected: {}", self.name(), self.settings.port_path);
    }

    fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.emit_error("Data to send is empty".to_string());
            return;
        }
        if self.port.is_none() {
            self.emit_error("Port is not connected".to_string());
            return;
        }

        let outcome = match self.port.as_mut() {
            Some(port) => write_all(port.as_mut(), data),
            None => return,
        };

        // `BytesSent` carries exactly the prefix that reached the transport.
        match outcome {
            Ok(()) => self.ctx.emit(LinkEvent::BytesSent(data.to_vec())),
            Err((written, message)) => {
                if written > 0 {
                    self.ctx
                        .emit(LinkEvent::BytesSent(data[..written].to_vec()));
                }
                self.emit_error(message);
            }
        }
    }

    fn poll_read(&mut self) {
        let Some(port) = self.port.as_mut() else {
            return;
        };

        let mut buf = [0u8; 1024];
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => self.ctx.emit(LinkEvent::BytesReceived(buf[..n].to_vec())),
            Err(err) if is_retryable_io(err.kind()) => {}
            Err(err) => {
                log::warn!("[{}] port read error: {err}", self.name());
                if !(self.ctx.config.is_auto_connect() && is_resource_error(err.kind())) {
                    self.emit_error(format!("Port read failed: {err}"));
                }
            }
        }
    }

    /// Force-closes the port when it no longer appears in the host's
    /// enumeration: unplugged USB adapters keep the file descriptor alive
    /// without ever delivering another byte.
    fn check_port_availability(&mut self) {
        if self.last_availability_check.elapsed() < PORT_AVAILABILITY_INTERVAL {
            return;
        }
        self.last_availability_check = Instant::now();

        if self.port.is_none() {
            return;
        }

        let port_exists = serialport::available_ports()
            .map(|ports| {
                ports
                    .iter()
                    .any(|info| info.port_name == self.settings.port_path)
            })
            .unwrap_or(true);

        if !port_exists {
            log::warn!(
                "[{}] port {} disappeared, closing",
                self.name(),
                self.settings.port_path
            );
            self.release();
        }
    }

    fn release(&mut self) {
        if let Some(port) = self.port.take() {
            drop(port);
        }
        if self.ctx.connected.swap(false, Ordering::AcqRel) {
            self.error_emitted = false;
            self.ctx.emit(LinkEvent::Disconnected);
            log::debug!("[{}] port disconnected: {}", self.name(), self.settings.port_path);
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

/// Loops until `data` is exhausted or the transport errors out. On failure
/// returns the number of bytes that reached the transport and a message.
fn write_all(port: &mut dyn SerialPort, data: &[u8]) -> std::result::Result<(), (usize, String)> {
    let mut written = 0;
    while written < data.len() {
        match port.write(&data[written..]) {
            Ok(0) => {
                return Err((
                    written,
                    "Could not send data - write returned 0 bytes".to_string(),
                ))
            }
            Ok(n) => written += n,
            Err(err) if is_retryable_io(err.kind()) => continue,
            Err(err) => {
                return Err((written, format!("Could not send data - write failed: {err}")))
            }
        }
    }
    Ok(())
}

fn apply_settings(port: &mut dyn SerialPort, settings: &SerialSettings) {
    if let Err(err) = port.set_baud_rate(settings.baud_rate) {
        log::warn!("failed to set baud rate {}: {err}", settings.baud_rate);
    }
    if let Err(err) = port.set_data_bits(settings.data_bits) {
        log::warn!("failed to set data bits: {err}");
    }
    if let Err(err) = port.set_flow_control(settings.flow_control) {
        log::warn!("failed to set flow control: {err}");
    }
    if let Err(err) = port.set_stop_bits(settings.stop_bits) {
        log::warn!("failed to set stop bits: {err}");
    }
    if let Err(err) = port.set_parity(settings.parity) {
        log::warn!("failed to set parity: {err}");
    }
}

fn is_retryable_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Errors a vanished or not-yet-released device produces on open.
fn is_transient_open_error(err: &serialport::Error) -> bool {
    match err.kind() {
        serialport::ErrorKind::NoDevice => true,
        serialport::ErrorKind::Io(kind) => kind == io::ErrorKind::PermissionDenied,
        _ => false,
    }
}

/// Errors an unplugged device produces on read.
fn is_resource_error(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::NotFound
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::PermissionDenied
    )
}
