//! Autoconnect probe.
//!
//! Scans the host's serial ports once a second and brings up an autopilot
//! link when a supported board stays visible long enough. Boards are never
//! connected on first sight: bootloader detection is flaky across platforms,
//! so a port sits on a wait list and is only opened once the debounce delay
//! has elapsed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serialport::SerialPortInfo;

use crate::boards::{self, BoardKind};
use crate::bridge::Bridge;
use crate::consts::{
    AUTOCONNECT_BAUD_RATE, AUTOCONNECT_CONNECT_DELAY, AUTOCONNECT_SIK_BAUD_RATE,
    AUTOCONNECT_UPDATE_INTERVAL,
};
use crate::link::config::short_port_name;
use crate::link::{LinkConfig, LinkRegistry};
use crate::utils::Closer;

pub struct AutoconnectProbe {
    registry: Arc<LinkRegistry>,
    bridge: Arc<Bridge>,
    interval: Duration,
    connect_delay: Duration,
    state: Mutex<ProbeState>,
    closer: Closer,
}

#[derive(Default)]
struct ProbeState {
    /// Ports seen but not yet connected, with the number of passes they
    /// survived. Bootloader ports stay at zero.
    wait_list: HashMap<String, u32>,
    /// Port an RTK GPS receiver was seen on; cleared when it disappears.
    rtk_port: Option<String>,
}

impl AutoconnectProbe {
    pub fn new(registry: &Arc<LinkRegistry>, bridge: &Arc<Bridge>) -> Arc<Self> {
        Arc::new(Self {
            registry: registry.clone(),
            bridge: bridge.clone(),
            interval: AUTOCONNECT_UPDATE_INTERVAL,
            connect_delay: AUTOCONNECT_CONNECT_DELAY,
            state: Mutex::new(ProbeState::default()),
            closer: Closer::new(),
        })
    }

    /// Starts the periodic scan. Stops when the probe is dropped.
    pub fn start(self: &Arc<Self>) {
        let probe = Arc::downgrade(self);
        let interval = self.interval;

        thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(probe) = probe.upgrade() else { break };
            if probe.closer.is_closed() {
                break;
            }
            probe.scan();
        });
    }

    pub fn stop(&self) {
        self.closer.close();
    }

    fn scan(&self) {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(err) => {
                log::warn!("serial port enumeration failed: {err}");
                return;
            }
        };

        self.pass(ports);
    }

    /// One probe pass over an enumeration snapshot.
    fn pass(&self, ports: Vec<SerialPortInfo>) {
        let ports = filter_composite_ports(ports);
        let mut state = self.state.lock().unwrap();

        let current_ports: Vec<String> =
            ports.iter().map(|info| info.port_name.clone()).collect();

        for info in &ports {
            let Some(board) = boards::identify(info) else {
                continue;
            };
            let path = &info.port_name;

            if boards::is_bootloader(info) {
                log::debug!("waiting for bootloader to finish on {path}");
                state.wait_list.entry(path.clone()).or_insert(0);
                continue;
            }

            if self.registry.serial_port_connected(path)
                || state.rtk_port.as_deref() == Some(path.as_str())
            {
                continue;
            }

            let passes = match state.wait_list.get_mut(path) {
                Some(count) => {
                    *count += 1;
                    *count
                }
                None => {
                    // First sighting: give the board time to boot before
                    // the next pass decides.
                    log::debug!(
                        "waiting for next autoconnect pass: {path} ({})",
                        board.name()
                    );
                    state.wait_list.insert(path.clone(), 1);
                    continue;
                }
            };

            if self.interval * passes <= self.connect_delay {
                continue;
            }

            state.wait_list.remove(path);
            match board {
                BoardKind::RtkGps => {
                    log::debug!("RTK GPS seen on {path}");
                    state.rtk_port = Some(path.clone());
                }
                BoardKind::Pixhawk | BoardKind::SikRadio | BoardKind::OpenPilot => {
                    self.connect_board(board, info);
                }
            }
        }

        // Stale wait-list entries and a vanished RTK port are forgotten.
        state.wait_list.retain(|path, _| current_ports.contains(path));
        if let Some(rtk) = state.rtk_port.take() {
            if current_ports.contains(&rtk) {
                state.rtk_port = Some(rtk);
            } else {
                log::debug!("RTK GPS disconnected from {rtk}");
            }
        }
    }

    fn connect_board(&self, board: BoardKind, info: &SerialPortInfo) {
        let path = &info.port_name;
        let name = format!("{} on {} (AutoConnect)", board.name(), short_port_name(path));
        let baud = match board {
            BoardKind::SikRadio => AUTOCONNECT_SIK_BAUD_RATE,
            _ => AUTOCONNECT_BAUD_RATE,
        };

        log::debug!("new auto-connect port: {name} at {path}");
        let config = LinkConfig::serial(name, path, baud)
            .set_dynamic(true)
            .set_auto_connect(true)
            .set_usb_direct(board == BoardKind::Pixhawk);
        let config = self.registry.add_configuration(config);

        match self.registry.create_connected_link(&config) {
            Ok(link) => self.bridge.set_autopilot_link(&link),
            Err(err) => log::warn!("[{}] auto-connect failed: {err}", config.name()),
        }
    }
}

impl Drop for AutoconnectProbe {
    fn drop(&mut self) {
        self.closer.close();
    }
}

/// Drops secondary ports of composite USB devices: boards exporting several
/// ports put MAVLink on the first one. Ports whose description mentions
/// "NMEA" survive, since internal GPS units present the same way.
pub(crate) fn filter_composite_ports(ports: Vec<SerialPortInfo>) -> Vec<SerialPortInfo> {
    let mut seen: HashMap<(u16, u16), Vec<String>> = HashMap::new();
    let mut kept = Vec::with_capacity(ports.len());

    for info in ports {
        let Some(usb) = boards::usb_info(&info) else {
            kept.push(info);
            continue;
        };
        let serial = usb.serial_number.clone().unwrap_or_default();
        if serial.is_empty() || serial == "0" {
            kept.push(info);
            continue;
        }

        let key = (usb.vid, usb.pid);
        let serials = seen.entry(key).or_default();
        if serials.contains(&serial) {
            let is_nmea = usb
                .product
                .as_deref()
                .is_some_and(|product| product.contains("NMEA"));
            if !is_nmea {
                log::trace!(
                    "removing secondary port on same device: {}",
                    info.port_name
                );
                continue;
            }
        }
        serials.push(serial);
        kept.push(info);
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::boards::usb_port;
    use crate::bridge::BridgeConfig;

    fn probe_with(interval: Duration, delay: Duration) -> Arc<AutoconnectProbe> {
        let registry = LinkRegistry::new();
        let bridge = Bridge::new(BridgeConfig::default());
        let mut probe = AutoconnectProbe::new(&registry, &bridge);
        {
            let probe = Arc::get_mut(&mut probe).unwrap();
            probe.interval = interval;
            probe.connect_delay = delay;
        }
        probe
    }

    #[test]
    fn composite_device_keeps_only_the_first_port() {
        let ports = vec![
            usb_port("/dev/ttyACM0", 0x26AC, 0x0012, "A600", "PX4 FMU"),
            usb_port("/dev/ttyACM1", 0x26AC, 0x0012, "A600", "PX4 FMU"),
        ];

        let filtered = filter_composite_ports(ports);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].port_name, "/dev/ttyACM0");
    }

    #[test]
    fn nmea_ports_survive_the_composite_filter() {
        let ports = vec![
            usb_port("/dev/ttyACM0", 0x26AC, 0x0012, "A600", "PX4 FMU"),
            usb_port("/dev/ttyACM1", 0x26AC, 0x0012, "A600", "PX4 NMEA GPS"),
        ];

        let filtered = filter_composite_ports(ports);
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn distinct_serial_numbers_are_not_filtered() {
        let ports = vec![
            usb_port("/dev/ttyACM0", 0x26AC, 0x0012, "A600", "PX4 FMU"),
            usb_port("/dev/ttyACM1", 0x26AC, 0x0012, "B700", "PX4 FMU"),
        ];

        assert_eq!(filter_composite_ports(ports).len(), 2);
    }

    #[test]
    fn missing_serial_numbers_are_not_filtered() {
        let ports = vec![
            usb_port("/dev/ttyUSB0", 0x0403, 0x6015, "", "FT231X"),
            usb_port("/dev/ttyUSB1", 0x0403, 0x6015, "", "FT231X"),
        ];

        assert_eq!(filter_composite_ports(ports).len(), 2);
    }

    #[test]
    fn bootloader_port_is_held_without_progress() {
        let probe = probe_with(Duration::from_millis(1), Duration::from_millis(2));
        let bootloader = usb_port("/dev/ttyACM0", 0x26AC, 0x0011, "A600", "PX4 BL");

        for _ in 0..10 {
            probe.pass(vec![bootloader.clone()]);
        }

        let state = probe.state.lock().unwrap();
        assert_eq!(state.wait_list.get("/dev/ttyACM0"), Some(&0));
        assert!(probe.registry.live_links().is_empty());
        assert_eq!(probe.registry.channel_mask(), 0);
    }

    #[test]
    fn first_sighting_only_enters_the_wait_list() {
        let probe = probe_with(Duration::from_millis(1000), Duration::from_millis(2500));
        let board = usb_port("/dev/ttyACM0", 0x26AC, 0x0012, "A600", "PX4 FMU");

        probe.pass(vec![board.clone()]);
        {
            let state = probe.state.lock().unwrap();
            assert_eq!(state.wait_list.get("/dev/ttyACM0"), Some(&1));
        }
        assert!(probe.registry.live_links().is_empty());

        // Second pass: 2 x 1000 ms is still within the connect delay.
        probe.pass(vec![board.clone()]);
        assert!(probe.registry.live_links().is_empty());
    }

    #[test]
    fn vanished_port_leaves_the_wait_list() {
        let probe = probe_with(Duration::from_millis(1000), Duration::from_millis(2500));
        let board = usb_port("/dev/ttyACM0", 0x26AC, 0x0012, "A600", "PX4 FMU");

        probe.pass(vec![board]);
        probe.pass(Vec::new());

        let state = probe.state.lock().unwrap();
        assert!(state.wait_list.is_empty());
    }

    #[test]
    fn rtk_port_occupies_its_slot_and_clears_on_disappearance() {
        let probe = probe_with(Duration::from_millis(1000), Duration::from_millis(1500));
        let rtk = usb_port("/dev/ttyACM2", 0x1546, 0x01A9, "UB1", "u-blox GNSS");

        probe.pass(vec![rtk.clone()]);
        probe.pass(vec![rtk.clone()]);
        {
            let state = probe.state.lock().unwrap();
            assert_eq!(state.rtk_port.as_deref(), Some("/dev/ttyACM2"));
            assert!(state.wait_list.is_empty());
        }
        // No link is ever created for an RTK receiver.
        assert!(probe.registry.live_links().is_empty());

        probe.pass(Vec::new());
        let state = probe.state.lock().unwrap();
        assert!(state.rtk_port.is_none());
    }
}
