//! Link configurations.
//!
//! A configuration describes one transport endpoint and may outlive the link
//! created from it. Configurations marked dynamic are created at runtime (by
//! the autoconnect probe or the forwarding helper) and never persisted.

use std::net::{IpAddr, SocketAddr};

use serialport::{DataBits, FlowControl, Parity, StopBits};

use crate::utils::net::resolve_ipv4;

/// A remote UDP endpoint, either configured manually or discovered from a
/// received datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpPeer {
    pub address: IpAddr,
    pub port: u16,
}

impl UdpPeer {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for UdpPeer {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip(), value.port())
    }
}

/// Serial endpoint parameters. 8N1 with no flow control by default.
#[derive(Clone, Debug, PartialEq)]
pub struct SerialSettings {
    /// System path of the port, e.g. `/dev/ttyACM0`.
    pub port_path: String,
    /// Short display name derived from the system path.
    pub display_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
    /// Set for boards talking directly over their USB port rather than
    /// through a telemetry radio.
    pub usb_direct: bool,
}

impl SerialSettings {
    pub fn new(port_path: impl Into<String>, baud_rate: u32) -> Self {
        let port_path = port_path.into();
        let display_name = short_port_name(&port_path);
        Self {
            port_path,
            display_name,
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            usb_direct: false,
        }
    }
}

/// Strips the directory part of a serial port path for display purposes.
pub fn short_port_name(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((_, name)) => name.to_string(),
        None => path.to_string(),
    }
}

/// UDP endpoint parameters: the local bind port and the ordered list of
/// manually configured peers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpSettings {
    pub local_port: u16,
    hosts: Vec<UdpPeer>,
}

impl UdpSettings {
    pub fn new(local_port: u16) -> Self {
        Self {
            local_port,
            hosts: Vec::new(),
        }
    }

    /// Configured peers, in insertion order.
    pub fn hosts(&self) -> &[UdpPeer] {
        &self.hosts
    }

    /// Adds a peer from a `host:port` or bare `host` string. A bare host uses
    /// the local bind port. Unresolvable hosts and duplicates are logged and
    /// ignored.
    pub fn add_host(&mut self, host: &str) {
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) => match port.parse::<u16>() {
                Ok(port) => (name, port),
                Err(_) => {
                    log::warn!("invalid host format: {host}");
                    return;
                }
            },
            None => (host, self.local_port),
        };

        let address = match resolve_ipv4(name) {
            Some(address) => IpAddr::V4(address),
            None => {
                log::warn!("could not resolve host: {name} port: {port}");
                return;
            }
        };

        let peer = UdpPeer::new(address, port);
        if self.hosts.contains(&peer) {
            log::warn!("duplicate host ignored: {host}");
            return;
        }
        self.hosts.push(peer);
    }

    /// Removes a previously configured peer; unknown peers are logged.
    pub fn remove_host(&mut self, host: &str) {
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) => match port.parse::<u16>() {
                Ok(port) => (name, port),
                Err(_) => {
                    log::warn!("invalid host format: {host}");
                    return;
                }
            },
            None => (host, self.local_port),
        };

        let Some(address) = resolve_ipv4(name) else {
            log::warn!("could not resolve host: {name} port: {port}");
            return;
        };

        let peer = UdpPeer::new(IpAddr::V4(address), port);
        match self.hosts.iter().position(|candidate| *candidate == peer) {
            Some(index) => {
                self.hosts.remove(index);
            }
            None => log::warn!("could not remove unknown host: {host}"),
        }
    }
}

/// Transport variant of a link configuration.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkKind {
    Serial(SerialSettings),
    Udp(UdpSettings),
}

/// Configuration of one link.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkConfig {
    name: String,
    auto_connect: bool,
    dynamic: bool,
    high_latency: bool,
    kind: LinkKind,
}

impl LinkConfig {
    /// Creates a serial configuration with default framing parameters.
    pub fn serial(name: impl Into<String>, port_path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            name: name.into(),
            auto_connect: false,
            dynamic: false,
            high_latency: false,
            kind: LinkKind::Serial(SerialSettings::new(port_path, baud_rate)),
        }
    }

    /// Creates a UDP configuration bound to `local_port` with no peers.
    pub fn udp(name: impl Into<String>, local_port: u16) -> Self {
        Self {
            name: name.into(),
            auto_connect: false,
            dynamic: false,
            high_latency: false,
            kind: LinkKind::Udp(UdpSettings::new(local_port)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_auto_connect(&self) -> bool {
        self.auto_connect
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_high_latency(&self) -> bool {
        self.high_latency
    }

    pub fn kind(&self) -> &LinkKind {
        &self.kind
    }

    pub fn is_serial(&self) -> bool {
        matches!(self.kind, LinkKind::Serial(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.kind, LinkKind::Udp(_))
    }

    /// Serial parameters, when this is a serial configuration.
    pub fn serial_settings(&self) -> Option<&SerialSettings> {
        match &self.kind {
            LinkKind::Serial(settings) => Some(settings),
            LinkKind::Udp(_) => None,
        }
    }

    /// UDP parameters, when this is a UDP configuration.
    pub fn udp_settings(&self) -> Option<&UdpSettings> {
        match &self.kind {
            LinkKind::Udp(settings) => Some(settings),
            LinkKind::Serial(_) => None,
        }
    }

    pub fn set_auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    pub fn set_dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn set_high_latency(mut self, high_latency: bool) -> Self {
        self.high_latency = high_latency;
        self
    }

    /// Replaces the variant settings. The variant itself cannot change.
    pub fn with_kind(mut self, kind: LinkKind) -> Self {
        self.kind = kind;
        self
    }

    /// Adds a configured UDP peer; a no-op on serial configurations.
    pub fn add_host(mut self, host: &str) -> Self {
        match &mut self.kind {
            LinkKind::Udp(settings) => settings.add_host(host),
            LinkKind::Serial(_) => log::warn!("add_host on a serial configuration"),
        }
        self
    }

    /// Marks the serial variant as a direct USB connection.
    pub fn set_usb_direct(mut self, usb_direct: bool) -> Self {
        match &mut self.kind {
            LinkKind::Serial(settings) => settings.usb_direct = usb_direct,
            LinkKind::Udp(_) => log::warn!("set_usb_direct on a UDP configuration"),
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_host_parses_address_and_port() {
        let mut settings = UdpSettings::new(14560);
        settings.add_host("127.0.0.1:14550");

        assert_eq!(settings.hosts().len(), 1);
        assert_eq!(
            settings.hosts()[0].socket_addr(),
            "127.0.0.1:14550".parse().unwrap()
        );
    }

    #[test]
    fn bare_host_uses_local_port() {
        let mut settings = UdpSettings::new(14560);
        settings.add_host("127.0.0.1");

        assert_eq!(settings.hosts()[0].port, 14560);
    }

    #[test]
    fn invalid_host_is_a_noop() {
        let mut settings = UdpSettings::new(14560);
        settings.add_host("definitely not a host:nope");
        settings.add_host("");

        assert!(settings.hosts().is_empty());
    }

    #[test]
    fn duplicate_host_is_a_noop() {
        let mut settings = UdpSettings::new(14560);
        settings.add_host("127.0.0.1:14550");
        settings.add_host("127.0.0.1:14550");

        assert_eq!(settings.hosts().len(), 1);
    }

    #[test]
    fn remove_host_drops_exact_peer() {
        let mut settings = UdpSettings::new(14560);
        settings.add_host("127.0.0.1:14550");
        settings.add_host("127.0.0.1:14551");

        settings.remove_host("127.0.0.1:14550");
        assert_eq!(settings.hosts().len(), 1);
        assert_eq!(settings.hosts()[0].port, 14551);
    }

    #[test]
    fn serial_defaults_are_8n1() {
        let settings = SerialSettings::new("/dev/ttyACM0", 115_200);

        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.stop_bits, StopBits::One);
        assert_eq!(settings.flow_control, FlowControl::None);
        assert_eq!(settings.display_name, "ttyACM0");
    }
}
