//! Common constants.

use std::net::Ipv4Addr;
use std::time::Duration;

use mavio::protocol::{ComponentId, MessageId, SystemId};

/// How often the bridge checks each UDP leg for communication loss.
pub const COMM_LOST_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
/// Silence on a UDP leg longer than this declares the leg lost.
pub const COMM_LOST_TIMEOUT: Duration = Duration::from_millis(3500);
/// How often the bridge emits its own heartbeat on each UDP leg.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// System id stamped on locally emitted heartbeats.
pub const HEARTBEAT_SYSTEM_ID: SystemId = 1;
/// Component id stamped on locally emitted heartbeats.
pub const HEARTBEAT_COMPONENT_ID: ComponentId = 2;

/// RADIO_STATUS message id. SiK radios report their own link quality with
/// this message; it never indicates life on the far end of a leg.
pub const RADIO_STATUS_ID: MessageId = 109;

/// Serial-port scan cadence of the autoconnect probe. Must be long enough to
/// get past the bootloader on the second pass.
pub const AUTOCONNECT_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);
/// A port must sit on the probe's wait list at least this long before the
/// probe attempts a connection.
pub const AUTOCONNECT_CONNECT_DELAY: Duration = Duration::from_millis(2500);

/// How often a connected serial worker verifies its port is still enumerated.
pub const PORT_AVAILABILITY_INTERVAL: Duration = Duration::from_millis(1000);
/// Serial read timeout; also bounds command-queue latency of the worker.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// UDP receive timeout; also bounds command-queue latency of the worker.
pub const UDP_READ_TIMEOUT: Duration = Duration::from_millis(50);
/// Poll interval for an idle (disconnected) worker waiting for commands.
pub const WORKER_IDLE_POLL: Duration = Duration::from_millis(100);

/// Bound on waiting for the first `Connected` event after issuing `connect`.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Bound on waiting for a worker thread to exit during link teardown.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Multicast group joined by every UDP worker so that local peers find each
/// other without configuration.
pub const UDP_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// Receive buffer for a single datagram. MAVLink frames are at most
/// [`MAX_FRAME_SIZE`] bytes; anything larger than this is not ours.
pub const UDP_RECV_BUFFER_SIZE: usize = 512;
/// Upper bound on a serialized MAVLink frame.
pub const MAX_FRAME_SIZE: usize = 280;

/// Reserved name of the primary UDP leg.
pub const PRIMARY_UDP_LINK_NAME: &str = "Primary UDP";
/// Reserved name of the secondary UDP leg.
pub const SECONDARY_UDP_LINK_NAME: &str = "Secondary UDP";
/// Reserved name of the MAVLink forwarding link.
pub const FORWARDING_LINK_NAME: &str = "MAVLink Forwarding";

/// Default local bind port of the primary UDP leg.
pub const DEFAULT_PRIMARY_UDP_PORT: u16 = 14560;
/// Default local bind port of the secondary UDP leg.
pub const DEFAULT_SECONDARY_UDP_PORT: u16 = 14561;
/// Default remote peer of the primary UDP leg.
pub const DEFAULT_PRIMARY_UDP_HOST: &str = "100.102.166.21:14550";
/// Default remote peer of the secondary UDP leg.
pub const DEFAULT_SECONDARY_UDP_HOST: &str = "127.0.0.1:14551";

/// Baud rate used for auto-connected autopilot boards.
pub const AUTOCONNECT_BAUD_RATE: u32 = 115_200;
/// Baud rate used for auto-connected SiK telemetry radios.
pub const AUTOCONNECT_SIK_BAUD_RATE: u32 = 57_600;
