use std::net::UdpSocket;
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use mavio::protocol::{Versionless, V2};
use mavio::{Frame, Receiver};

use hypex_bridge::bridge::{Bridge, BridgeConfig};
use hypex_bridge::link::{LinkConfig, LinkHandle, LinkRegistry};
use hypex_bridge::pipeline::Pipeline;

static INIT: Once = Once::new();

/// Compressed failover timings so a scenario runs in well under a second
/// per phase.
const CHECK_INTERVAL: Duration = Duration::from_millis(50);
const COMM_LOST_TIMEOUT: Duration = Duration::from_millis(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

fn initialize() {
    INIT.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

fn unused_port() -> u16 {
    portpicker::pick_unused_port().unwrap()
}

fn test_bridge_config() -> BridgeConfig {
    BridgeConfig {
        comm_lost_check_interval: CHECK_INTERVAL,
        comm_lost_timeout: COMM_LOST_TIMEOUT,
        heartbeat_interval: HEARTBEAT_INTERVAL,
        prefer_primary_on_recovery: true,
    }
}

fn heartbeat() -> mavio::dialects::minimal::messages::Heartbeat {
    use mavio::dialects::minimal::enums::{MavAutopilot, MavState, MavType};

    mavio::dialects::minimal::messages::Heartbeat {
        type_: MavType::Quadrotor,
        autopilot: MavAutopilot::Ardupilotmega,
        base_mode: Default::default(),
        custom_mode: 0,
        system_status: MavState::Active,
        mavlink_version: 3,
    }
}

fn liveness_frame(sequence: u8) -> Frame<Versionless> {
    let frame = Frame::builder()
        .sequence(sequence)
        .system_id(1)
        .component_id(1)
        .version(V2)
        .message(&heartbeat())
        .unwrap()
        .build();

    let mut buf = Vec::new();
    let mut sender = mavio::Sender::new(&mut buf);
    sender.send(&frame).unwrap();

    let mut receiver: Receiver<_, Versionless> = Receiver::new(buf.as_slice());
    receiver.recv().unwrap()
}

struct Harness {
    registry: Arc<LinkRegistry>,
    bridge: Arc<Bridge>,
    primary: Arc<LinkHandle>,
    secondary: Arc<LinkHandle>,
}

fn bring_up() -> Harness {
    let registry = LinkRegistry::new();
    let bridge = Bridge::new(test_bridge_config());
    let pipeline = Pipeline::new(&registry, &bridge);

    let primary_config =
        registry.add_configuration(LinkConfig::udp("Primary UDP", unused_port()));
    let secondary_config =
        registry.add_configuration(LinkConfig::udp("Secondary UDP", unused_port()));

    let primary = registry.create_connected_link(&primary_config).unwrap();
    let secondary = registry.create_connected_link(&secondary_config).unwrap();

    bridge.set_udp_legs(&primary, &secondary);
    bridge.start(pipeline.frame_events());

    Harness {
        registry,
        bridge,
        primary,
        secondary,
    }
}

fn elected_is(bridge: &Bridge, link: &Arc<LinkHandle>) -> bool {
    bridge
        .primary()
        .map(|elected| Arc::ptr_eq(&elected, link))
        .unwrap_or(false)
}

/// Polls until the elected leg is `link`, or fails after `timeout`.
fn wait_for_election(bridge: &Bridge, link: &Arc<LinkHandle>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if elected_is(bridge, link) {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn failover_on_silence_and_recovery() {
    initialize();
    let harness = bring_up();

    // Both legs alive: the primary is elected.
    harness
        .bridge
        .handle_frame(&harness.primary, &liveness_frame(0));
    harness
        .bridge
        .handle_frame(&harness.secondary, &liveness_frame(1));
    assert!(elected_is(&harness.bridge, &harness.primary));

    // Keep the secondary talking while the primary goes silent.
    let mut sequence = 2;
    let silence_start = Instant::now();
    while silence_start.elapsed() < COMM_LOST_TIMEOUT + CHECK_INTERVAL * 4 {
        harness
            .bridge
            .handle_frame(&harness.secondary, &liveness_frame(sequence));
        sequence = sequence.wrapping_add(1);
        thread::sleep(Duration::from_millis(50));
    }

    assert!(
        wait_for_election(&harness.bridge, &harness.secondary, Duration::from_millis(1000)),
        "silent primary must fail over to the secondary"
    );

    // One frame on the primary brings it straight back.
    harness
        .bridge
        .handle_frame(&harness.primary, &liveness_frame(sequence));
    assert!(
        elected_is(&harness.bridge, &harness.primary),
        "recovered primary must be re-elected immediately"
    );

    harness.registry.shutdown();
}

#[test]
fn both_legs_lost_keeps_last_known_leg() {
    initialize();
    let harness = bring_up();

    harness
        .bridge
        .handle_frame(&harness.secondary, &liveness_frame(0));
    assert!(elected_is(&harness.bridge, &harness.secondary));

    // Let both legs time out.
    thread::sleep(COMM_LOST_TIMEOUT + CHECK_INTERVAL * 4);

    assert!(
        harness.bridge.primary().is_some(),
        "a best-guess leg must remain elected with both legs lost"
    );

    harness.registry.shutdown();
}

#[test]
fn local_heartbeats_reach_both_peers() {
    initialize();

    let primary_peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    let secondary_peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    for socket in [&primary_peer, &secondary_peer] {
        socket
            .set_read_timeout(Some(Duration::from_millis(2000)))
            .unwrap();
    }

    let registry = LinkRegistry::new();
    let bridge = Bridge::new(test_bridge_config());
    let pipeline = Pipeline::new(&registry, &bridge);

    let primary_config = registry.add_configuration(
        LinkConfig::udp("Primary UDP", unused_port())
            .add_host(&primary_peer.local_addr().unwrap().to_string()),
    );
    let secondary_config = registry.add_configuration(
        LinkConfig::udp("Secondary UDP", unused_port())
            .add_host(&secondary_peer.local_addr().unwrap().to_string()),
    );

    let primary = registry.create_connected_link(&primary_config).unwrap();
    let secondary = registry.create_connected_link(&secondary_config).unwrap();
    bridge.set_udp_legs(&primary, &secondary);
    bridge.start(pipeline.frame_events());

    for peer in [&primary_peer, &secondary_peer] {
        let mut buf = [0u8; 512];
        let (n, _) = peer.recv_from(&mut buf).expect("peer must see a heartbeat");

        // Heartbeats go out as MAVLink 1.
        assert_eq!(buf[0], 0xFE);

        let mut receiver: Receiver<_, Versionless> = Receiver::new(&buf[..n]);
        let frame = receiver.recv().unwrap();
        assert_eq!(frame.message_id(), 0);
        assert_eq!(frame.system_id(), 1);
        assert_eq!(frame.component_id(), 2);
    }

    registry.shutdown();
}

#[test]
fn heartbeats_continue_while_legs_are_lost() {
    initialize();

    let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
    peer.set_read_timeout(Some(Duration::from_millis(2000)))
        .unwrap();

    let registry = LinkRegistry::new();
    let bridge = Bridge::new(test_bridge_config());
    let pipeline = Pipeline::new(&registry, &bridge);

    let primary_config = registry.add_configuration(
        LinkConfig::udp("Primary UDP", unused_port())
            .add_host(&peer.local_addr().unwrap().to_string()),
    );
    let secondary_config =
        registry.add_configuration(LinkConfig::udp("Secondary UDP", unused_port()));

    let primary = registry.create_connected_link(&primary_config).unwrap();
    let secondary = registry.create_connected_link(&secondary_config).unwrap();
    bridge.set_udp_legs(&primary, &secondary);
    bridge.start(pipeline.frame_events());

    // No leg has ever seen a frame, yet heartbeats must flow so the peer
    // can recover.
    let mut buf = [0u8; 512];
    assert!(peer.recv_from(&mut buf).is_ok());

    registry.shutdown();
}
