//! Bridge daemon.
//!
//! Builds the component graph, brings up the two default UDP legs, starts
//! the autoconnect probe for the autopilot serial link, and runs until
//! terminated.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use hypex_bridge::autoconnect::AutoconnectProbe;
use hypex_bridge::bridge::{Bridge, BridgeConfig};
use hypex_bridge::consts::{
    DEFAULT_PRIMARY_UDP_HOST, DEFAULT_PRIMARY_UDP_PORT, DEFAULT_SECONDARY_UDP_HOST,
    DEFAULT_SECONDARY_UDP_PORT, PRIMARY_UDP_LINK_NAME, SECONDARY_UDP_LINK_NAME,
};
use hypex_bridge::errors::Result;
use hypex_bridge::link::{LinkConfig, LinkRegistry};
use hypex_bridge::pipeline::Pipeline;

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(err) = run() {
        log::error!("bridge failed to start: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let registry = LinkRegistry::new();
    let bridge = Bridge::new(BridgeConfig::default());
    let pipeline = Pipeline::new(&registry, &bridge);

    if let Some(path) = settings_path() {
        if path.exists() {
            if let Err(err) = registry.load_configurations(&path) {
                log::warn!("could not load stored link configurations: {err}");
            }
            registry.start_auto_connected_links();
        }
    }

    let primary_config = registry.add_configuration(
        LinkConfig::udp(PRIMARY_UDP_LINK_NAME, DEFAULT_PRIMARY_UDP_PORT)
            .set_dynamic(true)
            .set_auto_connect(true)
            .add_host(DEFAULT_PRIMARY_UDP_HOST),
    );
    let secondary_config = registry.add_configuration(
        LinkConfig::udp(SECONDARY_UDP_LINK_NAME, DEFAULT_SECONDARY_UDP_PORT)
            .set_dynamic(true)
            .set_auto_connect(true)
            .add_host(DEFAULT_SECONDARY_UDP_HOST),
    );

    let primary = registry.create_connected_link(&primary_config)?;
    let secondary = registry.create_connected_link(&secondary_config)?;

    bridge.set_udp_legs(&primary, &secondary);
    bridge.start(pipeline.frame_events());

    let probe = AutoconnectProbe::new(&registry, &bridge);
    probe.start();

    log::info!(
        "bridge up: primary {DEFAULT_PRIMARY_UDP_PORT}, secondary {DEFAULT_SECONDARY_UDP_PORT}"
    );

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/hypex-bridge/links.toml"))
}
