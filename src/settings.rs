//! Persistence of link configurations.
//!
//! Configurations are stored as a flat indexed block of key/value groups
//! under a fixed root: `count` records the number of blocks, each block
//! `Link<N>` carries the shared keys plus per-type keys. Dynamic
//! configurations (autoconnect, forwarding) are never persisted.

use std::fs;
use std::path::Path;

use serialport::{DataBits, FlowControl, Parity, StopBits};
use toml::Value;

use crate::errors::{Error, Result};
use crate::link::config::{LinkKind, SerialSettings, UdpSettings};
use crate::link::LinkConfig;

/// Root group all link blocks live under.
pub const SETTINGS_ROOT: &str = "Links";

const TYPE_SERIAL: &str = "serial";
const TYPE_UDP: &str = "udp";

/// Writes every non-dynamic configuration to `path`.
pub fn save_configurations(configs: &[std::sync::Arc<LinkConfig>], path: &Path) -> Result<()> {
    let mut links = toml::Table::new();
    let mut count: i64 = 0;

    for config in configs {
        if config.is_dynamic() {
            continue;
        }
        links.insert(format!("Link{count}"), Value::Table(store_config(config)));
        count += 1;
    }
    links.insert("count".to_string(), Value::Integer(count));

    let mut root = toml::Table::new();
    root.insert(SETTINGS_ROOT.to_string(), Value::Table(links));

    let text = toml::to_string_pretty(&root).map_err(|err| Error::Config(err.to_string()))?;
    fs::write(path, text)?;
    Ok(())
}

/// Loads configurations from `path`. Blocks with a missing name, an unknown
/// type, or unreadable keys are logged and skipped; loading continues.
pub fn load_configurations(path: &Path) -> Result<Vec<LinkConfig>> {
    let content = fs::read_to_string(path)?;
    let root: toml::Table = content.parse()?;

    let Some(links) = root.get(SETTINGS_ROOT).and_then(Value::as_table) else {
        return Ok(Vec::new());
    };
    let count = links.get("count").and_then(Value::as_integer).unwrap_or(0);

    let mut configs = Vec::new();
    for index in 0..count {
        let key = format!("Link{index}");
        let Some(block) = links.get(&key).and_then(Value::as_table) else {
            log::warn!("link configuration {key} is missing");
            continue;
        };
        match parse_config(block) {
            Some(config) => configs.push(config),
            None => log::warn!("link configuration {key} is invalid"),
        }
    }

    Ok(configs)
}

fn store_config(config: &LinkConfig) -> toml::Table {
    let mut block = toml::Table::new();
    block.insert("name".to_string(), Value::String(config.name().to_string()));
    block.insert(
        "auto".to_string(),
        Value::Boolean(config.is_auto_connect()),
    );
    block.insert(
        "high_latency".to_string(),
        Value::Boolean(config.is_high_latency()),
    );

    match config.kind() {
        LinkKind::Serial(settings) => {
            block.insert("type".to_string(), Value::String(TYPE_SERIAL.to_string()));
            block.insert(
                "portName".to_string(),
                Value::String(settings.port_path.clone()),
            );
            block.insert(
                "portDisplayName".to_string(),
                Value::String(settings.display_name.clone()),
            );
            block.insert(
                "baud".to_string(),
                Value::Integer(i64::from(settings.baud_rate)),
            );
            block.insert(
                "dataBits".to_string(),
                Value::Integer(data_bits_to_int(settings.data_bits)),
            );
            block.insert(
                "flowControl".to_string(),
                Value::String(flow_control_to_str(settings.flow_control).to_string()),
            );
            block.insert(
                "stopBits".to_string(),
                Value::Integer(stop_bits_to_int(settings.stop_bits)),
            );
            block.insert(
                "parity".to_string(),
                Value::String(parity_to_str(settings.parity).to_string()),
            );
        }
        LinkKind::Udp(settings) => {
            block.insert("type".to_string(), Value::String(TYPE_UDP.to_string()));
            block.insert(
                "port".to_string(),
                Value::Integer(i64::from(settings.local_port)),
            );
            block.insert(
                "hostCount".to_string(),
                Value::Integer(settings.hosts().len() as i64),
            );
            for (i, peer) in settings.hosts().iter().enumerate() {
                block.insert(format!("host{i}"), Value::String(peer.address.to_string()));
                block.insert(format!("port{i}"), Value::Integer(i64::from(peer.port)));
            }
        }
    }

    block
}

fn parse_config(block: &toml::Table) -> Option<LinkConfig> {
    let name = block.get("name").and_then(Value::as_str)?;
    if name.is_empty() {
        return None;
    }
    let kind = block.get("type").and_then(Value::as_str)?;
    let auto = block
        .get("auto")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let high_latency = block
        .get("high_latency")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let config = match kind {
        TYPE_SERIAL => {
            let port_path = block.get("portName").and_then(Value::as_str)?;
            let baud = block.get("baud").and_then(Value::as_integer)? as u32;

            let mut settings = SerialSettings::new(port_path, baud);
            if let Some(display) = block.get("portDisplayName").and_then(Value::as_str) {
                settings.display_name = display.to_string();
            }
            if let Some(bits) = block.get("dataBits").and_then(Value::as_integer) {
                settings.data_bits = data_bits_from_int(bits)?;
            }
            if let Some(flow) = block.get("flowControl").and_then(Value::as_str) {
                settings.flow_control = flow_control_from_str(flow)?;
            }
            if let Some(bits) = block.get("stopBits").and_then(Value::as_integer) {
                settings.stop_bits = stop_bits_from_int(bits)?;
            }
            if let Some(parity) = block.get("parity").and_then(Value::as_str) {
                settings.parity = parity_from_str(parity)?;
            }

            LinkConfig::serial(name, port_path, baud).with_kind(LinkKind::Serial(settings))
        }
        TYPE_UDP => {
            let port = block.get("port").and_then(Value::as_integer).unwrap_or(0) as u16;
            let mut settings = UdpSettings::new(port);

            let host_count = block
                .get("hostCount")
                .and_then(Value::as_integer)
                .unwrap_or(0);
            for i in 0..host_count {
                let host = block.get(&format!("host{i}")).and_then(Value::as_str);
                let peer_port = block.get(&format!("port{i}")).and_then(Value::as_integer);
                if let (Some(host), Some(peer_port)) = (host, peer_port) {
                    settings.add_host(&format!("{host}:{peer_port}"));
                }
            }

            LinkConfig::udp(name, port).with_kind(LinkKind::Udp(settings))
        }
        unknown => {
            log::warn!("link configuration has unknown type: {unknown}");
            return None;
        }
    };

    Some(config.set_auto_connect(auto).set_high_latency(high_latency))
}

fn data_bits_to_int(bits: DataBits) -> i64 {
    match bits {
        DataBits::Five => 5,
        DataBits::Six => 6,
        DataBits::Seven => 7,
        DataBits::Eight => 8,
    }
}

fn data_bits_from_int(bits: i64) -> Option<DataBits> {
    match bits {
        5 => Some(DataBits::Five),
        6 => Some(DataBits::Six),
        7 => Some(DataBits::Seven),
        8 => Some(DataBits::Eight),
        _ => None,
    }
}

fn stop_bits_to_int(bits: StopBits) -> i64 {
    match bits {
        StopBits::One => 1,
        StopBits::Two => 2,
    }
}

fn stop_bits_from_int(bits: i64) -> Option<StopBits> {
    match bits {
        1 => Some(StopBits::One),
        2 => Some(StopBits::Two),
        _ => None,
    }
}

fn parity_to_str(parity: Parity) -> &'static str {
    match parity {
        Parity::None => "none",
        Parity::Odd => "odd",
        Parity::Even => "even",
    }
}

fn parity_from_str(parity: &str) -> Option<Parity> {
    match parity {
        "none" => Some(Parity::None),
        "odd" => Some(Parity::Odd),
        "even" => Some(Parity::Even),
        _ => None,
    }
}

fn flow_control_to_str(flow: FlowControl) -> &'static str {
    match flow {
        FlowControl::None => "none",
        FlowControl::Software => "software",
        FlowControl::Hardware => "hardware",
    }
}

fn flow_control_from_str(flow: &str) -> Option<FlowControl> {
    match flow {
        "none" => Some(FlowControl::None),
        "software" => Some(FlowControl::Software),
        "hardware" => Some(FlowControl::Hardware),
        _ => None,
    }
}
