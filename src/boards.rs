//! Board identification from serial port enumeration.
//!
//! A pure classifier over USB descriptors: the autoconnect probe asks which
//! kind of board a port belongs to and whether the device is sitting in its
//! bootloader. Identification is fingerprint-based and deliberately small;
//! unknown hardware is simply not auto-connected.

use serialport::{SerialPortInfo, SerialPortType, UsbPortInfo};

/// Kinds of boards the probe may auto-connect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoardKind {
    /// PX4/ArduPilot flight controller speaking MAVLink over USB.
    Pixhawk,
    /// SiK telemetry radio.
    SikRadio,
    OpenPilot,
    /// RTK GPS base station; never a MAVLink endpoint.
    RtkGps,
}

impl BoardKind {
    pub fn name(&self) -> &'static str {
        match self {
            BoardKind::Pixhawk => "Pixhawk",
            BoardKind::SikRadio => "SiK Radio",
            BoardKind::OpenPilot => "OpenPilot",
            BoardKind::RtkGps => "RTK GPS",
        }
    }
}

/// 3D Robotics vendor id, used by Pixhawk-family boards.
const VID_3DR: u16 = 0x26AC;
/// Hex/ProfiCNC (CubePilot) vendor id.
const VID_CUBEPILOT: u16 = 0x2DAE;
/// Holybro vendor id.
const VID_HOLYBRO: u16 = 0x3162;
/// STMicroelectronics vendor id; PX4 boards enumerating with the vendor DFU
/// stack.
const VID_STM: u16 = 0x0483;
/// FTDI vendor id with the product id SiK radios ship with.
const VID_FTDI: u16 = 0x0403;
const PID_SIK_RADIO: u16 = 0x6015;
/// u-blox vendor id, used by RTK GPS receivers.
const VID_UBLOX: u16 = 0x1546;
/// OpenPilot project vendor id.
const VID_OPENPILOT: u16 = 0x20A0;

/// Product ids 3DR boards report while in the bootloader.
const BOOTLOADER_PIDS_3DR: [u16; 2] = [0x0010, 0x0011];

/// Classifies a port by its USB descriptor. Non-USB ports are unknown.
pub fn identify(info: &SerialPortInfo) -> Option<BoardKind> {
    let usb = usb_info(info)?;

    match usb.vid {
        VID_3DR | VID_CUBEPILOT | VID_HOLYBRO | VID_STM => Some(BoardKind::Pixhawk),
        VID_FTDI if usb.pid == PID_SIK_RADIO => Some(BoardKind::SikRadio),
        VID_UBLOX => Some(BoardKind::RtkGps),
        VID_OPENPILOT => Some(BoardKind::OpenPilot),
        _ => None,
    }
}

/// Returns `true` when the descriptor matches a bootloader fingerprint:
/// the 3DR bootloader product ids, or a product string mentioning
/// "Bootloader". Such a device must not be opened; it will re-enumerate as
/// the real board shortly.
pub fn is_bootloader(info: &SerialPortInfo) -> bool {
    let Some(usb) = usb_info(info) else {
        return false;
    };

    if usb.vid == VID_3DR && BOOTLOADER_PIDS_3DR.contains(&usb.pid) {
        return true;
    }

    usb.product
        .as_deref()
        .is_some_and(|product| product.to_ascii_lowercase().contains("bootloader"))
}

/// USB descriptor of a port, if it is a USB device.
pub fn usb_info(info: &SerialPortInfo) -> Option<&UsbPortInfo> {
    match &info.port_type {
        SerialPortType::UsbPort(usb) => Some(usb),
        _ => None,
    }
}

/// Looks a port up in the host's enumeration by its system path.
pub(crate) fn port_info(path: &str) -> Option<SerialPortInfo> {
    serialport::available_ports()
        .ok()?
        .into_iter()
        .find(|info| info.port_name == path)
}

#[cfg(test)]
pub(crate) fn usb_port(path: &str, vid: u16, pid: u16, serial: &str, product: &str) -> SerialPortInfo {
    SerialPortInfo {
        port_name: path.to_string(),
        port_type: SerialPortType::UsbPort(UsbPortInfo {
            vid,
            pid,
            serial_number: if serial.is_empty() {
                None
            } else {
                Some(serial.to_string())
            },
            manufacturer: None,
            product: if product.is_empty() {
                None
            } else {
                Some(product.to_string())
            },
        }),
    }
}
