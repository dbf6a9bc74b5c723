//! Commonly used bridge types.

pub use crate::errors::{Error, Result};

pub use crate::autoconnect::AutoconnectProbe;
pub use crate::bridge::{Bridge, BridgeConfig};
pub use crate::channel::{ChannelId, INVALID_CHANNEL, MAX_CHANNELS};
pub use crate::link::{
    LinkConfig, LinkEvent, LinkHandle, LinkKind, LinkRegistry, SerialSettings, UdpPeer,
    UdpSettings,
};
pub use crate::pipeline::{FrameEvent, Pipeline};
