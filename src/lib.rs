//! # Hypex bridge
//!
//! A ground-control communications bridge for an unmanned vehicle. The bridge
//! keeps several byte-oriented transports alive at once (a serial connection
//! to the autopilot board and two UDP legs towards a remote ground station),
//! multiplexes MAVLink over them, and fails over between the UDP legs based on
//! observed liveness of the peer.
//!
//! The moving parts:
//!
//! * [`link`]: transport workers (serial and UDP), link handles with
//!   message-passing command queues, and the [`link::LinkRegistry`] that owns
//!   them.
//! * [`channel`]: allocator for the small integer channel ids that key
//!   per-link parser state.
//! * [`pipeline`]: byte stream to MAVLink frame decoding, and ingress-based
//!   routing between the autopilot leg and the elected UDP leg.
//! * [`bridge`]: the failover controller with per-leg liveness tracking,
//!   primary election, and periodic local heartbeats.
//! * [`autoconnect`]: the serial-port probe that discovers autopilot boards
//!   and brings their links up automatically.
//! * [`settings`]: persistence for link configurations.
//!
//! Frames are parsed and serialized with [Mavio](https://crates.io/crates/mavio);
//! serial I/O goes through [serialport](https://crates.io/crates/serialport).

pub mod autoconnect;
pub mod boards;
pub mod bridge;
pub mod channel;
pub mod consts;
pub mod errors;
pub mod link;
pub mod pipeline;
pub mod settings;
pub mod utils;

pub mod prelude;
