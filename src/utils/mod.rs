//! Internal utilities shared by the bridge components.

pub mod closable;
pub mod mpmc;
pub mod net;

pub use closable::{Closable, Closer, SharedCloser};
