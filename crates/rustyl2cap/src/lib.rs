//! RustyL2CAP - A Rust L2CAP protocol engine
//!
//! This library implements the Bluetooth logical link layer that sits
//! between an ACL link manager and upper-layer protocols: signaling,
//! channel configuration, enhanced retransmission and streaming modes on
//! classic links, and credit based channels on LE links.
//!
//! The engine does no I/O of its own. The link layer and the timers are
//! supplied through the [`LinkLayer`] and [`TimerScheduler`] traits.

pub mod error;
pub mod l2cap;

// Re-export common types for convenience
pub use error::LinkError;
pub use l2cap::{
    BdAddr, ChannelConfig, ConnectionType, EngineSettings, L2capChannel, L2capChannelType, L2capError, L2capHandle,
    L2capManager, L2capResult, L2capRuntime, LeChannelConfig, LinkLayer, Service, TimerId, TimerScheduler, PSM,
};
