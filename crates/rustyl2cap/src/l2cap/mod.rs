//! L2CAP (Logical Link Control and Adaptation Protocol) implementation
//!
//! This module provides the L2CAP protocol engine, which is responsible for:
//! - Multiplexing protocol channels over a single physical connection
//! - Configuration negotiation of classic channels
//! - Segmentation and reassembly of packets
//! - Enhanced retransmission, streaming and LE credit based flow control
//!
//! [`L2capManager`] is the synchronous engine; [`L2capRuntime`] runs it on
//! a tokio task behind the async [`L2capHandle`].

pub mod constants;
pub mod types;
pub mod psm;
pub mod settings;
pub mod crc;
pub mod packet;
pub mod signaling;
pub mod sar;
pub mod erfc;
pub mod credit;
pub mod link;
pub mod service;
pub mod channel;
pub mod connection;
pub mod registry;
pub mod core;
mod classic;
mod le;
pub mod runtime;
#[cfg(test)]
mod tests;

// Re-export the public API
pub use self::types::*;
pub use self::core::L2capManager;
pub use self::channel::{L2capChannel, L2capChannelType, ModeState};
pub use self::connection::{Connection, InfoState};
pub use self::link::{LinkLayer, TimerId, TimerScheduler};
pub use self::psm::PSM;
pub use self::runtime::{L2capHandle, L2capRuntime};
pub use self::service::{
    ConnectionInfo, ConnectionParameterHandler, DisconnectReason, EchoHandler, FixedChannelHandler, Service,
};
pub use self::settings::EngineSettings;
