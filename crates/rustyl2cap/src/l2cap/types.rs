//! Type definitions for L2CAP operations
//!
//! This module contains core data structures used in L2CAP operations.

use std::fmt;
use thiserror::Error;

use super::constants::*;

/// Error types specific to L2CAP operations
#[derive(Debug, Error)]
pub enum L2capError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Signaling request timed out")]
    Timeout,

    #[error("Channel not found: 0x{0:04X}")]
    ChannelNotFound(u16),

    #[error("Connection not found: handle 0x{0:04X}")]
    ConnectionNotFound(u16),

    #[error("Invalid state for operation: {0}")]
    InvalidState(ChannelState),

    #[error("MTU exceeded: {size} > {mtu}")]
    MtuExceeded { size: usize, mtu: u16 },

    #[error("Resource limit reached")]
    ResourceLimitReached,

    #[error("PSM not registered: 0x{0:04X}")]
    PsmNotRegistered(u16),

    #[error("PSM already registered: 0x{0:04X}")]
    PsmAlreadyRegistered(u16),

    #[error("Connection not established")]
    NotConnected,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Link error: {0}")]
    LinkError(#[from] crate::error::LinkError),

    #[error("L2CAP runtime has shut down")]
    RuntimeShutdown,
}

/// Result type for L2CAP operations
pub type L2capResult<T> = std::result::Result<T, L2capError>;

/// Bluetooth device address, stored little-endian as on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = slice.get(..6)?.try_into().ok()?;
        Some(Self { bytes })
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[5], b[4], b[3], b[2], b[1], b[0]
        )
    }
}

/// Connection types for L2CAP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Classic Bluetooth connection (ACL)
    Classic,
    /// Bluetooth Low Energy connection (LE)
    LE,
}

/// Local role on an LE link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeRole {
    Master,
    Slave,
}

/// Link state of a connection record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Record exists, no link requested yet
    Idle,
    /// Link layer asked to connect
    Connecting,
    /// Link is up
    Connected,
    /// Link layer asked to disconnect
    Disconnecting,
}

/// L2CAP Channel State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Waiting for the link or for information discovery
    Idle,
    /// Connection request sent, waiting for the response
    ConnectOutReq,
    /// Connection request received, waiting for the local decision
    ConnectInReq,
    /// Configuration exchange in progress
    Configuring,
    /// Channel is open and ready for data transfer
    Connected,
    /// Disconnection request sent
    DisconnectOutReq,
    /// Disconnection request received
    DisconnectInReq,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::ConnectOutReq => write!(f, "Waiting for connection response"),
            Self::ConnectInReq => write!(f, "Waiting for local connection response"),
            Self::Configuring => write!(f, "Configuring"),
            Self::Connected => write!(f, "Connected"),
            Self::DisconnectOutReq => write!(f, "Waiting for disconnection response"),
            Self::DisconnectInReq => write!(f, "Waiting for local disconnection response"),
        }
    }
}

/// Quality of Service (QoS) Flow Specification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosFlowSpec {
    /// Flags (reserved)
    pub flags: u8,
    /// QoS service type
    pub service_type: u8,
    /// Token rate (bytes/second)
    pub token_rate: u32,
    /// Token bucket size (bytes)
    pub token_bucket_size: u32,
    /// Peak bandwidth (bytes/second)
    pub peak_bandwidth: u32,
    /// Latency (microseconds)
    pub latency: u32,
    /// Delay variation (microseconds)
    pub delay_variation: u32,
}

impl Default for QosFlowSpec {
    fn default() -> Self {
        Self {
            flags: 0,
            service_type: L2CAP_QOS_BEST_EFFORT,
            token_rate: 0,
            token_bucket_size: 0,
            peak_bandwidth: 0,
            latency: 0xFFFF_FFFF,
            delay_variation: 0xFFFF_FFFF,
        }
    }
}

/// Retransmission and Flow Control modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmissionMode {
    /// Basic L2CAP mode (no retransmission or flow control)
    Basic = 0,
    /// Legacy retransmission mode
    Retransmission = 1,
    /// Legacy flow control mode
    FlowControl = 2,
    /// Enhanced Retransmission mode
    EnhancedRetransmission = 3,
    /// Streaming mode
    Streaming = 4,
}

impl RetransmissionMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Basic),
            1 => Some(Self::Retransmission),
            2 => Some(Self::FlowControl),
            3 => Some(Self::EnhancedRetransmission),
            4 => Some(Self::Streaming),
            _ => None,
        }
    }

    /// Modes this engine can run
    pub fn is_supported(self) -> bool {
        matches!(
            self,
            Self::Basic | Self::EnhancedRetransmission | Self::Streaming
        )
    }
}

/// Retransmission and Flow Control option value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmissionFlowControl {
    /// Mode selection
    pub mode: RetransmissionMode,
    /// Transmission Window size
    pub tx_window_size: u8,
    /// Maximum number of transmissions of a single frame
    pub max_transmit: u8,
    /// Retransmission timeout (ms)
    pub retransmission_timeout: u16,
    /// Monitor timeout (ms)
    pub monitor_timeout: u16,
    /// Maximum PDU payload size
    pub mps: u16,
}

impl Default for RetransmissionFlowControl {
    fn default() -> Self {
        Self {
            mode: RetransmissionMode::Basic,
            tx_window_size: 0,
            max_transmit: 0,
            retransmission_timeout: 0,
            monitor_timeout: 0,
            mps: 0,
        }
    }
}

/// Configuration options as carried in a configuration request or response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOptions {
    /// Maximum Transmission Unit
    pub mtu: Option<u16>,
    /// Flush Timeout
    pub flush_timeout: Option<u16>,
    /// Quality of Service
    pub qos: Option<QosFlowSpec>,
    /// Retransmission and Flow Control
    pub retransmission: Option<RetransmissionFlowControl>,
    /// Frame Check Sequence
    pub fcs: Option<u8>,
}

/// Result codes of a configuration response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigResult {
    Success = 0x0000,
    UnacceptableParameters = 0x0001,
    Rejected = 0x0002,
    UnknownOptions = 0x0003,
    Pending = 0x0004,
    FlowSpecRejected = 0x0005,
}

impl ConfigResult {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Self::Success),
            0x0001 => Some(Self::UnacceptableParameters),
            0x0002 => Some(Self::Rejected),
            0x0003 => Some(Self::UnknownOptions),
            0x0004 => Some(Self::Pending),
            0x0005 => Some(Self::FlowSpecRejected),
            _ => None,
        }
    }

    pub fn value(self) -> u16 {
        self as u16
    }
}

/// Negotiated configuration of one direction of a classic channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Largest SDU the owner of this record will accept
    pub mtu: u16,
    /// Flush timeout (ms, 0xFFFF = infinite)
    pub flush_timeout: u16,
    /// Mode and its parameters
    pub rfc: RetransmissionFlowControl,
    /// Whether a 16-bit FCS is wanted
    pub fcs: bool,
    /// Requested QoS, sent only when set
    pub qos: Option<QosFlowSpec>,
}

impl ChannelConfig {
    /// Basic mode configuration with the given MTU
    pub fn basic(mtu: u16) -> Self {
        Self {
            mtu,
            flush_timeout: L2CAP_DEFAULT_FLUSH_TIMEOUT,
            rfc: RetransmissionFlowControl::default(),
            fcs: true,
            qos: None,
        }
    }

    pub fn mode(&self) -> RetransmissionMode {
        self.rfc.mode
    }

    /// Options a configuration request must carry to propose this record
    pub fn to_request_options(&self) -> ConfigOptions {
        // Timeouts are left to the responder
        let rfc = (self.rfc.mode != RetransmissionMode::Basic).then_some(RetransmissionFlowControl {
            retransmission_timeout: 0,
            monitor_timeout: 0,
            ..self.rfc
        });
        ConfigOptions {
            mtu: Some(self.mtu),
            flush_timeout: (self.flush_timeout != L2CAP_DEFAULT_FLUSH_TIMEOUT)
                .then_some(self.flush_timeout),
            qos: self.qos,
            retransmission: rfc,
            fcs: (rfc.is_some() && !self.fcs).then_some(L2CAP_FCS_NONE),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::basic(L2CAP_DEFAULT_MTU)
    }
}

/// LE Credit-Based channel parameters of one side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeChannelConfig {
    /// Maximum SDU size
    pub mtu: u16,
    /// Maximum PDU payload size
    pub mps: u16,
    /// Credits granted to the peer at connection time
    pub initial_credits: u16,
}

impl LeChannelConfig {
    /// MTU and MPS must both be at least the LE minimum
    pub fn is_valid(&self) -> bool {
        self.mtu >= L2CAP_LE_MIN_MTU && self.mps >= L2CAP_LE_MIN_MTU && self.mps <= L2CAP_LE_MAX_MPS
    }
}

/// L2CAP Connection Parameter Update request structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameterUpdate {
    /// Minimum connection interval (1.25ms units)
    pub conn_interval_min: u16,
    /// Maximum connection interval (1.25ms units)
    pub conn_interval_max: u16,
    /// Peripheral latency (number of events)
    pub conn_latency: u16,
    /// Connection supervision timeout (10ms units)
    pub supervision_timeout: u16,
}

impl ConnectionParameterUpdate {
    /// Validates that the parameters are within acceptable ranges
    pub fn validate(&self) -> bool {
        let interval_ok = self.conn_interval_min >= L2CAP_LE_CONN_INTERVAL_MIN
            && self.conn_interval_max <= L2CAP_LE_CONN_INTERVAL_MAX
            && self.conn_interval_min <= self.conn_interval_max;

        let latency_ok = self.conn_latency <= L2CAP_LE_CONN_LATENCY_MAX;

        let timeout_ok = self.supervision_timeout >= L2CAP_LE_SUPERVISION_TIMEOUT_MIN
            && self.supervision_timeout <= L2CAP_LE_SUPERVISION_TIMEOUT_MAX;

        interval_ok && latency_ok && timeout_ok
    }
}

/// Policy deciding how the engine answers inbound requests for a PSM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionPolicy {
    /// Answer connection, configuration and disconnection requests
    /// without waiting for the service
    pub auto_accept: bool,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self { auto_accept: true }
    }
}
