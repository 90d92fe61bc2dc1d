//! Upper-layer service interfaces
//!
//! Services register a PSM and receive channel events through the
//! [`Service`] trait. Every method has an empty default so a service only
//! implements what it cares about. Events are delivered after the engine
//! has finished processing the call or frame that caused them.

use std::fmt;

use super::types::{BdAddr, ChannelConfig, ConfigResult, ConnectionParameterUpdate, ConnectionType, LeChannelConfig};

/// Link a channel event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub handle: u16,
    pub address: BdAddr,
    pub kind: ConnectionType,
}

/// Why a channel went away without a disconnection exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A signaling request was not answered in time
    Timeout,
    /// Peer violated the protocol (credit overflow, retry limit, ...)
    ProtocolError,
    /// Peer rejected a command naming this channel
    Rejected,
    /// Both sides opened at once and discovery had already finished
    StateCollision,
    /// Link creation failed with this HCI status
    ConnectFailed(u8),
    /// Link dropped with this HCI reason
    LinkLoss(u8),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "signaling timeout"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::Rejected => write!(f, "rejected by peer"),
            Self::StateCollision => write!(f, "state collision"),
            Self::ConnectFailed(status) => write!(f, "link connect failed (0x{:02X})", status),
            Self::LinkLoss(reason) => write!(f, "link lost (0x{:02X})", reason),
        }
    }
}

/// Upper-layer protocol bound to a PSM
///
/// With an auto-accepting policy the engine has already answered the
/// requests reported to `on_connect_request`, `on_config_request` and
/// `on_disconnect_request`; otherwise the service must answer through the
/// matching manager call.
#[allow(unused_variables)]
pub trait Service: Send {
    fn on_connect_request(&mut self, lcid: u16, identifier: u8, info: &ConnectionInfo, remote_psm: u16) {}

    fn on_connect_response(&mut self, lcid: u16, info: &ConnectionInfo, result: u16, status: u16) {}

    fn on_config_request(&mut self, lcid: u16, identifier: u8, config: &ChannelConfig) {}

    fn on_config_response(&mut self, lcid: u16, result: ConfigResult, config: &ChannelConfig) {}

    fn on_disconnect_request(&mut self, lcid: u16, identifier: u8) {}

    fn on_disconnect_response(&mut self, lcid: u16) {}

    fn on_data(&mut self, lcid: u16, data: &[u8]) {}

    fn on_remote_busy(&mut self, lcid: u16, busy: bool) {}

    fn on_disconnect_abnormal(&mut self, lcid: u16, reason: DisconnectReason) {}

    /// Channel reached the connected state
    fn on_connected(&mut self, lcid: u16) {}

    fn on_le_connect_request(&mut self, lcid: u16, identifier: u8, info: &ConnectionInfo, remote: &LeChannelConfig) {}

    fn on_le_connect_response(&mut self, lcid: u16, info: &ConnectionInfo, result: u16) {}
}

/// Answers echo requests and receives echo responses
#[allow(unused_variables)]
pub trait EchoHandler: Send {
    /// Data to return in the echo response
    fn on_echo_request(&mut self, handle: u16, data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn on_echo_response(&mut self, handle: u16, data: &[u8]) {}
}

/// Decides LE connection parameter update requests
#[allow(unused_variables)]
pub trait ConnectionParameterHandler: Send {
    /// `Some(accepted)` answers at once, `None` answers later through
    /// `connection_parameter_update_response`
    fn on_update_request(&mut self, handle: u16, identifier: u8, params: &ConnectionParameterUpdate) -> Option<bool> {
        Some(false)
    }

    fn on_update_response(&mut self, handle: u16, result: u16) {}
}

/// Receives frames on the LE fixed channels (ATT, SMP)
pub trait FixedChannelHandler: Send {
    fn on_data(&mut self, handle: u16, cid: u16, data: &[u8]);
}

/// Registration a channel's events are routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceKey {
    Classic(u16),
    Le(u16),
}

/// Event queued for delivery to a channel's service
#[derive(Debug, Clone)]
pub(crate) enum ServiceEvent {
    ConnectRequest { identifier: u8, info: ConnectionInfo, remote_psm: u16 },
    ConnectResponse { info: ConnectionInfo, result: u16, status: u16 },
    ConfigRequest { identifier: u8, config: ChannelConfig },
    ConfigResponse { result: ConfigResult, config: ChannelConfig },
    DisconnectRequest { identifier: u8 },
    DisconnectResponse,
    Data(Vec<u8>),
    RemoteBusy(bool),
    DisconnectAbnormal(DisconnectReason),
    Connected,
    LeConnectRequest { identifier: u8, info: ConnectionInfo, remote: LeChannelConfig },
    LeConnectResponse { info: ConnectionInfo, result: u16 },
}

impl ServiceEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::ConnectRequest { .. } => "connect request",
            Self::ConnectResponse { .. } => "connect response",
            Self::ConfigRequest { .. } => "config request",
            Self::ConfigResponse { .. } => "config response",
            Self::DisconnectRequest { .. } => "disconnect request",
            Self::DisconnectResponse => "disconnect response",
            Self::Data(_) => "data",
            Self::RemoteBusy(_) => "remote busy",
            Self::DisconnectAbnormal(_) => "abnormal disconnect",
            Self::Connected => "connected",
            Self::LeConnectRequest { .. } => "LE connect request",
            Self::LeConnectResponse { .. } => "LE connect response",
        }
    }

    pub(crate) fn deliver(self, service: &mut dyn Service, lcid: u16) {
        match self {
            Self::ConnectRequest { identifier, info, remote_psm } => {
                service.on_connect_request(lcid, identifier, &info, remote_psm)
            }
            Self::ConnectResponse { info, result, status } => {
                service.on_connect_response(lcid, &info, result, status)
            }
            Self::ConfigRequest { identifier, config } => service.on_config_request(lcid, identifier, &config),
            Self::ConfigResponse { result, config } => service.on_config_response(lcid, result, &config),
            Self::DisconnectRequest { identifier } => service.on_disconnect_request(lcid, identifier),
            Self::DisconnectResponse => service.on_disconnect_response(lcid),
            Self::Data(data) => service.on_data(lcid, &data),
            Self::RemoteBusy(busy) => service.on_remote_busy(lcid, busy),
            Self::DisconnectAbnormal(reason) => service.on_disconnect_abnormal(lcid, reason),
            Self::Connected => service.on_connected(lcid),
            Self::LeConnectRequest { identifier, info, remote } => {
                service.on_le_connect_request(lcid, identifier, &info, &remote)
            }
            Self::LeConnectResponse { info, result } => service.on_le_connect_response(lcid, &info, result),
        }
    }
}
