//! L2CAP Signaling channel implementation
//!
//! This module encodes and decodes signaling commands and configuration
//! options. Command handling lives in the classic and LE handler modules.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::*;
use super::packet::*;
use super::types::*;

/// Handle for identifying signaling transactions
pub type SignalId = u8;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: u16,
        source_cid: u16,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
        result: u16,
        status: u16,
    },

    /// Configuration Request; options stay raw so fragments can be joined
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: u16,
        flags: u16,
        options: Vec<u8>,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: u16,
        flags: u16,
        result: u16,
        options: Vec<u8>,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        source_cid: u16,
    },

    /// Echo Request
    EchoRequest { identifier: SignalId, data: Vec<u8> },

    /// Echo Response
    EchoResponse { identifier: SignalId, data: Vec<u8> },

    /// Information Request
    InformationRequest { identifier: SignalId, info_type: u16 },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },

    /// Connection Parameter Update Request (LE only)
    ConnectionParameterUpdateRequest {
        identifier: SignalId,
        params: ConnectionParameterUpdate,
    },

    /// Connection Parameter Update Response (LE only)
    ConnectionParameterUpdateResponse { identifier: SignalId, result: u16 },

    /// LE Credit Based Connection Request
    LeCreditBasedConnectionRequest {
        identifier: SignalId,
        le_psm: u16,
        source_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
    },

    /// LE Credit Based Connection Response
    LeCreditBasedConnectionResponse {
        identifier: SignalId,
        destination_cid: u16,
        mtu: u16,
        mps: u16,
        initial_credits: u16,
        result: u16,
    },

    /// LE Flow Control Credit
    LeFlowControlCredit {
        identifier: SignalId,
        cid: u16,
        credits: u16,
    },
}

/// Little-endian reader over command parameters
struct Params<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Params<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn u8(&mut self, what: &str) -> L2capResult<u8> {
        self.cursor
            .read_u8()
            .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
    }

    fn u16(&mut self, what: &str) -> L2capResult<u16> {
        self.cursor
            .read_u16::<LittleEndian>()
            .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
    }

    fn u32(&mut self, what: &str) -> L2capResult<u32> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
    }

    fn rest(&self) -> Vec<u8> {
        let data = *self.cursor.get_ref();
        let position = (self.cursor.position() as usize).min(data.len());
        data[position..].to_vec()
    }
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
            Self::ConnectionParameterUpdateRequest { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST
            }
            Self::ConnectionParameterUpdateResponse { .. } => {
                L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE
            }
            Self::LeCreditBasedConnectionRequest { .. } => L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST,
            Self::LeCreditBasedConnectionResponse { .. } => {
                L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE
            }
            Self::LeFlowControlCredit { .. } => L2CAP_LE_FLOW_CONTROL_CREDIT,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. }
            | Self::ConnectionParameterUpdateRequest { identifier, .. }
            | Self::ConnectionParameterUpdateResponse { identifier, .. }
            | Self::LeCreditBasedConnectionRequest { identifier, .. }
            | Self::LeCreditBasedConnectionResponse { identifier, .. }
            | Self::LeFlowControlCredit { identifier, .. } => *identifier,
        }
    }

    /// Whether `code` may appear on the signaling channel of the given link type
    pub fn is_allowed(code: u8, is_le: bool) -> bool {
        if is_le {
            matches!(
                code,
                L2CAP_COMMAND_REJECT
                    | L2CAP_DISCONNECTION_REQUEST
                    | L2CAP_DISCONNECTION_RESPONSE
                    | L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST
                    | L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE
                    | L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST
                    | L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE
                    | L2CAP_LE_FLOW_CONTROL_CREDIT
            )
        } else {
            (L2CAP_COMMAND_REJECT..=L2CAP_INFORMATION_RESPONSE).contains(&code)
        }
    }

    /// Parse a single signaling command from raw bytes
    pub fn parse(data: &[u8], is_le: bool) -> L2capResult<Self> {
        let cmd_header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("Signaling data too short".into()))?;

        let params = data
            .get(L2CAP_COMMAND_HEADER_SIZE..L2CAP_COMMAND_HEADER_SIZE + cmd_header.length as usize)
            .ok_or_else(|| L2capError::InvalidParameter("Command parameters too short".into()))?;

        if !Self::is_allowed(cmd_header.code, is_le) {
            return Err(L2capError::NotSupported);
        }

        Self::parse_command(&cmd_header, params)
    }

    /// Parse the parameters of a command whose header has already been read
    pub fn parse_command(cmd_header: &L2capCommandHeader, params: &[u8]) -> L2capResult<Self> {
        let identifier = cmd_header.identifier;
        let mut p = Params::new(params);

        let message = match cmd_header.code {
            L2CAP_COMMAND_REJECT => Self::CommandReject {
                identifier,
                reason: p.u16("reason")?,
                data: p.rest(),
            },

            L2CAP_CONNECTION_REQUEST => Self::ConnectionRequest {
                identifier,
                psm: p.u16("PSM")?,
                source_cid: p.u16("source CID")?,
            },

            L2CAP_CONNECTION_RESPONSE => Self::ConnectionResponse {
                identifier,
                destination_cid: p.u16("destination CID")?,
                source_cid: p.u16("source CID")?,
                result: p.u16("result")?,
                status: p.u16("status")?,
            },

            L2CAP_CONFIGURE_REQUEST => Self::ConfigureRequest {
                identifier,
                destination_cid: p.u16("destination CID")?,
                flags: p.u16("flags")?,
                options: p.rest(),
            },

            L2CAP_CONFIGURE_RESPONSE => Self::ConfigureResponse {
                identifier,
                source_cid: p.u16("source CID")?,
                flags: p.u16("flags")?,
                result: p.u16("result")?,
                options: p.rest(),
            },

            L2CAP_DISCONNECTION_REQUEST => Self::DisconnectionRequest {
                identifier,
                destination_cid: p.u16("destination CID")?,
                source_cid: p.u16("source CID")?,
            },

            L2CAP_DISCONNECTION_RESPONSE => Self::DisconnectionResponse {
                identifier,
                destination_cid: p.u16("destination CID")?,
                source_cid: p.u16("source CID")?,
            },

            L2CAP_ECHO_REQUEST => Self::EchoRequest {
                identifier,
                data: p.rest(),
            },

            L2CAP_ECHO_RESPONSE => Self::EchoResponse {
                identifier,
                data: p.rest(),
            },

            L2CAP_INFORMATION_REQUEST => Self::InformationRequest {
                identifier,
                info_type: p.u16("info type")?,
            },

            L2CAP_INFORMATION_RESPONSE => Self::InformationResponse {
                identifier,
                info_type: p.u16("info type")?,
                result: p.u16("result")?,
                data: p.rest(),
            },

            L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST => Self::ConnectionParameterUpdateRequest {
                identifier,
                params: ConnectionParameterUpdate {
                    conn_interval_min: p.u16("interval min")?,
                    conn_interval_max: p.u16("interval max")?,
                    conn_latency: p.u16("latency")?,
                    supervision_timeout: p.u16("supervision timeout")?,
                },
            },

            L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE => {
                Self::ConnectionParameterUpdateResponse {
                    identifier,
                    result: p.u16("result")?,
                }
            }

            L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST => Self::LeCreditBasedConnectionRequest {
                identifier,
                le_psm: p.u16("LE PSM")?,
                source_cid: p.u16("source CID")?,
                mtu: p.u16("MTU")?,
                mps: p.u16("MPS")?,
                initial_credits: p.u16("initial credits")?,
            },

            L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE => Self::LeCreditBasedConnectionResponse {
                identifier,
                destination_cid: p.u16("destination CID")?,
                mtu: p.u16("MTU")?,
                mps: p.u16("MPS")?,
                initial_credits: p.u16("initial credits")?,
                result: p.u16("result")?,
            },

            L2CAP_LE_FLOW_CONTROL_CREDIT => Self::LeFlowControlCredit {
                identifier,
                cid: p.u16("CID")?,
                credits: p.u16("credits")?,
            },

            _ => return Err(L2capError::NotSupported),
        };

        Ok(message)
    }

    /// Serialize the signaling message to bytes for transmission
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = Vec::new();
        let mut put = |value: u16| params.extend_from_slice(&value.to_le_bytes());

        match self {
            Self::CommandReject { reason, .. } => put(*reason),
            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                put(*psm);
                put(*source_cid);
            }
            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                put(*destination_cid);
                put(*source_cid);
                put(*result);
                put(*status);
            }
            Self::ConfigureRequest {
                destination_cid,
                flags,
                ..
            } => {
                put(*destination_cid);
                put(*flags);
            }
            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                ..
            } => {
                put(*source_cid);
                put(*flags);
                put(*result);
            }
            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                put(*destination_cid);
                put(*source_cid);
            }
            Self::EchoRequest { .. } | Self::EchoResponse { .. } => {}
            Self::InformationRequest { info_type, .. } => put(*info_type),
            Self::InformationResponse {
                info_type, result, ..
            } => {
                put(*info_type);
                put(*result);
            }
            Self::ConnectionParameterUpdateRequest { params: update, .. } => {
                put(update.conn_interval_min);
                put(update.conn_interval_max);
                put(update.conn_latency);
                put(update.supervision_timeout);
            }
            Self::ConnectionParameterUpdateResponse { result, .. } => put(*result),
            Self::LeCreditBasedConnectionRequest {
                le_psm,
                source_cid,
                mtu,
                mps,
                initial_credits,
                ..
            } => {
                put(*le_psm);
                put(*source_cid);
                put(*mtu);
                put(*mps);
                put(*initial_credits);
            }
            Self::LeCreditBasedConnectionResponse {
                destination_cid,
                mtu,
                mps,
                initial_credits,
                result,
                ..
            } => {
                put(*destination_cid);
                put(*mtu);
                put(*mps);
                put(*initial_credits);
                put(*result);
            }
            Self::LeFlowControlCredit { cid, credits, .. } => {
                put(*cid);
                put(*credits);
            }
        }

        // Variable-length tails
        match self {
            Self::CommandReject { data, .. }
            | Self::EchoRequest { data, .. }
            | Self::EchoResponse { data, .. }
            | Self::InformationResponse { data, .. } => params.extend_from_slice(data),
            Self::ConfigureRequest { options, .. } | Self::ConfigureResponse { options, .. } => {
                params.extend_from_slice(options)
            }
            _ => {}
        }

        let cmd_header =
            L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);
        result
    }

    /// Create a signaling L2CAP packet from this message
    pub fn to_packet(&self, is_le: bool) -> L2capPacket {
        let channel_id = if is_le {
            L2CAP_LE_SIGNALING_CID
        } else {
            L2CAP_SIGNALING_CID
        };

        L2capPacket::new(channel_id, self.serialize())
    }
}

/// Options of a configuration request after validation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedOptions {
    /// Recognised options
    pub options: ConfigOptions,
    /// Unknown non-hint option records, verbatim
    pub unknown: Vec<u8>,
}

/// Parse configuration options from raw bytes.
///
/// Malformed lengths, buffer overruns, unsupported QoS service types and
/// extended flow spec / extended window options are errors; the caller
/// answers them with a "rejected" configuration response.
pub fn parse_config_options(data: &[u8]) -> L2capResult<ParsedOptions> {
    let mut parsed = ParsedOptions::default();
    let mut offset = 0;

    while offset < data.len() {
        let header = data
            .get(offset..offset + 2)
            .ok_or_else(|| L2capError::ProtocolError("Truncated option header".into()))?;
        let raw_type = header[0];
        let option_type = raw_type & !L2CAP_CONF_HINT;
        let option_length = header[1];

        let end = offset + 2 + option_length as usize;
        let value = data
            .get(offset + 2..end)
            .ok_or_else(|| L2capError::ProtocolError("Option overruns buffer".into()))?;

        let expect_length = |required: u8| -> L2capResult<()> {
            if option_length == required {
                Ok(())
            } else {
                Err(L2capError::ProtocolError(format!(
                    "Option 0x{:02X} has length {}, expected {}",
                    option_type, option_length, required
                )))
            }
        };

        let mut p = Params::new(value);
        match option_type {
            L2CAP_CONF_MTU => {
                expect_length(L2CAP_CONF_MTU_SIZE)?;
                parsed.options.mtu = Some(p.u16("MTU")?);
            }
            L2CAP_CONF_FLUSH_TIMEOUT => {
                expect_length(L2CAP_CONF_FLUSH_TIMEOUT_SIZE)?;
                parsed.options.flush_timeout = Some(p.u16("flush timeout")?);
            }
            L2CAP_CONF_QOS => {
                expect_length(L2CAP_CONF_QOS_SIZE)?;
                let qos = QosFlowSpec {
                    flags: p.u8("QoS flags")?,
                    service_type: p.u8("service type")?,
                    token_rate: p.u32("token rate")?,
                    token_bucket_size: p.u32("token bucket size")?,
                    peak_bandwidth: p.u32("peak bandwidth")?,
                    latency: p.u32("latency")?,
                    delay_variation: p.u32("delay variation")?,
                };
                if qos.service_type != L2CAP_QOS_BEST_EFFORT
                    && qos.service_type != L2CAP_QOS_GUARANTEED
                {
                    return Err(L2capError::ProtocolError(format!(
                        "Unsupported QoS service type 0x{:02X}",
                        qos.service_type
                    )));
                }
                parsed.options.qos = Some(qos);
            }
            L2CAP_CONF_RFC => {
                expect_length(L2CAP_CONF_RFC_SIZE)?;
                let raw_mode = p.u8("mode")?;
                let mode = RetransmissionMode::from_u8(raw_mode).ok_or_else(|| {
                    L2capError::ProtocolError(format!("Unknown mode 0x{:02X}", raw_mode))
                })?;
                parsed.options.retransmission = Some(RetransmissionFlowControl {
                    mode,
                    tx_window_size: p.u8("tx window")?,
                    max_transmit: p.u8("max transmit")?,
                    retransmission_timeout: p.u16("retransmission timeout")?,
                    monitor_timeout: p.u16("monitor timeout")?,
                    mps: p.u16("MPS")?,
                });
            }
            L2CAP_CONF_FCS => {
                expect_length(L2CAP_CONF_FCS_SIZE)?;
                parsed.options.fcs = Some(p.u8("FCS")?);
            }
            L2CAP_CONF_EXT_FLOW_SPEC | L2CAP_CONF_EXT_WINDOW => {
                return Err(L2capError::ProtocolError(format!(
                    "Option 0x{:02X} not supported",
                    option_type
                )));
            }
            _ if raw_type & L2CAP_CONF_HINT != 0 => {}
            _ => parsed.unknown.extend_from_slice(&data[offset..end]),
        }

        offset = end;
    }

    Ok(parsed)
}

/// Option types named in an "unknown options" response, hint bit cleared
///
/// Values are not interpreted; a truncated trailing record still yields
/// its type.
pub fn listed_option_types(data: &[u8]) -> Vec<u8> {
    let mut types = Vec::new();
    let mut offset = 0;
    while let Some(&raw_type) = data.get(offset) {
        types.push(raw_type & !L2CAP_CONF_HINT);
        let length = data.get(offset + 1).copied().unwrap_or(0) as usize;
        offset += 2 + length;
    }
    types
}

/// Serialize configuration options to bytes
pub fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
    let mut result = Vec::new();

    if let Some(mtu) = options.mtu {
        result.extend_from_slice(&[L2CAP_CONF_MTU, L2CAP_CONF_MTU_SIZE]);
        result.extend_from_slice(&mtu.to_le_bytes());
    }

    if let Some(timeout) = options.flush_timeout {
        result.extend_from_slice(&[L2CAP_CONF_FLUSH_TIMEOUT, L2CAP_CONF_FLUSH_TIMEOUT_SIZE]);
        result.extend_from_slice(&timeout.to_le_bytes());
    }

    if let Some(qos) = options.qos {
        result.extend_from_slice(&[L2CAP_CONF_QOS, L2CAP_CONF_QOS_SIZE, qos.flags, qos.service_type]);
        for value in [
            qos.token_rate,
            qos.token_bucket_size,
            qos.peak_bandwidth,
            qos.latency,
            qos.delay_variation,
        ] {
            result.extend_from_slice(&value.to_le_bytes());
        }
    }

    if let Some(rfc) = options.retransmission {
        result.extend_from_slice(&[
            L2CAP_CONF_RFC,
            L2CAP_CONF_RFC_SIZE,
            rfc.mode as u8,
            rfc.tx_window_size,
            rfc.max_transmit,
        ]);
        result.extend_from_slice(&rfc.retransmission_timeout.to_le_bytes());
        result.extend_from_slice(&rfc.monitor_timeout.to_le_bytes());
        result.extend_from_slice(&rfc.mps.to_le_bytes());
    }

    if let Some(fcs) = options.fcs {
        result.extend_from_slice(&[L2CAP_CONF_FCS, L2CAP_CONF_FCS_SIZE, fcs]);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_request_wire_format() {
        let request = SignalingMessage::ConnectionRequest {
            identifier: 1,
            psm: 0x0001,
            source_cid: 0x0040,
        };

        let bytes = request.serialize();
        assert_eq!(bytes, vec![0x02, 0x01, 0x04, 0x00, 0x01, 0x00, 0x40, 0x00]);

        let parsed = SignalingMessage::parse(&bytes, false).unwrap();
        match parsed {
            SignalingMessage::ConnectionRequest {
                identifier,
                psm,
                source_cid,
            } => {
                assert_eq!(identifier, 1);
                assert_eq!(psm, 0x0001);
                assert_eq!(source_cid, 0x0040);
            }
            _ => panic!("Expected ConnectionRequest, got {:?}", parsed),
        }
    }

    #[test]
    fn test_le_rejects_classic_commands() {
        let request = SignalingMessage::InformationRequest {
            identifier: 3,
            info_type: L2CAP_INFO_EXTENDED_FEATURES,
        };
        let bytes = request.serialize();

        assert!(SignalingMessage::parse(&bytes, false).is_ok());
        assert!(matches!(
            SignalingMessage::parse(&bytes, true),
            Err(L2capError::NotSupported)
        ));
    }

    #[test]
    fn test_short_command_is_invalid() {
        // Connection response needs 8 parameter bytes
        let bytes = [0x03, 0x05, 0x04, 0x00, 0x40, 0x00, 0x41, 0x00];
        assert!(matches!(
            SignalingMessage::parse(&bytes, false),
            Err(L2capError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_config_options_roundtrip() {
        let options = ConfigOptions {
            mtu: Some(128),
            flush_timeout: Some(100),
            qos: None,
            retransmission: Some(RetransmissionFlowControl {
                mode: RetransmissionMode::EnhancedRetransmission,
                tx_window_size: 8,
                max_transmit: 3,
                retransmission_timeout: 2000,
                monitor_timeout: 12000,
                mps: 500,
            }),
            fcs: Some(L2CAP_FCS_NONE),
        };

        let bytes = serialize_config_options(&options);
        assert_eq!(bytes.len(), 4 + 4 + 11 + 3);

        let parsed = parse_config_options(&bytes).unwrap();
        assert_eq!(parsed.options, options);
        assert!(parsed.unknown.is_empty());
    }

    #[test]
    fn test_unknown_options() {
        // Unknown hint is skipped, unknown non-hint is kept verbatim
        let data = [
            0x01, 0x02, 0x00, 0x02, // MTU 512
            0x90, 0x01, 0xAA, // hint 0x10
            0x11, 0x04, 0x01, 0x02, 0x03, 0x04, // unknown 0x11
        ];
        let parsed = parse_config_options(&data).unwrap();
        assert_eq!(parsed.options.mtu, Some(512));
        assert_eq!(parsed.unknown, vec![0x11, 0x04, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_listed_option_types() {
        let data = [
            0x05, 0x01, 0x01, // FCS
            0x83, 0x16, // QoS as a hint, value cut short
        ];
        assert_eq!(listed_option_types(&data), vec![L2CAP_CONF_FCS, L2CAP_CONF_QOS]);
        assert!(listed_option_types(&[]).is_empty());
    }

    #[test]
    fn test_rejected_options() {
        // MTU with wrong length
        assert!(parse_config_options(&[0x01, 0x03, 0x00, 0x02, 0x00]).is_err());
        // Overrun
        assert!(parse_config_options(&[0x01, 0x02, 0x00]).is_err());
        // Extended window
        assert!(parse_config_options(&[0x07, 0x02, 0x10, 0x00]).is_err());

        // QoS with "no traffic" service type
        let mut qos = vec![L2CAP_CONF_QOS, L2CAP_CONF_QOS_SIZE, 0x00, L2CAP_QOS_NO_TRAFFIC];
        qos.extend_from_slice(&[0u8; 20]);
        assert!(parse_config_options(&qos).is_err());
        qos[3] = L2CAP_QOS_GUARANTEED;
        assert!(parse_config_options(&qos).is_ok());
    }
}
