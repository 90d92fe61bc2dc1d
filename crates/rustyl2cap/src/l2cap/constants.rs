//! L2CAP protocol constants
//!
//! Command codes, fixed channel identifiers, result codes and wire sizes
//! from the Bluetooth Core Specification Vol 3, Part A.

// Fixed channel identifiers
/// Classic signaling channel
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
/// Connectionless reception channel
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;
/// Attribute protocol (LE fixed channel)
pub const L2CAP_ATTRIBUTE_PROTOCOL_CID: u16 = 0x0004;
/// LE signaling channel
pub const L2CAP_LE_SIGNALING_CID: u16 = 0x0005;
/// Security manager protocol (LE fixed channel)
pub const L2CAP_SECURITY_MANAGER_CID: u16 = 0x0006;

// Dynamic channel identifier ranges
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;
pub const L2CAP_LE_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_LE_DYNAMIC_CID_MAX: u16 = 0x007F;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_REQUEST: u8 = 0x12;
pub const L2CAP_CONNECTION_PARAMETER_UPDATE_RESPONSE: u8 = 0x13;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_REQUEST: u8 = 0x14;
pub const L2CAP_LE_CREDIT_BASED_CONNECTION_RESPONSE: u8 = 0x15;
pub const L2CAP_LE_FLOW_CONTROL_CREDIT: u8 = 0x16;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_SIGNALING_MTU_EXCEEDED: u16 = 0x0001;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CONNECTION_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_CONNECTION_PENDING: u16 = 0x0001;
pub const L2CAP_CONNECTION_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_CONNECTION_SECURITY_BLOCK: u16 = 0x0003;
pub const L2CAP_CONNECTION_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_CONNECTION_INVALID_SOURCE_CID: u16 = 0x0006;
pub const L2CAP_CONNECTION_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x0007;

// Connection response status (only meaningful with a pending result)
pub const L2CAP_STATUS_NO_INFORMATION: u16 = 0x0000;
pub const L2CAP_STATUS_AUTHENTICATION_PENDING: u16 = 0x0001;
pub const L2CAP_STATUS_AUTHORIZATION_PENDING: u16 = 0x0002;

// LE credit based connection results
pub const L2CAP_LE_CONNECTION_SUCCESSFUL: u16 = 0x0000;
pub const L2CAP_LE_PSM_NOT_SUPPORTED: u16 = 0x0002;
pub const L2CAP_LE_NO_RESOURCES: u16 = 0x0004;
pub const L2CAP_LE_INVALID_SOURCE_CID: u16 = 0x0009;
pub const L2CAP_LE_SOURCE_CID_ALREADY_ALLOCATED: u16 = 0x000A;
pub const L2CAP_LE_UNACCEPTABLE_PARAMETERS: u16 = 0x000B;

// Configuration options (top bit marks a hint)
pub const L2CAP_CONF_HINT: u8 = 0x80;
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_QOS: u8 = 0x03;
pub const L2CAP_CONF_RFC: u8 = 0x04;
pub const L2CAP_CONF_FCS: u8 = 0x05;
pub const L2CAP_CONF_EXT_FLOW_SPEC: u8 = 0x06;
pub const L2CAP_CONF_EXT_WINDOW: u8 = 0x07;

// Required option value lengths
pub const L2CAP_CONF_MTU_SIZE: u8 = 2;
pub const L2CAP_CONF_FLUSH_TIMEOUT_SIZE: u8 = 2;
pub const L2CAP_CONF_QOS_SIZE: u8 = 22;
pub const L2CAP_CONF_RFC_SIZE: u8 = 9;
pub const L2CAP_CONF_FCS_SIZE: u8 = 1;

// QoS service types accepted in a configuration request
pub const L2CAP_QOS_NO_TRAFFIC: u8 = 0x00;
pub const L2CAP_QOS_BEST_EFFORT: u8 = 0x01;
pub const L2CAP_QOS_GUARANTEED: u8 = 0x02;

/// Continuation flag in configuration request/response
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// FCS option values
pub const L2CAP_FCS_NONE: u8 = 0x00;
pub const L2CAP_FCS_16BIT: u8 = 0x01;

// Information request types
pub const L2CAP_INFO_CONNECTIONLESS_MTU: u16 = 0x0001;
pub const L2CAP_INFO_EXTENDED_FEATURES: u16 = 0x0002;
pub const L2CAP_INFO_FIXED_CHANNELS: u16 = 0x0003;

// Information response results
pub const L2CAP_INFO_SUCCESS: u16 = 0x0000;
pub const L2CAP_INFO_NOT_SUPPORTED: u16 = 0x0001;

// Extended feature mask bits
pub const L2CAP_FEATURE_FLOW_CONTROL: u32 = 0x0000_0001;
pub const L2CAP_FEATURE_RETRANSMISSION: u32 = 0x0000_0002;
pub const L2CAP_FEATURE_BIDIRECTIONAL_QOS: u32 = 0x0000_0004;
pub const L2CAP_FEATURE_ENHANCED_RETRANSMISSION: u32 = 0x0000_0008;
pub const L2CAP_FEATURE_STREAMING: u32 = 0x0000_0010;
pub const L2CAP_FEATURE_FCS: u32 = 0x0000_0020;
pub const L2CAP_FEATURE_FIXED_CHANNELS: u32 = 0x0000_0080;

/// Fixed channel mask bit for the signaling channel
pub const L2CAP_FIXED_CHANNEL_SIGNALING: u64 = 0x0000_0000_0000_0002;

// Connection parameter update
pub const L2CAP_CONN_PARAM_ACCEPTED: u16 = 0x0000;
pub const L2CAP_CONN_PARAM_REJECTED: u16 = 0x0001;
pub const L2CAP_LE_CONN_INTERVAL_MIN: u16 = 0x0006;
pub const L2CAP_LE_CONN_INTERVAL_MAX: u16 = 0x0C80;
pub const L2CAP_LE_CONN_LATENCY_MAX: u16 = 0x01F3;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MIN: u16 = 0x000A;
pub const L2CAP_LE_SUPERVISION_TIMEOUT_MAX: u16 = 0x0C80;

// Sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;
pub const L2CAP_CONTROL_FIELD_SIZE: usize = 2;
pub const L2CAP_SDU_LENGTH_SIZE: usize = 2;
pub const L2CAP_FCS_SIZE: usize = 2;

/// Minimum MTU on classic links
pub const L2CAP_MIN_MTU: u16 = 48;
/// Default MTU on classic links
pub const L2CAP_DEFAULT_MTU: u16 = 672;
/// Minimum MTU and MPS on LE credit based channels
pub const L2CAP_LE_MIN_MTU: u16 = 23;
/// Maximum MPS on LE credit based channels
pub const L2CAP_LE_MAX_MPS: u16 = 65533;
/// Flush timeout value meaning "infinite, never flush"
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;

// Signaling identifiers cycle through 1..=255; 0 is never used
pub const L2CAP_MIN_IDENTIFIER: u8 = 0x01;
pub const L2CAP_MAX_IDENTIFIER: u8 = 0xFF;

/// Sequence numbers on enhanced retransmission and streaming channels are modulo 64
pub const L2CAP_SEQ_MODULO: u8 = 64;
/// Largest transmit window a standard control field can express
pub const L2CAP_MAX_TX_WINDOW: u8 = 63;

// Enhanced control field layout
pub const L2CAP_CTRL_FRAME_TYPE_MASK: u16 = 0x0001;
pub const L2CAP_CTRL_TXSEQ_MASK: u16 = 0x007E;
pub const L2CAP_CTRL_TXSEQ_SHIFT: u16 = 1;
pub const L2CAP_CTRL_SUPERVISORY_MASK: u16 = 0x000C;
pub const L2CAP_CTRL_SUPERVISORY_SHIFT: u16 = 2;
pub const L2CAP_CTRL_POLL: u16 = 0x0010;
pub const L2CAP_CTRL_FINAL: u16 = 0x0080;
pub const L2CAP_CTRL_REQSEQ_MASK: u16 = 0x3F00;
pub const L2CAP_CTRL_REQSEQ_SHIFT: u16 = 8;
pub const L2CAP_CTRL_SAR_MASK: u16 = 0xC000;
pub const L2CAP_CTRL_SAR_SHIFT: u16 = 14;

/// HCI disconnect reason used when this engine drops an idle or failed link
pub const HCI_REMOTE_USER_TERMINATED: u8 = 0x13;
