//! L2CAP Packet handling
//!
//! This module provides structures and functions for handling L2CAP packets:
//! the basic header, the enhanced control field used by enhanced
//! retransmission and streaming channels, and the command header that
//! prefixes every signaling command.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

use super::constants::*;
use super::crc;

/// L2CAP Packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capHeader {
    /// Length of the L2CAP payload in bytes
    pub length: u16,
    /// Channel Identifier
    pub channel_id: u16,
}

impl L2capHeader {
    /// Create a new L2CAP header
    pub fn new(length: u16, channel_id: u16) -> Self {
        Self { length, channel_id }
    }

    /// Parse an L2CAP header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_BASIC_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(data);
        let length = cursor.read_u16::<LittleEndian>().ok()?;
        let channel_id = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self { length, channel_id })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; L2CAP_BASIC_HEADER_SIZE] {
        let mut result = [0u8; L2CAP_BASIC_HEADER_SIZE];
        result[..2].copy_from_slice(&self.length.to_le_bytes());
        result[2..].copy_from_slice(&self.channel_id.to_le_bytes());
        result
    }
}

/// Segmentation and reassembly marker of an I-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sar {
    Unsegmented = 0,
    Start = 1,
    End = 2,
    Continuation = 3,
}

impl Sar {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => Sar::Unsegmented,
            1 => Sar::Start,
            2 => Sar::End,
            _ => Sar::Continuation,
        }
    }
}

/// Supervisory function of an S-frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisoryFunction {
    /// RR
    ReceiverReady = 0,
    /// REJ
    Reject = 1,
    /// RNR
    ReceiverNotReady = 2,
    /// SREJ
    SelectiveReject = 3,
}

impl SupervisoryFunction {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x03 {
            0 => SupervisoryFunction::ReceiverReady,
            1 => SupervisoryFunction::Reject,
            2 => SupervisoryFunction::ReceiverNotReady,
            _ => SupervisoryFunction::SelectiveReject,
        }
    }
}

/// Enhanced control field for enhanced retransmission/streaming modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capControlField {
    /// Information frame
    Information {
        tx_seq: u8,
        req_seq: u8,
        final_bit: bool,
        sar: Sar,
    },
    /// Supervisory frame
    Supervisory {
        function: SupervisoryFunction,
        req_seq: u8,
        poll: bool,
        final_bit: bool,
    },
}

impl L2capControlField {
    /// Create a new control field for an Information frame (I-frame)
    pub fn new_i_frame(tx_seq: u8, req_seq: u8, final_bit: bool, sar: Sar) -> Self {
        Self::Information {
            tx_seq: tx_seq % L2CAP_SEQ_MODULO,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
            final_bit,
            sar,
        }
    }

    /// Create a new control field for a Supervisory frame (S-frame)
    pub fn new_s_frame(
        function: SupervisoryFunction,
        req_seq: u8,
        poll: bool,
        final_bit: bool,
    ) -> Self {
        Self::Supervisory {
            function,
            req_seq: req_seq % L2CAP_SEQ_MODULO,
            poll,
            final_bit,
        }
    }

    /// Parse the control field from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor::new(data);
        let control = cursor.read_u16::<LittleEndian>().ok()?;
        Some(Self::from_u16(control))
    }

    pub fn from_u16(control: u16) -> Self {
        let req_seq = ((control & L2CAP_CTRL_REQSEQ_MASK) >> L2CAP_CTRL_REQSEQ_SHIFT) as u8;
        let final_bit = control & L2CAP_CTRL_FINAL != 0;

        if control & L2CAP_CTRL_FRAME_TYPE_MASK == 0 {
            Self::Information {
                tx_seq: ((control & L2CAP_CTRL_TXSEQ_MASK) >> L2CAP_CTRL_TXSEQ_SHIFT) as u8,
                req_seq,
                final_bit,
                sar: Sar::from_bits(control >> L2CAP_CTRL_SAR_SHIFT),
            }
        } else {
            Self::Supervisory {
                function: SupervisoryFunction::from_bits(
                    (control & L2CAP_CTRL_SUPERVISORY_MASK) >> L2CAP_CTRL_SUPERVISORY_SHIFT,
                ),
                req_seq,
                poll: control & L2CAP_CTRL_POLL != 0,
                final_bit,
            }
        }
    }

    /// Convert the control field to a u16 value
    pub fn to_u16(&self) -> u16 {
        match *self {
            Self::Information {
                tx_seq,
                req_seq,
                final_bit,
                sar,
            } => {
                let mut control = ((tx_seq as u16) << L2CAP_CTRL_TXSEQ_SHIFT) & L2CAP_CTRL_TXSEQ_MASK;
                control |= ((req_seq as u16) << L2CAP_CTRL_REQSEQ_SHIFT) & L2CAP_CTRL_REQSEQ_MASK;
                control |= (sar as u16) << L2CAP_CTRL_SAR_SHIFT;
                if final_bit {
                    control |= L2CAP_CTRL_FINAL;
                }
                control
            }
            Self::Supervisory {
                function,
                req_seq,
                poll,
                final_bit,
            } => {
                let mut control = L2CAP_CTRL_FRAME_TYPE_MASK;
                control |= (function as u16) << L2CAP_CTRL_SUPERVISORY_SHIFT;
                control |= ((req_seq as u16) << L2CAP_CTRL_REQSEQ_SHIFT) & L2CAP_CTRL_REQSEQ_MASK;
                if poll {
                    control |= L2CAP_CTRL_POLL;
                }
                if final_bit {
                    control |= L2CAP_CTRL_FINAL;
                }
                control
            }
        }
    }

    /// Serialize the control field to bytes
    pub fn to_bytes(&self) -> [u8; 2] {
        self.to_u16().to_le_bytes()
    }

    pub fn req_seq(&self) -> u8 {
        match *self {
            Self::Information { req_seq, .. } | Self::Supervisory { req_seq, .. } => req_seq,
        }
    }

    pub fn final_bit(&self) -> bool {
        match *self {
            Self::Information { final_bit, .. } | Self::Supervisory { final_bit, .. } => final_bit,
        }
    }
}

/// Basic information frame: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2capPacket {
    /// L2CAP header
    pub header: L2capHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl L2capPacket {
    /// Create a new L2CAP packet
    pub fn new(channel_id: u16, payload: Vec<u8>) -> Self {
        Self {
            header: L2capHeader::new(payload.len() as u16, channel_id),
            payload,
        }
    }

    /// Parse an L2CAP packet from raw bytes. The declared length must
    /// exactly cover the bytes that follow the header.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let header = L2capHeader::parse(data)?;
        let payload = &data[L2CAP_BASIC_HEADER_SIZE..];
        if payload.len() != header.length as usize {
            return None;
        }

        Some(Self {
            header,
            payload: payload.to_vec(),
        })
    }

    /// Serialize the L2CAP packet to a byte vector
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.size());
        result.extend_from_slice(&self.header.to_bytes());
        result.extend_from_slice(&self.payload);
        result
    }

    /// Get the full size of the packet in bytes
    pub fn size(&self) -> usize {
        L2CAP_BASIC_HEADER_SIZE + self.payload.len()
    }
}

/// Frame of an enhanced retransmission or streaming channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedFrame {
    pub control: L2capControlField,
    /// Total SDU length, present on start segments only
    pub sdu_length: Option<u16>,
    pub payload: Vec<u8>,
}

impl EnhancedFrame {
    pub fn supervisory(control: L2capControlField) -> Self {
        Self {
            control,
            sdu_length: None,
            payload: Vec::new(),
        }
    }

    /// Encode to a complete frame for `channel_id`, appending the FCS when enabled
    pub fn encode(&self, channel_id: u16, with_fcs: bool) -> Vec<u8> {
        let sdu_len_size = if self.sdu_length.is_some() {
            L2CAP_SDU_LENGTH_SIZE
        } else {
            0
        };
        let fcs_size = if with_fcs { L2CAP_FCS_SIZE } else { 0 };
        let length = L2CAP_CONTROL_FIELD_SIZE + sdu_len_size + self.payload.len() + fcs_size;

        let mut frame = Vec::with_capacity(L2CAP_BASIC_HEADER_SIZE + length);
        frame.extend_from_slice(&L2capHeader::new(length as u16, channel_id).to_bytes());
        frame.extend_from_slice(&self.control.to_bytes());
        if let Some(sdu_length) = self.sdu_length {
            frame.extend_from_slice(&sdu_length.to_le_bytes());
        }
        frame.extend_from_slice(&self.payload);
        if with_fcs {
            let fcs = crc::fcs(&frame);
            frame.extend_from_slice(&fcs.to_le_bytes());
        }
        frame
    }

    /// Decode a complete frame. Returns None when the frame is truncated or
    /// its FCS does not match.
    pub fn decode(frame: &[u8], with_fcs: bool) -> Option<Self> {
        let header = L2capHeader::parse(frame)?;
        let end = L2CAP_BASIC_HEADER_SIZE + header.length as usize;
        if frame.len() != end {
            return None;
        }

        let body_end = if with_fcs {
            if !crc::verify(frame) {
                return None;
            }
            end.checked_sub(L2CAP_FCS_SIZE)?
        } else {
            end
        };

        let body = frame.get(L2CAP_BASIC_HEADER_SIZE..body_end)?;
        let control = L2capControlField::parse(body)?;
        let mut rest = &body[L2CAP_CONTROL_FIELD_SIZE..];

        let sdu_length = match control {
            L2capControlField::Information {
                sar: Sar::Start, ..
            } => {
                let mut cursor = Cursor::new(rest);
                let sdu_length = cursor.read_u16::<LittleEndian>().ok()?;
                rest = &rest[L2CAP_SDU_LENGTH_SIZE..];
                Some(sdu_length)
            }
            _ => None,
        };

        Some(Self {
            control,
            sdu_length,
            payload: rest.to_vec(),
        })
    }
}

/// L2CAP Command header used in signaling packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L2capCommandHeader {
    /// Command code
    pub code: u8,
    /// Command identifier
    pub identifier: u8,
    /// Length of command parameters
    pub length: u16,
}

impl L2capCommandHeader {
    /// Create a new command header
    pub fn new(code: u8, identifier: u8, length: u16) -> Self {
        Self {
            code,
            identifier,
            length,
        }
    }

    /// Parse a command header from raw bytes
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < L2CAP_COMMAND_HEADER_SIZE {
            return None;
        }

        let mut cursor = Cursor::new(&data[2..4]);
        let length = cursor.read_u16::<LittleEndian>().ok()?;

        Some(Self {
            code: data[0],
            identifier: data[1],
            length,
        })
    }

    /// Serialize the command header to bytes
    pub fn to_bytes(&self) -> [u8; 4] {
        let length = self.length.to_le_bytes();
        [self.code, self.identifier, length[0], length[1]]
    }
}
