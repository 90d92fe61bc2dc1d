//! Protocol/Service Multiplexer (PSM) handling for L2CAP
//!
//! This module manages PSM values for classic and LE channels.

use std::fmt;

/// Protocol/Service Multiplexer (PSM) values used in L2CAP.
///
/// See Bluetooth Core Specification Vol 3, Part A, Section 4.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PSM {
    /// Service Discovery Protocol
    SDP,
    /// RFCOMM protocol
    RFCOMM,
    /// BNEP protocol
    BNEP,
    /// HID Control
    HID_CONTROL,
    /// HID Interrupt
    HID_INTERRUPT,
    /// AVCTP protocol
    AVCTP,
    /// AVDTP protocol
    AVDTP,
    /// AVCTP Browsing
    AVCTP_BROWSING,
    /// ATT protocol
    ATT,
    /// Internet Protocol Support Profile (LE)
    IPSP,
    /// Object Transfer Service (LE)
    OTS,
    /// Any other PSM, fixed or dynamically assigned
    Dynamic(u16),
}

/// First dynamic classic PSM
pub const DYNAMIC_PSM_MIN: u16 = 0x1001;
/// First dynamic LE PSM
pub const LE_DYNAMIC_PSM_MIN: u16 = 0x0081;
/// Last LE PSM
pub const LE_PSM_MAX: u16 = 0x00FF;

impl PSM {
    /// Get the PSM value as u16
    pub fn value(&self) -> u16 {
        match self {
            PSM::SDP => 0x0001,
            PSM::RFCOMM => 0x0003,
            PSM::BNEP => 0x000F,
            PSM::HID_CONTROL => 0x0011,
            PSM::HID_INTERRUPT => 0x0013,
            PSM::AVCTP => 0x0017,
            PSM::AVDTP => 0x0019,
            PSM::AVCTP_BROWSING => 0x001B,
            PSM::ATT => 0x001F,
            PSM::IPSP => 0x0023,
            PSM::OTS => 0x0025,
            PSM::Dynamic(value) => *value,
        }
    }

    /// Try to create a PSM from a u16 value
    pub fn from_value(value: u16) -> Option<Self> {
        let psm = match value {
            0x0001 => PSM::SDP,
            0x0003 => PSM::RFCOMM,
            0x000F => PSM::BNEP,
            0x0011 => PSM::HID_CONTROL,
            0x0013 => PSM::HID_INTERRUPT,
            0x0017 => PSM::AVCTP,
            0x0019 => PSM::AVDTP,
            0x001B => PSM::AVCTP_BROWSING,
            0x001F => PSM::ATT,
            0x0023 => PSM::IPSP,
            0x0025 => PSM::OTS,
            _ => PSM::Dynamic(value),
        };
        psm.is_valid().then_some(psm)
    }

    /// Classic PSM rule: least significant octet odd, bit 8 clear
    pub fn is_valid(&self) -> bool {
        let value = self.value();
        value & 0x0001 == 0x0001 && value & 0x0100 == 0
    }

    /// LE PSMs additionally live in 0x0001..=0x00FF
    pub fn is_valid_le(&self) -> bool {
        self.is_valid() && self.value() <= LE_PSM_MAX
    }
}

impl fmt::Display for PSM {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PSM::SDP => "SDP",
            PSM::RFCOMM => "RFCOMM",
            PSM::BNEP => "BNEP",
            PSM::HID_CONTROL => "HID-Control",
            PSM::HID_INTERRUPT => "HID-Interrupt",
            PSM::AVCTP => "AVCTP",
            PSM::AVDTP => "AVDTP",
            PSM::AVCTP_BROWSING => "AVCTP-Browsing",
            PSM::ATT => "ATT",
            PSM::IPSP => "IPSP",
            PSM::OTS => "OTS",
            PSM::Dynamic(_) => "Dynamic PSM",
        };
        write!(f, "{} (0x{:04X})", name, self.value())
    }
}

/// Hands out unused dynamic PSMs for one engine instance
#[derive(Debug)]
pub struct DynamicPsmAllocator {
    next_classic: u16,
    next_le: u16,
}

impl Default for DynamicPsmAllocator {
    fn default() -> Self {
        Self {
            next_classic: DYNAMIC_PSM_MIN,
            next_le: LE_DYNAMIC_PSM_MIN,
        }
    }
}

impl DynamicPsmAllocator {
    /// Next valid classic dynamic PSM for which `in_use` is false
    pub fn allocate(&mut self, in_use: impl Fn(u16) -> bool) -> Option<PSM> {
        let start = self.next_classic;
        let mut candidate = start;
        loop {
            let psm = PSM::Dynamic(candidate);
            candidate = Self::step_classic(candidate);
            if psm.is_valid() && !in_use(psm.value()) {
                self.next_classic = candidate;
                return Some(psm);
            }
            if candidate == start {
                return None;
            }
        }
    }

    /// Next valid LE dynamic PSM for which `in_use` is false
    pub fn allocate_le(&mut self, in_use: impl Fn(u16) -> bool) -> Option<PSM> {
        let start = self.next_le;
        let mut candidate = start;
        loop {
            let psm = PSM::Dynamic(candidate);
            candidate = if candidate >= LE_PSM_MAX - 1 {
                LE_DYNAMIC_PSM_MIN
            } else {
                candidate + 2
            };
            if !in_use(psm.value()) {
                self.next_le = candidate;
                return Some(psm);
            }
            if candidate == start {
                return None;
            }
        }
    }

    fn step_classic(value: u16) -> u16 {
        match value.checked_add(2) {
            Some(next) => next,
            None => DYNAMIC_PSM_MIN,
        }
    }
}
