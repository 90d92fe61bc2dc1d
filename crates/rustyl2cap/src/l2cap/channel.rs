//! L2CAP Channel implementation
//!
//! A channel is one logical endpoint pair multiplexed over a link. This
//! module keeps its signaling state, the configuration of both directions
//! and the flow control engine selected once it is connected.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;

use super::credit::CreditEngine;
use super::erfc::{ErfcEngine, ErfcParams};
use super::service::ServiceKey;
use super::types::*;

/// Type of L2CAP channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2capChannelType {
    /// Dynamically allocated connection-oriented channel on BR/EDR
    ConnectionOriented,
    /// LE Credit-based connection-oriented channel
    LeCreditBased,
}

bitflags! {
    /// Which halves of the configuration exchange have completed
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConfigProgress: u8 {
        /// We accepted the peer's request
        const IN_DONE = 0x01;
        /// The peer accepted our request
        const OUT_DONE = 0x02;
    }
}

/// Reassembly of a configuration request split with the continuation flag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigFragments {
    #[default]
    Empty,
    Accumulating(Vec<u8>),
}

impl ConfigFragments {
    /// Append one fragment. Returns the complete option block once the
    /// final fragment arrives, `Ok(None)` while more are expected, and an
    /// error (discarding everything) when the block grows past `limit`.
    pub fn push(&mut self, bytes: &[u8], more: bool, limit: usize) -> L2capResult<Option<Vec<u8>>> {
        let mut buffer = match std::mem::take(self) {
            Self::Empty => Vec::new(),
            Self::Accumulating(buffer) => buffer,
        };

        if buffer.len() + bytes.len() > limit {
            return Err(L2capError::ProtocolError(format!(
                "Configuration options exceed {} bytes",
                limit
            )));
        }
        buffer.extend_from_slice(bytes);

        if more {
            *self = Self::Accumulating(buffer);
            Ok(None)
        } else {
            Ok(Some(buffer))
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// Flow control engine of a connected channel
#[derive(Debug)]
pub enum ModeState {
    Basic,
    Erfc(ErfcEngine),
    Credit(CreditEngine),
}

/// L2CAP Channel structure
#[derive(Debug)]
pub struct L2capChannel {
    /// Local Channel Identifier (CID)
    pub(crate) local_cid: u16,
    /// Remote Channel Identifier, 0 until known
    pub(crate) remote_cid: u16,
    /// PSM of the local service owning this channel
    pub(crate) local_psm: u16,
    /// PSM requested on the peer
    pub(crate) remote_psm: u16,
    pub(crate) state: ChannelState,
    pub(crate) channel_type: L2capChannelType,
    /// Identifier of the inbound connection request awaiting an answer
    pub(crate) connect_identifier: u8,
    /// Identifier of the inbound disconnection request awaiting an answer
    pub(crate) disconnect_identifier: u8,
    /// What we proposed: our receive side
    pub(crate) local_config: ChannelConfig,
    /// What the peer proposed and we accepted: our transmit side
    pub(crate) remote_config: ChannelConfig,
    /// Peer proposal waiting for the service's verdict
    pub(crate) pending_remote: Option<ChannelConfig>,
    pub(crate) le_local: LeChannelConfig,
    pub(crate) le_remote: LeChannelConfig,
    pub(crate) progress: ConfigProgress,
    pub(crate) fragments: ConfigFragments,
    /// Configuration requests sent after an unacceptable response
    pub(crate) config_attempts: u8,
    /// Abnormal disconnect already reported to the service
    pub(crate) abnormal_reported: bool,
    pub(crate) mode: ModeState,
}

impl L2capChannel {
    /// New BR/EDR channel in the IDLE state
    pub fn new_classic(local_cid: u16, local_psm: u16, remote_psm: u16, config: ChannelConfig) -> Self {
        Self::new(
            local_cid,
            local_psm,
            remote_psm,
            L2capChannelType::ConnectionOriented,
            config,
            LeChannelConfig::default(),
        )
    }

    /// New LE credit based channel in the IDLE state
    pub fn new_le(local_cid: u16, local_psm: u16, remote_psm: u16, config: LeChannelConfig) -> Self {
        Self::new(
            local_cid,
            local_psm,
            remote_psm,
            L2capChannelType::LeCreditBased,
            ChannelConfig::default(),
            config,
        )
    }

    fn new(
        local_cid: u16,
        local_psm: u16,
        remote_psm: u16,
        channel_type: L2capChannelType,
        config: ChannelConfig,
        le_config: LeChannelConfig,
    ) -> Self {
        Self {
            local_cid,
            remote_cid: 0,
            local_psm,
            remote_psm,
            state: ChannelState::Idle,
            channel_type,
            connect_identifier: 0,
            disconnect_identifier: 0,
            local_config: config,
            remote_config: ChannelConfig::default(),
            pending_remote: None,
            le_local: le_config,
            le_remote: LeChannelConfig::default(),
            progress: ConfigProgress::empty(),
            fragments: ConfigFragments::Empty,
            config_attempts: 0,
            abnormal_reported: false,
            mode: ModeState::Basic,
        }
    }

    pub fn local_cid(&self) -> u16 {
        self.local_cid
    }

    pub fn remote_cid(&self) -> u16 {
        self.remote_cid
    }

    pub fn local_psm(&self) -> u16 {
        self.local_psm
    }

    pub fn remote_psm(&self) -> u16 {
        self.remote_psm
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn channel_type(&self) -> L2capChannelType {
        self.channel_type
    }

    pub fn is_le(&self) -> bool {
        self.channel_type == L2capChannelType::LeCreditBased
    }

    pub(crate) fn service_key(&self) -> ServiceKey {
        if self.is_le() {
            ServiceKey::Le(self.local_psm)
        } else {
            ServiceKey::Classic(self.local_psm)
        }
    }

    pub fn local_config(&self) -> &ChannelConfig {
        &self.local_config
    }

    pub fn remote_config(&self) -> &ChannelConfig {
        &self.remote_config
    }

    pub fn le_local_config(&self) -> &LeChannelConfig {
        &self.le_local
    }

    pub fn le_remote_config(&self) -> &LeChannelConfig {
        &self.le_remote
    }

    pub fn mode(&self) -> &ModeState {
        &self.mode
    }

    /// Largest SDU we may send
    pub fn tx_mtu(&self) -> u16 {
        if self.is_le() {
            self.le_remote.mtu
        } else {
            self.remote_config.mtu
        }
    }

    /// Both configuration directions are done
    pub fn is_configured(&self) -> bool {
        self.progress.contains(ConfigProgress::IN_DONE | ConfigProgress::OUT_DONE)
    }

    /// FCS is used unless both sides asked to omit it
    pub fn uses_fcs(&self) -> bool {
        self.local_config.fcs || self.remote_config.fcs
    }

    /// Credits we may still spend, for LE channels
    pub fn tx_credits(&self) -> Option<u16> {
        match &self.mode {
            ModeState::Credit(engine) => Some(engine.tx_credits()),
            _ => None,
        }
    }

    /// Build the flow control engine for the negotiated mode
    ///
    /// `fallback_rtx` and `fallback_monitor` replace timeouts the peer left
    /// at zero.
    pub(crate) fn start_mode(&mut self, fallback_rtx: u16, fallback_monitor: u16, tx_buffer: u16) {
        if self.is_le() {
            self.mode = ModeState::Credit(CreditEngine::new(self.remote_cid, self.le_local, self.le_remote));
            return;
        }

        let local = self.local_config.rfc;
        if local.mode == RetransmissionMode::Basic {
            self.mode = ModeState::Basic;
            return;
        }

        let remote = self.remote_config.rfc;
        let nonzero = |value: u16, fallback: u16| if value == 0 { fallback } else { value };
        let params = ErfcParams {
            mode: local.mode,
            remote_cid: self.remote_cid,
            tx_window: remote.tx_window_size.clamp(1, super::constants::L2CAP_MAX_TX_WINDOW),
            rx_window: local.tx_window_size.clamp(1, super::constants::L2CAP_MAX_TX_WINDOW),
            max_transmit: local.max_transmit,
            retransmission_timeout: Duration::from_millis(
                nonzero(local.retransmission_timeout, fallback_rtx) as u64,
            ),
            monitor_timeout: Duration::from_millis(nonzero(local.monitor_timeout, fallback_monitor) as u64),
            remote_mps: nonzero(remote.mps, tx_buffer).min(tx_buffer),
            local_mtu: self.local_config.mtu,
            fcs: self.uses_fcs(),
        };
        self.mode = ModeState::Erfc(ErfcEngine::new(params));
    }

    /// Drop the flow control engine and any data it still holds
    pub(crate) fn stop_mode(&mut self) {
        self.mode = ModeState::Basic;
    }
}

impl fmt::Display for L2capChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L2CAP Channel 0x{:04X} -> 0x{:04X} (PSM 0x{:04X}, {}, {:?})",
            self.local_cid, self.remote_cid, self.local_psm, self.state, self.channel_type
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_accumulate_until_final() {
        let mut fragments = ConfigFragments::Empty;
        assert_eq!(fragments.push(&[1, 2], true, 16).unwrap(), None);
        assert!(!fragments.is_empty());
        assert_eq!(fragments.push(&[3], false, 16).unwrap(), Some(vec![1, 2, 3]));
        assert!(fragments.is_empty());
    }

    #[test]
    fn test_fragments_over_limit_discarded() {
        let mut fragments = ConfigFragments::Empty;
        fragments.push(&[0; 10], true, 16).unwrap();
        assert!(fragments.push(&[0; 10], true, 16).is_err());
        assert!(fragments.is_empty());
    }

    #[test]
    fn test_ertm_mode_uses_both_directions() {
        let mut config = ChannelConfig::basic(672);
        config.rfc = RetransmissionFlowControl {
            mode: RetransmissionMode::EnhancedRetransmission,
            tx_window_size: 8,
            max_transmit: 3,
            retransmission_timeout: 0,
            monitor_timeout: 0,
            mps: 500,
        };

        let mut channel = L2capChannel::new_classic(0x0040, 0x1001, 0x1001, config);
        channel.remote_cid = 0x0050;
        channel.remote_config = config;
        channel.remote_config.rfc.tx_window_size = 4;
        channel.start_mode(2000, 12000, 1024);

        let ModeState::Erfc(engine) = channel.mode() else {
            panic!("expected ERTM engine");
        };
        assert_eq!(engine.params().tx_window, 4);
        assert_eq!(engine.params().rx_window, 8);
        assert_eq!(engine.params().retransmission_timeout, Duration::from_millis(2000));
        assert_eq!(engine.params().remote_mps, 500);
        assert!(engine.params().fcs);
    }

    #[test]
    fn test_fcs_needs_both_sides_to_opt_out() {
        let mut channel = L2capChannel::new_classic(0x0040, 0x1001, 0x1001, ChannelConfig::basic(672));
        channel.local_config.fcs = false;
        assert!(channel.uses_fcs());
        channel.remote_config.fcs = false;
        assert!(!channel.uses_fcs());
    }
}
