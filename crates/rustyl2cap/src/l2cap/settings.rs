//! Engine-wide settings

use std::time::Duration;

use super::constants::*;
use super::types::{ChannelConfig, LeChannelConfig, RetransmissionFlowControl, RetransmissionMode};

/// Settings shared by every connection and channel of one engine
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Largest signaling payload accepted or assembled
    pub signaling_mtu: u16,
    /// Response timeout for outbound signaling requests
    pub rtx: Duration,
    /// Extended response timeout after a "pending" result
    pub ertx: Duration,
    /// How long an idle link is kept after a clean close
    pub linger_timeout: Duration,
    /// Classic MTU proposed when no override is given
    pub default_mtu: u16,
    /// Smallest classic MTU accepted from a peer
    pub min_mtu: u16,
    /// ERTM transmit window
    pub tx_window_size: u8,
    /// ERTM transmissions of one frame before the channel is dropped
    pub max_transmit: u8,
    /// ERTM retransmission timeout (ms)
    pub retransmission_timeout: u16,
    /// ERTM monitor timeout (ms)
    pub monitor_timeout: u16,
    /// ERTM max PDU payload size
    pub mps: u16,
    /// Local receive buffer; bounds the MPS offered to peers
    pub rx_buffer_size: u16,
    /// Local transmit buffer; bounds the MPS used towards peers
    pub tx_buffer_size: u16,
    /// LE channel defaults
    pub le_mtu: u16,
    pub le_mps: u16,
    pub le_initial_credits: u16,
    /// Depth of the runtime command queue
    pub queue_depth: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            signaling_mtu: L2CAP_DEFAULT_MTU,
            rtx: Duration::from_secs(60),
            ertx: Duration::from_secs(300),
            linger_timeout: Duration::from_secs(2),
            default_mtu: L2CAP_DEFAULT_MTU,
            min_mtu: L2CAP_MIN_MTU,
            tx_window_size: 10,
            max_transmit: 3,
            retransmission_timeout: 2000,
            monitor_timeout: 12000,
            mps: 1010,
            rx_buffer_size: 1024,
            tx_buffer_size: 1024,
            le_mtu: 512,
            le_mps: 247,
            le_initial_credits: 8,
            queue_depth: 64,
        }
    }
}

impl EngineSettings {
    /// Basic-mode configuration with the default MTU
    pub fn default_channel_config(&self) -> ChannelConfig {
        ChannelConfig::basic(self.default_mtu)
    }

    /// Configuration for the given mode using the engine's ERTM defaults
    pub fn channel_config(&self, mode: RetransmissionMode) -> ChannelConfig {
        let mut config = self.default_channel_config();
        if mode != RetransmissionMode::Basic {
            config.rfc = RetransmissionFlowControl {
                mode,
                tx_window_size: self.tx_window_size,
                max_transmit: self.max_transmit,
                retransmission_timeout: self.retransmission_timeout,
                monitor_timeout: self.monitor_timeout,
                mps: self.mps.min(self.rx_buffer_size),
            };
        }
        config
    }

    pub fn default_le_config(&self) -> LeChannelConfig {
        LeChannelConfig {
            mtu: self.le_mtu,
            mps: self.le_mps.min(self.rx_buffer_size),
            initial_credits: self.le_initial_credits,
        }
    }
}
