//! LE credit based flow control engine
//!
//! Each outbound PDU consumes one credit granted by the peer; PDUs wait in
//! a queue while no credit is left. Every PDU received consumes one of
//! the credits we granted and is answered with a fresh credit.

use log::{debug, trace, warn};
use std::collections::VecDeque;

use super::packet::L2capPacket;
use super::sar::{self, LeReassembler};
use super::types::{L2capError, L2capResult, LeChannelConfig};

/// Side effects requested by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditAction {
    /// Complete frame to hand to the link layer
    Transmit(Vec<u8>),
    /// Reassembled SDU for the service
    Deliver(Vec<u8>),
    /// Remote busy state changed
    RemoteBusy(bool),
    /// Send a flow control credit packet with this many credits
    GrantCredits(u16),
    /// Peer spent a credit it did not have
    Disconnect,
}

/// Credit control block of one LE channel
#[derive(Debug)]
pub struct CreditEngine {
    remote_cid: u16,
    local: LeChannelConfig,
    remote: LeChannelConfig,
    /// Credits we may still spend
    tx_credits: u16,
    /// Credits the peer may still spend
    rx_credits: u16,
    queue: VecDeque<Vec<u8>>,
    reassembler: LeReassembler,
    exhausted: bool,
    actions: Vec<CreditAction>,
}

impl CreditEngine {
    pub fn new(remote_cid: u16, local: LeChannelConfig, remote: LeChannelConfig) -> Self {
        Self {
            remote_cid,
            local,
            remote,
            tx_credits: remote.initial_credits,
            rx_credits: local.initial_credits,
            queue: VecDeque::new(),
            reassembler: LeReassembler::new(local.mtu as usize),
            exhausted: false,
            actions: Vec::new(),
        }
    }

    pub fn tx_credits(&self) -> u16 {
        self.tx_credits
    }

    pub fn rx_credits(&self) -> u16 {
        self.rx_credits
    }

    /// PDUs waiting for credit
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn local_config(&self) -> &LeChannelConfig {
        &self.local
    }

    pub fn remote_config(&self) -> &LeChannelConfig {
        &self.remote
    }

    /// Take the actions recorded since the last call
    pub fn take_actions(&mut self) -> Vec<CreditAction> {
        std::mem::take(&mut self.actions)
    }

    /// Segment and queue an SDU, sending as many PDUs as credits allow
    pub fn send_sdu(&mut self, sdu: &[u8]) -> L2capResult<()> {
        if sdu.len() > self.remote.mtu as usize {
            return Err(L2capError::MtuExceeded {
                size: sdu.len(),
                mtu: self.remote.mtu,
            });
        }

        let payloads = sar::segment_le(sdu, self.remote.mps as usize);
        debug!(
            "Queueing LE SDU of {} bytes as {} PDU(s) on CID 0x{:04X}",
            sdu.len(),
            payloads.len(),
            self.remote_cid
        );
        self.queue.extend(payloads);
        self.drain();
        Ok(())
    }

    fn drain(&mut self) {
        while self.tx_credits > 0 {
            let Some(payload) = self.queue.pop_front() else {
                break;
            };
            let bytes = L2capPacket::new(self.remote_cid, payload).to_bytes();
            trace!("LE TX CID 0x{:04X}: {}", self.remote_cid, hex::encode(&bytes));
            self.actions.push(CreditAction::Transmit(bytes));
            self.tx_credits -= 1;
        }

        if self.tx_credits == 0 && !self.exhausted {
            self.exhausted = true;
            self.actions.push(CreditAction::RemoteBusy(true));
        }
    }

    /// Add credits granted by the peer. Overflowing 16 bits is a protocol
    /// violation and leaves the counter untouched.
    pub fn add_credits(&mut self, credits: u16) -> L2capResult<()> {
        self.tx_credits = self.tx_credits.checked_add(credits).ok_or_else(|| {
            L2capError::ProtocolError(format!(
                "Credit overflow on CID 0x{:04X}: {} + {}",
                self.remote_cid, self.tx_credits, credits
            ))
        })?;

        if self.tx_credits > 0 && self.exhausted {
            self.exhausted = false;
            self.actions.push(CreditAction::RemoteBusy(false));
        }
        self.drain();
        Ok(())
    }

    /// Handle one received PDU payload
    pub fn receive(&mut self, payload: &[u8]) {
        let Some(left) = self.rx_credits.checked_sub(1) else {
            warn!("Peer sent a PDU on CID 0x{:04X} without credit", self.remote_cid);
            self.actions.push(CreditAction::Disconnect);
            return;
        };
        self.rx_credits = left;

        if payload.len() > self.local.mps as usize {
            warn!(
                "PDU of {} bytes exceeds MPS {} on CID 0x{:04X}",
                payload.len(),
                self.local.mps,
                self.remote_cid
            );
        } else if let Some(sdu) = self.reassembler.push(payload) {
            self.actions.push(CreditAction::Deliver(sdu));
        }

        self.rx_credits = self.rx_credits.saturating_add(1);
        self.actions.push(CreditAction::GrantCredits(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mtu: u16, mps: u16, credits: u16) -> LeChannelConfig {
        LeChannelConfig {
            mtu,
            mps,
            initial_credits: credits,
        }
    }

    fn transmitted(actions: &[CreditAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, CreditAction::Transmit(_)))
            .count()
    }

    #[test]
    fn test_never_sends_past_zero_credits() {
        let mut engine = CreditEngine::new(0x0041, config(512, 100, 8), config(512, 100, 8));

        engine.send_sdu(&[0u8; 250]).unwrap();
        assert_eq!(transmitted(&engine.take_actions()), 3);
        assert_eq!(engine.tx_credits(), 5);

        for _ in 0..8 {
            engine.send_sdu(&[1u8; 50]).unwrap();
        }
        let actions = engine.take_actions();
        assert_eq!(transmitted(&actions), 5);
        assert_eq!(engine.queued(), 3);
        assert_eq!(
            actions
                .iter()
                .filter(|a| **a == CreditAction::RemoteBusy(true))
                .count(),
            1
        );

        engine.add_credits(2).unwrap();
        let actions = engine.take_actions();
        assert_eq!(actions.len(), 4);
        assert_eq!(actions[0], CreditAction::RemoteBusy(false));
        assert_eq!(transmitted(&actions), 2);
        assert_eq!(actions[3], CreditAction::RemoteBusy(true));
        assert_eq!(engine.queued(), 1);
    }

    #[test]
    fn test_credit_overflow_is_an_error() {
        let mut engine = CreditEngine::new(0x0041, config(512, 100, 8), config(512, 100, 0xFFF0));
        assert!(engine.add_credits(0x0F).is_ok());
        assert!(matches!(engine.add_credits(1), Err(L2capError::ProtocolError(_))));
        assert_eq!(engine.tx_credits(), 0xFFFF);
    }

    #[test]
    fn test_sdu_above_remote_mtu() {
        let mut engine = CreditEngine::new(0x0041, config(512, 100, 8), config(100, 100, 8));
        assert!(matches!(
            engine.send_sdu(&[0u8; 101]),
            Err(L2capError::MtuExceeded { size: 101, mtu: 100 })
        ));
        assert_eq!(engine.tx_credits(), 8);
    }

    #[test]
    fn test_receive_returns_one_credit() {
        let mut engine = CreditEngine::new(0x0041, config(512, 100, 8), config(512, 100, 8));
        engine.receive(&[3, 0, 1, 2, 3]);
        assert_eq!(
            engine.take_actions(),
            vec![
                CreditAction::Deliver(vec![1, 2, 3]),
                CreditAction::GrantCredits(1)
            ]
        );
        assert_eq!(engine.rx_credits(), 8);
    }

    #[test]
    fn test_receive_without_credit_disconnects() {
        let mut engine = CreditEngine::new(0x0041, config(512, 100, 0), config(512, 100, 8));
        engine.receive(&[3, 0, 1, 2, 3]);
        assert_eq!(engine.take_actions(), vec![CreditAction::Disconnect]);
        assert_eq!(engine.rx_credits(), 0);
    }
}
