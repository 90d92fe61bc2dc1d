//! Per-link connection records

use std::collections::BTreeMap;

use super::channel::L2capChannel;
use super::constants::{L2CAP_MAX_IDENTIFIER, L2CAP_MIN_IDENTIFIER};
use super::types::{BdAddr, ConnectionState, ConnectionType, LeRole};

/// Progress of the information discovery on a BR/EDR link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InfoState {
    #[default]
    None,
    Processing,
    Done,
}

/// Signaling request we sent and still wait on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub identifier: u8,
    pub code: u8,
    /// Channel the request is about, if any
    pub lcid: Option<u16>,
}

/// One ACL link and the channels multiplexed over it
#[derive(Debug)]
pub struct Connection {
    pub(crate) handle: Option<u16>,
    pub(crate) address: BdAddr,
    pub(crate) kind: ConnectionType,
    pub(crate) role: LeRole,
    pub(crate) state: ConnectionState,
    next_identifier: u8,
    pub(crate) info_state: InfoState,
    pub(crate) extended_features: u32,
    pub(crate) fixed_channels: u64,
    pub(crate) channels: BTreeMap<u16, L2capChannel>,
    pub(crate) pending: Vec<PendingRequest>,
    pub(crate) linger_armed: bool,
}

impl Connection {
    pub fn new(address: BdAddr, kind: ConnectionType) -> Self {
        Self {
            handle: None,
            address,
            kind,
            role: LeRole::Master,
            state: ConnectionState::Idle,
            next_identifier: L2CAP_MIN_IDENTIFIER,
            info_state: InfoState::None,
            extended_features: 0,
            fixed_channels: 0,
            channels: BTreeMap::new(),
            pending: Vec::new(),
            linger_armed: false,
        }
    }

    pub fn handle(&self) -> Option<u16> {
        self.handle
    }

    pub fn address(&self) -> BdAddr {
        self.address
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn role(&self) -> LeRole {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn info_state(&self) -> InfoState {
        self.info_state
    }

    pub fn extended_features(&self) -> u32 {
        self.extended_features
    }

    pub fn fixed_channels(&self) -> u64 {
        self.fixed_channels
    }

    pub fn is_le(&self) -> bool {
        self.kind == ConnectionType::LE
    }

    pub fn channel(&self, lcid: u16) -> Option<&L2capChannel> {
        self.channels.get(&lcid)
    }

    pub fn channel_mut(&mut self, lcid: u16) -> Option<&mut L2capChannel> {
        self.channels.get_mut(&lcid)
    }

    /// Local CID of the channel whose peer endpoint is `rcid`
    pub fn lcid_for_remote(&self, rcid: u16) -> Option<u16> {
        self.channels
            .values()
            .find(|c| c.remote_cid == rcid)
            .map(|c| c.local_cid)
    }

    pub fn channel_ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    pub fn pending(&self) -> &[PendingRequest] {
        &self.pending
    }

    /// Next signaling identifier, skipping 0 and any still awaiting a
    /// response
    pub fn next_identifier(&mut self) -> u8 {
        let span = (L2CAP_MAX_IDENTIFIER - L2CAP_MIN_IDENTIFIER) as usize + 1;
        for _ in 0..span {
            let candidate = self.next_identifier;
            self.next_identifier = if candidate == L2CAP_MAX_IDENTIFIER {
                L2CAP_MIN_IDENTIFIER
            } else {
                candidate + 1
            };
            if !self.pending.iter().any(|p| p.identifier == candidate) {
                return candidate;
            }
        }
        // Every identifier outstanding: reuse the oldest
        self.pending
            .first()
            .map(|p| p.identifier)
            .unwrap_or(L2CAP_MIN_IDENTIFIER)
    }

    pub fn add_pending(&mut self, request: PendingRequest) {
        self.pending.retain(|p| p.identifier != request.identifier);
        self.pending.push(request);
    }

    pub fn take_pending(&mut self, identifier: u8) -> Option<PendingRequest> {
        let index = self.pending.iter().position(|p| p.identifier == identifier)?;
        Some(self.pending.remove(index))
    }

    /// Remove all requests about `lcid`
    pub fn take_pending_for(&mut self, lcid: u16) -> Vec<PendingRequest> {
        let (taken, kept) = self.pending.drain(..).partition(|p| p.lcid == Some(lcid));
        self.pending = kept;
        taken
    }
}
