//! Connection and channel registry
//!
//! Owns every connection record. Local CIDs are unique across all links,
//! so a channel can be found from its CID alone.

use std::collections::BTreeMap;

use log::debug;

use super::channel::L2capChannel;
use super::connection::Connection;
use super::constants::*;
use super::psm::{DynamicPsmAllocator, PSM};
use super::types::{BdAddr, ConnectionType};

/// Stable key of a connection record
pub type ConnId = u32;

#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<ConnId, Connection>,
    next_conn: ConnId,
    next_cid: u16,
    next_le_cid: u16,
    psms: DynamicPsmAllocator,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            next_cid: L2CAP_DYNAMIC_CID_MIN,
            next_le_cid: L2CAP_LE_DYNAMIC_CID_MIN,
            ..Default::default()
        }
    }

    pub fn create_connection(&mut self, address: BdAddr, kind: ConnectionType) -> ConnId {
        let id = self.next_conn;
        self.next_conn = self.next_conn.wrapping_add(1);
        debug!("Creating {:?} connection record for {}", kind, address);
        self.connections.insert(id, Connection::new(address, kind));
        id
    }

    pub fn remove_connection(&mut self, id: ConnId) -> Option<Connection> {
        self.connections.remove(&id)
    }

    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = (ConnId, &Connection)> {
        self.connections.iter().map(|(id, c)| (*id, c))
    }

    pub fn find_by_handle(&self, handle: u16) -> Option<ConnId> {
        self.connections
            .iter()
            .find(|(_, c)| c.handle == Some(handle))
            .map(|(id, _)| *id)
    }

    pub fn find_by_address(&self, address: BdAddr, kind: ConnectionType) -> Option<ConnId> {
        self.connections
            .iter()
            .find(|(_, c)| c.address == address && c.kind == kind)
            .map(|(id, _)| *id)
    }

    /// Connection owning the channel with local CID `lcid`
    pub fn find_channel(&self, lcid: u16) -> Option<ConnId> {
        self.connections
            .iter()
            .find(|(_, c)| c.channels.contains_key(&lcid))
            .map(|(id, _)| *id)
    }

    pub fn channel(&self, lcid: u16) -> Option<&L2capChannel> {
        self.connections.values().find_map(|c| c.channel(lcid))
    }

    pub fn channel_mut(&mut self, lcid: u16) -> Option<&mut L2capChannel> {
        self.connections.values_mut().find_map(|c| c.channel_mut(lcid))
    }

    fn cid_in_use(&self, cid: u16) -> bool {
        self.connections.values().any(|c| c.channels.contains_key(&cid))
    }

    /// Allocate a local CID unused on every link
    pub fn allocate_cid(&mut self, kind: ConnectionType) -> Option<u16> {
        let (min, max, next) = match kind {
            ConnectionType::Classic => (L2CAP_DYNAMIC_CID_MIN, L2CAP_DYNAMIC_CID_MAX, self.next_cid),
            ConnectionType::LE => (L2CAP_LE_DYNAMIC_CID_MIN, L2CAP_LE_DYNAMIC_CID_MAX, self.next_le_cid),
        };

        let span = (max - min) as u32 + 1;
        let start = (next.clamp(min, max) - min) as u32;
        for offset in 0..span {
            let cid = min + ((start + offset) % span) as u16;
            if !self.cid_in_use(cid) {
                let following = if cid == max { min } else { cid + 1 };
                match kind {
                    ConnectionType::Classic => self.next_cid = following,
                    ConnectionType::LE => self.next_le_cid = following,
                }
                return Some(cid);
            }
        }
        None
    }

    /// Allocate a CID and insert `build(cid)` into connection `id`
    pub fn new_channel(
        &mut self,
        id: ConnId,
        build: impl FnOnce(u16) -> L2capChannel,
    ) -> Option<u16> {
        let kind = self.connections.get(&id)?.kind;
        let cid = self.allocate_cid(kind)?;
        let connection = self.connections.get_mut(&id)?;
        connection.channels.insert(cid, build(cid));
        Some(cid)
    }

    /// Allocate an unused dynamic PSM given the registered set
    pub fn allocate_psm(&mut self, le: bool, in_use: impl Fn(u16) -> bool) -> Option<PSM> {
        if le {
            self.psms.allocate_le(in_use)
        } else {
            self.psms.allocate(in_use)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2cap::types::LeChannelConfig;

    #[test]
    fn test_cids_unique_across_links() {
        let mut registry = Registry::new();
        let a = registry.create_connection(BdAddr::new([1; 6]), ConnectionType::Classic);
        let b = registry.create_connection(BdAddr::new([2; 6]), ConnectionType::Classic);

        let first = registry
            .new_channel(a, |cid| L2capChannel::new_classic(cid, 0x1001, 0x1001, Default::default()))
            .unwrap();
        let second = registry
            .new_channel(b, |cid| L2capChannel::new_classic(cid, 0x1001, 0x1001, Default::default()))
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.find_channel(first), Some(a));
        assert_eq!(registry.find_channel(second), Some(b));
    }

    #[test]
    fn test_le_cid_range_exhaustion() {
        let mut registry = Registry::new();
        let id = registry.create_connection(BdAddr::default(), ConnectionType::LE);
        let count = (L2CAP_LE_DYNAMIC_CID_MAX - L2CAP_LE_DYNAMIC_CID_MIN + 1) as usize;

        for _ in 0..count {
            let cid = registry
                .new_channel(id, |cid| L2capChannel::new_le(cid, 0x80, 0x80, LeChannelConfig::default()))
                .unwrap();
            assert!((L2CAP_LE_DYNAMIC_CID_MIN..=L2CAP_LE_DYNAMIC_CID_MAX).contains(&cid));
        }
        assert!(registry.allocate_cid(ConnectionType::LE).is_none());
    }

    #[test]
    fn test_find_by_handle_and_address() {
        let mut registry = Registry::new();
        let address = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let id = registry.create_connection(address, ConnectionType::LE);
        registry.connection_mut(id).unwrap().handle = Some(0x0040);

        assert_eq!(registry.find_by_handle(0x0040), Some(id));
        assert_eq!(registry.find_by_address(address, ConnectionType::LE), Some(id));
        assert_eq!(registry.find_by_address(address, ConnectionType::Classic), None);
    }
}
