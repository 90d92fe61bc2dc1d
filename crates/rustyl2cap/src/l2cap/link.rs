//! Collaborators the engine drives: the ACL link layer and the timer service

use std::time::Duration;

use crate::error::LinkError;

use super::types::{BdAddr, ConnectionType};

/// ACL link layer below L2CAP
///
/// Link events (up, down, received data) are fed back into the manager
/// through `link_up`, `link_down` and `receive`.
pub trait LinkLayer: Send {
    /// Start creating a link to `address`
    fn connect(&mut self, address: BdAddr, kind: ConnectionType) -> Result<(), LinkError>;

    /// Tear down the link with the given HCI reason
    fn disconnect(&mut self, handle: u16, reason: u8) -> Result<(), LinkError>;

    /// Send one complete L2CAP frame
    fn send(&mut self, handle: u16, flush_timeout: u16, data: &[u8]) -> Result<(), LinkError>;
}

/// Timers owned by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// RTX/ERTX of an outstanding signaling request
    Response { handle: u16, identifier: u8 },
    /// ERTM retransmission timer
    Retransmission { lcid: u16 },
    /// ERTM monitor timer
    Monitor { lcid: u16 },
    /// Idle link disconnect timer
    Linger { handle: u16 },
}

/// Single-shot timer service
///
/// Expiries are reported back through `L2capManager::handle_timeout`.
/// Scheduling an id that is already armed re-arms it.
pub trait TimerScheduler: Send {
    fn schedule(&mut self, id: TimerId, after: Duration);

    /// Cancelling an id that is not armed is a no-op
    fn cancel(&mut self, id: TimerId);
}
