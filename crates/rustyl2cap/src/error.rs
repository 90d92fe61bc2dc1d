//! Error types for the rustyl2cap library
//!
//! This module defines the errors reported by the link-layer collaborator.

use thiserror::Error;

/// Errors that can occur when the link layer moves bytes or manages links
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("No link with handle 0x{0:04X}")]
    UnknownHandle(u16),

    #[error("Link is not connected")]
    NotConnected,

    #[error("Failed to send ACL data: {0}")]
    SendError(String),

    #[error("Link I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported operation")]
    Unsupported,
}
