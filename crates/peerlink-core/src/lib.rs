//! PeerLink Core - Shared types, protocol, and framing
//!
//! This crate provides the building blocks for serverless LAN peer
//! discovery, messaging, file transfer, and group membership.

pub mod chunk;
pub mod error;
pub mod proto;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use proto::{ControlMessage, ErrorStatus, InvitationReply, TransferReply};
pub use transport::{Connector, TransportConfig};
pub use types::*;

/// Default file body chunk size: 8 KiB
pub const CHUNK_SIZE: usize = 8 * 1024;

/// First service port tried when no configuration overrides it
pub const DEFAULT_BASE_PORT: u16 = 12345;

/// Number of consecutive service ports tried
pub const DEFAULT_PORT_RANGE: u16 = 25;

/// Passive discovery listener sits at the service port plus this offset
pub const DISCOVERY_PORT_OFFSET: u16 = 100;
