//! Error types for PeerLink

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Frame too large: {len} bytes (limit {limit})")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Unknown group: {0}")]
    UnknownGroup(String),

    #[error("Group already exists: {0}")]
    DuplicateGroup(String),

    #[error("Invitation already pending for {recipient} in group {group}")]
    DuplicateInvitation { group: String, recipient: String },

    #[error("{member} is already a member of {group}")]
    AlreadyMember { group: String, member: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rejected by peer: {0}")]
    Rejected(String),

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
