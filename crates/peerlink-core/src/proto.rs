//! Control message definitions
//!
//! Every control message is a flat JSON object whose `type` field selects the
//! variant. Requests and their responses share one closed enum so the
//! dispatcher can match exhaustively; unrecognised type strings decode to
//! [`ControlMessage::Unknown`] instead of failing.

use crate::Result;
use serde::{Deserialize, Serialize};

/// All control messages exchanged over short-lived TCP sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Discovery probe carrying the prober's identity and service port
    Discover {
        username: String,
        /// Address the prober believes it has; informational only
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        port: u16,
    },
    #[serde(alias = "discovery_response")]
    DiscoverResponse { username: String, port: u16 },

    Ping {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Pong { username: String },

    ChatMessage {
        sender: String,
        message: String,
        #[serde(default)]
        timestamp: u64,
    },
    ChatAck,

    FileSendRequest {
        request_id: String,
        sender: String,
        file_name: String,
        file_size: u64,
        #[serde(default)]
        timestamp: u64,
    },
    NotificationSent,

    FileSendResponse {
        request_id: String,
        sender: String,
        accepted: bool,
    },
    Ack,

    /// Transfer header; answered with a [`TransferReply`] rather than a control message
    FileTransferStart {
        request_id: String,
        sender: String,
        file_name: String,
        file_size: u64,
    },

    DirectoryShare {
        group_name: String,
        directory: String,
        sharer: String,
    },
    DirectoryAck,

    #[serde(alias = "group_invite")]
    GroupInvitation {
        group_name: String,
        inviter: String,
        #[serde(default)]
        members: Vec<String>,
    },
    GroupInvitationResponse {
        group_name: String,
        sender: String,
        response: InvitationReply,
    },
    GroupMemberJoined {
        group_name: String,
        new_member: String,
        updated_members: Vec<String>,
    },
    GroupAck,

    StatusUpdate { username: String, online: bool },

    Error {
        status: ErrorStatus,
        #[serde(default)]
        message: String,
    },

    /// Any `type` value this build does not know
    #[serde(other)]
    Unknown,
}

/// Decision carried by `group_invitation_response`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationReply {
    Accept,
    Decline,
}

/// Machine-readable reason attached to an `error` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    UnknownMessageType,
    MalformedMessage,
    /// A response type arrived where a request was expected
    UnexpectedMessage,
    Rejected,
    Failed,
}

/// Phase replies of the file transfer protocol, keyed by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferReply {
    Ready,
    Received {
        #[serde(default)]
        bytes: u64,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl ControlMessage {
    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Discover { .. } => "discover",
            ControlMessage::DiscoverResponse { .. } => "discover_response",
            ControlMessage::Ping { .. } => "ping",
            ControlMessage::Pong { .. } => "pong",
            ControlMessage::ChatMessage { .. } => "chat_message",
            ControlMessage::ChatAck => "chat_ack",
            ControlMessage::FileSendRequest { .. } => "file_send_request",
            ControlMessage::NotificationSent => "notification_sent",
            ControlMessage::FileSendResponse { .. } => "file_send_response",
            ControlMessage::Ack => "ack",
            ControlMessage::FileTransferStart { .. } => "file_transfer_start",
            ControlMessage::DirectoryShare { .. } => "directory_share",
            ControlMessage::DirectoryAck => "directory_ack",
            ControlMessage::GroupInvitation { .. } => "group_invitation",
            ControlMessage::GroupInvitationResponse { .. } => "group_invitation_response",
            ControlMessage::GroupMemberJoined { .. } => "group_member_joined",
            ControlMessage::GroupAck => "group_ack",
            ControlMessage::StatusUpdate { .. } => "status_update",
            ControlMessage::Error { .. } => "error",
            ControlMessage::Unknown => "unknown",
        }
    }

    /// Encode as a JSON object
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from a JSON object; a missing or non-string `type` is an error
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }

    pub fn error(status: ErrorStatus, message: impl Into<String>) -> Self {
        ControlMessage::Error {
            status,
            message: message.into(),
        }
    }
}

impl TransferReply {
    pub fn error(message: impl Into<String>) -> Self {
        TransferReply::Error {
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(buf)?)
    }
}
