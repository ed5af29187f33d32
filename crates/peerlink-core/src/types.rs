//! Core data types for PeerLink

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// A remote process participating in the protocol, keyed by display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Unique display name
    pub username: String,
    /// Address the peer's service is reachable at
    pub ip: IpAddr,
    /// Service (control message) port
    pub port: u16,
    /// Cleared after a failed liveness probe or an offline announcement
    pub online: bool,
    /// Unix timestamp of the last successful contact
    pub last_seen: u64,
    /// Port of the peer's passive discovery listener, when known
    pub discovery_port: Option<u16>,
}

impl Peer {
    pub fn new(username: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            username: username.into(),
            ip,
            port,
            online: true,
            last_seen: unix_now(),
            discovery_port: None,
        }
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }

    /// Socket address of the peer's service port
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// A named, replicated set of members sharing directory announcements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    /// Ordered, duplicate-free member names
    pub members: Vec<String>,
    /// Member name -> directories that member has shared with the group
    pub shared_dirs: BTreeMap<String, Vec<String>>,
}

impl Group {
    /// Create a group whose only member is its creator
    pub fn new(name: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: vec![creator.into()],
            shared_dirs: BTreeMap::new(),
        }
    }

    /// Create a group from a member snapshot, dropping duplicates
    pub fn with_members(name: impl Into<String>, members: Vec<String>) -> Self {
        let mut group = Self {
            name: name.into(),
            members: Vec::new(),
            shared_dirs: BTreeMap::new(),
        };
        group.replace_members(members);
        group
    }

    pub fn has_member(&self, member: &str) -> bool {
        self.members.iter().any(|m| m == member)
    }

    /// Returns true if the member was not already present
    pub fn add_member(&mut self, member: impl Into<String>) -> bool {
        let member = member.into();
        if self.has_member(&member) {
            return false;
        }
        self.members.push(member);
        true
    }

    /// Replace the member list, keeping first occurrences only
    pub fn replace_members(&mut self, members: Vec<String>) {
        self.members.clear();
        for member in members {
            self.add_member(member);
        }
    }

    /// Record a directory under a sharer; returns false if it was already recorded
    pub fn add_shared_dir(&mut self, sharer: &str, directory: &str) -> bool {
        let dirs = self.shared_dirs.entry(sharer.to_string()).or_default();
        if dirs.iter().any(|d| d == directory) {
            return false;
        }
        dirs.push(directory.to_string());
        true
    }
}

/// Invitation lifecycle; Accepted and Declined are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvitationState {
    Pending,
    Accepted,
    Declined,
}

/// A proposed membership change awaiting a decision from `recipient`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invitation {
    pub group: String,
    pub inviter: String,
    pub recipient: String,
    /// Member list as the inviter knew it when sending
    pub members: Vec<String>,
    pub state: InvitationState,
    pub created_at: u64,
}

impl Invitation {
    pub fn new(
        group: impl Into<String>,
        inviter: impl Into<String>,
        recipient: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Self {
            group: group.into(),
            inviter: inviter.into(),
            recipient: recipient.into(),
            members,
            state: InvitationState::Pending,
            created_at: unix_now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == InvitationState::Pending
    }
}

/// State of one file transfer, sender or receiver side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransferSession {
    pub request_id: String,
    pub sender: String,
    pub receiver: String,
    pub file_name: String,
    /// Size declared in the transfer header
    pub file_size: u64,
    /// Source path on the sender, destination path on the receiver
    pub path: PathBuf,
    pub bytes_transferred: u64,
}

impl FileTransferSession {
    pub fn is_complete(&self) -> bool {
        self.bytes_transferred == self.file_size
    }

    pub fn progress(&self) -> f64 {
        if self.file_size == 0 {
            return 100.0;
        }
        (self.bytes_transferred as f64 / self.file_size as f64) * 100.0
    }
}

/// Current unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Derive an opaque, practically unique transfer request id. If the OS
/// has no randomness the salt stays zero and the nanosecond timestamp
/// separates ids.
pub fn new_request_id(sender: &str, file_name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let mut salt = [0u8; 8];
    if let Err(e) = getrandom::getrandom(&mut salt) {
        tracing::debug!("No random salt for request id: {}", e);
    }

    let mut hasher = blake3::Hasher::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"_");
    hasher.update(file_name.as_bytes());
    hasher.update(b"_");
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&salt);
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

/// Human readable byte count, e.g. "3.0 KB"
pub fn format_file_size(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
