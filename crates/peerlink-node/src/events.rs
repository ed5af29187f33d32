//! Notifications for the presentation layer

use peerlink_core::{Invitation, InvitationReply, Peer};
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Something a user interface may want to show
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    PeerDiscovered(Peer),
    ChatReceived {
        sender: String,
        message: String,
        timestamp: u64,
    },
    /// A peer asked to send us a file; answer with `respond_to_file_request`
    FileRequested {
        request_id: String,
        sender: String,
        file_name: String,
        file_size: u64,
    },
    FileRejected {
        request_id: String,
        peer: String,
    },
    FileSent {
        request_id: String,
        peer: String,
        bytes: u64,
    },
    FileReceived {
        sender: String,
        path: PathBuf,
        bytes: u64,
    },
    TransferFailed {
        request_id: String,
        peer: String,
        reason: String,
    },
    InvitationReceived(Invitation),
    /// An invitee answered one of our invitations
    InvitationAnswered {
        group: String,
        member: String,
        reply: InvitationReply,
    },
    MemberJoined {
        group: String,
        member: String,
        members: Vec<String>,
    },
    DirectoryShared {
        group: String,
        sharer: String,
        directory: String,
    },
    PeerStatus {
        username: String,
        online: bool,
    },
}

pub type EventSender = mpsc::UnboundedSender<NodeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<NodeEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Publish an event; a closed receiver only means nobody is listening
pub(crate) fn emit(events: &EventSender, event: NodeEvent) {
    if events.send(event).is_err() {
        tracing::trace!("Event dropped, no receiver");
    }
}
