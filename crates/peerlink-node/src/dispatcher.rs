//! Inbound message dispatch

use crate::events::{emit, NodeEvent};
use crate::state::{ChatEntry, NodeState};
use peerlink_core::{ControlMessage, ErrorStatus, InvitationReply, Peer};
use peerlink_discovery::{observed_address, UpsertOutcome};
use std::net::SocketAddr;
use std::sync::Arc;

/// What the server should do after dispatching a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Write this response and close
    Reply(ControlMessage),
    /// Hand the connection to the transfer receive path
    Transfer {
        request_id: String,
        sender: String,
        file_name: String,
        file_size: u64,
    },
}

/// Applies one inbound control message to node state
pub struct MessageDispatcher {
    state: Arc<NodeState>,
}

impl MessageDispatcher {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }

    /// Handle a decoded message received from `source`
    pub async fn dispatch(&self, msg: ControlMessage, source: SocketAddr) -> Dispatch {
        let kind = msg.kind();
        tracing::debug!("Dispatching {} from {}", kind, source);
        let state = &self.state;

        let response = match msg {
            ControlMessage::Discover { username, ip, port } => {
                if username != state.username {
                    let ip = observed_address(source.ip(), ip.as_deref());
                    let peer = Peer::new(&username, ip, port);
                    if state.registry.upsert(peer.clone()).await == UpsertOutcome::Inserted {
                        emit(&state.events, NodeEvent::PeerDiscovered(peer));
                    }
                }
                ControlMessage::DiscoverResponse {
                    username: state.username.clone(),
                    port: state.service_port,
                }
            }

            ControlMessage::Ping { username, .. } => {
                state.registry.touch(&username).await;
                ControlMessage::Pong {
                    username: state.username.clone(),
                }
            }

            ControlMessage::ChatMessage {
                sender,
                message,
                timestamp,
            } => {
                tracing::info!("Message from {}", sender);
                state.registry.mark_online(&sender).await;
                state.messages.lock().await.push(ChatEntry {
                    peer: sender.clone(),
                    message: message.clone(),
                    timestamp,
                    incoming: true,
                });
                emit(
                    &state.events,
                    NodeEvent::ChatReceived {
                        sender,
                        message,
                        timestamp,
                    },
                );
                ControlMessage::ChatAck
            }

            ControlMessage::FileSendRequest {
                request_id,
                sender,
                file_name,
                file_size,
                ..
            } => {
                if request_id.is_empty() {
                    return Dispatch::Reply(ControlMessage::error(
                        ErrorStatus::MalformedMessage,
                        "empty request_id",
                    ));
                }
                if state
                    .transfers
                    .register_inbound(&request_id, &sender, &file_name, file_size)
                    .await
                {
                    tracing::info!(
                        "{} wants to send {} ({} bytes)",
                        sender,
                        file_name,
                        file_size
                    );
                    emit(
                        &state.events,
                        NodeEvent::FileRequested {
                            request_id,
                            sender,
                            file_name,
                            file_size,
                        },
                    );
                }
                ControlMessage::NotificationSent
            }

            ControlMessage::FileSendResponse {
                request_id,
                sender,
                accepted,
            } => {
                let addr = match state.transfers.outbound_peer(&request_id).await {
                    Some(peer) => state.resolve(&peer).await.ok(),
                    None => None,
                };
                state
                    .transfers
                    .handle_response(&request_id, &sender, accepted, addr)
                    .await;
                ControlMessage::Ack
            }

            ControlMessage::FileTransferStart {
                request_id,
                sender,
                file_name,
                file_size,
            } => {
                return Dispatch::Transfer {
                    request_id,
                    sender,
                    file_name,
                    file_size,
                }
            }

            ControlMessage::DirectoryShare {
                group_name,
                directory,
                sharer,
            } => {
                let recorded = state
                    .groups
                    .lock()
                    .await
                    .handle_directory_share(&group_name, &directory, &sharer);
                match recorded {
                    Ok(true) => {
                        emit(
                            &state.events,
                            NodeEvent::DirectoryShared {
                                group: group_name,
                                sharer,
                                directory,
                            },
                        );
                        ControlMessage::DirectoryAck
                    }
                    Ok(false) => ControlMessage::DirectoryAck,
                    Err(e) => rejected(e),
                }
            }

            ControlMessage::GroupInvitation {
                group_name,
                inviter,
                members,
            } => {
                let invitation = state
                    .groups
                    .lock()
                    .await
                    .receive_invitation(&group_name, &inviter, members);
                if let Some(invitation) = invitation {
                    emit(&state.events, NodeEvent::InvitationReceived(invitation));
                }
                ControlMessage::Ack
            }

            ControlMessage::GroupInvitationResponse {
                group_name,
                sender,
                response,
            } => {
                let outcome = state
                    .groups
                    .lock()
                    .await
                    .handle_invitation_response(&group_name, &sender, response);
                match outcome {
                    Ok(broadcast) => {
                        emit(
                            &state.events,
                            NodeEvent::InvitationAnswered {
                                group: group_name.clone(),
                                member: sender.clone(),
                                reply: response,
                            },
                        );
                        if response == InvitationReply::Accept {
                            let members = match broadcast.first().map(|o| &o.message) {
                                Some(ControlMessage::GroupMemberJoined {
                                    updated_members, ..
                                }) => updated_members.clone(),
                                _ => Vec::new(),
                            };
                            emit(
                                &state.events,
                                NodeEvent::MemberJoined {
                                    group: group_name,
                                    member: sender,
                                    members,
                                },
                            );
                        }
                        state.deliver(broadcast);
                        ControlMessage::Ack
                    }
                    Err(e) => rejected(e),
                }
            }

            ControlMessage::GroupMemberJoined {
                group_name,
                new_member,
                updated_members,
            } => {
                let outcome = state.groups.lock().await.handle_member_joined(
                    &group_name,
                    &new_member,
                    updated_members.clone(),
                );
                match outcome {
                    Ok(()) => {
                        emit(
                            &state.events,
                            NodeEvent::MemberJoined {
                                group: group_name,
                                member: new_member,
                                members: updated_members,
                            },
                        );
                        ControlMessage::GroupAck
                    }
                    Err(e) => rejected(e),
                }
            }

            ControlMessage::StatusUpdate { username, online } => {
                let known = if online {
                    state.registry.mark_online(&username).await
                } else {
                    state.registry.mark_offline(&username).await
                };
                if known {
                    tracing::info!(
                        "{} is now {}",
                        username,
                        if online { "online" } else { "offline" }
                    );
                    emit(&state.events, NodeEvent::PeerStatus { username, online });
                }
                ControlMessage::Ack
            }

            ControlMessage::DiscoverResponse { .. }
            | ControlMessage::Pong { .. }
            | ControlMessage::ChatAck
            | ControlMessage::NotificationSent
            | ControlMessage::Ack
            | ControlMessage::DirectoryAck
            | ControlMessage::GroupAck
            | ControlMessage::Error { .. } => {
                tracing::warn!("Unexpected {} from {}", kind, source);
                ControlMessage::error(
                    ErrorStatus::UnexpectedMessage,
                    "response type sent as a request",
                )
            }

            ControlMessage::Unknown => {
                tracing::warn!("Unknown message type from {}", source);
                ControlMessage::error(ErrorStatus::UnknownMessageType, "unknown message type")
            }
        };

        Dispatch::Reply(response)
    }
}

fn rejected(e: peerlink_core::Error) -> ControlMessage {
    tracing::warn!("Rejecting request: {}", e);
    ControlMessage::error(ErrorStatus::Rejected, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventReceiver};
    use crate::groups::GroupCoordinator;
    use crate::transfer::FileTransferEngine;
    use peerlink_core::Connector;
    use peerlink_discovery::PeerRegistry;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use tokio::sync::Mutex;

    fn dispatcher(dir: &TempDir) -> (MessageDispatcher, Arc<NodeState>, EventReceiver) {
        let (tx, rx) = events::channel();
        let transfers = FileTransferEngine::new(
            "alice",
            dir.path().to_path_buf(),
            8192,
            Connector::default(),
            tx.clone(),
        );
        let state = Arc::new(NodeState {
            username: "alice".into(),
            local_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            service_port: 12345,
            registry: Arc::new(PeerRegistry::new()),
            groups: Mutex::new(GroupCoordinator::new("alice")),
            transfers: Arc::new(transfers),
            messages: Mutex::new(Vec::new()),
            events: tx,
            connector: Connector::default(),
            dial_loopback: true,
        });
        (MessageDispatcher::new(state.clone()), state, rx)
    }

    fn lan_source(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, last)), 50000)
    }

    fn reply(dispatch: Dispatch) -> ControlMessage {
        match dispatch {
            Dispatch::Reply(msg) => msg,
            other => panic!("Expected a reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_type_is_reported_without_mutation() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, state, _rx) = dispatcher(&dir);

        let msg = ControlMessage::from_bytes(br#"{"type":"bogus"}"#).unwrap();
        let response = reply(dispatcher.dispatch(msg, lan_source(20)).await);
        assert!(matches!(
            response,
            ControlMessage::Error {
                status: ErrorStatus::UnknownMessageType,
                ..
            }
        ));
        assert!(state.registry.is_empty().await);
        assert!(state.messages.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_response_types_are_unexpected() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _state, _rx) = dispatcher(&dir);
        for msg in [ControlMessage::Ack, ControlMessage::ChatAck, ControlMessage::GroupAck] {
            let response = reply(dispatcher.dispatch(msg, lan_source(20)).await);
            assert!(matches!(
                response,
                ControlMessage::Error {
                    status: ErrorStatus::UnexpectedMessage,
                    ..
                }
            ));
        }
    }

    #[tokio::test]
    async fn test_discover_records_real_source_address() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, state, mut rx) = dispatcher(&dir);

        let msg = ControlMessage::Discover {
            username: "bob".into(),
            ip: Some("127.0.0.1".into()),
            port: 12346,
        };
        let response = reply(dispatcher.dispatch(msg, lan_source(20)).await);
        assert_eq!(
            response,
            ControlMessage::DiscoverResponse {
                username: "alice".into(),
                port: 12345
            }
        );

        let bob = state.registry.get("bob").await.unwrap();
        assert_eq!(bob.ip, lan_source(20).ip());
        assert_eq!(bob.port, 12346);
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::PeerDiscovered(_)));
    }

    #[tokio::test]
    async fn test_chat_is_logged_and_announced() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, state, mut rx) = dispatcher(&dir);

        let msg = ControlMessage::ChatMessage {
            sender: "bob".into(),
            message: "hi".into(),
            timestamp: 42,
        };
        assert_eq!(
            reply(dispatcher.dispatch(msg, lan_source(20)).await),
            ControlMessage::ChatAck
        );
        assert_eq!(state.messages.lock().await.len(), 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            NodeEvent::ChatReceived {
                sender: "bob".into(),
                message: "hi".into(),
                timestamp: 42
            }
        );
    }

    #[tokio::test]
    async fn test_file_request_registers_offer_once() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, state, mut rx) = dispatcher(&dir);

        let msg = ControlMessage::FileSendRequest {
            request_id: "r1".into(),
            sender: "bob".into(),
            file_name: "a.txt".into(),
            file_size: 3,
            timestamp: 0,
        };
        for _ in 0..2 {
            assert_eq!(
                reply(dispatcher.dispatch(msg.clone(), lan_source(20)).await),
                ControlMessage::NotificationSent
            );
        }
        assert_eq!(state.transfers.inbound_requests().await.len(), 1);
        assert!(matches!(rx.recv().await.unwrap(), NodeEvent::FileRequested { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transfer_header_hands_off_connection() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _state, _rx) = dispatcher(&dir);
        let msg = ControlMessage::FileTransferStart {
            request_id: "r1".into(),
            sender: "bob".into(),
            file_name: "a.txt".into(),
            file_size: 3,
        };
        assert!(matches!(
            dispatcher.dispatch(msg, lan_source(20)).await,
            Dispatch::Transfer { .. }
        ));
    }

    #[tokio::test]
    async fn test_status_update_marks_known_peer() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, state, _rx) = dispatcher(&dir);
        state
            .registry
            .upsert(Peer::new("bob", lan_source(20).ip(), 12346))
            .await;

        let msg = ControlMessage::StatusUpdate {
            username: "bob".into(),
            online: false,
        };
        assert_eq!(
            reply(dispatcher.dispatch(msg, lan_source(20)).await),
            ControlMessage::Ack
        );
        assert!(!state.registry.get("bob").await.unwrap().online);
    }

    #[tokio::test]
    async fn test_group_messages_for_unknown_group_are_rejected() {
        let dir = TempDir::new().unwrap();
        let (dispatcher, _state, _rx) = dispatcher(&dir);
        let msg = ControlMessage::DirectoryShare {
            group_name: "ghost".into(),
            directory: "/tmp".into(),
            sharer: "bob".into(),
        };
        assert!(matches!(
            reply(dispatcher.dispatch(msg, lan_source(20)).await),
            ControlMessage::Error {
                status: ErrorStatus::Rejected,
                ..
            }
        ));
    }
}
