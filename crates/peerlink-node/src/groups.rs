//! Group membership and invitations
//!
//! [`GroupCoordinator`] is a plain state machine: every operation mutates
//! local state and returns the messages that must be delivered to other
//! peers. The node performs the delivery.

use peerlink_core::{
    ControlMessage, Error, Group, Invitation, InvitationReply, InvitationState, Result,
};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// A message the node must deliver to `to`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: String,
    pub message: ControlMessage,
}

impl Outbound {
    fn new(to: impl Into<String>, message: ControlMessage) -> Self {
        Self {
            to: to.into(),
            message,
        }
    }
}

#[derive(Debug)]
pub struct GroupCoordinator {
    me: String,
    groups: BTreeMap<String, Group>,
    /// Invitations we sent that have not been answered
    pending: Vec<Invitation>,
    /// Invitations sent to us awaiting our decision
    received: Vec<Invitation>,
}

impl GroupCoordinator {
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            groups: BTreeMap::new(),
            pending: Vec::new(),
            received: Vec::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.me
    }

    /// Create a group with ourselves as the only member and invite `invitees`
    pub fn create_group(&mut self, name: &str, invitees: &[String]) -> Result<Vec<Outbound>> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("group name is empty".into()));
        }
        if self.groups.contains_key(name) {
            return Err(Error::DuplicateGroup(name.to_string()));
        }

        let mut recipients: Vec<&String> = Vec::new();
        for invitee in invitees {
            if *invitee != self.me && !recipients.contains(&invitee) {
                recipients.push(invitee);
            }
        }
        if recipients.is_empty() {
            return Err(Error::InvalidInput("a group needs at least one invitee".into()));
        }

        let group = Group::new(name, self.me.clone());
        let outbound = recipients
            .into_iter()
            .map(|recipient| self.track_invitation(&group, recipient))
            .collect();
        info!("Created group {}", name);
        self.groups.insert(name.to_string(), group);
        Ok(outbound)
    }

    /// Invite one more peer to a group we belong to
    pub fn invite(&mut self, group_name: &str, recipient: &str) -> Result<Outbound> {
        let group = self
            .groups
            .get(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;
        if group.has_member(recipient) {
            return Err(Error::AlreadyMember {
                group: group_name.to_string(),
                member: recipient.to_string(),
            });
        }
        if self.pending_for(group_name, recipient).is_some() {
            return Err(Error::DuplicateInvitation {
                group: group_name.to_string(),
                recipient: recipient.to_string(),
            });
        }
        let group = group.clone();
        Ok(self.track_invitation(&group, recipient))
    }

    fn track_invitation(&mut self, group: &Group, recipient: &str) -> Outbound {
        self.pending.push(Invitation::new(
            &group.name,
            &self.me,
            recipient,
            group.members.clone(),
        ));
        Outbound::new(
            recipient,
            ControlMessage::GroupInvitation {
                group_name: group.name.clone(),
                inviter: self.me.clone(),
                members: group.members.clone(),
            },
        )
    }

    fn pending_for(&self, group: &str, recipient: &str) -> Option<usize> {
        self.pending
            .iter()
            .position(|i| i.group == group && i.recipient == recipient)
    }

    /// Store an incoming invitation. Returns `None` for a duplicate of one
    /// already held (same group and inviter).
    pub fn receive_invitation(
        &mut self,
        group_name: &str,
        inviter: &str,
        members: Vec<String>,
    ) -> Option<Invitation> {
        if self
            .received
            .iter()
            .any(|i| i.group == group_name && i.inviter == inviter)
        {
            debug!("Duplicate invitation to {} from {}", group_name, inviter);
            return None;
        }
        let invitation = Invitation::new(group_name, inviter, &self.me, members);
        info!("Invited to {} by {}", group_name, inviter);
        self.received.push(invitation.clone());
        Some(invitation)
    }

    /// Join the group locally and produce the acceptance for the inviter.
    ///
    /// A group of the same name that we already hold, and that the
    /// invitation does not list us in, is a different group: the call fails
    /// with [`Error::DuplicateGroup`] and the invitation stays open.
    pub fn accept_invitation(&mut self, group_name: &str) -> Result<Outbound> {
        let index = self.received_index(group_name)?;
        if self.groups.contains_key(group_name) && !self.received[index].members.contains(&self.me)
        {
            return Err(Error::DuplicateGroup(group_name.to_string()));
        }
        let mut invitation = self.received.remove(index);
        invitation.state = InvitationState::Accepted;

        let group = self
            .groups
            .entry(group_name.to_string())
            .or_insert_with(|| Group::with_members(group_name, Vec::new()));
        for member in invitation.members.iter().chain(std::iter::once(&self.me)) {
            group.add_member(member.clone());
        }
        info!("Joined group {}", group_name);

        Ok(self.answer(&invitation, InvitationReply::Accept))
    }

    /// Drop the invitation and produce the refusal for the inviter
    pub fn decline_invitation(&mut self, group_name: &str) -> Result<Outbound> {
        let mut invitation = self.take_received(group_name)?;
        invitation.state = InvitationState::Declined;
        info!("Declined invitation to {}", group_name);
        Ok(self.answer(&invitation, InvitationReply::Decline))
    }

    fn received_index(&self, group_name: &str) -> Result<usize> {
        self.received
            .iter()
            .position(|i| i.group == group_name)
            .ok_or_else(|| Error::NotFound(format!("invitation to {}", group_name)))
    }

    fn take_received(&mut self, group_name: &str) -> Result<Invitation> {
        let index = self.received_index(group_name)?;
        Ok(self.received.remove(index))
    }

    /// Put back an invitation whose answer never reached the inviter.
    /// `leave_group` drops the group the accept created.
    pub fn restore_invitation(&mut self, invitation: Invitation, leave_group: bool) {
        if leave_group {
            self.groups.remove(&invitation.group);
        }
        let held = self
            .received
            .iter()
            .any(|i| i.group == invitation.group && i.inviter == invitation.inviter);
        if !held {
            info!("Invitation to {} is open again", invitation.group);
            self.received.push(invitation);
        }
    }

    fn answer(&self, invitation: &Invitation, response: InvitationReply) -> Outbound {
        Outbound::new(
            &invitation.inviter,
            ControlMessage::GroupInvitationResponse {
                group_name: invitation.group.clone(),
                sender: self.me.clone(),
                response,
            },
        )
    }

    /// Handle an invitee's decision on one of our invitations.
    ///
    /// On accept the member is added and the new member list is broadcast
    /// to every other member, the newcomer included.
    pub fn handle_invitation_response(
        &mut self,
        group_name: &str,
        sender: &str,
        response: InvitationReply,
    ) -> Result<Vec<Outbound>> {
        let group = self
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;

        match self
            .pending
            .iter()
            .position(|i| i.group == group_name && i.recipient == sender)
        {
            Some(index) => {
                self.pending.remove(index);
            }
            None => warn!("{} answered {} without a pending invitation", sender, group_name),
        }

        if response == InvitationReply::Decline {
            info!("{} declined {}", sender, group_name);
            return Ok(Vec::new());
        }

        group.add_member(sender);
        info!("{} joined {}", sender, group_name);
        let updated_members = group.members.clone();
        Ok(updated_members
            .iter()
            .filter(|m| **m != self.me)
            .map(|member| {
                Outbound::new(
                    member.clone(),
                    ControlMessage::GroupMemberJoined {
                        group_name: group_name.to_string(),
                        new_member: sender.to_string(),
                        updated_members: updated_members.clone(),
                    },
                )
            })
            .collect())
    }

    /// Adopt a broadcast member list
    pub fn handle_member_joined(
        &mut self,
        group_name: &str,
        new_member: &str,
        updated_members: Vec<String>,
    ) -> Result<()> {
        if let Some(group) = self.groups.get_mut(group_name) {
            group.replace_members(updated_members);
        } else if updated_members.contains(&self.me) {
            self.groups.insert(
                group_name.to_string(),
                Group::with_members(group_name, updated_members),
            );
        } else {
            return Err(Error::UnknownGroup(group_name.to_string()));
        }
        debug!("{} joined {}, member list replaced", new_member, group_name);
        Ok(())
    }

    /// Record our own directory under the group and announce it to
    /// `recipients` (every other member when empty)
    pub fn share_directory(
        &mut self,
        group_name: &str,
        directory: &str,
        recipients: &[String],
    ) -> Result<Vec<Outbound>> {
        let group = self
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;

        let targets: Vec<String> = if recipients.is_empty() {
            group.members.iter().filter(|m| **m != self.me).cloned().collect()
        } else {
            if let Some(stranger) = recipients.iter().find(|r| !group.has_member(r)) {
                return Err(Error::InvalidInput(format!(
                    "{} is not a member of {}",
                    stranger, group_name
                )));
            }
            recipients.iter().filter(|r| **r != self.me).cloned().collect()
        };

        if !group.add_shared_dir(&self.me, directory) {
            debug!("{} already shared with {}", directory, group_name);
        }

        Ok(targets
            .into_iter()
            .map(|to| {
                Outbound::new(
                    to,
                    ControlMessage::DirectoryShare {
                        group_name: group_name.to_string(),
                        directory: directory.to_string(),
                        sharer: self.me.clone(),
                    },
                )
            })
            .collect())
    }

    /// Record a directory another member shared; false if already known
    pub fn handle_directory_share(
        &mut self,
        group_name: &str,
        directory: &str,
        sharer: &str,
    ) -> Result<bool> {
        let group = self
            .groups
            .get_mut(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;
        Ok(group.add_shared_dir(sharer, directory))
    }

    pub fn groups(&self) -> Vec<Group> {
        self.groups.values().cloned().collect()
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn members(&self, group_name: &str) -> Result<Vec<String>> {
        self.groups
            .get(group_name)
            .map(|g| g.members.clone())
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))
    }

    /// Directories other members shared with the group
    pub fn shared_directories(&self, group_name: &str) -> Result<BTreeMap<String, Vec<String>>> {
        let group = self
            .groups
            .get(group_name)
            .ok_or_else(|| Error::UnknownGroup(group_name.to_string()))?;
        Ok(group
            .shared_dirs
            .iter()
            .filter(|(sharer, _)| **sharer != self.me)
            .map(|(sharer, dirs)| (sharer.clone(), dirs.clone()))
            .collect())
    }

    pub fn received_invitations(&self) -> &[Invitation] {
        &self.received
    }

    pub fn received_invitation(&self, group_name: &str) -> Option<&Invitation> {
        self.received.iter().find(|i| i.group == group_name)
    }

    /// Invitations we sent for `group_name` that are still unanswered
    pub fn pending(&self, group_name: &str) -> Vec<&Invitation> {
        self.pending.iter().filter(|i| i.group == group_name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Deliver outbound messages between in-memory coordinators until quiet
    fn deliver(peers: &mut HashMap<String, GroupCoordinator>, mut queue: Vec<Outbound>) {
        while let Some(out) = queue.pop() {
            let node = peers.get_mut(&out.to).unwrap();
            match out.message {
                ControlMessage::GroupInvitation {
                    group_name,
                    inviter,
                    members,
                } => {
                    node.receive_invitation(&group_name, &inviter, members);
                }
                ControlMessage::GroupInvitationResponse {
                    group_name,
                    sender,
                    response,
                } => {
                    queue.extend(
                        node.handle_invitation_response(&group_name, &sender, response)
                            .unwrap(),
                    );
                }
                ControlMessage::GroupMemberJoined {
                    group_name,
                    new_member,
                    updated_members,
                } => node
                    .handle_member_joined(&group_name, &new_member, updated_members)
                    .unwrap(),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_create_group_validation() {
        let mut alice = GroupCoordinator::new("alice");
        assert!(matches!(
            alice.create_group("  ", &names(&["bob"])),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            alice.create_group("team", &[]),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            alice.create_group("team", &names(&["alice"])),
            Err(Error::InvalidInput(_))
        ));
        assert!(alice.groups().is_empty());

        let out = alice.create_group("team", &names(&["bob", "bob", "carol"])).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(alice.members("team").unwrap(), names(&["alice"]));
        assert_eq!(alice.pending("team").len(), 2);

        assert!(matches!(
            alice.create_group("team", &names(&["dave"])),
            Err(Error::DuplicateGroup(_))
        ));
    }

    #[test]
    fn test_all_accepting_invitees_converge() {
        let mut peers: HashMap<String, GroupCoordinator> = ["alice", "bob", "carol", "dave"]
            .iter()
            .map(|n| (n.to_string(), GroupCoordinator::new(*n)))
            .collect();

        let invites = peers
            .get_mut("alice")
            .unwrap()
            .create_group("team", &names(&["bob", "carol", "dave"]))
            .unwrap();
        deliver(&mut peers, invites);

        for name in ["bob", "carol", "dave"] {
            let answer = peers.get_mut(name).unwrap().accept_invitation("team").unwrap();
            deliver(&mut peers, vec![answer]);
        }

        let mut expected = names(&["alice", "bob", "carol", "dave"]);
        expected.sort();
        for (name, node) in &peers {
            let mut members = node.members("team").unwrap();
            members.sort();
            assert_eq!(members, expected, "member list of {}", name);
        }
        assert!(peers["alice"].pending("team").is_empty());
    }

    #[test]
    fn test_decline_leaves_membership_alone() {
        let mut peers: HashMap<String, GroupCoordinator> = ["alice", "bob", "carol"]
            .iter()
            .map(|n| (n.to_string(), GroupCoordinator::new(*n)))
            .collect();
        let invites = peers
            .get_mut("alice")
            .unwrap()
            .create_group("team", &names(&["bob", "carol"]))
            .unwrap();
        deliver(&mut peers, invites);

        let answer = peers.get_mut("bob").unwrap().decline_invitation("team").unwrap();
        deliver(&mut peers, vec![answer]);

        let alice = &peers["alice"];
        assert_eq!(alice.members("team").unwrap(), names(&["alice"]));
        let pending: Vec<&str> = alice.pending("team").iter().map(|i| i.recipient.as_str()).collect();
        assert_eq!(pending, vec!["carol"]);
        assert!(peers["bob"].received_invitations().is_empty());
        assert!(peers["bob"].group("team").is_none());
    }

    #[test]
    fn test_duplicate_invitations_rejected() {
        let mut alice = GroupCoordinator::new("alice");
        alice.create_group("team", &names(&["bob"])).unwrap();
        assert!(matches!(
            alice.invite("team", "bob"),
            Err(Error::DuplicateInvitation { .. })
        ));
        assert!(matches!(
            alice.invite("team", "alice"),
            Err(Error::AlreadyMember { .. })
        ));
        assert!(matches!(alice.invite("ghost", "bob"), Err(Error::UnknownGroup(_))));
        assert!(alice.invite("team", "carol").is_ok());

        let mut bob = GroupCoordinator::new("bob");
        assert!(bob.receive_invitation("team", "alice", names(&["alice"])).is_some());
        assert!(bob.receive_invitation("team", "alice", names(&["alice"])).is_none());
        assert_eq!(bob.received_invitations().len(), 1);
    }

    #[test]
    fn test_invitation_to_held_group_name_is_refused() {
        let mut bob = GroupCoordinator::new("bob");
        bob.create_group("team", &names(&["dave"])).unwrap();
        bob.receive_invitation("team", "alice", names(&["alice", "carol"]))
            .unwrap();

        assert!(matches!(
            bob.accept_invitation("team"),
            Err(Error::DuplicateGroup(_))
        ));
        assert_eq!(bob.members("team").unwrap(), names(&["bob"]));
        assert_eq!(bob.received_invitations().len(), 1);

        // Declining still works and leaves our own group alone
        let answer = bob.decline_invitation("team").unwrap();
        assert_eq!(answer.to, "alice");
        assert_eq!(bob.members("team").unwrap(), names(&["bob"]));
    }

    #[test]
    fn test_restored_invitation_can_be_answered_again() {
        let mut bob = GroupCoordinator::new("bob");
        bob.receive_invitation("team", "alice", names(&["alice"]))
            .unwrap();
        let invitation = bob.received_invitation("team").cloned().unwrap();

        bob.accept_invitation("team").unwrap();
        assert!(bob.group("team").is_some());
        assert!(bob.received_invitations().is_empty());

        bob.restore_invitation(invitation.clone(), true);
        assert!(bob.group("team").is_none());
        assert_eq!(bob.received_invitations().len(), 1);

        bob.restore_invitation(invitation, false);
        assert_eq!(bob.received_invitations().len(), 1);
        assert!(bob.accept_invitation("team").is_ok());
        assert_eq!(bob.members("team").unwrap(), names(&["alice", "bob"]));
    }

    #[test]
    fn test_answering_unknown_invitation_fails() {
        let mut bob = GroupCoordinator::new("bob");
        assert!(matches!(bob.accept_invitation("team"), Err(Error::NotFound(_))));
        assert!(matches!(bob.decline_invitation("team"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_directory_sharing() {
        let mut alice = GroupCoordinator::new("alice");
        alice.create_group("team", &names(&["bob"])).unwrap();
        alice
            .handle_invitation_response("team", "bob", InvitationReply::Accept)
            .unwrap();

        let out = alice.share_directory("team", "/srv/share", &[]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, "bob");
        // Own contributions are not listed as shared with us
        assert!(alice.shared_directories("team").unwrap().is_empty());

        assert!(matches!(
            alice.share_directory("team", "/srv/share", &names(&["mallory"])),
            Err(Error::InvalidInput(_))
        ));

        assert!(alice.handle_directory_share("team", "/home/bob/music", "bob").unwrap());
        assert!(!alice.handle_directory_share("team", "/home/bob/music", "bob").unwrap());
        let shared = alice.shared_directories("team").unwrap();
        assert_eq!(shared["bob"], names(&["/home/bob/music"]));

        assert!(matches!(
            alice.handle_directory_share("ghost", "/x", "bob"),
            Err(Error::UnknownGroup(_))
        ));
    }
}
