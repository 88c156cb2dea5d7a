/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use palaver_protocol::{DecodeError, Invitation, SessionOffer};
use tracing::{debug, info};

use crate::media_relay::{Negotiated, NegotiationError, RelayConnector};
use crate::registry::{lock, User, UserRegistry, UserSet};

#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("decode offer: {0}")]
    Decode(#[from] DecodeError),
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("announce a username before calling")]
    NotLoggedIn,
    #[error("unknown call action {0:?}")]
    UnknownAction(String),
}

fn random_id() -> String {
    let mut b = [0u8; 16];
    use rand::RngCore as _;
    rand::rngs::OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[derive(Debug)]
pub struct Conference {
    id: String,
    seq: u64,
    initiator: String,
    members: Mutex<UserSet>,
}

impl Conference {
    fn new(initiator: &Arc<User>, seq: u64) -> Self {
        let members = std::iter::once(initiator.clone()).collect();
        Self {
            id: random_id(),
            seq,
            initiator: initiator.username().to_string(),
            members: Mutex::new(members),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initiator(&self) -> &str {
        &self.initiator
    }

    pub fn add(&self, user: Arc<User>) -> bool {
        lock(&self.members).insert(user)
    }

    pub fn contains(&self, username: &str) -> bool {
        lock(&self.members).contains(username)
    }

    pub fn member_names(&self) -> Vec<String> {
        lock(&self.members).usernames()
    }

    /// Drops `username`; returns true when nobody is left.
    fn remove(&self, username: &str) -> bool {
        let mut members = lock(&self.members);
        members.remove(username);
        members.is_empty()
    }
}

#[derive(Default)]
struct DirectoryState {
    conferences: HashMap<String, Arc<Conference>>,
    next_seq: u64,
}

/// Conferences that still have at least one member.
#[derive(Default)]
pub struct ConferenceDirectory {
    state: Mutex<DirectoryState>,
}

impl ConferenceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// New conference whose only member is `initiator`.
    pub fn create(&self, initiator: &Arc<User>) -> Arc<Conference> {
        let mut state = lock(&self.state);
        state.next_seq += 1;
        let conference = Arc::new(Conference::new(initiator, state.next_seq));
        state.conferences.insert(conference.id.clone(), conference.clone());
        conference
    }

    pub fn get(&self, id: &str) -> Option<Arc<Conference>> {
        lock(&self.state).conferences.get(id).cloned()
    }

    /// Most recently created conference `username` belongs to.
    pub fn latest_for(&self, username: &str) -> Option<Arc<Conference>> {
        lock(&self.state)
            .conferences
            .values()
            .filter(|c| c.contains(username))
            .max_by_key(|c| c.seq)
            .cloned()
    }

    /// Takes a departed user out of every conference and forgets the ones left
    /// empty. Returns how many were dropped.
    pub fn remove_member(&self, username: &str) -> usize {
        let mut state = lock(&self.state);
        let before = state.conferences.len();
        state.conferences.retain(|_, c| !c.remove(username));
        before - state.conferences.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).conferences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns `Call/offer` and `Call/accepted` into relay endpoints, conferences and invitations.
pub struct CallSignaling {
    registry: Arc<UserRegistry>,
    conferences: Arc<ConferenceDirectory>,
    connector: Arc<dyn RelayConnector>,
}

impl CallSignaling {
    pub fn new(
        registry: Arc<UserRegistry>,
        conferences: Arc<ConferenceDirectory>,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        Self {
            registry,
            conferences,
            connector,
        }
    }

    pub fn conferences(&self) -> &Arc<ConferenceDirectory> {
        &self.conferences
    }

    /// Negotiates the caller's endpoint first; nothing is created when that
    /// fails. The returned endpoint and answer belong to the calling session.
    pub async fn offer(&self, me: &Arc<User>, offer: &SessionOffer) -> Result<(Arc<Conference>, Negotiated), CallError> {
        let negotiated = self
            .connector
            .negotiate(me.username(), &[], &offer.local_description)
            .await?;

        let conference = self.conferences.create(me);
        info!(user = %me.username(), conference = %conference.id(), "conference created");

        for target in &offer.users {
            if target == me.username() {
                continue;
            }
            let Some(user) = self.registry.get(target) else {
                debug!(user = %target, "invitee not registered, skipping");
                continue;
            };
            conference.add(user.clone());
            info!(user = %target, conference = %conference.id(), "inviting");
            let superseded = user
                .invitations
                .post(Invitation::new(conference.id(), me.username()));
            if let Some(old) = superseded {
                info!(user = %target, dropped = %old.conference, "pending invitation superseded");
            }
        }
        Ok((conference, negotiated))
    }

    /// Relays `me` into the latest conference it was invited to, subscribing to
    /// the tracks the other members already publish.
    pub async fn accept(&self, me: &Arc<User>, offer: &SessionOffer) -> Result<Negotiated, CallError> {
        let others = self
            .conferences
            .latest_for(me.username())
            .map(|c| {
                c.member_names()
                    .into_iter()
                    .filter(|name| name != me.username())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let negotiated = self
            .connector
            .negotiate(me.username(), &others, &offer.local_description)
            .await?;
        info!(user = %me.username(), peers = others.len(), "call accepted");
        Ok(negotiated)
    }

    /// Called once the last session of `username` is gone.
    pub fn user_left(&self, username: &str) {
        let dropped = self.conferences.remove_member(username);
        if dropped > 0 {
            debug!(user = %username, dropped, "empty conferences dropped");
        }
    }
}
