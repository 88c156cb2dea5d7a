/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use palaver_protocol::SignalEnvelope;

use crate::registry::{User, UserRegistry, UserSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Added(String),
    Removed(String),
}

impl PresenceEvent {
    pub fn to_envelope(&self) -> SignalEnvelope {
        match self {
            PresenceEvent::Added(name) => SignalEnvelope::user_add(name),
            PresenceEvent::Removed(name) => SignalEnvelope::user_remove(name),
        }
    }
}

/// One session's mirror of the registry.
#[derive(Default)]
pub struct PresenceSync {
    local: UserSet,
    initialized: bool,
}

impl PresenceSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts the session's own identity into the mirror; the next
    /// reconciliation publishes it to the registry.
    pub fn announce(&mut self, me: Arc<User>) {
        self.local.insert(me);
    }

    pub fn local(&self) -> &UserSet {
        &self.local
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// One diff-and-merge pass. Does nothing until `me` is known. The first
    /// pass also sends every user already registered, including `me` when
    /// another session already holds the name.
    pub fn reconcile(&mut self, me: Option<&str>, registry: &UserRegistry) -> Vec<PresenceEvent> {
        let Some(me) = me else {
            return Vec::new();
        };
        let mut events = Vec::new();

        if !self.initialized {
            for user in registry.snapshot().sorted() {
                if user.username() == me || self.local.insert(user.clone()) {
                    events.push(PresenceEvent::Added(user.username().to_string()));
                }
            }
            self.initialized = true;
        }

        let global = registry.snapshot();
        let (only_local, only_global) = self.local.diff(&global);

        for user in only_local.sorted() {
            let name = user.username();
            if name == me {
                registry.add(user.clone());
                events.push(PresenceEvent::Added(name.to_string()));
                continue;
            }
            // Only the live claim is re-published. A reconnected peer's new
            // `User` replaces the one mirrored before it left.
            match registry.live_user(name) {
                Some(live) if Arc::ptr_eq(&live, &user) => {
                    registry.add(live);
                    events.push(PresenceEvent::Added(name.to_string()));
                }
                Some(live) => {
                    self.local.replace(live.clone());
                    registry.add(live);
                }
                None => {
                    self.local.remove(name);
                    events.push(PresenceEvent::Removed(name.to_string()));
                }
            }
        }

        for user in global.sorted() {
            if let Some(mine) = self.local.get(user.username()) {
                if !Arc::ptr_eq(&mine, &user) {
                    self.local.replace(user);
                }
            }
        }

        for user in only_global.sorted() {
            events.push(PresenceEvent::Added(user.username().to_string()));
            self.local.insert(user);
        }

        events
    }
}
