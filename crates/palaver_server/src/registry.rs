/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use palaver_protocol::Invitation;
use tokio::sync::{watch, Notify};

/// Registry locks are only held for one short operation; a panic while holding
/// one leaves the data consistent, so poisoning is ignored.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capacity-one mailbox. A newer item replaces a pending one; posting never waits.
pub struct Slot<T> {
    item: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            item: Mutex::new(None),
            notify: Notify::new(),
        }
    }
}

impl<T> Slot<T> {
    /// Returns the item that was superseded, if any.
    pub fn post(&self, item: T) -> Option<T> {
        let prev = lock(&self.item).replace(item);
        self.notify.notify_one();
        prev
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.item).take()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.item).is_some()
    }

    /// Resolves after the next `post` (or immediately if one happened since the last wakeup).
    pub async fn ready(&self) {
        self.notify.notified().await
    }
}

/// Identity shared by every session announcing the same username. Per-connection
/// state (relay endpoint, pending answer) stays with the session.
pub struct User {
    username: String,
    pub invitations: Slot<Invitation>,
}

impl User {
    pub fn new(username: &str) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            invitations: Slot::default(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Wakes when an invitation is posted.
    pub async fn mail(&self) {
        self.invitations.ready().await
    }
}

impl std::fmt::Debug for User {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("User").field("username", &self.username).finish_non_exhaustive()
    }
}

/// Users keyed by username. Not synchronized; see [`UserRegistry`] for the shared one.
#[derive(Default, Clone, Debug)]
pub struct UserSet {
    users: HashMap<String, Arc<User>>,
}

impl UserSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// No-op (returns false) when the username is already present.
    pub fn insert(&mut self, user: Arc<User>) -> bool {
        if self.users.contains_key(user.username()) {
            return false;
        }
        self.users.insert(user.username().to_string(), user);
        true
    }

    /// Inserts or swaps in `user`, returning the entry it displaced.
    pub fn replace(&mut self, user: Arc<User>) -> Option<Arc<User>> {
        self.users.insert(user.username().to_string(), user)
    }

    pub fn remove(&mut self, username: &str) -> Option<Arc<User>> {
        self.users.remove(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    pub fn get(&self, username: &str) -> Option<Arc<User>> {
        self.users.get(username).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn usernames(&self) -> Vec<String> {
        let mut names = self.users.keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Members ordered by username.
    pub fn sorted(&self) -> Vec<Arc<User>> {
        let mut users = self.users.values().cloned().collect::<Vec<_>>();
        users.sort_by(|a, b| a.username().cmp(b.username()));
        users
    }

    /// `(self \ other, other \ self)` by username.
    pub fn diff(&self, other: &UserSet) -> (UserSet, UserSet) {
        let only_self = self
            .users
            .iter()
            .filter(|(name, _)| !other.contains(name))
            .map(|(name, user)| (name.clone(), user.clone()))
            .collect();
        let only_other = other
            .users
            .iter()
            .filter(|(name, _)| !self.contains(name))
            .map(|(name, user)| (name.clone(), user.clone()))
            .collect();
        (UserSet { users: only_self }, UserSet { users: only_other })
    }
}

impl FromIterator<Arc<User>> for UserSet {
    fn from_iter<I: IntoIterator<Item = Arc<User>>>(iter: I) -> Self {
        let mut set = UserSet::new();
        for user in iter {
            set.insert(user);
        }
        set
    }
}

#[derive(Default)]
struct RegistryState {
    users: UserSet,
    /// Sessions currently claiming a username, with the shared `User` they were handed.
    live: HashMap<String, (usize, Arc<User>)>,
}

/// Process-wide set of known users shared by every session.
pub struct UserRegistry {
    state: Mutex<RegistryState>,
    changes: watch::Sender<u64>,
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UserRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(RegistryState::default()),
            changes,
        }
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Idempotent: an already registered username is left untouched.
    pub fn add(&self, user: Arc<User>) -> bool {
        let added = lock(&self.state).users.insert(user);
        if added {
            self.bump();
        }
        added
    }

    pub fn remove(&self, username: &str) -> bool {
        let removed = lock(&self.state).users.remove(username).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    pub fn contains(&self, username: &str) -> bool {
        lock(&self.state).users.contains(username)
    }

    pub fn get(&self, username: &str) -> Option<Arc<User>> {
        lock(&self.state).users.get(username)
    }

    pub fn snapshot(&self) -> UserSet {
        lock(&self.state).users.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `User` handed to sessions currently claiming `username`.
    pub fn live_user(&self, username: &str) -> Option<Arc<User>> {
        lock(&self.state).live.get(username).map(|(_, user)| user.clone())
    }

    /// Records a session announcing `username` and returns the `User` every
    /// session with that name shares. A registered entry from an earlier claim
    /// is swapped for the live one; otherwise the entry reaches `users` through
    /// the announcing session's presence reconciliation.
    pub fn claim(&self, username: &str) -> Arc<User> {
        let mut state = lock(&self.state);
        let entry = state
            .live
            .entry(username.to_string())
            .or_insert_with(|| (0, User::new(username)));
        entry.0 += 1;
        let user = entry.1.clone();
        // A registered entry nobody claims belongs to no session; swap it out.
        let stale = state.users.get(username).is_some_and(|u| !Arc::ptr_eq(&u, &user));
        if stale {
            state.users.replace(user.clone());
            drop(state);
            self.bump();
        }
        user
    }

    /// Drops one session's claim. Returns true when it was the last one and the
    /// username left the registry.
    pub fn release(&self, username: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(entry) = state.live.get_mut(username) else {
            return false;
        };
        entry.0 = entry.0.saturating_sub(1);
        if entry.0 > 0 {
            return false;
        }
        state.live.remove(username);
        state.users.remove(username);
        drop(state);
        self.bump();
        true
    }

    /// Change counter, bumped on every mutation of the registered set.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> UserSet {
        names.iter().map(|n| User::new(n)).collect()
    }

    #[test]
    fn insert_is_idempotent_by_username() {
        let mut users = set(&["alice"]);
        assert!(!users.insert(User::new("alice")));
        assert_eq!(users.len(), 1);
        assert!(users.insert(User::new("bob")));
        assert_eq!(users.usernames(), vec!["alice", "bob"]);
    }

    #[test]
    fn diff_is_one_directional_both_ways() {
        let local = set(&["alice", "bob"]);
        let global = set(&["bob", "carol"]);
        let (only_local, only_global) = local.diff(&global);
        assert_eq!(only_local.usernames(), vec!["alice"]);
        assert_eq!(only_global.usernames(), vec!["carol"]);
    }

    #[test]
    fn remove_leaves_unrelated_entries() {
        let registry = UserRegistry::new();
        for name in ["a", "b", "c", "d"] {
            assert!(registry.add(User::new(name)));
        }
        assert!(registry.remove("b"));
        assert!(!registry.remove("b"));
        assert_eq!(registry.snapshot().usernames(), vec!["a", "c", "d"]);
    }

    #[test]
    fn snapshot_is_detached_from_later_mutation() {
        let registry = UserRegistry::new();
        registry.add(User::new("alice"));
        let snap = registry.snapshot();
        registry.add(User::new("bob"));
        assert_eq!(snap.usernames(), vec!["alice"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn claims_share_one_user_until_the_last_release() {
        let registry = UserRegistry::new();
        let first = registry.claim("bob");
        let second = registry.claim("bob");
        assert!(Arc::ptr_eq(&first, &second));
        registry.add(first.clone());

        assert!(!registry.release("bob"));
        assert!(registry.contains("bob"));
        assert!(registry.release("bob"));
        assert!(!registry.contains("bob"));
        assert!(registry.live_user("bob").is_none());
        assert!(!registry.release("bob"));

        let again = registry.claim("bob");
        assert!(registry.live_user("bob").is_some());
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn live_user_follows_the_current_claim() {
        let registry = UserRegistry::new();
        assert!(registry.live_user("bob").is_none());
        let first = registry.claim("bob");
        assert!(Arc::ptr_eq(&registry.live_user("bob").unwrap(), &first));

        registry.release("bob");
        assert!(registry.live_user("bob").is_none());
        let second = registry.claim("bob");
        assert!(Arc::ptr_eq(&registry.live_user("bob").unwrap(), &second));
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn claim_replaces_an_unclaimed_registered_user() {
        let registry = UserRegistry::new();
        let orphan = User::new("bob");
        registry.add(orphan.clone());
        let claimed = registry.claim("bob");
        assert!(!Arc::ptr_eq(&orphan, &claimed));
        assert!(Arc::ptr_eq(&registry.get("bob").unwrap(), &claimed));
    }

    #[test]
    fn replace_swaps_the_entry_for_a_name() {
        let mut users = set(&["bob"]);
        let newer = User::new("bob");
        let old = users.replace(newer.clone()).unwrap();
        assert!(!Arc::ptr_eq(&old, &newer));
        assert!(Arc::ptr_eq(&users.get("bob").unwrap(), &newer));
        assert!(users.replace(User::new("carol")).is_none());
    }

    #[test]
    fn slot_keeps_only_the_latest_item() {
        let user = User::new("bob");
        assert!(user.invitations.post(Invitation::new("c1", "alice")).is_none());
        let superseded = user.invitations.post(Invitation::new("c2", "carol"));
        assert_eq!(superseded.map(|i| i.conference), Some("c1".to_string()));
        assert_eq!(user.invitations.take(), Some(Invitation::new("c2", "carol")));
        assert!(user.invitations.take().is_none());
    }

    #[tokio::test]
    async fn concurrent_adds_do_not_duplicate() {
        let registry = Arc::new(UserRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.add(User::new(&format!("user{}", i % 8)));
                registry.snapshot().len()
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap() <= 8);
        }
        assert_eq!(registry.len(), 8);
    }

    #[tokio::test]
    async fn mutations_bump_the_change_counter() {
        let registry = UserRegistry::new();
        let mut changes = registry.subscribe();
        registry.add(User::new("alice"));
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow_and_update(), 1);
        registry.add(User::new("alice"));
        assert!(!changes.has_changed().unwrap());
    }
}
