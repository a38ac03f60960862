//! In-memory (single process) coordination service for local clusters and tests.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relay_coordination::{
    ChildData, CoordinationClient, WatchEvent, WatchStream, child_name, join, parent,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

#[derive(Debug)]
struct Entry {
    data: Bytes,
    /// Session owning an ephemeral entry.
    owner: Option<u64>,
}

#[derive(Debug)]
struct Watcher {
    session: u64,
    path: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
    expired: HashSet<u64>,
    next_session: u64,
}

impl State {
    fn check_session(&self, session: u64) -> Result<(), Error> {
        if self.expired.contains(&session) {
            Err(Error::SessionExpired(session))
        } else {
            Ok(())
        }
    }

    fn child_data(path: &str, entry: &Entry) -> ChildData {
        ChildData {
            path: path.to_string(),
            name: child_name(path).to_string(),
            data: entry.data.clone(),
        }
    }

    /// Tell the watchers of `path`'s parent about a change to `path`.
    fn notify(&mut self, path: &str, event: &WatchEvent) {
        let Some(parent) = parent(path) else { return };
        self.watchers.retain(|watcher| {
            watcher.path != parent || watcher.sender.send(event.clone()).is_ok()
        });
    }

    fn notify_session(&mut self, session: u64, event: &WatchEvent) {
        self.watchers.retain(|watcher| {
            watcher.session != session || watcher.sender.send(event.clone()).is_ok()
        });
    }

    fn insert(&mut self, path: &str, data: Bytes, owner: Option<u64>) {
        let entry = Entry { data, owner };
        let event = WatchEvent::ChildAdded(Self::child_data(path, &entry));
        self.entries.insert(path.to_string(), entry);
        self.notify(path, &event);
    }

    /// Create every missing ancestor of `path` as an empty persistent entry.
    fn ensure_parents(&mut self, path: &str) {
        let mut missing = Vec::new();
        let mut current = parent(path);
        while let Some(ancestor) = current {
            if ancestor == "/" || self.entries.contains_key(ancestor) {
                break;
            }
            missing.push(ancestor.to_string());
            current = parent(ancestor);
        }

        for ancestor in missing.into_iter().rev() {
            self.insert(&ancestor, Bytes::new(), None);
        }
    }

    /// Remove `path` and its descendants, deepest first.
    fn remove_tree(&mut self, path: &str) -> usize {
        let prefix = join(path, "");
        let mut doomed: Vec<String> = self
            .entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        if self.entries.contains_key(path) {
            doomed.push(path.to_string());
        }
        doomed.sort_by_key(|key| std::cmp::Reverse(key.matches('/').count()));

        for key in &doomed {
            if let Some(entry) = self.entries.remove(key) {
                let event = WatchEvent::ChildRemoved(Self::child_data(key, &entry));
                self.notify(key, &event);
            }
        }
        doomed.len()
    }

    fn children(&self, path: &str) -> Vec<ChildData> {
        let prefix = join(path, "");
        self.entries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| !key[prefix.len()..].contains('/'))
            .map(|(key, entry)| Self::child_data(key, entry))
            .collect()
    }

    fn drop_ephemerals(&mut self, session: u64) -> usize {
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session))
            .map(|(key, _)| key.clone())
            .collect();

        owned.iter().map(|path| self.remove_tree(path)).sum()
    }
}

fn validate(path: &str) -> Result<(), Error> {
    let valid = path.starts_with('/')
        && (path == "/" || (!path.ends_with('/') && !path.contains("//")));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidPath(path.to_string()))
    }
}

/// The shared store. Hands out sessions that see the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryCoordinator {
    state: Arc<Mutex<State>>,
}

impl MemoryCoordinator {
    /// Creates a new, empty coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session.
    #[must_use]
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut state = self.state.lock();
            state.next_session += 1;
            state.next_session
        };
        debug!("Opened coordination session {}", id);

        MemorySession {
            id,
            state: Arc::clone(&self.state),
        }
    }

    /// Whether an entry exists at `path`, regardless of session.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().entries.contains_key(path)
    }
}

/// One client session against a [`MemoryCoordinator`].
///
/// Clones share the session, so ephemeral entries created through any clone
/// belong to it.
#[derive(Clone, Debug)]
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl MemorySession {
    /// Session id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Whether the session was expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.state.lock().expired.contains(&self.id)
    }

    /// End the session: remove its ephemeral entries and close its watches.
    pub fn expire(&self) {
        let mut state = self.state.lock();
        if !state.expired.insert(self.id) {
            return;
        }
        let removed = state.drop_ephemerals(self.id);
        state.watchers.retain(|watcher| watcher.session != self.id);
        info!(
            "Expired coordination session {} ({} ephemeral entries removed)",
            self.id, removed
        );
    }

    /// Report a connection blip to this session's watchers: `Suspended`
    /// followed by `Reconnected`. Entries are untouched.
    pub fn simulate_disconnect(&self) {
        let mut state = self.state.lock();
        state.notify_session(self.id, &WatchEvent::Suspended);
        state.notify_session(self.id, &WatchEvent::Reconnected);
    }

    /// Like [`simulate_disconnect`](Self::simulate_disconnect), but the
    /// session's ephemeral entries are lost in between, as when the service
    /// expires a session and the client transparently opens a new one.
    pub fn simulate_session_loss(&self) {
        let mut state = self.state.lock();
        state.notify_session(self.id, &WatchEvent::Suspended);
        let removed = state.drop_ephemerals(self.id);
        debug!("Session {} lost {} ephemeral entries", self.id, removed);
        state.notify_session(self.id, &WatchEvent::Reconnected);
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    type Error = Error;

    async fn create_persistent(&self, path: &str, data: Bytes) -> Result<(), Self::Error> {
        validate(path)?;
        let mut state = self.state.lock();
        state.check_session(self.id)?;

        if path == "/" || state.entries.contains_key(path) {
            return Ok(());
        }
        state.ensure_parents(path);
        state.insert(path, data, None);
        Ok(())
    }

    async fn create_ephemeral(&self, path: &str, data: Bytes) -> Result<(), Self::Error> {
        validate(path)?;
        let mut state = self.state.lock();
        state.check_session(self.id)?;

        if path == "/" || state.entries.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }
        state.ensure_parents(path);
        state.insert(path, data, Some(self.id));
        Ok(())
    }

    async fn set_data(&self, path: &str, data: Bytes) -> Result<(), Self::Error> {
        validate(path)?;
        let mut state = self.state.lock();
        state.check_session(self.id)?;

        let event = {
            let entry = state
                .entries
                .get_mut(path)
                .ok_or_else(|| Error::NoNode(path.to_string()))?;
            entry.data = data;
            WatchEvent::ChildUpdated(State::child_data(path, entry))
        };
        state.notify(path, &event);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), Self::Error> {
        validate(path)?;
        let mut state = self.state.lock();
        state.check_session(self.id)?;

        state.remove_tree(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, Self::Error> {
        validate(path)?;
        let state = self.state.lock();
        state.check_session(self.id)?;

        Ok(path == "/" || state.entries.contains_key(path))
    }

    async fn get_data(&self, path: &str) -> Result<Option<Bytes>, Self::Error> {
        validate(path)?;
        let state = self.state.lock();
        state.check_session(self.id)?;

        Ok(state.entries.get(path).map(|entry| entry.data.clone()))
    }

    async fn get_children(&self, path: &str) -> Result<Vec<ChildData>, Self::Error> {
        validate(path)?;
        let state = self.state.lock();
        state.check_session(self.id)?;

        if path != "/" && !state.entries.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(state.children(path))
    }

    async fn watch_children(&self, path: &str) -> Result<WatchStream, Self::Error> {
        validate(path)?;
        let mut state = self.state.lock();
        state.check_session(self.id)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            session: self.id,
            path: path.to_string(),
            sender,
        });
        Ok(Box::pin(UnboundedReceiverStream::new(receiver)))
    }
}
