//! Session resumption caches.
//!
//! Clients keep serialized sessions keyed by peer address and load one into
//! the engine before handshaking with the same peer again. Servers hand a
//! [`SessionStore`] to the engine, which does its own lookups by session id.

use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::engine::Engine;

/// Get/set pair an engine uses as its server side session cache.
pub trait SessionStore: Send + Sync {
    /// The session stored under `id`, if any.
    fn get(&self, id: &[u8]) -> Option<Vec<u8>>;

    /// Store `session` under `id`.
    fn set(&self, id: &[u8], session: &[u8]);
}

struct ClientEntry {
    peer: SocketAddr,
    session: Zeroizing<Vec<u8>>,
    timestamp: Instant,
}

/// Fixed-size client cache keyed by peer address.
pub(crate) struct ClientSessionCache {
    slots: Vec<Option<ClientEntry>>,
}

impl ClientSessionCache {
    pub fn new(entries: usize) -> Self {
        let mut slots = Vec::with_capacity(entries);
        slots.resize_with(entries, || None);
        ClientSessionCache { slots }
    }

    /// Store the session for `peer`.
    ///
    /// Reuses the slot already holding `peer`, else an empty slot, else
    /// evicts the least recently updated entry.
    pub fn store(&mut self, peer: SocketAddr, session: Vec<u8>) {
        let index = self
            .slots
            .iter()
            .position(|s| matches!(s, Some(e) if e.peer == peer))
            .or_else(|| self.slots.iter().position(|s| s.is_none()))
            .or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| s.as_ref().map(|e| (i, e.timestamp)))
                    .min_by_key(|(_, t)| *t)
                    .map(|(i, _)| i)
            });

        let Some(index) = index else {
            return;
        };

        // Replacing drops (and zeroizes) the previous buffer.
        self.slots[index] = Some(ClientEntry {
            peer,
            session: Zeroizing::new(session),
            timestamp: Instant::now(),
        });
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&[u8]> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.peer == *peer)
            .map(|e| e.session.as_slice())
    }

    pub fn remove(&mut self, peer: &SocketAddr) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some(e) if e.peer == *peer) {
                *slot = None;
            }
        }
    }

    pub fn purge(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Save the established session of `engine` for `peer`.
pub(crate) fn save(cache: &Mutex<ClientSessionCache>, engine: &dyn Engine, peer: SocketAddr) {
    match engine.save_session() {
        Ok(session) => {
            trace!("Storing session for {} ({} bytes)", peer, session.len());
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .store(peer, session);
        }
        Err(e) => debug!("Failed to save session for {}: {}", peer, e),
    }
}

/// Load a cached session for `peer` into `engine`.
///
/// An entry the engine cannot load is dropped.
pub(crate) fn restore(cache: &Mutex<ClientSessionCache>, engine: &mut dyn Engine, peer: SocketAddr) {
    let mut cache = cache.lock().unwrap_or_else(PoisonError::into_inner);

    let Some(session) = cache.get(&peer) else {
        return;
    };

    match engine.load_session(session) {
        Ok(()) => debug!("Resuming session with {}", peer),
        Err(e) => {
            debug!("Dropping unusable session for {}: {}", peer, e);
            cache.remove(&peer);
        }
    }
}

struct ServerEntry {
    id: Vec<u8>,
    session: Zeroizing<Vec<u8>>,
    stored: Instant,
}

/// Bounded server side session cache with entry expiry.
pub struct ServerSessionCache {
    entries: Mutex<Vec<ServerEntry>>,
    max_entries: usize,
    timeout: Duration,
}

impl ServerSessionCache {
    pub fn new(max_entries: usize, timeout: Duration) -> Self {
        ServerSessionCache {
            entries: Mutex::new(Vec::new()),
            max_entries,
            timeout,
        }
    }

    pub fn purge(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for ServerSessionCache {
    fn get(&self, id: &[u8]) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let timeout = self.timeout;
        entries.retain(|e| e.stored.elapsed() < timeout);

        entries
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.session.to_vec())
    }

    fn set(&self, id: &[u8], session: &[u8]) {
        if self.max_entries == 0 {
            return;
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|e| e.id != id);

        if entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| e.stored)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                entries.remove(i);
            }
        }

        entries.push(ServerEntry {
            id: id.to_vec(),
            session: Zeroizing::new(session.to_vec()),
            stored: Instant::now(),
        });
    }
}
