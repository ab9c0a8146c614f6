//! Connection registry for the relay
//!
//! Holds connections that are still authenticating, authenticated tunnels by
//! id, and the prefix index used for routing. All three live behind one lock,
//! so reserving a prefix and promoting a connection are each a single step as
//! seen by any other task.

use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};

use crate::tunnel::{Tunnel, TunnelId};

#[derive(Default)]
struct Inner {
    /// Upgraded connections that have not finished the handshake
    pending: HashMap<TunnelId, Instant>,
    tunnels: HashMap<TunnelId, Tunnel>,
    /// prefix -> owning connection; reservations and live tunnels alike
    prefixes: HashMap<String, TunnelId>,
}

/// Registry mapping prefixes to tunnels
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub async fn add_pending(&self, id: &str) {
        let mut inner = self.inner.write().await;
        inner.pending.insert(id.to_string(), Instant::now());
    }

    /// Drop a connection that failed its handshake, along with any prefix it
    /// reserved. Returns `false` if it was not pending.
    pub async fn discard_pending(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let was_pending = inner.pending.remove(id).is_some();
        if was_pending {
            inner.prefixes.retain(|_, owner| owner != id);
        }
        was_pending
    }

    /// Claim `prefix` for connection `id`. Fails if another connection holds it.
    pub async fn reserve(&self, prefix: &str, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.prefixes.get(prefix) {
            Some(owner) => owner == id,
            None => {
                inner.prefixes.insert(prefix.to_string(), id.to_string());
                true
            }
        }
    }

    /// Give back a reservation. Only the owner's claim is released.
    pub async fn release(&self, prefix: &str, id: &str) {
        let mut inner = self.inner.write().await;
        if inner.prefixes.get(prefix).is_some_and(|owner| owner == id) {
            inner.prefixes.remove(prefix);
        }
    }

    /// Promote a pending connection holding the reservation for `prefix` into
    /// an authenticated tunnel.
    pub async fn insert(&self, id: &str, prefix: &str, tx: mpsc::Sender<String>) -> Option<Tunnel> {
        let mut inner = self.inner.write().await;
        let owns_prefix = inner.prefixes.get(prefix).is_some_and(|owner| owner == id);
        if !owns_prefix || !inner.pending.contains_key(id) {
            return None;
        }

        inner.pending.remove(id);
        let tunnel = Tunnel::new(id.to_string(), prefix.to_string(), tx);
        inner.tunnels.insert(id.to_string(), tunnel.clone());
        Some(tunnel)
    }

    /// Remove a connection in whatever state it is in, freeing its prefix.
    pub async fn remove(&self, id: &str) -> Option<Tunnel> {
        let mut inner = self.inner.write().await;
        inner.pending.remove(id);
        inner.prefixes.retain(|_, owner| owner != id);
        inner.tunnels.remove(id)
    }

    /// Authenticated tunnel routed under `prefix`. Bare reservations do not match.
    pub async fn lookup_by_prefix(&self, prefix: &str) -> Option<Tunnel> {
        let inner = self.inner.read().await;
        let id = inner.prefixes.get(prefix)?;
        inner.tunnels.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<Tunnel> {
        self.inner.read().await.tunnels.get(id).cloned()
    }

    pub async fn is_pending(&self, id: &str) -> bool {
        self.inner.read().await.pending.contains_key(id)
    }

    pub async fn tunnel_count(&self) -> usize {
        self.inner.read().await.tunnels.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.read().await.pending.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
