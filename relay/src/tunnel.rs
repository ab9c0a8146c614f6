//! Tunnel records for the relay
//!
//! A [`Tunnel`] is the relay's handle on one authenticated agent: the channel
//! feeding that agent's WebSocket writer plus the table of bridged requests
//! still waiting for a reply.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use gtunnel_shared::protocol::Envelope;

/// Unique tunnel identifier
pub type TunnelId = String;

/// Fresh time-ordered id, used for connections and for bridged requests.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Prefix handed to agents that do not ask for one: `app-` plus the last 12
/// characters of the connection id.
pub fn derive_prefix(id: &str) -> String {
    let tail: String = id
        .chars()
        .rev()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("app-{}", tail)
}

/// Represents an active tunnel connection
#[derive(Clone, Debug)]
pub struct Tunnel {
    pub id: TunnelId,
    /// Routable prefix, without slashes
    pub prefix: String,
    /// Frames queued for the agent's socket
    tx: mpsc::Sender<String>,
    /// Bridged requests waiting for a reply, keyed by correlation id
    pending: Arc<DashMap<String, oneshot::Sender<Envelope>>>,
    pub created_at: Instant,
}

impl Tunnel {
    pub fn new(id: TunnelId, prefix: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            prefix,
            tx,
            pending: Arc::new(DashMap::new()),
            created_at: Instant::now(),
        }
    }

    /// Queue one encoded envelope for the agent.
    pub async fn send(&self, frame: String) -> Result<(), mpsc::error::SendError<String>> {
        self.tx.send(frame).await
    }

    /// Allocate a correlation id and a receiver for its reply.
    pub fn register(&self) -> (String, oneshot::Receiver<Envelope>) {
        let request_id = new_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        (request_id, rx)
    }

    /// Forget a waiter that gave up.
    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Hand a reply to the request it answers. Returns `false` when nobody is
    /// waiting for it, in which case the reply is dropped.
    ///
    /// A reply without an id is accepted only while exactly one request is
    /// outstanding.
    pub fn deliver(&self, envelope: Envelope) -> bool {
        let request_id = match envelope.id.clone() {
            Some(id) => id,
            None => {
                if self.pending.len() != 1 {
                    warn!("[{}] Dropping uncorrelated reply ({} pending)", self.id, self.pending.len());
                    return false;
                }
                match self.pending.iter().next() {
                    Some(entry) => entry.key().clone(),
                    None => return false,
                }
            }
        };

        match self.pending.remove(&request_id) {
            Some((_, waiter)) => waiter.send(envelope).is_ok(),
            None => {
                debug!("[{}] No waiter for reply {}", self.id, request_id);
                false
            }
        }
    }

    /// Drop every waiter so in-flight bridged requests fail fast. Called when
    /// the agent's socket goes away.
    pub fn fail_pending(&self) {
        self.pending.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True once the agent's socket task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
