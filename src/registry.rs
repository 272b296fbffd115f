//! Process-wide registry of live client sessions.
//!
//! Admission reserves a slot under the registry mutex before the
//! WebSocket upgrade completes, so racing handshakes can never exceed
//! `max_clients` or sneak a second session into a `--once` run. The
//! returned [`ClientGuard`] releases the slot exactly once when dropped,
//! whether the session ended normally or the upgrade never finished.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("the --once session has already been served")]
    OnceExhausted,

    #[error("client limit reached ({0})")]
    MaxClients(usize),
}

#[derive(Debug)]
struct ClientEntry {
    peer: SocketAddr,
    cancel: CancellationToken,
    /// Set once the WebSocket upgrade completed and the session is live.
    established: bool,
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    /// True once any session has established; `--once` never admits
    /// another after that, even when the first is already gone.
    served: bool,
    clients: HashMap<u64, ClientEntry>,
}

/// Shared, mutex-guarded set of live sessions plus the admission policy.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
    exit: CancellationToken,
    once: bool,
    max_clients: usize,
}

impl SessionRegistry {
    pub fn new(once: bool, max_clients: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                served: false,
                clients: HashMap::new(),
            })),
            exit: CancellationToken::new(),
            once,
            max_clients,
        }
    }

    /// Try to admit a new client. On success the slot is already counted;
    /// dropping the guard releases it.
    pub fn admit(&self, peer: SocketAddr) -> Result<ClientGuard, AdmitError> {
        let mut inner = self.inner.lock();

        if self.once && (inner.served || !inner.clients.is_empty()) {
            return Err(AdmitError::OnceExhausted);
        }
        if self.max_clients > 0 && inner.clients.len() >= self.max_clients {
            return Err(AdmitError::MaxClients(self.max_clients));
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let cancel = CancellationToken::new();
        inner.clients.insert(
            id,
            ClientEntry {
                peer,
                cancel: cancel.clone(),
                established: false,
            },
        );

        Ok(ClientGuard {
            registry: self.clone(),
            id,
            peer,
            cancel,
        })
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Token cancelled when the single `--once` session has come and
    /// gone; the serve loop uses it as a graceful-shutdown trigger.
    pub fn exit_signal(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Cancel every live session. Used on Ctrl-C so children are
    /// signalled and reaped before the process exits.
    pub fn shutdown_all(&self) {
        let inner = self.inner.lock();
        for entry in inner.clients.values() {
            entry.cancel.cancel();
        }
    }

    fn establish(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.clients.get_mut(&id) else {
            return;
        };
        entry.established = true;
        let peer = entry.peer;
        inner.served = true;
        let count = inner.clients.len();
        drop(inner);

        tracing::info!(%peer, clients = count, "WS client connected");
    }

    fn release(&self, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.clients.remove(&id) else {
            return;
        };
        let count = inner.clients.len();
        let served = inner.served;
        drop(inner);

        if entry.established {
            tracing::info!(peer = %entry.peer, clients = count, "WS client closed");
        }
        // Only a session that actually ran consumes the --once budget; a
        // slot refused before the upgrade is refunded.
        if self.once && served && count == 0 {
            tracing::info!("single --once session finished, shutting down");
            self.exit.cancel();
        }
    }
}

/// RAII handle for one admitted session's registry slot.
#[derive(Debug)]
pub struct ClientGuard {
    registry: SessionRegistry,
    id: u64,
    peer: SocketAddr,
    cancel: CancellationToken,
}

impl ClientGuard {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Per-session cancellation token, fired by
    /// [`SessionRegistry::shutdown_all`].
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mark the session as established (upgrade complete). Until this is
    /// called, a dropped guard refunds the admission and leaves the
    /// `--once` budget intact.
    pub fn establish(&self) {
        self.registry.establish(self.id);
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}
