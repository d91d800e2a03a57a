//! Per-peer-pair tunnel session orchestration.
//!
//! Thin layer over [`Ipsec`]: the membership layer reports peer
//! connects/disconnects, this keeps a session table so the same pair is
//! never set up twice concurrently and teardown only runs for sessions
//! that exist.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::debug;

use crate::ipsec::{Ipsec, PeerShortId, XfrmBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Entry reserved, `setup` in flight.
    Pending,
    Established,
}

/// Orchestrates encrypted sessions as peer connectivity changes.
pub struct TunnelManager<B> {
    ipsec: Ipsec<B>,
    sessions: Mutex<HashMap<(PeerShortId, PeerShortId), SessionState>>,
}

impl<B: XfrmBackend> TunnelManager<B> {
    pub fn new(ipsec: Ipsec<B>) -> Self {
        Self {
            ipsec,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Establish the encrypted session for a newly connected peer.
    ///
    /// At most one `setup` runs per peer pair: the session entry is
    /// reserved before the kernel calls start, so a concurrent duplicate
    /// connect event is a no-op. A failed setup releases the reservation;
    /// the kernel may hold partially-installed state until the caller
    /// tears down or resets.
    pub fn peer_connected(
        &self,
        local_peer: PeerShortId,
        remote_peer: PeerShortId,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        session_key: &[u8],
    ) -> Result<()> {
        let pair = (local_peer, remote_peer);
        {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(&pair) {
                debug!(
                    "session {} -> {} already in place, ignoring connect",
                    local_peer, remote_peer
                );
                return Ok(());
            }
            sessions.insert(pair, SessionState::Pending);
        }

        match self
            .ipsec
            .setup(local_peer, remote_peer, local_addr, remote_addr, session_key)
        {
            Ok(()) => {
                self.lock_sessions().insert(pair, SessionState::Established);
                Ok(())
            }
            Err(e) => {
                self.lock_sessions().remove(&pair);
                Err(e).context("tunnel setup")
            }
        }
    }

    /// Tear down the session for a disconnected or removed peer. Unknown
    /// pairs are ignored.
    pub fn peer_disconnected(
        &self,
        local_peer: PeerShortId,
        remote_peer: PeerShortId,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
    ) -> Result<()> {
        let pair = (local_peer, remote_peer);
        if self.lock_sessions().remove(&pair).is_none() {
            debug!(
                "no session {} -> {}, ignoring disconnect",
                local_peer, remote_peer
            );
            return Ok(());
        }

        self.ipsec
            .teardown(local_peer, remote_peer, local_addr, remote_addr)
            .context("tunnel teardown")
    }

    /// Forget all sessions and flush the kernel's security-policy database
    /// system-wide. Startup/shutdown hygiene.
    pub fn reset(&self) -> Result<()> {
        self.lock_sessions().clear();
        self.ipsec.reset()
    }

    pub fn ipsec(&self) -> &Ipsec<B> {
        &self.ipsec
    }

    fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<(PeerShortId, PeerShortId), SessionState>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
