//! Per-peer record and the handshake tie-break rules.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::peer::id::PeerId;
use crate::pool::ConnRef;

/// Nonce a passive-only peer (no recorded remote address) answers with.
pub(crate) const PASSIVE_NONCE: u32 = 0xffff;

/// State of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No chosen connection.
    #[default]
    Disconnected,
    /// Handshake complete, the chosen connection carries traffic.
    Connected,
    /// A reconnect was requested; the chosen connection is being torn
    /// down and the teardown path re-initiates immediately.
    Reset,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Disconnected => write!(f, "disconnected"),
            PeerState::Connected => write!(f, "connected"),
            PeerState::Reset => write!(f, "reset"),
        }
    }
}

/// Whether the passive side keeps an inbound connection over its own
/// outbound attempt. Mirrored by [`outbound_wins`] on the other side:
/// for any two distinct nonces exactly one of the two connections
/// survives on both ends.
pub(crate) fn inbound_wins(incoming_nonce: u32, own_nonce: u32, addr_known: bool) -> bool {
    incoming_nonce < own_nonce || !addr_known
}

/// Whether the active side keeps its outbound connection.
pub(crate) fn outbound_wins(own_nonce: u32, incoming_nonce: u32) -> bool {
    own_nonce < incoming_nonce
}

/// A registered peer. Owned by the registry task; candidate and chosen
/// connections are observed, not owned.
pub(crate) struct Peer {
    pub id: PeerId,
    /// Remote listen address, set by `set_peer_addr`.
    pub addr: Option<SocketAddr>,
    /// Current handshake nonce; 0 means "draw a fresh one on next read".
    pub nonce: u32,
    /// The connection carrying traffic. May point at a terminated
    /// connection between teardown and the next handshake; its queued
    /// bytes are moved over when a successor is chosen.
    pub conn: Option<ConnRef>,
    pub chosen_conn: Option<ConnRef>,
    pub inbound_conn: Option<ConnRef>,
    pub outbound_conn: Option<ConnRef>,

    pub retry_delay: Duration,
    /// Remaining attempts: -1 = forever, 0 = disabled.
    pub ntry: i64,
    pub retry_timer: Option<JoinHandle<()>>,
    pub retry_epoch: u64,

    pub ping_timer: Option<JoinHandle<()>>,
    pub ping_epoch: u64,
    pub ping_timer_ok: bool,
    pub pong_msg_ok: bool,

    pub state: PeerState,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addr: None,
            nonce: 0,
            conn: None,
            chosen_conn: None,
            inbound_conn: None,
            outbound_conn: None,
            retry_delay: Duration::ZERO,
            ntry: 0,
            retry_timer: None,
            retry_epoch: 0,
            ping_timer: None,
            ping_epoch: 0,
            ping_timer_ok: false,
            pong_msg_ok: false,
            state: PeerState::Disconnected,
        }
    }

    /// The nonce for the current disconnected episode, drawing a fresh
    /// one from the system randomness source if unset. Drawn from a
    /// 16-bit space shifted by one so 0 stays reserved.
    pub fn get_nonce(&mut self) -> Result<u32> {
        if self.nonce == 0 {
            let mut raw = [0u8; 2];
            OsRng
                .try_fill_bytes(&mut raw)
                .map_err(|_| Error::RandSource)?;
            self.nonce = u16::from_le_bytes(raw) as u32 + 1;
        }
        Ok(self.nonce)
    }

    /// Cancel the heartbeat timer; stale firings are ignored by epoch.
    pub fn clear_ping_timer(&mut self) {
        if let Some(t) = self.ping_timer.take() {
            t.abort();
        }
        self.ping_epoch += 1;
    }

    /// Cancel the retry timer; stale firings are ignored by epoch.
    pub fn clear_retry_timer(&mut self) {
        if let Some(t) = self.retry_timer.take() {
            t.abort();
        }
        self.retry_epoch += 1;
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.clear_ping_timer();
        self.clear_retry_timer();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<peer {} {}>", self.id, self.state)
    }
}
