//! Peer-to-peer overlay: any two nodes hold one logical bi-directional
//! channel, established by either side.
//!
//! Registry mutations, handshakes and lifecycle events are serialized on
//! a single registry task. When both ends dial each other at the same
//! time, the duplicate connections are resolved by a nonce tie-break:
//! each side sends a handshake ping carrying its listen address and a
//! per-episode nonce, the passive side answers with a handshake pong,
//! and both sides compare the same ordered nonce pair, so exactly one of
//! the two connections is chosen on both ends. Established channels are
//! kept alive with ping/pong heartbeats and an idle timeout, and torn
//! channels are re-initiated on a jittered retry schedule while the
//! attempt budget lasts.

pub mod id;
pub mod state;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::config::PeerNetworkConfig;
use crate::error::{gen_async_id, AsyncId, Error, Result};
use crate::msgnet::MsgNetwork;
use crate::pool::{ConnHandler, ConnId, ConnMode, ConnPool, ConnRef};
use crate::protocol::{get_addr, put_addr, Envelope, Opcode, WireMsg};

pub use id::{IdentityMode, PeerId};
pub use state::PeerState;

use state::{inbound_wins, outbound_wins, Peer, PASSIVE_NONCE};

/// Jitter a base delay into `[0.75, 1.25) * base`.
fn gen_rand_timeout(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.75..1.25))
}

/// Payload of a ping or pong. A handshake variant claims the sender's
/// listen address and nonce; the empty variant is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Heartbeat {
    pub claim: Option<(SocketAddr, u32)>,
}

impl Heartbeat {
    pub fn empty() -> Self {
        Self { claim: None }
    }

    pub fn handshake(addr: SocketAddr, nonce: u32) -> Self {
        Self { claim: Some((addr, nonce)) }
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match &self.claim {
            Some((addr, nonce)) => {
                dst.put_u8(1);
                put_addr(addr, dst)?;
                dst.put_u32_le(*nonce);
            }
            None => dst.put_u8(0),
        }
        Ok(())
    }

    pub fn decode(src: &mut Bytes) -> Result<Self> {
        if src.remaining() < 1 {
            return Err(Error::Decode("empty ping payload"));
        }
        if src.get_u8() == 0 {
            return Ok(Self::empty());
        }
        let addr = get_addr(src)?;
        if src.remaining() < 4 {
            return Err(Error::Decode("truncated handshake nonce"));
        }
        let nonce = src.get_u32_le();
        Ok(Self::handshake(addr, nonce))
    }
}

/// Commands processed by the registry task.
enum PeerCmd {
    AddPeer { pid: PeerId, async_id: AsyncId },
    DelPeer { pid: PeerId, async_id: AsyncId },
    SetPeerAddr {
        pid: PeerId,
        addr: SocketAddr,
        async_id: AsyncId,
    },
    ConnPeer {
        pid: PeerId,
        ntry: i64,
        retry_delay: Duration,
        async_id: AsyncId,
    },
    Setup { conn: ConnRef },
    Teardown { conn: ConnRef },
    Ping { msg: Heartbeat, conn: ConnRef },
    Pong { msg: Heartbeat, conn: ConnRef },
    RetryTimer { pid: PeerId, epoch: u64 },
    PingTimer { pid: PeerId, epoch: u64 },
    Multicast {
        data: Bytes,
        pids: Vec<PeerId>,
        async_id: AsyncId,
    },
    NPending { reply: oneshot::Sender<usize> },
}

type PeerCb = Arc<dyn Fn(&ConnRef, bool) + Send + Sync>;
type UnknownPeerCb = Arc<dyn Fn(SocketAddr, Option<Bytes>) + Send + Sync>;

/// Peer-layer state shared between the handle and the registry task.
pub(crate) struct PeerNetInner {
    cmd_tx: mpsc::UnboundedSender<PeerCmd>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerCmd>>>,
    known_peers: RwLock<HashMap<PeerId, Peer>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    peer_cb: Mutex<Option<PeerCb>>,
    unknown_peer_cb: Mutex<Option<UnknownPeerCb>>,
    ping_period: Duration,
    conn_timeout: Duration,
    id_mode: IdentityMode,
    allow_unknown_peer: bool,
    started: AtomicBool,
}

#[async_trait]
impl ConnHandler for PeerNetInner {
    async fn on_setup(&self, conn: &ConnRef) {
        let _ = self.cmd_tx.send(PeerCmd::Setup { conn: conn.clone() });
    }

    async fn on_teardown(&self, conn: &ConnRef) {
        let _ = self.cmd_tx.send(PeerCmd::Teardown { conn: conn.clone() });
    }
}

/// Peer-to-peer overlay over a [`MsgNetwork`]. Cheap to clone.
pub struct PeerNetwork<O: Opcode> {
    msg: MsgNetwork<O>,
    inner: Arc<PeerNetInner>,
    ping_opcode: O,
    pong_opcode: O,
}

impl<O: Opcode> Clone for PeerNetwork<O> {
    fn clone(&self) -> Self {
        Self {
            msg: self.msg.clone(),
            inner: self.inner.clone(),
            ping_opcode: self.ping_opcode,
            pong_opcode: self.pong_opcode,
        }
    }
}

impl<O: Opcode> PeerNetwork<O> {
    /// Create a peer network with the given configuration.
    pub fn new(cfg: PeerNetworkConfig<O>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PeerNetInner {
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            known_peers: RwLock::new(HashMap::new()),
            listen_addr: Mutex::new(None),
            peer_cb: Mutex::new(None),
            unknown_peer_cb: Mutex::new(None),
            ping_period: cfg.ping_period,
            conn_timeout: cfg.conn_timeout,
            id_mode: cfg.id_mode,
            allow_unknown_peer: cfg.allow_unknown_peer,
            started: AtomicBool::new(false),
        });

        let msg = MsgNetwork::new(cfg.msg);
        let _ = msg.inner.upper.set(inner.clone());

        let net = Self {
            msg,
            inner,
            ping_opcode: cfg.ping_opcode,
            pong_opcode: cfg.pong_opcode,
        };

        let tx = net.inner.cmd_tx.clone();
        net.msg.reg_handler(cfg.ping_opcode, move |env: Envelope<O>, conn| {
            let decoded = Heartbeat::decode(&mut env.payload().clone());
            let tx = tx.clone();
            async move {
                match decoded {
                    Ok(msg) => {
                        let _ = tx.send(PeerCmd::Ping { msg, conn });
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed ping, dropping"),
                }
            }
        });

        let tx = net.inner.cmd_tx.clone();
        net.msg.reg_handler(cfg.pong_opcode, move |env: Envelope<O>, conn| {
            let decoded = Heartbeat::decode(&mut env.payload().clone());
            let tx = tx.clone();
            async move {
                match decoded {
                    Ok(msg) => {
                        let _ = tx.send(PeerCmd::Pong { msg, conn });
                    }
                    Err(e) => tracing::warn!(error = %e, "malformed pong, dropping"),
                }
            }
        });

        net
    }

    /// Start the network and the registry task. Idempotent.
    pub fn start(&self) {
        self.msg.start();
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(rx) = self.inner.cmd_rx.lock().unwrap().take() {
            let registry = Registry {
                net: self.msg.clone(),
                inner: self.inner.clone(),
                ping_opcode: self.ping_opcode,
                pong_opcode: self.pong_opcode,
                pending_peers: HashMap::new(),
                conn_peers: HashMap::new(),
            };
            let task = tokio::spawn(registry.run(rx));
            self.msg.pool().shared().tasks.lock().unwrap().push(task);
        }
    }

    /// Stop the network and the layers beneath it.
    pub async fn stop(&self) {
        self.msg.stop().await;
    }

    /// Listen for passive connections; the bound address is what
    /// handshake pings claim from now on.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let bound = self.msg.listen(addr).await?;
        *self.inner.listen_addr.lock().unwrap() = Some(bound);
        Ok(bound)
    }

    /// Register a peer id. `PEER_ALREADY_EXISTS` is reported through the
    /// error callback with the returned async-id.
    pub fn add_peer(&self, pid: PeerId) -> AsyncId {
        let async_id = gen_async_id();
        let _ = self.inner.cmd_tx.send(PeerCmd::AddPeer { pid, async_id });
        async_id
    }

    /// Unregister a peer, terminating its chosen connection.
    pub fn del_peer(&self, pid: PeerId) -> AsyncId {
        let async_id = gen_async_id();
        let _ = self.inner.cmd_tx.send(PeerCmd::DelPeer { pid, async_id });
        async_id
    }

    /// Set the peer's remote listen address. Must precede
    /// [`conn_peer`](Self::conn_peer).
    pub fn set_peer_addr(&self, pid: PeerId, addr: SocketAddr) -> AsyncId {
        let async_id = gen_async_id();
        let _ = self.inner.cmd_tx.send(PeerCmd::SetPeerAddr { pid, addr, async_id });
        async_id
    }

    /// Start (or reset) active connection attempts to a peer.
    /// `ntry` of -1 retries forever, 0 disables retries; otherwise the
    /// budget is decremented on every teardown.
    pub fn conn_peer(&self, pid: PeerId, ntry: i64, retry_delay: Duration) -> AsyncId {
        let async_id = gen_async_id();
        let _ = self.inner.cmd_tx.send(PeerCmd::ConnPeer {
            pid,
            ntry,
            retry_delay,
            async_id,
        });
        async_id
    }

    /// Whether a peer id is registered.
    pub async fn has_peer(&self, pid: &PeerId) -> bool {
        self.inner.known_peers.read().await.contains_key(pid)
    }

    /// The peer's current connection, if any.
    pub async fn get_peer_conn(&self, pid: &PeerId) -> Result<Option<ConnRef>> {
        match self.inner.known_peers.read().await.get(pid) {
            Some(p) => Ok(p.conn.clone()),
            None => Err(Error::PeerNotExist),
        }
    }

    /// Number of connections that have not completed their handshake.
    pub async fn get_npending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(PeerCmd::NPending { reply: tx }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Send a message to a peer. `Ok(false)` means the peer has no
    /// usable connection.
    pub async fn send_msg<M: WireMsg<O>>(&self, msg: &M, pid: &PeerId) -> Result<bool> {
        let env = Envelope::pack(msg, self.msg_magic());
        let peers = self.inner.known_peers.read().await;
        let peer = peers.get(pid).ok_or(Error::PeerNotExist)?;
        match &peer.conn {
            Some(conn) if !conn.is_terminated() => Ok(conn.write(env.to_bytes()).await),
            _ => Ok(false),
        }
    }

    /// Deferred send; failures surface as `CONN_NOT_READY` (or
    /// `PEER_NOT_EXIST`) through the error callback.
    pub fn send_msg_deferred<M: WireMsg<O> + Sync>(&self, msg: M, pid: PeerId) -> AsyncId {
        let async_id = gen_async_id();
        let net = self.clone();
        tokio::spawn(async move {
            let result = net.send_msg(&msg, &pid).await;
            let err = match result {
                Ok(true) => None,
                Ok(false) => Some(Error::ConnNotReady),
                Err(e) => Some(e),
            };
            if let Some(e) = err {
                net.msg.pool().shared().report_error(e, false, async_id);
            }
        });
        async_id
    }

    /// Serialize once and enqueue to every listed peer. Unresolved
    /// peers surface a recoverable error tagged with the returned id.
    pub fn multicast_msg<M: WireMsg<O>>(&self, msg: &M, pids: &[PeerId]) -> AsyncId {
        let async_id = gen_async_id();
        let env = Envelope::pack(msg, self.msg_magic());
        let _ = self.inner.cmd_tx.send(PeerCmd::Multicast {
            data: env.to_bytes(),
            pids: pids.to_vec(),
            async_id,
        });
        async_id
    }

    /// Register a raw opcode handler. See [`MsgNetwork::reg_handler`].
    pub fn reg_handler<F, Fut>(&self, opcode: O, handler: F)
    where
        F: Fn(Envelope<O>, ConnRef) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.msg.reg_handler(opcode, handler);
    }

    /// Register a typed handler. See [`MsgNetwork::reg_msg_handler`].
    pub fn reg_msg_handler<M, F, Fut>(&self, handler: F)
    where
        M: WireMsg<O>,
        F: Fn(M, ConnRef) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.msg.reg_msg_handler(handler);
    }

    /// Register the peer status callback: fires with `true` once a
    /// handshake completes and `false` when the chosen connection dies.
    pub fn reg_peer_handler(&self, cb: impl Fn(&ConnRef, bool) + Send + Sync + 'static) {
        *self.inner.peer_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Register the unknown-peer callback, fired when a handshake names
    /// an unregistered peer.
    pub fn reg_unknown_peer_handler(
        &self,
        cb: impl Fn(SocketAddr, Option<Bytes>) + Send + Sync + 'static,
    ) {
        *self.inner.unknown_peer_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Register the connection status callback.
    pub fn reg_conn_handler(&self, cb: impl Fn(&ConnRef, bool) + Send + Sync + 'static) {
        self.msg.reg_conn_handler(cb);
    }

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&Error, bool, AsyncId) + Send + Sync + 'static,
    ) {
        self.msg.reg_error_handler(cb);
    }

    /// The underlying message network.
    pub fn msg_network(&self) -> &MsgNetwork<O> {
        &self.msg
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &ConnPool {
        self.msg.pool()
    }

    fn msg_magic(&self) -> u32 {
        self.msg.magic()
    }
}

/// State owned by the registry task: the pending-connection map and the
/// connection-to-peer back-pointers, plus handles to everything below.
struct Registry<O: Opcode> {
    net: MsgNetwork<O>,
    inner: Arc<PeerNetInner>,
    ping_opcode: O,
    pong_opcode: O,
    /// Connections that have not completed a handshake, by remote address.
    pending_peers: HashMap<SocketAddr, ConnRef>,
    /// Which peer a connection belongs to (chosen connections and
    /// outbound candidates).
    conn_peers: HashMap<ConnId, PeerId>,
}

impl<O: Opcode> Registry<O> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerCmd>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
    }

    async fn handle(&mut self, cmd: PeerCmd) {
        match cmd {
            PeerCmd::AddPeer { pid, async_id } => {
                let mut peers = self.inner.known_peers.write().await;
                if peers.contains_key(&pid) {
                    drop(peers);
                    self.recoverable(Error::PeerAlreadyExists, async_id);
                } else {
                    peers.insert(pid, Peer::new(pid));
                    tracing::info!(peer = %pid, "peer registered");
                }
            }

            PeerCmd::DelPeer { pid, async_id } => {
                let mut peers = self.inner.known_peers.write().await;
                match peers.remove(&pid) {
                    None => {
                        drop(peers);
                        self.recoverable(Error::PeerNotExist, async_id);
                    }
                    Some(p) => {
                        drop(peers);
                        if let Some(conn) = &p.conn {
                            self.terminate(conn);
                        }
                        self.conn_peers.retain(|_, owner| *owner != pid);
                        if let Some(addr) = p.addr {
                            if let Some(conn) = self.pending_peers.remove(&addr) {
                                if !self.conn_peers.contains_key(&conn.id()) {
                                    self.terminate(&conn);
                                }
                            }
                        }
                        tracing::info!(peer = %pid, "peer removed");
                    }
                }
            }

            PeerCmd::SetPeerAddr { pid, addr, async_id } => {
                let mut peers = self.inner.known_peers.write().await;
                match peers.get_mut(&pid) {
                    Some(p) => p.addr = Some(addr),
                    None => {
                        drop(peers);
                        self.recoverable(Error::PeerNotExist, async_id);
                    }
                }
            }

            PeerCmd::ConnPeer { pid, ntry, retry_delay, async_id } => {
                let inner = self.inner.clone();
                let mut peers = inner.known_peers.write().await;
                let p = match peers.get_mut(&pid) {
                    Some(p) => p,
                    None => {
                        drop(peers);
                        self.recoverable(Error::PeerNotExist, async_id);
                        return;
                    }
                };
                if p.addr.is_none() {
                    drop(peers);
                    self.recoverable(Error::PeerNotReady, async_id);
                    return;
                }
                p.ntry = ntry;
                p.retry_delay = retry_delay;
                if let Some(c) = p.inbound_conn.take() {
                    self.conn_peers.remove(&c.id());
                }
                if let Some(c) = p.outbound_conn.take() {
                    self.conn_peers.remove(&c.id());
                }
                p.clear_ping_timer();
                // A reset supersedes any retry schedule still armed
                // from an earlier teardown
                p.clear_retry_timer();
                p.nonce = 0;
                if p.conn.is_none() || p.state == PeerState::Disconnected {
                    self.start_active_conn(p, pid).await;
                } else if p.state == PeerState::Connected {
                    // Terminate the established connection first; the
                    // teardown path re-initiates immediately.
                    p.state = PeerState::Reset;
                    if let Some(conn) = p.conn.clone() {
                        self.terminate(&conn);
                    }
                }
            }

            PeerCmd::Setup { conn } => self.handle_setup(conn).await,
            PeerCmd::Teardown { conn } => self.handle_teardown(conn).await,

            PeerCmd::Ping { msg, conn } => {
                if conn.is_terminated() {
                    return;
                }
                match msg.claim {
                    Some((claimed_addr, nonce)) => {
                        self.handshake_ping(claimed_addr, nonce, conn).await;
                    }
                    None => {
                        tracing::debug!(conn = %conn, "ping");
                        self.send_empty(self.pong_opcode, &conn).await;
                    }
                }
            }

            PeerCmd::Pong { msg, conn } => {
                if conn.is_terminated() {
                    return;
                }
                match msg.claim {
                    Some((claimed_addr, nonce)) => {
                        self.handshake_pong(claimed_addr, nonce, conn).await;
                    }
                    None => self.heartbeat_pong(conn).await,
                }
            }

            PeerCmd::RetryTimer { pid, epoch } => {
                let inner = self.inner.clone();
                let mut peers = inner.known_peers.write().await;
                let p = match peers.get_mut(&pid) {
                    Some(p) => p,
                    None => return,
                };
                if p.retry_epoch != epoch || p.state != PeerState::Disconnected {
                    return;
                }
                tracing::debug!(peer = %pid, "retrying connection");
                self.start_active_conn(p, pid).await;
            }

            PeerCmd::PingTimer { pid, epoch } => {
                let mut peers = self.inner.known_peers.write().await;
                let p = match peers.get_mut(&pid) {
                    Some(p) => p,
                    None => return,
                };
                if p.ping_epoch != epoch {
                    return;
                }
                p.ping_timer_ok = true;
                if p.pong_msg_ok {
                    self.reset_ping_timer(p, pid);
                    self.send_ping(p).await;
                }
            }

            PeerCmd::Multicast { data, pids, async_id } => {
                // Best-effort fan-out: every resolved peer gets the
                // bytes; the first failure is what gets reported.
                let peers = self.inner.known_peers.read().await;
                let mut err: Option<Error> = None;
                for pid in &pids {
                    match peers.get(pid) {
                        Some(p) => {
                            let sent = match &p.conn {
                                Some(c) if !c.is_terminated() => c.write(data.clone()).await,
                                _ => false,
                            };
                            if !sent && err.is_none() {
                                err = Some(Error::ConnNotReady);
                            }
                        }
                        None => {
                            if err.is_none() {
                                err = Some(Error::PeerNotExist);
                            }
                        }
                    }
                }
                drop(peers);
                if let Some(e) = err {
                    self.recoverable(e, async_id);
                }
            }

            PeerCmd::NPending { reply } => {
                let _ = reply.send(self.pending_peers.len());
            }
        }
    }

    /// A connection finished pool-level setup.
    async fn handle_setup(&mut self, conn: ConnRef) {
        conn.reset_timeout(self.inner.conn_timeout);
        self.replace_pending_conn(&conn);

        if conn.mode() == ConnMode::Active {
            let pid = self.peer_id_for(&conn, conn.addr());
            let mut peers = self.inner.known_peers.write().await;
            match peers.get_mut(&pid) {
                Some(p) => {
                    let nonce = match p.get_nonce() {
                        Ok(n) => n,
                        Err(e) => {
                            drop(peers);
                            self.fatal(e);
                            return;
                        }
                    };
                    drop(peers);
                    self.send_handshake(self.ping_opcode, &conn, nonce).await;
                }
                None => {
                    drop(peers);
                    tracing::warn!(conn = %conn, "outbound connection to unregistered peer");
                    self.terminate(&conn);
                }
            }
        }
    }

    /// The passive side of the handshake: reply with our nonce and keep
    /// the inbound connection iff the tie-break favors it.
    async fn handshake_ping(&mut self, claimed_addr: SocketAddr, nonce: u32, conn: ConnRef) {
        if conn.mode() != ConnMode::Passive {
            tracing::warn!(conn = %conn, "unexpected inbound handshake");
            return;
        }

        let pid = self.peer_id_for(&conn, claimed_addr);
        let inner = self.inner.clone();
        let mut peers = inner.known_peers.write().await;

        if !peers.contains_key(&pid) {
            self.user_unknown_peer(claimed_addr, conn.peer_cert().cloned());
            if self.inner.allow_unknown_peer {
                tracing::info!(peer = %pid, addr = %claimed_addr, "admitting unknown peer");
                peers.insert(pid, Peer::new(pid));
            } else {
                drop(peers);
                self.terminate(&conn);
                return;
            }
        }

        let p = match peers.get_mut(&pid) {
            Some(p) => p,
            None => return,
        };
        if p.state != PeerState::Disconnected
            || (p.addr.is_some() && p.addr != Some(claimed_addr))
        {
            return;
        }
        tracing::info!(conn = %conn, peer = %pid, "inbound handshake");

        let own_nonce = match p.get_nonce() {
            Ok(n) => n,
            Err(e) => {
                drop(peers);
                self.fatal(e);
                return;
            }
        };
        let addr_known = p.addr.is_some();
        // The never-initiated side answers with a fixed nonce; the
        // comparison below accepts the inbound connection regardless.
        let reply_nonce = if addr_known { own_nonce } else { PASSIVE_NONCE };
        self.send_handshake(self.pong_opcode, &conn, reply_nonce).await;

        if let Some(old) = p.inbound_conn.take() {
            if old.id() != conn.id() {
                tracing::debug!(conn = %old, "terminating stale handshake connection");
                self.terminate(&old);
            }
        }
        p.inbound_conn = Some(conn.clone());

        if inbound_wins(nonce, own_nonce, addr_known) {
            tracing::debug!(conn = %conn, "inbound connection chosen");
            p.chosen_conn = Some(conn.clone());
            self.finish_handshake(p, pid).await;
        } else {
            tracing::debug!(incoming = nonce, own = own_nonce, "inbound handshake lost");
            drop(peers);
            self.terminate(&conn);
        }
    }

    /// The active side of the handshake: mirror comparison on the pong.
    async fn handshake_pong(&mut self, claimed_addr: SocketAddr, nonce: u32, conn: ConnRef) {
        if conn.mode() != ConnMode::Active {
            tracing::warn!(conn = %conn, "unexpected outbound handshake");
            return;
        }

        let pid = self.peer_id_for(&conn, conn.addr());
        let inner = self.inner.clone();
        let mut peers = inner.known_peers.write().await;
        let p = match peers.get_mut(&pid) {
            Some(p) => p,
            None => {
                drop(peers);
                tracing::warn!(conn = %conn, "pong from an unknown peer");
                self.terminate(&conn);
                return;
            }
        };
        if p.state != PeerState::Disconnected || p.addr != Some(claimed_addr) {
            return;
        }
        tracing::info!(conn = %conn, peer = %pid, "outbound handshake");

        if let Some(old) = p.outbound_conn.take() {
            if old.id() != conn.id() {
                tracing::debug!(conn = %old, "terminating stale handshake connection");
                self.conn_peers.remove(&old.id());
                self.terminate(&old);
            }
        }
        p.outbound_conn = Some(conn.clone());
        self.conn_peers.insert(conn.id(), pid);

        let own_nonce = match p.get_nonce() {
            Ok(n) => n,
            Err(e) => {
                drop(peers);
                self.fatal(e);
                return;
            }
        };
        if outbound_wins(own_nonce, nonce) {
            tracing::debug!(conn = %conn, "outbound connection chosen");
            p.chosen_conn = Some(conn.clone());
            self.finish_handshake(p, pid).await;
        } else {
            // Force a fresh draw for the next round
            tracing::debug!(own = own_nonce, incoming = nonce, "outbound handshake lost");
            p.nonce = 0;
            drop(peers);
            self.terminate(&conn);
        }
    }

    async fn heartbeat_pong(&mut self, conn: ConnRef) {
        let pid = match self.conn_peers.get(&conn.id()) {
            Some(pid) => *pid,
            None => {
                tracing::warn!(conn = %conn, "unexpected pong");
                return;
            }
        };
        let mut peers = self.inner.known_peers.write().await;
        let p = match peers.get_mut(&pid) {
            Some(p) => p,
            None => return,
        };
        p.pong_msg_ok = true;
        if p.ping_timer_ok {
            self.reset_ping_timer(p, pid);
            self.send_ping(p).await;
        }
    }

    /// The winning side commits to its chosen connection.
    async fn finish_handshake(&mut self, p: &mut Peer, pid: PeerId) {
        debug_assert_eq!(p.state, PeerState::Disconnected);
        let chosen = match p.chosen_conn.clone() {
            Some(c) => c,
            None => return,
        };

        p.clear_ping_timer();
        p.clear_retry_timer();
        if let Some(oc) = &p.outbound_conn {
            if oc.id() != chosen.id() {
                self.conn_peers.remove(&oc.id());
            }
        }
        p.state = PeerState::Connected;

        if let Some(old) = p.conn.take() {
            if old.id() != chosen.id() {
                // Carry over whatever the dead connection never flushed
                for seg in old.take_unsent() {
                    chosen.write(seg).await;
                }
                self.conn_peers.remove(&old.id());
            }
        }
        p.conn = Some(chosen.clone());
        self.conn_peers.insert(chosen.id(), pid);

        self.reset_ping_timer(p, pid);
        self.send_ping(p).await;
        self.user_peer_event(&chosen, true);
        self.pending_peers.remove(&chosen.addr());
        tracing::info!(peer = %pid, conn = %chosen, "peer connection established");
    }

    /// A connection was dropped from the pool.
    async fn handle_teardown(&mut self, conn: ConnRef) {
        self.pending_peers.remove(&conn.addr());
        let pid = match self.conn_peers.get(&conn.id()) {
            Some(pid) => *pid,
            None => return,
        };
        let mut peers = self.inner.known_peers.write().await;
        let p = match peers.get_mut(&pid) {
            Some(p) => p,
            None => {
                self.conn_peers.remove(&conn.id());
                return;
            }
        };

        let was_reset = p.state == PeerState::Reset;
        let was_chosen = p.conn.as_ref().map(|c| c.id()) == Some(conn.id());
        if was_chosen {
            tracing::info!(peer = %pid, conn = %conn, "peer connection lost");
            p.state = PeerState::Disconnected;
            p.inbound_conn = None;
            if let Some(oc) = p.outbound_conn.take() {
                if oc.id() != conn.id() {
                    self.conn_peers.remove(&oc.id());
                }
            }
            p.chosen_conn = None;
            p.clear_ping_timer();
            p.nonce = 0;
            // p.conn keeps pointing at the dead connection so a
            // successor can take over its unsent bytes
            self.user_peer_event(&conn, false);
        } else {
            if p.outbound_conn.as_ref().map(|c| c.id()) == Some(conn.id()) {
                p.outbound_conn = None;
            }
            if p.inbound_conn.as_ref().map(|c| c.id()) == Some(conn.id()) {
                p.inbound_conn = None;
            }
            self.conn_peers.remove(&conn.id());
        }

        if p.ntry > 0 {
            p.ntry -= 1;
        }
        if p.ntry != 0 && p.state == PeerState::Disconnected && p.addr.is_some() {
            let delay = if was_reset {
                Duration::ZERO
            } else {
                gen_rand_timeout(p.retry_delay)
            };
            self.arm_retry(p, pid, delay);
        }
    }

    /// Initiate an outbound attempt to the peer's recorded address.
    async fn start_active_conn(&mut self, p: &mut Peer, pid: PeerId) {
        let addr = match p.addr {
            Some(addr) => addr,
            None => return,
        };
        let conn = match self.net.connect(addr).await {
            Ok(conn) => conn,
            Err(e) => {
                self.recoverable(e, 0);
                return;
            }
        };
        if let Some(old) = p.outbound_conn.replace(conn.clone()) {
            if old.id() != conn.id() {
                self.conn_peers.remove(&old.id());
            }
        }
        self.conn_peers.insert(conn.id(), pid);
        self.replace_pending_conn(&conn);
    }

    /// Track a connection awaiting handshake; at most one per address.
    fn replace_pending_conn(&mut self, conn: &ConnRef) {
        let addr = conn.addr();
        if let Some(old) = self.pending_peers.get(&addr) {
            if old.id() != conn.id() {
                let old = old.clone();
                tracing::debug!(conn = %old, "terminating stale pending connection");
                self.terminate(&old);
            }
        }
        self.pending_peers.insert(addr, conn.clone());
    }

    fn peer_id_for(&self, conn: &ConnRef, addr: SocketAddr) -> PeerId {
        match self.inner.id_mode {
            IdentityMode::AddrBased => PeerId::from_addr(&addr),
            IdentityMode::CertBased => match conn.peer_cert() {
                Some(der) => PeerId::from_cert_der(der),
                None => PeerId::from_addr(&addr),
            },
        }
    }

    async fn send_handshake(&self, opcode: O, conn: &ConnRef, nonce: u32) {
        let listen_addr = self
            .inner
            .listen_addr
            .lock()
            .unwrap()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let hb = Heartbeat::handshake(listen_addr, nonce);
        let mut payload = BytesMut::new();
        if let Err(e) = hb.encode(&mut payload) {
            tracing::warn!(error = %e, "cannot encode handshake");
            return;
        }
        let env = self.net.envelope(opcode, payload.freeze());
        self.net.send_envelope(&env, conn).await;
    }

    async fn send_empty(&self, opcode: O, conn: &ConnRef) {
        let mut payload = BytesMut::new();
        let _ = Heartbeat::empty().encode(&mut payload);
        let env = self.net.envelope(opcode, payload.freeze());
        self.net.send_envelope(&env, conn).await;
    }

    /// Send a heartbeat ping and re-arm the connection's idle timeout.
    async fn send_ping(&self, p: &mut Peer) {
        p.ping_timer_ok = false;
        p.pong_msg_ok = false;
        if let Some(conn) = p.chosen_conn.clone() {
            conn.reset_timeout(self.inner.conn_timeout);
            self.send_empty(self.ping_opcode, &conn).await;
        }
    }

    fn reset_ping_timer(&self, p: &mut Peer, pid: PeerId) {
        p.clear_ping_timer();
        let epoch = p.ping_epoch;
        let delay = gen_rand_timeout(self.inner.ping_period);
        let tx = self.inner.cmd_tx.clone();
        p.ping_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PeerCmd::PingTimer { pid, epoch });
        }));
    }

    fn arm_retry(&self, p: &mut Peer, pid: PeerId, delay: Duration) {
        p.clear_retry_timer();
        let epoch = p.retry_epoch;
        let tx = self.inner.cmd_tx.clone();
        p.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(PeerCmd::RetryTimer { pid, epoch });
        }));
    }

    fn terminate(&self, conn: &ConnRef) {
        self.net.terminate(conn);
    }

    fn recoverable(&self, err: Error, async_id: AsyncId) {
        self.net.pool().shared().report_error(err, false, async_id);
    }

    fn fatal(&self, err: Error) {
        self.net.pool().shared().report_error(err, true, 0);
    }

    fn user_peer_event(&self, conn: &ConnRef, connected: bool) {
        if let Some(cb) = self.inner.peer_cb.lock().unwrap().clone() {
            let conn = conn.clone();
            self.net.pool().shared().user_call(move || cb(&conn, connected));
        }
    }

    fn user_unknown_peer(&self, addr: SocketAddr, cert: Option<Bytes>) {
        if let Some(cb) = self.inner.unknown_peer_cb.lock().unwrap().clone() {
            self.net.pool().shared().user_call(move || cb(addr, cert));
        }
    }
}
