//! Connection handle and layer hooks.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Notify};

use crate::error::Result;

/// Shared handle to a connection.
pub type ConnRef = Arc<Connection>;

/// Worker slot index meaning "not yet assigned".
pub(crate) const WORKER_UNASSIGNED: usize = usize::MAX;

/// Unique identifier of a connection within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// How a connection came to exist, and whether it still does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnMode {
    /// Established by `connect()`.
    Active,
    /// Established by `accept()`.
    Passive,
    /// Terminated. Terminal state.
    Dead,
}

impl ConnMode {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnMode::Active,
            1 => ConnMode::Passive,
            _ => ConnMode::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnMode::Active => 0,
            ConnMode::Passive => 1,
            ConnMode::Dead => 2,
        }
    }
}

impl fmt::Display for ConnMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnMode::Active => write!(f, "active"),
            ConnMode::Passive => write!(f, "passive"),
            ConnMode::Dead => write!(f, "dead"),
        }
    }
}

/// Control messages delivered to a connection's I/O task.
#[derive(Debug)]
pub(crate) enum ConnCtrl {
    /// Stop the I/O task, turning the connection dead.
    Terminate,
    /// Arm (or re-arm) the idle timeout with the given duration.
    ResetTimeout(Duration),
}

/// Sender side of the per-connection send queue.
enum SendQueueTx {
    Bounded(mpsc::Sender<Bytes>),
    Unbounded(mpsc::UnboundedSender<Bytes>),
}

/// Receiver side, taken by the I/O task.
pub(crate) enum SendQueueRx {
    Bounded(mpsc::Receiver<Bytes>),
    Unbounded(mpsc::UnboundedReceiver<Bytes>),
}

impl SendQueueRx {
    pub(crate) async fn recv(&mut self) -> Option<Bytes> {
        match self {
            SendQueueRx::Bounded(rx) => rx.recv().await,
            SendQueueRx::Unbounded(rx) => rx.recv().await,
        }
    }

    pub(crate) fn try_recv(&mut self) -> Option<Bytes> {
        match self {
            SendQueueRx::Bounded(rx) => rx.try_recv().ok(),
            SendQueueRx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    pub(crate) fn close(&mut self) {
        match self {
            SendQueueRx::Bounded(rx) => rx.close(),
            SendQueueRx::Unbounded(rx) => rx.close(),
        }
    }
}

/// A bi-directional connection owned by a [`ConnPool`](crate::pool::ConnPool).
///
/// The pool keeps the authoritative reference in its connection table
/// until teardown; embedders hold cheap clones. Writes are safe from any
/// task and are flushed by the connection's single I/O task.
pub struct Connection {
    id: ConnId,
    addr: SocketAddr,
    mode: AtomicU8,
    /// Index of the worker slot this connection is charged to.
    pub(crate) worker: AtomicUsize,
    /// Guards the one-shot teardown path.
    torn_down: AtomicBool,
    /// Set while the receive path is suspended; control and write
    /// paths keep running.
    read_paused: AtomicBool,
    read_resume: Notify,
    send_tx: SendQueueTx,
    pub(crate) send_rx: Mutex<Option<SendQueueRx>>,
    ctrl_tx: mpsc::UnboundedSender<ConnCtrl>,
    pub(crate) ctrl_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnCtrl>>>,
    /// Segments recovered from the send queue when the I/O task exits.
    unsent: Mutex<VecDeque<Bytes>>,
    /// DER certificate of the remote end, attached by a TLS adapter.
    peer_cert: OnceLock<Bytes>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        addr: SocketAddr,
        mode: ConnMode,
        queue_capacity: usize,
    ) -> ConnRef {
        let (send_tx, send_rx) = if queue_capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (SendQueueTx::Unbounded(tx), SendQueueRx::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(queue_capacity);
            (SendQueueTx::Bounded(tx), SendQueueRx::Bounded(rx))
        };
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            id,
            addr,
            mode: AtomicU8::new(mode.as_u8()),
            worker: AtomicUsize::new(WORKER_UNASSIGNED),
            torn_down: AtomicBool::new(false),
            read_paused: AtomicBool::new(false),
            read_resume: Notify::new(),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            ctrl_tx,
            ctrl_rx: Mutex::new(Some(ctrl_rx)),
            unsent: Mutex::new(VecDeque::new()),
            peer_cert: OnceLock::new(),
        })
    }

    /// The connection's pool-unique id.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// The remote address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current mode.
    pub fn mode(&self) -> ConnMode {
        ConnMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// Whether the connection has been terminated.
    pub fn is_terminated(&self) -> bool {
        self.mode() == ConnMode::Dead
    }

    pub(crate) fn set_mode(&self, mode: ConnMode) {
        self.mode.store(mode.as_u8(), Ordering::Release);
    }

    /// First caller wins the right to run teardown.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }

    /// Index of the worker slot driving this connection, if assigned.
    pub fn worker_index(&self) -> Option<usize> {
        match self.worker.load(Ordering::Acquire) {
            WORKER_UNASSIGNED => None,
            idx => Some(idx),
        }
    }

    /// Queue bytes for sending. Returns `false` once the connection is
    /// dead. With a bounded queue this waits for space.
    pub async fn write(&self, data: Bytes) -> bool {
        match &self.send_tx {
            SendQueueTx::Bounded(tx) => tx.send(data).await.is_ok(),
            SendQueueTx::Unbounded(tx) => tx.send(data).is_ok(),
        }
    }

    pub(crate) fn ctrl(&self, msg: ConnCtrl) {
        let _ = self.ctrl_tx.send(msg);
    }

    /// Suspend the receive path. Reads stay off until
    /// [`resume_reads`](Self::resume_reads) fires.
    pub(crate) fn pause_reads(&self) {
        self.read_paused.store(true, Ordering::Release);
    }

    /// Resume the receive path and wake the I/O task so buffered
    /// frames are processed without waiting for new socket data.
    pub(crate) fn resume_reads(&self) {
        self.read_paused.store(false, Ordering::Release);
        self.read_resume.notify_one();
    }

    pub(crate) fn reads_paused(&self) -> bool {
        self.read_paused.load(Ordering::Acquire)
    }

    /// Completes on the next [`resume_reads`](Self::resume_reads).
    pub(crate) async fn read_resumed(&self) {
        self.read_resume.notified().await;
    }

    /// Arm or re-arm the connection's idle timeout.
    pub fn reset_timeout(&self, timeout: Duration) {
        self.ctrl(ConnCtrl::ResetTimeout(timeout));
    }

    /// Attach the remote end's DER certificate. Intended for TLS
    /// adapters layered over the pool; first write wins.
    pub fn set_peer_cert(&self, der: Bytes) {
        let _ = self.peer_cert.set(der);
    }

    /// The remote end's DER certificate, if one was attached.
    pub fn peer_cert(&self) -> Option<&Bytes> {
        self.peer_cert.get()
    }

    pub(crate) fn stash_unsent(&self, data: Bytes) {
        self.unsent.lock().unwrap().push_back(data);
    }

    /// Drain the segments that were still queued when the connection
    /// died, preserving order.
    pub(crate) fn take_unsent(&self) -> Vec<Bytes> {
        self.unsent.lock().unwrap().drain(..).collect()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {} {}>", self.id, self.addr, self.mode())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("mode", &self.mode())
            .finish()
    }
}

/// Hooks a layer installs on the pool.
///
/// Each layer delegates to the one beneath it before running its own
/// logic; `on_read` is only meaningful for the innermost framing layer.
#[async_trait]
pub trait ConnHandler: Send + Sync + 'static {
    /// The connection finished its setup and is about to carry traffic.
    async fn on_setup(&self, conn: &ConnRef);

    /// The connection was torn down. Fires exactly once.
    async fn on_teardown(&self, conn: &ConnRef);

    /// Bytes arrived; consume complete frames from `buf`. Returning an
    /// error terminates the connection.
    async fn on_read(&self, _conn: &ConnRef, _buf: &mut BytesMut) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(capacity: usize) -> ConnRef {
        Connection::new(
            ConnId(1),
            "127.0.0.1:9001".parse().unwrap(),
            ConnMode::Active,
            capacity,
        )
    }

    #[tokio::test]
    async fn test_write_and_drain() {
        let c = conn(0);
        assert!(c.write(Bytes::from_static(b"a")).await);
        assert!(c.write(Bytes::from_static(b"b")).await);

        let mut rx = c.send_rx.lock().unwrap().take().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"b"));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_write_fails_after_close() {
        let c = conn(0);
        let mut rx = c.send_rx.lock().unwrap().take().unwrap();
        rx.close();
        assert!(!c.write(Bytes::from_static(b"late")).await);
    }

    #[test]
    fn test_mode_transitions() {
        let c = conn(0);
        assert_eq!(c.mode(), ConnMode::Active);
        assert!(!c.is_terminated());

        c.set_mode(ConnMode::Dead);
        assert!(c.is_terminated());
    }

    #[test]
    fn test_teardown_runs_once() {
        let c = conn(0);
        assert!(c.begin_teardown());
        assert!(!c.begin_teardown());
    }

    #[test]
    fn test_unsent_stash_order() {
        let c = conn(0);
        c.stash_unsent(Bytes::from_static(b"1"));
        c.stash_unsent(Bytes::from_static(b"2"));

        let drained = c.take_unsent();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], Bytes::from_static(b"1"));
        assert_eq!(drained[1], Bytes::from_static(b"2"));
        assert!(c.take_unsent().is_empty());
    }

    #[tokio::test]
    async fn test_read_pause_resume() {
        let c = conn(0);
        assert!(!c.reads_paused());

        c.pause_reads();
        assert!(c.reads_paused());

        let waiter = {
            let c = c.clone();
            tokio::spawn(async move { c.read_resumed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        c.resume_reads();

        assert!(!c.reads_paused());
        waiter.await.unwrap();
    }

    #[test]
    fn test_peer_cert_first_write_wins() {
        let c = conn(0);
        assert!(c.peer_cert().is_none());
        c.set_peer_cert(Bytes::from_static(b"der-1"));
        c.set_peer_cert(Bytes::from_static(b"der-2"));
        assert_eq!(c.peer_cert().unwrap(), &Bytes::from_static(b"der-1"));
    }

    #[test]
    fn test_display() {
        let c = conn(0);
        assert_eq!(format!("{}", c), "<conn-1 127.0.0.1:9001 active>");
    }
}
