//! Connection pool: lifecycle management for accepted and initiated
//! connections.
//!
//! A single dispatcher task owns the connection table, the listener and
//! the worker accounting, and processes every pool-level command
//! (connect, listen, terminate, teardown). Each live connection is
//! driven by one I/O task charged against a worker slot. Callbacks
//! registered by the embedder run on a dedicated user-callback task.

pub mod conn;
pub(crate) mod worker;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ConnPoolConfig;
use crate::error::{gen_async_id, AsyncId, Error, Result};

pub use conn::{ConnHandler, ConnId, ConnMode, ConnRef, Connection};

use conn::ConnCtrl;
use worker::{select_worker, WorkerSlot};

/// Commands processed by the dispatcher task.
pub(crate) enum DispCmd {
    /// Create an outbound connection.
    Connect {
        addr: SocketAddr,
        reply: Option<oneshot::Sender<Result<ConnRef>>>,
        async_id: AsyncId,
    },
    /// Bind a listener and start accepting.
    Listen {
        addr: SocketAddr,
        reply: oneshot::Sender<Result<SocketAddr>>,
    },
    /// An outbound TCP connect completed.
    ConnectDone { conn: ConnRef, stream: TcpStream },
    /// An outbound TCP connect failed.
    ConnectFailed {
        conn: ConnRef,
        err: Error,
        async_id: AsyncId,
    },
    /// An inbound connection was accepted.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// Terminate a connection.
    Terminate { conn: ConnRef },
    /// A connection's I/O task exited; drop it from the pool.
    Teardown { conn: ConnRef },
    /// Stop the dispatcher.
    Stop { reply: oneshot::Sender<()> },
}

type UserCall = Box<dyn FnOnce() + Send>;
type ConnCb = Arc<dyn Fn(&ConnRef, bool) + Send + Sync>;
type ErrorCb = Arc<dyn Fn(&Error, bool, AsyncId) + Send + Sync>;

/// State shared between the pool handle, the dispatcher and I/O tasks.
pub(crate) struct PoolShared {
    pub(crate) cfg: ConnPoolConfig,
    pub(crate) handler: Arc<dyn ConnHandler>,
    pub(crate) disp_tx: mpsc::UnboundedSender<DispCmd>,
    disp_rx: Mutex<Option<mpsc::UnboundedReceiver<DispCmd>>>,
    user_tx: mpsc::UnboundedSender<UserCall>,
    user_rx: Mutex<Option<mpsc::UnboundedReceiver<UserCall>>>,
    conn_cb: Mutex<Option<ConnCb>>,
    error_cb: Mutex<Option<ErrorCb>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolShared {
    /// Run a closure on the user-callback task.
    pub(crate) fn user_call(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.user_tx.send(Box::new(f));
    }

    /// Report an error through the registered error callback.
    pub(crate) fn report_error(&self, err: Error, fatal: bool, async_id: AsyncId) {
        let cb = self.error_cb.lock().unwrap().clone();
        match cb {
            Some(cb) => self.user_call(move || cb(&err, fatal, async_id)),
            None => tracing::debug!(error = %err, fatal, async_id, "unhandled error"),
        }
    }

    /// Report a connection status change.
    pub(crate) fn conn_event(&self, conn: &ConnRef, connected: bool) {
        if let Some(cb) = self.conn_cb.lock().unwrap().clone() {
            let conn = conn.clone();
            self.user_call(move || cb(&conn, connected));
        }
    }

    fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Handle to a running connection pool. Cheap to clone.
#[derive(Clone)]
pub struct ConnPool {
    shared: Arc<PoolShared>,
}

impl ConnPool {
    /// Create a pool with the given configuration and layer hooks.
    pub fn new(cfg: ConnPoolConfig, handler: Arc<dyn ConnHandler>) -> Self {
        let (disp_tx, disp_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(PoolShared {
                cfg,
                handler,
                disp_tx,
                disp_rx: Mutex::new(Some(disp_rx)),
                user_tx,
                user_rx: Mutex::new(Some(user_rx)),
                conn_cb: Mutex::new(None),
                error_cb: Mutex::new(None),
                next_conn_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the dispatcher and user-callback tasks. Idempotent.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(nworker = self.shared.cfg.nworker, "starting connection pool");

        let disp_rx = self.shared.disp_rx.lock().unwrap().take();
        let user_rx = self.shared.user_rx.lock().unwrap().take();
        let mut tasks = self.shared.tasks.lock().unwrap();

        if let Some(rx) = disp_rx {
            let dispatcher = Dispatcher::new(self.shared.clone());
            tasks.push(tokio::spawn(dispatcher.run(rx)));
        }
        if let Some(mut rx) = user_rx {
            tasks.push(tokio::spawn(async move {
                while let Some(f) = rx.recv().await {
                    f();
                }
            }));
        }
    }

    /// Stop the dispatcher, drain every connection and join the tasks.
    pub async fn stop(&self) {
        if !self.shared.started.load(Ordering::Acquire) {
            return;
        }
        let (tx, rx) = oneshot::channel();
        if self.shared.disp_tx.send(DispCmd::Stop { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        for task in self.shared.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    /// Connect to a remote address, waiting for the connection handle.
    ///
    /// The handle is returned as soon as the dispatcher creates it; the
    /// socket may still be completing. Setup and teardown are observed
    /// through the registered connection callback.
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnRef> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .disp_tx
            .send(DispCmd::Connect { addr, reply: Some(tx), async_id: 0 })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Fire-and-forget connect. Failures are reported through the error
    /// callback with the returned async-id.
    pub fn connect_deferred(&self, addr: SocketAddr) -> AsyncId {
        let async_id = gen_async_id();
        let _ = self.shared.disp_tx.send(DispCmd::Connect {
            addr,
            reply: None,
            async_id,
        });
        async_id
    }

    /// Bind a listener and start accepting passive connections.
    /// Returns the actual bound address (useful with port 0).
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .disp_tx
            .send(DispCmd::Listen { addr, reply: tx })
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Terminate a connection. Fire-and-forget and idempotent; the
    /// teardown callback fires exactly once.
    pub fn terminate(&self, conn: &ConnRef) {
        let _ = self.shared.disp_tx.send(DispCmd::Terminate { conn: conn.clone() });
    }

    /// Register the connection status callback.
    pub fn reg_conn_handler(&self, cb: impl Fn(&ConnRef, bool) + Send + Sync + 'static) {
        *self.shared.conn_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&Error, bool, AsyncId) + Send + Sync + 'static,
    ) {
        *self.shared.error_cb.lock().unwrap() = Some(Arc::new(cb));
    }

    /// The pool configuration.
    pub fn config(&self) -> &ConnPoolConfig {
        &self.shared.cfg
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Dispatcher state: connection table, worker accounting, listener.
struct Dispatcher {
    shared: Arc<PoolShared>,
    conns: HashMap<ConnId, ConnRef>,
    workers: Vec<WorkerSlot>,
    accept_task: Option<JoinHandle<()>>,
}

impl Dispatcher {
    fn new(shared: Arc<PoolShared>) -> Self {
        let nworker = shared.cfg.nworker.max(1);
        Self {
            shared,
            conns: HashMap::new(),
            // Worker 0 is the dispatcher itself
            workers: (0..nworker).map(|_| WorkerSlot::new()).collect(),
            accept_task: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DispCmd>) {
        while let Some(cmd) = rx.recv().await {
            if let Flow::Stop = self.handle(cmd).await {
                break;
            }
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }

    async fn handle(&mut self, cmd: DispCmd) -> Flow {
        match cmd {
            DispCmd::Connect { addr, reply, async_id } => {
                let conn = Connection::new(
                    self.shared.next_conn_id(),
                    addr,
                    ConnMode::Active,
                    self.shared.cfg.queue_capacity,
                );
                tracing::debug!(conn = %conn, "connecting");
                self.conns.insert(conn.id(), conn.clone());
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(conn.clone()));
                }

                let tx = self.shared.disp_tx.clone();
                let timeout = self.shared.cfg.conn_server_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                        Ok(Ok(stream)) => {
                            let _ = tx.send(DispCmd::ConnectDone { conn, stream });
                        }
                        Ok(Err(e)) => {
                            let _ = tx.send(DispCmd::ConnectFailed {
                                conn,
                                err: e.into(),
                                async_id,
                            });
                        }
                        Err(_) => {
                            let _ = tx.send(DispCmd::ConnectFailed {
                                conn,
                                err: Error::ConnectTimeout { addr },
                                async_id,
                            });
                        }
                    }
                });
            }

            DispCmd::ConnectDone { conn, stream } => {
                if conn.is_terminated() {
                    tracing::debug!(conn = %conn, "discarding dead connection");
                    self.teardown(&conn).await;
                } else {
                    self.setup(conn, stream).await;
                }
            }

            DispCmd::ConnectFailed { conn, err, async_id } => {
                tracing::debug!(conn = %conn, error = %err, "connect failed");
                self.shared.report_error(err, false, async_id);
                self.teardown(&conn).await;
            }

            DispCmd::Listen { addr, reply } => {
                let _ = reply.send(self.listen(addr).await);
            }

            DispCmd::Accepted { stream, addr } => {
                let conn = Connection::new(
                    self.shared.next_conn_id(),
                    addr,
                    ConnMode::Passive,
                    self.shared.cfg.queue_capacity,
                );
                tracing::debug!(conn = %conn, "accepted");
                self.conns.insert(conn.id(), conn.clone());
                self.setup(conn, stream).await;
            }

            DispCmd::Terminate { conn } => {
                conn.set_mode(ConnMode::Dead);
                if conn.worker_index().is_some() {
                    // The I/O task reports teardown when it exits
                    conn.ctrl(ConnCtrl::Terminate);
                } else {
                    self.teardown(&conn).await;
                }
            }

            DispCmd::Teardown { conn } => {
                self.teardown(&conn).await;
            }

            DispCmd::Stop { reply } => {
                tracing::info!(nconn = self.conns.len(), "stopping connection pool");
                for conn in self.conns.values() {
                    conn.set_mode(ConnMode::Dead);
                    conn.ctrl(ConnCtrl::Terminate);
                }
                self.conns.clear();
                let _ = reply.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "listening");

        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let tx = self.shared.disp_tx.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        if tx.send(DispCmd::Accepted { stream, addr }).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept error");
                    }
                }
            }
        }));

        Ok(local_addr)
    }

    /// Assign a worker, run setup hooks and hand the socket to an I/O task.
    async fn setup(&mut self, conn: ConnRef, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(conn = %conn, error = %e, "failed to set TCP_NODELAY");
        }

        let idx = select_worker(&self.workers);
        self.workers[idx].nconn += 1;
        conn.worker.store(idx, Ordering::Release);
        tracing::debug!(conn = %conn, worker = idx, "assigned to worker");

        self.shared.handler.on_setup(&conn).await;
        self.shared.conn_event(&conn, true);

        tokio::spawn(worker::run_io(self.shared.clone(), conn, stream));
    }

    /// Drop a connection from the pool. Runs at most once per connection.
    async fn teardown(&mut self, conn: &ConnRef) {
        if !conn.begin_teardown() {
            return;
        }
        conn.set_mode(ConnMode::Dead);
        if let Some(idx) = conn.worker_index() {
            self.workers[idx].nconn = self.workers[idx].nconn.saturating_sub(1);
        }
        if self.conns.remove(&conn.id()).is_some() {
            tracing::debug!(conn = %conn, "connection dropped");
            self.shared.handler.on_teardown(conn).await;
            self.shared.conn_event(conn, false);
        }
    }
}
