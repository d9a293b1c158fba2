//! Framed message layer: opcode routing over the connection pool.
//!
//! Incoming bytes are framed per connection, verified and pushed into a
//! bounded inbox; a single dispatch task drains the inbox in bursts and
//! invokes the handler registered for each opcode. A full inbox pauses
//! only the affected connection's reads until space frees up; its
//! control and write paths keep running.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use async_trait::async_trait;
use bytes::BytesMut;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Decoder;

use crate::config::MsgNetworkConfig;
use crate::error::{gen_async_id, AsyncId, Error, Result};
use crate::pool::{ConnHandler, ConnId, ConnPool, ConnRef};
use crate::protocol::{Envelope, FrameCodec, Opcode, WireMsg};

type RawHandler<O> =
    Arc<dyn Fn(Envelope<O>, ConnRef) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-connection framing state plus the shared routing tables.
pub(crate) struct MsgNetInner<O: Opcode> {
    magic: u32,
    max_msg_size: usize,
    burst_size: usize,
    handlers: RwLock<HashMap<O, RawHandler<O>>>,
    inbox_tx: mpsc::Sender<(Envelope<O>, ConnRef)>,
    inbox_rx: Mutex<Option<mpsc::Receiver<(Envelope<O>, ConnRef)>>>,
    codecs: Mutex<HashMap<ConnId, Arc<tokio::sync::Mutex<FrameCodec<O>>>>>,
    /// Hooks of the layer above, if any.
    pub(crate) upper: OnceLock<Arc<dyn ConnHandler>>,
    started: AtomicBool,
}

impl<O: Opcode> MsgNetInner<O> {
    async fn dispatch_one(&self, env: Envelope<O>, conn: ConnRef) {
        let handler = self.handlers.read().unwrap().get(&env.opcode()).cloned();
        match handler {
            Some(h) => {
                tracing::trace!(msg = %env, conn = %conn, "dispatching message");
                h(env, conn).await;
            }
            None => {
                tracing::warn!(opcode = %env.opcode(), "unknown opcode");
            }
        }
    }
}

#[async_trait]
impl<O: Opcode> ConnHandler for MsgNetInner<O> {
    async fn on_setup(&self, conn: &ConnRef) {
        let codec = FrameCodec::new(self.max_msg_size, self.magic);
        self.codecs
            .lock()
            .unwrap()
            .insert(conn.id(), Arc::new(tokio::sync::Mutex::new(codec)));
        if let Some(upper) = self.upper.get() {
            upper.on_setup(conn).await;
        }
    }

    async fn on_teardown(&self, conn: &ConnRef) {
        self.codecs.lock().unwrap().remove(&conn.id());
        if let Some(upper) = self.upper.get() {
            upper.on_teardown(conn).await;
        }
    }

    async fn on_read(&self, conn: &ConnRef, buf: &mut BytesMut) -> Result<()> {
        let codec = match self.codecs.lock().unwrap().get(&conn.id()) {
            Some(codec) => codec.clone(),
            None => return Ok(()),
        };
        let mut codec = codec.lock().await;
        loop {
            match codec.decode(buf)? {
                Some(env) => match self.inbox_tx.try_send((env, conn.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(item)) => {
                        // Inbox full: park the frame and suspend this
                        // connection's reads. The waiter re-enqueues
                        // the frame once there is room, then resumes
                        // reads; writes and control stay unaffected.
                        conn.pause_reads();
                        let tx = self.inbox_tx.clone();
                        let conn = conn.clone();
                        tokio::spawn(async move {
                            if let Ok(permit) = tx.reserve_owned().await {
                                permit.send(item);
                            }
                            conn.resume_reads();
                        });
                        return Ok(());
                    }
                    Err(TrySendError::Closed(_)) => return Ok(()),
                },
                None => return Ok(()),
            }
        }
    }
}

/// Network of nodes exchanging framed, opcode-routed messages.
/// Cheap to clone.
pub struct MsgNetwork<O: Opcode> {
    pub(crate) inner: Arc<MsgNetInner<O>>,
    pub(crate) pool: ConnPool,
}

impl<O: Opcode> Clone for MsgNetwork<O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<O: Opcode> MsgNetwork<O> {
    /// Create a message network with the given configuration.
    pub fn new(cfg: MsgNetworkConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(cfg.max_msg_queue_size);
        let inner = Arc::new(MsgNetInner {
            magic: cfg.msg_magic,
            max_msg_size: cfg.max_msg_size,
            burst_size: cfg.burst_size,
            handlers: RwLock::new(HashMap::new()),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            codecs: Mutex::new(HashMap::new()),
            upper: OnceLock::new(),
            started: AtomicBool::new(false),
        });
        let pool = ConnPool::new(cfg.pool, inner.clone());
        Self { inner, pool }
    }

    /// Start the pool and the message dispatch task. Idempotent.
    pub fn start(&self) {
        self.pool.start();
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut rx) = self.inner.inbox_rx.lock().unwrap().take() {
            let inner = self.inner.clone();
            let task = tokio::spawn(async move {
                let burst_size = inner.burst_size;
                while let Some((env, conn)) = rx.recv().await {
                    inner.dispatch_one(env, conn).await;
                    let mut cnt = 1;
                    while cnt < burst_size {
                        match rx.try_recv() {
                            Ok((env, conn)) => {
                                inner.dispatch_one(env, conn).await;
                                cnt += 1;
                            }
                            Err(_) => break,
                        }
                    }
                    if cnt == burst_size {
                        // Let other tasks run before the next burst
                        tokio::task::yield_now().await;
                    }
                }
            });
            self.pool.shared().tasks.lock().unwrap().push(task);
        }
    }

    /// Stop the network and the underlying pool.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }

    /// Register a raw handler for an opcode. Replaces any previous one.
    pub fn reg_handler<F, Fut>(&self, opcode: O, handler: F)
    where
        F: Fn(Envelope<O>, ConnRef) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.handlers.write().unwrap().insert(
            opcode,
            Arc::new(move |env, conn| Box::pin(handler(env, conn))),
        );
    }

    /// Register a typed handler for `M`'s opcode. Messages that fail to
    /// decode are logged and dropped.
    pub fn reg_msg_handler<M, F, Fut>(&self, handler: F)
    where
        M: WireMsg<O>,
        F: Fn(M, ConnRef) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.reg_handler(M::OPCODE, move |env: Envelope<O>, conn| {
            let msg = env.open::<M>();
            let fut = msg.map(|m| handler(m, conn));
            async move {
                match fut {
                    Ok(f) => f.await,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed payload, dropping");
                    }
                }
            }
        });
    }

    /// Serialize a message and queue it on a connection. Returns the
    /// push result: `false` once the connection is dead.
    pub async fn send_msg<M: WireMsg<O>>(&self, msg: &M, conn: &ConnRef) -> bool {
        self.send_envelope(&Envelope::pack(msg, self.inner.magic), conn).await
    }

    pub(crate) async fn send_envelope(&self, env: &Envelope<O>, conn: &ConnRef) -> bool {
        tracing::trace!(msg = %env, conn = %conn, "sending message");
        conn.write(env.to_bytes()).await
    }

    /// Queue a message without waiting for the result. A failed push is
    /// reported through the error callback with the returned async-id.
    pub fn send_msg_deferred<M: WireMsg<O> + Sync>(&self, msg: M, conn: &ConnRef) -> AsyncId {
        let async_id = gen_async_id();
        let net = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            if !net.send_msg(&msg, &conn).await {
                net.pool.shared().report_error(Error::ConnNotReady, false, async_id);
            }
        });
        async_id
    }

    /// Build an envelope with this network's magic.
    pub(crate) fn envelope(&self, opcode: O, payload: bytes::Bytes) -> Envelope<O> {
        Envelope::new(opcode, payload, self.inner.magic)
    }

    /// The wire magic this network stamps into frames.
    pub(crate) fn magic(&self) -> u32 {
        self.inner.magic
    }

    /// Connect to a remote address. See [`ConnPool::connect`].
    pub async fn connect(&self, addr: SocketAddr) -> Result<ConnRef> {
        self.pool.connect(addr).await
    }

    /// Fire-and-forget connect. See [`ConnPool::connect_deferred`].
    pub fn connect_deferred(&self, addr: SocketAddr) -> AsyncId {
        self.pool.connect_deferred(addr)
    }

    /// Listen for passive connections; returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.pool.listen(addr).await
    }

    /// Terminate a connection.
    pub fn terminate(&self, conn: &ConnRef) {
        self.pool.terminate(conn);
    }

    /// Register the connection status callback.
    pub fn reg_conn_handler(&self, cb: impl Fn(&ConnRef, bool) + Send + Sync + 'static) {
        self.pool.reg_conn_handler(cb);
    }

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&Error, bool, AsyncId) + Send + Sync + 'static,
    ) {
        self.pool.reg_error_handler(cb);
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &ConnPool {
        &self.pool
    }
}
