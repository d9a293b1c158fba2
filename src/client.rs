//! Client/server convenience layer: a message network that tracks its
//! accepted connections by remote address, for deployments where the
//! clients are not peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::MsgNetworkConfig;
use crate::error::{gen_async_id, AsyncId, Error, Result};
use crate::msgnet::MsgNetwork;
use crate::pool::{ConnHandler, ConnMode, ConnRef};
use crate::protocol::{Opcode, WireMsg};

struct ClientInner {
    addr2conn: Mutex<HashMap<SocketAddr, ConnRef>>,
}

#[async_trait]
impl ConnHandler for ClientInner {
    async fn on_setup(&self, conn: &ConnRef) {
        if conn.mode() == ConnMode::Passive {
            self.addr2conn
                .lock()
                .unwrap()
                .insert(conn.addr(), conn.clone());
        }
    }

    async fn on_teardown(&self, conn: &ConnRef) {
        let mut map = self.addr2conn.lock().unwrap();
        if map.get(&conn.addr()).map(|c| c.id()) == Some(conn.id()) {
            map.remove(&conn.addr());
        }
    }
}

/// Server-side network addressing accepted clients by remote address.
/// Cheap to clone.
pub struct ClientNetwork<O: Opcode> {
    msg: MsgNetwork<O>,
    inner: Arc<ClientInner>,
}

impl<O: Opcode> Clone for ClientNetwork<O> {
    fn clone(&self) -> Self {
        Self {
            msg: self.msg.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<O: Opcode> ClientNetwork<O> {
    /// Create a client network with the given configuration.
    pub fn new(cfg: MsgNetworkConfig) -> Self {
        let inner = Arc::new(ClientInner {
            addr2conn: Mutex::new(HashMap::new()),
        });
        let msg = MsgNetwork::new(cfg);
        let _ = msg.inner.upper.set(inner.clone());
        Self { msg, inner }
    }

    /// Start the network. Idempotent.
    pub fn start(&self) {
        self.msg.start();
    }

    /// Stop the network.
    pub async fn stop(&self) {
        self.msg.stop().await;
    }

    /// Listen for client connections; returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.msg.listen(addr).await
    }

    /// The connection for a client address, if one is established.
    pub fn client_conn(&self, addr: &SocketAddr) -> Option<ConnRef> {
        self.inner.addr2conn.lock().unwrap().get(addr).cloned()
    }

    /// Send a message to a connected client.
    pub async fn send_msg<M: WireMsg<O>>(&self, msg: &M, addr: &SocketAddr) -> Result<bool> {
        let conn = self
            .client_conn(addr)
            .ok_or(Error::ClientNotExist(*addr))?;
        Ok(self.msg.send_msg(msg, &conn).await)
    }

    /// Deferred send; failures surface through the error callback with
    /// the returned async-id.
    pub fn send_msg_deferred<M: WireMsg<O> + Sync>(&self, msg: M, addr: SocketAddr) -> AsyncId {
        let async_id = gen_async_id();
        let net = self.clone();
        tokio::spawn(async move {
            let err = match net.send_msg(&msg, &addr).await {
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

    /// Register a raw opcode handler. See [`MsgNetwork::reg_handler`].
    pub fn reg_handler<F, Fut>(&self, opcode: O, handler: F)
    where
        F: Fn(crate::protocol::Envelope<O>, ConnRef) -> Fut + Send + Sync + 'static,
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

    /// Register the connection status callback.
    pub fn reg_conn_handler(&self, cb: impl Fn(&ConnRef, bool) + Send + Sync + 'static) {
        self.msg.reg_conn_handler(cb);
    }

    /// Register the error callback.
    pub fn reg_error_handler(
        &self,
        cb: impl Fn(&Error, bool, crate::error::AsyncId) + Send + Sync + 'static,
    ) {
        self.msg.reg_error_handler(cb);
    }

    /// The underlying message network.
    pub fn msg_network(&self) -> &MsgNetwork<O> {
        &self.msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::time::Duration;

    struct Req(u32);
    struct Resp(u32);

    impl WireMsg<u8> for Req {
        const OPCODE: u8 = 0x30;

        fn encode(&self, dst: &mut BytesMut) {
            dst.put_u32_le(self.0);
        }

        fn decode(src: &mut Bytes) -> Result<Self> {
            use bytes::Buf;
            if src.remaining() < 4 {
                return Err(Error::Decode("truncated request"));
            }
            Ok(Req(src.get_u32_le()))
        }
    }

    impl WireMsg<u8> for Resp {
        const OPCODE: u8 = 0x31;

        fn encode(&self, dst: &mut BytesMut) {
            dst.put_u32_le(self.0);
        }

        fn decode(src: &mut Bytes) -> Result<Self> {
            use bytes::Buf;
            if src.remaining() < 4 {
                return Err(Error::Decode("truncated response"));
            }
            Ok(Resp(src.get_u32_le()))
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_request_response() {
        let server = ClientNetwork::<u8>::new(MsgNetworkConfig::default());
        let server_for_handler = server.clone();
        server.reg_msg_handler(move |req: Req, conn| {
            let server = server_for_handler.clone();
            async move {
                let _ = server.send_msg(&Resp(req.0 * 2), &conn.addr()).await;
            }
        });
        server.start();
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client = MsgNetwork::<u8>::new(MsgNetworkConfig::default());
        let answers = Arc::new(Mutex::new(Vec::new()));
        let answers_in = answers.clone();
        client.reg_msg_handler(move |resp: Resp, _conn| {
            answers_in.lock().unwrap().push(resp.0);
            async {}
        });
        client.start();

        let conn = client.connect(addr).await.unwrap();
        assert!(client.send_msg(&Req(21), &conn).await);

        assert!(wait_until(|| answers.lock().unwrap().as_slice() == [42]).await);

        client.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_client() {
        let server = ClientNetwork::<u8>::new(MsgNetworkConfig::default());
        server.start();
        let _ = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let result = server.send_msg(&Req(1), &addr).await;
        assert!(matches!(result, Err(Error::ClientNotExist(a)) if a == addr));

        server.stop().await;
    }
}
