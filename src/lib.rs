//! Asynchronous peer-to-peer messaging.
//!
//! Three layered abstractions over TCP:
//!
//! - [`ConnPool`] manages the lifecycle of accepted and initiated
//!   connections: a dispatcher task owns the connection table and
//!   worker accounting, and every live connection is driven by one I/O
//!   task with buffered, any-task-safe writes.
//! - [`MsgNetwork`] frames length-prefixed, checksummed messages on top
//!   of the pool and routes them to opcode-keyed handlers through a
//!   bounded inbox drained in bursts.
//! - [`PeerNetwork`] builds a symmetric overlay on top of
//!   [`MsgNetwork`]: either side may dial, duplicate connections
//!   between the same pair are resolved by a nonce tie-break handshake,
//!   and channels are kept alive with ping/pong heartbeats and
//!   jittered retries.
//!
//! # Architecture
//!
//! ```text
//! user task            (opcode handlers, status callbacks)
//! ├── dispatch task    (bounded inbox, burst-limited routing)
//! ├── registry task    (peer table, handshakes, retries)
//! └── dispatcher task  (connection table, connect/accept/terminate)
//!     ├── conn task 1  (socket I/O, framing, idle timeout)
//!     ├── conn task 2
//!     └── ...
//! ```
//!
//! Cross-task communication goes exclusively through command channels;
//! shared reads of the peer table take a read lock.
//!
//! # Usage
//!
//! ```ignore
//! use crosswire::{PeerId, PeerNetwork, PeerNetworkConfig};
//! use std::time::Duration;
//!
//! let net = PeerNetwork::new(PeerNetworkConfig::new());
//! net.start();
//! let addr = net.listen("127.0.0.1:9010".parse().unwrap()).await?;
//!
//! let pid = PeerId::from_addr(&"127.0.0.1:9020".parse().unwrap());
//! net.add_peer(pid);
//! net.set_peer_addr(pid, "127.0.0.1:9020".parse().unwrap());
//! net.conn_peer(pid, -1, Duration::from_secs(2));
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod msgnet;
pub mod peer;
pub mod pool;
pub mod protocol;

pub use client::ClientNetwork;
pub use config::{ConnPoolConfig, MsgNetworkConfig, PeerNetworkConfig};
pub use error::{gen_async_id, AsyncId, Error, Result};
pub use msgnet::MsgNetwork;
pub use peer::{IdentityMode, PeerId, PeerNetwork, PeerState};
pub use pool::{ConnHandler, ConnId, ConnMode, ConnPool, ConnRef, Connection};
pub use protocol::{Envelope, FrameCodec, Opcode, WireMsg};
