//! Configuration for the pool and network layers.

use std::time::Duration;

use crate::peer::IdentityMode;

/// Default backlog requested for listening sockets.
pub const DEFAULT_MAX_LISTEN_BACKLOG: u32 = 10;

/// Default timeout for an outbound connection to complete its setup.
pub const DEFAULT_CONN_SERVER_TIMEOUT: Duration = Duration::from_secs(2);

/// Default receive chunk size in bytes.
pub const DEFAULT_SEG_BUFF_SIZE: usize = 4096;

/// Default number of worker slots.
pub const DEFAULT_NWORKER: usize = 1;

/// Default send queue capacity (0 = unbounded).
pub const DEFAULT_QUEUE_CAPACITY: usize = 0;

/// Default maximum payload size in bytes.
pub const DEFAULT_MAX_MSG_SIZE: usize = 1024;

/// Default capacity of the incoming message queue.
pub const DEFAULT_MAX_MSG_QUEUE_SIZE: usize = 65536;

/// Default number of messages dispatched per wakeup.
pub const DEFAULT_BURST_SIZE: usize = 1000;

/// Default wire magic.
pub const DEFAULT_MSG_MAGIC: u32 = 0;

/// Default heartbeat period.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);

/// Default idle timeout for an established peer connection.
pub const DEFAULT_CONN_TIMEOUT: Duration = Duration::from_secs(180);

/// Configuration for [`ConnPool`](crate::pool::ConnPool).
#[derive(Debug, Clone)]
pub struct ConnPoolConfig {
    /// Backlog hint for listening sockets. Recorded for parity with other
    /// bindings; the runtime listener manages the OS-level backlog.
    pub max_listen_backlog: u32,

    /// How long an outbound connection may take to become established.
    pub conn_server_timeout: Duration,

    /// Receive chunk size: each read pass pulls at most this many bytes.
    pub seg_buff_size: usize,

    /// Number of worker slots connections are balanced across.
    /// Worker 0 doubles as the dispatcher. Clamped to at least 1.
    pub nworker: usize,

    /// Capacity of each connection's send queue. 0 means unbounded;
    /// otherwise pushes wait for space.
    pub queue_capacity: usize,
}

impl Default for ConnPoolConfig {
    fn default() -> Self {
        Self {
            max_listen_backlog: DEFAULT_MAX_LISTEN_BACKLOG,
            conn_server_timeout: DEFAULT_CONN_SERVER_TIMEOUT,
            seg_buff_size: DEFAULT_SEG_BUFF_SIZE,
            nworker: DEFAULT_NWORKER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ConnPoolConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen backlog hint.
    pub fn with_max_listen_backlog(mut self, backlog: u32) -> Self {
        self.max_listen_backlog = backlog;
        self
    }

    /// Set the connection setup timeout.
    pub fn with_conn_server_timeout(mut self, timeout: Duration) -> Self {
        self.conn_server_timeout = timeout;
        self
    }

    /// Set the receive chunk size.
    pub fn with_seg_buff_size(mut self, size: usize) -> Self {
        self.seg_buff_size = size;
        self
    }

    /// Set the number of worker slots (clamped to at least 1).
    pub fn with_nworker(mut self, nworker: usize) -> Self {
        self.nworker = nworker.max(1);
        self
    }

    /// Set the send queue capacity (0 = unbounded).
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }
}

/// Configuration for [`MsgNetwork`](crate::msgnet::MsgNetwork).
#[derive(Debug, Clone)]
pub struct MsgNetworkConfig {
    /// Underlying pool configuration.
    pub pool: ConnPoolConfig,

    /// Maximum accepted payload size. A header declaring more is a
    /// protocol violation that terminates the connection.
    pub max_msg_size: usize,

    /// Capacity of the incoming message queue. When full, the affected
    /// connection stops reading until space frees up.
    pub max_msg_queue_size: usize,

    /// Maximum number of messages handed to handlers per wakeup before
    /// yielding to other tasks.
    pub burst_size: usize,

    /// Wire magic folded into every frame checksum. Frames carrying a
    /// different magic fail verification and are dropped.
    pub msg_magic: u32,
}

impl Default for MsgNetworkConfig {
    fn default() -> Self {
        Self {
            pool: ConnPoolConfig::default(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            max_msg_queue_size: DEFAULT_MAX_MSG_QUEUE_SIZE,
            burst_size: DEFAULT_BURST_SIZE,
            msg_magic: DEFAULT_MSG_MAGIC,
        }
    }
}

impl MsgNetworkConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool configuration.
    pub fn with_pool(mut self, pool: ConnPoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the maximum payload size.
    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Set the incoming queue capacity.
    pub fn with_max_msg_queue_size(mut self, size: usize) -> Self {
        self.max_msg_queue_size = size.max(1);
        self
    }

    /// Set the dispatch burst size.
    pub fn with_burst_size(mut self, size: usize) -> Self {
        self.burst_size = size.max(1);
        self
    }

    /// Set the wire magic.
    pub fn with_msg_magic(mut self, magic: u32) -> Self {
        self.msg_magic = magic;
        self
    }
}

/// Configuration for [`PeerNetwork`](crate::peer::PeerNetwork).
#[derive(Debug, Clone)]
pub struct PeerNetworkConfig<O> {
    /// Underlying message network configuration.
    pub msg: MsgNetworkConfig,

    /// Base heartbeat period. Actual timers are jittered around it.
    pub ping_period: Duration,

    /// Idle timeout on established connections. Reset by inbound
    /// traffic; expiry tears the connection down.
    pub conn_timeout: Duration,

    /// How peer identities are derived.
    pub id_mode: IdentityMode,

    /// Whether a handshake from an unregistered peer is admitted
    /// (auto-registering it) instead of terminated.
    pub allow_unknown_peer: bool,

    /// Opcode used for ping messages.
    pub ping_opcode: O,

    /// Opcode used for pong messages.
    pub pong_opcode: O,
}

impl Default for PeerNetworkConfig<u8> {
    fn default() -> Self {
        Self {
            msg: MsgNetworkConfig::default(),
            ping_period: DEFAULT_PING_PERIOD,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            id_mode: IdentityMode::CertBased,
            allow_unknown_peer: false,
            ping_opcode: 0xf0,
            pong_opcode: 0xf1,
        }
    }
}

impl PeerNetworkConfig<u8> {
    /// Create a configuration with defaults (`u8` opcodes).
    pub fn new() -> Self {
        Self::default()
    }
}

impl<O> PeerNetworkConfig<O> {
    /// Create a configuration with explicit ping/pong opcodes.
    pub fn with_opcodes(ping_opcode: O, pong_opcode: O) -> Self {
        Self {
            msg: MsgNetworkConfig::default(),
            ping_period: DEFAULT_PING_PERIOD,
            conn_timeout: DEFAULT_CONN_TIMEOUT,
            id_mode: IdentityMode::CertBased,
            allow_unknown_peer: false,
            ping_opcode,
            pong_opcode,
        }
    }

    /// Replace the message network configuration.
    pub fn with_msg(mut self, msg: MsgNetworkConfig) -> Self {
        self.msg = msg;
        self
    }

    /// Set the heartbeat period.
    pub fn with_ping_period(mut self, period: Duration) -> Self {
        self.ping_period = period;
        self
    }

    /// Set the idle connection timeout.
    pub fn with_conn_timeout(mut self, timeout: Duration) -> Self {
        self.conn_timeout = timeout;
        self
    }

    /// Set the identity derivation mode.
    pub fn with_id_mode(mut self, mode: IdentityMode) -> Self {
        self.id_mode = mode;
        self
    }

    /// Allow handshakes from unregistered peers.
    pub fn with_allow_unknown_peer(mut self, allow: bool) -> Self {
        self.allow_unknown_peer = allow;
        self
    }
}
