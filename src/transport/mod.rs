pub mod config;
pub mod conn;
pub mod conn_pool;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod queue;
pub mod session;

pub use config::{DuplicateSessionPolicy, PoolConfig};
pub use conn::{ByteCounters, ConnId};
pub use conn_pool::{
    ConnPool, ConnPoolBuilder, NewSessionSink, PoolStats, PoolStopListener, RejectReason, SessionReply,
};
pub use error::{Error, Result};
pub use frame::{Packet, SessionPacket, SessionState};
pub use queue::Queue;
pub use session::Session;
