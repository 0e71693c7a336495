use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// 传输层错误
///
/// 会话创建被拒绝不算错误，见 [`crate::transport::SessionReply`]。
#[derive(Error, Debug)]
pub enum Error {
    /// 连接池已经结束，不再接收任何事件
    #[error("connection pool closed")]
    PoolClosed,

    /// 会话已经停止
    #[error("session {0} stopped")]
    SessionStopped(u64),

    /// 发送方向已经 finish/abort
    #[error("session {0} send side closed")]
    SendClosed(u64),

    /// 对端发来的帧格式不对
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// 帧长度超过上限
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    /// 握手认证失败
    #[error("handshake rejected for client {0}")]
    BadHandshake(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}
