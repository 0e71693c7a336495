use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::transport::error::{Error, Result};
use crate::transport::frame::{encode_session_packet, SessionPacket, SessionState};
use crate::transport::queue::Queue;

/// 会话提交给心跳帧的信息
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub payload: Bytes,
}

/// 会话和所属连接池之间的通道
#[derive(Clone)]
pub(crate) struct SessionLinks {
    pub outbound: Queue<Bytes>,
    pub info: Queue<SessionInfo>,
    pub stop_notify: Queue<u64>,
}

/// 复用在连接池上的逻辑流
///
/// 只能通过连接池创建。句柄可以随意 clone，所有 clone 指向同一个会话。
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    links: SessionLinks,
    incoming: Queue<SessionPacket>,
    stopped: AtomicBool,
    send_closed: AtomicBool,
    read_closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: u64, links: SessionLinks) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                links,
                incoming: Queue::new(),
                stopped: AtomicBool::new(false),
                send_closed: AtomicBool::new(false),
                read_closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// 提交会话信息，下一次心跳时随 INFO 帧发出
    pub fn submit_info(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_running()?;
        let info = SessionInfo {
            session_id: self.inner.id,
            payload: payload.into(),
        };
        self.inner.links.info.push(info).map_err(|_| Error::PoolClosed)
    }

    /// 发送数据
    pub fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_running()?;
        if self.inner.send_closed.load(Ordering::Acquire) {
            return Err(Error::SendClosed(self.inner.id));
        }
        self.write_packet(&SessionPacket::Data(data.into()))
    }

    pub fn finish_send(&self) -> Result<()> {
        self.close_send(SessionState::FinishSend)
    }

    pub fn abort_send(&self) -> Result<()> {
        self.close_send(SessionState::AbortSend)
    }

    pub fn finish_read(&self) -> Result<()> {
        self.close_read(SessionState::FinishRead)
    }

    pub fn abort_read(&self) -> Result<()> {
        self.close_read(SessionState::AbortRead)
    }

    fn close_send(&self, state: SessionState) -> Result<()> {
        self.ensure_running()?;
        if self.inner.send_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_packet(&SessionPacket::State(state))
    }

    fn close_read(&self, state: SessionState) -> Result<()> {
        self.ensure_running()?;
        if self.inner.read_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_packet(&SessionPacket::State(state))
    }

    /// 接收对端发来的包；会话停止且缓冲取完后返回 `None`
    pub async fn recv(&self) -> Option<SessionPacket> {
        self.inner.incoming.pop().await
    }

    /// 停止会话：通知对端，并向连接池报告结束。只有第一次调用生效
    pub fn stop(&self) {
        self.stop_inner(true);
    }

    /// 连接池路由过来的包
    pub(crate) fn deliver(&self, packet: SessionPacket) {
        let peer_stopped = packet == SessionPacket::State(SessionState::Stop);
        if self.inner.read_closed.load(Ordering::Acquire) && !peer_stopped {
            log::trace!("[Session] Session {} read closed, dropping packet", self.inner.id);
            return;
        }
        let _ = self.inner.incoming.push(packet);
        if peer_stopped {
            self.stop_inner(false);
        }
    }

    fn stop_inner(&self, notify_peer: bool) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("[Session] Session {} stopping", self.inner.id);
        if notify_peer {
            let _ = self
                .inner
                .links
                .outbound
                .push(encode_session_packet(self.inner.id, &SessionPacket::State(SessionState::Stop)));
        }
        let _ = self.inner.links.stop_notify.push(self.inner.id);
        self.inner.incoming.stop();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SessionStopped(self.inner.id));
        }
        Ok(())
    }

    fn write_packet(&self, packet: &SessionPacket) -> Result<()> {
        self.inner
            .links
            .outbound
            .push(encode_session_packet(self.inner.id, packet))
            .map_err(|_| Error::PoolClosed)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
