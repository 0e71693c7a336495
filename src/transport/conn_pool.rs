//! 单个客户端的连接池
//!
//! 一个 tokio 任务独占连接表、会话表和已停止会话集合，外部只能往它的队列里投递事件。
//! 事件来源：新连接、会话信息、心跳、连接死亡、会话停止、对端来的帧、命令（创建会话等）、停止信号。
//! `select!` 在多个就绪分支之间随机挑选，保证每个来源最终都会被处理。
//!
//! 退出只有两条路：心跳时发现客户端已断开（曾经有过连接，现在一条都没有），或者显式 `stop()`。
//! 两条路都走同一个收尾流程，且只执行一次。

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::Level;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::transport::config::{DuplicateSessionPolicy, PoolConfig};
use crate::transport::conn::{ByteCounters, Conn, ConnContext, ConnId};
use crate::transport::error::{Error, Result};
use crate::transport::frame::{InfoBuffer, Packet, SessionPacket};
use crate::transport::queue::Queue;
use crate::transport::session::{Session, SessionInfo, SessionLinks};
use crate::util::r#type::BoxedIo;
use crate::util::Keys;

const LOG_TARGET: &str = "gnet::conn_pool";

/// 新会话通知
pub type NewSessionSink = mpsc::UnboundedSender<Session>;
/// 连接池结束通知，每个连接池只发一次
pub type PoolStopListener = mpsc::UnboundedSender<ConnPool>;

/// 会话创建被拒绝的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// 这个 id 的会话已经结束过，不允许复活
    Stopped,
    /// 同 id 的会话仍然活跃
    AlreadyLive,
}

/// `create_session` 的结果
#[derive(Debug)]
pub enum SessionReply {
    Created(Session),
    /// `DuplicateSessionPolicy::ReturnExisting` 时返回的已有会话
    Existing(Session),
    Rejected(RejectReason),
}

impl SessionReply {
    pub fn session(self) -> Option<Session> {
        match self {
            SessionReply::Created(session) | SessionReply::Existing(session) => Some(session),
            SessionReply::Rejected(_) => None,
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SessionReply::Rejected(_))
    }
}

/// 连接池状态快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: usize,
    pub sessions: usize,
    pub stopped_sessions: usize,
    /// 曾经同时存在的最大连接数
    pub max_connections: usize,
    pub heartbeats: u64,
    /// 处理过的事件总数
    pub events: u64,
    /// 等待下一次心跳发出的会话信息字节数
    pub buffered_info_bytes: usize,
    pub pings_received: u64,
    pub info_frames_received: u64,
}

enum PoolCommand {
    CreateSession {
        session_id: u64,
        reply: oneshot::Sender<SessionReply>,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
}

#[derive(Debug, Clone, Copy)]
enum ExitReason {
    Abandoned,
    Stopped,
}

/// 连接池对外可见的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    /// 已拒绝新的连接和请求，子连接和会话都已停止
    Closed,
    /// 收尾流程全部完成
    Finished,
}

/// 连接池句柄
///
/// clone 成本很低，所有 clone 指向同一个连接池。
#[derive(Clone)]
pub struct ConnPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    client_id: u64,
    keys: Keys,
    next_conn_id: AtomicU64,
    commands: mpsc::UnboundedSender<PoolCommand>,
    new_conns: Queue<(ConnId, BoxedIo)>,
    dead_conns: Queue<ConnId>,
    session_stops: Queue<u64>,
    infos: Queue<SessionInfo>,
    inbound: Queue<Bytes>,
    outbound: Queue<Bytes>,
    stop_tx: watch::Sender<bool>,
    lifecycle_rx: watch::Receiver<Lifecycle>,
}

/// 构建连接池
pub struct ConnPoolBuilder {
    client_id: u64,
    secret: String,
    config: PoolConfig,
    new_session_sink: Option<NewSessionSink>,
    stop_listener: Option<PoolStopListener>,
    counters: Option<Arc<ByteCounters>>,
}

impl ConnPoolBuilder {
    pub fn new(client_id: u64, secret: impl Into<String>) -> Self {
        Self {
            client_id,
            secret: secret.into(),
            config: PoolConfig::default(),
            new_session_sink: None,
            stop_listener: None,
            counters: None,
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// 每个新建的会话都会发到这里（包括对端发起的会话）
    pub fn on_new_session(mut self, sink: NewSessionSink) -> Self {
        self.new_session_sink = Some(sink);
        self
    }

    /// 连接池收尾时发送一次自身句柄
    pub fn on_stopped(mut self, listener: PoolStopListener) -> Self {
        self.stop_listener = Some(listener);
        self
    }

    /// 接入的每条连接都会累加到这组计数器上
    pub fn byte_counters(mut self, counters: Arc<ByteCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// 启动连接池任务；必须在 tokio 运行时中调用
    pub fn spawn(self) -> ConnPool {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (lifecycle_tx, lifecycle_rx) = watch::channel(Lifecycle::Running);

        let pool = ConnPool {
            shared: Arc::new(PoolShared {
                client_id: self.client_id,
                keys: Keys::derive(&self.secret),
                next_conn_id: AtomicU64::new(1),
                commands: commands_tx,
                new_conns: Queue::new(),
                dead_conns: Queue::new(),
                session_stops: Queue::new(),
                infos: Queue::new(),
                inbound: Queue::new(),
                outbound: Queue::new(),
                stop_tx,
                lifecycle_rx,
            }),
        };

        let shared = &pool.shared;
        let inbox = Inbox {
            commands: commands_rx,
            stop_rx,
            new_conns: shared.new_conns.clone(),
            dead_conns: shared.dead_conns.clone(),
            session_stops: shared.session_stops.clone(),
            infos: shared.infos.clone(),
            inbound: shared.inbound.clone(),
        };
        let worker = PoolWorker {
            client_id: self.client_id,
            config: self.config,
            links: SessionLinks {
                outbound: shared.outbound.clone(),
                info: shared.infos.clone(),
                stop_notify: shared.session_stops.clone(),
            },
            inbound: shared.inbound.clone(),
            dead_conns: shared.dead_conns.clone(),
            new_session_sink: self.new_session_sink,
            stop_listener: self.stop_listener,
            counters: self.counters,
            lifecycle_tx,
            conns: HashMap::new(),
            sessions: HashMap::new(),
            stopped_sessions: HashSet::new(),
            max_conns: 0,
            info: InfoBuffer::new(),
            heartbeats: 0,
            events: 0,
            pings_received: 0,
            info_frames_received: 0,
            this: pool.clone(),
        };
        worker.log(
            Level::Debug,
            format_args!("keys derived (fingerprint {})", shared.keys.fingerprint()),
        );

        tokio::spawn(worker.run(inbox));
        pool
    }
}

impl ConnPool {
    pub fn builder(client_id: u64, secret: impl Into<String>) -> ConnPoolBuilder {
        ConnPoolBuilder::new(client_id, secret)
    }

    /// 使用给定配置、不挂任何监听者启动连接池
    pub fn new(client_id: u64, secret: impl Into<String>, config: PoolConfig) -> Self {
        ConnPoolBuilder::new(client_id, secret).config(config).spawn()
    }

    pub fn client_id(&self) -> u64 {
        self.shared.client_id
    }

    /// 两个句柄是否指向同一个连接池
    pub fn ptr_eq(&self, other: &ConnPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn keys(&self) -> &Keys {
        &self.shared.keys
    }

    /// 待发送帧队列，连接的写循环从这里取帧
    pub fn outbound(&self) -> Queue<Bytes> {
        self.shared.outbound.clone()
    }

    /// 交给连接池一条新的物理连接，返回分配给它的 id
    pub fn submit_connection(&self, io: BoxedIo) -> Result<ConnId> {
        self.try_submit_connection(io).map_err(|_| Error::PoolClosed)
    }

    /// 同 `submit_connection`，连接池已关闭时把连接原样还给调用方
    pub fn try_submit_connection(&self, io: BoxedIo) -> std::result::Result<ConnId, BoxedIo> {
        if self.is_closed() {
            return Err(io);
        }
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::AcqRel);
        self.shared.new_conns.push((id, io)).map_err(|(_, io)| io)?;
        Ok(id)
    }

    /// 报告连接已死
    pub fn report_dead_connection(&self, conn_id: ConnId) -> Result<()> {
        self.shared.dead_conns.push(conn_id).map_err(|_| Error::PoolClosed)
    }

    /// 报告会话已结束
    pub fn report_session_stopped(&self, session_id: u64) -> Result<()> {
        self.shared
            .session_stops
            .push(session_id)
            .map_err(|_| Error::PoolClosed)
    }

    /// 提交会话信息，下一次心跳时发出
    pub fn submit_session_info(&self, session_id: u64, payload: impl Into<Bytes>) -> Result<()> {
        let info = SessionInfo {
            session_id,
            payload: payload.into(),
        };
        self.shared.infos.push(info).map_err(|_| Error::PoolClosed)
    }

    /// 请求创建会话，等待连接池任务答复
    ///
    /// 已经结束过的 id 会被拒绝；连接池已经结束时返回 `Error::PoolClosed`。
    pub async fn create_session(&self, session_id: u64) -> Result<SessionReply> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(PoolCommand::CreateSession { session_id, reply })
            .map_err(|_| Error::PoolClosed)?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.shared
            .commands
            .send(PoolCommand::Stats { reply })
            .map_err(|_| Error::PoolClosed)?;
        rx.await.map_err(|_| Error::PoolClosed)
    }

    /// 触发关闭；重复调用没有副作用
    pub fn stop(&self) {
        self.shared.stop_tx.send_replace(true);
    }

    /// 收尾流程开始后即为 true；此时子连接和会话已经停止，新的连接和请求都会被拒绝
    pub fn is_closed(&self) -> bool {
        *self.shared.lifecycle_rx.borrow() != Lifecycle::Running
    }

    /// 等到收尾流程全部完成
    pub async fn wait_closed(&self) {
        let mut lifecycle_rx = self.shared.lifecycle_rx.clone();
        let _ = lifecycle_rx
            .wait_for(|state| *state == Lifecycle::Finished)
            .await;
    }
}

impl fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnPool")
            .field("client_id", &self.shared.client_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// 连接池任务消费的事件源
struct Inbox {
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    stop_rx: watch::Receiver<bool>,
    new_conns: Queue<(ConnId, BoxedIo)>,
    dead_conns: Queue<ConnId>,
    session_stops: Queue<u64>,
    infos: Queue<SessionInfo>,
    inbound: Queue<Bytes>,
}

/// 连接池任务，独占全部可变状态
struct PoolWorker {
    client_id: u64,
    config: PoolConfig,
    links: SessionLinks,
    inbound: Queue<Bytes>,
    dead_conns: Queue<ConnId>,
    new_session_sink: Option<NewSessionSink>,
    stop_listener: Option<PoolStopListener>,
    counters: Option<Arc<ByteCounters>>,
    lifecycle_tx: watch::Sender<Lifecycle>,

    conns: HashMap<ConnId, Conn>,
    sessions: HashMap<u64, Session>,
    /// 只增不减
    stopped_sessions: HashSet<u64>,
    max_conns: usize,
    info: InfoBuffer,
    heartbeats: u64,
    events: u64,
    pings_received: u64,
    info_frames_received: u64,

    this: ConnPool,
}

impl PoolWorker {
    async fn run(mut self, mut inbox: Inbox) {
        self.log(Level::Info, format_args!("start"));
        let reason = self.event_loop(&mut inbox).await;
        self.finalize(inbox, reason);
    }

    async fn event_loop(&mut self, inbox: &mut Inbox) -> ExitReason {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some((id, io)) = inbox.new_conns.pop() => self.accept_conn(id, io),
                Some(info) = inbox.infos.pop() => self.info.push(info.session_id, &info.payload),
                _ = heartbeat.tick() => {
                    if self.heartbeat() {
                        return ExitReason::Abandoned;
                    }
                }
                Some(id) = inbox.dead_conns.pop() => self.remove_conn(id),
                Some(id) = inbox.session_stops.pop() => self.remove_session(id),
                Some(frame) = inbox.inbound.pop() => self.dispatch(frame),
                Some(command) = inbox.commands.recv() => self.handle_command(command),
                _ = inbox.stop_rx.changed() => return ExitReason::Stopped,
            }
            self.events += 1;
        }
    }

    fn accept_conn(&mut self, id: ConnId, io: BoxedIo) {
        let conn = Conn::spawn(
            id,
            io,
            ConnContext {
                outbound: self.links.outbound.clone(),
                inbound: self.inbound.clone(),
                dead: self.dead_conns.clone(),
                counters: self.counters.clone(),
                max_frame_size: self.config.max_frame_size,
            },
        );
        self.conns.insert(id, conn);
        if self.conns.len() > self.max_conns {
            self.max_conns = self.conns.len();
        }
        self.log(
            Level::Debug,
            format_args!("add conn {} (conns {})", id, self.conns.len()),
        );
    }

    /// 发出 INFO 帧，返回客户端是否已经断开
    fn heartbeat(&mut self) -> bool {
        self.heartbeats += 1;
        let frame = self.info.take_frame();
        if self.links.outbound.push(frame).is_err() {
            self.log(Level::Warn, format_args!("outbound queue stopped, info frame dropped"));
        }

        self.log(
            Level::Debug,
            format_args!(
                "tick {} conns {} sessions {} outbound depth {}",
                self.events,
                self.conns.len(),
                self.sessions.len(),
                self.links.outbound.len()
            ),
        );

        if self.max_conns > 0 && self.conns.is_empty() {
            self.log(Level::Info, format_args!("client disconnected"));
            return true;
        }
        false
    }

    fn remove_conn(&mut self, id: ConnId) {
        if let Some(conn) = self.conns.remove(&id) {
            conn.stop();
            self.log(
                Level::Debug,
                format_args!("delete conn {} (conns {})", id, self.conns.len()),
            );
        }
    }

    fn remove_session(&mut self, id: u64) {
        if let Some(session) = self.sessions.remove(&id) {
            // 外部直接报告的情况下会话本身可能还没停
            session.stop();
            self.log(Level::Debug, format_args!("delete session {}", id));
        }
        self.stopped_sessions.insert(id);
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::CreateSession { session_id, reply } => {
                let result = self.open_session(session_id);
                if reply.send(result).is_err() {
                    self.log(
                        Level::Debug,
                        format_args!("create session {} requester went away", session_id),
                    );
                }
            }
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn open_session(&mut self, session_id: u64) -> SessionReply {
        // 先处理已经排队的停止报告，创建请求不能越过同 id 更早的结束
        while let Some(id) = self.links.stop_notify.try_pop() {
            self.remove_session(id);
        }

        if self.stopped_sessions.contains(&session_id) {
            self.log(
                Level::Debug,
                format_args!("session {} already stopped, not recreated", session_id),
            );
            return SessionReply::Rejected(RejectReason::Stopped);
        }

        if let Some(existing) = self.sessions.get(&session_id) {
            return match self.config.duplicate_session_policy {
                DuplicateSessionPolicy::Reject => {
                    self.log(
                        Level::Warn,
                        format_args!("session {} already live, rejected", session_id),
                    );
                    SessionReply::Rejected(RejectReason::AlreadyLive)
                }
                DuplicateSessionPolicy::ReturnExisting => SessionReply::Existing(existing.clone()),
            };
        }

        let session = Session::new(session_id, self.links.clone());
        self.sessions.insert(session_id, session.clone());
        if let Some(sink) = &self.new_session_sink {
            if sink.send(session.clone()).is_err() {
                self.log(Level::Debug, format_args!("new session sink closed"));
            }
        }
        self.log(Level::Debug, format_args!("new session {}", session_id));
        SessionReply::Created(session)
    }

    fn dispatch(&mut self, frame: Bytes) {
        match Packet::from_bytes(frame) {
            Ok(Packet::Session { session_id, packet }) => self.route(session_id, packet),
            Ok(Packet::Ping) => self.pings_received += 1,
            Ok(Packet::Info(_)) => self.info_frames_received += 1,
            Err(e) => self.log(Level::Warn, format_args!("drop inbound frame: {}", e)),
        }
    }

    fn route(&mut self, session_id: u64, packet: SessionPacket) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.deliver(packet);
            return;
        }
        if self.stopped_sessions.contains(&session_id) {
            self.log(
                Level::Trace,
                format_args!("packet for stopped session {} dropped", session_id),
            );
            return;
        }
        if let SessionPacket::State(state) = packet {
            self.log(
                Level::Debug,
                format_args!("state {:?} for unknown session {} dropped", state, session_id),
            );
            return;
        }
        // 对端发起的会话
        if let SessionReply::Created(session) = self.open_session(session_id) {
            session.deliver(packet);
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.conns.len(),
            sessions: self.sessions.len(),
            stopped_sessions: self.stopped_sessions.len(),
            max_connections: self.max_conns,
            heartbeats: self.heartbeats,
            events: self.events,
            buffered_info_bytes: self.info.records_len(),
            pings_received: self.pings_received,
            info_frames_received: self.info_frames_received,
        }
    }

    fn finalize(mut self, mut inbox: Inbox, reason: ExitReason) {
        self.log(Level::Info, format_args!("stop ({:?})", reason));

        // 不再接收新连接和请求；还没处理的请求随 inbox 一起丢弃，请求方会得到 PoolClosed
        inbox.new_conns.stop();
        inbox.commands.close();
        while let Some((id, io)) = inbox.new_conns.try_pop() {
            drop(io);
            self.log(Level::Debug, format_args!("conn {} arrived after stop, closed", id));
        }

        for (_, conn) in self.conns.drain() {
            conn.stop();
        }
        for (id, session) in self.sessions.drain() {
            session.stop();
            self.stopped_sessions.insert(id);
        }
        self.lifecycle_tx.send_replace(Lifecycle::Closed);

        if let Some(listener) = self.stop_listener.take() {
            if listener.send(self.this.clone()).is_err() {
                self.log(Level::Debug, format_args!("stop listener closed"));
            }
        }

        self.links.outbound.stop();
        inbox.session_stops.stop();
        inbox.dead_conns.stop();
        inbox.infos.stop();
        inbox.inbound.stop();
        drop(inbox);

        self.lifecycle_tx.send_replace(Lifecycle::Finished);
    }

    fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if level <= self.config.log_level {
            log::log!(target: LOG_TARGET, level, "[ConnPool {}] {}", self.client_id, args);
        }
    }
}
