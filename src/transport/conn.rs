use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use atomic::Atomic;
use bytes::Bytes;
use tokio::sync::watch;

use crate::transport::frame::{read_frame, write_frame, LENGTH_PREFIX_SIZE};
use crate::transport::queue::Queue;
use crate::util::r#type::BoxedIo;

pub type ConnId = u64;

/// 连接读写字节统计，可以被多个连接池共享
#[derive(Debug)]
pub struct ByteCounters {
    read: Atomic<u64>,
    sent: Atomic<u64>,
}

impl ByteCounters {
    pub fn new() -> Self {
        Self {
            read: Atomic::new(0),
            sent: Atomic::new(0),
        }
    }

    pub fn add_read(&self, n: u64) {
        self.read.fetch_add(n, atomic::Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, atomic::Ordering::Relaxed);
    }

    pub fn bytes_read(&self) -> u64 {
        self.read.load(atomic::Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(atomic::Ordering::Relaxed)
    }
}

impl Default for ByteCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// 连接运行时需要的连接池队列
pub struct ConnContext {
    /// 待发送的帧，所有连接共同消费
    pub outbound: Queue<Bytes>,
    /// 收到的帧交给连接池
    pub inbound: Queue<Bytes>,
    /// 连接结束时上报自己的 id
    pub dead: Queue<ConnId>,
    pub counters: Option<Arc<ByteCounters>>,
    pub max_frame_size: usize,
}

/// 一条物理连接
///
/// 读写各一个任务；任何一边结束都会让整条连接结束，并且只上报一次死亡。
pub struct Conn {
    id: ConnId,
    stop_tx: Arc<watch::Sender<bool>>,
}

struct ConnShared {
    id: ConnId,
    dead: Queue<ConnId>,
    reported: AtomicBool,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ConnShared {
    fn finish(&self) {
        // 让另一半也退出
        self.stop_tx.send_replace(true);
        if !self.reported.swap(true, Ordering::AcqRel) {
            log::debug!("[Conn] Connection {} finished", self.id);
            // 连接池已经结束时队列会拒绝，忽略即可
            let _ = self.dead.push(self.id);
        }
    }
}

impl Conn {
    pub fn spawn(id: ConnId, io: BoxedIo, ctx: ConnContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let shared = Arc::new(ConnShared {
            id,
            dead: ctx.dead,
            reported: AtomicBool::new(false),
            stop_tx: stop_tx.clone(),
        });
        let (mut reader, mut writer) = tokio::io::split(io);

        // 读循环
        {
            let shared = shared.clone();
            let mut stop_rx = stop_rx.clone();
            let inbound = ctx.inbound;
            let counters = ctx.counters.clone();
            let max_frame_size = ctx.max_frame_size;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        res = read_frame(&mut reader, max_frame_size) => match res {
                            Ok(Some(frame)) => {
                                if let Some(counters) = &counters {
                                    counters.add_read((LENGTH_PREFIX_SIZE + frame.len()) as u64);
                                }
                                if inbound.push(frame).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => {
                                log::debug!("[Conn] Connection {} closed by peer", shared.id);
                                break;
                            }
                            Err(e) => {
                                log::warn!("[Conn] Connection {} read error: {}", shared.id, e);
                                break;
                            }
                        },
                    }
                }
                shared.finish();
            });
        }

        // 写循环
        {
            let shared = shared.clone();
            let mut stop_rx = stop_rx;
            let outbound = ctx.outbound;
            let counters = ctx.counters;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop_rx.changed() => break,
                        frame = outbound.pop() => {
                            let Some(frame) = frame else { break };
                            match write_frame(&mut writer, &frame).await {
                                Ok(n) => {
                                    if let Some(counters) = &counters {
                                        counters.add_sent(n as u64);
                                    }
                                }
                                Err(e) => {
                                    log::warn!("[Conn] Connection {} write error: {}", shared.id, e);
                                    break;
                                }
                            }
                        }
                    }
                }
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
                shared.finish();
            });
        }

        Self { id, stop_tx }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// 命令连接停止；可以重复调用
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
