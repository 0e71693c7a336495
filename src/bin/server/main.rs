use anyhow::Context;
use clap::Parser;
use dashmap::DashMap;
use gnet_rs::transport::handshake::read_hello;
use gnet_rs::transport::{ByteCounters, ConnPool, PoolConfig, Session, SessionPacket, SessionState};
use gnet_rs::util::r#type::BoxedIo;
use gnet_rs::util::{Keys, PROGRAM_VERSION_NAME};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "gnet-server")]
#[command(about = "Multiplexed transport server")]
struct Args {
    #[arg(short = 'l', long, default_value = "0.0.0.0:8443", help = "Server listen address")]
    listen: String,

    #[arg(short = 's', long, help = "Shared secret")]
    secret: String,

    #[arg(short = 'c', long, help = "Pool config file (JSON)")]
    config: Option<String>,

    #[arg(long, help = "Heartbeat interval in milliseconds")]
    heartbeat_ms: Option<u64>,
}

struct ServerState {
    secret: String,
    keys: Keys,
    config: PoolConfig,
    pools: DashMap<u64, ConnPool>,
    stopped_tx: mpsc::UnboundedSender<ConnPool>,
    counters: Arc<ByteCounters>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if args.secret.is_empty() {
        error!("Please set secret");
        std::process::exit(1);
    }

    let mut config = match &args.config {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("read config file {}", path))?;
            PoolConfig::from_json(&content).with_context(|| format!("parse config file {}", path))?
        }
        None => PoolConfig::default(),
    };
    if let Some(ms) = args.heartbeat_ms {
        config = config.with_heartbeat_interval(Duration::from_millis(ms));
    }

    info!("[Server] {}", PROGRAM_VERSION_NAME);
    info!("[Server] Listening TCP {}", args.listen);

    let listener = TcpListener::bind(&args.listen).await?;

    let (stopped_tx, mut stopped_rx) = mpsc::unbounded_channel();
    let state = Arc::new(ServerState {
        keys: Keys::derive(&args.secret),
        secret: args.secret,
        config,
        pools: DashMap::new(),
        stopped_tx,
        counters: Arc::new(ByteCounters::new()),
    });

    // 回收已经结束的连接池
    {
        let state = state.clone();
        tokio::spawn(async move {
            while let Some(pool) = stopped_rx.recv().await {
                let client_id = pool.client_id();
                state.pools.remove_if(&client_id, |_, current| current.ptr_eq(&pool));
                info!(
                    "[Server] Client {} gone (pools {}, read {} sent {})",
                    client_id,
                    state.pools.len(),
                    state.counters.bytes_read(),
                    state.counters.bytes_sent()
                );
            }
        });
    }

    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, state).await {
                debug!("[Server] Connection {} error: {}", addr, e);
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ServerState>) -> anyhow::Result<()> {
    stream.set_nodelay(true)?;
    let client_id = read_hello(&mut stream, &state.keys).await?;

    let mut io: BoxedIo = Box::new(stream);
    loop {
        let pool = {
            let mut entry = state
                .pools
                .entry(client_id)
                .or_insert_with(|| new_pool(client_id, &state));
            if entry.is_closed() {
                *entry = new_pool(client_id, &state);
            }
            entry.value().clone()
        };

        match pool.try_submit_connection(io) {
            Ok(conn_id) => {
                debug!("[Server] Client {} connection {} accepted", client_id, conn_id);
                return Ok(());
            }
            Err(returned) => {
                // 连接池刚好在收尾，换一个新的
                debug!("[Server] Client {} pool closing, retrying", client_id);
                state.pools.remove_if(&client_id, |_, current| current.ptr_eq(&pool));
                io = returned;
            }
        }
    }
}

fn new_pool(client_id: u64, state: &ServerState) -> ConnPool {
    info!("[Server] New client {}", client_id);
    let (session_tx, mut session_rx) = mpsc::unbounded_channel();
    let pool = ConnPool::builder(client_id, state.secret.clone())
        .config(state.config.clone())
        .on_new_session(session_tx)
        .on_stopped(state.stopped_tx.clone())
        .byte_counters(state.counters.clone())
        .spawn();

    tokio::spawn(async move {
        while let Some(session) = session_rx.recv().await {
            tokio::spawn(echo_session(session));
        }
    });

    pool
}

/// 示例处理：把收到的数据原样发回同一个会话
async fn echo_session(session: Session) {
    debug!("[Server] Session {} opened", session.id());
    while let Some(packet) = session.recv().await {
        let result = match packet {
            SessionPacket::Data(data) => session.send(data),
            SessionPacket::State(SessionState::FinishSend) => session.finish_send(),
            SessionPacket::State(_) | SessionPacket::Info(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!("[Server] Session {} echo failed: {}", session.id(), e);
            break;
        }
    }
    debug!("[Server] Session {} closed", session.id());
}
