use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::transport::error::{Error, Result};

pub const PACKET_TYPE_SESSION: u8 = 0;
pub const PACKET_TYPE_PING: u8 = 1;
pub const PACKET_TYPE_INFO: u8 = 2;

pub const SESSION_PACKET_TYPE_DATA: u8 = 0;
pub const SESSION_PACKET_TYPE_STATE: u8 = 1;
pub const SESSION_PACKET_TYPE_INFO: u8 = 2;

pub const STATE_FINISH_SEND: u8 = 0;
pub const STATE_ABORT_SEND: u8 = 1;
pub const STATE_FINISH_READ: u8 = 2;
pub const STATE_ABORT_READ: u8 = 3;
pub const STATE_STOP: u8 = 4;

pub const SESSION_ID_SIZE: usize = 8;
/// packet type + session id + sub type
pub const SESSION_HEADER_SIZE: usize = 1 + SESSION_ID_SIZE + 1;
pub const LENGTH_PREFIX_SIZE: usize = 4;

const INITIAL_INFO_CAPACITY: usize = 4096;

/// 会话状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    FinishSend,
    AbortSend,
    FinishRead,
    AbortRead,
    Stop,
}

impl SessionState {
    pub fn code(self) -> u8 {
        match self {
            SessionState::FinishSend => STATE_FINISH_SEND,
            SessionState::AbortSend => STATE_ABORT_SEND,
            SessionState::FinishRead => STATE_FINISH_READ,
            SessionState::AbortRead => STATE_ABORT_READ,
            SessionState::Stop => STATE_STOP,
        }
    }
}

impl TryFrom<u8> for SessionState {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            STATE_FINISH_SEND => Ok(SessionState::FinishSend),
            STATE_ABORT_SEND => Ok(SessionState::AbortSend),
            STATE_FINISH_READ => Ok(SessionState::FinishRead),
            STATE_ABORT_READ => Ok(SessionState::AbortRead),
            STATE_STOP => Ok(SessionState::Stop),
            _ => Err(Error::Malformed("unknown session state")),
        }
    }
}

/// 会话内的包
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPacket {
    Data(Bytes),
    State(SessionState),
    Info(Bytes),
}

/// 顶层包
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Session { session_id: u64, packet: SessionPacket },
    Ping,
    /// 心跳帧的记录部分；记录不自带长度，只能整体交出
    Info(Bytes),
}

impl Packet {
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Packet::Session { session_id, packet } => encode_session_packet(*session_id, packet),
            Packet::Ping => Bytes::from_static(&[PACKET_TYPE_PING]),
            Packet::Info(records) => {
                let mut buf = BytesMut::with_capacity(1 + records.len());
                buf.put_u8(PACKET_TYPE_INFO);
                buf.put_slice(records);
                buf.freeze()
            }
        }
    }

    pub fn from_bytes(mut data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Malformed("empty frame"));
        }

        match data.get_u8() {
            PACKET_TYPE_SESSION => {
                if data.len() < SESSION_ID_SIZE + 1 {
                    return Err(Error::Malformed("short session packet"));
                }
                let session_id = data.get_u64();
                let packet = match data.get_u8() {
                    SESSION_PACKET_TYPE_DATA => SessionPacket::Data(data),
                    SESSION_PACKET_TYPE_STATE => {
                        if data.is_empty() {
                            return Err(Error::Malformed("missing state code"));
                        }
                        SessionPacket::State(SessionState::try_from(data.get_u8())?)
                    }
                    SESSION_PACKET_TYPE_INFO => SessionPacket::Info(data),
                    _ => return Err(Error::Malformed("unknown session packet type")),
                };
                Ok(Packet::Session { session_id, packet })
            }
            PACKET_TYPE_PING => Ok(Packet::Ping),
            PACKET_TYPE_INFO => Ok(Packet::Info(data)),
            _ => Err(Error::Malformed("unknown packet type")),
        }
    }
}

pub fn encode_session_packet(session_id: u64, packet: &SessionPacket) -> Bytes {
    let body_len = match packet {
        SessionPacket::Data(data) | SessionPacket::Info(data) => data.len(),
        SessionPacket::State(_) => 1,
    };
    let mut buf = BytesMut::with_capacity(SESSION_HEADER_SIZE + body_len);
    buf.put_u8(PACKET_TYPE_SESSION);
    buf.put_u64(session_id);
    match packet {
        SessionPacket::Data(data) => {
            buf.put_u8(SESSION_PACKET_TYPE_DATA);
            buf.put_slice(data);
        }
        SessionPacket::State(state) => {
            buf.put_u8(SESSION_PACKET_TYPE_STATE);
            buf.put_u8(state.code());
        }
        SessionPacket::Info(data) => {
            buf.put_u8(SESSION_PACKET_TYPE_INFO);
            buf.put_slice(data);
        }
    }
    buf.freeze()
}

/// 心跳之间累积的会话信息
///
/// 缓冲区总是以 INFO 包类型开头，`take_frame` 交出当前内容并换上新缓冲区，
/// 所以空窗口也会得到一个只有包头的帧。
pub struct InfoBuffer {
    buf: BytesMut,
}

impl InfoBuffer {
    pub fn new() -> Self {
        Self { buf: Self::fresh() }
    }

    fn fresh() -> BytesMut {
        let mut buf = BytesMut::with_capacity(INITIAL_INFO_CAPACITY);
        buf.put_u8(PACKET_TYPE_INFO);
        buf
    }

    /// 追加一条记录，按到达顺序排列
    pub fn push(&mut self, session_id: u64, payload: &[u8]) {
        self.buf.put_u64(session_id);
        self.buf.put_slice(payload);
    }

    /// 已累积的记录字节数（不含包头）
    pub fn records_len(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn take_frame(&mut self) -> Bytes {
        std::mem::replace(&mut self.buf, Self::fresh()).freeze()
    }
}

impl Default for InfoBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// 写一帧：u32 大端长度 + 帧内容，返回写出的总字节数
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<usize>
where
    W: tokio::io::AsyncWrite + Unpin + ?Sized,
{
    let len = u32::try_from(frame.len()).map_err(|_| Error::FrameTooLarge {
        size: frame.len(),
        limit: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(LENGTH_PREFIX_SIZE + frame.len())
}

/// 读一帧；对端正常关闭时返回 `Ok(None)`
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Bytes>>
where
    R: tokio::io::AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(Error::FrameTooLarge {
            size: len,
            limit: max_frame_size,
        });
    }

    let mut data = BytesMut::zeroed(len);
    reader.read_exact(&mut data).await?;
    Ok(Some(data.freeze()))
}
