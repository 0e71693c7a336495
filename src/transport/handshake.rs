use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::transport::error::{Error, Result};
use crate::transport::frame::{read_frame, write_frame};
use crate::util::Keys;

/// client id + 认证标签
pub const HELLO_SIZE: usize = 8 + 32;

/// 新连接上的第一帧，告诉服务端这条连接属于哪个客户端
///
/// | client id           | sha256(key bytes ‖ client id) |
/// | Big-Endian uint64   | 32 Bytes                      |
pub async fn write_hello<W>(writer: &mut W, keys: &Keys, client_id: u64) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut hello = BytesMut::with_capacity(HELLO_SIZE);
    hello.put_u64(client_id);
    hello.put_slice(&keys.auth_tag(client_id));
    write_frame(writer, &hello).await?;
    Ok(())
}

/// 读取并校验握手，返回 client id
pub async fn read_hello<R>(reader: &mut R, keys: &Keys) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut frame = read_frame(reader, HELLO_SIZE)
        .await?
        .ok_or(Error::Malformed("connection closed before hello"))?;
    if frame.len() != HELLO_SIZE {
        return Err(Error::Malformed("bad hello length"));
    }

    let client_id = frame.get_u64();
    if frame.as_ref() != keys.auth_tag(client_id).as_slice() {
        return Err(Error::BadHandshake(client_id));
    }
    Ok(client_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hello_roundtrip_with_same_secret() {
        let keys = Keys::derive("shared");
        let (mut client, mut server) = tokio::io::duplex(128);
        write_hello(&mut client, &keys, 99).await.unwrap();
        assert_eq!(read_hello(&mut server, &keys).await.unwrap(), 99);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(128);
        write_hello(&mut client, &Keys::derive("client"), 7).await.unwrap();
        let err = read_hello(&mut server, &Keys::derive("server")).await.unwrap_err();
        assert!(matches!(err, Error::BadHandshake(7)));
    }

    #[tokio::test]
    async fn early_close_is_malformed() {
        let (client, mut server) = tokio::io::duplex(128);
        drop(client);
        let err = read_hello(&mut server, &Keys::derive("k")).await.unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }
}
