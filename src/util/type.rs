use tokio::io::{AsyncRead, AsyncWrite};

/// 可以交给连接池的双向字节流
///
/// 连接的读写两半各在一个任务里运行，所以只要求 `Send`。
/// 不要求 `Sync`：等待接入的连接只在队列里转移所有权，从不被共享引用。
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// 交给连接池的原始连接
pub type BoxedIo = Box<dyn AsyncReadWrite>;
