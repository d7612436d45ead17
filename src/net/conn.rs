use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

/// A stream with a read-ahead buffer.
///
/// Protocol parsing pulls bytes through the buffer in chunks of up to
/// `buffer_size`, so whatever the peer pipelined behind the last parsed
/// field stays in `read_buffer` until the relay drains it.
pub struct BufferedConnection<S = TcpStream> {
    stream: S,
    read_buffer: Vec<u8>,
    temp_buffer: Vec<u8>,
}

impl<S> BufferedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, buffer_size: usize) -> Self {
        BufferedConnection {
            stream,
            read_buffer: Vec::with_capacity(buffer_size),
            temp_buffer: vec![0u8; buffer_size],
        }
    }

    async fn fill(&mut self) -> io::Result<usize> {
        let n = self.stream.read(&mut self.temp_buffer).await?;
        if n > 0 {
            self.read_buffer.extend_from_slice(&self.temp_buffer[..n]);
        }
        Ok(n)
    }

    async fn ensure_bytes(&mut self, n: usize) -> io::Result<()> {
        while self.read_buffer.len() < n {
            if self.fill().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed",
                ));
            }
        }
        Ok(())
    }

    pub async fn read_exact_bytes(&mut self, n: usize) -> io::Result<Vec<u8>> {
        self.ensure_bytes(n).await?;
        Ok(self.read_buffer.drain(..n).collect())
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        self.ensure_bytes(1).await?;
        Ok(self.read_buffer.remove(0))
    }

    /// Network byte order.
    pub async fn read_u16(&mut self) -> io::Result<u16> {
        self.ensure_bytes(2).await?;
        let value = u16::from_be_bytes([self.read_buffer[0], self.read_buffer[1]]);
        self.read_buffer.drain(..2);
        Ok(value)
    }

    pub async fn discard(&mut self, n: usize) -> io::Result<()> {
        self.ensure_bytes(n).await?;
        self.read_buffer.drain(..n);
        Ok(())
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await
    }

    /// Bytes received from the peer but not consumed yet.
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }
}

/// Residual data in the read buffer is drained first before delegating to
/// the underlying stream, so a relay started after negotiation forwards
/// pipelined bytes in order.
impl<S> AsyncRead for BufferedConnection<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buffer.is_empty() {
            let to_copy = std::cmp::min(this.read_buffer.len(), buf.remaining());
            buf.put_slice(&this.read_buffer[..to_copy]);
            this.read_buffer.drain(..to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for BufferedConnection<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
