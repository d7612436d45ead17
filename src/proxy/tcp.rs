use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task;

use crate::net::conn::BufferedConnection;
use crate::proxy::socks5::{ErrorKind, Socks5Proxy};

#[derive(Error, Debug)]
pub enum TcpProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("SOCKS5 proxy error: {0}")]
    Socks5ProxyError(#[from] crate::proxy::socks5::Socks5ProxyError),
}

pub struct TcpProxy {
    socks5: Arc<Socks5Proxy>,
    buffer_size: usize,
    semaphore: Option<Arc<Semaphore>>,
}

impl TcpProxy {
    /// `max_connections` of `None` accepts without limit.
    pub fn new(socks5: Socks5Proxy, buffer_size: usize, max_connections: Option<usize>) -> Self {
        TcpProxy {
            socks5: Arc::new(socks5),
            buffer_size,
            semaphore: max_connections.map(|max| Arc::new(Semaphore::new(max))),
        }
    }

    /// Accept connections until Ctrl-C / SIGINT is received.
    pub async fn run(&self, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("listening on {}", addr),
            Err(e) => warn!("listening on unknown address: {}", e),
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.dispatch(stream, addr),
                        Err(e) => {
                            error!("accepting: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        info!("Stopped accepting new connections");
    }

    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        let permit = match &self.semaphore {
            Some(semaphore) => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("Max connections reached, rejecting {}", addr);
                    return;
                }
            },
            None => None,
        };

        let socks5 = self.socks5.clone();
        let buffer_size = self.buffer_size;
        task::spawn(async move {
            match Self::handle_connection(stream, addr, socks5, buffer_size).await {
                Ok(()) => {}
                Err(TcpProxyError::Socks5ProxyError(e)) if e.kind() == ErrorKind::Transport => {
                    warn!("{}: {}", addr, e)
                }
                Err(e) => error!("{}: {}", addr, e),
            }
            drop(permit);
        });
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        socks5: Arc<Socks5Proxy>,
        buffer_size: usize,
    ) -> Result<(), TcpProxyError> {
        stream.set_nodelay(true)?;
        let conn = BufferedConnection::new(stream, buffer_size);
        socks5.handle_connection(conn, addr).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn start_proxy(proxy: TcpProxy) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { proxy.run(listener).await });
        addr
    }

    async fn connect_through(proxy_addr: SocketAddr, target: SocketAddr) -> TcpStream {
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let ip = match target {
            SocketAddr::V4(addr) => addr.ip().octets(),
            SocketAddr::V6(_) => panic!("IPv4 targets only"),
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
        client
    }

    #[tokio::test]
    async fn test_concurrent_sessions() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = echo.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });

        let proxy_addr = start_proxy(TcpProxy::new(Socks5Proxy::new(None, false), 4096, None)).await;

        let mut first = connect_through(proxy_addr, echo_addr).await;
        let mut second = connect_through(proxy_addr, echo_addr).await;

        second.write_all(b"two").await.unwrap();
        first.write_all(b"one").await.unwrap();

        let mut buf = [0u8; 3];
        first.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");
        second.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");
    }

    #[tokio::test]
    async fn test_failed_session_does_not_stop_listener() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let proxy_addr = start_proxy(TcpProxy::new(Socks5Proxy::new(None, false), 4096, None)).await;

        let mut bad = TcpStream::connect(proxy_addr).await.unwrap();
        bad.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let mut rest = Vec::new();
        bad.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let _client = connect_through(proxy_addr, upstream_addr).await;
        assert!(upstream.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_max_connections_rejects_excess() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let proxy_addr =
            start_proxy(TcpProxy::new(Socks5Proxy::new(None, false), 4096, Some(1))).await;

        let _held = connect_through(proxy_addr, upstream_addr).await;

        let mut excess = TcpStream::connect(proxy_addr).await.unwrap();
        let mut rest = Vec::new();
        let _ = excess.write_all(&[0x05, 0x01, 0x00]).await;
        let _ = excess.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
