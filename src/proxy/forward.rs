use log::trace;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;

/// Connects to `target`, pinning the local address to `bind` when one is
/// configured. The local port is always left to the OS.
pub async fn connect_tcp_stream(target: SocketAddr, bind: Option<IpAddr>) -> io::Result<TcpStream> {
    match bind {
        None => {
            trace!("connecting {}", target);
            TcpStream::connect(target).await
        }
        Some(bind_ip) => {
            trace!("connecting {} from {}", target, bind_ip);

            let socket = match target {
                SocketAddr::V4(..) => TcpSocket::new_v4()?,
                SocketAddr::V6(..) => TcpSocket::new_v6()?,
            };
            socket.bind(SocketAddr::new(bind_ip, 0))?;
            socket.connect(target).await
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client -> upstream"),
            Direction::UpstreamToClient => write!(f, "upstream -> client"),
        }
    }
}

/// How the first finished direction of a relay ended.
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: Direction,
    /// Bytes copied, or the transport error that stopped the copy.
    pub result: io::Result<u64>,
}

/// Copies bytes both ways between `client` and `upstream` until one
/// direction reaches EOF or fails.
///
/// Each direction runs in its own task. The first outcome ends the relay:
/// both tasks are aborted and joined so every half of both streams is
/// dropped before returning, and the other direction's outcome is never
/// looked at.
pub async fn relay<C, U>(client: C, upstream: U) -> RelayOutcome
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (tx, mut rx) = mpsc::channel(2);

    let outbound_tx = tx.clone();
    let outbound = tokio::spawn(async move {
        let result = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = outbound_tx
            .send(RelayOutcome {
                direction: Direction::ClientToUpstream,
                result,
            })
            .await;
    });

    let inbound = tokio::spawn(async move {
        let result = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = tx
            .send(RelayOutcome {
                direction: Direction::UpstreamToClient,
                result,
            })
            .await;
    });

    let outcome = rx.recv().await.unwrap_or_else(|| RelayOutcome {
        direction: Direction::ClientToUpstream,
        result: Err(io::Error::new(
            io::ErrorKind::Other,
            "relay tasks ended without an outcome",
        )),
    });

    outbound.abort();
    inbound.abort();
    let _ = outbound.await;
    let _ = inbound.await;

    outcome
}
