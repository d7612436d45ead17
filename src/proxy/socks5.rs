use log::{debug, info, trace};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::net::conn::BufferedConnection;
use crate::proxy::address::*;
use crate::proxy::forward;

#[derive(Error, Debug)]
pub enum Socks5ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Unknown SOCKS version: {0:#04x}")]
    InvalidVersion(u8),
    #[error("Client does not support using no authentication")]
    NoSupportedAuthMethod,
    #[error("Unknown SOCKS command, want CONNECT: {0:#04x}")]
    UnsupportedCommand(u8),
    #[error("Unknown address type: {0:#04x}")]
    InvalidAddressType(u8),
    #[error("Invalid UTF-8 in hostname")]
    InvalidHostname(#[from] std::string::FromUtf8Error),
    #[error("Resolving {host:?}: {source}")]
    ResolutionFailed { host: String, source: io::Error },
    #[error("Dialing {target}: {source}")]
    ConnectError { target: SocketAddr, source: io::Error },
}

/// Failure classes a session can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Protocol,
    Resolution,
    UpstreamDial,
    Transport,
}

impl Socks5ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Socks5ProxyError::IoError(_) => ErrorKind::Transport,
            Socks5ProxyError::InvalidVersion(_)
            | Socks5ProxyError::NoSupportedAuthMethod
            | Socks5ProxyError::UnsupportedCommand(_)
            | Socks5ProxyError::InvalidAddressType(_)
            | Socks5ProxyError::InvalidHostname(_) => ErrorKind::Protocol,
            Socks5ProxyError::ResolutionFailed { .. } => ErrorKind::Resolution,
            Socks5ProxyError::ConnectError { .. } => ErrorKind::UpstreamDial,
        }
    }

    /// Status byte for the opt-in failure reply, if this error gets one.
    fn reply_code(&self) -> Option<u8> {
        match self {
            Socks5ProxyError::UnsupportedCommand(_) => Some(REPLY_COMMAND_NOT_SUPPORTED),
            Socks5ProxyError::InvalidAddressType(_) => Some(REPLY_ADDRESS_TYPE_NOT_SUPPORTED),
            Socks5ProxyError::InvalidVersion(_) | Socks5ProxyError::InvalidHostname(_) => {
                Some(REPLY_GENERAL_FAILURE)
            }
            Socks5ProxyError::ResolutionFailed { .. } => Some(REPLY_HOST_UNREACHABLE),
            Socks5ProxyError::ConnectError { source, .. } => Some(dial_error_reply_code(source)),
            Socks5ProxyError::IoError(_) | Socks5ProxyError::NoSupportedAuthMethod => None,
        }
    }
}

fn dial_error_reply_code(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::TimedOut | io::ErrorKind::AddrNotAvailable => REPLY_HOST_UNREACHABLE,
        io::ErrorKind::PermissionDenied => REPLY_CONNECTION_NOT_ALLOWED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

/// Where a session is in the negotiation. States only move forward; any
/// failure goes straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    AwaitingGreeting,
    MethodSelected,
    AwaitingRequest,
    AddressResolved,
    UpstreamConnected,
    ReplySent,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A parsed CONNECT request with its destination already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub address: AddressSpec,
    pub ip: IpAddr,
    pub port: u16,
}

impl ConnectRequest {
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

pub struct Socks5Proxy {
    bind_address: Option<IpAddr>,
    error_replies: bool,
}

impl Socks5Proxy {
    pub fn new(bind_address: Option<IpAddr>, error_replies: bool) -> Self {
        Socks5Proxy {
            bind_address,
            error_replies,
        }
    }

    /// Runs one client through negotiation and relay. Both sockets are
    /// closed when this returns, whichever way it ends.
    pub async fn handle_connection<S>(
        &self,
        mut conn: BufferedConnection<S>,
        peer: SocketAddr,
    ) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut state = SessionState::AwaitingGreeting;
        let result = self.run_session(&mut conn, peer, &mut state).await;
        match result {
            Ok(upstream) => {
                advance(&mut state, SessionState::Relaying, peer);
                let outcome = forward::relay(conn, upstream).await;
                match outcome.result {
                    Ok(bytes) => debug!(
                        "{}: {} finished after {} bytes",
                        peer, outcome.direction, bytes
                    ),
                    Err(e) => debug!("{}: {} failed: {}", peer, outcome.direction, e),
                }
                advance(&mut state, SessionState::Closed, peer);
                Ok(())
            }
            Err(e) => {
                if self.error_replies && state >= SessionState::AwaitingRequest {
                    if let Some(code) = e.reply_code() {
                        let _ = self.send_reply(&mut conn, &BindReply::failure(code)).await;
                    }
                }
                advance(&mut state, SessionState::Closed, peer);
                Err(e)
            }
        }
    }

    async fn run_session<S>(
        &self,
        conn: &mut BufferedConnection<S>,
        peer: SocketAddr,
        state: &mut SessionState,
    ) -> Result<TcpStream, Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.handshake(conn).await?;
        advance(state, SessionState::MethodSelected, peer);
        advance(state, SessionState::AwaitingRequest, peer);

        let request = self.handle_request(conn).await?;
        advance(state, SessionState::AddressResolved, peer);

        let upstream = self.connect_upstream(&request).await?;
        advance(state, SessionState::UpstreamConnected, peer);

        let reply = BindReply::for_connection(upstream.local_addr()?, request.ip);
        self.send_reply(conn, &reply).await?;
        advance(state, SessionState::ReplySent, peer);

        info!("proxying {} -> {}", peer, request.target());
        if conn.buffered() > 0 {
            trace!("{}: {} bytes pipelined behind the request", peer, conn.buffered());
        }
        Ok(upstream)
    }

    /// Greeting:
    /// +----+----------+----------+
    /// |VER | NMETHODS | METHODS  |
    /// +----+----------+----------+
    /// | 1  |    1     | 1 to 255 |
    /// +----+----------+----------+
    pub async fn handshake<S>(&self, conn: &mut BufferedConnection<S>) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = conn.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(Socks5ProxyError::InvalidVersion(version));
        }

        let nmethods = conn.read_u8().await? as usize;
        let methods = conn.read_exact_bytes(nmethods).await?;

        if !methods.contains(&METHOD_NO_AUTH) {
            if self.error_replies {
                conn.write(&[SOCKS5_VERSION, METHOD_NOT_ACCEPTABLE]).await?;
            }
            return Err(Socks5ProxyError::NoSupportedAuthMethod);
        }

        conn.write(&[SOCKS5_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    }

    /// Request:
    /// +----+-----+-------+------+----------+----------+
    /// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    /// +----+-----+-------+------+----------+----------+
    /// | 1  |  1  | X'00' |  1   | Variable |    2     |
    /// +----+-----+-------+------+----------+----------+
    ///
    /// A hostname is read in full before it is resolved; the port follows
    /// the lookup.
    pub async fn handle_request<S>(
        &self,
        conn: &mut BufferedConnection<S>,
    ) -> Result<ConnectRequest, Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let version = conn.read_u8().await?;
        if version != SOCKS5_VERSION {
            return Err(Socks5ProxyError::InvalidVersion(version));
        }

        let command = conn.read_u8().await?;
        if command != CMD_CONNECT {
            return Err(Socks5ProxyError::UnsupportedCommand(command));
        }

        conn.discard(1).await?;

        let address = AddressSpec::read_from(conn)
            .await?
            .map_err(Socks5ProxyError::InvalidAddressType)?;

        let ip = match &address {
            AddressSpec::Ipv4(ip) => IpAddr::V4(*ip),
            AddressSpec::Ipv6(ip) => IpAddr::V6(*ip),
            AddressSpec::Domain(host) => {
                let host = String::from_utf8(host.clone())?;
                match resolve_host(&host).await {
                    Ok(ip) => ip,
                    Err(source) => return Err(Socks5ProxyError::ResolutionFailed { host, source }),
                }
            }
        };

        let port = conn.read_u16().await?;

        debug!("CONNECT {}:{} resolved to {}", address, port, ip);
        Ok(ConnectRequest { address, ip, port })
    }

    async fn connect_upstream(&self, request: &ConnectRequest) -> Result<TcpStream, Socks5ProxyError> {
        let target = request.target();
        forward::connect_tcp_stream(target, self.bind_address)
            .await
            .map_err(|source| Socks5ProxyError::ConnectError { target, source })
    }

    async fn send_reply<S>(
        &self,
        conn: &mut BufferedConnection<S>,
        reply: &BindReply,
    ) -> Result<(), Socks5ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        conn.write(&reply.encode()).await?;
        Ok(())
    }
}

fn advance(state: &mut SessionState, next: SessionState, peer: SocketAddr) {
    trace!("{}: {} -> {}", peer, state, next);
    *state = next;
}
