pub mod address;
pub mod forward;
pub mod socks5;
pub mod tcp;

#[allow(unused_imports)]
pub use socks5::Socks5Proxy;
#[allow(unused_imports)]
pub use tcp::TcpProxy;
