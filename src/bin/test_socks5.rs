use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpStream};

fn main() {
    let mut args = std::env::args().skip(1);
    let proxy = args.next().unwrap_or_else(|| "127.0.0.1:1080".to_string());
    let target = args.next().unwrap_or_else(|| "127.0.0.1:80".to_string());

    match test_socks5_connect(&proxy, &target) {
        Ok(()) => {
            println!("SOCKS5 CONNECT test passed");
            std::process::exit(0);
        }
        Err(e) => {
            println!("SOCKS5 proxy test failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Encodes `host:port` as ATYP + DST.ADDR + DST.PORT.
fn encode_target(target: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("target {:?} is not host:port", target))?;
    let port: u16 = port.parse()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let mut out = Vec::new();
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            out.push(0x01);
            out.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            out.push(0x04);
            out.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err("hostname longer than 255 bytes".into());
            }
            out.push(0x03);
            out.push(host.len() as u8);
            out.extend_from_slice(host.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    Ok(out)
}

fn test_socks5_connect(proxy: &str, target: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("Connecting to SOCKS5 proxy at {}...", proxy);

    let mut sock = TcpStream::connect(proxy)?;
    println!("Connected successfully");

    // SOCKS5 handshake: version 5, 1 method, method 0 (no authentication)
    sock.write_all(b"\x05\x01\x00")?;
    println!("Handshake request sent: 0x05 0x01 0x00");

    let mut response = [0u8; 2];
    sock.read_exact(&mut response)?;
    println!(
        "Handshake response received: {:02x} {:02x}",
        response[0], response[1]
    );

    if response != [0x05, 0x00] {
        return Err(format!("Invalid handshake response: {:?}", response).into());
    }

    let mut request = vec![0x05, 0x01, 0x00];
    request.extend_from_slice(&encode_target(target)?);
    sock.write_all(&request)?;
    println!("CONNECT request sent for {}", target);

    let mut header = [0u8; 4];
    sock.read_exact(&mut header)?;
    if header[0] != 0x05 || header[1] != 0x00 {
        return Err(format!("CONNECT rejected: {:02x?}", header).into());
    }

    let bound: IpAddr = match header[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            sock.read_exact(&mut octets)?;
            Ipv4Addr::from(octets).into()
        }
        0x04 => {
            let mut octets = [0u8; 16];
            sock.read_exact(&mut octets)?;
            Ipv6Addr::from(octets).into()
        }
        other => return Err(format!("Unexpected address type in reply: {:#04x}", other).into()),
    };
    let mut port = [0u8; 2];
    sock.read_exact(&mut port)?;

    println!(
        "Proxy bound {}:{} for the upstream connection",
        bound,
        u16::from_be_bytes(port)
    );
    Ok(())
}
