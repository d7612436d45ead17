use crate::common::config::Config;
use crate::common::logger;
use crate::proxy::socks5::Socks5Proxy;
use crate::proxy::tcp::TcpProxy;
use clap::Parser;
use log::LevelFilter;
use tokio::net::TcpListener;

mod common;
mod net;
mod proxy;

/// Fallback logger that writes to stderr when log4rs fails to initialise.
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= LevelFilter::Info
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[derive(Parser, Debug)]
#[command(author, version, about = "SOCKS5 CONNECT relay", long_about = None)]
struct Args {
    /// Optional config file (TOML, YAML or JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Which address:port to listen on
    #[arg(long, value_name = "ADDRESS")]
    listen: Option<String>,

    /// Which local address to bind outgoing connections to
    #[arg(long, value_name = "IP")]
    bind: Option<String>,

    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[arg(long, value_name = "SIZE")]
    buffer_size: Option<usize>,

    #[arg(long, value_name = "COUNT")]
    max_connections: Option<usize>,

    /// Answer failed requests with a SOCKS5 error status instead of just closing
    #[arg(long)]
    error_replies: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config from {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(log_level) = args.log_level {
        config.log.level = log_level;
    }
    if let Some(buffer_size) = args.buffer_size {
        config.buffer_size = buffer_size;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = Some(max_connections);
    }
    if args.error_replies {
        config.error_replies = true;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = logger::setup_logger(config.log.clone()) {
        eprintln!("Failed to initialize logger: {}", e);
        if log::set_boxed_logger(Box::new(SimpleLogger)).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    }

    log::debug!("Starting with config: {:?}", config);

    let bind_ip = match config.bind_ip() {
        Ok(bind_ip) => bind_ip,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let listen = config.listen_socket_address();
    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("listening on {:?}: {}", config.listen_address, e);
            std::process::exit(1);
        }
    };

    let proxy = TcpProxy::new(
        Socks5Proxy::new(bind_ip, config.error_replies),
        config.buffer_size,
        config.max_connections,
    );

    proxy.run(listener).await;
}
