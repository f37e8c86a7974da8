use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use icmp_tunnel::config::TunnelConfig;
use icmp_tunnel::icmp_conn::IcmpConn;
use icmp_tunnel::logical_addr::LogicalAddr;
use icmp_tunnel::packet_conn::PacketConn;
use tracing::{info, warn, Level};

const ECHO_PORT: u32 = 6789;

/// Echoes datagrams through an ICMP tunnel. Needs root or CAP_NET_RAW.
///
/// Client and server may run on the same host: each raw socket sees the other's frames as well
///  as its own, and frame validation drops those of the wrong echo type.
#[derive(Parser)]
struct Args {
    #[clap(long, default_value_t = false)]
    server: bool,

    /// the server to send to (client only)
    #[clap(long, default_value = "127.0.0.1")]
    host: Ipv4Addr,

    #[clap(long, default_value = "0.0.0.0")]
    bind: Ipv4Addr,

    #[clap(long, default_value_t = 10)]
    count: usize,

    #[clap(long, default_value_t = 64)]
    size: usize,

    /// receive through an XDP program attached to this interface (server only)
    #[clap(long)]
    interface: Option<String>,

    #[clap(long, default_value = "icmp_inject.o")]
    xdp_object: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.server {
        let mut config = TunnelConfig::default_server();
        config.bind_addr = args.bind;

        let conn = match &args.interface {
            None => IcmpConn::listen_v4(config).await?,
            Some(interface) => listen_xdp(config, interface, &args.xdp_object).await?,
        };
        run_server(conn).await
    }
    else {
        let mut config = TunnelConfig::default_client();
        config.bind_addr = args.bind;

        let conn = IcmpConn::listen_v4(config).await?;
        run_client(conn, LogicalAddr::new(args.host, ECHO_PORT), args.count, args.size).await
    }
}

#[cfg(feature = "xdp")]
async fn listen_xdp(config: TunnelConfig, interface: &str, object_path: &str) -> anyhow::Result<IcmpConn> {
    let xdp_config = icmp_tunnel::config::XdpConfig::new(interface, object_path);
    IcmpConn::listen_xdp(config, &xdp_config).await
}

#[cfg(not(feature = "xdp"))]
async fn listen_xdp(_config: TunnelConfig, _interface: &str, _object_path: &str) -> anyhow::Result<IcmpConn> {
    bail!("built without the 'xdp' feature")
}

async fn run_server(conn: IcmpConn) -> anyhow::Result<()> {
    info!("echo server listening on {}", conn.local_addr());

    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = conn.read_from(&mut buf).await?;
        let Some(from) = from else {
            continue;
        };
        info!("echoing {} bytes to {:?}", n, from);
        conn.write_to(&buf[..n], from).await?;
    }
}

async fn run_client(conn: IcmpConn, server: LogicalAddr, count: usize, size: usize) -> anyhow::Result<()> {
    if size == 0 {
        bail!("payload size must be positive");
    }

    let mut buf = vec![0u8; 2048];
    let mut received = 0;
    for i in 0..count {
        let payload = (0..size).map(|n| (n + i) as u8).collect::<Vec<_>>();
        let start = Instant::now();
        conn.write_to(&payload, server).await?;

        match tokio::time::timeout(Duration::from_secs(1), conn.read_from(&mut buf)).await {
            Ok(result) => {
                let (n, from) = result?;
                received += 1;
                info!("#{}: {} bytes from {:?} in {:?}", i, n, from, start.elapsed());
            }
            Err(_) => warn!("#{}: no reply within 1s", i),
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    info!("{} of {} echoes received", received, count);
    conn.close()
}
