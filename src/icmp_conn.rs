use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};
use crate::buffers::buffer_pool::FrameBufferPool;
use crate::config::{TunnelConfig, XdpConfig};
use crate::frame_codec::FrameCodec;
use crate::ingestion::{run_ingestion, IngestionSource};
use crate::logical_addr::LogicalAddr;
use crate::packet_conn::PacketConn;
use crate::raw_socket::{RawIcmpSocket, RawSocketSource};
use crate::receive_cache::ReceiveCache;
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::xdp::{shut_down_kernel_program, start_kernel_program, KernelEventSource, KernelProgram};

/// A [PacketConn] tunneling payload through ICMP echo requests (client role) or replies (server
///  role). Outbound frames always go through a raw socket; inbound frames come either from the
///  same raw socket or from a kernel program intercepting them.
///
/// Every connection runs a background ingestion task that lives until the connection is closed.
pub struct IcmpConn {
    correlation_id: u16,
    local_ip: Ipv4Addr,
    codec: Arc<FrameCodec>,
    cache: Arc<ReceiveCache>,
    send_pipeline: SendPipeline,
    kernel_program: Mutex<Option<Box<dyn KernelProgram>>>,
    closed: AtomicBool,
}

impl IcmpConn {
    /// Opens a connection that receives through a raw ICMP socket. This requires root or
    ///  `CAP_NET_RAW`.
    pub async fn listen_v4(config: TunnelConfig) -> anyhow::Result<IcmpConn> {
        config.validate()?;

        let socket = Arc::new(RawIcmpSocket::bind(config.bind_addr)?);
        Ok(Self::start(&config, socket.clone(), None, |closed| RawSocketSource::new(socket, closed)))
    }

    pub async fn listen_v6(_config: TunnelConfig) -> anyhow::Result<IcmpConn> {
        bail!("ICMP tunneling over IPv6 is not implemented")
    }

    /// Opens a connection that receives through the kernel program loaded from the configured
    ///  eBPF object file.
    #[cfg(feature = "xdp")]
    pub async fn listen_xdp(config: TunnelConfig, xdp_config: &XdpConfig) -> anyhow::Result<IcmpConn> {
        let program = crate::xdp::aya_program::AyaXdpProgram::new(xdp_config);
        Self::listen_with_kernel_program(config, xdp_config, Box::new(program)).await
    }

    /// Opens a connection that receives through a kernel program. The program is loaded, its
    ///  event channel is started and it is attached to the interface, before the outbound raw
    ///  socket is opened. If any of these steps fails, everything acquired so far is released.
    pub async fn listen_with_kernel_program(config: TunnelConfig, xdp_config: &XdpConfig, program: Box<dyn KernelProgram>) -> anyhow::Result<IcmpConn> {
        Self::start_with_kernel_program(config, xdp_config, program, |bind_addr| {
            let socket: Arc<dyn SendSocket> = Arc::new(RawIcmpSocket::bind(bind_addr)?);
            Ok(socket)
        })
    }

    fn start_with_kernel_program(
        config: TunnelConfig,
        xdp_config: &XdpConfig,
        mut program: Box<dyn KernelProgram>,
        open_socket: impl FnOnce(Ipv4Addr) -> anyhow::Result<Arc<dyn SendSocket>>,
    ) -> anyhow::Result<IcmpConn> {
        config.validate()?;
        xdp_config.validate()?;

        let events = start_kernel_program(program.as_mut(), &xdp_config.interface, xdp_config.event_batch_size)?;
        let socket = match open_socket(config.bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                shut_down_kernel_program(program.as_mut());
                return Err(e);
            }
        };

        Ok(Self::start(&config, socket, Some(program), |closed| KernelEventSource::new(events, closed)))
    }

    /// Wires up codec, receive cache and send pipeline, and spawns the ingestion loop. This must
    ///  be called from inside a tokio runtime.
    fn start<S: IngestionSource>(
        config: &TunnelConfig,
        socket: Arc<dyn SendSocket>,
        kernel_program: Option<Box<dyn KernelProgram>>,
        source: impl FnOnce(watch::Receiver<bool>) -> S,
    ) -> IcmpConn {
        let pool = Arc::new(FrameBufferPool::new());
        let codec = Arc::new(FrameCodec::new(config.role, config.validate_frames, pool));
        let cache = Arc::new(ReceiveCache::new(codec.clone(), config.queue_capacity));

        tokio::spawn(run_ingestion(source(cache.closed_signal()), cache.clone()));
        info!("opened ICMP tunnel connection as {:?} on {} with correlation id {}", config.role, config.bind_addr, config.correlation_id);

        IcmpConn {
            correlation_id: config.correlation_id,
            local_ip: config.bind_addr,
            codec,
            cache,
            send_pipeline: SendPipeline::new(socket),
            kernel_program: Mutex::new(kernel_program),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PacketConn for IcmpConn {
    async fn write_to(&self, payload: &[u8], to: LogicalAddr) -> anyhow::Result<usize> {
        if self.is_closed() {
            bail!("connection closed");
        }
        let ip = to.ipv4()?;

        let frames = self.codec.encode(self.correlation_id, to.port, payload);
        self.send_pipeline.send_frames(ip, frames).await?;
        Ok(payload.len())
    }

    async fn read_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Option<LogicalAddr>)> {
        self.cache.read_from(buf).await
    }

    fn local_addr(&self) -> LogicalAddr {
        LogicalAddr::new(self.local_ip, self.correlation_id as u32)
    }

    fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("connection is already closed");
            return Ok(());
        }

        info!("closing ICMP tunnel connection with correlation id {}", self.correlation_id);
        self.cache.close();
        self.send_pipeline.close();

        if let Some(mut program) = self.kernel_program.lock().unwrap().take() {
            shut_down_kernel_program(program.as_mut());
        }
        Ok(())
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()> {
        self.send_pipeline.set_write_deadline(deadline);
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> anyhow::Result<()> {
        bail!("read deadlines are not supported")
    }

    fn set_deadline(&self, _deadline: Option<Instant>) -> anyhow::Result<()> {
        bail!("read deadlines are not supported")
    }
}

impl Drop for IcmpConn {
    fn drop(&mut self) {
        let _ = PacketConn::close(self);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv6Addr};
    use std::time::Duration;
    use bytes::BytesMut;
    use mockall::Sequence;
    use tokio::sync::mpsc;
    use crate::echo_frame::{HEADER_LEN, MAX_PAYLOAD_LEN};
    use crate::frame_codec::Role;
    use crate::send_pipeline::MockSendSocket;
    use crate::test_util::ChannelSource;
    use crate::xdp::MockKernelProgram;
    use super::*;

    type Inbound = mpsc::UnboundedSender<(IpAddr, Vec<u8>)>;
    type Outbound = mpsc::UnboundedReceiver<(Ipv4Addr, Vec<u8>)>;

    fn config(role: Role, bind_addr: Ipv4Addr, correlation_id: u16) -> TunnelConfig {
        TunnelConfig {
            role,
            bind_addr,
            correlation_id,
            ..TunnelConfig::default_client()
        }
    }

    fn recording_socket() -> (Arc<dyn SendSocket>, Outbound) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut socket = MockSendSocket::new();
        socket.expect_do_send_frame()
            .returning(move |to, frame| {
                sender.send((to, frame.to_vec())).unwrap();
                Ok(())
            });
        (Arc::new(socket), receiver)
    }

    fn conn(role: Role, bind_addr: Ipv4Addr, correlation_id: u16) -> (IcmpConn, Inbound, Outbound) {
        let (socket, outbound) = recording_socket();
        let (inbound, source) = ChannelSource::new();
        let conn = IcmpConn::start(&config(role, bind_addr, correlation_id), socket, None, |_| source);
        (conn, inbound, outbound)
    }

    /// a record as the kernel delivers it: padded to 8 byte alignment
    fn event_record(source: Ipv4Addr, icmp: &[u8]) -> BytesMut {
        let mut result = BytesMut::new();
        result.extend_from_slice(&((34 + icmp.len()) as u64).to_le_bytes());
        result.extend_from_slice(&[0u8; 26]);
        result.extend_from_slice(&source.octets());
        result.extend_from_slice(&[0u8; 4]);
        result.extend_from_slice(icmp);
        while result.len() % 8 != 0 {
            result.extend_from_slice(&[0]);
        }
        result
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let client_ip = Ipv4Addr::new(10, 0, 0, 5);
        let server_ip = Ipv4Addr::new(10, 0, 0, 1);
        let (client, client_inbound, mut client_outbound) = conn(Role::Client, client_ip, 4242);
        let (server, server_inbound, mut server_outbound) = conn(Role::Server, server_ip, 1);

        assert_eq!(client.write_to(b"hello", LogicalAddr::new(server_ip, 6789)).await.unwrap(), 5);
        let (to, request) = client_outbound.recv().await.unwrap();
        assert_eq!(to, server_ip);
        assert_eq!(request.len(), HEADER_LEN + 5);
        assert_eq!(request[0], 8);
        assert_eq!(&request[4..8], &[0x10, 0x92, 0x1a, 0x85]);

        server_inbound.send((client_ip.into(), request)).unwrap();
        let mut buf = [0u8; 1500];
        let (n, from) = server.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        let from = from.unwrap();
        assert_eq!(from, LogicalAddr::new(client_ip, 278_010_501));

        assert_eq!(server.write_to(b"world", from).await.unwrap(), 5);
        let (to, reply) = server_outbound.recv().await.unwrap();
        assert_eq!(to, client_ip);
        assert_eq!(reply[0], 0);
        assert_eq!(&reply[4..8], &[0x10, 0x92, 0x1a, 0x85]);

        client_inbound.send((server_ip.into(), reply)).unwrap();
        let (n, from) = client.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(from, Some(LogicalAddr::new(server_ip, 6789)));
    }

    #[tokio::test]
    async fn test_fragmented_write() {
        let (client, _client_inbound, mut client_outbound) = conn(Role::Client, Ipv4Addr::LOCALHOST, 7);
        let (server, server_inbound, _server_outbound) = conn(Role::Server, Ipv4Addr::LOCALHOST, 1);

        let payload = (0..3000).map(|i| i as u8).collect::<Vec<_>>();
        assert_eq!(client.write_to(&payload, LogicalAddr::new(Ipv4Addr::LOCALHOST, 9)).await.unwrap(), 3000);

        for _ in 0..3 {
            let (_, frame) = client_outbound.recv().await.unwrap();
            server_inbound.send((Ipv4Addr::LOCALHOST.into(), frame)).unwrap();
        }

        let mut received = Vec::new();
        let mut buf = [0u8; 2000];
        for expected_len in [MAX_PAYLOAD_LEN, MAX_PAYLOAD_LEN, 100] {
            let (n, from) = server.read_from(&mut buf).await.unwrap();
            assert_eq!(n, expected_len);
            assert_eq!(from.unwrap().echo_fields(), (7, 9));
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_empty_write() {
        let (client, _inbound, mut outbound) = conn(Role::Client, Ipv4Addr::LOCALHOST, 7);

        assert_eq!(client.write_to(b"", LogicalAddr::new(Ipv4Addr::LOCALHOST, 9)).await.unwrap(), 0);
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ipv6_destination() {
        let (client, _inbound, mut outbound) = conn(Role::Client, Ipv4Addr::LOCALHOST, 7);

        assert!(client.write_to(b"abc", LogicalAddr::new(Ipv6Addr::LOCALHOST, 9)).await.is_err());
        assert!(outbound.try_recv().is_err());

        // the connection stays usable
        assert_eq!(client.write_to(b"abc", LogicalAddr::new(Ipv4Addr::LOCALHOST, 9)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_listen_v6() {
        assert!(IcmpConn::listen_v6(TunnelConfig::default_server()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_addr() {
        let (conn, _inbound, _outbound) = conn(Role::Client, Ipv4Addr::new(10, 0, 0, 5), 4242);
        assert_eq!(conn.local_addr(), LogicalAddr::new(Ipv4Addr::new(10, 0, 0, 5), 4242));
    }

    #[tokio::test]
    async fn test_deadlines() {
        let (conn, _inbound, mut outbound) = conn(Role::Client, Ipv4Addr::LOCALHOST, 1);
        let to = LogicalAddr::new(Ipv4Addr::LOCALHOST, 2);

        assert!(conn.set_read_deadline(Some(Instant::now())).is_err());
        assert!(conn.set_deadline(Some(Instant::now())).is_err());

        conn.set_write_deadline(Some(Instant::now() - Duration::from_millis(1))).unwrap();
        assert!(conn.write_to(b"abc", to).await.is_err());
        assert!(outbound.try_recv().is_err());

        conn.set_write_deadline(None).unwrap();
        assert_eq!(conn.write_to(b"abc", to).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_close() {
        let (socket, _outbound) = recording_socket();
        let (_inbound, source) = ChannelSource::new();
        let conn = IcmpConn::start(&config(Role::Server, Ipv4Addr::LOCALHOST, 1), socket.clone(), None, |_| source);
        let conn = Arc::new(conn);
        assert_eq!(Arc::strong_count(&socket), 2);

        let reader = tokio::spawn({
            let conn = conn.clone();
            async move {
                let mut buf = [0u8; 100];
                conn.read_from(&mut buf).await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(Arc::strong_count(&socket), 1);

        let result = tokio::time::timeout(Duration::from_secs(5), reader).await
            .expect("close should wake up the reader")
            .unwrap();
        assert!(result.is_err());

        assert!(conn.write_to(b"abc", LogicalAddr::new(Ipv4Addr::LOCALHOST, 2)).await.is_err());
    }

    #[tokio::test]
    async fn test_ingestion_failure_fails_reads() {
        let (conn, inbound, _outbound) = conn(Role::Server, Ipv4Addr::LOCALHOST, 1);
        drop(inbound);

        let mut buf = [0u8; 100];
        let result = tokio::time::timeout(Duration::from_secs(5), conn.read_from(&mut buf)).await
            .expect("end of ingestion should fail reads");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_kernel_program_connection() {
        let (events, event_receiver) = mpsc::channel(16);

        let mut program = MockKernelProgram::new();
        let mut seq = Sequence::new();
        program.expect_load().once().in_sequence(&mut seq).returning(|| Ok(()));
        program.expect_start_events().once().in_sequence(&mut seq).return_once(move |_| Ok(event_receiver));
        program.expect_attach()
            .withf(|interface| interface == "eth0")
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        program.expect_detach().once().in_sequence(&mut seq).return_const(());
        program.expect_close().once().in_sequence(&mut seq).return_const(());
        program.expect_stop_events().once().in_sequence(&mut seq).return_const(());

        let (socket, _outbound) = recording_socket();
        let conn = IcmpConn::start_with_kernel_program(
            config(Role::Server, Ipv4Addr::LOCALHOST, 1),
            &XdpConfig::new("eth0", "icmp_inject.o"),
            Box::new(program),
            {
                let socket = socket.clone();
                move |_| Ok(socket)
            },
        ).unwrap();

        let icmp = crate::test_util::encode_request(4242, 6789, b"hello");
        events.send(event_record(Ipv4Addr::new(10, 0, 0, 5), &icmp)).await.unwrap();

        let mut buf = [0u8; 100];
        let (n, from) = conn.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, Some(LogicalAddr::new(Ipv4Addr::new(10, 0, 0, 5), 278_010_501)));

        conn.close().unwrap();
        conn.close().unwrap();
        assert_eq!(Arc::strong_count(&socket), 1);
    }

    #[tokio::test]
    async fn test_socket_failure_releases_kernel_program() {
        let mut program = MockKernelProgram::new();
        let mut seq = Sequence::new();
        program.expect_load().once().in_sequence(&mut seq).returning(|| Ok(()));
        program.expect_start_events().once().in_sequence(&mut seq).returning(|_| Ok(mpsc::channel(1).1));
        program.expect_attach().once().in_sequence(&mut seq).returning(|_| Ok(()));
        program.expect_detach().once().in_sequence(&mut seq).return_const(());
        program.expect_close().once().in_sequence(&mut seq).return_const(());
        program.expect_stop_events().once().in_sequence(&mut seq).return_const(());

        let result = IcmpConn::start_with_kernel_program(
            TunnelConfig::default_server(),
            &XdpConfig::new("eth0", "icmp_inject.o"),
            Box::new(program),
            |_| bail!("operation not permitted"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_load_failure_opens_no_socket() {
        let mut program = MockKernelProgram::new();
        program.expect_load().once().returning(|| Err(anyhow::anyhow!("invalid object file")));
        program.expect_close().once().return_const(());
        program.expect_attach().never();

        let result = IcmpConn::start_with_kernel_program(
            TunnelConfig::default_server(),
            &XdpConfig::new("eth0", "icmp_inject.o"),
            Box::new(program),
            |_| panic!("socket must not be opened"),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_xdp_config() {
        let mut program = MockKernelProgram::new();
        program.expect_load().never();

        let result = IcmpConn::start_with_kernel_program(
            TunnelConfig::default_server(),
            &XdpConfig::new("", "icmp_inject.o"),
            Box::new(program),
            |_| panic!("socket must not be opened"),
        );
        assert!(result.is_err());
    }
}
