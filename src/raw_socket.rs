//! The plain ingestion backend: a raw ICMPv4 socket bound to all (or one) local interfaces.
//!
//! On Linux, reads from a raw IPv4 socket deliver the complete IP datagram including its header,
//!  so the sender's address is taken from the IP header, and the ICMP message starts after it.

use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::ops::Range;
use std::sync::Arc;
use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use crate::ingestion::IngestionSource;
use crate::receive_cache::wait_until_closed;
use crate::send_pipeline::SendSocket;

/// size of the receive buffer; IP datagrams exceeding this are truncated, which makes them
///  fail decoding later on
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

const MIN_IPV4_HEADER_LEN: usize = 20;

pub struct RawIcmpSocket {
    fd: AsyncFd<Socket>,
}

impl RawIcmpSocket {
    /// Opens a non-blocking raw ICMP socket. This requires root or `CAP_NET_RAW`.
    pub fn bind(local_ip: Ipv4Addr) -> anyhow::Result<RawIcmpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SockAddr::from(SocketAddrV4::new(local_ip, 0)))?;
        info!("bound raw ICMP socket to {}", local_ip);

        Ok(RawIcmpSocket {
            fd: AsyncFd::new(socket)?,
        })
    }

    /// receives a single IP datagram
    pub async fn recv_datagram(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.fd.async_io(Interest::READABLE, |socket| {
            let mut socket: &Socket = socket;
            socket.read(&mut buf[..])
        }).await
    }
}

#[async_trait]
impl SendSocket for RawIcmpSocket {
    async fn do_send_frame(&self, to: Ipv4Addr, frame: &[u8]) -> std::io::Result<()> {
        trace!("raw socket: sending {} bytes to {}", frame.len(), to);

        let to = SockAddr::from(SocketAddrV4::new(to, 0));
        self.fd.async_io(Interest::WRITABLE, |socket| socket.send_to(frame, &to)).await?;
        Ok(())
    }
}

/// Locates the ICMP message inside an IPv4 datagram, returning the sender's address and the
///  range of the ICMP bytes. `None` if the datagram is not a well-formed IPv4 datagram.
pub fn ipv4_payload(datagram: &[u8]) -> Option<(Ipv4Addr, Range<usize>)> {
    if datagram.len() < MIN_IPV4_HEADER_LEN || datagram[0] >> 4 != 4 {
        return None;
    }

    let header_len = (datagram[0] & 0x0f) as usize * 4;
    if header_len < MIN_IPV4_HEADER_LEN || header_len > datagram.len() {
        return None;
    }

    let source = Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]);
    Some((source, header_len..datagram.len()))
}

/// Reads from a [RawIcmpSocket] until the connection's receive cache is closed
pub struct RawSocketSource {
    socket: Arc<RawIcmpSocket>,
    buf: Vec<u8>,
    closed: watch::Receiver<bool>,
}

impl RawSocketSource {
    pub fn new(socket: Arc<RawIcmpSocket>, closed: watch::Receiver<bool>) -> RawSocketSource {
        RawSocketSource {
            socket,
            buf: vec![0; RECEIVE_BUFFER_SIZE],
            closed,
        }
    }
}

#[async_trait]
impl IngestionSource for RawSocketSource {
    async fn next_datagram<'a>(&'a mut self) -> anyhow::Result<Option<(IpAddr, &'a [u8])>> {
        loop {
            let n = select! {
                biased;
                _ = wait_until_closed(&mut self.closed) => return Ok(None),
                n = self.socket.recv_datagram(&mut self.buf) => n?,
            };

            match ipv4_payload(&self.buf[..n]) {
                Some((source, icmp)) => return Ok(Some((source.into(), &self.buf[icmp]))),
                None => debug!("received malformed IPv4 datagram of {} bytes - dropping", n),
            }
        }
    }
}
