use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use anyhow::bail;

/// The address of a peer as seen by code using a tunnel connection: an IP address plus a 32-bit
///  'port'.
///
/// The port is a multiplexing token rather than a transport port. On the server side, it is the
///  ICMP identifier (upper 16 bits) and sequence (lower 16 bits) of the frames received from a
///  client, so sending a reply to this address restores exactly the identifier / sequence pair
///  the client used. On the client side, it is the literal 16-bit port carried in the sequence
///  field.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct LogicalAddr {
    pub ip: IpAddr,
    pub port: u32,
}

impl LogicalAddr {
    pub fn new(ip: impl Into<IpAddr>, port: u32) -> LogicalAddr {
        LogicalAddr {
            ip: ip.into(),
            port,
        }
    }

    pub fn from_echo_fields(ip: impl Into<IpAddr>, identifier: u16, sequence: u16) -> LogicalAddr {
        LogicalAddr::new(ip, pack_port(identifier, sequence))
    }

    /// The identifier / sequence pair this address' port stands for in server role
    pub fn echo_fields(&self) -> (u16, u16) {
        unpack_port(self.port)
    }

    /// ICMP encapsulation is implemented for IPv4 only
    pub fn ipv4(&self) -> anyhow::Result<Ipv4Addr> {
        match self.ip {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(ip) => bail!("destination {} is not an IPv4 address", ip),
        }
    }
}

impl Debug for LogicalAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (identifier, sequence) = self.echo_fields();
        write!(f, "[{}:{}/{}]", self.ip, identifier, sequence)
    }
}

impl Display for LogicalAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

pub fn pack_port(identifier: u16, sequence: u16) -> u32 {
    ((identifier as u32) << 16) | sequence as u32
}

pub fn unpack_port(port: u32) -> (u16, u16) {
    ((port >> 16) as u16, port as u16)
}
