use std::net::Ipv4Addr;
use std::path::PathBuf;
use anyhow::bail;
use crate::frame_codec::Role;
use crate::receive_cache::DEFAULT_QUEUE_CAPACITY;
use crate::xdp::EVENT_BATCH_SIZE;

pub struct TunnelConfig {
    /// Clients send echo requests and receive replies, servers do it the other way around.
    ///  This also determines how logical addresses are derived from echo header fields.
    pub role: Role,

    /// The local IPv4 address the raw socket is bound to
    pub bind_addr: Ipv4Addr,

    /// Placed in the identifier field of every frame a client sends. Defaults to the lower 16 bits
    ///  of the process id.
    pub correlation_id: u16,

    /// This is the number of frames that are buffered between ingestion and the application's reads.
    ///  Frames arriving while the queue is full are dropped.
    pub queue_capacity: usize,

    /// Inbound frames with a bad checksum or a missing protocol tag are discarded rather than
    ///  delivered, and so are frames of the wrong echo type for the role (requests reaching a
    ///  client, replies reaching a server)
    pub validate_frames: bool,
}

impl TunnelConfig {
    pub fn default_client() -> TunnelConfig {
        Self::default_for_role(Role::Client)
    }

    pub fn default_server() -> TunnelConfig {
        Self::default_for_role(Role::Server)
    }

    fn default_for_role(role: Role) -> TunnelConfig {
        TunnelConfig {
            role,
            bind_addr: Ipv4Addr::UNSPECIFIED,
            correlation_id: std::process::id() as u16,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            validate_frames: true,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            bail!("receive queue capacity must be positive");
        }
        Ok(())
    }
}

pub struct XdpConfig {
    /// name of the network interface the kernel program is attached to, e.g. `eth0`
    pub interface: String,
    /// compiled eBPF object file containing the program and its event map
    pub object_path: PathBuf,
    pub program_name: String,
    pub map_name: String,
    pub event_batch_size: usize,
}

impl XdpConfig {
    pub fn new(interface: impl Into<String>, object_path: impl Into<PathBuf>) -> XdpConfig {
        XdpConfig {
            interface: interface.into(),
            object_path: object_path.into(),
            program_name: "icmp_inject".to_string(),
            map_name: "icmpmap".to_string(),
            event_batch_size: EVENT_BATCH_SIZE,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interface.is_empty() {
            bail!("network interface for XDP is missing");
        }
        if self.event_batch_size == 0 {
            bail!("event batch size must be positive");
        }
        Ok(())
    }
}
