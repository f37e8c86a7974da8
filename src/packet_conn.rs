use std::time::Instant;
use async_trait::async_trait;
use crate::logical_addr::LogicalAddr;

/// The datagram-style contract a layered (reliable) transport builds on. Payloads are addressed
///  by [LogicalAddr]; how an address maps to the wire is up to the implementation.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Sends the payload as one or more frames, returning the number of payload bytes written.
    async fn write_to(&self, payload: &[u8], to: LogicalAddr) -> anyhow::Result<usize>;

    /// Waits for inbound payload and copies as much of it into `buf` as fits. A single call never
    ///  returns bytes from more than one frame.
    async fn read_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Option<LogicalAddr>)>;

    fn local_addr(&self) -> LogicalAddr;

    fn close(&self) -> anyhow::Result<()>;

    /// `None` clears the deadline
    fn set_write_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()>;

    fn set_read_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()>;

    fn set_deadline(&self, deadline: Option<Instant>) -> anyhow::Result<()>;
}
