use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use anyhow::anyhow;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::buffers::buffer_pool::FrameBufferPool;
use crate::buffers::fixed_buffer::FixedBuf;
use crate::logical_addr::LogicalAddr;

/// ICMP header (8 bytes) plus the protocol tag (8 bytes)
pub const HEADER_LEN: usize = 16;
/// maximum number of payload bytes per frame
pub const MAX_PAYLOAD_LEN: usize = 1450;
pub const FRAME_CAPACITY: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// Marker in header bytes 8..16, distinguishing tunnel frames from regular ICMP echo traffic
pub const PROTOCOL_TAG: [u8; 8] = *b"icmp2udp";

pub const TYPE_OFFSET: usize = 0;
pub const CODE_OFFSET: usize = 1;
pub const CHECKSUM_OFFSET: usize = 2;
pub const IDENTIFIER_OFFSET: usize = 4;
pub const SEQUENCE_OFFSET: usize = 6;
pub const TAG_OFFSET: usize = 8;

/// The ICMP type byte of an echo frame. Clients send requests, servers send replies.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum EchoKind {
    Reply = 0,
    Request = 8,
}

/// A single ICMP echo message carrying (a fragment of) tunnel payload.
///
/// The frame exclusively owns a pooled buffer holding the complete ICMP message, and it gives
///  the buffer back to its pool when it is dropped - so a buffer is returned exactly once,
///  regardless of whether the frame was fully read, dropped on a full queue or abandoned.
pub struct EchoFrame {
    buf: FixedBuf,
    pool: Arc<FrameBufferPool>,
    source: Option<LogicalAddr>,
}

impl EchoFrame {
    pub(crate) fn new(buf: FixedBuf, pool: Arc<FrameBufferPool>) -> EchoFrame {
        EchoFrame {
            buf,
            pool,
            source: None,
        }
    }

    pub fn raw_type(&self) -> u8 {
        self.buf.as_ref()[TYPE_OFFSET]
    }

    pub fn kind(&self) -> anyhow::Result<EchoKind> {
        EchoKind::try_from(self.raw_type())
            .map_err(|_| anyhow!("ICMP type {} is not an echo request or reply", self.raw_type()))
    }

    pub fn code(&self) -> u8 {
        self.buf.as_ref()[CODE_OFFSET]
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(CHECKSUM_OFFSET)
    }

    pub fn identifier(&self) -> u16 {
        self.read_u16(IDENTIFIER_OFFSET)
    }

    pub fn sequence(&self) -> u16 {
        self.read_u16(SEQUENCE_OFFSET)
    }

    pub fn tag(&self) -> &[u8] {
        &self.buf.as_ref()[TAG_OFFSET..HEADER_LEN]
    }

    pub fn has_protocol_tag(&self) -> bool {
        self.tag() == PROTOCOL_TAG
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[HEADER_LEN..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - HEADER_LEN
    }

    /// the complete ICMP message, as it goes on the wire
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    /// the peer this frame was received from, if it was received rather than encoded locally
    pub fn source(&self) -> Option<LogicalAddr> {
        self.source
    }

    pub(crate) fn set_source(&mut self, source: LogicalAddr) {
        self.source = Some(source);
    }

    /// Copies payload starting at `offset` into `target`, as much as fits. Returns the number of
    ///  bytes copied.
    pub fn copy_payload(&self, offset: usize, target: &mut [u8]) -> usize {
        let remaining = &self.payload()[offset.min(self.payload_len())..];
        let n = remaining.len().min(target.len());
        target[..n].copy_from_slice(&remaining[..n]);
        n
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let bytes = self.buf.as_ref();
        u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
    }
}

impl Drop for EchoFrame {
    fn drop(&mut self) {
        // FixedBuf::new(0) does not allocate
        let buf = std::mem::replace(&mut self.buf, FixedBuf::new(0));
        self.pool.return_to_pool(buf);
    }
}

impl Debug for EchoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "EchoFrame{{type:{}, id:{}, seq:{}, payload:{} bytes, source:{:?}}}",
               self.raw_type(), self.identifier(), self.sequence(), self.payload_len(), self.source)
    }
}
