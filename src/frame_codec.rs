use std::net::IpAddr;
use std::sync::Arc;
use anyhow::bail;
use bytes::BufMut;
use tracing::trace;
use crate::buffers::buffer_pool::FrameBufferPool;
use crate::checksum::{internet_checksum, verify_checksum};
use crate::echo_frame::{EchoFrame, EchoKind, CHECKSUM_OFFSET, FRAME_CAPACITY, HEADER_LEN, MAX_PAYLOAD_LEN, PROTOCOL_TAG};
use crate::logical_addr::{unpack_port, LogicalAddr};

/// The side of the tunnel a connection is on. This determines the ICMP type of outgoing frames
///  and how the identifier / sequence fields map to logical addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn outbound_kind(&self) -> EchoKind {
        match self {
            Role::Client => EchoKind::Request,
            Role::Server => EchoKind::Reply,
        }
    }

    /// Clients receive replies and servers receive requests. Frames of the other kind are
    ///  usually our own outbound frames, looped back to the raw socket.
    pub fn inbound_kind(&self) -> EchoKind {
        match self {
            Role::Client => EchoKind::Reply,
            Role::Server => EchoKind::Request,
        }
    }
}

/// Encodes outbound payload into echo frames and decodes received ICMP messages, deriving the
///  sender's [LogicalAddr].
///
/// Addressing depends on the role:
/// * A client writes its correlation id to the identifier field and the (16-bit) destination
///   port to the sequence field. Received frames are addressed by their sequence field alone.
/// * A server splits the 32-bit logical port of the destination into identifier (upper half)
///   and sequence (lower half). Received frames are addressed by both fields combined, so a
///   reply to that address carries exactly the identifier and sequence of the client's request.
pub struct FrameCodec {
    role: Role,
    validate: bool,
    pool: Arc<FrameBufferPool>,
}

impl FrameCodec {
    /// `validate` enables checking tag, checksum and ICMP type of received frames
    pub fn new(role: Role, validate: bool, pool: Arc<FrameBufferPool>) -> FrameCodec {
        FrameCodec {
            role,
            validate,
            pool,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn pool(&self) -> &Arc<FrameBufferPool> {
        &self.pool
    }

    pub fn fragment_count(payload_len: usize) -> usize {
        payload_len.div_ceil(MAX_PAYLOAD_LEN)
    }

    /// Splits `payload` into fragments of at most [MAX_PAYLOAD_LEN] bytes and encodes each of them
    ///  as an independent, individually checksummed frame. Frames are produced lazily and in
    ///  payload order; an empty payload produces no frames.
    ///
    /// NB: In client role, the port is truncated to its lower 16 bits since that is all the
    ///      sequence field can hold
    pub fn encode<'a>(&'a self, correlation_id: u16, port: u32, payload: &'a [u8]) -> impl Iterator<Item = EchoFrame> + Send + 'a {
        let (identifier, sequence) = match self.role {
            Role::Client => (correlation_id, port as u16),
            Role::Server => unpack_port(port),
        };

        payload
            .chunks(MAX_PAYLOAD_LEN)
            .map(move |fragment| self.encode_fragment(identifier, sequence, fragment))
    }

    fn encode_fragment(&self, identifier: u16, sequence: u16, fragment: &[u8]) -> EchoFrame {
        let mut buf = self.pool.get_from_pool();
        buf.put_u8(self.role.outbound_kind().into());
        buf.put_u8(0); // code
        buf.put_u16(0); // checksum placeholder
        buf.put_u16(identifier);
        buf.put_u16(sequence);
        buf.put_slice(&PROTOCOL_TAG);
        buf.put_slice(fragment);

        let checksum = internet_checksum(buf.as_ref());
        buf.as_mut()[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());

        trace!("encoded frame: id {}, seq {}, {} payload bytes", identifier, sequence, fragment.len());
        EchoFrame::new(buf, self.pool.clone())
    }

    /// Decodes a single ICMP message received from `source` into a pooled frame, and assigns
    ///  the sender's logical address to it.
    pub fn decode(&self, source: IpAddr, raw: &[u8]) -> anyhow::Result<EchoFrame> {
        if raw.len() < HEADER_LEN || raw.len() > FRAME_CAPACITY {
            bail!("invalid frame length {}: must be between {} and {} bytes", raw.len(), HEADER_LEN, FRAME_CAPACITY);
        }

        let mut buf = self.pool.get_from_pool();
        buf.put_slice(raw);
        let mut frame = EchoFrame::new(buf, self.pool.clone());

        if self.validate {
            self.check_frame(&frame)?;
        }

        let source = match self.role {
            Role::Server => LogicalAddr::from_echo_fields(source, frame.identifier(), frame.sequence()),
            Role::Client => LogicalAddr::new(source, frame.sequence() as u32),
        };
        frame.set_source(source);
        Ok(frame)
    }

    fn check_frame(&self, frame: &EchoFrame) -> anyhow::Result<()> {
        let kind = frame.kind()?;
        if kind != self.role.inbound_kind() {
            bail!("{:?} frame is not addressed to a {:?}", kind, self.role);
        }
        if !frame.has_protocol_tag() {
            bail!("frame does not carry the protocol tag");
        }
        if !verify_checksum(frame.as_bytes()) {
            bail!("frame checksum mismatch");
        }
        Ok(())
    }
}
