//! A datagram tunnel through ICMP echo traffic: application payload is carried in ICMP echo
//!  requests (client to server) and echo replies (server to client), so it passes networks that
//!  let 'ping' through but block everything else.
//!
//! The tunnel itself is unreliable, just like UDP. It is meant as the bottom layer for a
//!  reliable transport protocol that takes care of retransmission, ordering and timeouts. What
//!  it does provide:
//! * A datagram-style [packet_conn::PacketConn] API with logical addresses (IP + 32 bit 'port')
//! * Transparent fragmentation of big payloads into individually checksummed frames. There is no
//!    reassembly: every frame is delivered on its own, and a single read never returns bytes
//!    from more than one frame
//! * Multiplexing of several clients (and several logical ports per client) through a single
//!    server socket, using the echo identifier and sequence fields
//! * Two ingestion backends: a plain raw ICMP socket, and a kernel program (XDP) that intercepts
//!    tunnel frames before the kernel's ICMP stack answers them
//!
//! ## Frame format
//!
//! All numbers in network byte order (BE):
//! ```ascii
//!  0: type (u8): 8 for echo request (client to server), 0 for echo reply (server to client)
//!  1: code (u8): always 0
//!  2: checksum (u16): internet checksum (RFC 1071) over the entire frame
//!  4: identifier (u16)
//!  6: sequence (u16)
//!  8: tag "icmp2udp" (8 bytes) - distinguishes tunnel frames from regular ping traffic
//! 16: payload (up to 1450 bytes)
//! ```
//!
//! A client puts its correlation id (by default derived from the process id) in the identifier
//!  field, and the destination's 16-bit port in the sequence field. A server sees the combination
//!  of both as the client's logical port, and replies with identifier and sequence taken from it.
//!  That way, replies match their requests and NAT devices route them back to the client.
//!
//! ## Buffers
//!
//! Frame buffers are pooled. A frame owns its buffer and returns it to the pool when it is
//!  dropped, which happens when a write completes or when a reader has consumed its payload.

pub mod buffers;
pub mod checksum;
pub mod config;
pub mod echo_frame;
pub mod frame_codec;
pub mod icmp_conn;
pub mod ingestion;
pub mod logical_addr;
pub mod packet_conn;
pub mod raw_socket;
pub mod receive_cache;
mod send_pipeline;
pub mod xdp;

#[cfg(test)]
mod test_util;
