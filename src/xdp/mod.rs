//! Kernel-assisted ingestion: an XDP program attached to a network interface intercepts tagged
//!  ICMP echo packets before the kernel's ICMP stack sees them (so the kernel does not answer
//!  them on its own), and forwards them to user space through a per-CPU perf event array.
//!
//! The kernel program is an external artifact, loaded through the [KernelProgram] capability.
//!  Its contract with this module is the layout of the event records it emits:
//!
//! ```ascii
//!  0: captured packet size (u64, little endian)
//!  8: Ethernet header (14 bytes)
//! 22: IPv4 header, source address at record offset 34..38
//! 42: ICMP message (assuming an IPv4 header without options)
//! ```
//!
//! Outbound frames do not go through the kernel program, but through a regular raw socket.

#[cfg(feature = "xdp")]
pub mod aya_program;

use std::net::{IpAddr, Ipv4Addr};
use std::ops::Range;
use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tracing::debug;
use crate::echo_frame::FRAME_CAPACITY;
use crate::ingestion::IngestionSource;
use crate::receive_cache::wait_until_closed;

/// default per-poll buffer size for reading kernel events
pub const EVENT_BATCH_SIZE: usize = 4096;

const RECORD_PREFIX_LEN: usize = 8;
const RECORD_SOURCE_IP: Range<usize> = 34..38;
const RECORD_ICMP_OFFSET: usize = 42;
const MIN_DECLARED_SIZE: u64 = 34;

/// The narrow interface to a kernel-resident packet filter. Implementations own all kernel
///  resources (program, link, map and reader tasks) and release them in the `detach` /
///  `stop_events` / `close` calls.
#[cfg_attr(test, automock)]
pub trait KernelProgram: Send + 'static {
    /// load the program and its maps into the kernel
    fn load(&mut self) -> anyhow::Result<()>;

    /// Starts reading the event channel on all CPUs. Each received record is passed on
    ///  through the returned channel; `batch_size` is the per-poll buffer size.
    fn start_events(&mut self, batch_size: usize) -> anyhow::Result<mpsc::Receiver<BytesMut>>;

    fn attach(&mut self, interface: &str) -> anyhow::Result<()>;

    fn detach(&mut self);

    fn stop_events(&mut self);

    /// unload the program and release the map
    fn close(&mut self);
}

/// Loads, wires and attaches a kernel program. If any step fails, everything acquired up to
///  that point is released before the error is returned.
pub fn start_kernel_program(program: &mut dyn KernelProgram, interface: &str, batch_size: usize) -> anyhow::Result<mpsc::Receiver<BytesMut>> {
    if let Err(e) = program.load() {
        program.close();
        return Err(e);
    }

    let events = match program.start_events(batch_size) {
        Ok(events) => events,
        Err(e) => {
            program.close();
            return Err(e);
        }
    };

    if let Err(e) = program.attach(interface) {
        program.stop_events();
        program.close();
        return Err(e);
    }

    Ok(events)
}

/// Releases everything [start_kernel_program] acquired. The event map handle is released when
///  the stopped event readers drop their reference to it.
pub fn shut_down_kernel_program(program: &mut dyn KernelProgram) {
    program.detach();
    program.close();
    program.stop_events();
}

/// Extracts sender address and ICMP message range from an event record. `None` if the record is
///  too short or declares an implausible packet size.
///
/// The declared size counts the captured packet starting after the prefix. Records are padded
///  for alignment, so the ICMP message ends where the declared packet ends rather than at the
///  end of the record.
pub fn parse_event_record(record: &[u8]) -> Option<(Ipv4Addr, Range<usize>)> {
    if record.len() < RECORD_PREFIX_LEN {
        return None;
    }

    let mut prefix = [0u8; RECORD_PREFIX_LEN];
    prefix.copy_from_slice(&record[..RECORD_PREFIX_LEN]);
    let declared_size = u64::from_le_bytes(prefix);

    if declared_size <= MIN_DECLARED_SIZE || declared_size > FRAME_CAPACITY as u64 {
        return None;
    }
    if record.len() < RECORD_ICMP_OFFSET {
        return None;
    }

    let packet_end = record.len().min(RECORD_PREFIX_LEN + declared_size as usize);
    let ip = &record[RECORD_SOURCE_IP];
    Some((Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]), RECORD_ICMP_OFFSET..packet_end))
}

/// Reads event records from a kernel program until the channel ends or the connection's
///  receive cache is closed
pub struct KernelEventSource {
    events: mpsc::Receiver<BytesMut>,
    record: BytesMut,
    closed: watch::Receiver<bool>,
}

impl KernelEventSource {
    pub fn new(events: mpsc::Receiver<BytesMut>, closed: watch::Receiver<bool>) -> KernelEventSource {
        KernelEventSource {
            events,
            record: BytesMut::new(),
            closed,
        }
    }
}

#[async_trait]
impl IngestionSource for KernelEventSource {
    async fn next_datagram<'a>(&'a mut self) -> anyhow::Result<Option<(IpAddr, &'a [u8])>> {
        loop {
            let record = select! {
                biased;
                _ = wait_until_closed(&mut self.closed) => return Ok(None),
                record = self.events.recv() => match record {
                    Some(record) => record,
                    None => return Ok(None),
                },
            };

            match parse_event_record(&record) {
                Some((source, icmp)) => {
                    self.record = record;
                    return Ok(Some((source.into(), &self.record[icmp])));
                }
                None => debug!("dropping kernel event record of {} bytes", record.len()),
            }
        }
    }
}
