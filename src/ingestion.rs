use std::net::IpAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, error, info};
use crate::receive_cache::ReceiveCache;

/// A source of inbound ICMP echo messages - either a raw socket, or the event channel of a
///  kernel program intercepting echo traffic. The receive cache and the codec do not care which
///  one is active.
#[async_trait]
pub trait IngestionSource: Send + 'static {
    /// Waits for the next ICMP message, returning its sender and the ICMP bytes (starting with
    ///  the ICMP type byte). Returns `None` when the source was shut down regularly.
    async fn next_datagram<'a>(&'a mut self) -> anyhow::Result<Option<(IpAddr, &'a [u8])>>;
}

/// The background receive loop of a connection: it feeds everything the source delivers into the
///  cache until the source is shut down or fails, and then closes the cache so that blocked
///  readers see an error.
pub async fn run_ingestion<S: IngestionSource>(mut source: S, cache: Arc<ReceiveCache>) {
    info!("starting ingestion loop");

    loop {
        match source.next_datagram().await {
            Ok(Some((from, icmp))) => {
                if let Err(e) = cache.recv(from, icmp) {
                    debug!("dropping ICMP message from {}: {}", from, e);
                }
            }
            Ok(None) => {
                info!("ingestion source was shut down");
                break;
            }
            Err(e) => {
                error!("error receiving ICMP messages, terminating ingestion loop: {:#}", e);
                break;
            }
        }
    }

    cache.close();
}
