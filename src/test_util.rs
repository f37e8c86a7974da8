use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::mpsc;
use crate::buffers::buffer_pool::FrameBufferPool;
use crate::frame_codec::{FrameCodec, Role};
use crate::ingestion::IngestionSource;

/// the wire bytes of a single client frame
pub fn encode_request(correlation_id: u16, port: u16, payload: &[u8]) -> Vec<u8> {
    let codec = FrameCodec::new(Role::Client, true, Arc::new(FrameBufferPool::new()));
    let frame = codec.encode(correlation_id, port as u32, payload)
        .next()
        .expect("payload should not be empty");
    frame.as_bytes().to_vec()
}

/// delivers a fixed sequence of messages / errors, and shuts down when they are exhausted
pub struct ScriptedSource {
    script: VecDeque<anyhow::Result<(IpAddr, Vec<u8>)>>,
    current: Vec<u8>,
}
impl ScriptedSource {
    pub fn new(script: Vec<anyhow::Result<(IpAddr, Vec<u8>)>>) -> ScriptedSource {
        ScriptedSource {
            script: script.into(),
            current: Vec::new(),
        }
    }
}

#[async_trait]
impl IngestionSource for ScriptedSource {
    async fn next_datagram<'a>(&'a mut self) -> anyhow::Result<Option<(IpAddr, &'a [u8])>> {
        match self.script.pop_front() {
            None => Ok(None),
            Some(Err(e)) => Err(e),
            Some(Ok((from, icmp))) => {
                self.current = icmp;
                Ok(Some((from, &self.current)))
            }
        }
    }
}

/// delivers whatever is sent through the channel, shutting down when the sender is dropped
pub struct ChannelSource {
    receiver: mpsc::UnboundedReceiver<(IpAddr, Vec<u8>)>,
    current: Vec<u8>,
}
impl ChannelSource {
    pub fn new() -> (mpsc::UnboundedSender<(IpAddr, Vec<u8>)>, ChannelSource) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, ChannelSource { receiver, current: Vec::new() })
    }
}

#[async_trait]
impl IngestionSource for ChannelSource {
    async fn next_datagram<'a>(&'a mut self) -> anyhow::Result<Option<(IpAddr, &'a [u8])>> {
        match self.receiver.recv().await {
            None => Ok(None),
            Some((from, icmp)) => {
                self.current = icmp;
                Ok(Some((from, &self.current)))
            }
        }
    }
}
