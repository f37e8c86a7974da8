use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::Ipv4Addr;
use std::sync::Arc;
use anyhow::{bail, Context};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};
use crate::echo_frame::EchoFrame;

/// This is an abstraction for sending an ICMP message on a raw socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_frame(&self, to: Ipv4Addr, frame: &[u8]) -> std::io::Result<()>;
}

/// Serializes outbound writes of a connection: all fragments of one write go out back to back,
///  without fragments of a concurrent write interleaving.
pub struct SendPipeline {
    /// `None` once the pipeline is closed
    socket: std::sync::Mutex<Option<Arc<dyn SendSocket>>>,
    write_lock: Mutex<()>,
    write_deadline: std::sync::Mutex<Option<Instant>>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline {
            socket: std::sync::Mutex::new(Some(socket)),
            write_lock: Mutex::new(()),
            write_deadline: std::sync::Mutex::new(None),
        }
    }

    /// `None` removes a previously set deadline
    pub fn set_write_deadline(&self, deadline: Option<std::time::Instant>) {
        *self.write_deadline.lock().unwrap() = deadline.map(Instant::from_std);
    }

    /// Releases the socket. Writes in progress complete, later writes fail.
    pub fn close(&self) {
        if self.socket.lock().unwrap().take().is_some() {
            debug!("send pipeline closed");
        }
    }

    /// Sends all frames in order. The first failure aborts the remaining frames; frames sent
    ///  before that stay sent.
    pub async fn send_frames(&self, to: Ipv4Addr, frames: impl Iterator<Item = EchoFrame> + Send) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let socket = self.socket.lock().unwrap().clone();
        let Some(socket) = socket else {
            bail!("connection closed");
        };

        for (idx, frame) in frames.enumerate() {
            trace!("sending fragment #{} to {}: {:?}", idx, to, frame);
            self.send_with_deadline(socket.as_ref(), to, frame.as_bytes()).await
                .with_context(|| format!("error sending fragment #{} to {}", idx, to))?;
        }
        Ok(())
    }

    async fn send_with_deadline(&self, socket: &dyn SendSocket, to: Ipv4Addr, frame: &[u8]) -> anyhow::Result<()> {
        let deadline = *self.write_deadline.lock().unwrap();

        match deadline {
            None => Ok(socket.do_send_frame(to, frame).await?),
            Some(deadline) => {
                if Instant::now() >= deadline {
                    debug!("write deadline exceeded before sending to {}", to);
                    bail!("write deadline exceeded");
                }
                match tokio::time::timeout_at(deadline, socket.do_send_frame(to, frame)).await {
                    Ok(result) => Ok(result?),
                    Err(_) => bail!("write deadline exceeded"),
                }
            }
        }
    }
}
