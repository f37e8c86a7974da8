use std::net::IpAddr;
use std::sync::Arc;
use anyhow::bail;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, trace};
use crate::echo_frame::EchoFrame;
use crate::frame_codec::FrameCodec;
use crate::logical_addr::LogicalAddr;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1500;

/// The receive side of a connection: decoded frames are queued here by the ingestion loop, and
///  drained by application reads.
///
/// Each read returns bytes from exactly one frame. If a frame's payload does not fit into the
///  caller's buffer, the rest is returned by subsequent reads before the next frame is taken
///  from the queue.
///
/// The queue is bounded, and frames arriving while it is full are dropped: ICMP is unreliable
///  anyway, and the ingestion loop must never block on a slow reader.
pub struct ReceiveCache {
    codec: Arc<FrameCodec>,
    sender: mpsc::Sender<EchoFrame>,
    reader: Mutex<CacheReader>,
    closed: watch::Sender<bool>,
}

struct CacheReader {
    queue: mpsc::Receiver<EchoFrame>,
    /// the frame currently being drained by partial reads
    current: Option<EchoFrame>,
    /// read offset into the payload of `current`
    cursor: usize,
}

impl ReceiveCache {
    pub fn new(codec: Arc<FrameCodec>, queue_capacity: usize) -> ReceiveCache {
        let (sender, queue) = mpsc::channel(queue_capacity);
        let (closed, _) = watch::channel(false);

        ReceiveCache {
            codec,
            sender,
            reader: Mutex::new(CacheReader {
                queue,
                current: None,
                cursor: 0,
            }),
            closed,
        }
    }

    /// Decodes an ICMP message and queues the resulting frame. A decode failure is returned to
    ///  the caller, a full queue is not an error: the frame is silently dropped.
    pub fn recv(&self, source: IpAddr, raw: &[u8]) -> anyhow::Result<()> {
        let frame = self.codec.decode(source, raw)?;

        if self.is_closed() {
            debug!("receive cache is closed: dropping {:?}", frame);
            return Ok(());
        }

        match self.sender.try_send(frame) {
            Ok(()) => {
                trace!("queued frame from {}", source);
            }
            Err(TrySendError::Full(frame)) => {
                debug!("receive queue is full: dropping {:?}", frame);
            }
            Err(TrySendError::Closed(frame)) => {
                debug!("receive queue is closed: dropping {:?}", frame);
            }
        }
        Ok(())
    }

    /// Copies payload of the next frame into `buf`, waiting for a frame to arrive if necessary.
    ///  Returns the number of bytes copied and the frame's source address.
    ///
    /// Fails once the cache is closed and there are no more queued frames.
    pub async fn read_from(&self, buf: &mut [u8]) -> anyhow::Result<(usize, Option<LogicalAddr>)> {
        if buf.is_empty() {
            return Ok((0, None));
        }

        let mut reader = self.reader.lock().await;
        let reader = &mut *reader;

        let frame = match reader.current.take() {
            Some(frame) => frame,
            None => {
                reader.cursor = 0;
                let mut closed = self.closed.subscribe();
                select! {
                    biased;
                    frame = reader.queue.recv() => match frame {
                        Some(frame) => frame,
                        None => bail!("receive queue is closed"),
                    },
                    _ = wait_until_closed(&mut closed) => bail!("receive queue is closed"),
                }
            }
        };

        let n = frame.copy_payload(reader.cursor, buf);
        reader.cursor += n;
        let source = frame.source();

        if reader.cursor < frame.payload_len() {
            reader.current = Some(frame);
        }
        else {
            trace!("frame fully read, returning its buffer");
            reader.cursor = 0;
        }

        Ok((n, source))
    }

    /// Wakes up blocked and future readers with an error once the queue is drained. Frames
    ///  arriving after this call are dropped.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!("closing receive cache");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A signal that flips to `true` when the cache is closed, for stopping ingestion loops
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// number of frames waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }
}

/// Completes when a cache's [closed signal](ReceiveCache::closed_signal) is set, or when the
///  cache is gone altogether
pub async fn wait_until_closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use crate::buffers::buffer_pool::FrameBufferPool;
    use crate::frame_codec::Role;
    use super::*;

    fn cache(role: Role, capacity: usize) -> (ReceiveCache, Arc<FrameBufferPool>) {
        let pool = Arc::new(FrameBufferPool::new());
        let codec = Arc::new(FrameCodec::new(role, true, pool.clone()));
        (ReceiveCache::new(codec, capacity), pool)
    }

    fn encoded(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let codec = FrameCodec::new(Role::Client, true, Arc::new(FrameBufferPool::new()));
        let frame = codec.encode(identifier, sequence as u32, payload).next().unwrap();
        frame.as_bytes().to_vec()
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let (cache, pool) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        let source = IpAddr::from(Ipv4Addr::new(10, 0, 0, 5));

        cache.recv(source, &encoded(4242, 6789, b"hello")).unwrap();
        assert_eq!(pool.idle_count(), 0);

        let mut buf = [0u8; 2];
        let (n, addr) = cache.read_from(&mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf, b"he");
        assert_eq!(addr, Some(LogicalAddr::from_echo_fields(source, 4242, 6789)));
        assert_eq!(pool.idle_count(), 0);

        let mut buf = [0u8; 3];
        let (n, addr2) = cache.read_from(&mut buf).await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"llo");
        assert_eq!(addr2, addr);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_read_does_not_span_frames() {
        let (cache, _) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        let source = IpAddr::from(Ipv4Addr::new(10, 0, 0, 1));

        cache.recv(source, &encoded(1, 7, b"first")).unwrap();
        cache.recv(source, &encoded(1, 8, b"second")).unwrap();

        let mut buf = [0u8; 100];
        let (n, addr) = cache.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"first");
        assert_eq!(addr.unwrap().echo_fields(), (1, 7));

        let (n, addr) = cache.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"second");
        assert_eq!(addr.unwrap().echo_fields(), (1, 8));
    }

    #[tokio::test]
    async fn test_zero_length_read() {
        let (cache, _) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        cache.recv(Ipv4Addr::LOCALHOST.into(), &encoded(1, 2, b"abc")).unwrap();

        let (n, addr) = cache.read_from(&mut []).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(addr, None);
        assert_eq!(cache.queued(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (cache, pool) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);

        for i in 0..=DEFAULT_QUEUE_CAPACITY {
            let seq = i as u16;
            cache.recv(Ipv4Addr::LOCALHOST.into(), &encoded(0, seq, &seq.to_be_bytes())).unwrap();
        }
        assert_eq!(cache.queued(), DEFAULT_QUEUE_CAPACITY);
        assert_eq!(pool.idle_count(), 1);

        let mut buf = [0u8; 2];
        for i in 0..DEFAULT_QUEUE_CAPACITY {
            let (n, addr) = cache.read_from(&mut buf).await.unwrap();
            assert_eq!(n, 2);
            assert_eq!(u16::from_be_bytes(buf) as usize, i);
            assert_eq!(addr.unwrap().port as usize, i);
        }
        assert_eq!(cache.queued(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_is_reported() {
        let (cache, _) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);

        assert!(cache.recv(Ipv4Addr::LOCALHOST.into(), &[8, 0, 0]).is_err());
        assert_eq!(cache.queued(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (cache, _) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        let cache = Arc::new(cache);

        let reader = tokio::spawn({
            let cache = cache.clone();
            async move {
                let mut buf = [0u8; 10];
                cache.read_from(&mut buf).await
            }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        cache.close();
        let result = tokio::time::timeout(Duration::from_secs(5), reader).await
            .expect("reader should be woken up by close")
            .unwrap();
        assert!(result.is_err());
        assert!(cache.is_closed());
    }

    #[tokio::test]
    async fn test_close_drains_queued_frames_first() {
        let (cache, _) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        cache.recv(Ipv4Addr::LOCALHOST.into(), &encoded(1, 2, b"abc")).unwrap();

        cache.close();
        cache.close();

        let mut buf = [0u8; 10];
        let (n, _) = cache.read_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        assert!(cache.read_from(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_frames_after_close_are_dropped() {
        let (cache, pool) = cache(Role::Server, DEFAULT_QUEUE_CAPACITY);
        cache.close();

        cache.recv(Ipv4Addr::LOCALHOST.into(), &encoded(1, 2, b"late")).unwrap();
        assert_eq!(cache.queued(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_signal() {
        let (cache, _) = cache(Role::Server, 10);
        let mut signal = cache.closed_signal();
        assert!(!*signal.borrow());

        cache.close();
        wait_until_closed(&mut signal).await;
        assert!(*signal.borrow());
    }
}
