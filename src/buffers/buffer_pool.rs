use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;
use crate::echo_frame::{FRAME_CAPACITY, PROTOCOL_TAG, TAG_OFFSET};

/// A free-list of frame buffers, all of them with the full frame capacity of
///  [FRAME_CAPACITY] bytes. The pool is not bounded: every buffer that was ever handed out
///  is retained once it is returned.
///
/// The pool is an explicit object (shared through `Arc`) rather than global state, so each
///  connection - and each test - can work with its own pool.
pub struct FrameBufferPool {
    buffers: Mutex<Vec<FixedBuf>>,
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBufferPool {
    pub fn new() -> FrameBufferPool {
        FrameBufferPool {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Returns an empty buffer. The first eight bytes (ICMP type through sequence) are zero;
    ///  newly allocated buffers additionally carry the protocol tag in bytes 8..16. Bytes
    ///  beyond that are whatever a previous frame left there.
    pub fn get_from_pool(&self) -> FixedBuf {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(mut buffer) = buffers.pop() {
                trace!("returning buffer from pool");
                buffer.prefix_mut(TAG_OFFSET).fill(0);
                return buffer;
            }
        }

        debug!("no buffer in pool: creating new buffer");
        let mut buffer = FixedBuf::new(FRAME_CAPACITY);
        buffer.prefix_mut(FRAME_CAPACITY)[TAG_OFFSET..TAG_OFFSET + PROTOCOL_TAG.len()]
            .copy_from_slice(&PROTOCOL_TAG);
        buffer
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), FRAME_CAPACITY,
                   "returned buffer does not have the regular capacity of {} bytes", FRAME_CAPACITY);

        buffer.clear();

        trace!("returning buffer to pool");
        self.buffers.lock().unwrap()
            .push(buffer);
    }

    /// number of buffers currently idle in the pool
    pub fn idle_count(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
