//! Pooled byte buffers.
//!
//! Request bodies and inbound WebSocket frames are short-lived allocations
//! with a predictable size profile; recycling them through a pool keeps the
//! hot paths off the allocator. A buffer handed out by `get` is empty but
//! keeps whatever capacity it grew to in earlier lives.

use std::sync::Mutex;

pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    /// Capacity given to freshly allocated buffers.
    initial_capacity: usize,
    /// Buffers returned beyond this count are dropped instead of pooled.
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(max_pooled: usize, initial_capacity: usize) -> Self {
        BufferPool {
            buffers: Mutex::new(Vec::new()),
            initial_capacity,
            max_pooled,
        }
    }

    /// Takes a cleared buffer from the pool, allocating if none is pooled.
    pub fn get(&self) -> Vec<u8> {
        let recycled = {
            let mut buffers = self.buffers.lock().expect("buffer pool lock");
            buffers.pop()
        };
        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => Vec::with_capacity(self.initial_capacity),
        }
    }

    /// Hands a buffer back for reuse. Callers that received a buffer's
    /// contents through a channel (e.g. a hub message payload) may recycle
    /// it here once they are done with the bytes.
    pub fn put(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock().expect("buffer pool lock");
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().expect("buffer pool lock").len()
    }
}
