use std::sync::Mutex;

use super::MessageLength;

// Keeping more than this many buffers would only help a node with an unusually
// large number of links, and the memory is never given back.
const MAX_POOLED_BUFFERS: usize = 64;

/// Recycles byte buffers between link threads so that receiving and sending
/// frames does not thrash the heap with short-lived allocations
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Returns a zeroed buffer of exactly the requested length
    pub fn get(self: &Self, size: MessageLength) -> Vec<u8> {
        let len: usize = size.into();
        let mut buffer = match self.buffers.lock().unwrap().pop() {
            Some(buffer) => buffer,
            None => Vec::new(),
        };
        buffer.clear();
        buffer.resize(len, 0);
        buffer
    }

    /// Returns a buffer of the requested length with room to grow
    pub fn get_with_capacity(self: &Self, size: MessageLength, capacity: MessageLength) -> Vec<u8> {
        let mut buffer = self.get(size);
        buffer.reserve(capacity as usize);
        buffer
    }

    pub fn reuse(self: &Self, buffer: Vec<u8>) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < MAX_POOLED_BUFFERS {
            buffers.push(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffers_are_zeroed() {
        let pool = BufferPool::new();

        let mut buffer = pool.get(4);
        buffer[0] = 0xff;
        pool.reuse(buffer);

        let buffer = pool.get(8);
        assert_eq!(buffer.len(), 8);
        assert!(buffer.iter().all(|&b| b == 0));
    }
}
