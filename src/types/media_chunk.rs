/// FIFO byte buffer with a prepare/commit/consume protocol. `prepare`
/// reserves writable space past the committed region, `commit` promotes
/// prepared bytes, `consume` removes bytes from the front.
#[derive(Debug, Default)]
pub struct DynamicBuffer {
    data: Vec<u8>,
    committed: usize,
}

impl DynamicBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exposes at least `n` writable bytes beyond the committed region.
    pub fn prepare(&mut self, n: usize) -> &mut [u8] {
        if n > self.capacity() {
            let grow = n - self.capacity();
            self.data.resize(self.data.len() + grow, 0);
        }
        &mut self.data[self.committed..]
    }

    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.data.len() - self.committed);
        self.committed += n;
    }

    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.committed);
        self.data.drain(..n);
        self.committed -= n;
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.committed]
    }

    pub fn size(&self) -> usize {
        self.committed
    }

    pub fn capacity(&self) -> usize {
        self.data.len() - self.committed
    }

    pub fn reset(&mut self) {
        self.committed = 0;
    }
}

/// A run of PCM samples crossing the PipeWire thread boundary. Planar
/// formats keep one buffer per channel; interleaved formats use a single
/// buffer whose byte count is a multiple of sample size times channels.
#[derive(Debug, Default)]
pub struct MediaChunk {
    pub timestamp_ms: u64,
    pub sample_count: usize,
    buffers: Vec<DynamicBuffer>,
}

impl MediaChunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel_buffers(&self) -> &[DynamicBuffer] {
        &self.buffers
    }

    pub fn channel_buffers_mut(&mut self) -> &mut Vec<DynamicBuffer> {
        &mut self.buffers
    }

    pub fn reset(&mut self) {
        self.timestamp_ms = 0;
        self.sample_count = 0;
        for buffer in &mut self.buffers {
            buffer.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_commit_consume_leaves_size_unchanged() {
        let mut buffer = DynamicBuffer::new();
        buffer.prepare(8).copy_from_slice(&[1u8; 8]);
        buffer.commit(8);
        let before = buffer.size();

        let target = buffer.prepare(4);
        target[..4].copy_from_slice(&[2u8; 4]);
        buffer.commit(4);
        buffer.consume(4);

        assert_eq!(buffer.size(), before);
    }

    #[test]
    fn consume_drops_from_the_front() {
        let mut buffer = DynamicBuffer::new();
        buffer.prepare(4).copy_from_slice(&[1, 2, 3, 4]);
        buffer.commit(4);
        buffer.consume(2);
        assert_eq!(buffer.data(), &[3, 4]);
    }

    #[test]
    #[should_panic]
    fn consume_beyond_committed_panics() {
        let mut buffer = DynamicBuffer::new();
        buffer.prepare(4);
        buffer.commit(2);
        buffer.consume(3);
    }

    #[test]
    fn fully_consumed_buffer_accepts_new_data() {
        let mut buffer = DynamicBuffer::new();
        buffer.prepare(16);
        buffer.commit(16);
        buffer.consume(16);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.data().is_empty());
        buffer.prepare(8).copy_from_slice(&[9u8; 8]);
        buffer.commit(8);
        assert_eq!(buffer.size(), 8);
        assert_eq!(buffer.data(), &[9u8; 8]);
    }
}
