use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use ffmpeg_next::codec::packet::Packet;

/// Upper bound on the cumulative byte size of queued packets.
pub const DEFAULT_MAX_QUEUE_BYTES: usize = 10_000_000;

/// An encoded packet in flight between an encoder and the muxer thread.
pub struct QueuedPacket {
    pub packet: Packet,
    size: usize,
}

// Packets only move between the encoding threads and the muxer thread
// through the queue's mutex
unsafe impl Send for QueuedPacket {}

impl QueuedPacket {
    fn new(packet: Packet) -> Self {
        let size = packet.size();
        Self { packet, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueuedPacket>,
    bytes: usize,
    shutdown: bool,
}

/// Byte-bounded FIFO between the encoders and the muxer. Producers block
/// while a packet would overflow the capacity, the consumer blocks while
/// empty. After shutdown the consumer drains what remains and then
/// observes `None`.
pub struct PacketQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    item_ready: Condvar,
    space_available: Condvar,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_QUEUE_BYTES)
    }
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            item_ready: Condvar::new(),
            space_available: Condvar::new(),
        }
    }

    /// Returns false when the queue has shut down and the packet was
    /// discarded.
    pub fn enqueue(&self, packet: Packet) -> bool {
        let item = QueuedPacket::new(packet);
        let mut state = self.state.lock().unwrap();

        // An oversized packet is admitted once the queue is empty instead
        // of waiting forever
        while !state.shutdown
            && state.bytes + item.size > self.capacity
            && !state.items.is_empty()
        {
            log::debug!("Packet queue is full. Waiting...");
            state = self.space_available.wait(state).unwrap();
        }

        if state.shutdown {
            return false;
        }

        state.bytes += item.size;
        state.items.push_back(item);
        drop(state);

        self.item_ready.notify_one();
        true
    }

    pub fn dequeue(&self) -> Option<QueuedPacket> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                debug_assert!(state.bytes >= item.size);
                state.bytes -= item.size;
                drop(state);
                self.space_available.notify_one();
                return Some(item);
            }

            if state.shutdown {
                return None;
            }

            state = self.item_ready.wait(state).unwrap();
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        drop(state);
        self.item_ready.notify_all();
        self.space_available.notify_all();
    }

    pub fn bytes_queued(&self) -> usize {
        self.state.lock().unwrap().bytes
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().unwrap().items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn packet_of(size: usize, tag: u8) -> Packet {
        Packet::copy(&vec![tag; size])
    }

    #[test]
    fn tracked_bytes_match_queued_packet_sizes() {
        let queue = PacketQueue::new(DEFAULT_MAX_QUEUE_BYTES);
        assert!(queue.enqueue(packet_of(100, 0)));
        assert!(queue.enqueue(packet_of(50, 1)));
        assert_eq!(queue.bytes_queued(), 150);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.size(), 100);
        assert_eq!(queue.bytes_queued(), 50);

        queue.dequeue().unwrap();
        assert_eq!(queue.bytes_queued(), 0);
    }

    #[test]
    fn producer_blocks_at_capacity_until_a_dequeue() {
        let queue = Arc::new(PacketQueue::new(200));
        let enqueued = Arc::new(AtomicUsize::new(0));

        let producer = {
            let queue = Arc::clone(&queue);
            let enqueued = Arc::clone(&enqueued);
            thread::spawn(move || {
                for tag in 0..5u8 {
                    queue.enqueue(packet_of(100, tag));
                    enqueued.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert_eq!(enqueued.load(Ordering::SeqCst), 2);

        let mut tags = Vec::new();
        for _ in 0..5 {
            let item = queue.dequeue().unwrap();
            tags.push(item.packet.data().unwrap()[0]);
            thread::sleep(Duration::from_millis(10));
        }

        producer.join().unwrap();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.bytes_queued(), 0);
    }

    #[test]
    fn shutdown_drains_remaining_items_then_ends() {
        let queue = PacketQueue::new(DEFAULT_MAX_QUEUE_BYTES);
        queue.enqueue(packet_of(10, 7));
        queue.shutdown();

        assert!(queue.dequeue().is_some());
        assert!(queue.dequeue().is_none());
        assert!(!queue.enqueue(packet_of(10, 8)));
    }

    #[test]
    fn shutdown_releases_a_blocked_consumer() {
        let queue = Arc::new(PacketQueue::new(DEFAULT_MAX_QUEUE_BYTES));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.dequeue().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(consumer.join().unwrap());
    }
}
