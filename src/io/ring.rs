use crossbeam::utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded multi-producer multi-consumer FIFO over a power-of-two slot
/// array.
///
/// `head` is the next write index and `tail` the next read index, both
/// stored pre-masked into the slot array. The array holds one slot more
/// than the enforced `capacity` (rounded up to a power of two), so a
/// full ring never makes `head` catch up with `tail` from behind.
///
/// Capacity is enforced by an atomic reservation on `len`: an enqueue
/// first claims a unit of capacity with a CAS, then wins a slot by
/// advancing `head`. A claim below capacity guarantees a free slot, so
/// the head CAS only ever loses to other claimants and is retried.
/// `len` is advisory for readers (it may briefly run ahead of what
/// `dequeue` can see); the head/tail pair is authoritative for FIFO.
///
/// Slot payloads sit behind per-slot micro-locks. The index choreography
/// stays lock-free: a slot lock is only ever contended by the one writer
/// and the one reader that won that index, and each holds it for a
/// single `Option` move.
pub struct RingBuffer<T> {
    slots: Box<[Mutex<Option<T>>]>,
    mask: usize,
    capacity: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    len: CachePadded<AtomicUsize>,
}

impl<T> RingBuffer<T> {
    /// Create a ring enforcing `capacity` items.
    ///
    /// The slot array is sized to the next power of two at or above
    /// `capacity + 1`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be at least 1");
        let slot_count = (capacity + 1).next_power_of_two();
        let slots = (0..slot_count)
            .map(|_| Mutex::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: slot_count - 1,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Place `item` at the tail of the queue.
    ///
    /// Returns the item back when the ring is at capacity. Never blocks;
    /// contended CAS failures spin-yield and retry.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        // Claim capacity first; losing here is the only "full" outcome.
        if self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.capacity).then_some(n + 1)
            })
            .is_err()
        {
            return Err(item);
        }

        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let next = (head + 1) & self.mask;
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }

        self.write_slot(head, item);
        Ok(())
    }

    /// Remove and return the head of the queue, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            if tail == self.head.load(Ordering::Acquire) {
                return None;
            }
            let next = (tail + 1) & self.mask;
            match self
                .tail
                .compare_exchange_weak(tail, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let item = self.read_slot(tail);
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return Some(item);
                }
                Err(_) => backoff.spin(),
            }
        }
    }

    fn write_slot(&self, index: usize, item: T) {
        let backoff = Backoff::new();
        let mut item = Some(item);
        loop {
            {
                let mut slot = self.slots[index].lock();
                if slot.is_none() {
                    *slot = item.take();
                    return;
                }
            }
            // A lagging reader that won this index on a previous lap has
            // not taken its item yet; let it finish.
            backoff.snooze();
        }
    }

    fn read_slot(&self, index: usize) -> T {
        let backoff = Backoff::new();
        loop {
            if let Some(item) = self.slots[index].lock().take() {
                return item;
            }
            // The writer that reserved this index has not stored yet.
            backoff.snooze();
        }
    }

    /// Number of items currently held. Advisory under concurrency.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Drop everything currently in the ring.
    pub fn clear(&self) {
        while self.dequeue().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_within_capacity() {
        let ring = RingBuffer::new(4);
        for i in 0..4 {
            assert!(ring.enqueue(i).is_ok());
        }
        assert!(ring.is_full());
        assert_eq!(ring.enqueue(99), Err(99));
        for i in 0..4 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn wraps_around_many_laps() {
        let ring = RingBuffer::new(3);
        for lap in 0..100u32 {
            assert!(ring.enqueue(lap).is_ok());
            assert_eq!(ring.dequeue(), Some(lap));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn capacity_is_what_was_asked_not_the_array_size() {
        // 10 rounds to a 16-slot array; only 10 items must fit.
        let ring = RingBuffer::new(10);
        for i in 0..10 {
            assert!(ring.enqueue(i).is_ok());
        }
        assert!(ring.enqueue(10).is_err());
        assert_eq!(ring.len(), 10);
    }

    #[test]
    fn clear_empties_the_ring() {
        let ring = RingBuffer::new(8);
        for i in 0..5 {
            ring.enqueue(i).unwrap();
        }
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
        assert!(ring.enqueue(1).is_ok());
    }

    #[test]
    fn concurrent_enqueue_dequeue_loses_nothing() {
        let ring = Arc::new(RingBuffer::new(64));
        let writers = 4;
        let per_writer = 10_000u64;

        let mut handles = Vec::new();
        for w in 0..writers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_writer {
                    let mut item = w as u64 * per_writer + i;
                    loop {
                        match ring.enqueue(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let reader = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let total = writers as u64 * per_writer;
                let mut seen = 0u64;
                let mut sum = 0u64;
                while seen < total {
                    match ring.dequeue() {
                        Some(v) => {
                            sum += v;
                            seen += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
                sum
            })
        };

        for h in handles {
            h.join().unwrap();
        }
        let total = writers as u64 * per_writer;
        let expected = total * (total - 1) / 2;
        assert_eq!(reader.join().unwrap(), expected);
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_enqueue_never_exceeds_capacity() {
        let ring = Arc::new(RingBuffer::new(8));
        let mut handles = Vec::new();
        for i in 0..32 {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || ring.enqueue(i).is_ok()));
        }
        let accepted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(accepted, 8);
        assert_eq!(ring.len(), 8);
        let mut drained = 0;
        while ring.dequeue().is_some() {
            drained += 1;
        }
        assert_eq!(drained, 8);
    }
}
