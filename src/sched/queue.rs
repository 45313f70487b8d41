//! Bounded multi-producer multi-consumer ring, after Dmitry Vyukov's
//! classic queue (https://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue).
//!
//! Every cell carries a sequence counter that encodes whether the cell is
//! ready for a producer or a consumer at the current lap. Producers and
//! consumers race on the padded positions only; data movement itself is
//! wait-free once a position is claimed.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

struct Slot<T> {
    sequence: AtomicUsize,
    data: UnsafeCell<MaybeUninit<T>>,
}

pub struct MpmcQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: usize,
    enqueue_pos: CachePadded<AtomicUsize>,
    dequeue_pos: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for MpmcQueue<T> {}
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> MpmcQueue<T> {
    /// Creates a ring with room for `capacity` entries. The capacity must be
    /// a power of two so that positions can wrap with a mask.
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 || !capacity.is_power_of_two() {
            critical!("queue capacity must be a non-zero power of two, got {}", capacity);
        }

        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        MpmcQueue {
            buffer,
            mask: capacity - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Pushes `value`, returning `false` when the ring is full. The caller
    /// decides whether a full ring is fatal; for the scheduler it is.
    pub fn enqueue(&self, value: T) -> bool {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *slot.data.get() = MaybeUninit::new(value) };
                        slot.sequence.store(pos + 1, Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Pops the oldest entry, or `None` when the ring is empty.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);

        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { (*slot.data.get()).as_ptr().read() };
                        slot.sequence.store(pos + self.mask + 1, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        // Anything still queued was never handed out; release it here.
        while let Some(value) = self.dequeue() {
            drop(value);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_dequeue() {
        let q: MpmcQueue<u32> = MpmcQueue::new(8);
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn fifo_within_capacity() {
        let q = MpmcQueue::new(8);
        for i in 0..8 {
            assert!(q.enqueue(i));
        }
        assert!(!q.enqueue(8));

        for i in 0..8 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
    }

    #[test]
    fn capacity_one_matches_capacity_n_for_spsc() {
        let tiny = MpmcQueue::new(1);
        let wide = MpmcQueue::new(16);

        for i in 0..64 {
            assert!(tiny.enqueue(i));
            assert!(wide.enqueue(i));
            assert_eq!(tiny.dequeue(), wide.dequeue());
        }
        assert_eq!(tiny.dequeue(), None);
        assert_eq!(wide.dequeue(), None);
    }

    #[test]
    fn wraps_around_many_laps() {
        let q = MpmcQueue::new(4);
        for lap in 0..100 {
            for i in 0..4 {
                assert!(q.enqueue(lap * 4 + i));
            }
            for i in 0..4 {
                assert_eq!(q.dequeue(), Some(lap * 4 + i));
            }
        }
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let q = Arc::new(MpmcQueue::new(1 << 10));
        let mut handles = Vec::new();

        for p in 0..PRODUCERS {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    while !q.enqueue(value) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut sinks = Vec::new();
        for _ in 0..PRODUCERS {
            let q = q.clone();
            sinks.push(thread::spawn(move || {
                let mut got = Vec::new();
                while got.len() < PER_PRODUCER {
                    if let Some(v) = q.dequeue() {
                        got.push(v);
                    } else {
                        thread::yield_now();
                    }
                }
                got
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let mut all = Vec::new();
        for s in sinks {
            all.extend(s.join().unwrap());
        }

        all.sort();
        let expect: Vec<_> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(all, expect);
    }

    #[test]
    #[should_panic]
    fn rejects_non_power_of_two() {
        let _ = MpmcQueue::<u32>::new(6);
    }
}
