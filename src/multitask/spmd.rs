//! SPMD groups: N lanes running the same kernel, synchronized by a barrier
//! and exchanging data through a preallocated broadcast buffer.

use std::cell::{Cell, UnsafeCell};
use std::ops::Range;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Barrier;

use super::job::{Job, JobCount};
use super::system::JobSystem;

pub struct SpmdGroup {
    lane_count: usize,
    barrier: Barrier,
    scratch: UnsafeCell<Box<[u8]>>,
    next_lane: AtomicUsize,
}

// The scratch buffer is only written by the root lane between two barrier
// waits and only read between the second and third, so access never
// overlaps.
unsafe impl Sync for SpmdGroup {}

thread_local! {
    static MEMBERSHIP: Cell<(*const SpmdGroup, usize)> = Cell::new((ptr::null(), 0));
}

impl SpmdGroup {
    /// A group of `lane_count` lanes with `broadcast_scratch_size` bytes of
    /// shared broadcast space. The scratch must cover the largest single
    /// broadcast any lane will issue.
    pub fn new(lane_count: usize, broadcast_scratch_size: usize) -> SpmdGroup {
        if lane_count == 0 {
            critical!("lane_count must be non-zero");
        }
        if broadcast_scratch_size == 0 {
            critical!("broadcast scratch size must be non-zero");
        }

        SpmdGroup {
            lane_count,
            barrier: Barrier::new(lane_count),
            scratch: UnsafeCell::new(vec![0u8; broadcast_scratch_size].into_boxed_slice()),
            next_lane: AtomicUsize::new(0),
        }
    }

    /// Registers the calling thread as `lane`.
    pub fn join(&self, lane: usize) {
        if lane >= self.lane_count {
            critical!("lane {} out of range for a group of {}", lane, self.lane_count);
        }

        MEMBERSHIP.with(|slot| {
            debug_assert!(slot.get().0.is_null(), "thread is already in a group");
            slot.set((self as *const SpmdGroup, lane));
        });
    }

    /// Registers the calling thread under the next unclaimed lane id.
    pub fn join_auto(&self) -> usize {
        let lane = self.next_lane.fetch_add(1, Ordering::AcqRel);
        if lane >= self.lane_count {
            critical!("too many threads joining a group of {} lanes", self.lane_count);
        }

        self.join(lane);
        lane
    }

    /// Drops the calling thread's membership. Leaving a group that was
    /// never entered is a contract breach.
    pub fn leave(&self) {
        MEMBERSHIP.with(|slot| {
            let (group, _) = slot.get();
            if !ptr::eq(group, self) {
                critical!("leaving a group this thread never joined");
            }
            slot.set((ptr::null(), 0));
        });
    }

    /// The calling thread's lane id within this group.
    pub fn lane(&self) -> usize {
        MEMBERSHIP.with(|slot| {
            let (group, lane) = slot.get();
            if !ptr::eq(group, self) {
                critical!("thread is not a member of this group");
            }
            lane
        })
    }

    pub fn lane_count(&self) -> usize {
        self.lane_count
    }

    pub fn is_root(&self, lane: usize) -> bool {
        self.lane() == lane
    }

    /// Barrier rendezvous: returns once every lane of the group has
    /// reached the same sync point.
    pub fn sync(&self) {
        self.barrier.wait();
    }

    /// Copies `root_lane`'s `src` into every lane's `dst`. All lanes must
    /// call this with buffers of the same length; only the root lane's
    /// `src` is read.
    pub fn broadcast(&self, dst: &mut [u8], src: &[u8], root_lane: usize) {
        debug_assert_eq!(dst.len(), src.len());
        if root_lane >= self.lane_count {
            critical!("broadcast root lane {} out of range", root_lane);
        }

        let size = dst.len();
        if size > unsafe { (&*self.scratch.get()).len() } {
            critical!("broadcast of {} bytes exceeds the preallocated scratch buffer", size);
        }

        self.sync();

        if self.lane() == root_lane {
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), (*self.scratch.get()).as_mut_ptr(), size);
            }
        }

        self.sync();

        unsafe {
            ptr::copy_nonoverlapping((*self.scratch.get()).as_ptr(), dst.as_mut_ptr(), size);
        }

        self.sync();
    }

    /// This lane's slice of `0..total` under [`split_range`].
    pub fn lane_range(&self, total: u64) -> Range<u64> {
        split_range(total, self.lane() as u64, self.lane_count as u64)
    }
}

/// Splits `0..total` into `lane_count` contiguous chunks, folding the
/// remainder into the leading lanes so sizes differ by at most one.
pub fn split_range(total: u64, lane: u64, lane_count: u64) -> Range<u64> {
    if lane_count == 0 || total == 0 {
        return 0..0;
    }

    debug_assert!(lane < lane_count);

    let base = total / lane_count;
    let remainder = total % lane_count;

    let start = lane * base + lane.min(remainder);
    let count = base + if lane < remainder { 1 } else { 0 };

    start..start + count
}

/// Fans `kernel` out over `lane_count` lanes of a fresh group and blocks
/// until every lane has finished. Each lane auto-joins the group, runs the
/// kernel over its own copy of `params`, and leaves.
///
/// Lanes rendezvous on a blocking barrier, so `lane_count` must not exceed
/// `system.worker_count()`; more lanes than threads cannot all reach the
/// barrier at once.
pub fn dispatch<P>(
    system: &JobSystem,
    lane_count: usize,
    broadcast_scratch_size: usize,
    kernel: fn(&SpmdGroup, &mut P),
    params: P,
) where
    P: Copy + Send,
{
    debug_assert!(
        lane_count <= system.worker_count(),
        "more lanes than worker threads deadlocks the group barrier"
    );

    struct Lane<P: Copy> {
        group: *const SpmdGroup,
        kernel: fn(&SpmdGroup, &mut P),
        params: P,
    }

    impl<P: Copy> Clone for Lane<P> {
        fn clone(&self) -> Self {
            *self
        }
    }

    impl<P: Copy> Copy for Lane<P> {}

    unsafe impl<P: Copy + Send> Send for Lane<P> {}

    fn lane_main<P: Copy + Send>(lane: &mut Lane<P>) {
        // The group outlives the jobs because dispatch waits on the root
        // before returning.
        let group = unsafe { &*lane.group };
        group.join_auto();
        (lane.kernel)(group, &mut lane.params);
        group.leave();
    }

    let group = SpmdGroup::new(lane_count, broadcast_scratch_size);
    let root = JobCount::new();

    for _ in 0..lane_count {
        let job = unsafe {
            Job::with_parent(
                &root,
                lane_main::<P>,
                Lane {
                    group: &group,
                    kernel,
                    params,
                },
            )
        };
        system.submit(job);
    }

    system.wait(&root);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn split_balances_remainder_into_leading_lanes() {
        assert_eq!(split_range(10, 0, 4), 0..3);
        assert_eq!(split_range(10, 1, 4), 3..6);
        assert_eq!(split_range(10, 2, 4), 6..8);
        assert_eq!(split_range(10, 3, 4), 8..10);
    }

    #[test]
    fn split_covers_exactly_once() {
        for &(total, lanes) in &[(1u64, 1u64), (7, 3), (64, 8), (100, 7), (3, 8)] {
            let mut covered = 0;
            for lane in 0..lanes {
                let range = split_range(total, lane, lanes);
                assert!(range.start <= range.end);
                assert_eq!(range.start, covered);
                covered = range.end;
            }
            assert_eq!(covered, total);
        }
    }

    #[test]
    fn split_degenerate_inputs() {
        assert_eq!(split_range(0, 0, 4), 0..0);
        assert_eq!(split_range(10, 0, 0), 0..0);
    }

    #[test]
    fn membership_bookkeeping() {
        let group = SpmdGroup::new(2, 16);
        let lane = group.join_auto();
        assert_eq!(lane, 0);
        assert_eq!(group.lane(), 0);
        assert!(group.is_root(0));
        assert!(!group.is_root(1));
        group.leave();
    }
}
