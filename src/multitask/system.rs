//! The lightweight work-stealing job system.
//!
//! One Chase–Lev deque per participating thread: the constructing thread
//! is worker 0, plus `workers` background threads. Submission always goes
//! to the calling thread's own deque; idle workers steal from random
//! victims. There is no parking here — waiting helps drain queues instead —
//! which makes this the right tool for flat fan-out compute (shader
//! compilation, SPMD kernels) as opposed to dependency graphs.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_utils::Backoff;

use crate::errors::Result;
use crate::utils::XorShift64Star;

use super::deque::WorkStealDeque;
use super::job::{Job, JobCount};

const INVALID_WORKER: usize = ::std::usize::MAX;

pub struct JobSystemOptions {
    /// Background worker threads; the constructing thread participates as
    /// worker 0 on top of these.
    pub workers: usize,
    /// Capacity of each per-thread deque. Power of two; overflow is fatal.
    pub queue_capacity: usize,
    /// Random victims probed per steal round before backing off.
    pub steal_tries: usize,
}

impl Default for JobSystemOptions {
    fn default() -> Self {
        JobSystemOptions {
            workers: num_cpus::get().saturating_sub(1).max(1),
            queue_capacity: 1 << 14,
            steal_tries: 3,
        }
    }
}

#[cfg(debug_assertions)]
#[derive(Default)]
struct Stats {
    pops: AtomicU64,
    steals: AtomicU64,
    yields: AtomicU64,
}

/// Aggregate worker statistics, tracked in debug builds only.
#[cfg(debug_assertions)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobSystemStats {
    pub pops: u64,
    pub steals: u64,
    pub yields: u64,
}

struct Shared {
    queues: Box<[WorkStealDeque<Job>]>,
    shutdown: AtomicBool,
    steal_tries: usize,
    #[cfg(debug_assertions)]
    stats: Box<[Stats]>,
}

impl Shared {
    /// Runs one job if any can be found: own deque first, then up to
    /// `steal_tries` random victims.
    fn try_run_one(&self, index: usize) -> bool {
        // SAFETY: `index` is the calling thread's own deque.
        if let Some(job) = unsafe { self.queues[index].pop() } {
            #[cfg(debug_assertions)]
            self.stats[index].pops.fetch_add(1, Ordering::Relaxed);

            job.execute();
            return true;
        }

        let total = self.queues.len();
        for attempt in 0..self.steal_tries {
            let victim = pick_victim(index, total, attempt);
            if let Some(job) = self.queues[victim].steal() {
                #[cfg(debug_assertions)]
                self.stats[index].steals.fetch_add(1, Ordering::Relaxed);

                job.execute();
                return true;
            }
        }

        false
    }

    #[cfg(debug_assertions)]
    fn note_yield(&self, index: usize) {
        self.stats[index].yields.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(not(debug_assertions))]
    fn note_yield(&self, _index: usize) {}
}

pub struct JobSystem {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl JobSystem {
    /// Brings up the background workers and registers the calling thread
    /// as worker 0.
    pub fn new(options: JobSystemOptions) -> Result<JobSystem> {
        let total = options.workers + 1;

        let shared = Arc::new(Shared {
            queues: (0..total)
                .map(|_| WorkStealDeque::new(options.queue_capacity))
                .collect(),
            shutdown: AtomicBool::new(false),
            steal_tries: options.steal_tries.max(1),
            #[cfg(debug_assertions)]
            stats: (0..total).map(|_| Stats::default()).collect(),
        });

        WORKER_INDEX.with(|slot| {
            if slot.get() != INVALID_WORKER {
                critical!("a job system is already registered on this thread");
            }
            slot.set(0);
        });

        let mut workers = Vec::with_capacity(options.workers);
        for i in 0..options.workers {
            let worker_shared = shared.clone();
            let index = i + 1;

            let spawned = thread::Builder::new()
                .name(format!("weft-compute-{}", index))
                .spawn(move || worker_loop(&worker_shared, index));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    shared.shutdown.store(true, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    WORKER_INDEX.with(|slot| slot.set(INVALID_WORKER));
                    return Err(err_format!("failed to spawn compute worker {}: {}", index, err));
                }
            }
        }

        Ok(JobSystem { shared, workers })
    }

    /// Total number of participating threads (background workers plus the
    /// constructing thread).
    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    /// Pushes `job` onto the calling thread's deque. If the job has a
    /// parent count, the reference is taken before the job becomes
    /// stealable. Only registered threads (worker 0 or jobs already
    /// running on workers) may submit.
    pub fn submit(&self, job: Job) {
        let index = current_worker_index();
        if index == INVALID_WORKER {
            critical!("job submitted from a thread the system does not own");
        }

        let parent = job.parent();
        if !parent.is_null() {
            unsafe { (*parent).add_one() };
        }

        // SAFETY: `index` is the calling thread's own deque.
        if !unsafe { self.shared.queues[index].push(job) } {
            critical!("work-stealing deque overflow; increase queue_capacity");
        }
    }

    /// Blocks until `root` drains to zero, helping to execute jobs the
    /// whole time. This never parks a thread; it is the lightweight
    /// system's only form of waiting.
    pub fn wait(&self, root: &JobCount) {
        let index = current_worker_index();
        if index == INVALID_WORKER {
            critical!("wait called from a thread the system does not own");
        }

        let backoff = Backoff::new();
        while !root.is_done() {
            if self.shared.try_run_one(index) {
                backoff.reset();
            } else {
                self.shared.note_yield(index);
                backoff.snooze();
            }
        }
    }

    #[cfg(debug_assertions)]
    pub fn debug_totals(&self) -> JobSystemStats {
        let mut totals = JobSystemStats::default();
        for stats in self.shared.stats.iter() {
            totals.pops += stats.pops.load(Ordering::Relaxed);
            totals.steals += stats.steals.load(Ordering::Relaxed);
            totals.yields += stats.yields.load(Ordering::Relaxed);
        }
        totals
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("a compute worker panicked during execution");
            }
        }

        WORKER_INDEX.with(|slot| slot.set(INVALID_WORKER));

        #[cfg(debug_assertions)]
        log::debug!("job system retired: {:?}", self.debug_totals());
    }
}

thread_local! {
    static WORKER_INDEX: Cell<usize> = Cell::new(INVALID_WORKER);
    static VICTIM_RNG: XorShift64Star = XorShift64Star::new();
}

fn current_worker_index() -> usize {
    WORKER_INDEX.with(|slot| slot.get())
}

fn pick_victim(self_index: usize, total: usize, attempt: usize) -> usize {
    if total <= 1 {
        return 0;
    }

    let mut victim = VICTIM_RNG.with(|rng| rng.next_usize(total));
    victim = (victim + attempt) % total;

    if victim == self_index {
        victim = (victim + 1) % total;
    }

    victim
}

fn worker_loop(shared: &Shared, index: usize) {
    WORKER_INDEX.with(|slot| {
        debug_assert_eq!(slot.get(), INVALID_WORKER);
        slot.set(index);
    });

    let backoff = Backoff::new();
    while !shared.shutdown.load(Ordering::Acquire) {
        if shared.try_run_one(index) {
            backoff.reset();
        } else {
            shared.note_yield(index);
            backoff.snooze();
        }
    }

    WORKER_INDEX.with(|slot| slot.set(INVALID_WORKER));
}
