//! The fiber scheduler: pinned workers draining three priority rings,
//! with cooperative stack switching for blocking waits.

use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use context::Transfer;
use log::{debug, warn};

use crate::errors::Result;

use super::counter::{RawCounter, TinyCounter};
use super::fiber::Fiber;
use super::job::{JobInfo, Priority};
use super::queue::MpmcQueue;
use super::thread::{bind_tls, current_tls, pin_to_core, unbind_tls};
use super::thread::{FiberLocation, WorkerThread};
use super::{Count, FiberIndex, FlagIndex, ThreadIndex, INVALID_FIBER, INVALID_FLAG};

/// Scheduler configuration. The fiber pool must be sized at least
/// `num_threads + expected parked fibers`; the defaults keep twice as many
/// fibers as workers, which covers one outstanding wait per running job.
pub struct ManagerOptions {
    pub num_threads: usize,
    pub num_fibers: usize,

    pub high_priority_queue_size: usize,
    pub normal_priority_queue_size: usize,
    pub low_priority_queue_size: usize,

    pub fiber_stack_size: usize,

    /// When true, returning from the main callback shuts the scheduler
    /// down. When false, the main thread turns into an ordinary worker and
    /// some job has to call [`Manager::shutdown`] eventually.
    pub shutdown_after_main: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        let cores = num_cpus::get();

        ManagerOptions {
            num_threads: cores,
            num_fibers: cores * 2,
            high_priority_queue_size: 512,
            normal_priority_queue_size: 512 * 4,
            low_priority_queue_size: 512 * 8,
            fiber_stack_size: 512 * 1024,
            shutdown_after_main: true,
        }
    }
}

/// Pool of stored flags, one live flag per parked fiber. The flag decouples
/// "the waiting fiber has suspended" from "somebody may resume it"; keeping
/// them pooled here (instead of one heap allocation per wait) means a wait
/// costs no allocator traffic at all.
struct FlagPool {
    stored: Box<[AtomicBool]>,
    free: Box<[AtomicBool]>,
}

impl FlagPool {
    fn new(capacity: usize) -> Self {
        FlagPool {
            stored: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            free: (0..capacity).map(|_| AtomicBool::new(true)).collect(),
        }
    }

    fn claim(&self) -> FlagIndex {
        loop {
            for i in 0..self.free.len() {
                if !self.free[i].load(Ordering::Relaxed) {
                    continue;
                }

                if self.free[i]
                    .compare_exchange_weak(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.stored[i].store(false, Ordering::Relaxed);
                    return i as FlagIndex;
                }
            }

            // Capacity equals the fiber pool, so this only happens when
            // more fibers are parked than exist. Should be unreachable.
            warn!("no free stored-flag slot; respinning");
            thread::yield_now();
        }
    }

    fn set(&self, index: FlagIndex) {
        self.stored[index as usize].store(true, Ordering::Release);
    }

    fn is_set(&self, index: FlagIndex) -> bool {
        self.stored[index as usize].load(Ordering::Acquire)
    }

    fn release(&self, index: FlagIndex) {
        self.free[index as usize].store(true, Ordering::Release);
    }
}

struct ManagerPtr(*const Manager);
unsafe impl Send for ManagerPtr {}

pub struct Manager {
    num_threads: usize,
    num_fibers: usize,
    fiber_stack_size: usize,
    shutdown_after_main: bool,

    started: AtomicBool,
    shutting_down: AtomicBool,

    threads: Box<[WorkerThread]>,
    fibers: UnsafeCell<Vec<Fiber>>,
    idle_fibers: Box<[AtomicBool]>,
    flags: FlagPool,

    high_queue: MpmcQueue<JobInfo>,
    normal_queue: MpmcQueue<JobInfo>,
    low_queue: MpmcQueue<JobInfo>,

    main_callback: UnsafeCell<Option<Box<dyn FnOnce(&Manager)>>>,
}

// Shared by reference with every worker thread. The interior-mutable parts
// are either written once during `run` before any worker spawns (fiber
// pool, main callback) or governed by their own atomic protocols.
unsafe impl Sync for Manager {}

impl Manager {
    pub fn new(options: ManagerOptions) -> Manager {
        let threads = (0..options.num_threads)
            .map(|i| WorkerThread::new(i as ThreadIndex))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Manager {
            num_threads: options.num_threads,
            num_fibers: options.num_fibers,
            fiber_stack_size: options.fiber_stack_size,
            shutdown_after_main: options.shutdown_after_main,
            started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            threads,
            fibers: UnsafeCell::new(Vec::new()),
            idle_fibers: (0..options.num_fibers).map(|_| AtomicBool::new(false)).collect(),
            flags: FlagPool::new(options.num_fibers),
            high_queue: MpmcQueue::new(options.high_priority_queue_size),
            normal_queue: MpmcQueue::new(options.normal_priority_queue_size),
            low_queue: MpmcQueue::new(options.low_priority_queue_size),
            main_callback: UnsafeCell::new(None),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn num_fibers(&self) -> usize {
        self.num_fibers
    }

    /// Brings the scheduler up and runs `main` on a fiber of the calling
    /// thread. Returns once the scheduler has shut down and every worker
    /// thread has been joined.
    pub fn run<F>(&self, main: F) -> Result<()>
    where
        F: FnOnce(&Manager),
    {
        if self.started.swap(true, Ordering::SeqCst) {
            critical!("the scheduler is already running");
        }

        if self.num_threads == 0 {
            critical!("invalid number of threads; it should be greater than 0");
        }

        if self.num_fibers == 0 {
            critical!("invalid number of fibers; it should be greater than 0");
        }

        if self.num_fibers > usize::from(INVALID_FIBER) {
            critical!("fiber pool is limited to {} entries", INVALID_FIBER);
        }

        let cores = num_cpus::get();
        if self.num_threads > cores {
            critical!(
                "cannot pin {} worker threads onto {} logical cores",
                self.num_threads,
                cores
            );
        }

        // The fiber pool. Written before any worker spawns; read-only after.
        unsafe {
            let fibers = &mut *self.fibers.get();
            fibers.reserve_exact(self.num_fibers);
            for _ in 0..self.num_fibers {
                let fiber = Fiber::with_stack(self.fiber_stack_size)?;
                fiber.set_entry(fiber_entry_worker);
                fibers.push(fiber);
            }
        }

        for idle in self.idle_fibers.iter() {
            idle.store(true, Ordering::Relaxed);
        }

        // Stash the main callback for the main fiber entry. The closure is
        // called on this thread before `run` returns, so erasing its
        // lifetime cannot be observed.
        unsafe {
            let main: Box<dyn FnOnce(&Manager) + '_> = Box::new(main);
            let main: Box<dyn FnOnce(&Manager)> = mem::transmute(main);
            *self.main_callback.get() = Some(main);
        }

        // Thread 0 is the caller.
        pin_to_core(0);
        unsafe { bind_tls(self.threads[0].tls()) };

        debug!("spawning {} worker threads, {} fibers", self.num_threads - 1, self.num_fibers);

        for i in 1..self.num_threads {
            let manager = ManagerPtr(self);
            let index = i as ThreadIndex;

            let spawned = thread::Builder::new()
                .name(format!("weft-worker-{}", i))
                .spawn(move || {
                    let manager = unsafe { &*manager.0 };
                    manager.worker_thread_entry(index);
                });

            match spawned {
                Ok(handle) => self.threads[i].set_join_handle(handle),
                Err(err) => {
                    self.shutdown(true);
                    unbind_tls();
                    return Err(err_format!("failed to spawn worker thread {}: {}", i, err));
                }
            }
        }

        // Rebind one pool fiber to the main entry and jump into it.
        unsafe {
            let tls = current_tls();
            let index = self.find_free_fiber();
            (*tls).current_fiber = index;

            let fiber = self.fiber(index);
            fiber.set_entry(fiber_entry_main);
            fiber.switch(&(*tls).thread_fiber, self);
        }

        // Back on the thread fiber: the scheduler is winding down.
        for i in 1..self.num_threads {
            self.threads[i].join();
        }

        unbind_tls();
        Ok(())
    }

    /// Signals every worker loop to exit once its current job is done.
    /// Pending queued jobs are dropped, not executed. With `blocking` the
    /// call joins threads 1..N; only the main callback may do that.
    pub fn shutdown(&self, blocking: bool) {
        self.shutting_down.store(true, Ordering::Release);

        if blocking {
            for i in 1..self.num_threads {
                self.threads[i].join();
            }
        }
    }

    #[inline]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Submits a job. If the job carries a counter, the counter gains a
    /// reference before the job becomes visible to any worker.
    pub fn schedule(&self, priority: Priority, job: JobInfo) {
        let counter = job.counter();
        if !counter.is_null() {
            unsafe { (*counter).increment(1) };
        }

        if !self.queue_by_priority(priority).enqueue(job) {
            critical!("the {:?} priority job queue is full", priority);
        }
    }

    /// Schedules a plain closure without completion tracking.
    pub fn schedule_fn<F>(&self, priority: Priority, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(priority, JobInfo::new(f));
    }

    /// Schedules a closure that releases one reference on `counter` when it
    /// has run.
    ///
    /// # Safety
    ///
    /// `counter` must outlive the job; waiting on it until it reaches zero
    /// before the counter goes away is the intended pattern (or use
    /// [`JobList`](super::JobList), which enforces it).
    pub unsafe fn schedule_with<F>(&self, priority: Priority, counter: &RawCounter, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(priority, JobInfo::with_counter(counter, f));
    }

    /// Parks the current fiber until `counter` reaches `target`. Returns
    /// immediately when it already has. This is the scheduler's only
    /// suspension point; the thread keeps running jobs on other fibers
    /// while this fiber is parked.
    pub fn wait_for_counter(&self, counter: &RawCounter, target: Count) {
        debug_assert!(
            ptr::eq(counter.manager(), self),
            "waiting on a counter that belongs to a different scheduler"
        );

        if counter.value() == target {
            return;
        }

        unsafe {
            let tls = current_tls();
            if tls.is_null() {
                critical!("wait_for_counter called from outside the scheduler");
            }

            let flag = self.flags.claim();
            if counter.add_waiter((*tls).current_fiber, target, flag) {
                self.flags.release(flag);
                return;
            }

            let previous = (*tls).current_fiber;
            (*tls).previous_fiber = previous;
            (*tls).previous_location = FiberLocation::Waiting;
            (*tls).previous_stored = flag;

            let next = self.find_free_fiber();
            (*tls).current_fiber = next;
            self.fiber(next).switch(self.fiber(previous), self);

            // Resumed, possibly on a different worker thread.
            self.cleanup_previous_fiber();
        }
    }

    /// Schedules `f` and parks until it has run. Because the wait completes
    /// before this returns, the closure may borrow from the caller's scope.
    pub fn wait_for_single<F>(&self, priority: Priority, f: F)
    where
        F: FnOnce() + Send,
    {
        let counter = TinyCounter::new(self);
        let job = unsafe { JobInfo::from_parts(&*counter, f) };
        self.schedule(priority, job);
        self.wait_for_counter(&counter, 0);
    }

    fn queue_by_priority(&self, priority: Priority) -> &MpmcQueue<JobInfo> {
        match priority {
            Priority::High => &self.high_queue,
            Priority::Normal => &self.normal_queue,
            Priority::Low => &self.low_queue,
        }
    }

    /// Worker dispatch order: the High ring, then at most one resumable
    /// ready fiber, then the Normal and Low rings. Resuming only one fiber
    /// per call keeps resumed waiters from starving latency-critical work.
    fn get_next_job(&self) -> Option<JobInfo> {
        if let Some(job) = self.high_queue.dequeue() {
            return Some(job);
        }

        unsafe {
            let tls = current_tls();

            let mut ready = None;
            for (i, entry) in (*tls).ready_fibers.iter().enumerate() {
                if self.flags.is_set(entry.1) {
                    ready = Some(i);
                    break;
                }
            }

            if let Some(i) = ready {
                let (fiber_index, flag) = (*tls).ready_fibers.remove(i);
                self.flags.release(flag);

                let previous = (*tls).current_fiber;
                (*tls).previous_fiber = previous;
                (*tls).previous_location = FiberLocation::Pool;
                (*tls).current_fiber = fiber_index;

                self.fiber(fiber_index).switch(self.fiber(previous), self);

                // Resumed, possibly on a different worker thread.
                self.cleanup_previous_fiber();
            }
        }

        self.normal_queue.dequeue().or_else(|| self.low_queue.dequeue())
    }

    /// Finalizes the fiber the current thread switched away from: returns
    /// it to the pool, or — for a parked fiber — raises its stored flag,
    /// which is the moment another worker may legally resume it.
    fn cleanup_previous_fiber(&self) {
        unsafe {
            let tls = current_tls();

            match (*tls).previous_location {
                FiberLocation::None => return,
                FiberLocation::Pool => {
                    self.idle_fibers[(*tls).previous_fiber as usize].store(true, Ordering::Release);
                }
                FiberLocation::Waiting => {
                    self.flags.set((*tls).previous_stored);
                }
            }

            (*tls).previous_fiber = INVALID_FIBER;
            (*tls).previous_location = FiberLocation::None;
            (*tls).previous_stored = INVALID_FLAG;
        }
    }

    /// Claims an idle fiber from the pool. Never gives up: the pool is
    /// sized so that a free fiber always exists under design load, and a
    /// dry scan is worth a warning.
    fn find_free_fiber(&self) -> FiberIndex {
        loop {
            for i in 0..self.num_fibers {
                if !self.idle_fibers[i].load(Ordering::Relaxed) {
                    continue;
                }

                if self.idle_fibers[i]
                    .compare_exchange_weak(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return i as FiberIndex;
                }
            }

            warn!("no free fiber in the pool; increase num_fibers");
            thread::yield_now();
        }
    }

    pub(crate) unsafe fn fiber(&self, index: FiberIndex) -> &Fiber {
        &(&*self.fibers.get())[index as usize]
    }

    fn worker_thread_entry(&self, index: ThreadIndex) {
        pin_to_core(index as usize);

        unsafe {
            bind_tls(self.threads[index as usize].tls());

            let tls = current_tls();
            let fiber_index = self.find_free_fiber();
            (*tls).current_fiber = fiber_index;
            self.fiber(fiber_index).switch(&(*tls).thread_fiber, self);
        }

        // The worker fiber switched back: this thread is done.
        unbind_tls();
    }
}

/// The loop every pool fiber runs: finalize whatever fiber this thread
/// switched away from, then execute jobs until shutdown, then hand the
/// thread back to its thread fiber.
extern "C" fn fiber_entry_worker(transfer: Transfer) -> ! {
    let manager = unsafe { &*Fiber::land(transfer) };
    manager.cleanup_previous_fiber();

    while !manager.is_shutting_down() {
        if let Some(job) = manager.get_next_job() {
            job.execute();
            continue;
        }

        thread::sleep(Duration::from_millis(1));
    }

    unsafe {
        let tls = current_tls();
        let me = (*tls).current_fiber;
        (*tls).thread_fiber.switch(manager.fiber(me), manager);
    }

    unreachable!()
}

/// Entry for the one fiber that carries the user's main callback.
extern "C" fn fiber_entry_main(transfer: Transfer) -> ! {
    let manager = unsafe { &*Fiber::land(transfer) };

    let main = unsafe { (*manager.main_callback.get()).take() };
    match main {
        Some(main) => main(manager),
        None => critical!("the main callback cannot be empty"),
    }

    if !manager.shutdown_after_main {
        // The main thread becomes an ordinary worker; this fiber is
        // abandoned rather than pooled, since nothing can resume it.
        unsafe {
            let tls = current_tls();
            let previous = (*tls).current_fiber;
            let next = manager.find_free_fiber();
            (*tls).current_fiber = next;
            manager.fiber(next).switch(manager.fiber(previous), manager);
        }
        unreachable!();
    }

    manager.shutdown(false);

    unsafe {
        let tls = current_tls();
        let me = (*tls).current_fiber;
        (*tls).thread_fiber.switch(manager.fiber(me), manager);
    }

    unreachable!()
}
