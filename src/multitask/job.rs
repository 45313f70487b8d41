//! The lightweight job descriptor: one cache line, copied by value through
//! the work-stealing deques, no heap traffic anywhere.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

pub const CACHE_LINE_SIZE: usize = 64;

/// Bytes left for the kernel pointer plus its parameters once the
/// descriptor header is accounted for.
pub const JOB_PARAMETER_SPACE: usize = CACHE_LINE_SIZE - 2 * mem::size_of::<usize>();

/// Root counter for a batch of jobs. Submitting a child against it takes a
/// reference; finishing the child releases it. `JobSystem::wait` spins the
/// caller on useful work until the count drains to zero.
pub struct JobCount(CachePadded<AtomicU32>);

impl JobCount {
    pub fn new() -> Self {
        JobCount(CachePadded::new(AtomicU32::new(0)))
    }

    pub fn remaining(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.remaining() == 0
    }

    pub(crate) fn add_one(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }

    pub(crate) fn complete_one(&self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for JobCount {
    fn default() -> Self {
        Self::new()
    }
}

/// A kernel plus its parameters, stored inline so the whole descriptor is
/// exactly one cache line.
#[derive(Clone, Copy)]
struct Packed<P: Copy> {
    kernel: fn(&mut P),
    params: P,
}

struct Fits<P>(PhantomData<P>);

impl<P: Copy> Fits<P> {
    const CHECK: () = assert!(
        mem::size_of::<Packed<P>>() <= JOB_PARAMETER_SPACE
            && mem::align_of::<Packed<P>>() <= 2 * mem::size_of::<usize>(),
        "job parameters do not fit the inline cache-line payload"
    );
}

#[repr(C, align(64))]
#[derive(Clone, Copy)]
pub struct Job {
    function: Option<unsafe fn(*mut u8)>,
    parent: *const JobCount,
    parameters: [u8; JOB_PARAMETER_SPACE],
}

const _: () = assert!(
    mem::size_of::<Job>() == CACHE_LINE_SIZE,
    "Job must exactly fill one cache line"
);

// The parent pointer is kept alive by the wait protocol: whoever owns the
// root counter waits on it before letting it go.
unsafe impl Send for Job {}

impl Job {
    /// A free-standing job: run `kernel` over a by-value copy of `params`.
    pub fn new<P>(kernel: fn(&mut P), params: P) -> Job
    where
        P: Copy + Send,
    {
        unsafe { Self::from_parts(ptr::null(), kernel, params) }
    }

    /// A job tracked by `parent`.
    ///
    /// # Safety
    ///
    /// `parent` must outlive the job; calling `JobSystem::wait` on it
    /// before it goes out of scope guarantees that.
    pub unsafe fn with_parent<P>(parent: &JobCount, kernel: fn(&mut P), params: P) -> Job
    where
        P: Copy + Send,
    {
        Self::from_parts(parent, kernel, params)
    }

    unsafe fn from_parts<P>(parent: *const JobCount, kernel: fn(&mut P), params: P) -> Job
    where
        P: Copy + Send,
    {
        let () = Fits::<P>::CHECK;

        let mut job = Job {
            function: Some(trampoline::<P>),
            parent,
            parameters: [0; JOB_PARAMETER_SPACE],
        };

        ptr::write(
            job.parameters.as_mut_ptr() as *mut Packed<P>,
            Packed { kernel, params },
        );

        job
    }

    pub(crate) fn parent(&self) -> *const JobCount {
        self.parent
    }

    pub(crate) fn execute(mut self) {
        if let Some(function) = self.function {
            unsafe { function(self.parameters.as_mut_ptr()) };
        }

        if !self.parent.is_null() {
            unsafe { (*self.parent).complete_one() };
        }
    }
}

unsafe fn trampoline<P: Copy>(raw: *mut u8) {
    let packed = &mut *(raw as *mut Packed<P>);
    (packed.kernel)(&mut packed.params);
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);

    fn bump(by: &mut u32) {
        HITS.fetch_add(*by, Ordering::SeqCst);
    }

    #[test]
    fn executes_kernel_over_inline_params() {
        HITS.store(0, Ordering::SeqCst);

        let job = Job::new(bump, 3u32);
        job.execute();

        assert_eq!(HITS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn parent_count_follows_completion() {
        let root = JobCount::new();
        assert!(root.is_done());

        fn nop(_: &mut ()) {}

        let job = unsafe { Job::with_parent(&root, nop, ()) };
        root.add_one();
        assert_eq!(root.remaining(), 1);

        job.execute();
        assert!(root.is_done());
    }
}
