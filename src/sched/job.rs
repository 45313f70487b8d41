use std::marker::PhantomData;
use std::mem;
use std::ptr;

use super::counter::RawCounter;

/// Scheduling tiers. Workers always drain `High` before `Normal` before
/// `Low`; within one tier jobs come back out in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Normal,
    Low,
}

const PAYLOAD_WORDS: usize = 8;

/// Inline storage for the type-erased callable. Jobs are plain values with
/// no per-job heap allocation; once enqueued, the ring owns these bytes
/// until a worker takes them back out.
#[repr(align(16))]
#[derive(Clone, Copy)]
struct Payload([usize; PAYLOAD_WORDS]);

struct Fits<F>(PhantomData<F>);

impl<F> Fits<F> {
    const CHECK: () = assert!(
        mem::size_of::<F>() <= mem::size_of::<Payload>()
            && mem::align_of::<F>() <= mem::align_of::<Payload>(),
        "job callable does not fit the inline payload"
    );
}

/// A by-value job descriptor: a callable stored in place, plus an optional
/// reference to the counter that tracks its completion.
pub struct JobInfo {
    invoke: Option<unsafe fn(*mut Payload)>,
    finalize: Option<unsafe fn(*mut Payload)>,
    counter: *const RawCounter,
    payload: Payload,
}

// The raw counter pointer is the only non-Send field; its validity is
// guaranteed by the wait protocol (see `RawCounter`).
unsafe impl Send for JobInfo {}

impl JobInfo {
    /// Wraps `f` into a descriptor with no attached counter.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        unsafe { Self::from_parts(ptr::null(), f) }
    }

    /// Wraps `f` into a descriptor that releases one reference on `counter`
    /// when it has executed.
    ///
    /// # Safety
    ///
    /// `counter` must stay alive until this job has executed or been
    /// dropped. Waiting on the counter until it reaches zero guarantees
    /// exactly that, which is what `JobList` and `wait_for_single` do.
    pub unsafe fn with_counter<F>(counter: &RawCounter, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::from_parts(counter, f)
    }

    /// The non-`'static` constructor used by the blocking entry points,
    /// which guarantee completion before the captured scope unwinds.
    pub(crate) unsafe fn from_parts<F>(counter: *const RawCounter, f: F) -> Self
    where
        F: FnOnce() + Send,
    {
        let () = Fits::<F>::CHECK;

        let mut payload = Payload([0; PAYLOAD_WORDS]);
        ptr::write(payload.0.as_mut_ptr() as *mut F, f);

        JobInfo {
            invoke: Some(invoke_raw::<F>),
            finalize: Some(finalize_raw::<F>),
            counter,
            payload,
        }
    }

    pub(crate) fn set_counter(&mut self, counter: *const RawCounter) {
        self.counter = counter;
    }

    pub(crate) fn counter(&self) -> *const RawCounter {
        self.counter
    }

    /// Runs the stored callable, then releases the reference on the
    /// attached counter, which is what wakes waiters.
    ///
    /// A job that is dropped without executing does *not* touch its
    /// counter: at shutdown, pending jobs can outlive the counters they
    /// reference, and stale counts on an abandoned graph are harmless.
    pub fn execute(mut self) {
        let invoke = match self.invoke.take() {
            Some(invoke) => invoke,
            None => critical!("executing a job without a callable installed"),
        };

        // The callable is consumed in place; Drop must not run it again.
        self.finalize = None;
        unsafe { invoke(&mut self.payload) };

        let counter = mem::replace(&mut self.counter, ptr::null());
        if !counter.is_null() {
            unsafe { (*counter).decrement(1) };
        }
    }
}

impl Drop for JobInfo {
    fn drop(&mut self) {
        if let Some(finalize) = self.finalize.take() {
            unsafe { finalize(&mut self.payload) };
        }
    }
}

unsafe fn invoke_raw<F: FnOnce()>(payload: *mut Payload) {
    ptr::read(payload as *mut F)()
}

unsafe fn finalize_raw<F>(payload: *mut Payload) {
    ptr::drop_in_place(payload as *mut F)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn execute_consumes_callable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let job = JobInfo::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        job.execute();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_pending_job_releases_capture() {
        let payload = Arc::new(());
        let weak = Arc::downgrade(&payload);

        let job = JobInfo::new(move || {
            let _keep = payload;
        });

        drop(job);
        assert!(weak.upgrade().is_none());
    }
}
