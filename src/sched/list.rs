//! A convenience bundle of jobs sharing one completion counter.

use std::ops::AddAssign;

use super::counter::Counter;
use super::job::{JobInfo, Priority};
use super::manager::Manager;
use super::Count;

/// Collects jobs against an owned counter so a batch can be awaited as one
/// unit. Dropping the list waits for whatever is still in flight, which is
/// what makes `add` safe to expose without lifetime gymnastics.
pub struct JobList<'m> {
    manager: &'m Manager,
    default_priority: Priority,
    counter: Counter<'m>,
}

impl<'m> JobList<'m> {
    pub fn new(manager: &'m Manager, default_priority: Priority) -> Self {
        JobList {
            manager,
            default_priority,
            counter: Counter::new(manager),
        }
    }

    /// Schedules `job` at the list's default priority, tracked by the
    /// list's counter.
    pub fn add(&self, job: JobInfo) {
        self.add_with(self.default_priority, job);
    }

    /// Same as [`add`](JobList::add) with an explicit priority.
    pub fn add_with(&self, priority: Priority, mut job: JobInfo) {
        job.set_counter(&*self.counter);
        self.manager.schedule(priority, job);
    }

    /// Closure form of [`add`](JobList::add).
    pub fn add_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add(JobInfo::new(f));
    }

    /// Parks until the list's counter reaches `target` (usually 0: all
    /// tracked jobs done).
    pub fn wait(&self, target: Count) {
        self.manager.wait_for_counter(&self.counter, target);
    }

    pub fn value(&self) -> Count {
        self.counter.value()
    }
}

impl<'m> AddAssign<JobInfo> for JobList<'m> {
    fn add_assign(&mut self, job: JobInfo) {
        self.add(job);
    }
}

impl<'m> Drop for JobList<'m> {
    fn drop(&mut self) {
        // In-flight jobs still reference the embedded counter. During
        // shutdown the queues release pending jobs themselves, so only a
        // live scheduler needs the wait.
        if !self.manager.is_shutting_down() && self.counter.value() != 0 {
            self.manager.wait_for_counter(&self.counter, 0);
        }
    }
}
