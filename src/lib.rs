//! Weft is a pair of job schedulers for soft real-time workloads:
//!
//! - [`sched`] — a fiber-based scheduler. Jobs go into bounded priority
//!   rings and run on a pool of fibers multiplexed over pinned worker
//!   threads; a job that waits parks its fiber instead of its thread.
//! - [`multitask`] — a lightweight work-stealing system for flat fan-out
//!   compute, with an SPMD layer (barriers, broadcast, range splitting)
//!   on top.
//!
//! The two schedulers share vocabulary but not machinery; pick the fiber
//! scheduler when jobs form dependency graphs, the lightweight one when
//! they are a grid of independent kernels.

#[macro_use]
pub mod errors;

pub mod multitask;
pub mod sched;
pub mod utils;

pub use self::errors::Result;

pub mod prelude {
    pub use crate::multitask::{dispatch, split_range, Job, JobCount, JobSystem, JobSystemOptions, SpmdGroup};
    pub use crate::sched::{
        Counter, JobInfo, JobList, Manager, ManagerOptions, Priority, TinyCounter,
    };
}
