//! #### The lightweight job system
//!
//! A thread-local work-stealing scheduler for flat fan-out compute. Every
//! participating thread owns a fixed Chase–Lev deque; submission pushes to
//! the caller's own deque and idle workers steal from random victims.
//! Waiting never parks a thread — the waiter drains queues until the root
//! count hits zero — which keeps the whole system allocation-free and one
//! cache line per job.
//!
//! [`SpmdGroup`] layers barrier synchronization and a broadcast buffer on
//! top, turning a batch of jobs into cooperating lanes of a single kernel.

pub mod deque;
pub mod job;
pub mod spmd;
pub mod system;

pub use self::deque::WorkStealDeque;
pub use self::job::{Job, JobCount, CACHE_LINE_SIZE, JOB_PARAMETER_SPACE};
pub use self::spmd::{dispatch, split_range, SpmdGroup};
pub use self::system::{JobSystem, JobSystemOptions};
