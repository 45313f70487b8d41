//! #### The fiber scheduler
//!
//! A user-space scheduler that multiplexes jobs over a pool of fibers
//! executed by pinned worker threads. Jobs are submitted into one of three
//! bounded priority rings; a worker always drains `High` before `Normal`
//! before `Low`. A job that has to wait for other jobs does so by parking
//! its fiber on a [`Counter`] — the worker thread picks up a fresh fiber
//! and keeps executing, so a blocking wait never blocks an OS thread.
//!
//! ```no_run
//! use weft::sched::{Manager, ManagerOptions, Priority};
//!
//! let manager = Manager::new(ManagerOptions::default());
//! manager.run(|mgr| {
//!     mgr.wait_for_single(Priority::Normal, || {
//!         println!("ran on a worker fiber");
//!     });
//! }).unwrap();
//! ```

pub mod counter;
pub mod job;
pub mod list;
pub mod manager;
pub mod queue;

mod fiber;
mod thread;

pub use self::counter::{Counter, RawCounter, TinyCounter};
pub use self::job::{JobInfo, Priority};
pub use self::list::JobList;
pub use self::manager::{Manager, ManagerOptions};

/// Stable index of a fiber in the scheduler's pool.
pub type FiberIndex = u16;

/// Stable index of a worker thread; thread 0 is the thread that called
/// [`Manager::run`].
pub type ThreadIndex = u32;

/// Counter value type.
pub type Count = u32;

pub(crate) type FlagIndex = u16;

pub(crate) const INVALID_FIBER: FiberIndex = ::std::u16::MAX;
pub(crate) const INVALID_FLAG: FlagIndex = ::std::u16::MAX;
