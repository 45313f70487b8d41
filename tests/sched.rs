extern crate env_logger;
extern crate weft;

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use weft::sched::{Counter, JobList, Manager, ManagerOptions, Priority};

fn options(num_threads: usize, num_fibers: usize) -> ManagerOptions {
    let cores = ManagerOptions::default().num_threads;

    ManagerOptions {
        num_threads: num_threads.min(cores),
        num_fibers,
        ..ManagerOptions::default()
    }
}

#[test]
fn fan_out_then_join() {
    let _ = env_logger::try_init();

    const JOBS: usize = 128;

    let values: Arc<Vec<AtomicU32>> = Arc::new((0..JOBS).map(|_| AtomicU32::new(0)).collect());
    let manager = Manager::new(options(4, 16));

    let checked = values.clone();
    manager
        .run(move |mgr| {
            let list = JobList::new(mgr, Priority::Normal);
            for i in 0..JOBS {
                let values = checked.clone();
                list.add_fn(move || {
                    values[i].store(i as u32 * 2, Ordering::SeqCst);
                });
            }

            list.wait(0);
            assert_eq!(list.value(), 0);

            for i in 0..JOBS {
                assert_eq!(checked[i].load(Ordering::SeqCst), i as u32 * 2);
            }
        })
        .unwrap();
}

#[test]
fn dependency_chain() {
    let _ = env_logger::try_init();

    let manager = Manager::new(options(4, 16));
    manager
        .run(|mgr| {
            let a = AtomicU32::new(0);

            mgr.wait_for_single(Priority::Normal, || {
                a.fetch_add(1, Ordering::SeqCst);

                mgr.wait_for_single(Priority::Normal, || {
                    a.fetch_sub(1, Ordering::SeqCst);
                });
            });

            assert_eq!(a.load(Ordering::SeqCst), 0);
        })
        .unwrap();
}

#[test]
fn high_priority_overtakes_a_full_low_queue() {
    let _ = env_logger::try_init();

    const LOW_JOBS: usize = 1000;

    let manager = Manager::new(options(4, 16));
    manager
        .run(|mgr| {
            let low_done = Arc::new(AtomicUsize::new(0));
            let list = JobList::new(mgr, Priority::Low);

            for _ in 0..LOW_JOBS {
                let low_done = low_done.clone();
                list.add_fn(move || {
                    // Enough work that the backlog outlives the high job.
                    let mut acc = 0u64;
                    for i in 0..50_000u64 {
                        acc = acc.wrapping_mul(31).wrapping_add(i);
                    }
                    assert_ne!(acc, 1);
                    low_done.fetch_add(1, Ordering::SeqCst);
                });
            }

            let mut consumed_at_flag = 0;
            mgr.wait_for_single(Priority::High, {
                let low_done = low_done.clone();
                let consumed = &mut consumed_at_flag;
                move || {
                    *consumed = low_done.load(Ordering::SeqCst);
                }
            });

            assert!(
                consumed_at_flag < LOW_JOBS / 2,
                "high-priority job observed {} of {} low jobs already done",
                consumed_at_flag,
                LOW_JOBS
            );

            list.wait(0);
            assert_eq!(low_done.load(Ordering::SeqCst), LOW_JOBS);
        })
        .unwrap();
}

#[test]
fn deep_wait_nesting_with_two_threads() {
    let _ = env_logger::try_init();

    if ManagerOptions::default().num_threads < 2 {
        return;
    }

    let manager = Manager::new(options(2, 8));
    manager
        .run(|mgr| {
            let depth = AtomicU32::new(0);

            mgr.wait_for_single(Priority::Normal, || {
                depth.fetch_add(1, Ordering::SeqCst);
                mgr.wait_for_single(Priority::Normal, || {
                    depth.fetch_add(1, Ordering::SeqCst);
                    mgr.wait_for_single(Priority::Normal, || {
                        depth.fetch_add(1, Ordering::SeqCst);
                        mgr.wait_for_single(Priority::Normal, || {
                            depth.fetch_add(1, Ordering::SeqCst);
                        });
                    });
                });
            });

            assert_eq!(depth.load(Ordering::SeqCst), 4);
        })
        .unwrap();
}

#[test]
fn satisfied_wait_returns_without_parking() {
    let _ = env_logger::try_init();

    let manager = Manager::new(options(2, 8));
    manager
        .run(|mgr| {
            let counter = Counter::new(mgr);
            assert_eq!(counter.value(), 0);

            let before = Instant::now();
            mgr.wait_for_counter(&counter, 0);
            assert!(before.elapsed() < Duration::from_millis(100));
        })
        .unwrap();
}

#[test]
fn schedule_with_counter_tracks_completion() {
    let _ = env_logger::try_init();

    let manager = Manager::new(options(4, 16));
    manager
        .run(|mgr| {
            let counter = Counter::new(mgr);
            let ran = Arc::new(AtomicUsize::new(0));

            for _ in 0..5 {
                let ran = ran.clone();
                unsafe {
                    mgr.schedule_with(Priority::Normal, &counter, move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }

            mgr.wait_for_counter(&counter, 0);
            assert_eq!(ran.load(Ordering::SeqCst), 5);
            assert_eq!(counter.value(), 0);
        })
        .unwrap();
}

#[test]
fn shutdown_with_jobs_in_flight() {
    let _ = env_logger::try_init();

    const JOBS: usize = 1000;

    let done = Arc::new(AtomicUsize::new(0));
    let opts = options(4, 16);
    let workers = opts.num_threads - 1;
    let manager = Manager::new(opts);

    let observed = done.clone();
    manager
        .run(move |mgr| {
            for _ in 0..JOBS {
                let done = observed.clone();
                mgr.schedule_fn(Priority::Normal, move || {
                    std::thread::sleep(Duration::from_millis(1));
                    done.fetch_add(1, Ordering::SeqCst);
                });
            }

            std::thread::sleep(Duration::from_millis(100));
            mgr.shutdown(true);
        })
        .unwrap();

    // Everything that was executing finished; the rest was dropped, never
    // half-run.
    let completed = done.load(Ordering::SeqCst);
    if workers > 0 {
        assert!(completed > 0);
    }
    assert!(completed <= JOBS);
}

#[test]
fn main_thread_becomes_a_worker_when_configured() {
    let _ = env_logger::try_init();

    let cores = ManagerOptions::default().num_threads;
    let opts = ManagerOptions {
        num_threads: 2.min(cores),
        num_fibers: 8,
        shutdown_after_main: false,
        ..ManagerOptions::default()
    };

    let ran = Arc::new(AtomicUsize::new(0));
    let manager = Manager::new(opts);

    let observed = ran.clone();
    manager
        .run(move |mgr| {
            // Main returns immediately; the scheduler keeps running until
            // this job asks it to stop.
            let ran = observed.clone();
            mgr.schedule_fn(Priority::Normal, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });

            let manager: &Manager = mgr;
            let manager = ManagerHandle(manager as *const Manager);
            mgr.schedule_fn(Priority::Low, move || {
                std::thread::sleep(Duration::from_millis(10));
                unsafe { (*manager.0).shutdown(false) };
            });
        })
        .unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

struct ManagerHandle(*const Manager);
unsafe impl Send for ManagerHandle {}
