extern crate env_logger;
extern crate rand;
extern crate weft;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;

use weft::multitask::{dispatch, Job, JobCount, JobSystem, JobSystemOptions, SpmdGroup};

fn system(workers: usize) -> JobSystem {
    JobSystem::new(JobSystemOptions {
        workers,
        ..JobSystemOptions::default()
    })
    .unwrap()
}

#[test]
fn fan_out_and_wait() {
    let _ = env_logger::try_init();

    const JOBS: usize = 256;

    let cells: &'static [AtomicU64] =
        Box::leak((0..JOBS).map(|_| AtomicU64::new(0)).collect::<Vec<_>>().into_boxed_slice());

    #[derive(Clone, Copy)]
    struct Params {
        index: usize,
        cells: &'static [AtomicU64],
    }

    fn kernel(p: &mut Params) {
        p.cells[p.index].store(p.index as u64 * 2, Ordering::SeqCst);
    }

    let system = system(3);
    let root = JobCount::new();

    for index in 0..JOBS {
        let job = unsafe { Job::with_parent(&root, kernel, Params { index, cells }) };
        system.submit(job);
    }

    system.wait(&root);
    assert!(root.is_done());

    for index in 0..JOBS {
        assert_eq!(cells[index].load(Ordering::SeqCst), index as u64 * 2);
    }

    #[cfg(debug_assertions)]
    {
        let totals = system.debug_totals();
        assert_eq!(totals.pops + totals.steals, JOBS as u64);
    }
}

#[test]
fn nested_submission_from_jobs() {
    let _ = env_logger::try_init();

    static SUM: AtomicU64 = AtomicU64::new(0);

    #[derive(Clone, Copy)]
    struct Outer {
        system: *const JobSystem,
        root: *const JobCount,
    }
    unsafe impl Send for Outer {}

    fn inner(value: &mut u64) {
        SUM.fetch_add(*value, Ordering::SeqCst);
    }

    fn outer(p: &mut Outer) {
        let system = unsafe { &*p.system };
        let root = unsafe { &*p.root };

        for value in 0..10u64 {
            let job = unsafe { Job::with_parent(root, inner, value) };
            system.submit(job);
        }
    }

    SUM.store(0, Ordering::SeqCst);

    let system = system(3);
    let root = JobCount::new();

    for _ in 0..8 {
        let outer_job = unsafe {
            Job::with_parent(
                &root,
                outer,
                Outer {
                    system: &system,
                    root: &root,
                },
            )
        };
        system.submit(outer_job);
    }

    system.wait(&root);
    assert_eq!(SUM.load(Ordering::SeqCst), 8 * 45);
}

#[test]
fn spmd_broadcast_reaches_every_lane() {
    let _ = env_logger::try_init();

    const LANES: usize = 8;

    let seen: &'static [AtomicU32] =
        Box::leak((0..LANES).map(|_| AtomicU32::new(0)).collect::<Vec<_>>().into_boxed_slice());

    #[derive(Clone, Copy)]
    struct Params {
        seen: &'static [AtomicU32],
    }

    fn kernel(group: &SpmdGroup, p: &mut Params) {
        let lane = group.lane();

        let src = 0xDEAD_BEEFu32.to_le_bytes();
        let mut dst = [0u8; 4];
        group.broadcast(&mut dst, &src, 0);

        p.seen[lane].store(u32::from_le_bytes(dst), Ordering::SeqCst);
    }

    let system = system(LANES - 1);
    dispatch(&system, LANES, 64, kernel, Params { seen });

    for lane in 0..LANES {
        assert_eq!(seen[lane].load(Ordering::SeqCst), 0xDEAD_BEEF);
    }
}

#[test]
fn spmd_split_range_grid_sum() {
    let _ = env_logger::try_init();

    const LANES: usize = 4;
    const TOTAL: usize = 10_000;

    let mut rng = rand::thread_rng();
    let data: &'static [u64] =
        Box::leak((0..TOTAL).map(|_| rng.gen_range(0u64, 100)).collect::<Vec<_>>().into_boxed_slice());
    let expected: u64 = data.iter().sum();

    static SUM: AtomicU64 = AtomicU64::new(0);
    SUM.store(0, Ordering::SeqCst);

    #[derive(Clone, Copy)]
    struct Params {
        data: &'static [u64],
    }

    fn kernel(group: &SpmdGroup, p: &mut Params) {
        let range = group.lane_range(p.data.len() as u64);
        let local: u64 = p.data[range.start as usize..range.end as usize].iter().sum();
        SUM.fetch_add(local, Ordering::SeqCst);

        // Everyone contributes before anyone reads.
        group.sync();
        assert_eq!(SUM.load(Ordering::SeqCst), p.data.iter().sum::<u64>());
    }

    let system = system(LANES - 1);
    dispatch(&system, LANES, 64, kernel, Params { data });

    assert_eq!(SUM.load(Ordering::SeqCst), expected);
}

#[test]
fn system_drops_cleanly_when_idle() {
    let _ = env_logger::try_init();

    let system = system(2);
    assert_eq!(system.worker_count(), 3);
    drop(system);
}
