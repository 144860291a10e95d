/*
 * LWP Runtime Scenarios
 *
 * Each test boots its own kernel. Thread bodies run on LWPs, so they must
 * not assert: they record what they saw in a per-test static and the test
 * thread checks it after the process exits.
 */

use std::{
    sync::{
        Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    thread,
    vec::Vec,
};

use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;

use super::host::{self, HostSpace, boot, entry, kernel, run_until_exited, spawn, user_frame};
use crate::{
    config::{NLWPS, NPROC, SchedParams},
    error::SchedError,
    scheduler::{Channel, CpuId, Dispatch, LwpState, Pid, StackRegion, Tid, frame::RETURN_SENTINEL},
};

extern "C" fn square(arg: usize) {
    kernel().thread_exit(arg * arg)
}

// ============================================================================
// Create and join
// ============================================================================

static SQUARES: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

extern "C" fn spawn_squares(n: usize) {
    let k = kernel();
    let tids: Vec<Tid> = (0..n)
        .map(|i| k.thread_create(entry(square), i).unwrap())
        .collect();
    for tid in tids.into_iter().rev() {
        let value = k.thread_join(tid).unwrap();
        SQUARES.lock().unwrap().push(value);
    }
    k.thread_exit(0)
}

#[test]
fn test_join_collects_return_values() {
    let k = boot();
    let pid = spawn(k, "squares", spawn_squares, 8);
    run_until_exited(k, pid);

    let mut got = SQUARES.lock().unwrap().clone();
    got.sort();
    assert_eq!(got, [0, 1, 4, 9, 16, 25, 36, 49]);

    // only the zombie main thread is left
    assert_eq!(k.lwps_in_use(), 1);
    assert_eq!(k.thread_count(pid), 1);
    assert_eq!(k.with_space(pid, |s| s.mapped_pages()), Some(0));
    k.dump_threads();

    k.reap_process(pid).unwrap();
    assert_eq!(k.lwps_in_use(), 0);
    assert_eq!(k.platform().pages_in_use(), 0);
}

static REUSE: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());

extern "C" fn fill_slots(_: usize) {
    let k = kernel();
    for round in 0..2 {
        let tids: Vec<Tid> = (0..NLWPS - 1)
            .map(|i| k.thread_create(entry(square), i).unwrap())
            .collect();
        // every slot is taken now
        REUSE
            .lock()
            .unwrap()
            .push(k.thread_create(entry(square), 0).map(|t| t.0 as usize));

        let sum: usize = tids.into_iter().map(|t| k.thread_join(t).unwrap()).sum();
        REUSE.lock().unwrap().push(Ok(sum + round));
    }
    k.thread_exit(0)
}

#[test]
fn test_slots_reused_after_join() {
    let k = boot();
    let pid = spawn(k, "fill", fill_slots, 0);
    run_until_exited(k, pid);

    let expected: usize = (0..NLWPS - 1).map(|i| i * i).sum();
    assert_eq!(
        *REUSE.lock().unwrap(),
        [
            Err(SchedError::AllocationExhausted),
            Ok(expected),
            Err(SchedError::AllocationExhausted),
            Ok(expected + 1),
        ]
    );
    k.reap_process(pid).unwrap();
    assert_eq!(k.lwps_in_use(), 0);
}

// ============================================================================
// Initial thread state
// ============================================================================

struct Layout {
    guard_flags: Option<PageTableFlags>,
    usable_flags: Option<PageTableFlags>,
    sentinel: Option<u64>,
    arg_word: Option<u64>,
    state: Option<LwpState>,
}

static LAYOUT: StdMutex<Option<Layout>> = StdMutex::new(None);

extern "C" fn inspect_new_thread(_: usize) {
    let k = kernel();
    let pid = Pid(1);
    let tid = k.thread_create(entry(square), 0x5eed).unwrap();

    // slot 1 is the first free slot after the main thread
    let region = StackRegion::for_slot(1);
    let layout = k
        .with_space(pid, |s| Layout {
            guard_flags: s.flags(region.guard),
            usable_flags: s.flags(region.usable()),
            sentinel: s.read_u64(region.top - 24u64),
            arg_word: s.read_u64(region.top - 16u64),
            state: None,
        })
        .map(|l| Layout {
            state: k.thread_state(pid, tid),
            ..l
        });
    *LAYOUT.lock().unwrap() = layout;

    k.thread_join(tid).unwrap();
    k.thread_exit(0)
}

#[test]
fn test_new_thread_stack_layout() {
    let k = boot();
    let pid = spawn(k, "layout", inspect_new_thread, 0);
    assert_eq!(pid, Pid(1));
    run_until_exited(k, pid);

    let layout = LAYOUT.lock().unwrap().take().unwrap();
    let guard = layout.guard_flags.unwrap();
    let usable = layout.usable_flags.unwrap();
    assert!(guard.contains(PageTableFlags::PRESENT));
    assert!(!guard.contains(PageTableFlags::USER_ACCESSIBLE));
    assert!(usable.contains(PageTableFlags::USER_ACCESSIBLE | PageTableFlags::WRITABLE));
    assert_eq!(layout.sentinel, Some(RETURN_SENTINEL));
    assert_eq!(layout.arg_word, Some(0x5eed));
    assert_eq!(layout.state, Some(LwpState::Runnable));
}

// ============================================================================
// Exit paths
// ============================================================================

extern "C" fn yield_then_exit(arg: usize) {
    let k = kernel();
    for _ in 0..arg {
        k.yield_now().unwrap();
    }
    k.thread_exit(arg + 100)
}

static JOIN_ORDER: StdMutex<Vec<usize>> = StdMutex::new(Vec::new());

extern "C" fn join_last_first(_: usize) {
    let k = kernel();
    let a = k.thread_create(entry(yield_then_exit), 1).unwrap();
    let b = k.thread_create(entry(yield_then_exit), 2).unwrap();
    let c = k.thread_create(entry(yield_then_exit), 5).unwrap();

    // a and b exit while the join on c sleeps; each exit wakes us
    for tid in [c, a, b] {
        let value = k.thread_join(tid).unwrap();
        JOIN_ORDER.lock().unwrap().push(value);
    }
    k.thread_exit(0)
}

#[test]
fn test_sibling_exits_while_joining() {
    let k = boot();
    let pid = spawn(k, "exits", join_last_first, 0);
    run_until_exited(k, pid);

    assert_eq!(*JOIN_ORDER.lock().unwrap(), [105, 101, 102]);
    assert_eq!(k.lwps_in_use(), 1);
}

static GRANDCHILD: AtomicU32 = AtomicU32::new(0);
static ORPHAN: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());

extern "C" fn orphan_body(_: usize) {
    let k = kernel();
    k.yield_now().unwrap();
    k.yield_now().unwrap();
    k.thread_exit(77)
}

extern "C" fn short_lived_parent(_: usize) {
    let k = kernel();
    let tid = k.thread_create(entry(orphan_body), 0).unwrap();
    GRANDCHILD.store(tid.0, Ordering::SeqCst);
    k.thread_exit(1)
}

extern "C" fn join_grandchild(_: usize) {
    let k = kernel();
    let parent = k.thread_create(entry(short_lived_parent), 0).unwrap();
    ORPHAN.lock().unwrap().push(k.thread_join(parent));

    // the parent is gone; its child now belongs to the reaper
    let orphan = Tid(GRANDCHILD.load(Ordering::SeqCst));
    let reparented = k.thread_parent(Pid(1), orphan) == Some(Tid::REAPER);
    ORPHAN.lock().unwrap().push(Ok(reparented as usize));
    ORPHAN.lock().unwrap().push(k.thread_join(orphan));
    ORPHAN.lock().unwrap().push(k.thread_join(orphan));
    k.thread_exit(0)
}

#[test]
fn test_orphan_joined_by_other_thread() {
    let k = boot();
    let pid = spawn(k, "orphans", join_grandchild, 0);
    run_until_exited(k, pid);

    assert_eq!(
        *ORPHAN.lock().unwrap(),
        [Ok(1), Ok(1), Ok(77), Err(SchedError::UnknownHandle)]
    );
}

static RIVAL_JOINS: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());
static JOINER_EXITS: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());

extern "C" fn join_target(target: usize) {
    let k = kernel();
    let result = k.thread_join(Tid(target as u32));
    RIVAL_JOINS.lock().unwrap().push(result);
    k.thread_exit(0)
}

extern "C" fn two_joiners(_: usize) {
    let k = kernel();
    let target = k.thread_create(entry(yield_then_exit), 5).unwrap();
    let first = k.thread_create(entry(join_target), target.0 as usize).unwrap();
    let second = k.thread_create(entry(join_target), target.0 as usize).unwrap();

    for tid in [first, second] {
        let value = k.thread_join(tid);
        JOINER_EXITS.lock().unwrap().push(value);
    }
    k.thread_exit(0)
}

#[test]
fn test_exit_wakes_every_joiner() {
    let k = boot();
    let pid = spawn(k, "rivals", two_joiners, 0);
    run_until_exited(k, pid);

    // one joiner collects the value, the other finds the handle gone
    let rivals = RIVAL_JOINS.lock().unwrap().clone();
    assert_eq!(rivals.len(), 2);
    assert!(rivals.contains(&Ok(105)));
    assert!(rivals.contains(&Err(SchedError::UnknownHandle)));
    assert_eq!(*JOINER_EXITS.lock().unwrap(), [Ok(0), Ok(0)]);
    assert_eq!(k.lwps_in_use(), 1);
}

static BAD_JOINS: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());

extern "C" fn join_nonsense(_: usize) {
    let k = kernel();
    BAD_JOINS.lock().unwrap().push(k.thread_join(Tid(42)));
    BAD_JOINS.lock().unwrap().push(k.thread_join(Tid::MAIN));
    k.thread_exit(0)
}

#[test]
fn test_join_unknown_or_self() {
    let k = boot();
    let pid = spawn(k, "bad-join", join_nonsense, 0);
    run_until_exited(k, pid);

    assert_eq!(
        *BAD_JOINS.lock().unwrap(),
        [Err(SchedError::UnknownHandle), Err(SchedError::UnknownHandle)]
    );
}

#[test]
fn test_process_exits_with_last_thread() {
    let k = boot();
    let pid = spawn(k, "solo", square, 3);
    assert!(!k.process_exited(pid));
    assert_eq!(k.reap_process(pid), Err(SchedError::StillRunning));

    run_until_exited(k, pid);
    assert_eq!(k.thread_state(pid, Tid::MAIN), Some(LwpState::Zombie));
    k.reap_process(pid).unwrap();
    assert_eq!(k.thread_count(pid), 0);
    assert_eq!(k.reap_process(pid), Err(SchedError::UnknownHandle));
    assert_eq!(k.schedule_once(), Dispatch::Idle);
}

// ============================================================================
// Kill
// ============================================================================

static NEVER: Mutex<()> = Mutex::new(());
static KILLED_JOIN: StdMutex<Option<Result<usize, SchedError>>> = StdMutex::new(None);

extern "C" fn sleep_forever(_: usize) {
    let k = kernel();
    while !k.killed() {
        let guard = NEVER.lock();
        drop(k.sleep(Channel::of(&NEVER), &NEVER, guard));
    }
    k.thread_exit(0)
}

extern "C" fn join_sleeper(_: usize) {
    let k = kernel();
    let tid = k.thread_create(entry(sleep_forever), 0).unwrap();
    *KILLED_JOIN.lock().unwrap() = Some(k.thread_join(tid));
    k.thread_exit(0)
}

#[test]
fn test_kill_interrupts_join() {
    let k = boot();
    let pid = spawn(k, "victim", join_sleeper, 0);
    host::run_until_idle(k);
    assert!(KILLED_JOIN.lock().unwrap().is_none());

    k.kill(pid).unwrap();
    run_until_exited(k, pid);
    assert_eq!(*KILLED_JOIN.lock().unwrap(), Some(Err(SchedError::Killed)));
    assert_eq!(k.kill(Pid(99)), Err(SchedError::UnknownHandle));
}

// ============================================================================
// Allocation failures
// ============================================================================

static ALLOC: StdMutex<Vec<Result<u32, SchedError>>> = StdMutex::new(Vec::new());
static IN_USE: AtomicUsize = AtomicUsize::new(0);

extern "C" fn exhaust(_: usize) {
    let k = kernel();
    let record = |r: Result<u32, SchedError>| ALLOC.lock().unwrap().push(r);

    // the space only has room for one two-page stack region
    let first = k.thread_create(entry(square), 2);
    record(first.map(|t| t.0));
    IN_USE.store(k.lwps_in_use(), Ordering::SeqCst);
    record(k.thread_create(entry(square), 3).map(|t| t.0));

    // no kernel stack pages left
    k.platform().set_page_limit(k.platform().pages_in_use());
    record(k.thread_create(entry(square), 4).map(|t| t.0));
    k.platform().set_page_limit(usize::MAX);

    if let Ok(tid) = first {
        record(k.thread_join(tid).map(|v| v as u32));
    }
    record(
        k.thread_create(entry(square), 5)
            .and_then(|t| k.thread_join(t))
            .map(|v| v as u32),
    );
    k.thread_exit(0)
}

#[test]
fn test_create_failure_rolls_back() {
    let k = boot();
    let pid = k
        .spawn_process("tight", HostSpace::with_budget(2), user_frame(exhaust, 0))
        .unwrap();
    run_until_exited(k, pid);

    assert_eq!(
        *ALLOC.lock().unwrap(),
        [
            Ok(1),
            Err(SchedError::AllocationExhausted),
            Err(SchedError::AllocationExhausted),
            Ok(4),
            Ok(25),
        ]
    );
    assert_eq!(IN_USE.load(Ordering::SeqCst), 2);
    assert_eq!(k.lwps_in_use(), 1);
    assert_eq!(k.platform().pages_in_use(), 1);
}

#[test]
fn test_spawn_without_pages() {
    let k = boot();
    k.platform().set_page_limit(0);
    let result = k.spawn_process("none", HostSpace::default(), user_frame(square, 0));
    assert_eq!(result, Err(SchedError::AllocationExhausted));
    assert_eq!(k.lwps_in_use(), 0);
}

#[test]
fn test_spawn_with_full_process_table() {
    let k = boot();
    for _ in 0..NPROC {
        spawn(k, "filler", square, 0);
    }
    let result = k.spawn_process("extra", HostSpace::default(), user_frame(square, 0));
    assert_eq!(result, Err(SchedError::AllocationExhausted));
    assert_eq!(k.lwps_in_use(), NPROC);
    assert_eq!(k.platform().pages_in_use(), NPROC);
}

// ============================================================================
// Scheduling through the runtime
// ============================================================================

extern "C" fn spin_ticks(_: usize) {
    let k = kernel();
    loop {
        k.tick().unwrap();
    }
}

#[test]
fn test_stride_ratio_end_to_end() {
    let k = boot();
    let a = spawn(k, "a", spin_ticks, 0);
    let b = spawn(k, "b", spin_ticks, 0);
    k.set_cpu_share_of(a, 20).unwrap();
    k.set_cpu_share_of(b, 10).unwrap();
    assert_eq!(k.total_share(), 52);

    let (mut turns_a, mut turns_b) = (0u32, 0u32);
    for _ in 0..1500 {
        match k.schedule_once() {
            Dispatch::Ran(pid) if pid == a => turns_a += 1,
            Dispatch::Ran(pid) if pid == b => turns_b += 1,
            _ => {}
        }
    }

    let ratio = turns_a as f64 / turns_b as f64;
    assert!((ratio - 2.0).abs() < 0.1, "ratio {}", ratio);
    assert!(k.platform().kernel_stack(CpuId::BSP).is_some());
}

#[test]
fn test_mlfq_demotes_spinner() {
    let k = boot();
    let pid = spawn(k, "hog", spin_ticks, 0);
    assert_eq!(k.get_level_of(pid), Ok(0));

    // 20 ticks of allotment at level 0, in quanta of 5
    for _ in 0..4 {
        assert_eq!(k.schedule_once(), Dispatch::Ran(pid));
    }
    assert_eq!(k.get_level_of(pid), Ok(1));
    assert!(k.with_space(pid, |s| s.activations()).unwrap() >= 4);
}

#[test]
fn test_boost_returns_to_top() {
    let params = SchedParams {
        boost_interval: 30,
        ..SchedParams::default()
    };
    let k = host::boot_with(params);
    let pid = spawn(k, "hog", spin_ticks, 0);

    let mut seen_demoted = false;
    for _ in 0..6 {
        k.schedule_once();
        seen_demoted |= k.get_level_of(pid) == Ok(1);
    }
    assert!(seen_demoted);
    // 30 ticks: four level-0 quanta, then one 10-tick level-1 quantum
    assert_eq!(k.get_level_of(pid), Ok(0));
}

static SHARE: StdMutex<Vec<Result<usize, SchedError>>> = StdMutex::new(Vec::new());

extern "C" fn share_requests(_: usize) {
    let k = kernel();
    let mut log = |r: Result<usize, SchedError>| SHARE.lock().unwrap().push(r);

    log(k.get_level());
    log(k.set_cpu_share(0).map(|()| 0));
    log(k.set_cpu_share(81).map(|()| 0));
    log(k.set_cpu_share(30).map(|()| 30));
    log(k.get_level());
    log(k.set_cpu_share(10).map(|()| 10));
    log(k.adjust_cpu_share(45).map(|()| 45));
    k.thread_exit(0)
}

#[test]
fn test_share_requests_from_process() {
    let k = boot();
    let pid = spawn(k, "share", share_requests, 0);
    run_until_exited(k, pid);

    assert_eq!(
        *SHARE.lock().unwrap(),
        [
            Ok(0),
            Err(SchedError::InvalidShare),
            Err(SchedError::InvalidShare),
            Ok(30),
            Err(SchedError::NotMlfq),
            Err(SchedError::InvalidShare),
            Ok(45),
        ]
    );
    // the exited process's share went back
    assert_eq!(k.total_share(), 22);
}

#[test]
fn test_share_ceiling_across_processes() {
    let k = boot();
    let a = spawn(k, "a", spin_ticks, 0);
    let b = spawn(k, "b", spin_ticks, 0);
    let c = spawn(k, "c", spin_ticks, 0);

    k.set_cpu_share_of(a, 50).unwrap();
    k.set_cpu_share_of(b, 30).unwrap();
    assert_eq!(k.total_share(), 102);
    assert_eq!(k.set_cpu_share_of(c, 1), Err(SchedError::InvalidShare));
    assert_eq!(k.get_level_of(c), Ok(0));
    assert_eq!(k.get_level_of(a), Err(SchedError::NotMlfq));
}

#[test]
fn test_tick_outside_thread() {
    let k = boot();
    assert_eq!(k.tick(), Err(SchedError::NoCurrentThread));
    assert_eq!(k.yield_now(), Err(SchedError::NoCurrentThread));
    assert_eq!(k.schedule_once(), Dispatch::Idle);
}

// ============================================================================
// Several CPUs
// ============================================================================

static SECOND_CPU: StdMutex<Option<(Dispatch, Option<LwpState>, Result<usize, SchedError>)>> =
    StdMutex::new(None);

extern "C" fn share_while_running(_: usize) {
    let k = kernel();
    let pid = Pid(1);
    let sibling = k.thread_create(entry(square), 6).unwrap();
    k.set_cpu_share_of(pid, 20).unwrap();

    // this thread still runs on CPU 0 while CPU 1 looks for work
    let other = host::on_cpu(1, || k.schedule_once());
    let state = k.thread_state(pid, sibling);
    let joined = k.thread_join(sibling);
    *SECOND_CPU.lock().unwrap() = Some((other, state, joined));
    k.thread_exit(0)
}

#[test]
fn test_share_granted_while_running_stays_on_one_cpu() {
    let k = boot();
    let pid = spawn(k, "granted", share_while_running, 0);
    assert_eq!(pid, Pid(1));
    run_until_exited(k, pid);

    assert_eq!(
        *SECOND_CPU.lock().unwrap(),
        Some((Dispatch::Idle, Some(LwpState::Runnable), Ok(36)))
    );
    // the share was queued and then released with the process
    assert_eq!(k.total_share(), 22);
    k.reap_process(pid).unwrap();
}

const WORKERS: usize = 4;

static INSIDE: [AtomicUsize; WORKERS] = [const { AtomicUsize::new(0) }; WORKERS];
static OVERLAPS: AtomicUsize = AtomicUsize::new(0);

extern "C" fn busy_member(worker: usize) {
    let k = kernel();
    for _ in 0..20 {
        if INSIDE[worker].fetch_add(1, Ordering::SeqCst) != 0 {
            OVERLAPS.fetch_add(1, Ordering::SeqCst);
        }
        thread::yield_now();
        INSIDE[worker].fetch_sub(1, Ordering::SeqCst);
        k.yield_now().unwrap();
    }
    k.thread_exit(0)
}

extern "C" fn smp_worker(worker: usize) {
    let k = kernel();
    let members = [
        k.thread_create(entry(busy_member), worker).unwrap(),
        k.thread_create(entry(busy_member), worker).unwrap(),
    ];
    if worker % 2 == 0 {
        k.set_cpu_share(10).unwrap();
    }
    for tid in members {
        k.thread_join(tid).unwrap();
    }
    k.thread_exit(0)
}

#[test]
fn test_two_cpus_never_run_one_process_twice() {
    let k = boot();
    let pids: Vec<Pid> = (0..WORKERS).map(|w| spawn(k, "smp", smp_worker, w)).collect();
    let done = AtomicBool::new(false);

    let finished = thread::scope(|s| {
        let second = s.spawn(|| {
            host::become_cpu(1);
            let mut turns = 0usize;
            while !done.load(Ordering::SeqCst) {
                match k.schedule_once() {
                    Dispatch::Ran(_) => turns += 1,
                    Dispatch::Idle => thread::yield_now(),
                }
            }
            turns
        });

        let mut finished = false;
        for _ in 0..10_000_000 {
            if pids.iter().all(|&pid| k.process_exited(pid)) {
                finished = true;
                break;
            }
            if k.schedule_once() == Dispatch::Idle {
                thread::yield_now();
            }
        }
        done.store(true, Ordering::SeqCst);
        let turns = second.join().unwrap();
        log::debug!("cpu 1 ran {} turns", turns);
        finished
    });

    assert!(finished, "workers did not finish");
    assert_eq!(OVERLAPS.load(Ordering::SeqCst), 0);
    assert_eq!(k.total_share(), 22);
    for pid in pids {
        k.reap_process(pid).unwrap();
    }
    assert_eq!(k.lwps_in_use(), 0);
    assert_eq!(k.platform().pages_in_use(), 0);
}
