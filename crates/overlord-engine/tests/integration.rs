use overlord_engine::{
    EngineConfig, EngineError, HandlerRegistry, HandlerResult, Outcome, TaskContext, TaskError,
    TaskRunner,
};
use overlord_state::{ChangeId, LogLevel, State, Status, TaskId};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SETTLE: Duration = Duration::from_secs(10);

fn ok(_: &mut TaskContext<'_>) -> HandlerResult {
    Ok(Outcome::Complete)
}

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_ms = 1;
    config.retry.max_ms = 20;
    config
}

fn runner(registry: HandlerRegistry, config: EngineConfig) -> TaskRunner {
    TaskRunner::new(State::in_memory(), registry, config).unwrap()
}

/// One change with a task per kind, chained in order.
fn chain(state: &State, kinds: &[&str]) -> (ChangeId, Vec<TaskId>) {
    let mut st = state.lock();
    let chg = st.new_change("install-snap", "Install");
    let mut ids: Vec<TaskId> = Vec::new();
    for kind in kinds {
        let t = st.new_task(chg, kind, kind).unwrap();
        if let Some(prev) = ids.last() {
            st.wait_for(t, *prev).unwrap();
        }
        ids.push(t);
    }
    (chg, ids)
}

fn status(state: &State, id: TaskId) -> Status {
    state.lock().task(id).unwrap().status()
}

#[test]
fn chain_runs_in_order_to_done() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut reg = HandlerRegistry::new();
    let seen = Arc::clone(&order);
    reg.register(
        "step",
        move |ctx| {
            seen.lock().unwrap().push(ctx.task_id());
            Ok(Outcome::Complete)
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["step", "step", "step"]);

    runner.settle(SETTLE).unwrap();

    assert_eq!(*order.lock().unwrap(), ids);
    let st = runner.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Done));
    assert!(st.change_is_clean(chg));
}

#[test]
fn empty_change_settles_as_done() {
    let runner = runner(HandlerRegistry::new(), fast_config());
    let chg = runner.state().lock().new_change("noop", "Nothing to do");
    runner.settle(SETTLE).unwrap();
    assert_eq!(runner.state().lock().change_status(chg), Some(Status::Done));
}

#[test]
fn retriable_errors_back_off_then_succeed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    reg.register(
        "download",
        move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TaskError::retry("store unavailable"))
            } else {
                Ok(Outcome::Complete)
            }
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["download"]);

    runner.settle(SETTLE).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let st = runner.state().lock();
    assert_eq!(st.change_status(chg), Some(Status::Done));
    let task = st.task(ids[0]).unwrap();
    assert_eq!(task.retries(), 0);
    assert!(task.log().iter().any(|l| l.contains("WARNING store unavailable")));
}

#[test]
fn explicit_retry_delay_is_honoured() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    reg.register(
        "download",
        move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TaskError::retry_after("rate limited", Duration::from_millis(80)))
            } else {
                Ok(Outcome::Complete)
            }
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (_, ids) = chain(runner.state(), &["download"]);

    let start = Instant::now();
    runner.settle(SETTLE).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(80));
    assert_eq!(status(runner.state(), ids[0]), Status::Done);
}

#[test]
fn exhausted_retries_become_fatal() {
    let mut reg = HandlerRegistry::new();
    reg.register("prepare", ok, ok).unwrap();
    reg.register("download", |_| Err(TaskError::retry("still broken")), ok)
        .unwrap();
    let mut config = fast_config();
    config.retry.max_attempts = Some(2);
    let runner = runner(reg, config);
    let (chg, ids) = chain(runner.state(), &["prepare", "download"]);

    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    assert_eq!(st.task(ids[1]).unwrap().status(), Status::Error);
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Undone);
    assert_eq!(st.change_status(chg), Some(Status::Error));
    assert!(st
        .task(ids[1])
        .unwrap()
        .log()
        .iter()
        .any(|l| l.contains("gave up after 2 retries")));
}

#[test]
fn pending_outcome_is_repolled() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    let counter = Arc::clone(&calls);
    reg.register(
        "wait-restart",
        move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Outcome::Pending {
                    repoll_after: Duration::from_millis(20),
                })
            } else {
                Ok(Outcome::Complete)
            }
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (_, ids) = chain(runner.state(), &["wait-restart"]);

    // First pass leaves the task in Doing with a re-poll time.
    runner.ensure().unwrap();
    let deadline = Instant::now() + SETTLE;
    while runner.is_running(ids[0]) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    {
        let st = runner.state().lock();
        let task = st.task(ids[0]).unwrap();
        if calls.load(Ordering::SeqCst) == 1 {
            assert_eq!(task.status(), Status::Doing);
            assert!(task.at_time().is_some());
        }
    }

    runner.settle(SETTLE).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(status(runner.state(), ids[0]), Status::Done);
}

#[test]
fn unlocked_handler_does_not_block_other_tasks() {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Arc::new(Mutex::new(rx));
    let tx = Arc::new(Mutex::new(tx));
    let mut reg = HandlerRegistry::new();
    reg.register(
        "slow",
        move |ctx| {
            let unlocked = ctx.unlock();
            let got = rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            drop(unlocked);
            got.map_err(|_| TaskError::fatal("fast task never ran while unlocked"))?;
            Ok(Outcome::Complete)
        },
        ok,
    )
    .unwrap();
    reg.register(
        "fast",
        move |ctx| {
            ctx.logf(LogLevel::Info, "ran while slow was unlocked");
            tx.lock().unwrap().send(()).unwrap();
            Ok(Outcome::Complete)
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = {
        let mut st = runner.state().lock();
        let chg = st.new_change("refresh", "Refresh two snaps");
        let slow = st.new_task(chg, "slow", "Slow download").unwrap();
        let fast = st.new_task(chg, "fast", "Fast link").unwrap();
        (chg, vec![slow, fast])
    };

    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Done);
    assert_eq!(st.change_status(chg), Some(Status::Done));
}

#[test]
fn irreversible_done_task_leaves_change_in_error() {
    let mut reg = HandlerRegistry::new();
    reg.register_irreversible("discard", ok).unwrap();
    reg.register("link", |_| Err(TaskError::fatal("cannot link")), ok)
        .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["discard", "link"]);

    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Done);
    assert_eq!(st.task(ids[1]).unwrap().status(), Status::Error);
    let change = st.change(chg).unwrap();
    assert!(change.is_partially_irreversible());
    assert_eq!(change.irreversible(), &[ids[0]]);
    assert_eq!(st.change_status(chg), Some(Status::Error));
}

#[test]
fn handler_panic_is_a_fatal_error() {
    let mut reg = HandlerRegistry::new();
    reg.register(
        "boom",
        |_| -> HandlerResult { panic!("handler bug") },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["boom"]);

    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    let task = st.task(ids[0]).unwrap();
    assert_eq!(task.status(), Status::Error);
    assert!(task.log().iter().any(|l| l.contains("handler bug")));
    assert_eq!(st.change_status(chg), Some(Status::Error));
}

#[test]
fn unknown_kind_added_later_errors_at_dispatch() {
    let runner = runner(HandlerRegistry::new(), fast_config());
    let (chg, ids) = chain(runner.state(), &["retired-kind"]);
    runner.settle(SETTLE).unwrap();
    let st = runner.state().lock();
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Error);
    assert_eq!(st.change_status(chg), Some(Status::Error));
}

#[test]
fn undo_fatal_error_ends_in_error_without_further_cascade() {
    let mut reg = HandlerRegistry::new();
    reg.register("prepare", ok, ok).unwrap();
    reg.register("mount", ok, |_| Err(TaskError::fatal("umount failed")))
        .unwrap();
    reg.register("link", |_| Err(TaskError::fatal("cannot link")), ok)
        .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["prepare", "mount", "link"]);

    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    assert_eq!(st.task(ids[2]).unwrap().status(), Status::Error);
    assert_eq!(st.task(ids[1]).unwrap().status(), Status::Error);
    // prepare is not blocked by its failed dependent and is still undone
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Undone);
    assert_eq!(st.change_status(chg), Some(Status::Error));
}

#[test]
fn abort_cancels_running_handler_and_undoes() {
    let started = Arc::new(AtomicBool::new(false));
    let undone = Arc::new(AtomicBool::new(false));
    let mut reg = HandlerRegistry::new();
    let flag = Arc::clone(&started);
    let undo_flag = Arc::clone(&undone);
    reg.register(
        "download",
        move |ctx| {
            let unlocked = ctx.unlock();
            flag.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                unlocked.check_cancelled()?;
                thread::sleep(Duration::from_millis(2));
            }
            Err(TaskError::fatal("never cancelled"))
        },
        move |_| {
            undo_flag.store(true, Ordering::SeqCst);
            Ok(Outcome::Complete)
        },
    )
    .unwrap();
    reg.register("link", ok, ok).unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["download", "link"]);

    runner.ensure().unwrap();
    let deadline = Instant::now() + SETTLE;
    while !started.load(Ordering::SeqCst) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    runner.abort_change(chg).unwrap();
    runner.settle(SETTLE).unwrap();

    assert!(undone.load(Ordering::SeqCst));
    let st = runner.state().lock();
    assert_eq!(st.task(ids[0]).unwrap().status(), Status::Undone);
    assert_eq!(st.task(ids[1]).unwrap().status(), Status::Undone);
    assert_eq!(st.change_status(chg), Some(Status::Undone));
    assert!(!st.change(chg).unwrap().abort_requested());
}

#[test]
fn abort_of_ready_change_is_rejected() {
    let mut reg = HandlerRegistry::new();
    reg.register("step", ok, ok).unwrap();
    let runner = runner(reg, fast_config());
    let (chg, _) = chain(runner.state(), &["step"]);
    runner.settle(SETTLE).unwrap();
    let err = runner.abort_change(chg).unwrap_err();
    assert!(matches!(err, EngineError::State(e) if e.is_stale()));
}

#[test]
fn held_task_waits_for_release() {
    let mut reg = HandlerRegistry::new();
    reg.register("step", ok, ok).unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["step", "step"]);
    runner.state().lock().hold(ids[0]).unwrap();

    runner.settle(SETTLE).unwrap();
    {
        let st = runner.state().lock();
        assert_eq!(st.change_status(chg), Some(Status::Hold));
        assert_eq!(st.task(ids[1]).unwrap().status(), Status::Wait);
    }

    runner.state().lock().release(ids[0]).unwrap();
    runner.settle(SETTLE).unwrap();
    assert_eq!(runner.state().lock().change_status(chg), Some(Status::Done));
}

#[test]
fn dispatch_cap_bounds_concurrency() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut reg = HandlerRegistry::new();
    let (cur, top) = (Arc::clone(&current), Arc::clone(&peak));
    reg.register(
        "work",
        move |ctx| {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            top.fetch_max(now, Ordering::SeqCst);
            ctx.without_lock(|_| thread::sleep(Duration::from_millis(20)));
            cur.fetch_sub(1, Ordering::SeqCst);
            Ok(Outcome::Complete)
        },
        ok,
    )
    .unwrap();
    let mut config = fast_config();
    config.max_concurrent = 2;
    let runner = runner(reg, config);
    let chg = {
        let mut st = runner.state().lock();
        let chg = st.new_change("refresh", "Refresh many");
        for i in 0..6 {
            st.new_task(chg, "work", &format!("work {i}")).unwrap();
        }
        chg
    };

    runner.settle(SETTLE).unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(runner.state().lock().change_status(chg), Some(Status::Done));
}

#[test]
fn cleanup_runs_once_change_is_ready() {
    let cleaned = Arc::new(Mutex::new(Vec::new()));
    let seen_ready = Arc::new(AtomicBool::new(true));
    let mut reg = HandlerRegistry::new();
    reg.register("download", ok, ok).unwrap();
    reg.register("link", ok, ok).unwrap();
    let (log, ready) = (Arc::clone(&cleaned), Arc::clone(&seen_ready));
    reg.register_cleanup("download", move |ctx| {
        let change = ctx.change_id();
        ready.fetch_and(ctx.doc().change_is_ready(change), Ordering::SeqCst);
        log.lock().unwrap().push(ctx.task_id());
        Ok(Outcome::Complete)
    })
    .unwrap();
    let runner = runner(reg, fast_config());
    let (chg, ids) = chain(runner.state(), &["download", "link"]);

    runner.settle(SETTLE).unwrap();

    assert_eq!(*cleaned.lock().unwrap(), vec![ids[0]]);
    assert!(seen_ready.load(Ordering::SeqCst));
    assert!(runner.state().lock().change_is_clean(chg));
}

#[test]
fn stuck_task_is_reported_once() {
    let mut reg = HandlerRegistry::new();
    reg.register(
        "slow",
        |ctx| {
            ctx.without_lock(|_| thread::sleep(Duration::from_millis(60)));
            Ok(Outcome::Complete)
        },
        ok,
    )
    .unwrap();
    let mut config = fast_config();
    config.stuck_after_secs = 0;
    let runner = runner(reg, config);
    let (_, ids) = chain(runner.state(), &["slow"]);

    runner.ensure().unwrap();
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(5));
        runner.ensure().unwrap();
    }
    runner.settle(SETTLE).unwrap();

    let st = runner.state().lock();
    let warnings = st
        .task(ids[0])
        .unwrap()
        .log()
        .iter()
        .filter(|l| l.contains("running for more than"))
        .count();
    assert_eq!(warnings, 1);
}

#[test]
fn runner_prunes_with_configured_policy() {
    let mut reg = HandlerRegistry::new();
    reg.register("step", ok, ok).unwrap();
    let runner = runner(reg, fast_config());
    let (chg, _) = chain(runner.state(), &["step"]);
    runner.settle(SETTLE).unwrap();

    let report = runner
        .prune(chrono::Utc::now() + chrono::Duration::days(2))
        .unwrap();
    assert_eq!(report.removed_changes, vec![chg]);
    assert!(runner.state().lock().change(chg).is_none());
}

#[test]
fn settle_times_out_on_endless_work() {
    let mut reg = HandlerRegistry::new();
    reg.register(
        "forever",
        |_| {
            Ok(Outcome::Pending {
                repoll_after: Duration::from_millis(5),
            })
        },
        ok,
    )
    .unwrap();
    let runner = runner(reg, fast_config());
    chain(runner.state(), &["forever"]);
    let err = runner.settle(Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, EngineError::SettleTimeout(_)));
}
