//! Long-running stress test for the overlord engine.
//!
//! Runs hundreds of install changes against a file-backed state, a share of
//! them failing mid-chain so their lanes unwind, and prunes periodically.
//! After pruning it checks for leaks (leftover changes, orphaned tasks,
//! stuck handlers) and that the state file still decodes.
//!
//! Usage:
//!   cargo run --bin stress_test -- [--cycles N]

use chrono::Utc;
use overlord_engine::{
    init_logging, install_signal_handler, shutdown_requested, EngineConfig, HandlerRegistry,
    Outcome, TaskError, TaskRunner,
};
use overlord_state::{ChangeId, State, Status};
use std::path::Path;
use std::time::{Duration, Instant};

const SNAPS_PER_CHANGE: usize = 3;

struct Timings {
    plan: Duration,
    settle: Duration,
    prune: Duration,
}

#[derive(Default)]
struct Tally {
    done: usize,
    error: usize,
}

fn registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    for kind in ["prepare-snap", "mount-snap", "link-snap"] {
        reg.register(kind, |_| Ok(Outcome::Complete), |_| Ok(Outcome::Complete))
            .expect("register handler");
    }
    reg.register(
        "run-hooks",
        |ctx| {
            if ctx.get::<bool>("fail").unwrap_or(false) {
                Err(TaskError::fatal("configure hook exited with status 1"))
            } else {
                Ok(Outcome::Complete)
            }
        },
        |_| Ok(Outcome::Complete),
    )
    .expect("register handler");
    reg
}

/// One change installing `SNAPS_PER_CHANGE` snaps, each in its own lane.
fn plan_change(state: &State, cycle: usize) -> Result<ChangeId, String> {
    let mut st = state.lock();
    let chg = st.new_change("install-snaps", &format!("Install batch {cycle}"));
    for n in 0..SNAPS_PER_CHANGE {
        let lane = st.new_lane();
        let mut prev = None;
        for kind in ["prepare-snap", "mount-snap", "link-snap", "run-hooks"] {
            let t = st
                .new_task(chg, kind, &format!("{kind} snap-{n}"))
                .map_err(|e| format!("cycle {cycle}: PLAN FAILED: {e}"))?;
            st.join_lane(t, lane).map_err(|e| e.to_string())?;
            if let Some(p) = prev {
                st.wait_for(t, p).map_err(|e| e.to_string())?;
            }
            if kind == "run-hooks" && n == 0 && cycle.is_multiple_of(7) {
                let task = st.task_mut(t).ok_or("task vanished")?;
                task.set("fail", &true).map_err(|e| e.to_string())?;
            }
            prev = Some(t);
        }
    }
    st.unlock().map_err(|e| e.to_string())?;
    Ok(chg)
}

fn run_cycle(
    runner: &TaskRunner,
    cycle: usize,
    timings: &mut Timings,
    tally: &mut Tally,
) -> Result<(), String> {
    let t0 = Instant::now();
    let chg = plan_change(runner.state(), cycle)?;
    timings.plan += t0.elapsed();

    let t0 = Instant::now();
    runner
        .settle(Duration::from_secs(30))
        .map_err(|e| format!("cycle {cycle}: SETTLE FAILED: {e}"))?;
    timings.settle += t0.elapsed();

    let expect_failure = cycle.is_multiple_of(7);
    match runner.state().lock().change_status(chg) {
        Some(Status::Done) if !expect_failure => tally.done += 1,
        Some(Status::Error) if expect_failure => tally.error += 1,
        other => return Err(format!("cycle {cycle}: UNEXPECTED STATUS {other:?}")),
    }

    if cycle.is_multiple_of(10) {
        let t0 = Instant::now();
        let report = runner
            .prune(Utc::now() + chrono::Duration::hours(1))
            .map_err(|e| format!("cycle {cycle}: PRUNE FAILED: {e}"))?;
        timings.prune += t0.elapsed();
        if cycle.is_multiple_of(100) {
            println!(
                "  cycle {cycle}: pruned {} changes, {} orphan tasks",
                report.removed_changes.len(),
                report.removed_orphans.len()
            );
        }
    }
    Ok(())
}

fn check_health(runner: &TaskRunner, cycle: usize) -> u64 {
    let mut failures = 0u64;
    let st = runner.state().lock();
    let changes = st.changes().count();
    if changes > 0 {
        eprintln!("  cycle {cycle}: CHANGE LEAK: {changes} changes survived pruning");
        failures += 1;
    }
    let tasks = st.tasks().count();
    if tasks > 0 {
        eprintln!("  cycle {cycle}: TASK LEAK: {tasks} tasks survived pruning");
        failures += 1;
    }
    drop(st);
    let running = runner.running().len();
    if running > 0 {
        eprintln!("  cycle {cycle}: HANDLER LEAK: {running} handlers still running");
        failures += 1;
    }
    failures
}

fn verify_file(path: &Path) -> Result<(usize, u64), String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let doc = overlord_state::state::decode(&bytes, path).map_err(|e| e.to_string())?;
    Ok((doc.changes().count(), doc.last_task_id()))
}

fn print_report(cycles: usize, failures: u64, timings: &Timings, tally: &Tally, path: &Path) {
    println!();
    println!("============================================");
    println!("Results: {cycles} cycles, {failures} failures");
    println!(
        "  plan:    {:.3}s total, {:.3}ms avg",
        timings.plan.as_secs_f64(),
        timings.plan.as_secs_f64() * 1000.0 / cycles as f64
    );
    println!(
        "  settle:  {:.3}s total, {:.3}ms avg",
        timings.settle.as_secs_f64(),
        timings.settle.as_secs_f64() * 1000.0 / cycles as f64
    );
    println!("  prune:   {:.3}s total", timings.prune.as_secs_f64());
    println!("  changes done: {}, rolled back: {}", tally.done, tally.error);
    let file_ok = match verify_file(path) {
        Ok((changes, last_task)) => {
            println!("  state file: {changes} changes, last task id {last_task}");
            true
        }
        Err(e) => {
            println!("  state file: ERROR: {e}");
            false
        }
    };

    if failures > 0 || !file_ok {
        eprintln!("\nSTRESS TEST FAILED");
        std::process::exit(1);
    } else {
        println!("\nSTRESS TEST PASSED");
    }
}

fn main() {
    init_logging("warn");
    install_signal_handler();

    let args: Vec<String> = std::env::args().collect();
    let cycles: usize = args
        .iter()
        .position(|a| a == "--cycles")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(500);

    println!("overlord stress test: {cycles} cycles");
    println!("============================================");

    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("state.json");
    let state = State::open(&path).expect("open state");

    let mut config = EngineConfig::default();
    config.retry.initial_ms = 1;
    config.retry.max_ms = 10;
    config.prune.prune_wait_secs = 0;
    let runner = TaskRunner::new(state, registry(), config).expect("create runner");

    let mut timings = Timings {
        plan: Duration::ZERO,
        settle: Duration::ZERO,
        prune: Duration::ZERO,
    };
    let mut tally = Tally::default();
    let mut failures = 0u64;
    let mut completed = 0;

    for cycle in 1..=cycles {
        if shutdown_requested() {
            println!("  interrupted after {completed} cycles");
            break;
        }
        if let Err(msg) = run_cycle(&runner, cycle, &mut timings, &mut tally) {
            eprintln!("  {msg}");
            failures += 1;
            continue;
        }
        completed = cycle;
        if cycle.is_multiple_of(50) {
            failures += check_health(&runner, cycle);
        }
        if cycle.is_multiple_of(100) {
            let elapsed = timings.plan + timings.settle + timings.prune;
            println!(
                "  cycle {cycle}/{cycles}: {:.1}s elapsed, {failures} failures",
                elapsed.as_secs_f64()
            );
        }
    }

    runner.stop();
    print_report(completed.max(1), failures, &timings, &tally, &path);
}
