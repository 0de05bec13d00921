//! Drains the request queue with real worker processes, and checks that
//! workers never outlive their parent.
//!
//! Workers re-launch the current executable, so this test provides its own
//! `main` that hands control to the worker roles first.
use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use agora::{config::Config, kwargs, portal::Portal};
use anyhow::{bail, ensure, Context, Result};

/// Set on a copy of this binary that opens a swarming portal at the given
/// directory, reports its worker pids and exits without clearing it.
const EXITING_PARENT_ENV: &str = "AGORA_TEST_EXITING_PARENT";

#[agora::function]
fn collatz_steps(n: u64) -> u64 {
    let (mut n, mut steps) = (n, 0);
    while n != 1 {
        n = if n % 2 == 0 { n / 2 } else { 3 * n + 1 };
        steps += 1;
    }
    println!("collatz done after {steps} steps");
    steps
}

fn swarming(dir: &Path) -> Config {
    Config {
        num_background_workers: 2,
        poll_interval_ms: 100,
        attempt_timeout_secs: Some(60),
        ..Config::at(dir)
    }
}

fn main() -> Result<()> {
    agora::swarm::maybe_run_worker();
    if let Some(dir) = std::env::var_os(EXITING_PARENT_ENV) {
        return exit_without_clearing(PathBuf::from(dir));
    }
    agora::init::tracing();

    workers_drain_the_queue()?;
    if cfg!(target_os = "linux") {
        workers_stop_once_the_token_is_deleted()?;
        workers_stop_once_the_parent_exits()?;
    }
    println!("swarm test passed");
    Ok(())
}

fn workers_drain_the_queue() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let portal = Portal::open(swarming(dir.path()))?;
    ensure!(portal.background_workers() == 2);
    ensure!(portal.live_compute_nodes()? == 1);

    let function = COLLATZ_STEPS.function();
    let addresses = [27u64, 97, 871]
        .into_iter()
        .map(|n| portal.swarm(&function, kwargs! { n = n }?))
        .collect::<agora::Result<Vec<_>>>()?;

    let mut steps = Vec::new();
    for address in &addresses {
        steps.push(portal.get::<u64>(address, Some(Duration::from_secs(120)))?);
    }
    ensure!(steps == [111, 118, 178], "unexpected results {steps:?}");

    // Output is stored by the worker once its poll process exits.
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let records = portal.execution_records(&addresses[0])?;
        let captured = records
            .iter()
            .filter_map(|record| record.output.as_ref())
            .any(|output| output.stdout.contains("collatz done") && output.exit_code == Some(10));
        if captured {
            break;
        }
        ensure!(Instant::now() < deadline, "captured output never appeared");
        thread::sleep(Duration::from_millis(100));
    }

    portal.clear()?;
    ensure!(portal.background_workers() == 0);
    Ok(())
}

fn workers_stop_once_the_token_is_deleted() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let portal = Portal::open(swarming(dir.path()))?;
    let pids = portal.worker_pids();
    ensure!(pids.len() == 2);

    fs::remove_dir_all(dir.path().join("compute_nodes"))?;
    wait_for_exit(&pids, Duration::from_secs(30))?;
    portal.clear()?;
    Ok(())
}

fn workers_stop_once_the_parent_exits() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut parent = Command::new(std::env::current_exe()?)
        .env(EXITING_PARENT_ENV, dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .spawn()?;
    let stdout = parent.stdout.take().context("missing parent stdout")?;

    // Workers inherit the parent's stdout and log to it as well.
    let mut lines = BufReader::new(stdout).lines();
    let pids = loop {
        let line = lines
            .next()
            .context("parent exited before reporting its workers")??;
        if let Some(pids) = line.strip_prefix("workers ") {
            break pids
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<Vec<u32>, _>>()?;
        }
    };
    ensure!(pids.len() == 2, "unexpected workers {pids:?}");
    ensure!(parent.wait()?.success(), "parent failed");

    wait_for_exit(&pids, Duration::from_secs(30))?;
    let portal = Portal::open(Config::at(dir.path()))?;
    ensure!(
        portal.live_compute_nodes()? == 0,
        "the exited parent's token was left behind"
    );
    portal.clear()?;
    Ok(())
}

fn exit_without_clearing(dir: PathBuf) -> Result<()> {
    let portal = Portal::open(swarming(&dir))?;
    let pids: Vec<String> = portal.worker_pids().iter().map(u32::to_string).collect();
    let mut stdout = std::io::stdout();
    writeln!(stdout, "workers {}", pids.join(" "))?;
    stdout.flush()?;
    std::process::exit(0);
}

/// Whether `pid` is gone or a zombie. Orphans are not always reaped inside
/// containers.
fn has_exited(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    }
}

fn wait_for_exit(pids: &[u32], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let running: Vec<u32> = pids.iter().copied().filter(|&pid| !has_exited(pid)).collect();
        if running.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!("workers {running:?} are still running");
        }
        thread::sleep(Duration::from_millis(100));
    }
}
