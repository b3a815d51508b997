use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

use crate::error::LprofError;
use crate::experiment::layout::ExperimentLayout;
use crate::metafile::writer::spawn_maps_listener;
use crate::store::{SpillAccounting, StoreConfig, WorkerStore};

use super::process::{set_affinity, SuspendedProcess};
use super::{
    set_session_target, spawn_user_guided, GroupControl, RunResult, SampleOptions, UserGuided,
};

/// One running thread's sampled state, read from
/// `/proc/<pid>/task/<tid>/stat`: the kernel-reported instruction
/// pointer and the CPU the task last ran on.
fn read_task_stat(pid: u32, tid: u32) -> Option<(u64, u32)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/task/{tid}/stat")).ok()?;
    // Fields after the parenthesized command; the command itself can
    // contain spaces.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // kstkeip is field 30 of the full line, task_cpu is field 39;
    // `rest` starts at field 3.
    let ip: u64 = fields.get(27)?.parse().ok()?;
    let cpu: u32 = fields.get(36)?.parse().ok()?;
    Some((ip, cpu))
}

fn running_tasks(pid: u32) -> Vec<u32> {
    let mut tids = Vec::new();
    if let Ok(entries) = std::fs::read_dir(format!("/proc/{pid}/task")) {
        for entry in entries.flatten() {
            if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
                tids.push(tid);
            }
        }
    }
    tids
}

/// Timers flavour: no performance counters at all. A periodic tick
/// pushes the current IP of every running thread of the target into
/// the store. `period` is the tick length in nanoseconds.
pub fn run(
    options: &SampleOptions,
    layout: &ExperimentLayout,
    hostname: &str,
    period: u64,
    accounting: Arc<SpillAccounting>,
    store_config: StoreConfig,
) -> Result<RunResult, LprofError> {
    let process = SuspendedProcess::launch(&options.command).map_err(LprofError::Launch)?;
    let pid = process.pid();
    set_session_target(pid);

    if let Some(cpus) = &options.cpu_list {
        set_affinity(pid, cpus).map_err(|e| LprofError::Launch(e.into()))?;
    }
    let maps_listener =
        spawn_maps_listener(layout.node_dir(hostname), pid, options.mpi_target.clone());
    let spill_dir = layout
        .create_process_dir(hostname, pid)
        .map_err(|e| LprofError::io(layout.node_dir(hostname), e))?;

    let control = Arc::new(GroupControl::new(
        options.user_guided == UserGuided::Immediate,
    ));
    spawn_user_guided(options.user_guided, control.clone());

    let mut store = WorkerStore::new(0, store_config, spill_dir);
    let tick = Duration::from_nanos(period.max(100_000));
    debug!("timer sampling every {tick:?}");

    let started = Instant::now();
    let child = process.unsuspend_and_run().map_err(LprofError::Launch)?;

    loop {
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(nix::sys::wait::WaitStatus::StillAlive) => {}
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break,
        }
        if accounting.stopped() {
            break;
        }
        if control.is_enabled() {
            for tid in running_tasks(pid) {
                if let Some((ip, cpu)) = read_task_stat(pid, tid) {
                    if ip == 0 {
                        continue;
                    }
                    if let Err(e) = store.insert(&accounting, pid, tid, ip, cpu, 0, &[]) {
                        log::error!("sample store failure: {e}");
                        accounting.force_stop();
                        break;
                    }
                }
            }
        }
        std::thread::sleep(tick);
    }
    // Reap if the loop ended for another reason than exit.
    let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
    let walltime_us = started.elapsed().as_micros() as u64;

    let _ = maps_listener.join();
    Ok(RunResult {
        root_pid: pid,
        stores: vec![store],
        walltime_us,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_task_stat() {
        let pid = std::process::id();
        let tids = running_tasks(pid);
        assert!(tids.contains(&pid));
        // kstkeip may be masked to 0 by the kernel, but the fields must
        // parse.
        assert!(read_task_stat(pid, pid).is_some());
    }
}
