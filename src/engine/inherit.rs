use std::sync::Arc;
use std::time::Instant;

use log::debug;
use nix::sys::wait::waitpid;

use crate::error::LprofError;
use crate::experiment::layout::ExperimentLayout;
use crate::metafile::writer::spawn_maps_listener;
use crate::perf::group::{EventGroup, GroupTarget, SessionPlan};
use crate::store::{SpillAccounting, StoreConfig};

use super::drainer::DrainerPool;
use super::process::{set_affinity, SuspendedProcess};
use super::{
    poll_timeout_ms, set_session_target, spawn_user_guided, EngineKind, GroupControl, RunResult,
    SampleOptions, UserGuided,
};

/// Inherit flavour: one counter group per CPU of the affinity set with
/// the kernel inherit flag, so counters follow every descendant thread
/// scheduled on that CPU. The child blocks on the ready-pipe until all
/// groups are open.
pub fn run(
    options: &SampleOptions,
    plan: &SessionPlan,
    layout: &ExperimentLayout,
    hostname: &str,
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

    let immediate = options.user_guided == UserGuided::Immediate;
    let control = Arc::new(GroupControl::new(immediate));

    let cpus: Vec<u32> = match &options.cpu_list {
        Some(cpus) => cpus.clone(),
        None => (0..num_cpus::get() as u32).collect(),
    };

    let spill_dir = layout
        .create_process_dir(hostname, pid)
        .map_err(|e| LprofError::io(layout.node_dir(hostname), e))?;
    let mut pool = DrainerPool::spawn(
        options.worker_count,
        poll_timeout_ms(EngineKind::Inherit),
        options.backtrace_mode,
        store_config,
        spill_dir,
        accounting.clone(),
    )
    .map_err(LprofError::Launch)?;

    for &cpu in &cpus {
        for group_index in 0..plan.groups.len() {
            let group = EventGroup::open(
                plan,
                group_index,
                GroupTarget::InheritCpu {
                    pid: pid as libc::pid_t,
                    cpu,
                },
                // Immediate mode arms the counters on the child's exec;
                // the other modes keep them disabled for the helper.
                immediate,
            )?;
            control.register(&group.fds());
            pool.add_group(group);
        }
    }
    debug!(
        "opened {} group(s) across {} cpu(s) for pid {pid}",
        plan.groups.len() * cpus.len(),
        cpus.len()
    );

    spawn_user_guided(options.user_guided, control);

    let started = Instant::now();
    let child = process.unsuspend_and_run().map_err(LprofError::Launch)?;

    // The drainer workers poll the ring buffers; this thread only waits
    // for the target to finish.
    loop {
        match waitpid(child, None) {
            Ok(_) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => return Err(LprofError::Trace(format!("waitpid failed: {e}"))),
        }
    }
    let walltime_us = started.elapsed().as_micros() as u64;

    let stores = pool.finish();
    let _ = maps_listener.join();

    Ok(RunResult {
        root_pid: pid,
        stores,
        walltime_us,
    })
}
