use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::error::LprofError;
use crate::experiment::layout::ExperimentLayout;
use crate::metafile::writer::spawn_maps_listener;
use crate::perf::group::{EventGroup, GroupTarget, SessionPlan};
use crate::store::{SpillAccounting, StoreConfig};

use super::drainer::{DrainerPool, PoolHandle};
use super::process::{set_affinity, SuspendedProcess};
use super::{
    poll_timeout_ms, set_session_target, spawn_user_guided, EngineKind, GroupControl, RunResult,
    SampleOptions, UserGuided,
};

/// Signals that remove and kill the stopped thread instead of being
/// forwarded; the tracer itself keeps running so already-collected
/// samples survive.
const LETHAL_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGKILL,
    Signal::SIGSEGV,
    Signal::SIGPIPE,
    Signal::SIGALRM,
    Signal::SIGTERM,
];

/// The (tid → group) bookkeeping shared between the tracer and the
/// asynchronous attach helper. Lock order is always `removal` then
/// `table`, released in reverse: the removal lock excludes a drain-side
/// close from racing the table mutation.
struct ThreadTable {
    removal: Mutex<()>,
    table: Mutex<FxHashSet<i32>>,
}

struct Attacher {
    plan: Arc<SessionPlan>,
    pool: PoolHandle,
    control: Arc<GroupControl>,
    threads: Arc<ThreadTable>,
}

impl Attacher {
    fn add_thread(&self, tid: i32) {
        {
            let _removal = self.threads.removal.lock();
            let mut table = self.threads.table.lock();
            if !table.insert(tid) {
                return;
            }
        }
        for group_index in 0..self.plan.groups.len() {
            let group = EventGroup::open(
                &self.plan,
                group_index,
                GroupTarget::Thread { tid },
                false,
            );
            match group {
                Ok(group) => {
                    if self.control.is_enabled() {
                        let _ = group.enable();
                    }
                    self.control.register(&group.fds());
                    self.pool.add_group(group);
                }
                Err(e) => {
                    // A follower that dies between clone and counter
                    // attach is silently skipped.
                    debug!("thread {tid} exited during counter attach: {e}");
                    let _removal = self.threads.removal.lock();
                    self.threads.table.lock().remove(&tid);
                    return;
                }
            }
        }
    }

    fn remove_thread(&self, tid: i32) {
        {
            let _removal = self.threads.removal.lock();
            if !self.threads.table.lock().remove(&tid) {
                return;
            }
        }
        // The owning worker flushes the ring buffer before the
        // descriptors close.
        self.pool.remove_thread(tid as u32);
    }
}

/// Requests crossing the tracer → helper byte pipe in asynchronous
/// mode: `+<tid>` to attach, `-<tid>` to detach.
enum AttachRequest {
    Add(i32),
    Remove(i32),
}

impl AttachRequest {
    fn parse(line: &str) -> Option<AttachRequest> {
        let (sign, tid) = line.split_at(1.min(line.len()));
        let tid: i32 = tid.trim().parse().ok()?;
        match sign {
            "+" => Some(AttachRequest::Add(tid)),
            "-" => Some(AttachRequest::Remove(tid)),
            _ => None,
        }
    }
}

/// How thread add/remove reaches the attacher: inline on the tracer
/// thread (synchronous) or through the byte pipe drained by a helper
/// task, keeping the slow counter open/close off the critical path.
enum AttachMode {
    Sync(Arc<Attacher>),
    Async(std::fs::File),
}

impl AttachMode {
    fn add(&mut self, tid: i32) {
        match self {
            AttachMode::Sync(attacher) => attacher.add_thread(tid),
            AttachMode::Async(pipe) => {
                let _ = writeln!(pipe, "+{tid}");
            }
        }
    }

    fn remove(&mut self, tid: i32) {
        match self {
            AttachMode::Sync(attacher) => attacher.remove_thread(tid),
            AttachMode::Async(pipe) => {
                let _ = writeln!(pipe, "-{tid}");
            }
        }
    }
}

/// Ptrace flavour: traceme + stop + exec, then a wait loop following
/// every fork/vfork/clone/exec, attaching per-thread counters at
/// addition and closing them at removal.
#[allow(clippy::too_many_arguments)]
pub fn run(
    options: &SampleOptions,
    plan: Arc<SessionPlan>,
    layout: &ExperimentLayout,
    hostname: &str,
    accounting: Arc<SpillAccounting>,
    store_config: StoreConfig,
    async_mode: bool,
) -> Result<RunResult, LprofError> {
    let process = SuspendedProcess::launch_traced(&options.command).map_err(LprofError::Launch)?;
    let pid = process.pid();
    set_session_target(pid);

    // First stop: the child raised SIGSTOP after traceme.
    let root = Pid::from_raw(pid as i32);
    match waitpid(root, None) {
        Ok(WaitStatus::Stopped(_, _)) => {}
        other => {
            return Err(LprofError::Trace(format!(
                "expected the initial stop of pid {pid}, got {other:?}"
            )))
        }
    }
    ptrace::setoptions(
        root,
        ptrace::Options::PTRACE_O_TRACECLONE
            | ptrace::Options::PTRACE_O_TRACEEXEC
            | ptrace::Options::PTRACE_O_TRACEFORK
            | ptrace::Options::PTRACE_O_TRACEVFORK,
    )
    .map_err(|e| LprofError::Trace(format!("cannot set trace options: {e}")))?;

    if let Some(cpus) = &options.cpu_list {
        set_affinity(pid, cpus).map_err(|e| LprofError::Launch(e.into()))?;
    }
    let maps_listener =
        spawn_maps_listener(layout.node_dir(hostname), pid, options.mpi_target.clone());

    let spill_dir = layout
        .create_process_dir(hostname, pid)
        .map_err(|e| LprofError::io(layout.node_dir(hostname), e))?;
    let pool = DrainerPool::spawn(
        options.worker_count,
        poll_timeout_ms(EngineKind::PtraceSync),
        options.backtrace_mode,
        store_config,
        spill_dir,
        accounting.clone(),
    )
    .map_err(LprofError::Launch)?;

    let control = Arc::new(GroupControl::new(
        options.user_guided == UserGuided::Immediate,
    ));
    let attacher = Arc::new(Attacher {
        plan,
        pool: pool.handle(),
        control: control.clone(),
        threads: Arc::new(ThreadTable {
            removal: Mutex::new(()),
            table: Mutex::new(FxHashSet::default()),
        }),
    });

    let mut attach_mode = if async_mode {
        let (read_end, write_end) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(|e| LprofError::Launch(e.into()))?;
        let helper_attacher = attacher.clone();
        std::thread::Builder::new()
            .name("lprof-attach".into())
            .spawn(move || {
                let reader = BufReader::new(std::fs::File::from(read_end));
                for line in reader.lines() {
                    let Ok(line) = line else { break };
                    match AttachRequest::parse(&line) {
                        Some(AttachRequest::Add(tid)) => helper_attacher.add_thread(tid),
                        Some(AttachRequest::Remove(tid)) => helper_attacher.remove_thread(tid),
                        None => warn!("malformed attach request {line:?}"),
                    }
                }
            })
            .map_err(LprofError::Launch)?;
        AttachMode::Async(std::fs::File::from(write_end))
    } else {
        AttachMode::Sync(attacher.clone())
    };

    spawn_user_guided(options.user_guided, control);

    // Root thread counters, then let the child exec.
    attach_mode.add(pid as i32);
    ptrace::cont(root, None).map_err(|e| LprofError::Trace(format!("cannot resume: {e}")))?;
    let started = Instant::now();
    process.release().map_err(LprofError::Launch)?;

    let mut alive: FxHashSet<i32> = FxHashSet::default();
    alive.insert(pid as i32);
    let finalize_signal = options.finalize_signal;

    loop {
        let status = match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
            Ok(status) => status,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(e) => return Err(LprofError::Trace(format!("waitpid failed: {e}"))),
        };
        match status {
            WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                attach_mode.remove(tid.as_raw());
                alive.remove(&tid.as_raw());
                if alive.is_empty() {
                    break;
                }
            }
            WaitStatus::PtraceEvent(tid, _, event) => {
                if matches!(
                    event,
                    libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE
                ) {
                    match ptrace::getevent(tid) {
                        Ok(new_tid) => {
                            let new_tid = new_tid as i32;
                            debug!("new task {new_tid} (from {tid})");
                            alive.insert(new_tid);
                            attach_mode.add(new_tid);
                        }
                        Err(e) => warn!("cannot read the new task id from {tid}: {e}"),
                    }
                }
                let _ = ptrace::cont(tid, None);
            }
            WaitStatus::Stopped(tid, signal) => {
                if signal == Signal::SIGSTOP || signal == Signal::SIGTRAP {
                    // Initial stop of a fresh clone, or event noise.
                    let _ = ptrace::cont(tid, None);
                } else if Some(signal as i32) == finalize_signal {
                    debug!("finalize signal observed, terminating the process group");
                    let _ = kill(Pid::from_raw(-(pid as i32)), Signal::SIGTERM);
                    let _ = ptrace::cont(tid, None);
                } else if LETHAL_SIGNALS.contains(&signal) {
                    warn!("task {tid} hit {signal:?}; removing it and preserving samples");
                    attach_mode.remove(tid.as_raw());
                    alive.remove(&tid.as_raw());
                    let _ = kill(tid, Signal::SIGKILL);
                    let _ = ptrace::cont(tid, None);
                    if alive.is_empty() {
                        break;
                    }
                } else {
                    // Ordinary signal: forward and continue.
                    let _ = ptrace::cont(tid, Some(signal));
                }
            }
            _ => {}
        }
    }
    let walltime_us = started.elapsed().as_micros() as u64;

    // Closing the async pipe stops the helper; pending requests drain
    // before the pool is torn down.
    drop(attach_mode);

    let stores = pool.finish();
    let _ = maps_listener.join();

    Ok(RunResult {
        root_pid: pid,
        stores,
        walltime_us,
    })
}
