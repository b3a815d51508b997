pub mod drainer;
pub mod inherit;
pub mod process;
pub mod ptrace;
pub mod timers;
pub mod unwind;

use std::fs;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::signal::Signal;
use parking_lot::Mutex;

use crate::error::{ConfigError, CounterError, LprofError};
use crate::experiment::layout::{write_processes_index, ExperimentLayout};
use crate::metafile::writer::{generate_metafile, write_walltime_uarch, MetafileRequest};
use crate::metafile::ElfSymbolProvider;
use crate::perf::counter::paranoid_level;
use crate::perf::event_spec::{parse_event_list, DEFAULT_SAMPLING_PERIOD};
use crate::perf::group::plan_events;
use crate::perf::sys::{PERF_EVENT_IOC_DISABLE, PERF_EVENT_IOC_ENABLE};
use crate::perf::BacktraceMode;
use crate::store::{dump_stores, DumpInput, SpillAccounting, StoreConfig, WorkerStore};

/// The four engine flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Inherit,
    PtraceSync,
    PtraceAsync,
    Timers,
}

/// When sampling starts: immediately, after a delay, or toggled by the
/// pause/resume signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserGuided {
    Immediate,
    Interactive,
    Delay(u64),
}

impl UserGuided {
    /// `-1` = immediate, `0` = interactive, positive = delay seconds.
    pub fn from_raw(value: i64) -> Self {
        match value {
            v if v < 0 => UserGuided::Immediate,
            0 => UserGuided::Interactive,
            v => UserGuided::Delay(v as u64),
        }
    }
}

/// The pause/resume toggle signal of interactive mode.
pub const TOGGLE_SIGNAL: Signal = Signal::SIGUSR1;

#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub command: Vec<String>,
    pub experiment_path: PathBuf,
    /// Default period for events without an explicit `@PERIOD`.
    pub period: Option<u64>,
    /// Event list; `None` selects the default cycles+instructions pair.
    pub events: Option<String>,
    pub user_guided: UserGuided,
    pub backtrace_mode: BacktraceMode,
    pub cpu_list: Option<Vec<u32>>,
    /// Real target binary when the command is a launcher (MPI driver).
    pub mpi_target: Option<String>,
    pub worker_count: usize,
    pub engine: EngineKind,
    pub finalize_signal: Option<i32>,
    pub verbose: bool,
    pub max_buf_mb: usize,
    pub files_buf_mb: usize,
    pub max_files_mb: u64,
}

impl SampleOptions {
    pub fn new(command: Vec<String>, experiment_path: impl Into<PathBuf>) -> Self {
        SampleOptions {
            command,
            experiment_path: experiment_path.into(),
            period: None,
            events: None,
            user_guided: UserGuided::Immediate,
            backtrace_mode: BacktraceMode::Call,
            cpu_list: None,
            mpi_target: None,
            worker_count: 4,
            engine: EngineKind::Inherit,
            finalize_signal: None,
            verbose: false,
            max_buf_mb: 1024,
            files_buf_mb: 20,
            max_files_mb: 20 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub pid: u32,
    pub hostname: String,
    pub emergency_stop: bool,
    pub collected: u64,
    pub lost: u64,
}

/// What a flavour returns to the shared teardown.
pub struct RunResult {
    pub root_pid: u32,
    pub stores: Vec<WorkerStore>,
    pub walltime_us: u64,
}

/// Shared enable/disable control for the user-guided helper: a live fd
/// list (ptrace adds and removes descriptors at runtime) plus the
/// `start_enabled` flag new groups consult.
pub struct GroupControl {
    fds: Mutex<Vec<RawFd>>,
    start_enabled: AtomicBool,
}

impl GroupControl {
    pub fn new(start_enabled: bool) -> Self {
        GroupControl {
            fds: Mutex::new(Vec::new()),
            start_enabled: AtomicBool::new(start_enabled),
        }
    }

    pub fn register(&self, fds: &[RawFd]) {
        self.fds.lock().extend_from_slice(fds);
    }

    pub fn unregister(&self, fds: &[RawFd]) {
        self.fds.lock().retain(|fd| !fds.contains(fd));
    }

    pub fn is_enabled(&self) -> bool {
        self.start_enabled.load(Ordering::SeqCst)
    }

    fn apply(&self, op: libc::c_ulong) {
        for &fd in self.fds.lock().iter() {
            // A descriptor may have been closed by a concurrent thread
            // removal; EBADF is harmless here.
            unsafe { libc::ioctl(fd, op as _) };
        }
    }

    pub fn enable_all(&self) {
        self.start_enabled.store(true, Ordering::SeqCst);
        self.apply(PERF_EVENT_IOC_ENABLE);
    }

    pub fn disable_all(&self) {
        self.start_enabled.store(false, Ordering::SeqCst);
        self.apply(PERF_EVENT_IOC_DISABLE);
    }
}

/// Spawns the user-guided helper task. Immediate mode needs none;
/// delayed mode sleeps then enables; interactive mode waits on the
/// toggle signal and alternates, one log line per toggle.
pub fn spawn_user_guided(mode: UserGuided, control: Arc<GroupControl>) {
    match mode {
        UserGuided::Immediate => {}
        UserGuided::Delay(seconds) => {
            std::thread::Builder::new()
                .name("lprof-guided".into())
                .spawn(move || {
                    std::thread::sleep(Duration::from_secs(seconds));
                    control.enable_all();
                    info!("sampling enabled after {seconds}s delay");
                })
                .expect("cannot spawn the user-guided helper");
        }
        UserGuided::Interactive => {
            let mut set = nix::sys::signal::SigSet::empty();
            set.add(TOGGLE_SIGNAL);
            // Block the toggle signal process-wide so only the helper's
            // sigwait sees it.
            let _ = nix::sys::signal::pthread_sigmask(
                nix::sys::signal::SigmaskHow::SIG_BLOCK,
                Some(&set),
                None,
            );
            std::thread::Builder::new()
                .name("lprof-guided".into())
                .spawn(move || loop {
                    if set.wait().is_err() {
                        return;
                    }
                    if control.is_enabled() {
                        control.disable_all();
                        info!("sampling paused");
                    } else {
                        control.enable_all();
                        info!("sampling resumed");
                    }
                })
                .expect("cannot spawn the user-guided helper");
        }
    }
}

struct SessionState {
    experiment_path: PathBuf,
    target: i32,
    kill_process_group: bool,
}

static SESSION: Mutex<Option<SessionState>> = Mutex::new(None);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs the single termination handler of the engine: kill the
/// target (process group for the ptrace flavour), write the `done`
/// marker, exit. No in-flight sample is flushed.
fn install_termination_handler() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let result = ctrlc::set_handler(|| {
        if let Some(session) = SESSION.lock().take() {
            if session.target > 0 {
                let target = if session.kill_process_group {
                    -session.target
                } else {
                    session.target
                };
                unsafe { libc::kill(target, libc::SIGKILL) };
            }
            let _ = fs::write(session.experiment_path.join("done"), b"");
        }
        std::process::exit(1);
    });
    if let Err(e) = result {
        warn!("cannot install the termination handler: {e}");
    }
}

fn register_session(experiment_path: PathBuf, kill_process_group: bool) {
    *SESSION.lock() = Some(SessionState {
        experiment_path,
        target: 0,
        kill_process_group,
    });
}

pub(crate) fn set_session_target(pid: u32) {
    if let Some(session) = SESSION.lock().as_mut() {
        session.target = pid as i32;
    }
}

fn clear_session() {
    *SESSION.lock() = None;
}

fn hostname() -> String {
    uname::uname()
        .map(|info| info.nodename)
        .unwrap_or_else(|_| "localhost".to_string())
}

fn uarch_code() -> u32 {
    let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") else {
        return 0;
    };
    for line in cpuinfo.lines() {
        if let Some(rest) = line.strip_prefix("model") {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix(':') {
                if let Ok(model) = value.trim().parse() {
                    return model;
                }
            }
        }
    }
    0
}

fn write_system_map(node_dir: &std::path::Path) {
    let Ok(kallsyms) = fs::read("/proc/kallsyms") else {
        return;
    };
    // Under a restrictive paranoid level every address reads as zero;
    // an all-zero map is useless.
    if kallsyms
        .split(|&b| b == b'\n')
        .take(64)
        .all(|line| line.starts_with(b"0000000000000000") || line.is_empty())
    {
        return;
    }
    let _ = fs::write(node_dir.join("system_map"), kallsyms);
}

pub(crate) fn default_event_list(period: u64) -> String {
    format!("cycles@{period},instructions@{period}")
}

fn validate_cpu_list(cpu_list: &Option<Vec<u32>>) -> Result<(), ConfigError> {
    if let Some(cpus) = cpu_list {
        let available = num_cpus::get() as u32;
        if cpus.is_empty() {
            return Err(ConfigError::BadCpuList("empty".to_string()));
        }
        for &cpu in cpus {
            if cpu >= available {
                return Err(ConfigError::BadCpuList(format!(
                    "cpu {cpu} out of range (0..{available})"
                )));
            }
        }
    }
    Ok(())
}

/// Drives one collection run end to end: validates the configuration,
/// resolves the counter session plan, runs the selected engine flavour,
/// then dumps stores, writes the per-node index and metadata, and
/// reports losses.
pub fn sample(options: SampleOptions) -> Result<SampleOutcome, LprofError> {
    if options.command.is_empty() {
        return Err(ConfigError::EmptyCommand.into());
    }
    validate_cpu_list(&options.cpu_list)?;
    let period = options.period.unwrap_or(DEFAULT_SAMPLING_PERIOD);
    let event_list_text = options
        .events
        .clone()
        .unwrap_or_else(|| default_event_list(period));
    let specs = parse_event_list(&event_list_text, period)?;
    if options.verbose {
        info!("sampling {event_list_text} with default period {period}");
    }

    if options.engine != EngineKind::Timers {
        if let Some(level) = paranoid_level() {
            if level >= 2 {
                return Err(CounterError::ParanoidLevel(level).into());
            }
        }
    }

    let hostname = hostname();
    let layout = ExperimentLayout::new(&options.experiment_path);
    let node_dir = layout.node_dir(&hostname);
    fs::create_dir_all(&node_dir).map_err(|e| LprofError::io(&node_dir, e))?;

    // Dry runs happen against our own process, before any fork.
    let plan = if options.engine == EngineKind::Timers {
        None
    } else {
        Some(plan_events(specs.clone(), options.backtrace_mode, 0)?)
    };

    install_termination_handler();
    register_session(
        options.experiment_path.clone(),
        matches!(
            options.engine,
            EngineKind::PtraceSync | EngineKind::PtraceAsync
        ),
    );

    let accounting = Arc::new(SpillAccounting::new(options.max_files_mb << 20));
    let store_config = StoreConfig {
        events_per_group: specs.len(),
        max_buf_bytes: options.max_buf_mb << 20,
        files_buf_bytes: options.files_buf_mb << 20,
    };

    let sample_masks = match &plan {
        Some(plan) => vec![plan.sample_type; plan.events_per_group()],
        None => vec![0; specs.len()],
    };

    let run = match options.engine {
        EngineKind::Inherit => inherit::run(
            &options,
            plan.as_ref().unwrap(),
            &layout,
            &hostname,
            accounting.clone(),
            store_config,
        )?,
        EngineKind::PtraceSync | EngineKind::PtraceAsync => ptrace::run(
            &options,
            Arc::new(plan.unwrap()),
            &layout,
            &hostname,
            accounting.clone(),
            store_config,
            options.engine == EngineKind::PtraceAsync,
        )?,
        EngineKind::Timers => timers::run(
            &options,
            &layout,
            &hostname,
            period,
            accounting.clone(),
            store_config,
        )?,
    };

    // Final dump, strictly after every drainer worker has exited.
    let input = DumpInput {
        event_names: specs.iter().map(|s| s.name.clone()).collect(),
        event_list: event_list_text,
        sample_masks,
    };
    let report = dump_stores(run.stores, &accounting, &layout, &hostname, &input)?;
    drainer::report_loss(report.stats.collected, report.stats.lost);

    write_processes_index(&node_dir, &report.pids)
        .map_err(|e| LprofError::io(&node_dir, e))?;
    write_system_map(&node_dir);

    let uarch = uarch_code();
    let mut disassembler = ElfSymbolProvider;
    for &pid in &report.pids {
        let request = MetafileRequest {
            experiment_path: options.experiment_path.clone(),
            node_path: node_dir.clone(),
            pid,
            exe_name: options
                .mpi_target
                .clone()
                .unwrap_or_else(|| options.command[0].clone()),
            disass_list: Vec::new(),
        };
        if let Err(e) = generate_metafile(&request, &mut disassembler) {
            warn!("metadata generation failed for pid {pid}: {e}");
        }
        let process_dir = layout.process_dir(&hostname, pid);
        if let Err(e) = write_walltime_uarch(&process_dir, run.walltime_us, uarch) {
            warn!("cannot write teardown scalars for pid {pid}: {e}");
        }
    }

    let emergency_stop = accounting.stopped();
    if emergency_stop {
        let _ = fs::write(layout.done_marker(), b"");
    }
    clear_session();

    debug!(
        "collection finished: {} sample(s), {} lost, {} process(es)",
        report.stats.collected,
        report.stats.lost,
        report.pids.len()
    );
    Ok(SampleOutcome {
        pid: run.root_pid,
        hostname,
        emergency_stop,
        collected: report.stats.collected,
        lost: report.stats.lost,
    })
}

/// Poll timeouts per flavour: the ptrace tracer needs to notice
/// add/remove requests faster than the inherit engine needs to notice
/// exit.
pub(crate) fn poll_timeout_ms(engine: EngineKind) -> i32 {
    match engine {
        EngineKind::PtraceSync | EngineKind::PtraceAsync => 100,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_guided_from_raw() {
        assert_eq!(UserGuided::from_raw(-1), UserGuided::Immediate);
        assert_eq!(UserGuided::from_raw(0), UserGuided::Interactive);
        assert_eq!(UserGuided::from_raw(30), UserGuided::Delay(30));
    }

    #[test]
    fn cpu_list_validation() {
        assert!(validate_cpu_list(&None).is_ok());
        assert!(validate_cpu_list(&Some(vec![0])).is_ok());
        assert!(validate_cpu_list(&Some(vec![])).is_err());
        assert!(validate_cpu_list(&Some(vec![100_000])).is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        let options = SampleOptions::new(vec![], "/tmp/exp");
        assert!(matches!(
            sample(options),
            Err(LprofError::Config(ConfigError::EmptyCommand))
        ));
    }

    #[test]
    fn group_control_tracks_registration() {
        let control = GroupControl::new(false);
        control.register(&[10, 11]);
        control.unregister(&[10]);
        assert!(!control.is_enabled());
        assert_eq!(control.fds.lock().as_slice(), &[11]);
    }
}
