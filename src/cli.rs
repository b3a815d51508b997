use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::engine::{EngineKind, UserGuided};
use crate::error::ConfigError;
use crate::perf::{preset_period, BacktraceMode};
use crate::report::FrameKind;

#[derive(Debug, Parser)]
#[command(
    name = "lprof",
    version,
    about = r#"
lprof is a sampling profiler: it records hardware-counter samples from a
command and its descendants into an experiment directory, then reports
per-thread function and loop coverage.

EXAMPLES:
    # Record with the default event pair:
    lprof record -o exp -- ./yourcommand yourargs

    # Record with a custom event list and small periods:
    lprof record -o exp --events cycles@500003,instructions@500003 -- ./cmd

    # Report the recorded experiment as JSON:
    lprof report exp
"#
)]
pub struct Opt {
    /// Verbose logging (equivalent to RUST_LOG=debug).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Record an experiment by sampling a command.
    Record(RecordArgs),

    /// Load an experiment and print the structured coverage report.
    Report(ReportArgs),

    /// Regenerate binary metadata for one process of an experiment.
    Metafile(MetafileArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EngineArg {
    Inherit,
    PtraceSync,
    PtraceAsync,
    Timers,
}

impl From<EngineArg> for EngineKind {
    fn from(value: EngineArg) -> EngineKind {
        match value {
            EngineArg::Inherit => EngineKind::Inherit,
            EngineArg::PtraceSync => EngineKind::PtraceSync,
            EngineArg::PtraceAsync => EngineKind::PtraceAsync,
            EngineArg::Timers => EngineKind::Timers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BacktraceArg {
    Off,
    Call,
    Stack,
    Branch,
}

impl From<BacktraceArg> for BacktraceMode {
    fn from(value: BacktraceArg) -> BacktraceMode {
        match value {
            BacktraceArg::Off => BacktraceMode::Off,
            BacktraceArg::Call => BacktraceMode::Call,
            BacktraceArg::Stack => BacktraceMode::Stack,
            BacktraceArg::Branch => BacktraceMode::Branch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    Binary,
    Library,
    System,
}

impl From<FilterArg> for FrameKind {
    fn from(value: FilterArg) -> FrameKind {
        match value {
            FilterArg::Binary => FrameKind::Binary,
            FilterArg::Library => FrameKind::Library,
            FilterArg::System => FrameKind::System,
        }
    }
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Experiment directory to create.
    #[arg(short = 'o', long, default_value = "lprof_exp")]
    pub experiment: PathBuf,

    /// Event list: NAME[@TYPE][-flag=value,...][@PERIOD], comma separated.
    #[arg(short, long)]
    pub events: Option<String>,

    /// Sampling period: a preset (xsmall, small, medium, default, big)
    /// or a literal number of events per sample.
    #[arg(short = 'g', long, default_value = "default")]
    pub period: String,

    /// Engine flavour.
    #[arg(long, value_enum, default_value_t = EngineArg::Inherit)]
    pub engine: EngineArg,

    /// What to attach to each sample (btm).
    #[arg(long = "btm", value_enum, default_value_t = BacktraceArg::Call)]
    pub backtrace: BacktraceArg,

    /// -1 starts sampling immediately, 0 toggles on SIGUSR1, a positive
    /// value delays the start by that many seconds.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub user_guided: i64,

    /// Pin the target to these CPUs, e.g. "0,2,4".
    #[arg(long)]
    pub cpu_list: Option<String>,

    /// Real target binary when the command is a launcher (MPI driver).
    #[arg(long)]
    pub mpi_target: Option<String>,

    /// Drainer worker threads.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Signal number that terminates the whole process group (ptrace
    /// flavours only).
    #[arg(long)]
    pub finalize_signal: Option<i32>,

    /// Memory-mode sample buffer, in MB.
    #[arg(long, default_value_t = 1024)]
    pub max_buf_mb: usize,

    /// File-mode sample buffer, in MB.
    #[arg(long, default_value_t = 20)]
    pub files_buf_mb: usize,

    /// Total spill-file budget before the emergency stop, in MB.
    #[arg(long, default_value_t = 20480)]
    pub max_files_mb: u64,

    /// Command to profile.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

impl RecordArgs {
    pub fn parsed_period(&self) -> Result<u64, ConfigError> {
        if let Some(period) = preset_period(&self.period) {
            return Ok(period);
        }
        self.period
            .parse()
            .map_err(|_| ConfigError::BadPeriod(self.period.clone()))
    }

    pub fn parsed_cpu_list(&self) -> Result<Option<Vec<u32>>, ConfigError> {
        let Some(list) = &self.cpu_list else {
            return Ok(None);
        };
        let mut cpus = Vec::new();
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            // Ranges like 0-3 are accepted alongside single CPUs.
            if let Some((low, high)) = token.split_once('-') {
                let low: u32 = low
                    .parse()
                    .map_err(|_| ConfigError::BadCpuList(list.clone()))?;
                let high: u32 = high
                    .parse()
                    .map_err(|_| ConfigError::BadCpuList(list.clone()))?;
                if low > high {
                    return Err(ConfigError::BadCpuList(list.clone()));
                }
                cpus.extend(low..=high);
            } else {
                cpus.push(
                    token
                        .parse()
                        .map_err(|_| ConfigError::BadCpuList(list.clone()))?,
                );
            }
        }
        if cpus.is_empty() {
            return Err(ConfigError::BadCpuList(list.clone()));
        }
        cpus.sort_unstable();
        cpus.dedup();
        Ok(Some(cpus))
    }

    pub fn user_guided(&self) -> UserGuided {
        UserGuided::from_raw(self.user_guided)
    }

    /// A single quoted command word is split shell-style.
    pub fn command_line(&self) -> Vec<String> {
        if self.command.len() == 1 && self.command[0].contains(' ') {
            if let Some(split) = shlex::split(&self.command[0]) {
                return split;
            }
        }
        self.command.clone()
    }
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Experiment directory to load.
    pub experiment: PathBuf,

    /// Skip the per-thread function tables.
    #[arg(long)]
    pub no_functions: bool,

    /// Skip the per-thread loop tables.
    #[arg(long)]
    pub no_loops: bool,

    /// Drop call-chain frames whose kind exceeds this.
    #[arg(long, value_enum, default_value_t = FilterArg::System)]
    pub callchain_filter: FilterArg,

    /// Nominal CPU frequency in Hz.
    #[arg(long, default_value_t = 2.0e9)]
    pub cpu_freq: f64,

    /// Reference (TSC) frequency in Hz.
    #[arg(long, default_value_t = 2.0e9)]
    pub ref_freq: f64,

    /// Sampling period the experiment was recorded with.
    #[arg(short = 'g', long, default_value = "default")]
    pub period: String,

    /// The experiment was recorded with the timers engine.
    #[arg(long)]
    pub timer: bool,

    /// The experiment was recorded with a custom event list.
    #[arg(long)]
    pub custom_events: bool,

    /// Include raw sample counts in the display strings.
    #[arg(long)]
    pub show_samples: bool,

    /// Extended per-event columns.
    #[arg(long)]
    pub extended: bool,

    /// Extra library category, LIB=CATEGORY (repeatable).
    #[arg(long = "extra-lib")]
    pub extra_libs: Vec<String>,
}

impl ReportArgs {
    pub fn parsed_period(&self) -> Result<u64, ConfigError> {
        if let Some(period) = preset_period(&self.period) {
            return Ok(period);
        }
        self.period
            .parse()
            .map_err(|_| ConfigError::BadPeriod(self.period.clone()))
    }
}

#[derive(Debug, Args)]
pub struct MetafileArgs {
    /// Experiment directory.
    pub experiment: PathBuf,

    /// Node directory inside the experiment (defaults to the current
    /// hostname's).
    #[arg(long)]
    pub node: Option<PathBuf>,

    /// Process id whose metadata to generate.
    #[arg(short, long)]
    pub pid: u32,

    /// Target executable path.
    #[arg(long)]
    pub exe: String,

    /// Libraries to disassemble in full (repeatable).
    #[arg(long = "disass")]
    pub disass_list: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_presets_and_literals() {
        let args = |p: &str| RecordArgs {
            experiment: "exp".into(),
            events: None,
            period: p.into(),
            engine: EngineArg::Inherit,
            backtrace: BacktraceArg::Call,
            user_guided: -1,
            cpu_list: None,
            mpi_target: None,
            workers: 4,
            finalize_signal: None,
            max_buf_mb: 1024,
            files_buf_mb: 20,
            max_files_mb: 20480,
            command: vec!["true".into()],
        };
        assert_eq!(args("xsmall").parsed_period().unwrap(), 250_003);
        assert_eq!(args("123457").parsed_period().unwrap(), 123_457);
        assert!(args("tiny").parsed_period().is_err());
    }

    #[test]
    fn cpu_lists_accept_ranges() {
        let mut args = RecordArgs {
            experiment: "exp".into(),
            events: None,
            period: "default".into(),
            engine: EngineArg::Inherit,
            backtrace: BacktraceArg::Call,
            user_guided: -1,
            cpu_list: Some("0,2-4,2".into()),
            mpi_target: None,
            workers: 4,
            finalize_signal: None,
            max_buf_mb: 1024,
            files_buf_mb: 20,
            max_files_mb: 20480,
            command: vec!["true".into()],
        };
        assert_eq!(args.parsed_cpu_list().unwrap(), Some(vec![0, 2, 3, 4]));
        args.cpu_list = Some("4-2".into());
        assert!(args.parsed_cpu_list().is_err());
    }

    #[test]
    fn quoted_commands_are_split() {
        let args = RecordArgs {
            experiment: "exp".into(),
            events: None,
            period: "default".into(),
            engine: EngineArg::Inherit,
            backtrace: BacktraceArg::Call,
            user_guided: -1,
            cpu_list: None,
            mpi_target: None,
            workers: 4,
            finalize_signal: None,
            max_buf_mb: 1024,
            files_buf_mb: 20,
            max_files_mb: 20480,
            command: vec!["./busy --seconds 1".into()],
        };
        assert_eq!(
            args.command_line(),
            vec!["./busy".to_string(), "--seconds".into(), "1".into()]
        );
    }
}
