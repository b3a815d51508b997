use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors detected while validating user input, before any child process
/// is forked.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown event name: {0}")]
    BadEvent(String),

    #[error("Bad flag in event element \"{0}\": {1}")]
    BadFlag(String, String),

    #[error("Bad sampling period \"{0}\"")]
    BadPeriod(String),

    #[error("Uncore event {0} cannot be sampled; use the probe-based counting library instead")]
    UncoreEvent(String),

    #[error("Empty event list")]
    EmptyEventList,

    #[error("Bad CPU list \"{0}\"")]
    BadCpuList(String),

    #[error("Empty command line")]
    EmptyCommand,

    #[error("Bad signal number {0}")]
    BadSignal(i32),
}

/// Kernel refusals and perf-counter failures.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("perf_event_open failed for event {event}: {source}")]
    Open {
        event: String,
        #[source]
        source: io::Error,
    },

    #[error(
        "/proc/sys/kernel/perf_event_paranoid is set to {0}; hardware-counter sampling needs 1 or less.\n\
         \x20 2: no measurements allowed for unprivileged users\n\
         \x20 1: kernel profiling disallowed, user measurements allowed\n\
         \x20 0: kernel profiling allowed\n\
         \x20-1: no restrictions\n\
         You can run: echo '1' | sudo tee /proc/sys/kernel/perf_event_paranoid"
    )]
    ParanoidLevel(i32),

    #[error("Cannot mmap the ring buffer for event {event}: {source}")]
    Mmap {
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("ioctl({op}) failed on event {event}: {source}")]
    Ioctl {
        op: &'static str,
        event: String,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read counter value for event {event}: {source}")]
    Read {
        event: String,
        #[source]
        source: io::Error,
    },
}

/// Sample-store failures (spill files, merge).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Cannot write spill file {path}: {source}")]
    Spill {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read back spill file {path}: {source}")]
    SpillRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Merged record for pid {pid} tid {tid} ip {ip:#x} exceeds the 1 GiB merge-buffer ceiling")]
    MergeRecordTooLarge { pid: u32, tid: u32, ip: u64 },

    #[error("Cannot write {path}: {source}")]
    Dump {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Metafile-writer failures.
#[derive(Debug, Error)]
pub enum MetafileError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a valid object file: {reason}")]
    InvalidObject { path: PathBuf, reason: String },

    #[error("No maps snapshot found for pid {0}")]
    NoMapsSnapshot(u32),
}

/// Experiment-loader failures.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("{path} does not start with the <LPROF> magic")]
    BadMagic { path: PathBuf },

    #[error("{path} has unsupported major version {major} (need 2 or newer)")]
    UnsupportedVersion { path: PathBuf, major: u32 },

    #[error("{path} is truncated or corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No node directory found in {0}")]
    NoNodes(PathBuf),

    #[error("Duplicate rank {rank} in {path}")]
    DuplicateRank { path: PathBuf, rank: u32 },
}

#[derive(Debug, Error)]
pub enum LprofError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Metafile(#[from] MetafileError),

    #[error(transparent)]
    Experiment(#[from] ExperimentError),

    #[error("Cannot launch target process: {0}")]
    Launch(#[source] io::Error),

    #[error("Tracer failure: {0}")]
    Trace(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LprofError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        LprofError::Io {
            path: path.into(),
            source,
        }
    }
}
