//! lprof: a sampling profiler engine.
//!
//! The crate drives the kernel perf-event subsystem to collect
//! instruction-pointer samples (and optional call chains) from a target
//! process tree, persists them into per-node experiment directories,
//! and aggregates them against function/loop metadata into per-thread
//! hotspot coverage reports.
//!
//! Three entry points cover the collect/report lifecycle:
//! [`sample`] records an experiment, [`prepare_sampling_display`]
//! turns a persisted experiment into the structured result tree, and
//! [`generate_metafile`] writes per-process binary metadata.

pub mod cli;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod metafile;
pub mod perf;
pub mod report;
pub mod store;

pub use engine::{sample, EngineKind, SampleOptions, SampleOutcome, UserGuided};
pub use error::LprofError;
pub use experiment::load_experiment;
pub use metafile::{generate_metafile, Disassembler, ElfSymbolProvider, MetafileRequest};
pub use perf::BacktraceMode;
pub use report::{prepare_sampling_display, DisplayContext, ExperimentTree, FrameKind, HwcMode};
