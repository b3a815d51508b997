use std::collections::BTreeMap;

use serde_derive::Serialize;

/// The language-neutral result tree handed to the front-end:
/// `context → node → process → thread`, with pre-formatted display
/// strings at the leaves.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentTree {
    pub experiment: String,
    pub event_list: String,
    pub event_names: Vec<String>,
    pub executable_function_count: usize,
    pub executable_loop_count: usize,
    pub nodes: Vec<NodeTree>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeTree {
    pub name: String,
    pub rank: u32,
    pub processes: Vec<ProcessTree>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessTree {
    pub pid: u32,
    pub rank: u32,
    pub libraries: Vec<String>,
    pub threads: Vec<ThreadTree>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadTree {
    pub tid: u64,
    pub rank: u32,
    /// Leader-event samples of this thread.
    pub sample_count: u64,
    pub time_seconds: f64,
    pub functions: Vec<HotspotEntry>,
    pub loops: Vec<HotspotEntry>,
    pub categories: BTreeMap<String, u64>,
    pub libc_categories: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotspotEntry {
    pub name: String,
    pub module: String,
    /// Pre-formatted display line.
    pub display: String,
    /// Per-event hit counts, leader first.
    pub counts: Vec<u64>,
    pub time_percent: f64,
    /// Chain display string → percentage of this hotspot's chain hits.
    pub callchains: BTreeMap<String, f64>,
}
