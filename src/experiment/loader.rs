use std::fs;
use std::path::Path;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::error::ExperimentError;
use crate::metafile::binary_format::{read_metadata_file, BinaryMetadata};
use crate::metafile::maps::read_lib_ranges;
use crate::store::ip_events::{read_cpu_info_file, read_ip_events_file};
use crate::store::IpEvents;

use super::interval_tree::IntervalTree;
use super::kernel_symbols::{load_system_map, KernelSymbols};
use super::layout::read_processes_index;

/// Library index of kernel/system code in resolver results.
pub const SYSTEM_LIBRARY_INDEX: i32 = -2;
/// Library index of the executable itself.
pub const BINARY_LIBRARY_INDEX: i32 = -1;

/// Function/loop interval trees for one binary, keyed by range start;
/// multi-part records insert one node per part, all carrying the same
/// record index.
#[derive(Debug, Clone, Default)]
pub struct AddressTrees {
    pub functions: IntervalTree<usize>,
    pub loops: IntervalTree<usize>,
}

pub fn build_trees(metadata: &BinaryMetadata) -> AddressTrees {
    let mut trees = AddressTrees::default();
    for (index, function) in metadata.functions.iter().enumerate() {
        for &(start, stop) in &function.ranges {
            if start <= stop {
                trees.functions.insert(start, stop, index);
            }
        }
    }
    for (index, l) in metadata.loops.iter().enumerate() {
        for &(start, stop) in &l.ranges {
            if start <= stop {
                trees.loops.insert(start, stop, index);
            }
        }
    }
    trees
}

#[derive(Debug, Clone)]
pub struct Library {
    /// Basename, as materialized under `<node>/libs/`.
    pub name: String,
    pub metadata: BinaryMetadata,
    pub trees: AddressTrees,
    /// Per-process `[start, stop]` mapped windows.
    pub ranges_by_process: FxHashMap<u32, (u64, u64)>,
}

#[derive(Debug, Clone)]
pub struct Thread {
    pub tid: u64,
    pub rank: u32,
    pub entries: Vec<(u64, IpEvents)>,
    pub cpu_fractions: Vec<(u32, f64)>,
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: u32,
    pub rank: u32,
    pub binary_offset: u64,
    pub walltime_us: Option<u64>,
    pub threads: Vec<Thread>,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub rank: u32,
    pub libraries: Vec<Library>,
    pub kernel: Option<KernelSymbols>,
    pub processes: Vec<Process>,
}

/// The fully reconstructed experiment:
/// `Experiment → Node → Process → Thread`.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub major: u32,
    pub minor: u32,
    pub executable: BinaryMetadata,
    pub exe_trees: AddressTrees,
    pub event_names: Vec<String>,
    pub event_list: String,
    pub nodes: Vec<Node>,
}

fn read_binary_offset(process_dir: &Path, major: u32, minor: u32) -> u64 {
    let path = process_dir.join("binary_offset.lprof");
    match fs::read_to_string(&path) {
        Ok(text) => match text.trim().parse() {
            Ok(offset) => offset,
            Err(_) => {
                warn!("unparsable {}, assuming binary_offset = 0", path.display());
                0
            }
        },
        Err(_) => {
            // Version 2.0 experiments predate this file; anything newer
            // should have written it.
            if (major, minor) >= (2, 1) {
                warn!("missing {}, assuming binary_offset = 0", path.display());
            }
            0
        }
    }
}

fn load_node(
    node_path: &Path,
    name: &str,
    rank: u32,
    major: u32,
    minor: u32,
) -> Result<Option<Node>, ExperimentError> {
    let index_path = node_path.join("processes_index.lua");
    let index = match read_processes_index(&index_path) {
        Ok(index) => index,
        Err(_) => {
            warn!("ignoring node directory {name}: processes_index.lua not found");
            return Ok(None);
        }
    };
    let mut seen_ranks = std::collections::HashSet::new();
    for (_, &process_rank) in &index {
        if !seen_ranks.insert(process_rank) {
            return Err(ExperimentError::DuplicateRank {
                path: index_path,
                rank: process_rank,
            });
        }
    }

    // Library metadata, one file per unique basename.
    let mut libraries = Vec::new();
    let mut library_by_name: FxHashMap<String, usize> = FxHashMap::default();
    let libs_dir = node_path.join("libs");
    if let Ok(entries) = fs::read_dir(&libs_dir) {
        let mut paths: Vec<_> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();
        for path in paths {
            let file_name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let Some(basename) = file_name.strip_suffix(".lprof") else {
                continue;
            };
            match read_metadata_file(&path) {
                Ok((_, _, metadata)) => {
                    let trees = build_trees(&metadata);
                    library_by_name.insert(basename.to_string(), libraries.len());
                    libraries.push(Library {
                        name: basename.to_string(),
                        metadata,
                        trees,
                        ranges_by_process: FxHashMap::default(),
                    });
                }
                Err(e) => warn!("skipping library metadata {}: {e}", path.display()),
            }
        }
    }

    let kernel = match load_system_map(&node_path.join("system_map")) {
        Ok(symbols) => Some(symbols),
        Err(_) => None,
    };

    // Process directories are the numeric subdirectories.
    let mut pids: Vec<u32> = Vec::new();
    for entry in fs::read_dir(node_path)
        .map_err(|source| ExperimentError::Read {
            path: node_path.to_path_buf(),
            source,
        })?
        .flatten()
    {
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(pid) = entry.file_name().to_string_lossy().parse() {
            pids.push(pid);
        }
    }
    pids.sort_unstable();

    let mut processes = Vec::new();
    for pid in pids {
        let process_dir = node_path.join(pid.to_string());
        let ip_events_path = process_dir.join("IP_events.lprof");
        let data = match read_ip_events_file(&ip_events_path) {
            Ok(data) => data,
            Err(e) => {
                warn!("ignoring process {pid}: {e}");
                continue;
            }
        };
        let process_rank = match index.get(&pid) {
            Some(&rank) => rank,
            None => {
                warn!("pid {pid} missing from processes_index.lua, appending");
                index.len() as u32 + processes.len() as u32
            }
        };

        let cpu_fractions = read_cpu_info_file(&process_dir.join("cpu_id.info"))
            .unwrap_or_default();
        let cpu_by_tid: FxHashMap<u64, Vec<(u32, f64)>> = cpu_fractions.into_iter().collect();

        let mut threads = Vec::with_capacity(data.threads.len());
        for (thread_rank, thread) in data.threads.into_iter().enumerate() {
            threads.push(Thread {
                tid: thread.tid,
                rank: thread_rank as u32,
                entries: thread.entries,
                cpu_fractions: cpu_by_tid.get(&thread.tid).cloned().unwrap_or_default(),
            });
        }

        // Per-process library windows.
        match read_lib_ranges(&process_dir.join("lib_ranges.lprof")) {
            Ok(ranges) => {
                for range in ranges {
                    let basename = Path::new(&range.name)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| range.name.clone());
                    let library_index = match library_by_name.get(&basename) {
                        Some(&index) => index,
                        None => {
                            // Mapped but never materialized: keep an
                            // empty model so addresses in its window
                            // still attribute to the library.
                            debug!("no metadata for {basename}, keeping an empty model");
                            library_by_name.insert(basename.clone(), libraries.len());
                            libraries.push(Library {
                                name: basename.clone(),
                                metadata: BinaryMetadata::default(),
                                trees: AddressTrees::default(),
                                ranges_by_process: FxHashMap::default(),
                            });
                            libraries.len() - 1
                        }
                    };
                    libraries[library_index]
                        .ranges_by_process
                        .insert(pid, (range.start, range.stop));
                }
            }
            Err(e) => warn!("no lib_ranges.lprof for pid {pid}: {e}"),
        }

        let walltime_us = fs::read_to_string(process_dir.join("walltime"))
            .ok()
            .and_then(|t| t.trim().parse().ok());

        processes.push(Process {
            pid,
            rank: process_rank,
            binary_offset: read_binary_offset(&process_dir, major, minor),
            walltime_us,
            threads,
        });
    }
    processes.sort_by_key(|p| p.rank);

    Ok(Some(Node {
        name: name.to_string(),
        rank,
        libraries,
        kernel,
        processes,
    }))
}

/// Loads a persisted experiment. Running the loader twice yields
/// identical structured results: discovery is sorted, ranks come from
/// the persisted index, and thread ranks from file order.
pub fn load_experiment(experiment_path: &Path) -> Result<Experiment, ExperimentError> {
    let binary_path = super::layout::ExperimentLayout::new(experiment_path).binary_metadata();
    let (major, minor, executable) = read_metadata_file(&binary_path)?;
    debug!("experiment format {major}.{minor}");
    let exe_trees = build_trees(&executable);

    let mut node_names: Vec<String> = Vec::new();
    for entry in fs::read_dir(experiment_path)
        .map_err(|source| ExperimentError::Read {
            path: experiment_path.to_path_buf(),
            source,
        })?
        .flatten()
    {
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "html" {
            continue;
        }
        node_names.push(name);
    }
    node_names.sort();

    let mut nodes = Vec::new();
    for name in &node_names {
        if let Some(node) = load_node(
            &experiment_path.join(name),
            name,
            nodes.len() as u32,
            major,
            minor,
        )? {
            nodes.push(node);
        }
    }
    if nodes.is_empty() {
        return Err(ExperimentError::NoNodes(experiment_path.to_path_buf()));
    }

    // The event header is identical in every process of a run; take the
    // first.
    let (event_names, event_list) = nodes
        .iter()
        .find(|n| !n.processes.is_empty())
        .and_then(|node| {
            let process = &node.processes[0];
            let path = experiment_path
                .join(&node.name)
                .join(process.pid.to_string())
                .join("IP_events.lprof");
            read_ip_events_file(&path)
                .ok()
                .map(|d| (d.event_names, d.event_list))
        })
        .unwrap_or_default();

    Ok(Experiment {
        major,
        minor,
        executable,
        exe_trees,
        event_names,
        event_list,
        nodes,
    })
}
