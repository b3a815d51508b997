pub mod callchain;
pub mod categorize;
pub mod resolver;
pub mod tree;

use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use log::debug;
use rustc_hash::FxHashMap;

use crate::error::LprofError;
use crate::experiment::loader::{load_experiment, Experiment, Node, Process, Thread};

pub use callchain::{format_chain, ChainTable, FrameKind};
pub use categorize::{Attribution, Category, LibcCategory, CATEGORY_COUNT, LIBC_CATEGORY_NAMES};
pub use resolver::{LoopPlace, Resolution, Resolver, ResolverConfig};
pub use tree::{ExperimentTree, HotspotEntry, NodeTree, ProcessTree, ThreadTree};

use categorize::{categorize_binary_function, categorize_non_binary};

/// How the experiment was sampled, which decides how hit counts become
/// seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwcMode {
    /// Default event list: leader counts cycles, time = hits × period / ref_freq.
    DefaultEvents,
    /// User event list: same arithmetic, leader semantics unknown.
    CustomEvents,
    /// Timers engine: the period is a tick length in nanoseconds.
    Timer,
}

#[derive(Debug, Clone)]
pub struct DisplayContext {
    pub experiment_path: PathBuf,
    pub display_functions: bool,
    pub display_loops: bool,
    pub callchain_filter: FrameKind,
    pub hwc_mode: HwcMode,
    /// Hz.
    pub cpu_freq: f64,
    /// Hz.
    pub ref_freq: f64,
    pub sampling_period: u64,
    pub show_sample_values: bool,
    pub extended_mode: bool,
    /// Library basename → extra category name.
    pub extra_category_libs: IndexMap<String, String>,
    pub resolver: ResolverConfig,
}

impl DisplayContext {
    pub fn new(experiment_path: impl Into<PathBuf>) -> Self {
        DisplayContext {
            experiment_path: experiment_path.into(),
            display_functions: true,
            display_loops: true,
            callchain_filter: FrameKind::System,
            hwc_mode: HwcMode::DefaultEvents,
            cpu_freq: 2.0e9,
            ref_freq: 2.0e9,
            sampling_period: crate::perf::DEFAULT_SAMPLING_PERIOD,
            show_sample_values: false,
            extended_mode: false,
            extra_category_libs: IndexMap::new(),
            resolver: ResolverConfig::default(),
        }
    }

    fn time_seconds(&self, leader_hits: u64) -> f64 {
        match self.hwc_mode {
            HwcMode::Timer => leader_hits as f64 * self.sampling_period as f64 / 1e9,
            _ => leader_hits as f64 * self.sampling_period as f64 / self.ref_freq,
        }
    }
}

struct ThreadAggregation {
    functions: FxHashMap<Resolution, Vec<u64>>,
    chains: FxHashMap<Resolution, ChainTable>,
    loops: FxHashMap<LoopPlace, Vec<u64>>,
    categories: [u64; CATEGORY_COUNT],
    extras: Vec<u64>,
    libc: [u64; 4],
    totals: Vec<u64>,
}

impl ThreadAggregation {
    fn new(events_per_group: usize, extra_count: usize) -> Self {
        ThreadAggregation {
            functions: FxHashMap::default(),
            chains: FxHashMap::default(),
            loops: FxHashMap::default(),
            categories: [0; CATEGORY_COUNT],
            extras: vec![0; extra_count],
            libc: [0; 4],
            totals: vec![0; events_per_group],
        }
    }
}

fn resolution_name<'a>(experiment: &'a Experiment, node: &'a Node, place: Resolution) -> &'a str {
    match place {
        Resolution::BinaryFn(index) => &experiment.executable.functions[index].name,
        Resolution::LibraryFn { library, function } => {
            &node.libraries[library].metadata.functions[function].name
        }
        Resolution::Kernel(symbol) => &node.kernel.as_ref().unwrap().names[symbol],
        Resolution::Unknown => "Unknown functions",
    }
}

fn resolution_module<'a>(experiment_name: &'a str, node: &'a Node, place: Resolution) -> &'a str {
    match place {
        Resolution::BinaryFn(_) => experiment_name,
        Resolution::LibraryFn { library, .. } => &node.libraries[library].name,
        Resolution::Kernel(_) => "SYSTEM CALL",
        Resolution::Unknown => "unknown",
    }
}

fn frame_kind(place: Resolution) -> FrameKind {
    match place {
        Resolution::BinaryFn(_) => FrameKind::Binary,
        Resolution::LibraryFn { .. } => FrameKind::Library,
        Resolution::Kernel(_) => FrameKind::System,
        Resolution::Unknown => FrameKind::Library,
    }
}

fn aggregate_thread(
    experiment: &Experiment,
    resolver: &mut Resolver,
    process: &Process,
    thread: &Thread,
    extra_index: &IndexMap<String, usize>,
) -> ThreadAggregation {
    let events_per_group = experiment.event_names.len().max(1);
    let mut agg = ThreadAggregation::new(events_per_group, extra_index.len());

    for (ip, entry) in &thread.entries {
        let place = resolver.resolve_function(process, *ip);
        let leader_hits = entry.counts.first().copied().unwrap_or(0) as u64;

        let counts = agg
            .functions
            .entry(place)
            .or_insert_with(|| vec![0; events_per_group]);
        for (slot, &count) in counts.iter_mut().zip(entry.counts.iter()) {
            *slot += count as u64;
        }
        for (slot, &count) in agg.totals.iter_mut().zip(entry.counts.iter()) {
            *slot += count as u64;
        }

        if let Some(loop_place) = resolver.resolve_loop(process, *ip) {
            let counts = agg
                .loops
                .entry(loop_place)
                .or_insert_with(|| vec![0; events_per_group]);
            for (slot, &count) in counts.iter_mut().zip(entry.counts.iter()) {
                *slot += count as u64;
            }
        }

        // Chains feed both the per-hotspot tables and the
        // categorization refinement.
        let mut chain_libraries: Vec<String> = Vec::new();
        if !entry.chains.is_empty() {
            let table = agg.chains.entry(place).or_default();
            for chain in &entry.chains {
                table.add(&chain.frames, chain.hits as u64);
                for &frame in &chain.frames {
                    let frame_place = resolver.resolve_function(process, frame);
                    if frame_place == place {
                        continue;
                    }
                    if let Resolution::LibraryFn { library, .. } = frame_place {
                        let name = &resolver.node().libraries[library].name;
                        if !chain_libraries.iter().any(|n| n == name) {
                            chain_libraries.push(name.clone());
                        }
                    }
                }
            }
        }

        let chain_refs: Vec<&str> = chain_libraries.iter().map(|n| n.as_str()).collect();
        let attribution = match place {
            Resolution::BinaryFn(index) => Attribution::Fixed(categorize_binary_function(
                &experiment.executable.functions[index].name,
            )),
            Resolution::LibraryFn { library, function } => {
                let node = resolver.node();
                let library_name = node.libraries[library].name.clone();
                let function_name =
                    node.libraries[library].metadata.functions[function].name.clone();
                if categorize::is_libc_family(&library_name) {
                    let libc = categorize::libc_function_category(&function_name);
                    agg.libc[libc.index()] += 1;
                }
                categorize_non_binary(
                    Some(&library_name),
                    &function_name,
                    &chain_refs,
                    false,
                    extra_index,
                )
            }
            Resolution::Kernel(symbol) => {
                let name = resolver.node().kernel.as_ref().unwrap().names[symbol].clone();
                categorize_non_binary(None, &name, &chain_refs, true, extra_index)
            }
            Resolution::Unknown => Attribution::Fixed(Category::Other),
        };
        match attribution {
            Attribution::Fixed(category) => agg.categories[category.index()] += leader_hits,
            Attribution::Extra(index) => agg.extras[index] += leader_hits,
        }
    }

    agg
}

fn build_hotspot_entry(
    context: &DisplayContext,
    name: &str,
    module: &str,
    counts: Vec<u64>,
    total_leader: u64,
    chain_display: BTreeMap<String, f64>,
) -> Option<HotspotEntry> {
    let leader = counts.first().copied().unwrap_or(0);
    if leader == 0 || total_leader == 0 {
        return None;
    }
    let time_percent = leader as f64 * 100.0 / total_leader as f64;
    let mut display = format!("{time_percent:.2}% {name} [{module}]");
    if context.show_sample_values {
        display.push_str(&format!(" ({leader} samples)"));
    }
    if context.extended_mode && counts.len() > 1 {
        for (rank, &count) in counts.iter().enumerate().skip(1) {
            display.push_str(&format!(" e{rank}={count}"));
        }
    }
    Some(HotspotEntry {
        name: name.to_string(),
        module: module.to_string(),
        display,
        counts,
        time_percent,
        callchains: chain_display,
    })
}

fn chain_display_map(
    context: &DisplayContext,
    resolver: &mut Resolver,
    experiment: &Experiment,
    process: &Process,
    table: Option<&ChainTable>,
) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let Some(table) = table else {
        return out;
    };
    if table.total_hits == 0 {
        return out;
    }
    // Resolve every frame once, then format.
    let rows: Vec<(Vec<(String, FrameKind)>, u64)> = table
        .iter()
        .map(|(frames, hits)| {
            let resolved = frames
                .iter()
                .map(|&frame| {
                    let place = resolver.resolve_function(process, frame);
                    let node = resolver.node();
                    let name = resolution_name(experiment, node, place).to_string();
                    (name, frame_kind(place))
                })
                .collect();
            (resolved, hits)
        })
        .collect();
    for (frames, hits) in rows {
        let text = format_chain(&frames, context.callchain_filter);
        if text.is_empty() {
            continue;
        }
        let percent = hits as f64 * 100.0 / table.total_hits as f64;
        *out.entry(text).or_insert(0.0) += percent;
    }
    out
}

/// Loads the experiment and produces the structured result tree:
/// resolves every sample to a function/loop, aggregates per-thread hit
/// vectors, categorizes, and pre-formats the display strings.
pub fn prepare_sampling_display(context: &DisplayContext) -> Result<ExperimentTree, LprofError> {
    let experiment = load_experiment(&context.experiment_path)?;
    let experiment_name = context
        .experiment_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "binary".to_string());

    // Extra category ranks in declaration order.
    let mut extra_index: IndexMap<String, usize> = IndexMap::new();
    let mut extra_names: Vec<String> = Vec::new();
    for (library, category_name) in &context.extra_category_libs {
        let rank = match extra_names.iter().position(|n| n == category_name) {
            Some(rank) => rank,
            None => {
                extra_names.push(category_name.clone());
                extra_names.len() - 1
            }
        };
        extra_index.insert(library.clone(), rank);
    }

    let mut node_trees = Vec::with_capacity(experiment.nodes.len());
    for node in &experiment.nodes {
        let mut resolver = Resolver::new(&experiment.exe_trees, node, context.resolver);
        let mut process_trees = Vec::with_capacity(node.processes.len());
        for process in &node.processes {
            let mut thread_trees = Vec::with_capacity(process.threads.len());
            for thread in &process.threads {
                let agg = aggregate_thread(
                    &experiment,
                    &mut resolver,
                    process,
                    thread,
                    &extra_index,
                );
                let total_leader = agg.totals.first().copied().unwrap_or(0);

                let mut functions = Vec::new();
                if context.display_functions {
                    for (place, counts) in &agg.functions {
                        let chains = chain_display_map(
                            context,
                            &mut resolver,
                            &experiment,
                            process,
                            agg.chains.get(place),
                        );
                        let name = resolution_name(&experiment, node, *place).to_string();
                        let module = resolution_module(&experiment_name, node, *place).to_string();
                        if let Some(entry) = build_hotspot_entry(
                            context,
                            &name,
                            &module,
                            counts.clone(),
                            total_leader,
                            chains,
                        ) {
                            functions.push(entry);
                        }
                    }
                    functions.sort_by(|a, b| {
                        b.counts[0]
                            .cmp(&a.counts[0])
                            .then_with(|| a.name.cmp(&b.name))
                    });
                }

                let mut loops = Vec::new();
                if context.display_loops {
                    for (place, counts) in &agg.loops {
                        let (loop_record, module) = if place.library < 0 {
                            (
                                &experiment.executable.loops[place.index],
                                experiment_name.as_str(),
                            )
                        } else {
                            let library = &node.libraries[place.library as usize];
                            (&library.metadata.loops[place.index], library.name.as_str())
                        };
                        let name = format!(
                            "loop {} in {}",
                            loop_record.id, loop_record.src_function_name
                        );
                        if let Some(entry) = build_hotspot_entry(
                            context,
                            &name,
                            module,
                            counts.clone(),
                            total_leader,
                            BTreeMap::new(),
                        ) {
                            loops.push(entry);
                        }
                    }
                    loops.sort_by(|a, b| {
                        b.counts[0]
                            .cmp(&a.counts[0])
                            .then_with(|| a.name.cmp(&b.name))
                    });
                }

                let mut categories = BTreeMap::new();
                for category in [
                    Category::Binary,
                    Category::Mpi,
                    Category::Openmp,
                    Category::Math,
                    Category::System,
                    Category::Pthread,
                    Category::Io,
                    Category::String,
                    Category::Memory,
                    Category::Other,
                ] {
                    let hits = agg.categories[category.index()];
                    if hits > 0 {
                        categories.insert(category.name().to_string(), hits);
                    }
                }
                for (rank, &hits) in agg.extras.iter().enumerate() {
                    if hits > 0 {
                        categories.insert(extra_names[rank].clone(), hits);
                    }
                }

                let mut libc_categories = BTreeMap::new();
                for (index, &hits) in agg.libc.iter().enumerate() {
                    if hits > 0 {
                        libc_categories.insert(LIBC_CATEGORY_NAMES[index].to_string(), hits);
                    }
                }

                thread_trees.push(ThreadTree {
                    tid: thread.tid,
                    rank: thread.rank,
                    sample_count: total_leader,
                    time_seconds: context.time_seconds(total_leader),
                    functions,
                    loops,
                    categories,
                    libc_categories,
                });
            }

            let mut libraries: Vec<String> = node
                .libraries
                .iter()
                .filter(|l| l.ranges_by_process.contains_key(&process.pid))
                .map(|l| l.name.clone())
                .collect();
            libraries.sort();

            process_trees.push(ProcessTree {
                pid: process.pid,
                rank: process.rank,
                libraries,
                threads: thread_trees,
            });
        }
        node_trees.push(NodeTree {
            name: node.name.clone(),
            rank: node.rank,
            processes: process_trees,
        });
    }

    debug!(
        "prepared display tree: {} node(s), {} event(s)",
        node_trees.len(),
        experiment.event_names.len()
    );
    Ok(ExperimentTree {
        experiment: experiment_name,
        event_list: experiment.event_list.clone(),
        event_names: experiment.event_names.clone(),
        executable_function_count: experiment.executable.functions.len(),
        executable_loop_count: experiment.executable.loops.len(),
        nodes: node_trees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::layout::write_processes_index;
    use crate::metafile::binary_format::{
        write_metadata_file, BinaryMetadata, FunctionRecord, LoopLevel, LoopRecord,
    };
    use crate::metafile::maps::{write_lib_ranges, LibRange};
    use crate::store::ip_events::{write_ip_events_file, IpEventsData, ThreadIpEvents};
    use crate::store::IpEvents;
    use std::fs;
    use std::path::Path;

    fn build_experiment(root: &Path) {
        let exe = BinaryMetadata {
            functions: vec![
                FunctionRecord {
                    name: "main".into(),
                    ranges: vec![(0x1000, 0x1fff)],
                    src_file: None,
                    src_line: 0,
                    outermost_loops: vec![0],
                },
                FunctionRecord {
                    name: "MPI_Allreduce".into(),
                    ranges: vec![(0x4000, 0x4fff)],
                    src_file: None,
                    src_line: 0,
                    outermost_loops: vec![],
                },
            ],
            loops: vec![LoopRecord {
                id: 0,
                ranges: vec![(0x1100, 0x11ff)],
                blocks: vec![],
                src_file: None,
                src_function_name: "main".into(),
                src_function_line: 0,
                src_start_line: 0,
                src_stop_line: 0,
                level: LoopLevel::Single,
                children: vec![],
            }],
        };
        write_metadata_file(&root.join("binary.lprof"), &exe).unwrap();

        let node = root.join("node1");
        let process = node.join("100");
        fs::create_dir_all(&process).unwrap();
        fs::create_dir_all(node.join("libs")).unwrap();
        write_processes_index(&node, &[100]).unwrap();

        let libm = BinaryMetadata {
            functions: vec![FunctionRecord {
                name: "cos".into(),
                ranges: vec![(0x100, 0x1ff)],
                src_file: None,
                src_line: 0,
                outermost_loops: vec![],
            }],
            loops: vec![],
        };
        write_metadata_file(&node.join("libs/libm.so.6.lprof"), &libm).unwrap();
        write_lib_ranges(
            &process.join("lib_ranges.lprof"),
            &[LibRange {
                name: "/usr/lib/libm.so.6".into(),
                start: 0x7f00_0000_0000,
                stop: 0x7f00_0001_0000,
            }],
        )
        .unwrap();
        fs::write(process.join("binary_offset.lprof"), "0").unwrap();

        // 6 leader hits in main (with chains), 3 in libm/cos, 1 unknown.
        let mut main_entry = IpEvents::new(2);
        for _ in 0..6 {
            main_entry.add(0, &[0x1100, 0x1050]);
        }
        main_entry.counts[1] = 12;
        let mut cos_entry = IpEvents::new(2);
        for _ in 0..3 {
            cos_entry.add(0, &[]);
        }
        let mut unknown_entry = IpEvents::new(2);
        unknown_entry.add(0, &[]);

        let data = IpEventsData {
            event_names: vec!["cycles".into(), "instructions".into()],
            event_list: "cycles@1000003,instructions@1000003".into(),
            sample_masks: vec![0x10087, 0x10087],
            threads: vec![ThreadIpEvents {
                tid: 100,
                entries: vec![
                    (0x1100, main_entry),
                    (0x7f00_0000_0150, cos_entry),
                    (0xdead0000, unknown_entry),
                ],
            }],
        };
        write_ip_events_file(&process.join("IP_events.lprof"), &data).unwrap();
    }

    fn context(root: &Path) -> DisplayContext {
        let mut context = DisplayContext::new(root);
        context.sampling_period = 1_000_003;
        context.ref_freq = 2.0e9;
        context
    }

    #[test]
    fn tree_aggregates_functions_loops_and_categories() {
        let dir = tempfile::tempdir().unwrap();
        build_experiment(dir.path());

        let tree = prepare_sampling_display(&context(dir.path())).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        let thread = &tree.nodes[0].processes[0].threads[0];

        assert_eq!(thread.sample_count, 10);

        // Category sums equal the leader sample count (invariant).
        let category_sum: u64 = thread.categories.values().sum();
        assert_eq!(category_sum, thread.sample_count);
        assert_eq!(thread.categories.get("binary"), Some(&6));
        assert_eq!(thread.categories.get("math"), Some(&3));
        assert_eq!(thread.categories.get("other"), Some(&1));

        // Functions are sorted by leader hits.
        assert_eq!(thread.functions[0].name, "main");
        assert_eq!(thread.functions[0].counts, vec![6, 12]);
        assert!((thread.functions[0].time_percent - 60.0).abs() < 1e-9);

        // The unknown sink is present.
        assert!(thread
            .functions
            .iter()
            .any(|f| f.name == "Unknown functions"));

        // The loop at 0x1100 caught the 6 main samples.
        assert_eq!(thread.loops.len(), 1);
        assert_eq!(thread.loops[0].counts[0], 6);

        // Chains resolve and carry percentages.
        let chains = &thread.functions[0].callchains;
        assert_eq!(chains.len(), 1);
        let (text, percent) = chains.iter().next().unwrap();
        assert!(text.contains("main"), "unexpected chain {text}");
        assert!((percent - 100.0).abs() < 1e-9);

        // Wall-clock estimate: 6 hits of 1e6 cycles at 2 GHz.
        let expected = 10.0 * 1_000_003.0 / 2.0e9;
        assert!((thread.time_seconds - expected).abs() < 1e-9);
    }

    #[test]
    fn extra_categories_capture_declared_libraries() {
        let dir = tempfile::tempdir().unwrap();
        build_experiment(dir.path());

        let mut context = context(dir.path());
        context
            .extra_category_libs
            .insert("libm.so.6".into(), "mymath".into());
        let tree = prepare_sampling_display(&context).unwrap();
        let thread = &tree.nodes[0].processes[0].threads[0];
        assert_eq!(thread.categories.get("mymath"), Some(&3));
        assert_eq!(thread.categories.get("math"), None);
        let category_sum: u64 = thread.categories.values().sum();
        assert_eq!(category_sum, thread.sample_count);
    }

    #[test]
    fn display_is_idempotent_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        build_experiment(dir.path());
        let context = context(dir.path());
        let first = serde_json::to_string(&prepare_sampling_display(&context).unwrap()).unwrap();
        let second = serde_json::to_string(&prepare_sampling_display(&context).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn mpi_prefix_in_executable_is_categorized_mpi() {
        let dir = tempfile::tempdir().unwrap();
        build_experiment(dir.path());

        // Append one sample inside MPI_Allreduce.
        let path = dir.path().join("node1/100/IP_events.lprof");
        let mut data = crate::store::read_ip_events_file(&path).unwrap();
        let mut entry = IpEvents::new(2);
        entry.add(0, &[]);
        data.threads[0].entries.push((0x4100, entry));
        write_ip_events_file(&path, &data).unwrap();

        let tree = prepare_sampling_display(&context(dir.path())).unwrap();
        let thread = &tree.nodes[0].processes[0].threads[0];
        assert_eq!(thread.categories.get("mpi"), Some(&1));
    }
}
