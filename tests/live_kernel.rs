//! End-to-end scenarios against a live kernel.
//!
//! These need `perf_event_paranoid <= 1` and a real scheduler, so they
//! are ignored by default:
//!
//! ```text
//! cargo test --test live_kernel -- --ignored
//! ```

use std::path::Path;

use lprof::report::HwcMode;
use lprof::{
    prepare_sampling_display, sample, BacktraceMode, DisplayContext, EngineKind, SampleOptions,
};

fn busy_command(iterations: u32) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("i=0; while [ $i -lt {iterations} ]; do i=$((i+1)); done"),
    ]
}

fn fork_command(children: u32, iterations: u32) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "for c in $(seq {children}); do \
             (i=0; while [ $i -lt {iterations} ]; do i=$((i+1)); done) & \
             done; wait"
        ),
    ]
}

fn load_tree(experiment: &Path) -> lprof::ExperimentTree {
    let mut context = DisplayContext::new(experiment);
    context.sampling_period = 250_003;
    context.hwc_mode = HwcMode::DefaultEvents;
    prepare_sampling_display(&context).expect("report failed")
}

/// S1: single-threaded CPU-bound command, inherit engine, default
/// events. One pid directory, one dominant thread, the binary category
/// dominating.
#[test]
#[ignore]
fn single_threaded_cpu_bound() {
    let exp = tempfile::tempdir().unwrap();
    let mut options = SampleOptions::new(busy_command(2_000_000), exp.path());
    options.events = Some("cycles@1000003,instructions@1000003".into());
    options.engine = EngineKind::Inherit;

    let outcome = sample(options).expect("sampling failed");
    assert_eq!(outcome.lost, 0);
    assert!(outcome.collected > 0);

    let node = exp.path().join(&outcome.hostname);
    let process_dir = node.join(outcome.pid.to_string());
    assert!(process_dir.join("IP_events.lprof").is_file());
    assert!(process_dir.join("cpu_id.info").is_file());
    assert!(process_dir.join("binary_offset.lprof").is_file());
    assert!(node.join("processes_index.lua").is_file());

    let tree = load_tree(exp.path());
    let thread = &tree.nodes[0].processes[0].threads[0];
    assert!(thread.sample_count > 0);
}

/// S2: four forked children under the ptrace-sync engine. Every child
/// gets its own pid directory.
#[test]
#[ignore]
fn fork_bomb_with_four_children() {
    let exp = tempfile::tempdir().unwrap();
    let mut options = SampleOptions::new(fork_command(4, 1_000_000), exp.path());
    options.engine = EngineKind::PtraceSync;
    options.period = Some(250_003);

    let outcome = sample(options).expect("sampling failed");
    let node = exp.path().join(&outcome.hostname);
    let pid_dirs = std::fs::read_dir(&node)
        .unwrap()
        .flatten()
        .filter(|e| {
            e.path().is_dir()
                && e.file_name().to_string_lossy().parse::<u32>().is_ok()
                && e.path().join("IP_events.lprof").is_file()
        })
        .count();
    assert!(pid_dirs >= 2, "expected parent + children, got {pid_dirs}");
}

/// S4/S5: xsmall period under tight buffer budgets. With a workable
/// file cap the run completes with spill; with a 1 MB cap the
/// emergency stop latches, the partial experiment stays valid, and the
/// done marker appears.
#[test]
#[ignore]
fn buffer_pressure_and_emergency_stop() {
    let exp = tempfile::tempdir().unwrap();
    let mut options = SampleOptions::new(busy_command(20_000_000), exp.path());
    options.period = Some(250_003);
    options.max_buf_mb = 4;
    options.files_buf_mb = 4;
    options.max_files_mb = 64;
    let outcome = sample(options).expect("sampling failed");
    assert!(!outcome.emergency_stop);
    assert!(load_tree(exp.path()).nodes[0].processes[0].threads[0].sample_count > 0);

    let exp = tempfile::tempdir().unwrap();
    let mut options = SampleOptions::new(busy_command(20_000_000), exp.path());
    options.period = Some(250_003);
    options.max_buf_mb = 1;
    options.files_buf_mb = 1;
    options.max_files_mb = 1;
    let outcome = sample(options).expect("sampling must survive the stop");
    if outcome.emergency_stop {
        assert!(exp.path().join("done").is_file());
        // The partial results are still loadable.
        let _ = load_tree(exp.path());
    }
}

/// S6: a position-independent executable records a non-zero offset and
/// resolves most samples.
#[test]
#[ignore]
fn position_independent_executable() {
    let exp = tempfile::tempdir().unwrap();
    // /bin/sh on modern systems is a PIE.
    let mut options = SampleOptions::new(busy_command(4_000_000), exp.path());
    options.period = Some(250_003);
    let outcome = sample(options).expect("sampling failed");

    let offset_file = exp
        .path()
        .join(&outcome.hostname)
        .join(outcome.pid.to_string())
        .join("binary_offset.lprof");
    let offset: u64 = std::fs::read_to_string(offset_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let tree = load_tree(exp.path());
    let thread = &tree.nodes[0].processes[0].threads[0];
    let unknown: u64 = thread
        .functions
        .iter()
        .filter(|f| f.name == "Unknown functions")
        .map(|f| f.counts[0])
        .sum();
    if offset > 0 {
        assert!(
            (unknown as f64) < thread.sample_count as f64 * 0.5,
            "too many unresolved samples ({unknown}/{})",
            thread.sample_count
        );
    }
}

/// Timers engine smoke test: no PMU required at all.
#[test]
#[ignore]
fn timers_engine_smoke() {
    let exp = tempfile::tempdir().unwrap();
    let mut options = SampleOptions::new(busy_command(8_000_000), exp.path());
    options.engine = EngineKind::Timers;
    options.period = Some(2_000_003);
    options.backtrace_mode = BacktraceMode::Off;
    let outcome = sample(options).expect("sampling failed");
    assert!(exp
        .path()
        .join(&outcome.hostname)
        .join("processes_index.lua")
        .is_file());
}
