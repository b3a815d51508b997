use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::MetafileError;
use crate::experiment::layout::ExperimentLayout;

use super::binary_format::write_metadata_file;
use super::elf_meta::{is_position_independent, Disassembler};
use super::lock::NodeLock;
use super::maps::{
    derive_lib_ranges, executable_base, pidof, read_string_lossy, snapshot_maps, write_lib_ranges,
};

pub const MAPS_SNAPSHOT_COUNT: u32 = 5;

/// Side task copying `/proc/<pid>/maps` five times at one-second
/// intervals into `<node>/<pid>/maps_bin_<pid>_<n>`. With an override
/// binary (the real target masked under an MPI driver or similar
/// launcher), every pid whose command matches it is snapshotted too.
pub fn spawn_maps_listener(
    node_path: PathBuf,
    pid: u32,
    override_binary: Option<String>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("lprof-maps".into())
        .spawn(move || {
            for n in 1..=MAPS_SNAPSHOT_COUNT {
                let mut pids = vec![pid];
                if let Some(target) = &override_binary {
                    for other in pidof(target) {
                        if !pids.contains(&other) {
                            pids.push(other);
                        }
                    }
                }
                for pid in pids {
                    let process_dir = node_path.join(pid.to_string());
                    if fs::create_dir_all(&process_dir).is_err() {
                        continue;
                    }
                    let dest = process_dir.join(format!("maps_bin_{pid}_{n}"));
                    if let Err(e) = snapshot_maps(pid, &dest) {
                        // The process may be gone already.
                        debug!("maps snapshot {n} for pid {pid} failed: {e}");
                    }
                }
                std::thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("cannot spawn the maps listener thread")
}

#[derive(Debug, Clone)]
pub struct MetafileRequest {
    pub experiment_path: PathBuf,
    pub node_path: PathBuf,
    pub pid: u32,
    /// Target executable; its basename identifies the executable
    /// mapping in the maps snapshots.
    pub exe_name: String,
    /// Library names selected for full disassembly.
    pub disass_list: Vec<String>,
}

fn collect_snapshots(process_dir: &Path, pid: u32) -> Result<Vec<String>, MetafileError> {
    let mut snapshots = Vec::new();
    for n in 1..=MAPS_SNAPSHOT_COUNT {
        let path = process_dir.join(format!("maps_bin_{pid}_{n}"));
        match read_string_lossy(&path) {
            Ok(text) => snapshots.push(text),
            Err(_) => continue,
        }
    }
    if snapshots.is_empty() {
        return Err(MetafileError::NoMapsSnapshot(pid));
    }
    Ok(snapshots)
}

/// Persists all per-process and per-node metadata for one process at
/// collection teardown: `lib_ranges.lprof`, `binary_offset.lprof`, the
/// per-library metadata files (under the node lock) and, once per
/// experiment, the executable metadata.
pub fn generate_metafile(
    request: &MetafileRequest,
    disassembler: &mut dyn Disassembler,
) -> Result<(), MetafileError> {
    let process_dir = request.node_path.join(request.pid.to_string());
    let snapshots = collect_snapshots(&process_dir, request.pid)?;

    let ranges = derive_lib_ranges(&snapshots, |name| disassembler.probe(Path::new(name)));
    let lib_ranges_path = process_dir.join("lib_ranges.lprof");
    write_lib_ranges(&lib_ranges_path, &ranges).map_err(|source| MetafileError::Write {
        path: lib_ranges_path,
        source,
    })?;

    let exe_basename = Path::new(&request.exe_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| request.exe_name.clone());
    // Only position-independent executables need per-run offsetting;
    // classic executables record 0.
    let offset = match executable_base(&snapshots, &exe_basename) {
        Some(base) if is_position_independent(Path::new(&request.exe_name)).unwrap_or(false) => {
            base
        }
        Some(_) => 0,
        None => {
            warn!(
                "no maps entry matches executable {exe_basename}; assuming a classic layout"
            );
            0
        }
    };
    let offset_path = process_dir.join("binary_offset.lprof");
    fs::write(&offset_path, offset.to_string()).map_err(|source| MetafileError::Write {
        path: offset_path,
        source,
    })?;

    // Library metadata is shared by every process of the node; one
    // writer at a time materializes the missing files.
    let libs_dir = request.node_path.join("libs");
    fs::create_dir_all(&libs_dir).map_err(|source| MetafileError::Write {
        path: libs_dir.clone(),
        source,
    })?;
    {
        let _lock = NodeLock::acquire(&request.node_path).map_err(|source| {
            MetafileError::Write {
                path: request.node_path.join("lockdir"),
                source,
            }
        })?;
        for range in &ranges {
            let basename = match Path::new(&range.name).file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            let lib_path = libs_dir.join(format!("{basename}.lprof"));
            if lib_path.exists() {
                continue;
            }
            let full = request
                .disass_list
                .iter()
                .any(|d| d == &basename || d == &range.name);
            let metadata = if full {
                disassembler.full_metadata(Path::new(&range.name))
            } else {
                disassembler.labels_metadata(Path::new(&range.name))
            };
            match metadata {
                Ok(metadata) => {
                    write_metadata_file(&lib_path, &metadata).map_err(|source| {
                        MetafileError::Write {
                            path: lib_path.clone(),
                            source,
                        }
                    })?;
                    debug!("wrote {}", lib_path.display());
                }
                Err(e) => warn!("skipping metadata for {}: {e}", range.name),
            }
        }
    }

    // Executable metadata is written once per experiment, not per node.
    let binary_path = ExperimentLayout::new(&request.experiment_path).binary_metadata();
    if !binary_path.exists() {
        let metadata = disassembler.full_metadata(Path::new(&request.exe_name))?;
        write_metadata_file(&binary_path, &metadata).map_err(|source| MetafileError::Write {
            path: binary_path.clone(),
            source,
        })?;
        info!("wrote {}", binary_path.display());
    }

    Ok(())
}

/// Teardown scalars: elapsed wall time in microseconds and the
/// micro-architecture code, one decimal each.
pub fn write_walltime_uarch(
    process_dir: &Path,
    walltime_us: u64,
    uarch: u32,
) -> Result<(), MetafileError> {
    for (name, value) in [("walltime", walltime_us), ("uarch", uarch as u64)] {
        let path = process_dir.join(name);
        fs::write(&path, value.to_string()).map_err(|source| MetafileError::Write {
            path,
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metafile::binary_format::{read_metadata_file, BinaryMetadata, FunctionRecord};
    use crate::metafile::maps::read_lib_ranges;

    /// Scripted disassembler: accepts every name, returns one function
    /// per binary.
    struct FakeDisassembler {
        full_calls: Vec<PathBuf>,
        label_calls: Vec<PathBuf>,
    }

    impl FakeDisassembler {
        fn new() -> Self {
            FakeDisassembler {
                full_calls: Vec::new(),
                label_calls: Vec::new(),
            }
        }

        fn metadata(path: &Path) -> BinaryMetadata {
            BinaryMetadata {
                functions: vec![FunctionRecord {
                    name: format!("fn_in_{}", path.file_name().unwrap().to_string_lossy()),
                    ranges: vec![(0x1000, 0x1fff)],
                    src_file: None,
                    src_line: 0,
                    outermost_loops: vec![],
                }],
                loops: vec![],
            }
        }
    }

    impl Disassembler for FakeDisassembler {
        fn probe(&mut self, _path: &Path) -> bool {
            true
        }

        fn full_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError> {
            self.full_calls.push(path.to_path_buf());
            Ok(Self::metadata(path))
        }

        fn labels_metadata(&mut self, path: &Path) -> Result<BinaryMetadata, MetafileError> {
            self.label_calls.push(path.to_path_buf());
            Ok(Self::metadata(path))
        }
    }

    #[test]
    fn generate_metafile_writes_the_process_layout() {
        let exp = tempfile::tempdir().unwrap();
        let node_path = exp.path().join("node1");
        let process_dir = node_path.join("4242");
        fs::create_dir_all(&process_dir).unwrap();

        let maps = "\
00400000-00401000 r-xp 00000000 08:02 10 /opt/app/busy
7f0000000000-7f0000010000 r-xp 00000000 08:02 11 /usr/lib/libfoo.so.1
7f0000020000-7f0000030000 r-xp 00000000 08:02 12 /usr/lib/libdeep.so
";
        fs::write(process_dir.join("maps_bin_4242_1"), maps).unwrap();

        let request = MetafileRequest {
            experiment_path: exp.path().to_path_buf(),
            node_path: node_path.clone(),
            pid: 4242,
            exe_name: "/opt/app/busy".into(),
            disass_list: vec!["libdeep.so".into()],
        };
        let mut disassembler = FakeDisassembler::new();
        generate_metafile(&request, &mut disassembler).unwrap();

        let ranges = read_lib_ranges(&process_dir.join("lib_ranges.lprof")).unwrap();
        assert_eq!(ranges.len(), 3);

        // A nonexistent path cannot be PIE, so the offset degrades to 0.
        let offset: u64 = fs::read_to_string(process_dir.join("binary_offset.lprof"))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(offset, 0);

        assert!(node_path.join("libs/libfoo.so.1.lprof").exists());
        assert!(node_path.join("libs/libdeep.so.lprof").exists());
        assert!(exp.path().join("binary.lprof").exists());
        // The lock is gone.
        assert!(!node_path.join("lockdir").exists());

        // The disassemble set routed libdeep through the full path.
        assert!(disassembler
            .full_calls
            .iter()
            .any(|p| p.ends_with("libdeep.so")));
        assert!(disassembler
            .label_calls
            .iter()
            .any(|p| p.ends_with("libfoo.so.1")));

        let (_, _, metadata) =
            read_metadata_file(&node_path.join("libs/libfoo.so.1.lprof")).unwrap();
        assert_eq!(metadata.functions[0].name, "fn_in_libfoo.so.1");
    }

    #[test]
    fn existing_library_metadata_is_not_rewritten() {
        let exp = tempfile::tempdir().unwrap();
        let node_path = exp.path().join("node1");
        let process_dir = node_path.join("1");
        fs::create_dir_all(&process_dir).unwrap();
        fs::write(
            process_dir.join("maps_bin_1_1"),
            "7f0000000000-7f0000010000 r-xp 00000000 08:02 11 /usr/lib/libfoo.so.1\n",
        )
        .unwrap();

        let request = MetafileRequest {
            experiment_path: exp.path().to_path_buf(),
            node_path: node_path.clone(),
            pid: 1,
            exe_name: "busy".into(),
            disass_list: vec![],
        };
        let mut disassembler = FakeDisassembler::new();
        generate_metafile(&request, &mut disassembler).unwrap();
        let first_len = disassembler.label_calls.len();

        // Second process of the same node: libfoo is already there.
        let process_dir = node_path.join("2");
        fs::create_dir_all(&process_dir).unwrap();
        fs::write(
            process_dir.join("maps_bin_2_1"),
            "7f0000000000-7f0000010000 r-xp 00000000 08:02 11 /usr/lib/libfoo.so.1\n",
        )
        .unwrap();
        let request = MetafileRequest {
            pid: 2,
            ..request
        };
        generate_metafile(&request, &mut disassembler).unwrap();
        assert_eq!(disassembler.label_calls.len(), first_len);
    }

    #[test]
    fn walltime_and_uarch_scalars() {
        let dir = tempfile::tempdir().unwrap();
        write_walltime_uarch(dir.path(), 1_500_000, 42).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("walltime")).unwrap(),
            "1500000"
        );
        assert_eq!(fs::read_to_string(dir.path().join("uarch")).unwrap(), "42");
    }

    #[test]
    fn missing_snapshots_are_an_error() {
        let exp = tempfile::tempdir().unwrap();
        let node_path = exp.path().join("node1");
        fs::create_dir_all(node_path.join("7")).unwrap();
        let request = MetafileRequest {
            experiment_path: exp.path().to_path_buf(),
            node_path,
            pid: 7,
            exe_name: "busy".into(),
            disass_list: vec![],
        };
        assert!(matches!(
            generate_metafile(&request, &mut FakeDisassembler::new()),
            Err(MetafileError::NoMapsSnapshot(7))
        ));
    }
}
