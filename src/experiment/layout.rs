use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

/// Path conventions of an experiment directory tree.
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    root: PathBuf,
}

impl ExperimentLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ExperimentLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn binary_metadata(&self) -> PathBuf {
        self.root.join("binary.lprof")
    }

    pub fn done_marker(&self) -> PathBuf {
        self.root.join("done")
    }

    pub fn node_dir(&self, hostname: &str) -> PathBuf {
        self.root.join(hostname)
    }

    pub fn process_dir(&self, hostname: &str, pid: u32) -> PathBuf {
        self.node_dir(hostname).join(pid.to_string())
    }

    pub fn create_process_dir(&self, hostname: &str, pid: u32) -> io::Result<PathBuf> {
        let dir = self.process_dir(hostname, pid);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Writes `processes_index.lua`, the pid → dense rank table:
///
/// ```lua
/// processes_index = {
///   [4242] = 0,
/// }
/// ```
///
/// Ranks follow pid order, which keeps the mapping stable across
/// loader runs.
pub fn write_processes_index(node_path: &Path, pids: &[u32]) -> io::Result<()> {
    let mut sorted = pids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    let mut file = fs::File::create(node_path.join("processes_index.lua"))?;
    writeln!(file, "processes_index = {{")?;
    for (rank, pid) in sorted.iter().enumerate() {
        writeln!(file, "  [{pid}] = {rank},")?;
    }
    writeln!(file, "}}")
}

/// Parses `processes_index.lua` back into an insertion-ordered
/// pid → rank map.
pub fn read_processes_index(path: &Path) -> io::Result<IndexMap<u32, u32>> {
    let text = fs::read_to_string(path)?;
    let mut map = IndexMap::new();
    for line in text.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('[') else {
            continue;
        };
        let Some((pid, rest)) = rest.split_once(']') else {
            continue;
        };
        let Some((_, rank)) = rest.split_once('=') else {
            continue;
        };
        let rank = rank.trim().trim_end_matches(',');
        if let (Ok(pid), Ok(rank)) = (pid.trim().parse(), rank.parse()) {
            map.insert(pid, rank);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_index_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_processes_index(dir.path(), &[300, 100, 200, 100]).unwrap();
        let map = read_processes_index(&dir.path().join("processes_index.lua")).unwrap();
        let pairs: Vec<(u32, u32)> = map.into_iter().collect();
        assert_eq!(pairs, vec![(100, 0), (200, 1), (300, 2)]);
    }

    #[test]
    fn index_is_a_bijection() {
        let dir = tempfile::tempdir().unwrap();
        write_processes_index(dir.path(), &[5, 3, 9]).unwrap();
        let map = read_processes_index(&dir.path().join("processes_index.lua")).unwrap();
        let mut ranks: Vec<u32> = map.values().copied().collect();
        ranks.sort_unstable();
        ranks.dedup();
        assert_eq!(ranks.len(), map.len());
    }

    #[test]
    fn layout_paths() {
        let layout = ExperimentLayout::new("/tmp/exp");
        assert_eq!(
            layout.process_dir("node1", 42),
            PathBuf::from("/tmp/exp/node1/42")
        );
        assert_eq!(layout.binary_metadata(), PathBuf::from("/tmp/exp/binary.lprof"));
    }
}
