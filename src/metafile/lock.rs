use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;

/// Node-level advisory lock: a `mkdir`-based mutex, busy-waited with
/// one-second sleeps and released by `rmdir`. Serializes library
/// metadata generation between engine instances on the same node.
pub struct NodeLock {
    path: PathBuf,
}

impl NodeLock {
    pub fn acquire(node_path: &Path) -> io::Result<NodeLock> {
        let path = node_path.join("lockdir");
        loop {
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    debug!("acquired {}", path.display());
                    return Ok(NodeLock { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(Duration::from_secs(1));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for NodeLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            log::warn!("cannot release {}: {e}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _lock = NodeLock::acquire(dir.path()).unwrap();
            assert!(dir.path().join("lockdir").is_dir());
        }
        assert!(!dir.path().join("lockdir").exists());
    }
}
