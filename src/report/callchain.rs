use rustc_hash::FxHashMap;

/// Attribution kind of one chain frame, ordered so a display filter
/// threshold can drop the noisier kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FrameKind {
    Binary = 0,
    Library = 1,
    System = 2,
}

/// Structural chain key: length plus a hash of the frame sequence,
/// cheap to compare and collision-checked by the caller holding the
/// actual frames. The display string is built only for the display
/// layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub len: u32,
    pub hash: u64,
}

impl ChainKey {
    pub fn of(frames: &[u64]) -> Self {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        frames.hash(&mut hasher);
        ChainKey {
            len: frames.len() as u32,
            hash: hasher.finish(),
        }
    }
}

/// Per-hotspot call-chain table, summing duplicates structurally.
#[derive(Debug, Clone, Default)]
pub struct ChainTable {
    chains: FxHashMap<ChainKey, Vec<(Vec<u64>, u64)>>,
    pub total_hits: u64,
}

impl ChainTable {
    pub fn add(&mut self, frames: &[u64], hits: u64) {
        self.total_hits += hits;
        let key = ChainKey::of(frames);
        let bucket = self.chains.entry(key).or_default();
        // Collision check: keys can clash, frames cannot.
        for (existing, count) in bucket.iter_mut() {
            if existing == frames {
                *count += hits;
                return;
            }
        }
        bucket.push((frames.to_vec(), hits));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u64], u64)> {
        self.chains
            .values()
            .flatten()
            .map(|(frames, hits)| (frames.as_slice(), *hits))
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Renders one chain as `fn0 [xk0] <-- fn1 [xk1] <-- …`: adjacent
/// repeats collapse into a run-length entry, and frames whose kind
/// exceeds the filter threshold are dropped.
pub fn format_chain(frames: &[(String, FrameKind)], filter: FrameKind) -> String {
    let mut parts: Vec<(String, u32)> = Vec::new();
    for (name, kind) in frames {
        if *kind > filter {
            continue;
        }
        match parts.last_mut() {
            Some((last, count)) if last == name => *count += 1,
            _ => parts.push((name.clone(), 1)),
        }
    }
    parts
        .into_iter()
        .map(|(name, count)| format!("{name} [x{count}]"))
        .collect::<Vec<_>>()
        .join(" <-- ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str, kind: FrameKind) -> (String, FrameKind) {
        (name.to_string(), kind)
    }

    #[test]
    fn adjacent_repeats_collapse() {
        let frames = vec![
            frame("a", FrameKind::Binary),
            frame("a", FrameKind::Binary),
            frame("a", FrameKind::Binary),
            frame("b", FrameKind::Binary),
            frame("a", FrameKind::Binary),
        ];
        assert_eq!(
            format_chain(&frames, FrameKind::System),
            "a [x3] <-- b [x1] <-- a [x1]"
        );
    }

    #[test]
    fn filter_drops_noisier_kinds() {
        let frames = vec![
            frame("user", FrameKind::Binary),
            frame("lib", FrameKind::Library),
            frame("sys", FrameKind::System),
        ];
        assert_eq!(
            format_chain(&frames, FrameKind::Binary),
            "user [x1]"
        );
        assert_eq!(
            format_chain(&frames, FrameKind::Library),
            "user [x1] <-- lib [x1]"
        );
        assert_eq!(
            format_chain(&frames, FrameKind::System),
            "user [x1] <-- lib [x1] <-- sys [x1]"
        );
    }

    #[test]
    fn filtering_can_merge_runs() {
        // Dropping the library frame makes the two binary frames
        // adjacent, so they collapse.
        let frames = vec![
            frame("a", FrameKind::Binary),
            frame("lib", FrameKind::Library),
            frame("a", FrameKind::Binary),
        ];
        assert_eq!(format_chain(&frames, FrameKind::Binary), "a [x2]");
    }

    #[test]
    fn chain_table_sums_structural_duplicates() {
        let mut table = ChainTable::default();
        table.add(&[1, 2, 3], 2);
        table.add(&[1, 2, 3], 3);
        table.add(&[1, 2], 1);
        assert_eq!(table.total_hits, 6);
        let mut rows: Vec<(Vec<u64>, u64)> = table
            .iter()
            .map(|(frames, hits)| (frames.to_vec(), hits))
            .collect();
        rows.sort();
        assert_eq!(rows, vec![(vec![1, 2], 1), (vec![1, 2, 3], 5)]);
    }

    #[test]
    fn no_two_chains_in_a_table_are_equal() {
        let mut table = ChainTable::default();
        for _ in 0..10 {
            table.add(&[7, 8, 9], 1);
            table.add(&[7, 8], 1);
        }
        let rows: Vec<_> = table.iter().collect();
        assert_eq!(rows.len(), 2);
    }
}
