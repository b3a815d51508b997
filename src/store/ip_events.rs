use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::StoreError;

/// One distinct call chain with its hit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallChain {
    pub frames: Vec<u64>,
    pub hits: u32,
}

/// Aggregated samples for one (thread, instruction address) pair:
/// per-event hit counts plus the distinct call chains observed there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpEvents {
    pub counts: Vec<u32>,
    pub chains: Vec<CallChain>,
}

impl IpEvents {
    pub fn new(events_per_group: usize) -> Self {
        IpEvents {
            counts: vec![0; events_per_group],
            chains: Vec::new(),
        }
    }

    /// Records one hit of event `rank`, folding `chain` into the
    /// distinct-chain queue. Two chains are identical iff they have the
    /// same length and the same frame sequence.
    pub fn add(&mut self, rank: usize, chain: &[u64]) {
        if let Some(count) = self.counts.get_mut(rank) {
            *count += 1;
        }
        if chain.is_empty() {
            return;
        }
        match self
            .chains
            .iter_mut()
            .find(|c| c.frames.len() == chain.len() && c.frames == chain)
        {
            Some(existing) => existing.hits += 1,
            None => self.chains.push(CallChain {
                frames: chain.to_vec(),
                hits: 1,
            }),
        }
    }

    /// Folds another aggregate into this one, re-deduplicating chains.
    pub fn merge(&mut self, other: &IpEvents) {
        for (mine, theirs) in self.counts.iter_mut().zip(&other.counts) {
            *mine += theirs;
        }
        for chain in &other.chains {
            match self
                .chains
                .iter_mut()
                .find(|c| c.frames.len() == chain.frames.len() && c.frames == chain.frames)
            {
                Some(existing) => existing.hits += chain.hits,
                None => self.chains.push(chain.clone()),
            }
        }
    }

    /// Serialized footprint in `IP_events.lprof`, used by the merge
    /// buffer and the arena accounting.
    pub fn encoded_size(&self) -> usize {
        8 + self.counts.len() * 4
            + 8
            + self
                .chains
                .iter()
                .map(|c| 4 + 4 + c.frames.len() * 8)
                .sum::<usize>()
    }
}

/// Per-thread CPU hit histogram, indexed by logical CPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuHistogram {
    pub hits: Vec<u64>,
}

impl CpuHistogram {
    pub fn add(&mut self, cpu: u32) {
        let cpu = cpu as usize;
        if self.hits.len() <= cpu {
            self.hits.resize(cpu + 1, 0);
        }
        self.hits[cpu] += 1;
    }

    pub fn merge(&mut self, other: &CpuHistogram) {
        if self.hits.len() < other.hits.len() {
            self.hits.resize(other.hits.len(), 0);
        }
        for (cpu, hits) in other.hits.iter().enumerate() {
            self.hits[cpu] += hits;
        }
    }

    pub fn total(&self) -> u64 {
        self.hits.iter().sum()
    }
}

/// Everything `IP_events.lprof` holds for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpEventsData {
    pub event_names: Vec<String>,
    pub event_list: String,
    pub sample_masks: Vec<u64>,
    /// Thread rank is the order of appearance in this vector.
    pub threads: Vec<ThreadIpEvents>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadIpEvents {
    pub tid: u64,
    pub entries: Vec<(u64, IpEvents)>,
}

fn write_string<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(text.len() as u64)?;
    writer.write_all(text.as_bytes())
}

fn read_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u64::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub fn write_entry<W: Write>(writer: &mut W, ip: u64, entry: &IpEvents) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(ip)?;
    for &count in &entry.counts {
        writer.write_u32::<LittleEndian>(count)?;
    }
    writer.write_u64::<LittleEndian>(entry.chains.len() as u64)?;
    for chain in &entry.chains {
        writer.write_u32::<LittleEndian>(chain.hits)?;
        writer.write_u32::<LittleEndian>(chain.frames.len() as u32)?;
        for &frame in &chain.frames {
            writer.write_u64::<LittleEndian>(frame)?;
        }
    }
    Ok(())
}

pub fn read_entry<R: Read>(reader: &mut R, events_per_group: usize) -> io::Result<(u64, IpEvents)> {
    let ip = reader.read_u64::<LittleEndian>()?;
    let mut entry = IpEvents::new(events_per_group);
    for count in entry.counts.iter_mut() {
        *count = reader.read_u32::<LittleEndian>()?;
    }
    let chain_count = reader.read_u64::<LittleEndian>()? as usize;
    entry.chains.reserve(chain_count);
    for _ in 0..chain_count {
        let hits = reader.read_u32::<LittleEndian>()?;
        let frame_count = reader.read_u32::<LittleEndian>()? as usize;
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            frames.push(reader.read_u64::<LittleEndian>()?);
        }
        entry.chains.push(CallChain { frames, hits });
    }
    Ok((ip, entry))
}

pub fn write_ip_events_file(path: &Path, data: &IpEventsData) -> Result<(), StoreError> {
    let dump_err = |source| StoreError::Dump {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(dump_err)?;
    let mut writer = BufWriter::new(file);

    writer
        .write_u32::<LittleEndian>(data.threads.len() as u32)
        .map_err(dump_err)?;
    writer
        .write_u32::<LittleEndian>(data.event_names.len() as u32)
        .map_err(dump_err)?;
    for name in &data.event_names {
        write_string(&mut writer, name).map_err(dump_err)?;
    }
    write_string(&mut writer, &data.event_list).map_err(dump_err)?;
    for &mask in &data.sample_masks {
        writer.write_u64::<LittleEndian>(mask).map_err(dump_err)?;
    }

    for thread in &data.threads {
        writer.write_u64::<LittleEndian>(thread.tid).map_err(dump_err)?;
        writer
            .write_u32::<LittleEndian>(thread.entries.len() as u32)
            .map_err(dump_err)?;
        for (ip, entry) in &thread.entries {
            write_entry(&mut writer, *ip, entry).map_err(dump_err)?;
        }
    }
    writer.flush().map_err(dump_err)
}

pub fn read_ip_events_file(path: &Path) -> Result<IpEventsData, StoreError> {
    let read_err = |source| StoreError::SpillRead {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::new(file);

    let thread_count = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
    let events_per_group = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
    let mut event_names = Vec::with_capacity(events_per_group);
    for _ in 0..events_per_group {
        event_names.push(read_string(&mut reader).map_err(read_err)?);
    }
    let event_list = read_string(&mut reader).map_err(read_err)?;
    let mut sample_masks = Vec::with_capacity(events_per_group);
    for _ in 0..events_per_group {
        sample_masks.push(reader.read_u64::<LittleEndian>().map_err(read_err)?);
    }

    let mut threads = Vec::with_capacity(thread_count);
    for _ in 0..thread_count {
        let tid = reader.read_u64::<LittleEndian>().map_err(read_err)?;
        let entry_count = reader.read_u32::<LittleEndian>().map_err(read_err)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(read_entry(&mut reader, events_per_group).map_err(read_err)?);
        }
        threads.push(ThreadIpEvents { tid, entries });
    }

    Ok(IpEventsData {
        event_names,
        event_list,
        sample_masks,
        threads,
    })
}

/// `cpu_id.info`: one line per thread, `tid,cpu,fraction,…`, fractions
/// summing to 1.
pub fn write_cpu_info_file(
    path: &Path,
    histograms: &[(u64, CpuHistogram)],
) -> Result<(), StoreError> {
    let dump_err = |source| StoreError::Dump {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(dump_err)?;
    let mut writer = BufWriter::new(file);
    for (tid, histogram) in histograms {
        let total = histogram.total();
        if total == 0 {
            continue;
        }
        write!(writer, "{tid}").map_err(dump_err)?;
        for (cpu, &hits) in histogram.hits.iter().enumerate() {
            if hits == 0 {
                continue;
            }
            write!(writer, ",{cpu},{}", hits as f64 / total as f64).map_err(dump_err)?;
        }
        writeln!(writer).map_err(dump_err)?;
    }
    writer.flush().map_err(dump_err)
}

pub fn read_cpu_info_file(path: &Path) -> io::Result<Vec<(u64, Vec<(u32, f64)>)>> {
    let text = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in text.lines() {
        let mut fields = line.split(',');
        let tid: u64 = match fields.next().and_then(|f| f.parse().ok()) {
            Some(tid) => tid,
            None => continue,
        };
        let mut cpus = Vec::new();
        while let (Some(cpu), Some(fraction)) = (fields.next(), fields.next()) {
            if let (Ok(cpu), Ok(fraction)) = (cpu.parse(), fraction.parse()) {
                cpus.push((cpu, fraction));
            }
        }
        out.push((tid, cpus));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_dedup_is_structural() {
        let mut entry = IpEvents::new(2);
        entry.add(0, &[1, 2, 3]);
        entry.add(0, &[1, 2, 3]);
        entry.add(1, &[1, 2]);
        entry.add(0, &[1, 2, 4]);
        assert_eq!(entry.counts, vec![3, 1]);
        assert_eq!(entry.chains.len(), 3);
        assert_eq!(entry.chains[0].hits, 2);
    }

    #[test]
    fn merge_rededuplicates_chains() {
        let mut left = IpEvents::new(1);
        left.add(0, &[1, 2]);
        let mut right = IpEvents::new(1);
        right.add(0, &[1, 2]);
        right.add(0, &[9]);
        left.merge(&right);
        assert_eq!(left.counts, vec![3]);
        assert_eq!(left.chains.len(), 2);
        assert_eq!(left.chains[0].hits, 2);
    }

    #[test]
    fn ip_events_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IP_events.lprof");

        let mut entry = IpEvents::new(2);
        entry.add(0, &[0x1000, 0x2000]);
        entry.add(0, &[0x1000, 0x2000]);
        entry.add(1, &[]);
        let data = IpEventsData {
            event_names: vec!["cycles".into(), "instructions".into()],
            event_list: "cycles@1000003,instructions@1000003".into(),
            sample_masks: vec![0x10087, 0x10087],
            threads: vec![ThreadIpEvents {
                tid: 4242,
                entries: vec![(0x401000, entry)],
            }],
        };

        write_ip_events_file(&path, &data).unwrap();
        let reloaded = read_ip_events_file(&path).unwrap();
        assert_eq!(reloaded, data);
    }

    #[test]
    fn cpu_info_fractions_sum_to_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpu_id.info");

        let mut histogram = CpuHistogram::default();
        histogram.add(0);
        histogram.add(0);
        histogram.add(3);
        write_cpu_info_file(&path, &[(77, histogram)]).unwrap();

        let rows = read_cpu_info_file(&path).unwrap();
        assert_eq!(rows.len(), 1);
        let (tid, cpus) = &rows[0];
        assert_eq!(*tid, 77);
        let sum: f64 = cpus.iter().map(|(_, f)| f).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(cpus[0].0, 0);
        assert_eq!(cpus[1].0, 3);
    }
}
