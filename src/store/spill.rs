use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error};
use rustc_hash::FxHashMap;

use crate::error::StoreError;
use crate::experiment::layout::ExperimentLayout;

use super::arena::Arena;
use super::ip_events::{
    read_entry, write_cpu_info_file, write_entry, write_ip_events_file, CpuHistogram, IpEvents,
    IpEventsData, ThreadIpEvents,
};

/// One sampled task: the process it belongs to and its kernel thread id.
pub type TaskKey = (u32, u32);

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub events_per_group: usize,
    /// Memory-mode arena capacity (`max_buf_MB`).
    pub max_buf_bytes: usize,
    /// File-mode arena capacity (`files_buf_MB`).
    pub files_buf_bytes: usize,
}

/// Process-wide spill accounting shared by all workers. Crossing the
/// limit latches `emergency_stop`; workers observe it at the top of
/// each poll iteration, disable their groups and exit.
#[derive(Debug)]
pub struct SpillAccounting {
    total_bytes: AtomicU64,
    limit_bytes: u64,
    emergency_stop: AtomicBool,
}

impl SpillAccounting {
    pub fn new(limit_bytes: u64) -> Self {
        SpillAccounting {
            total_bytes: AtomicU64::new(0),
            limit_bytes,
            emergency_stop: AtomicBool::new(false),
        }
    }

    pub fn record_flush(&self, bytes: u64) {
        let total = self.total_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if total > self.limit_bytes && !self.emergency_stop.swap(true, Ordering::SeqCst) {
            error!(
                "sample spill reached {} MB (limit {} MB): stopping collection; \
                 rerun with g=large and btm=off to lower the sample volume",
                total >> 20,
                self.limit_bytes >> 20
            );
        }
    }

    pub fn stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub fn force_stop(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Tables {
    samples: FxHashMap<TaskKey, FxHashMap<u64, IpEvents>>,
    cpu: FxHashMap<TaskKey, CpuHistogram>,
}

impl Tables {
    fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.cpu.is_empty()
    }
}

struct SpillFiles {
    samples_data: BufWriter<File>,
    samples_index: BufWriter<File>,
    cpu_data: BufWriter<File>,
    cpu_index: BufWriter<File>,
    samples_data_pos: u64,
    cpu_data_pos: u64,
    paths: [PathBuf; 4],
}

impl SpillFiles {
    fn open(spill_dir: &Path, worker_index: usize) -> Result<Self, StoreError> {
        let paths = [
            spill_dir.join(format!("tmp_samples_{worker_index}.data")),
            spill_dir.join(format!("tmp_samples_{worker_index}.idx")),
            spill_dir.join(format!("tmp_cpu_{worker_index}.data")),
            spill_dir.join(format!("tmp_cpu_{worker_index}.idx")),
        ];
        let mut files = Vec::with_capacity(4);
        for path in &paths {
            let file = File::create(path).map_err(|source| StoreError::Spill {
                path: path.clone(),
                source,
            })?;
            files.push(BufWriter::new(file));
        }
        let mut files = files.into_iter();
        Ok(SpillFiles {
            samples_data: files.next().unwrap(),
            samples_index: files.next().unwrap(),
            cpu_data: files.next().unwrap(),
            cpu_index: files.next().unwrap(),
            samples_data_pos: 0,
            cpu_data_pos: 0,
            paths,
        })
    }
}

enum Mode {
    Memory,
    File,
}

/// One drainer worker's share of the sample store. No locking: the
/// worker owns its arena, tables and spill files outright;
/// cross-worker aggregation happens only in the final dump.
pub struct WorkerStore {
    worker_index: usize,
    config: StoreConfig,
    spill_dir: PathBuf,
    arena: Arena,
    mode: Mode,
    /// Memory-mode tables, frozen when the store switches to file mode.
    resident: Tables,
    active: Tables,
    spill: Option<SpillFiles>,
    pub collected: u64,
    pub lost: u64,
}

impl WorkerStore {
    pub fn new(worker_index: usize, config: StoreConfig, spill_dir: PathBuf) -> Self {
        let arena = Arena::new(config.max_buf_bytes);
        WorkerStore {
            worker_index,
            config,
            spill_dir,
            arena,
            mode: Mode::Memory,
            resident: Tables::default(),
            active: Tables::default(),
            spill: None,
            collected: 0,
            lost: 0,
        }
    }

    fn insertion_cost(&self, task: TaskKey, ip: u64, chain_len: usize) -> usize {
        let mut cost = 0;
        match self.active.samples.get(&task) {
            None => cost += 96 + 48 + self.config.events_per_group * 4,
            Some(thread) if !thread.contains_key(&ip) => {
                cost += 48 + self.config.events_per_group * 4
            }
            _ => {}
        }
        if chain_len > 0 {
            cost += 24 + chain_len * 8;
        }
        cost
    }

    /// Records one sample. May switch the store to file mode or flush
    /// the file-mode arena; never blocks on anything but its own files.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        accounting: &SpillAccounting,
        pid: u32,
        tid: u32,
        ip: u64,
        cpu: u32,
        rank: usize,
        chain: &[u64],
    ) -> Result<(), StoreError> {
        self.collected += 1;
        let task = (pid, tid);

        let cost = self.insertion_cost(task, ip, chain.len()) + 16;
        if !self.arena.charge(cost) {
            match self.mode {
                Mode::Memory => {
                    debug!(
                        "worker {}: memory budget exhausted, switching to file mode",
                        self.worker_index
                    );
                    self.spill = Some(SpillFiles::open(&self.spill_dir, self.worker_index)?);
                    self.resident = std::mem::take(&mut self.active);
                    self.arena = Arena::new(self.config.files_buf_bytes);
                    self.mode = Mode::File;
                }
                Mode::File => {
                    self.flush(accounting)?;
                }
            }
            // A single record far above the arena capacity is kept
            // without its chain rather than looping forever.
            if !self.arena.charge(cost) {
                self.arena.charge(16);
                self.active
                    .samples
                    .entry(task)
                    .or_default()
                    .entry(ip)
                    .or_insert_with(|| IpEvents::new(self.config.events_per_group))
                    .add(rank, &[]);
                self.active.cpu.entry(task).or_default().add(cpu);
                return Ok(());
            }
        }

        self.active
            .samples
            .entry(task)
            .or_default()
            .entry(ip)
            .or_insert_with(|| IpEvents::new(self.config.events_per_group))
            .add(rank, chain);
        self.active.cpu.entry(task).or_default().add(cpu);
        Ok(())
    }

    pub fn add_lost(&mut self, count: u64) {
        self.lost += count;
    }

    /// Serializes the active tables into the four spill files. The
    /// index records carry the (pid, tid, ip) key triple and the byte
    /// offset of the payload in the data file.
    fn flush(&mut self, accounting: &SpillAccounting) -> Result<(), StoreError> {
        let spill = self
            .spill
            .as_mut()
            .expect("flush is only reachable in file mode");
        let spill_err = |path: &Path, source| StoreError::Spill {
            path: path.to_path_buf(),
            source,
        };
        let mut written = 0u64;

        let mut tasks: Vec<TaskKey> = self.active.samples.keys().copied().collect();
        tasks.sort_unstable();
        for task in tasks {
            let thread = &self.active.samples[&task];
            let mut ips: Vec<u64> = thread.keys().copied().collect();
            ips.sort_unstable();
            for ip in ips {
                let entry = &thread[&ip];
                let offset = spill.samples_data_pos;
                let mut payload = Vec::with_capacity(entry.encoded_size() + 8);
                write_entry(&mut payload, ip, entry)
                    .map_err(|e| spill_err(&spill.paths[0], e))?;
                spill
                    .samples_data
                    .write_all(&payload)
                    .map_err(|e| spill_err(&spill.paths[0], e))?;
                spill.samples_data_pos += payload.len() as u64;

                spill
                    .samples_index
                    .write_u64::<LittleEndian>(task.0 as u64)
                    .and_then(|_| spill.samples_index.write_u64::<LittleEndian>(task.1 as u64))
                    .and_then(|_| spill.samples_index.write_u64::<LittleEndian>(ip))
                    .and_then(|_| spill.samples_index.write_u64::<LittleEndian>(offset))
                    .map_err(|e| spill_err(&spill.paths[1], e))?;
                written += payload.len() as u64 + 32;
            }
        }

        let mut tasks: Vec<TaskKey> = self.active.cpu.keys().copied().collect();
        tasks.sort_unstable();
        for task in tasks {
            let histogram = &self.active.cpu[&task];
            let offset = spill.cpu_data_pos;
            spill
                .cpu_data
                .write_u64::<LittleEndian>(histogram.hits.len() as u64)
                .map_err(|e| spill_err(&spill.paths[2], e))?;
            for &hits in &histogram.hits {
                spill
                    .cpu_data
                    .write_u64::<LittleEndian>(hits)
                    .map_err(|e| spill_err(&spill.paths[2], e))?;
            }
            spill.cpu_data_pos += 8 + histogram.hits.len() as u64 * 8;
            spill
                .cpu_index
                .write_u64::<LittleEndian>(task.0 as u64)
                .and_then(|_| spill.cpu_index.write_u64::<LittleEndian>(task.1 as u64))
                .and_then(|_| spill.cpu_index.write_u64::<LittleEndian>(offset))
                .map_err(|e| spill_err(&spill.paths[3], e))?;
            written += 8 + histogram.hits.len() as u64 * 8 + 24;
        }

        self.active = Tables::default();
        self.arena.reset();
        accounting.record_flush(written);
        Ok(())
    }

    /// Pushes whatever is still buffered in file mode out to disk so the
    /// merge sees it. Called once, after the target has exited.
    pub fn finish(&mut self, accounting: &SpillAccounting) -> Result<(), StoreError> {
        if matches!(self.mode, Mode::File) && !self.active.is_empty() {
            self.flush(accounting)?;
        }
        if let Some(spill) = self.spill.as_mut() {
            let spill_err = |path: &Path, source| StoreError::Spill {
                path: path.to_path_buf(),
                source,
            };
            spill
                .samples_data
                .flush()
                .map_err(|e| spill_err(&spill.paths[0], e))?;
            spill
                .samples_index
                .flush()
                .map_err(|e| spill_err(&spill.paths[1], e))?;
            spill
                .cpu_data
                .flush()
                .map_err(|e| spill_err(&spill.paths[2], e))?;
            spill
                .cpu_index
                .flush()
                .map_err(|e| spill_err(&spill.paths[3], e))?;
        }
        Ok(())
    }

    pub fn has_spill(&self) -> bool {
        self.spill.is_some()
    }
}

const MERGE_BUFFER_INITIAL: usize = 64 * 1024;
const MERGE_BUFFER_CEILING: usize = 1 << 30;

/// The merge scratch buffer: doubles on demand, hard ceiling at 1 GiB.
struct MergeBuffer {
    buffer: Vec<u8>,
}

impl MergeBuffer {
    fn new() -> Self {
        MergeBuffer {
            buffer: Vec::with_capacity(MERGE_BUFFER_INITIAL),
        }
    }

    fn ensure(&mut self, needed: usize) -> bool {
        let mut capacity = self.buffer.capacity().max(MERGE_BUFFER_INITIAL);
        while capacity < needed {
            capacity *= 2;
            if capacity > MERGE_BUFFER_CEILING {
                return false;
            }
        }
        self.buffer.reserve(capacity);
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DumpStats {
    pub collected: u64,
    pub lost: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    pub stats: DumpStats,
    /// Pids that received an `IP_events.lprof`, ascending.
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct DumpInput {
    pub event_names: Vec<String>,
    pub event_list: String,
    pub sample_masks: Vec<u64>,
}

fn spill_read_err(path: &Path) -> impl Fn(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::SpillRead {
        path: path.to_path_buf(),
        source,
    }
}

/// Final dump: merges every worker's resident tables, active tables and
/// spill generations, partitions by pid, and writes one
/// `IP_events.lprof` + `cpu_id.info` pair per process directory of the
/// node. Chains are re-deduplicated across generations; a key whose
/// merged record would not fit the 1 GiB merge-buffer ceiling is
/// dropped with a logged [`StoreError::MergeRecordTooLarge`], other
/// keys continue.
pub fn dump_stores(
    mut stores: Vec<WorkerStore>,
    accounting: &SpillAccounting,
    layout: &ExperimentLayout,
    hostname: &str,
    input: &DumpInput,
) -> Result<DumpReport, StoreError> {
    let events_per_group = input.event_names.len();
    let mut report = DumpReport::default();
    for store in &mut stores {
        store.finish(accounting)?;
        report.stats.collected += store.collected;
        report.stats.lost += store.lost;
    }

    // Merge index: (pid, tid, ip) -> in-memory entry + spill positions.
    let mut merged: FxHashMap<(TaskKey, u64), IpEvents> = FxHashMap::default();
    let mut cpu: FxHashMap<TaskKey, CpuHistogram> = FxHashMap::default();
    let mut spill_positions: Vec<(usize, TaskKey, u64, u64)> = Vec::new();

    for (store_index, store) in stores.iter().enumerate() {
        for tables in [&store.resident, &store.active] {
            for (&task, thread) in &tables.samples {
                for (&ip, entry) in thread {
                    merged
                        .entry((task, ip))
                        .or_insert_with(|| IpEvents::new(events_per_group))
                        .merge(entry);
                }
            }
            for (&task, histogram) in &tables.cpu {
                cpu.entry(task).or_default().merge(histogram);
            }
        }
        let Some(spill) = &store.spill else {
            continue;
        };

        let index_path = &spill.paths[1];
        let err = spill_read_err(index_path);
        let file = File::open(index_path).map_err(&err)?;
        let mut reader = BufReader::new(file);
        while let Ok(pid) = reader.read_u64::<LittleEndian>() {
            let tid = reader.read_u64::<LittleEndian>().map_err(&err)?;
            let ip = reader.read_u64::<LittleEndian>().map_err(&err)?;
            let offset = reader.read_u64::<LittleEndian>().map_err(&err)?;
            spill_positions.push((store_index, (pid as u32, tid as u32), ip, offset));
        }

        let cpu_index_path = &spill.paths[3];
        let cpu_data_path = &spill.paths[2];
        let index_err = spill_read_err(cpu_index_path);
        let data_err = spill_read_err(cpu_data_path);
        let mut index = BufReader::new(File::open(cpu_index_path).map_err(&index_err)?);
        let mut data = BufReader::new(File::open(cpu_data_path).map_err(&data_err)?);
        while let Ok(pid) = index.read_u64::<LittleEndian>() {
            let tid = index.read_u64::<LittleEndian>().map_err(&index_err)?;
            let offset = index.read_u64::<LittleEndian>().map_err(&index_err)?;
            data.seek(SeekFrom::Start(offset)).map_err(&data_err)?;
            let cpu_count = data.read_u64::<LittleEndian>().map_err(&data_err)? as usize;
            let histogram = cpu.entry((pid as u32, tid as u32)).or_default();
            if histogram.hits.len() < cpu_count {
                histogram.hits.resize(cpu_count, 0);
            }
            for slot in 0..cpu_count {
                histogram.hits[slot] += data.read_u64::<LittleEndian>().map_err(&data_err)?;
            }
        }
    }

    // Stream the spilled payloads into the merge index.
    let mut merge_buffer = MergeBuffer::new();
    let mut readers: FxHashMap<usize, BufReader<File>> = FxHashMap::default();
    for (store_index, task, ip, offset) in spill_positions {
        let spill = stores[store_index].spill.as_ref().unwrap();
        let data_path = spill.paths[0].clone();
        let reader = match readers.entry(store_index) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let file = File::open(&data_path).map_err(spill_read_err(&data_path))?;
                entry.insert(BufReader::new(file))
            }
        };
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(spill_read_err(&data_path))?;
        let (stored_ip, entry) =
            read_entry(reader, events_per_group).map_err(spill_read_err(&data_path))?;
        debug_assert_eq!(stored_ip, ip);

        let slot = merged
            .entry((task, ip))
            .or_insert_with(|| IpEvents::new(events_per_group));
        let needed = slot.encoded_size() + entry.encoded_size();
        if !merge_buffer.ensure(needed) {
            let err = StoreError::MergeRecordTooLarge {
                pid: task.0,
                tid: task.1,
                ip,
            };
            error!("{err}; dropping this key, other keys continue");
            merged.remove(&(task, ip));
            continue;
        }
        slot.merge(&entry);
    }

    // Partition by pid, tid-sorted inside each process for stable ranks.
    let mut per_process: FxHashMap<u32, FxHashMap<u32, Vec<(u64, IpEvents)>>> =
        FxHashMap::default();
    for (((pid, tid), ip), entry) in merged {
        per_process
            .entry(pid)
            .or_default()
            .entry(tid)
            .or_default()
            .push((ip, entry));
    }
    let mut cpu_per_process: FxHashMap<u32, Vec<(u64, CpuHistogram)>> = FxHashMap::default();
    for ((pid, tid), histogram) in cpu {
        cpu_per_process
            .entry(pid)
            .or_default()
            .push((tid as u64, histogram));
    }

    let mut pids: Vec<u32> = per_process.keys().copied().collect();
    pids.sort_unstable();
    for pid in &pids {
        let process_dir = layout
            .create_process_dir(hostname, *pid)
            .map_err(|source| StoreError::Dump {
                path: layout.process_dir(hostname, *pid),
                source,
            })?;

        let mut threads_map = per_process.remove(pid).unwrap();
        let mut tids: Vec<u32> = threads_map.keys().copied().collect();
        tids.sort_unstable();
        let mut threads = Vec::with_capacity(tids.len());
        for tid in tids {
            let mut entries = threads_map.remove(&tid).unwrap();
            entries.sort_unstable_by_key(|(ip, _)| *ip);
            threads.push(ThreadIpEvents {
                tid: tid as u64,
                entries,
            });
        }

        let data = IpEventsData {
            event_names: input.event_names.clone(),
            event_list: input.event_list.clone(),
            sample_masks: input.sample_masks.clone(),
            threads,
        };
        write_ip_events_file(&process_dir.join("IP_events.lprof"), &data)?;

        let mut histograms = cpu_per_process.remove(pid).unwrap_or_default();
        histograms.sort_unstable_by_key(|(tid, _)| *tid);
        write_cpu_info_file(&process_dir.join("cpu_id.info"), &histograms)?;
    }
    report.pids = pids;

    // The spill files have served their purpose.
    for store in &stores {
        if let Some(spill) = &store.spill {
            for path in &spill.paths {
                let _ = fs::remove_file(path);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ip_events::read_ip_events_file;

    const NODE: &str = "node1";

    fn input() -> DumpInput {
        DumpInput {
            event_names: vec!["cycles".into(), "instructions".into()],
            event_list: "cycles,instructions".into(),
            sample_masks: vec![0x87, 0x87],
        }
    }

    fn config(max_buf: usize, files_buf: usize) -> StoreConfig {
        StoreConfig {
            events_per_group: 2,
            max_buf_bytes: max_buf,
            files_buf_bytes: files_buf,
        }
    }

    fn feed(store: &mut WorkerStore, accounting: &SpillAccounting) {
        for round in 0..200u64 {
            for tid in [10u32, 11] {
                let ip = 0x400000 + (round % 7) * 0x10;
                let chain = [0x500000 + (round % 3), 0x600000];
                store
                    .insert(
                        accounting,
                        100,
                        tid,
                        ip,
                        (round % 4) as u32,
                        (round % 2) as usize,
                        &chain,
                    )
                    .unwrap();
            }
        }
    }

    fn normalize(mut data: IpEventsData) -> IpEventsData {
        for thread in &mut data.threads {
            for (_, entry) in &mut thread.entries {
                entry.chains.sort_by(|a, b| a.frames.cmp(&b.frames));
            }
        }
        data
    }

    #[test]
    fn spill_run_matches_memory_run() {
        let accounting = SpillAccounting::new(u64::MAX);

        let mem_dir = tempfile::tempdir().unwrap();
        let mut mem_store = WorkerStore::new(0, config(1 << 20, 1 << 20), mem_dir.path().into());
        feed(&mut mem_store, &accounting);
        assert!(!mem_store.has_spill());
        let mem_layout = ExperimentLayout::new(mem_dir.path());
        dump_stores(vec![mem_store], &accounting, &mem_layout, NODE, &input()).unwrap();

        let spill_dir = tempfile::tempdir().unwrap();
        let mut spill_store = WorkerStore::new(0, config(2048, 2048), spill_dir.path().into());
        feed(&mut spill_store, &accounting);
        assert!(spill_store.has_spill());
        let spill_layout = ExperimentLayout::new(spill_dir.path());
        dump_stores(vec![spill_store], &accounting, &spill_layout, NODE, &input()).unwrap();

        let mem_data = normalize(
            read_ip_events_file(&mem_layout.process_dir(NODE, 100).join("IP_events.lprof"))
                .unwrap(),
        );
        let spill_data = normalize(
            read_ip_events_file(&spill_layout.process_dir(NODE, 100).join("IP_events.lprof"))
                .unwrap(),
        );
        assert_eq!(mem_data, spill_data);

        // Temp files are gone after the merge.
        assert!(!spill_dir.path().join("tmp_samples_0.data").exists());
    }

    #[test]
    fn emergency_stop_latches_when_spill_exceeds_limit() {
        let accounting = SpillAccounting::new(4096);
        let dir = tempfile::tempdir().unwrap();
        let mut store = WorkerStore::new(0, config(1024, 1024), dir.path().into());
        for round in 0..2000u64 {
            store
                .insert(
                    &accounting,
                    1,
                    7,
                    0x400000 + round * 8,
                    0,
                    0,
                    &[round, round + 1, round + 2],
                )
                .unwrap();
            if accounting.stopped() {
                break;
            }
        }
        assert!(accounting.stopped());
    }

    #[test]
    fn lost_counts_aggregate_into_stats() {
        let accounting = SpillAccounting::new(u64::MAX);
        let dir = tempfile::tempdir().unwrap();
        let mut store = WorkerStore::new(0, config(1 << 20, 1 << 20), dir.path().into());
        store.insert(&accounting, 1, 1, 0x1000, 0, 0, &[]).unwrap();
        store.add_lost(5);
        let layout = ExperimentLayout::new(dir.path());
        let report = dump_stores(vec![store], &accounting, &layout, NODE, &input()).unwrap();
        assert_eq!(report.stats.collected, 1);
        assert_eq!(report.stats.lost, 5);
        assert_eq!(report.pids, vec![1]);
    }

    #[test]
    fn dump_partitions_by_process() {
        let accounting = SpillAccounting::new(u64::MAX);
        let dir = tempfile::tempdir().unwrap();
        let mut a = WorkerStore::new(0, config(1 << 20, 1 << 20), dir.path().into());
        let mut b = WorkerStore::new(1, config(1 << 20, 1 << 20), dir.path().into());
        // Two processes; thread 1 of process 100 is seen by both workers.
        a.insert(&accounting, 100, 1, 0x1000, 0, 0, &[0xa, 0xb]).unwrap();
        b.insert(&accounting, 100, 1, 0x1000, 1, 1, &[0xa, 0xb]).unwrap();
        b.insert(&accounting, 200, 2, 0x2000, 1, 0, &[]).unwrap();
        let layout = ExperimentLayout::new(dir.path());
        let report = dump_stores(vec![a, b], &accounting, &layout, NODE, &input()).unwrap();
        assert_eq!(report.pids, vec![100, 200]);

        let p100 =
            read_ip_events_file(&layout.process_dir(NODE, 100).join("IP_events.lprof")).unwrap();
        assert_eq!(p100.threads.len(), 1);
        let (_, entry) = &p100.threads[0].entries[0];
        assert_eq!(entry.counts, vec![1, 1]);
        // The same chain seen by both workers collapses into one.
        assert_eq!(entry.chains.len(), 1);
        assert_eq!(entry.chains[0].hits, 2);

        let p200 =
            read_ip_events_file(&layout.process_dir(NODE, 200).join("IP_events.lprof")).unwrap();
        assert_eq!(p200.threads[0].tid, 2);
    }
}
