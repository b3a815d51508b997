use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use log::{error, warn};

use crate::perf::group::{EventGroup, GroupTarget};
use crate::perf::records::Record;
use crate::perf::BacktraceMode;
use crate::store::{SpillAccounting, StoreConfig, WorkerStore};

use super::unwind;

pub enum WorkerMessage {
    AddGroup(Box<EventGroup>),
    RemoveThread(u32),
}

/// Fixed pool of drainer workers. Each worker owns a disjoint subset of
/// groups; groups are handed over whole, so no ring buffer ever has two
/// consumers.
pub struct DrainerPool {
    handles: Vec<JoinHandle<WorkerStore>>,
    senders: Vec<Sender<WorkerMessage>>,
    done: Arc<AtomicBool>,
    next_worker: usize,
}

/// Clonable façade over the pool's channels, for tracer helpers that
/// add and remove groups while the pool is running.
#[derive(Clone)]
pub struct PoolHandle {
    senders: Vec<Sender<WorkerMessage>>,
    next: Arc<std::sync::atomic::AtomicUsize>,
}

impl PoolHandle {
    pub fn add_group(&self, group: EventGroup) {
        let worker = self.next.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        let _ = self.senders[worker].send(WorkerMessage::AddGroup(Box::new(group)));
    }

    pub fn remove_thread(&self, tid: u32) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::RemoveThread(tid));
        }
    }
}

impl DrainerPool {
    pub fn spawn(
        worker_count: usize,
        poll_timeout_ms: i32,
        backtrace_mode: BacktraceMode,
        store_config: StoreConfig,
        spill_dir: PathBuf,
        accounting: Arc<SpillAccounting>,
    ) -> io::Result<DrainerPool> {
        let worker_count = worker_count.max(1);
        let done = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(worker_count);
        let mut senders = Vec::with_capacity(worker_count);
        for worker_index in 0..worker_count {
            let (sender, receiver) = crossbeam_channel::unbounded();
            let store = WorkerStore::new(worker_index, store_config.clone(), spill_dir.clone());
            let accounting = accounting.clone();
            let done = done.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lprof-drain-{worker_index}"))
                .spawn(move || {
                    worker_loop(
                        receiver,
                        store,
                        accounting,
                        done,
                        poll_timeout_ms,
                        backtrace_mode,
                    )
                })?;
            handles.push(handle);
            senders.push(sender);
        }
        Ok(DrainerPool {
            handles,
            senders,
            done,
            next_worker: 0,
        })
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            senders: self.senders.clone(),
            next: Arc::new(std::sync::atomic::AtomicUsize::new(self.next_worker)),
        }
    }

    /// Hands a group to the next worker, round-robin.
    pub fn add_group(&mut self, group: EventGroup) {
        let worker = self.next_worker % self.senders.len();
        self.next_worker += 1;
        let _ = self.senders[worker].send(WorkerMessage::AddGroup(Box::new(group)));
    }

    /// Asks whichever worker owns this thread's group to flush and
    /// close it.
    pub fn remove_thread(&self, tid: u32) {
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::RemoveThread(tid));
        }
    }

    /// Signals target exit; workers drain what is pending and return
    /// their stores. The final dump happens strictly after every worker
    /// has exited.
    pub fn finish(self) -> Vec<WorkerStore> {
        self.done.store(true, Ordering::SeqCst);
        drop(self.senders);
        self.handles
            .into_iter()
            .map(|handle| handle.join().expect("drainer worker panicked"))
            .collect()
    }
}

fn drain_group(
    group: &mut EventGroup,
    store: &mut WorkerStore,
    accounting: &SpillAccounting,
    backtrace_mode: BacktraceMode,
) {
    group.drain(|record, rank| match record {
        Record::Sample(sample) => {
            if accounting.stopped() {
                return;
            }
            let chain = if backtrace_mode == BacktraceMode::Stack && !sample.stack.is_empty() {
                unwind::unwind_user_stack(&sample.regs, &sample.stack)
            } else {
                sample.callchain.clone()
            };
            if let Err(e) = store.insert(
                accounting,
                sample.pid,
                sample.tid,
                sample.ip,
                sample.cpu,
                rank.unwrap_or(0),
                &chain,
            ) {
                error!("sample store failure: {e}; stopping collection");
                accounting.force_stop();
            }
        }
        Record::Lost { count, .. } => store.add_lost(count),
        // Throttle/unthrottle and unknown records were consumed in full
        // by the ring-buffer drain; nothing to keep.
        _ => {}
    });
}

fn worker_loop(
    receiver: Receiver<WorkerMessage>,
    mut store: WorkerStore,
    accounting: Arc<SpillAccounting>,
    done: Arc<AtomicBool>,
    poll_timeout_ms: i32,
    backtrace_mode: BacktraceMode,
) -> WorkerStore {
    let mut groups: Vec<EventGroup> = Vec::new();
    let mut poll_fds: Vec<libc::pollfd> = Vec::new();

    loop {
        while let Ok(message) = receiver.try_recv() {
            match message {
                WorkerMessage::AddGroup(group) => groups.push(*group),
                WorkerMessage::RemoveThread(tid) => {
                    let target = GroupTarget::Thread {
                        tid: tid as libc::pid_t,
                    };
                    while let Some(index) = groups.iter().position(|g| g.target == target) {
                        let mut group = groups.remove(index);
                        // Removal flushes the ring buffer before the
                        // descriptors close.
                        drain_group(&mut group, &mut store, &accounting, backtrace_mode);
                        let _ = group.disable();
                    }
                }
            }
        }

        if accounting.stopped() {
            for group in &groups {
                let _ = group.disable();
            }
            break;
        }
        let finished = done.load(Ordering::SeqCst);

        poll_fds.clear();
        poll_fds.extend(groups.iter().map(|group| libc::pollfd {
            fd: group.fd(),
            events: libc::POLLIN | libc::POLLHUP,
            revents: 0,
        }));
        if poll_fds.is_empty() {
            if finished {
                break;
            }
            std::thread::sleep(Duration::from_millis(poll_timeout_ms as u64));
            continue;
        }

        let ok = unsafe {
            libc::poll(
                poll_fds.as_mut_ptr(),
                poll_fds.len() as _,
                poll_timeout_ms,
            )
        };
        if ok == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                error!("poll failed in drainer worker: {err}");
                break;
            }
        }

        let mut pending = false;
        for group in &mut groups {
            if group.has_pending() {
                pending = true;
                drain_group(group, &mut store, &accounting, backtrace_mode);
            }
        }

        if finished && !pending {
            break;
        }
    }

    store
}

/// Teardown loss report, severity scaled to the loss ratio. The engine
/// does not compensate for lost samples.
pub fn report_loss(collected: u64, lost: u64) {
    if lost == 0 {
        return;
    }
    let ratio = lost as f64 / (collected + lost) as f64;
    if ratio <= 0.005 {
        warn!("{lost} sample records were lost ({:.2}%)", ratio * 100.0);
    } else if ratio <= 0.05 {
        warn!(
            "{lost} sample records were lost ({:.1}%); results may be skewed",
            ratio * 100.0
        );
    } else {
        error!(
            "{lost} sample records were lost ({:.1}%); reduce the sampling rate \
             (g=large) or disable stack unwinding (btm=off) and rerun",
            ratio * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_without_groups_finishes_cleanly() {
        let accounting = Arc::new(SpillAccounting::new(u64::MAX));
        let dir = tempfile::tempdir().unwrap();
        let pool = DrainerPool::spawn(
            3,
            10,
            BacktraceMode::Off,
            StoreConfig {
                events_per_group: 1,
                max_buf_bytes: 1 << 20,
                files_buf_bytes: 1 << 20,
            },
            dir.path().into(),
            accounting,
        )
        .unwrap();
        let stores = pool.finish();
        assert_eq!(stores.len(), 3);
        assert!(stores.iter().all(|s| s.collected == 0));
    }

    #[test]
    fn emergency_stop_unblocks_workers() {
        let accounting = Arc::new(SpillAccounting::new(u64::MAX));
        let dir = tempfile::tempdir().unwrap();
        let pool = DrainerPool::spawn(
            1,
            10,
            BacktraceMode::Off,
            StoreConfig {
                events_per_group: 1,
                max_buf_bytes: 1 << 20,
                files_buf_bytes: 1 << 20,
            },
            dir.path().into(),
            accounting.clone(),
        )
        .unwrap();
        accounting.force_stop();
        let stores = pool.finish();
        assert_eq!(stores.len(), 1);
    }
}
