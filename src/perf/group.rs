use std::mem;
use std::os::unix::io::RawFd;

use libc::pid_t;
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::error::CounterError;

use super::counter::{ring_page_count, Counter, RingBuffer};
use super::event_spec::EventSpec;
use super::records::{parse_record, Record};
use super::sys::*;

/// How much of each sample record the kernel must attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacktraceMode {
    Off,
    /// Kernel-walked call chains.
    Call,
    /// User-register + user-stack snapshots for post-hoc unwinding.
    Stack,
    /// Branch-stack records.
    Branch,
}

impl BacktraceMode {
    pub fn sample_type(self) -> u64 {
        let base = PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_CPU;
        match self {
            BacktraceMode::Off => base,
            BacktraceMode::Call => base | PERF_SAMPLE_CALLCHAIN,
            BacktraceMode::Stack => base | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER,
            BacktraceMode::Branch => base | PERF_SAMPLE_BRANCH_STACK,
        }
    }
}

/// The resolved shape of one counter session: the event list, which
/// events won the precise-IP dry run, and the partition of events into
/// groups (events that cannot be grouped with the leader are demoted to
/// their own single-event group, at the cost of one extra ring buffer
/// and one extra descriptor per CPU or thread).
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub specs: Vec<EventSpec>,
    pub precise: Vec<bool>,
    pub groups: Vec<Vec<usize>>,
    pub sample_type: u64,
    pub regs_mask: u64,
    pub stack_size: u32,
}

impl SessionPlan {
    pub fn events_per_group(&self) -> usize {
        self.specs.len()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub fn leader_period(&self) -> u64 {
        self.specs[0].period
    }
}

const STACK_SNAPSHOT_SIZE: u32 = 32 * 1024;
const MULTIPLEX_THRESHOLD: f64 = 0.95;

fn build_attr(
    spec: &EventSpec,
    sample_type: u64,
    regs_mask: u64,
    stack_size: u32,
    precise: bool,
    sampling: bool,
) -> PerfEventAttr {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.kind = spec.type_code;
    attr.config = spec.config;
    attr.flags = PERF_ATTR_FLAG_DISABLED | PERF_ATTR_FLAG_EXCLUDE_HV;
    if precise {
        attr.flags |= PERF_ATTR_PRECISE_IP_CONSTANT_SKID;
    }
    if sampling {
        attr.sample_period_or_freq = spec.period;
        attr.sample_type = sample_type;
        attr.sample_regs_user = regs_mask;
        attr.sample_stack_user = if sample_type & PERF_SAMPLE_STACK_USER != 0 {
            stack_size
        } else {
            0
        };
        if sample_type & PERF_SAMPLE_BRANCH_STACK != 0 {
            attr.branch_sample_type = PERF_SAMPLE_BRANCH_ANY;
        }
    } else {
        attr.read_format = PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING;
    }
    attr
}

fn dry_open(attr: &PerfEventAttr, name: &str, pid: pid_t, group_fd: RawFd) -> Option<Counter> {
    Counter::open(attr, name, pid, -1, group_fd, 0).ok()
}

/// Resolves the user event list into a `SessionPlan` through three dry
/// runs against `pid` (the engine's own process before the target is
/// forked):
///
/// 1. open each event alone; any failure aborts naming the event;
/// 2. re-open requesting constant-skid precise IP, downgrading the
///    events that refuse it, then attach everything to the leader and
///    demote whatever cannot share the leader's group;
/// 3. open the surviving groups in counting mode, run a trivial
///    payload, and warn about any event scheduled on the PMU for less
///    than 95% of its enabled time. No compensation is attempted.
pub fn plan_events(
    specs: Vec<EventSpec>,
    backtrace_mode: BacktraceMode,
    pid: pid_t,
) -> Result<SessionPlan, CounterError> {
    let sample_type = backtrace_mode.sample_type();
    let regs_mask = if sample_type & PERF_SAMPLE_REGS_USER != 0 {
        PERF_REGS_MASK_DEFAULT
    } else {
        0
    };
    let stack_size = if sample_type & PERF_SAMPLE_STACK_USER != 0 {
        STACK_SNAPSHOT_SIZE
    } else {
        0
    };

    // First dry run: each event alone.
    for spec in &specs {
        let attr = build_attr(spec, sample_type, regs_mask, stack_size, false, true);
        if dry_open(&attr, &spec.name, pid, -1).is_none() {
            return Err(CounterError::Open {
                event: spec.name.clone(),
                source: std::io::Error::last_os_error(),
            });
        }
    }

    // Second dry run: precise IP, then groupability.
    let mut precise = Vec::with_capacity(specs.len());
    for spec in &specs {
        let attr = build_attr(spec, sample_type, regs_mask, stack_size, true, true);
        let ok = dry_open(&attr, &spec.name, pid, -1).is_some();
        if !ok {
            debug!("event {} does not support precise IP, downgraded", spec.name);
        }
        precise.push(ok);
    }

    let mut groups: Vec<Vec<usize>> = vec![vec![0]];
    {
        let leader_attr = build_attr(
            &specs[0],
            sample_type,
            regs_mask,
            stack_size,
            precise[0],
            true,
        );
        let leader = dry_open(&leader_attr, &specs[0].name, pid, -1).ok_or_else(|| {
            CounterError::Open {
                event: specs[0].name.clone(),
                source: std::io::Error::last_os_error(),
            }
        })?;
        let mut followers = Vec::new();
        for (index, spec) in specs.iter().enumerate().skip(1) {
            let attr = build_attr(spec, sample_type, regs_mask, stack_size, precise[index], true);
            match dry_open(&attr, &spec.name, pid, leader.fd()) {
                Some(counter) => {
                    followers.push(counter);
                    groups[0].push(index);
                }
                None => {
                    warn!(
                        "cannot group {} with previous events; it will be measured in its own group \
                         (one more ring buffer and one more descriptor per CPU or thread)",
                        spec.name
                    );
                    groups.push(vec![index]);
                }
            }
        }
    }

    // Third dry run: counting mode, trivial payload, multiplex check.
    dryrun_multiplexing(&specs, &groups, pid);

    Ok(SessionPlan {
        specs,
        precise,
        groups,
        sample_type,
        regs_mask,
        stack_size,
    })
}

fn dryrun_multiplexing(specs: &[EventSpec], groups: &[Vec<usize>], pid: pid_t) {
    let mut counters: Vec<(usize, Counter)> = Vec::new();
    for group in groups {
        let mut leader_fd = -1;
        for &index in group {
            let attr = build_attr(&specs[index], 0, 0, 0, false, false);
            match dry_open(&attr, &specs[index].name, pid, leader_fd) {
                Some(counter) => {
                    if leader_fd == -1 {
                        leader_fd = counter.fd();
                    }
                    counters.push((index, counter));
                }
                None => {
                    debug!("cannot open {} for the multiplexing dry run", specs[index].name);
                    return;
                }
            }
        }
    }

    for (_, counter) in &counters {
        if counter.enable().is_err() {
            return;
        }
    }
    // Trivial payload: spin long enough for the scheduler to rotate the
    // events at least once if the PMU is oversubscribed.
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(50);
    let mut spin = 0u64;
    while std::time::Instant::now() < deadline {
        spin = spin.wrapping_add(1);
        std::hint::black_box(spin);
    }
    for (_, counter) in &counters {
        let _ = counter.disable();
    }

    for (index, counter) in &counters {
        if let Ok(counts) = counter.read_counts() {
            let ratio = counts.scheduling_ratio();
            if ratio < MULTIPLEX_THRESHOLD {
                warn!(
                    "event {} is multiplexed ({:.0}% of enabled time on the PMU); \
                     counts are not rescaled",
                    specs[*index].name,
                    ratio * 100.0
                );
            }
        }
    }
}

/// Where a group of counters is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupTarget {
    /// All threads of `pid` on one CPU, following descendants
    /// (the kernel inherit flag).
    InheritCpu { pid: pid_t, cpu: u32 },
    /// One thread on any CPU.
    Thread { tid: pid_t },
}

/// An opened group: the leader owns the ring buffer, followers redirect
/// their records into it.
pub struct EventGroup {
    members: Vec<Counter>,
    ranks: FxHashMap<u64, usize>,
    sample_type: u64,
    regs_mask: u64,
    pub target: GroupTarget,
}

impl EventGroup {
    pub fn open(
        plan: &SessionPlan,
        group_index: usize,
        target: GroupTarget,
        enable_on_exec: bool,
    ) -> Result<EventGroup, CounterError> {
        let event_indices = &plan.groups[group_index];
        let (pid, cpu, inherit) = match target {
            GroupTarget::InheritCpu { pid, cpu } => (pid, cpu as i32, true),
            GroupTarget::Thread { tid } => (tid, -1, false),
        };

        let mut members: Vec<Counter> = Vec::with_capacity(event_indices.len());
        let mut ranks = FxHashMap::default();
        for &event_index in event_indices {
            let spec = &plan.specs[event_index];
            let mut attr = build_attr(
                spec,
                plan.sample_type,
                plan.regs_mask,
                plan.stack_size,
                plan.precise[event_index],
                true,
            );
            if inherit {
                attr.flags |= PERF_ATTR_FLAG_INHERIT;
            }
            if enable_on_exec {
                attr.flags |= PERF_ATTR_FLAG_ENABLE_ON_EXEC;
            }
            let is_leader = members.is_empty();
            let group_fd = if is_leader { -1 } else { members[0].fd() };
            let ring_pages = if is_leader {
                ring_page_count(plan.stack_size)
            } else {
                0
            };
            let counter = Counter::open(&attr, &spec.name, pid, cpu, group_fd, ring_pages)?;
            if !is_leader {
                counter.redirect_output_to(&members[0])?;
            }
            ranks.insert(counter.id(), event_index);
            members.push(counter);
        }

        Ok(EventGroup {
            members,
            ranks,
            sample_type: plan.sample_type,
            regs_mask: plan.regs_mask,
            target,
        })
    }

    /// Leader descriptor, the one to poll.
    pub fn fd(&self) -> RawFd {
        self.members[0].fd()
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.members.iter().map(|m| m.fd()).collect()
    }

    /// Resolves the event rank inside the session event list from the
    /// kernel id attached to a sample.
    pub fn rank_of(&self, id: u64) -> Option<usize> {
        self.ranks.get(&id).copied()
    }

    pub fn enable(&self) -> Result<(), CounterError> {
        for member in &self.members {
            member.enable()?;
        }
        Ok(())
    }

    pub fn disable(&self) -> Result<(), CounterError> {
        for member in &self.members {
            member.disable()?;
        }
        Ok(())
    }

    pub fn has_pending(&mut self) -> bool {
        match self.ring() {
            Some(ring) => ring.has_pending(),
            None => false,
        }
    }

    fn ring(&mut self) -> Option<&mut RingBuffer> {
        self.members[0].ring()
    }

    /// Consumes every pending record of the leader's ring buffer.
    pub fn drain(&mut self, mut consume: impl FnMut(Record, Option<usize>)) {
        let sample_type = self.sample_type;
        let regs_mask = self.regs_mask;
        let ranks = std::mem::take(&mut self.ranks);
        if let Some(ring) = self.ring() {
            ring.drain(|header, payload| {
                if let Some(record) = parse_record(header.kind, payload, sample_type, regs_mask) {
                    let rank = match &record {
                        Record::Sample(sample) => ranks.get(&sample.id).copied(),
                        Record::Lost { id, .. } => ranks.get(id).copied(),
                        _ => None,
                    };
                    consume(record, rank);
                }
            });
        }
        self.ranks = ranks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backtrace_modes_select_sample_fields() {
        assert_eq!(
            BacktraceMode::Off.sample_type(),
            PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_CPU
        );
        assert_ne!(
            BacktraceMode::Call.sample_type() & PERF_SAMPLE_CALLCHAIN,
            0
        );
        assert_ne!(
            BacktraceMode::Stack.sample_type() & PERF_SAMPLE_STACK_USER,
            0
        );
        assert_ne!(
            BacktraceMode::Branch.sample_type() & PERF_SAMPLE_BRANCH_STACK,
            0
        );
    }
}
