use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use libc::{c_void, pid_t};

use crate::error::CounterError;

use super::sys::*;

unsafe fn read_head(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    let head = ptr::read_volatile(&page.data_head);
    fence(Ordering::Acquire);
    head
}

unsafe fn read_tail(pointer: *const u8) -> u64 {
    let page = &*(pointer as *const PerfEventMmapPage);
    // Just reading back a value previously written by us.
    ptr::read_volatile(&page.data_tail)
}

unsafe fn write_tail(pointer: *mut u8, value: u64) {
    let page = &mut *(pointer as *mut PerfEventMmapPage);
    fence(Ordering::AcqRel);
    ptr::write_volatile(&mut page.data_tail, value);
}

const PAGE_SIZE: u64 = 4096;

/// The memory-mapped region shared with the kernel producer: one header
/// page followed by a power-of-two number of data pages.
pub struct RingBuffer {
    buffer: *mut u8,
    size: u64,
    position: u64,
    scratch: Vec<u8>,
}

// A ring buffer is owned by exactly one drainer worker at a time.
unsafe impl Send for RingBuffer {}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buffer as *mut c_void, (self.size + PAGE_SIZE) as _);
        }
    }
}

impl RingBuffer {
    fn map(fd: RawFd, page_count: u32) -> io::Result<Self> {
        let full_size = (PAGE_SIZE * (page_count as u64 + 1)) as usize;
        let buffer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                full_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if buffer == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(RingBuffer {
            buffer: buffer as *mut u8,
            size: PAGE_SIZE * page_count as u64,
            position: 0,
            scratch: Vec::new(),
        })
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        unsafe { read_head(self.buffer) != self.position }
    }

    /// `time_enabled`/`time_running` as maintained by the kernel in the
    /// header page.
    pub fn times(&self) -> (u64, u64) {
        let page = unsafe { &*(self.buffer as *const PerfEventMmapPage) };
        unsafe {
            (
                ptr::read_volatile(&page.time_enabled),
                ptr::read_volatile(&page.time_running),
            )
        }
    }

    /// Consumes every pending record, handing `(header, payload)` to the
    /// callback. Each record is consumed in full before the tail moves,
    /// unknown types included, otherwise the head/tail invariant breaks.
    pub fn drain(&mut self, mut consume: impl FnMut(PerfEventHeader, &[u8])) {
        let head = unsafe { read_head(self.buffer) };
        let data = unsafe { slice::from_raw_parts(self.buffer.offset(PAGE_SIZE as isize), self.size as usize) };
        let header_len = mem::size_of::<PerfEventHeader>();

        while self.position != head {
            let offset = (self.position % self.size) as usize;
            debug_assert!(offset + header_len <= data.len());
            let header =
                unsafe { ptr::read_unaligned(data[offset..].as_ptr() as *const PerfEventHeader) };
            let total = header.size as usize;
            if total < header_len {
                // Corrupt ring buffer; drop everything still pending.
                log::error!("ring buffer corruption: record size {total} below header size");
                self.position = head;
                break;
            }
            let payload_len = total - header_len;
            let payload_start = offset + header_len;

            if payload_start + payload_len <= data.len() {
                consume(header, &data[payload_start..payload_start + payload_len]);
            } else {
                // Record wraps around the end of the buffer.
                self.scratch.clear();
                let first = &data[payload_start.min(data.len())..];
                self.scratch.extend_from_slice(first);
                let rest = payload_len - first.len();
                self.scratch.extend_from_slice(&data[..rest]);
                let (scratch, header_copy) = (&self.scratch, header);
                consume(header_copy, scratch);
            }

            self.position += total as u64;
        }

        let tail = unsafe { read_tail(self.buffer) };
        if tail != self.position {
            unsafe { write_tail(self.buffer, self.position) };
        }
    }
}

/// Computes the number of data pages for a ring buffer able to absorb
/// `stack_size`-byte user-stack snapshots without immediate overflow.
pub fn ring_page_count(stack_size: u32) -> u32 {
    const STACK_COUNT_PER_BUFFER: u32 = 32;
    let required_space = stack_size.max(4096) * STACK_COUNT_PER_BUFFER;
    let n = (1..26)
        .find(|n| (1_u32 << n) * PAGE_SIZE as u32 >= required_space)
        .unwrap_or(25);
    (1_u32 << n).max(16)
}

/// One perf-event file descriptor, optionally owning the group's ring
/// buffer (the leader does, followers redirect their output into it).
pub struct Counter {
    fd: RawFd,
    id: u64,
    name: String,
    ring: Option<RingBuffer>,
}

impl Drop for Counter {
    fn drop(&mut self) {
        // Unmap before close: the ring holds a reference to the fd's vma.
        self.ring = None;
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Counter {
    /// Opens one descriptor. `group_fd` is `-1` for a leader. The ring
    /// buffer is mapped only when `ring_pages` is non-zero.
    pub fn open(
        attr: &PerfEventAttr,
        name: &str,
        pid: pid_t,
        cpu: i32,
        group_fd: RawFd,
        ring_pages: u32,
    ) -> Result<Counter, CounterError> {
        let fd = sys_perf_event_open(attr, pid, cpu, group_fd, PERF_FLAG_FD_CLOEXEC);
        if fd < 0 {
            return Err(CounterError::Open {
                event: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        let ring = if ring_pages > 0 {
            match RingBuffer::map(fd, ring_pages) {
                Ok(ring) => Some(ring),
                Err(source) => {
                    unsafe { libc::close(fd) };
                    return Err(CounterError::Mmap {
                        event: name.to_string(),
                        source,
                    });
                }
            }
        } else {
            None
        };

        let mut counter = Counter {
            fd,
            id: 0,
            name: name.to_string(),
            ring,
        };
        counter.id = counter.kernel_id()?;
        Ok(counter)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Kernel-assigned event id, used to resolve the member rank of a
    /// sample inside its group.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ring(&mut self) -> Option<&mut RingBuffer> {
        self.ring.as_mut()
    }

    pub fn has_ring(&self) -> bool {
        self.ring.is_some()
    }

    fn kernel_id(&self) -> Result<u64, CounterError> {
        let mut id: u64 = 0;
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_ID as _, &mut id) };
        if result == -1 {
            return Err(CounterError::Ioctl {
                op: "ID",
                event: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(id)
    }

    /// Routes this follower's records into the leader's ring buffer.
    pub fn redirect_output_to(&self, leader: &Counter) -> Result<(), CounterError> {
        let result = unsafe { libc::ioctl(self.fd, PERF_EVENT_IOC_SET_OUTPUT as _, leader.fd) };
        if result == -1 {
            return Err(CounterError::Ioctl {
                op: "SET_OUTPUT",
                event: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub fn enable(&self) -> Result<(), CounterError> {
        self.simple_ioctl(PERF_EVENT_IOC_ENABLE, "ENABLE")
    }

    pub fn disable(&self) -> Result<(), CounterError> {
        self.simple_ioctl(PERF_EVENT_IOC_DISABLE, "DISABLE")
    }

    pub fn reset(&self) -> Result<(), CounterError> {
        self.simple_ioctl(PERF_EVENT_IOC_RESET, "RESET")
    }

    fn simple_ioctl(&self, op: libc::c_ulong, op_name: &'static str) -> Result<(), CounterError> {
        let result = unsafe { libc::ioctl(self.fd, op as _) };
        if result == -1 {
            return Err(CounterError::Ioctl {
                op: op_name,
                event: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Counting-mode read. With `PERF_FORMAT_TOTAL_TIME_ENABLED |
    /// PERF_FORMAT_TOTAL_TIME_RUNNING` the kernel hands back
    /// `(value, time_enabled, time_running)`.
    pub fn read_counts(&self) -> Result<CounterCounts, CounterError> {
        let mut values = [0u64; 3];
        let wanted = mem::size_of_val(&values);
        let got = unsafe { libc::read(self.fd, values.as_mut_ptr() as *mut c_void, wanted) };
        if got != wanted as isize {
            return Err(CounterError::Read {
                event: self.name.clone(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(CounterCounts {
            value: values[0],
            time_enabled: values[1],
            time_running: values[2],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CounterCounts {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl CounterCounts {
    /// Fraction of its enabled time the event actually spent on the
    /// PMU. Below 0.95 the kernel was multiplexing it.
    pub fn scheduling_ratio(&self) -> f64 {
        if self.time_enabled == 0 {
            return 1.0;
        }
        self.time_running as f64 / self.time_enabled as f64
    }
}

pub fn paranoid_level() -> Option<i32> {
    let data = std::fs::read_to_string("/proc/sys/kernel/perf_event_paranoid").ok()?;
    data.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_count_is_power_of_two_with_floor() {
        assert_eq!(ring_page_count(0), 32);
        assert_eq!(ring_page_count(4096), 32);
        let pages = ring_page_count(63 * 1024);
        assert!(pages.is_power_of_two());
        assert!(pages as u64 * PAGE_SIZE >= 63 * 1024 * 32);
    }

    #[test]
    fn scheduling_ratio_handles_zero_enabled() {
        let counts = CounterCounts {
            value: 0,
            time_enabled: 0,
            time_running: 0,
        };
        assert_eq!(counts.scheduling_ratio(), 1.0);
    }
}
