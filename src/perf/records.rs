use std::io::Cursor;

use byteorder::{NativeEndian, ReadBytesExt};

use super::sys::*;

/// Frames kept per call chain. The first two (kernel context marker plus
/// a duplicate of the sampled IP) are skipped before this cap applies.
pub const MAX_CALLCHAIN_FRAMES: usize = 100;
const CALLCHAIN_SKIPPED_FRAMES: usize = 2;

/// A fully decoded `PERF_RECORD_SAMPLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub id: u64,
    pub ip: u64,
    pub pid: u32,
    pub tid: u32,
    pub cpu: u32,
    pub callchain: Vec<u64>,
    /// User-register snapshot, present only on the stack-unwinding path.
    pub regs: Vec<u64>,
    /// Copied user-stack bytes, present only on the stack-unwinding path.
    pub stack: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Sample(SampleRecord),
    Lost { id: u64, count: u64 },
    Throttle,
    Unthrottle,
    /// Fully consumed but otherwise ignored.
    Other(u32),
}

/// Decodes one record payload. The `Sample` fields appear in the fixed
/// bit order of the leader's sample-attribute mask; every other type is
/// consumed without interpretation so the ring-buffer tail can advance
/// past it.
pub fn parse_record(
    header_kind: u32,
    payload: &[u8],
    sample_type: u64,
    regs_mask: u64,
) -> Option<Record> {
    match header_kind {
        PERF_RECORD_SAMPLE => parse_sample(payload, sample_type, regs_mask).map(Record::Sample),
        PERF_RECORD_LOST => {
            let mut cursor = Cursor::new(payload);
            let id = cursor.read_u64::<NativeEndian>().ok()?;
            let count = cursor.read_u64::<NativeEndian>().ok()?;
            Some(Record::Lost { id, count })
        }
        PERF_RECORD_THROTTLE => Some(Record::Throttle),
        PERF_RECORD_UNTHROTTLE => Some(Record::Unthrottle),
        other => Some(Record::Other(other)),
    }
}

fn parse_sample(payload: &[u8], sample_type: u64, regs_mask: u64) -> Option<SampleRecord> {
    let mut cursor = Cursor::new(payload);
    let mut sample = SampleRecord {
        id: 0,
        ip: 0,
        pid: 0,
        tid: 0,
        cpu: 0,
        callchain: Vec::new(),
        regs: Vec::new(),
        stack: Vec::new(),
    };

    if sample_type & PERF_SAMPLE_IDENTIFIER != 0 {
        sample.id = cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_IP != 0 {
        sample.ip = cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_TID != 0 {
        sample.pid = cursor.read_u32::<NativeEndian>().ok()?;
        sample.tid = cursor.read_u32::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_TIME != 0 {
        cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_ADDR != 0 {
        cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_ID != 0 {
        sample.id = cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_STREAM_ID != 0 {
        cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_CPU != 0 {
        sample.cpu = cursor.read_u32::<NativeEndian>().ok()?;
        cursor.read_u32::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        cursor.read_u64::<NativeEndian>().ok()?;
    }
    if sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
        let nr = cursor.read_u64::<NativeEndian>().ok()? as usize;
        let mut kept = 0usize;
        for index in 0..nr {
            let frame = cursor.read_u64::<NativeEndian>().ok()?;
            if index < CALLCHAIN_SKIPPED_FRAMES || kept >= MAX_CALLCHAIN_FRAMES {
                continue;
            }
            // Context markers separate kernel/user portions; they are
            // not return addresses.
            if frame >= PERF_CONTEXT_MAX {
                continue;
            }
            sample.callchain.push(frame);
            kept += 1;
        }
    }
    if sample_type & PERF_SAMPLE_RAW != 0 {
        let size = cursor.read_u32::<NativeEndian>().ok()? as u64;
        cursor.set_position(cursor.position() + size);
    }
    if sample_type & PERF_SAMPLE_BRANCH_STACK != 0 {
        let nr = cursor.read_u64::<NativeEndian>().ok()?;
        cursor.set_position(cursor.position() + nr * 3 * 8);
    }
    if sample_type & PERF_SAMPLE_REGS_USER != 0 {
        let abi = cursor.read_u64::<NativeEndian>().ok()?;
        if abi != 0 {
            let count = regs_mask.count_ones() as usize;
            sample.regs.reserve(count);
            for _ in 0..count {
                sample.regs.push(cursor.read_u64::<NativeEndian>().ok()?);
            }
        }
    }
    if sample_type & PERF_SAMPLE_STACK_USER != 0 {
        let size = cursor.read_u64::<NativeEndian>().ok()? as usize;
        if size > 0 {
            let start = cursor.position() as usize;
            let bytes = payload.get(start..start + size)?;
            cursor.set_position((start + size) as u64);
            let dyn_size = cursor.read_u64::<NativeEndian>().ok()? as usize;
            sample.stack.extend_from_slice(&bytes[..dyn_size.min(size)]);
        }
    }

    Some(sample)
}

#[cfg(test)]
mod tests {
    use byteorder::WriteBytesExt;

    use super::*;

    fn push_u64(buffer: &mut Vec<u8>, value: u64) {
        buffer.write_u64::<NativeEndian>(value).unwrap();
    }

    fn push_u32(buffer: &mut Vec<u8>, value: u32) {
        buffer.write_u32::<NativeEndian>(value).unwrap();
    }

    const MASK: u64 =
        PERF_SAMPLE_IDENTIFIER | PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_CPU;

    #[test]
    fn sample_fields_follow_mask_order() {
        let mut payload = Vec::new();
        push_u64(&mut payload, 7); // identifier
        push_u64(&mut payload, 0x401000); // ip
        push_u32(&mut payload, 1234); // pid
        push_u32(&mut payload, 1235); // tid
        push_u32(&mut payload, 3); // cpu
        push_u32(&mut payload, 0); // res

        let record = parse_record(PERF_RECORD_SAMPLE, &payload, MASK, 0).unwrap();
        match record {
            Record::Sample(sample) => {
                assert_eq!(sample.id, 7);
                assert_eq!(sample.ip, 0x401000);
                assert_eq!(sample.pid, 1234);
                assert_eq!(sample.tid, 1235);
                assert_eq!(sample.cpu, 3);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn callchain_skips_two_frames_and_markers() {
        let mask = MASK | PERF_SAMPLE_CALLCHAIN;
        let mut payload = Vec::new();
        push_u64(&mut payload, 7);
        push_u64(&mut payload, 0x401000);
        push_u32(&mut payload, 1);
        push_u32(&mut payload, 1);
        push_u32(&mut payload, 0);
        push_u32(&mut payload, 0);
        push_u64(&mut payload, 5); // nr
        push_u64(&mut payload, PERF_CONTEXT_MAX); // kernel marker (skipped)
        push_u64(&mut payload, 0x401000); // duplicate ip (skipped)
        push_u64(&mut payload, 0x402000);
        push_u64(&mut payload, PERF_CONTEXT_MAX + 1); // marker, dropped
        push_u64(&mut payload, 0x403000);

        let record = parse_record(PERF_RECORD_SAMPLE, &payload, mask, 0).unwrap();
        match record {
            Record::Sample(sample) => {
                assert_eq!(sample.callchain, vec![0x402000, 0x403000]);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn callchain_truncates_to_cap() {
        let mask = PERF_SAMPLE_CALLCHAIN;
        let mut payload = Vec::new();
        push_u64(&mut payload, 300);
        for frame in 0..300u64 {
            push_u64(&mut payload, 0x1000 + frame);
        }
        let record = parse_record(PERF_RECORD_SAMPLE, &payload, mask, 0).unwrap();
        match record {
            Record::Sample(sample) => {
                assert_eq!(sample.callchain.len(), MAX_CALLCHAIN_FRAMES);
                assert_eq!(sample.callchain[0], 0x1002);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }

    #[test]
    fn lost_record_carries_count() {
        let mut payload = Vec::new();
        push_u64(&mut payload, 9);
        push_u64(&mut payload, 42);
        assert_eq!(
            parse_record(PERF_RECORD_LOST, &payload, MASK, 0),
            Some(Record::Lost { id: 9, count: 42 })
        );
    }

    #[test]
    fn unknown_records_are_fully_consumed() {
        let payload = vec![0u8; 24];
        assert_eq!(
            parse_record(PERF_RECORD_MMAP2, &payload, MASK, 0),
            Some(Record::Other(PERF_RECORD_MMAP2))
        );
    }

    #[test]
    fn user_regs_and_stack() {
        let mask = PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
        let regs_mask: u64 = 0b111; // three registers
        let mut payload = Vec::new();
        push_u64(&mut payload, 2); // abi 64
        push_u64(&mut payload, 1);
        push_u64(&mut payload, 2);
        push_u64(&mut payload, 3);
        push_u64(&mut payload, 8); // stack size
        payload.extend_from_slice(&[0xAB; 8]);
        push_u64(&mut payload, 4); // dyn size

        let record = parse_record(PERF_RECORD_SAMPLE, &payload, mask, regs_mask).unwrap();
        match record {
            Record::Sample(sample) => {
                assert_eq!(sample.regs, vec![1, 2, 3]);
                assert_eq!(sample.stack, vec![0xAB; 4]);
            }
            other => panic!("expected sample, got {other:?}"),
        }
    }
}
