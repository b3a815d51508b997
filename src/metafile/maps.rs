use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

/// One line of `/proc/<pid>/maps`, reduced to what range derivation
/// needs: the mapped window, whether it is executable, and the backing
/// path (empty for anonymous mappings).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MapsEntry {
    pub start: u64,
    pub end: u64,
    pub executable: bool,
    pub path: String,
}

fn next_field<'a>(line: &mut &'a str) -> Option<&'a str> {
    *line = line.trim_start();
    if line.is_empty() {
        return None;
    }
    let split = line.find(' ').unwrap_or(line.len());
    let (field, rest) = line.split_at(split);
    *line = rest;
    Some(field)
}

fn parse_line(mut line: &str) -> Option<MapsEntry> {
    let (start, end) = next_field(&mut line)?.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let perms = next_field(&mut line)?.as_bytes();
    let executable = perms.get(2) == Some(&b'x');
    u64::from_str_radix(next_field(&mut line)?, 16).ok()?; // file offset
    next_field(&mut line)?; // device
    next_field(&mut line)?; // inode
    let path = line.trim_start().to_owned();
    Some(MapsEntry {
        start,
        end,
        executable,
        path,
    })
}

/// Parses the content of a `/proc/<pid>/maps` file. Malformed lines are
/// skipped; the file is re-read live and can be torn mid-line.
pub fn parse(maps: &str) -> Vec<MapsEntry> {
    maps.lines().filter_map(parse_line).collect()
}

pub fn read_string_lossy<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let data = fs::read(path)?;
    Ok(String::from_utf8_lossy(&data).into_owned())
}

/// Copies `/proc/<pid>/maps` to `dest` in one read, preserving the raw
/// text for later range derivation.
pub fn snapshot_maps(pid: u32, dest: &Path) -> io::Result<()> {
    let data = fs::read(format!("/proc/{pid}/maps"))?;
    fs::write(dest, data)
}

/// Pids whose command basename matches `name`, like pidof(8).
pub fn pidof(name: &str) -> Vec<u32> {
    let target = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let mut pids = Vec::new();
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return pids,
    };
    for entry in entries.flatten() {
        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(pid) => pid,
            Err(_) => continue,
        };
        let comm = match fs::read_to_string(format!("/proc/{pid}/comm")) {
            Ok(comm) => comm,
            Err(_) => continue,
        };
        // comm is truncated to 15 characters by the kernel.
        let comm = comm.trim_end();
        if comm == target || (comm.len() == 15 && target.starts_with(comm)) {
            pids.push(pid);
        }
    }
    pids
}

/// One library's mapped address window for a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibRange {
    pub name: String,
    pub start: u64,
    pub stop: u64,
}

/// Unions all maps snapshots of a process: every distinct executable
/// file mapping keeps the smallest start and largest end seen across
/// snapshots. `probe` is the disassembler validity check, consulted at
/// most once per name.
pub fn derive_lib_ranges(
    snapshots: &[String],
    mut probe: impl FnMut(&str) -> bool,
) -> Vec<LibRange> {
    let mut ranges: FxHashMap<String, (u64, u64)> = FxHashMap::default();
    let mut order: Vec<String> = Vec::new();
    for snapshot in snapshots {
        for entry in parse(snapshot) {
            if !entry.executable || entry.path.is_empty() || entry.path.starts_with('[') {
                continue;
            }
            match ranges.get_mut(&entry.path) {
                Some((start, stop)) => {
                    *start = (*start).min(entry.start);
                    *stop = (*stop).max(entry.end);
                }
                None => {
                    ranges.insert(entry.path.clone(), (entry.start, entry.end));
                    order.push(entry.path);
                }
            }
        }
    }

    let mut probe_cache: FxHashMap<String, bool> = FxHashMap::default();
    order
        .into_iter()
        .filter_map(|name| {
            let valid = *probe_cache
                .entry(name.clone())
                .or_insert_with(|| probe(&name));
            if !valid {
                return None;
            }
            let (start, stop) = ranges[&name];
            Some(LibRange { name, start, stop })
        })
        .collect()
}

/// Smallest mapped address of the executable itself, identified by
/// basename match against the target command.
pub fn executable_base(snapshots: &[String], exe_basename: &str) -> Option<u64> {
    let mut base: Option<u64> = None;
    for snapshot in snapshots {
        for entry in parse(snapshot) {
            let name = match Path::new(&entry.path).file_name() {
                Some(name) => name.to_string_lossy(),
                None => continue,
            };
            if name == exe_basename {
                base = Some(base.map_or(entry.start, |b: u64| b.min(entry.start)));
            }
        }
    }
    base
}

/// `lib_ranges.lprof`: a packed sequence of
/// `{u64 name length, name bytes, u64 start, u64 stop}`.
pub fn write_lib_ranges(path: &Path, ranges: &[LibRange]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for range in ranges {
        writer.write_u64::<LittleEndian>(range.name.len() as u64)?;
        writer.write_all(range.name.as_bytes())?;
        writer.write_u64::<LittleEndian>(range.start)?;
        writer.write_u64::<LittleEndian>(range.stop)?;
    }
    writer.flush()
}

pub fn read_lib_ranges(path: &Path) -> io::Result<Vec<LibRange>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut ranges = Vec::new();
    loop {
        let len = match reader.read_u64::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut name = vec![0u8; len];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let start = reader.read_u64::<LittleEndian>()?;
        let stop = reader.read_u64::<LittleEndian>()?;
        ranges.push(LibRange { name, start, stop });
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAP_A: &str = "\
00400000-00401000 r-xp 00000000 08:02 10 /opt/app/busy
00600000-00610000 rw-p 00000000 00:00 0 [heap]
7f0000000000-7f0000010000 r-xp 00000000 08:02 11 /usr/lib/libfoo.so.1
7f0000020000-7f0000030000 rw-p 00000000 08:02 11 /usr/lib/libfoo.so.1
";
    const SNAP_B: &str = "\
00400000-00402000 r-xp 00000000 08:02 10 /opt/app/busy
7f0000005000-7f0000018000 r-xp 00000000 08:02 11 /usr/lib/libfoo.so.1
7f0000040000-7f0000050000 r-xp 00000000 08:02 12 /usr/lib/libbad.so
";

    #[test]
    fn maps_lines_parse_field_wise() {
        let entries = parse(SNAP_A);
        assert_eq!(entries.len(), 4);
        assert_eq!(
            entries[0],
            MapsEntry {
                start: 0x400000,
                end: 0x401000,
                executable: true,
                path: "/opt/app/busy".to_owned(),
            }
        );
        assert!(!entries[1].executable);
        assert_eq!(entries[1].path, "[heap]");
    }

    #[test]
    fn anonymous_mappings_have_empty_paths() {
        let entries = parse("7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0\n");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "");
    }

    #[test]
    fn padded_path_columns_survive() {
        // The path column of a real maps file is padded with spaces.
        let entries =
            parse("00400000-00401000 r-xp 00000000 08:02 10                    /opt/a b/busy\n");
        assert_eq!(entries[0].path, "/opt/a b/busy");
    }

    #[test]
    fn torn_and_empty_input_is_tolerated() {
        assert!(parse("").is_empty());
        let entries = parse("garbage\n00400000-00401000 r-xp 00000000 08:02 10 /bin/x\n0060");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/bin/x");
    }

    #[test]
    fn lib_ranges_union_across_snapshots() {
        let snapshots = vec![SNAP_A.to_string(), SNAP_B.to_string()];
        let mut probed = Vec::new();
        let ranges = derive_lib_ranges(&snapshots, |name| {
            probed.push(name.to_string());
            !name.contains("libbad")
        });

        assert_eq!(ranges.len(), 2);
        let foo = ranges.iter().find(|r| r.name.contains("libfoo")).unwrap();
        assert_eq!(foo.start, 0x7f0000000000);
        assert_eq!(foo.stop, 0x7f0000018000);
        // The probe ran once per distinct name, writable mappings and
        // all snapshots notwithstanding.
        assert_eq!(
            probed.iter().filter(|n| n.contains("libfoo")).count(),
            1
        );
    }

    #[test]
    fn executable_base_is_smallest_mapping() {
        let snapshots = vec![SNAP_A.to_string(), SNAP_B.to_string()];
        assert_eq!(executable_base(&snapshots, "busy"), Some(0x400000));
        assert_eq!(executable_base(&snapshots, "other"), None);
    }

    #[test]
    fn lib_ranges_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lib_ranges.lprof");
        let ranges = vec![
            LibRange {
                name: "/usr/lib/libfoo.so.1".into(),
                start: 0x7f0000000000,
                stop: 0x7f0000018000,
            },
            LibRange {
                name: "/lib/ld-linux.so.2".into(),
                start: 0x3000000000,
                stop: 0x3000040000,
            },
        ];
        write_lib_ranges(&path, &ranges).unwrap();
        assert_eq!(read_lib_ranges(&path).unwrap(), ranges);
    }
}
