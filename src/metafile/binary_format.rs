use std::fs::File;
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

use crate::error::ExperimentError;

pub const LPROF_MAGIC: &[u8; 8] = b"<LPROF>\0";
pub const LPROF_VERSION_MAJOR: u32 = 2;
pub const LPROF_VERSION_MINOR: u32 = 2;

/// Byte offset into the string pool standing for "no string".
const NO_STRING: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopLevel {
    Outermost = 0,
    Innermost = 1,
    Single = 2,
    InBetween = 3,
}

impl LoopLevel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LoopLevel::Outermost),
            1 => Some(LoopLevel::Innermost),
            2 => Some(LoopLevel::Single),
            3 => Some(LoopLevel::InBetween),
            _ => None,
        }
    }

    pub fn is_outermost_or_single(self) -> bool {
        matches!(self, LoopLevel::Outermost | LoopLevel::Single)
    }
}

/// A function: a name, one or more disjoint address ranges, an optional
/// source location, and the ids of its outermost loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub name: String,
    pub ranges: Vec<(u64, u64)>,
    pub src_file: Option<String>,
    pub src_line: u32,
    pub outermost_loops: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub id: u64,
    pub start: u64,
    pub stop: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRecord {
    pub id: u32,
    pub ranges: Vec<(u64, u64)>,
    pub blocks: Vec<BlockRecord>,
    pub src_file: Option<String>,
    pub src_function_name: String,
    pub src_function_line: u32,
    pub src_start_line: u32,
    pub src_stop_line: u32,
    pub level: LoopLevel,
    pub children: Vec<u32>,
}

/// The function/loop model of one binary (executable or library).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BinaryMetadata {
    pub functions: Vec<FunctionRecord>,
    pub loops: Vec<LoopRecord>,
}

struct StringPool {
    bytes: Vec<u8>,
    offsets: FxHashMap<String, u64>,
}

impl StringPool {
    fn new() -> Self {
        StringPool {
            bytes: Vec::new(),
            offsets: FxHashMap::default(),
        }
    }

    fn intern(&mut self, text: &str) -> u64 {
        if let Some(&offset) = self.offsets.get(text) {
            return offset;
        }
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(text.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(text.to_string(), offset);
        offset
    }

    fn intern_opt(&mut self, text: Option<&str>) -> u64 {
        match text {
            Some(text) => self.intern(text),
            None => NO_STRING,
        }
    }
}

fn write_ranges<W: Write>(writer: &mut W, ranges: &[(u64, u64)]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(ranges.len() as u32)?;
    for &(start, stop) in ranges {
        writer.write_u64::<LittleEndian>(start)?;
        writer.write_u64::<LittleEndian>(stop)?;
    }
    Ok(())
}

fn read_ranges<R: Read>(reader: &mut R) -> io::Result<Vec<(u64, u64)>> {
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut ranges = Vec::with_capacity(count);
    for _ in 0..count {
        let start = reader.read_u64::<LittleEndian>()?;
        let stop = reader.read_u64::<LittleEndian>()?;
        ranges.push((start, stop));
    }
    Ok(ranges)
}

fn write_id_list<W: Write>(writer: &mut W, ids: &[u32]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(ids.len() as u32)?;
    for &id in ids {
        writer.write_u32::<LittleEndian>(id)?;
    }
    Ok(())
}

fn read_id_list<R: Read>(reader: &mut R) -> io::Result<Vec<u32>> {
    let count = reader.read_u32::<LittleEndian>()? as usize;
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        ids.push(reader.read_u32::<LittleEndian>()?);
    }
    Ok(ids)
}

/// Serializes a metadata file: magic, ASCII version, little-endian
/// offsets to the functions section, loops section and string pool,
/// then the sections themselves. All string references inside records
/// are byte offsets into the pool.
pub fn write_metadata_file(path: &Path, metadata: &BinaryMetadata) -> io::Result<()> {
    let mut pool = StringPool::new();
    let mut functions = Vec::new();
    functions.write_u32::<LittleEndian>(metadata.functions.len() as u32)?;
    for function in &metadata.functions {
        let name = pool.intern(&function.name);
        let src_file = pool.intern_opt(function.src_file.as_deref());
        functions.write_u64::<LittleEndian>(name)?;
        write_ranges(&mut functions, &function.ranges)?;
        functions.write_u64::<LittleEndian>(src_file)?;
        functions.write_u32::<LittleEndian>(function.src_line)?;
        write_id_list(&mut functions, &function.outermost_loops)?;
    }

    let mut loops = Vec::new();
    loops.write_u32::<LittleEndian>(metadata.loops.len() as u32)?;
    for l in &metadata.loops {
        loops.write_u32::<LittleEndian>(l.id)?;
        write_ranges(&mut loops, &l.ranges)?;
        loops.write_u32::<LittleEndian>(l.blocks.len() as u32)?;
        for block in &l.blocks {
            loops.write_u64::<LittleEndian>(block.id)?;
            loops.write_u64::<LittleEndian>(block.start)?;
            loops.write_u64::<LittleEndian>(block.stop)?;
        }
        loops.write_u64::<LittleEndian>(pool.intern_opt(l.src_file.as_deref()))?;
        loops.write_u64::<LittleEndian>(pool.intern(&l.src_function_name))?;
        loops.write_u32::<LittleEndian>(l.src_function_line)?;
        loops.write_u32::<LittleEndian>(l.src_start_line)?;
        loops.write_u32::<LittleEndian>(l.src_stop_line)?;
        loops.write_u8(l.level as u8)?;
        write_id_list(&mut loops, &l.children)?;
    }

    let header_len = 8 + 4 + 3 * 8;
    let functions_offset = header_len as u64;
    let loops_offset = functions_offset + functions.len() as u64;
    let pool_offset = loops_offset + loops.len() as u64;

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(LPROF_MAGIC)?;
    let version = format!("{LPROF_VERSION_MAJOR}.{LPROF_VERSION_MINOR}");
    let mut version_bytes = [0u8; 4];
    version_bytes[..version.len().min(4)].copy_from_slice(&version.as_bytes()[..version.len().min(4)]);
    writer.write_all(&version_bytes)?;
    writer.write_u64::<LittleEndian>(functions_offset)?;
    writer.write_u64::<LittleEndian>(loops_offset)?;
    writer.write_u64::<LittleEndian>(pool_offset)?;
    writer.write_all(&functions)?;
    writer.write_all(&loops)?;
    writer.write_u64::<LittleEndian>(pool.bytes.len() as u64)?;
    writer.write_all(&pool.bytes)?;
    writer.flush()
}

fn pool_string(pool: &[u8], offset: u64, path: &Path) -> Result<Option<String>, ExperimentError> {
    if offset == NO_STRING {
        return Ok(None);
    }
    let start = offset as usize;
    let end = pool[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or_else(|| ExperimentError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("unterminated string at pool offset {offset}"),
        })?;
    String::from_utf8(pool[start..end].to_vec())
        .map(Some)
        .map_err(|_| ExperimentError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("non-UTF-8 string at pool offset {offset}"),
        })
}

/// Reads back the magic and the `major.minor` ASCII version.
pub fn read_header(data: &[u8], path: &Path) -> Result<(u32, u32), ExperimentError> {
    if data.len() < 12 || &data[..8] != LPROF_MAGIC {
        return Err(ExperimentError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let version = &data[8..12];
    let text: String = version
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    let mut parts = text.split('.');
    let major: u32 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ExperimentError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("bad version string {text:?}"),
        })?;
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major, minor))
}

/// Loads a metadata file, verifying magic and version. A major version
/// below 2 aborts loading.
pub fn read_metadata_file(path: &Path) -> Result<(u32, u32, BinaryMetadata), ExperimentError> {
    let read_err = |source| ExperimentError::Read {
        path: path.to_path_buf(),
        source,
    };
    let corrupt = |reason: String| ExperimentError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let data = std::fs::read(path).map_err(read_err)?;
    let (major, minor) = read_header(&data, path)?;
    if major < LPROF_VERSION_MAJOR {
        return Err(ExperimentError::UnsupportedVersion {
            path: path.to_path_buf(),
            major,
        });
    }

    let mut cursor = Cursor::new(&data[12..]);
    let functions_offset = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated header".into()))?;
    let loops_offset = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated header".into()))?;
    let pool_offset = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| corrupt("truncated header".into()))?;

    let pool_start = pool_offset as usize;
    if pool_start + 8 > data.len() {
        return Err(corrupt("string pool offset out of bounds".into()));
    }
    let pool_len =
        u64::from_le_bytes(data[pool_start..pool_start + 8].try_into().unwrap()) as usize;
    let pool = data
        .get(pool_start + 8..pool_start + 8 + pool_len)
        .ok_or_else(|| corrupt("string pool truncated".into()))?;

    let mut cursor = Cursor::new(
        data.get(functions_offset as usize..loops_offset as usize)
            .ok_or_else(|| corrupt("functions section out of bounds".into()))?,
    );
    let io_corrupt = |e: io::Error| corrupt(format!("functions section: {e}"));
    let count = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;
    let mut functions = Vec::with_capacity(count);
    for _ in 0..count {
        let name_offset = cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?;
        let ranges = read_ranges(&mut cursor).map_err(io_corrupt)?;
        let src_file_offset = cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?;
        let src_line = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let outermost_loops = read_id_list(&mut cursor).map_err(io_corrupt)?;
        functions.push(FunctionRecord {
            name: pool_string(pool, name_offset, path)?
                .ok_or_else(|| corrupt("function without a name".into()))?,
            ranges,
            src_file: pool_string(pool, src_file_offset, path)?,
            src_line,
            outermost_loops,
        });
    }

    let mut cursor = Cursor::new(
        data.get(loops_offset as usize..pool_offset as usize)
            .ok_or_else(|| corrupt("loops section out of bounds".into()))?,
    );
    let io_corrupt = |e: io::Error| corrupt(format!("loops section: {e}"));
    let count = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;
    let mut loops = Vec::with_capacity(count);
    for _ in 0..count {
        let id = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let ranges = read_ranges(&mut cursor).map_err(io_corrupt)?;
        let block_count = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks.push(BlockRecord {
                id: cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?,
                start: cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?,
                stop: cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?,
            });
        }
        let src_file_offset = cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?;
        let fn_name_offset = cursor.read_u64::<LittleEndian>().map_err(io_corrupt)?;
        let src_function_line = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let src_start_line = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let src_stop_line = cursor.read_u32::<LittleEndian>().map_err(io_corrupt)?;
        let level = cursor.read_u8().map_err(io_corrupt)?;
        let children = read_id_list(&mut cursor).map_err(io_corrupt)?;
        loops.push(LoopRecord {
            id,
            ranges,
            blocks,
            src_file: pool_string(pool, src_file_offset, path)?,
            src_function_name: pool_string(pool, fn_name_offset, path)?
                .ok_or_else(|| corrupt("loop without an enclosing function name".into()))?,
            src_function_line,
            src_start_line,
            src_stop_line,
            level: LoopLevel::from_u8(level)
                .ok_or_else(|| corrupt(format!("bad loop level {level}")))?,
            children,
        });
    }

    Ok((major, minor, BinaryMetadata { functions, loops }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> BinaryMetadata {
        BinaryMetadata {
            functions: vec![
                FunctionRecord {
                    name: "compute_kernel".into(),
                    ranges: vec![(0x1000, 0x10ff), (0x2000, 0x20ff)],
                    src_file: Some("kernel.c".into()),
                    src_line: 42,
                    outermost_loops: vec![1],
                },
                FunctionRecord {
                    name: "main".into(),
                    ranges: vec![(0x3000, 0x3fff)],
                    src_file: None,
                    src_line: 0,
                    outermost_loops: vec![],
                },
            ],
            loops: vec![LoopRecord {
                id: 1,
                ranges: vec![(0x1010, 0x1080)],
                blocks: vec![
                    BlockRecord {
                        id: 5,
                        start: 0x1010,
                        stop: 0x1040,
                    },
                    BlockRecord {
                        id: 6,
                        start: 0x1041,
                        stop: 0x1080,
                    },
                ],
                src_file: Some("kernel.c".into()),
                src_function_name: "compute_kernel".into(),
                src_function_line: 42,
                src_start_line: 50,
                src_stop_line: 60,
                level: LoopLevel::Single,
                children: vec![],
            }],
        }
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.lprof");
        let metadata = sample_metadata();
        write_metadata_file(&path, &metadata).unwrap();
        let (major, minor, reloaded) = read_metadata_file(&path).unwrap();
        assert_eq!((major, minor), (LPROF_VERSION_MAJOR, LPROF_VERSION_MINOR));
        assert_eq!(reloaded, metadata);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.lprof");
        std::fs::write(&path, b"not an lprof file").unwrap();
        assert!(matches!(
            read_metadata_file(&path),
            Err(ExperimentError::BadMagic { .. })
        ));
    }

    #[test]
    fn old_major_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.lprof");
        let metadata = sample_metadata();
        write_metadata_file(&path, &metadata).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8] = b'1'; // forge version "1.2"
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_metadata_file(&path),
            Err(ExperimentError::UnsupportedVersion { major: 1, .. })
        ));
    }

    #[test]
    fn header_parses_version() {
        let mut data = Vec::new();
        data.extend_from_slice(LPROF_MAGIC);
        data.extend_from_slice(b"2.0\0");
        let (major, minor) = read_header(&data, Path::new("x")).unwrap();
        assert_eq!((major, minor), (2, 0));
    }

    #[test]
    fn loop_ranges_are_contained_in_blocks() {
        // Invariant check helper for the writer's inputs.
        let metadata = sample_metadata();
        for l in &metadata.loops {
            for &(start, stop) in &l.ranges {
                assert!(l
                    .blocks
                    .iter()
                    .any(|b| b.start <= start && stop <= b.stop)
                    || l.blocks.iter().any(|b| b.start <= start)
                        && l.blocks.iter().any(|b| stop <= b.stop));
            }
        }
    }
}
