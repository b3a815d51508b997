use std::path::Path;

use memchr::memchr;

use super::interval_tree::IntervalTree;

/// Kernel symbols loaded from a node's `system_map` file.
///
/// Symbols are sorted by address; each entry covers `[addr, next_addr - 1]`
/// and a trailing sentinel covers `[last_addr, u64::MAX]`, so any kernel
/// address resolves to its nearest preceding symbol.
#[derive(Debug, Clone, Default)]
pub struct KernelSymbols {
    pub names: Vec<String>,
    pub tree: IntervalTree<usize>,
}

struct SystemMapIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for SystemMapIter<'a> {
    type Item = (u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.remaining.is_empty() {
            let line = match memchr(b'\n', self.remaining) {
                Some(end) => {
                    let line = &self.remaining[..end];
                    self.remaining = &self.remaining[end + 1..];
                    line
                }
                None => {
                    let line = self.remaining;
                    self.remaining = &[];
                    line
                }
            };
            // Format: <hex address> <space> <type letter> <space> <name>
            let mut fields = line.split(|&b| b == b' ').filter(|f| !f.is_empty());
            let address = match fields
                .next()
                .and_then(|f| std::str::from_utf8(f).ok())
                .and_then(|f| u64::from_str_radix(f, 16).ok())
            {
                Some(address) => address,
                None => continue,
            };
            let _kind = fields.next();
            let name = match fields.next() {
                Some(name) => name,
                None => continue,
            };
            return Some((address, name));
        }
        None
    }
}

pub fn parse_system_map(data: &[u8]) -> KernelSymbols {
    let mut entries: Vec<(u64, String)> = SystemMapIter { remaining: data }
        .map(|(address, name)| (address, String::from_utf8_lossy(name).into_owned()))
        .collect();
    entries.sort_by_key(|(address, _)| *address);

    let mut symbols = KernelSymbols::default();
    for (index, (address, name)) in entries.iter().enumerate() {
        let stop = match entries.get(index + 1) {
            Some((next_address, _)) if *next_address > *address => next_address - 1,
            Some(_) => *address,
            // Trailing sentinel: the last symbol owns everything above.
            None => u64::MAX,
        };
        symbols.names.push(name.clone());
        symbols.tree.insert(*address, stop, index);
    }
    symbols
}

pub fn load_system_map(path: &Path) -> std::io::Result<KernelSymbols> {
    let data = std::fs::read(path)?;
    Ok(parse_system_map(&data))
}

impl KernelSymbols {
    pub fn lookup(&self, address: u64) -> Option<&str> {
        let index = self.tree.lookup(address)?;
        Some(&self.names[*index])
    }
}
