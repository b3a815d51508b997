use rustc_hash::FxHashMap;

use crate::experiment::loader::{Node, Process};
use crate::experiment::AddressTrees;

/// Mapped-address window whose libraries are looked up without base
/// subtraction: the loader places `libc`/`ld` there with absolute
/// metadata addresses. Empirical and tied to a specific loader layout,
/// hence configurable.
pub const DEFAULT_NO_SUBTRACT_WINDOW: (u64, u64) = (0x30_0000_0000, 0x40_0000_0000);

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub no_subtract_window: (u64, u64),
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            no_subtract_window: DEFAULT_NO_SUBTRACT_WINDOW,
        }
    }
}

/// Where one instruction address resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Function index in the executable metadata.
    BinaryFn(usize),
    /// (library index in the node, function index in that library).
    LibraryFn { library: usize, function: usize },
    /// Symbol index in the node's kernel map.
    Kernel(usize),
    /// The per-node "Unknown functions" sink.
    Unknown,
}

/// A resolved loop: library index (`-1` = executable) plus loop index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopPlace {
    pub library: i32,
    pub index: usize,
}

/// Per-node address resolver with a per-process lookup cache to
/// short-circuit repeated addresses.
pub struct Resolver<'a> {
    exe_trees: &'a AddressTrees,
    node: &'a Node,
    config: ResolverConfig,
    cache: FxHashMap<(u32, u64), Resolution>,
}

impl<'a> Resolver<'a> {
    pub fn new(exe_trees: &'a AddressTrees, node: &'a Node, config: ResolverConfig) -> Self {
        Resolver {
            exe_trees,
            node,
            config,
            cache: FxHashMap::default(),
        }
    }

    fn in_no_subtract_window(&self, address: u64) -> bool {
        let (low, high) = self.config.no_subtract_window;
        address >= low && address < high
    }

    fn library_lookup_address(&self, ip: u64, start: u64) -> u64 {
        if self.in_no_subtract_window(start) {
            ip
        } else {
            ip - start
        }
    }

    /// Function lookup: executable (offset-adjusted), then the process's
    /// library windows, then the kernel map, else the unknown sink.
    pub fn resolve_function(&mut self, process: &Process, ip: u64) -> Resolution {
        if let Some(&hit) = self.cache.get(&(process.pid, ip)) {
            return hit;
        }
        let resolution = self.resolve_function_uncached(process, ip);
        self.cache.insert((process.pid, ip), resolution);
        resolution
    }

    fn resolve_function_uncached(&self, process: &Process, ip: u64) -> Resolution {
        if ip >= process.binary_offset {
            if let Some(&function) = self.exe_trees.functions.lookup(ip - process.binary_offset) {
                return Resolution::BinaryFn(function);
            }
        }

        for (library_index, library) in self.node.libraries.iter().enumerate() {
            let Some(&(start, stop)) = library.ranges_by_process.get(&process.pid) else {
                continue;
            };
            if ip < start || ip > stop {
                continue;
            }
            let address = self.library_lookup_address(ip, start);
            if let Some(&function) = library.trees.functions.lookup(address) {
                return Resolution::LibraryFn {
                    library: library_index,
                    function,
                };
            }
            // The first containing window decides; a tree miss inside
            // it does not fall through to other libraries.
            break;
        }

        if let Some(kernel) = &self.node.kernel {
            if let Some(&symbol) = kernel.tree.lookup(ip) {
                return Resolution::Kernel(symbol);
            }
        }

        Resolution::Unknown
    }

    /// Loop lookup mirrors the function lookup but never consults the
    /// kernel map: loops are not resolved in system code.
    pub fn resolve_loop(&self, process: &Process, ip: u64) -> Option<LoopPlace> {
        if ip >= process.binary_offset {
            if let Some(&index) = self.exe_trees.loops.lookup(ip - process.binary_offset) {
                return Some(LoopPlace { library: -1, index });
            }
        }
        for (library_index, library) in self.node.libraries.iter().enumerate() {
            let Some(&(start, stop)) = library.ranges_by_process.get(&process.pid) else {
                continue;
            };
            if ip < start || ip > stop {
                continue;
            }
            let address = self.library_lookup_address(ip, start);
            return library.trees.loops.lookup(address).map(|&index| LoopPlace {
                library: library_index as i32,
                index,
            });
        }
        None
    }

    pub fn node(&self) -> &Node {
        self.node
    }
}
