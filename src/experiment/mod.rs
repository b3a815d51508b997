pub mod interval_tree;
pub mod kernel_symbols;
pub mod layout;
pub mod loader;

pub use interval_tree::IntervalTree;
pub use kernel_symbols::{load_system_map, parse_system_map, KernelSymbols};
pub use layout::{read_processes_index, write_processes_index, ExperimentLayout};
pub use loader::{
    build_trees, load_experiment, AddressTrees, Experiment, Library, Node, Process, Thread,
    BINARY_LIBRARY_INDEX, SYSTEM_LIBRARY_INDEX,
};
