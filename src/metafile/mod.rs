pub mod binary_format;
pub mod elf_meta;
pub mod lock;
pub mod maps;
pub mod writer;

pub use binary_format::{
    read_metadata_file, write_metadata_file, BinaryMetadata, BlockRecord, FunctionRecord,
    LoopLevel, LoopRecord, LPROF_VERSION_MAJOR, LPROF_VERSION_MINOR,
};
pub use elf_meta::{display_name, is_position_independent, Disassembler, ElfSymbolProvider};
pub use maps::{read_lib_ranges, LibRange, MapsEntry};
pub use writer::{
    generate_metafile, spawn_maps_listener, write_walltime_uarch, MetafileRequest,
};
