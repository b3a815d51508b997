pub mod arena;
pub mod ip_events;
pub mod spill;

pub use ip_events::{
    read_cpu_info_file, read_ip_events_file, write_ip_events_file, CallChain, CpuHistogram,
    IpEvents, IpEventsData, ThreadIpEvents,
};
pub use spill::{
    dump_stores, DumpInput, DumpReport, DumpStats, SpillAccounting, StoreConfig, WorkerStore,
};
