pub mod counter;
pub mod event_spec;
pub mod group;
pub mod records;
pub mod sys;

pub use counter::{paranoid_level, Counter};
pub use event_spec::{parse_event_list, preset_period, EventSpec, DEFAULT_SAMPLING_PERIOD};
pub use group::{plan_events, BacktraceMode, EventGroup, GroupTarget, SessionPlan};
pub use records::{Record, SampleRecord};
