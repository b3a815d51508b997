use crate::error::ConfigError;

use super::sys::*;

pub const XSMALL_SAMPLING_PERIOD: u64 = 250_003;
pub const SMALL_SAMPLING_PERIOD: u64 = 500_003;
pub const MEDIUM_SAMPLING_PERIOD: u64 = 2_000_003;
pub const DEFAULT_SAMPLING_PERIOD: u64 = 2_000_003;
pub const BIG_SAMPLING_PERIOD: u64 = 20_000_033;

/// Resolves a period preset name. `big`/`large` are aliases; the
/// emergency-stop advice tells users to rerun with `g=large`.
pub fn preset_period(name: &str) -> Option<u64> {
    match name {
        "xsmall" => Some(XSMALL_SAMPLING_PERIOD),
        "small" => Some(SMALL_SAMPLING_PERIOD),
        "medium" => Some(MEDIUM_SAMPLING_PERIOD),
        "default" => Some(DEFAULT_SAMPLING_PERIOD),
        "big" | "large" => Some(BIG_SAMPLING_PERIOD),
        _ => None,
    }
}

/// One event of the user event list, fully resolved to a kernel
/// (type, config, period) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSpec {
    pub name: String,
    pub type_code: u32,
    pub config: u64,
    pub period: u64,
}

/// Config-word flags, in list order. Each occupies a fixed contiguous
/// bit range of `perf_event_attr.config`.
const FLAGS: &[(&str, u32, u32)] = &[
    ("event", 0, 8),
    ("umask", 8, 8),
    ("usr", 16, 1),
    ("os", 17, 1),
    ("e", 18, 1),
    ("pc", 19, 1),
    ("int", 20, 1),
    ("any", 21, 1),
    ("en", 22, 1),
    ("inv", 23, 1),
    ("cmask", 24, 8),
];

/// Symbolic names understood without a PMU event table. Anything else
/// must be given as a literal hex raw code.
const SYMBOLIC: &[(&str, u32, u64)] = &[
    ("cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("CPU_CLK_UNHALTED", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    ("INST_RETIRED", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS),
    (
        "cache-references",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_CACHE_REFERENCES,
    ),
    ("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES),
    (
        "branches",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    ),
    (
        "branch-instructions",
        PERF_TYPE_HARDWARE,
        PERF_COUNT_HW_BRANCH_INSTRUCTIONS,
    ),
    ("branch-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES),
    ("ref-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES),
    ("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS),
];

fn is_uncore(name: &str) -> bool {
    name.starts_with("DRAM_DATA_READS") || name.starts_with("DRAM_DATA_WRITES")
}

fn parse_value(token: &str) -> Option<u64> {
    let hex = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X"));
    match hex {
        Some(h) => u64::from_str_radix(h, 16).ok(),
        // Flag values without a 0x prefix are still hexadecimal.
        None => u64::from_str_radix(token, 16).ok(),
    }
}

fn set_config_field(config: u64, value: u64, pos: u32, width: u32) -> u64 {
    let mask = if width >= 64 {
        u64::MAX
    } else {
        ((1u64 << width) - 1) << pos
    };
    (config & !mask) | ((value << pos) & mask)
}

/// Finds the start of the `-flag=value,…` suffix inside an element, if
/// any. Event names may themselves contain dashes (`cache-misses`), so
/// only a dash introducing a known flag assignment counts.
fn find_flags_suffix(element: &str) -> Option<usize> {
    let bytes = element.as_bytes();
    for (idx, &b) in bytes.iter().enumerate() {
        if b != b'-' {
            continue;
        }
        let rest = &element[idx + 1..];
        if let Some(eq) = rest.find('=') {
            let candidate = &rest[..eq];
            if FLAGS.iter().any(|(f, _, _)| *f == candidate) {
                return Some(idx);
            }
        }
    }
    None
}

fn apply_flags(element: &str, flags: &str, config: &mut u64) -> Result<(), ConfigError> {
    for part in flags.split(',') {
        let (name, value) = part
            .split_once('=')
            .ok_or_else(|| ConfigError::BadFlag(element.to_string(), part.to_string()))?;
        let (_, pos, width) = FLAGS
            .iter()
            .find(|(f, _, _)| *f == name)
            .ok_or_else(|| ConfigError::BadFlag(element.to_string(), name.to_string()))?;
        let value = parse_value(value)
            .ok_or_else(|| ConfigError::BadFlag(element.to_string(), part.to_string()))?;
        *config = set_config_field(*config, value, *pos, *width);
    }
    Ok(())
}

/// Parses one element: `NAME[@TYPE][@PERIOD][-flag=value,…]`.
///
/// A single `@N` suffix is a period when `N` is large and a counter
/// type code when small; kernel type codes stay well under 100 while a
/// sampling period under 100 would mean an interrupt per hundred
/// events.
fn parse_element(element: &str, default_period: u64) -> Result<EventSpec, ConfigError> {
    let (head, flags) = match find_flags_suffix(element) {
        Some(idx) => (&element[..idx], Some(&element[idx + 1..])),
        None => (element, None),
    };

    let mut parts = head.split('@');
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ConfigError::BadEvent(element.to_string()))?;

    if is_uncore(name) {
        return Err(ConfigError::UncoreEvent(name.to_string()));
    }

    let mut type_code = None;
    let mut period = default_period;
    let numbers: Vec<&str> = parts.collect();
    match numbers.as_slice() {
        [] => {}
        [n] => {
            let value: u64 = n
                .parse()
                .map_err(|_| ConfigError::BadPeriod(element.to_string()))?;
            if value < 100 {
                type_code = Some(value as u32);
            } else {
                period = value;
            }
        }
        [t, p] => {
            type_code = Some(
                t.parse()
                    .map_err(|_| ConfigError::BadEvent(element.to_string()))?,
            );
            period = p
                .parse()
                .map_err(|_| ConfigError::BadPeriod(element.to_string()))?;
        }
        _ => return Err(ConfigError::BadEvent(element.to_string())),
    }
    if period == 0 {
        return Err(ConfigError::BadPeriod(element.to_string()));
    }

    let (resolved_type, mut config) = if let Some(raw) =
        name.strip_prefix("0x").or_else(|| name.strip_prefix("0X"))
    {
        let code = u64::from_str_radix(raw, 16)
            .map_err(|_| ConfigError::BadEvent(element.to_string()))?;
        (type_code.unwrap_or(PERF_TYPE_RAW), code)
    } else if let Some((_, kind, config)) = SYMBOLIC.iter().find(|(n, _, _)| *n == name) {
        (type_code.unwrap_or(*kind), *config)
    } else {
        return Err(ConfigError::BadEvent(name.to_string()));
    };

    if let Some(flags) = flags {
        apply_flags(element, flags, &mut config)?;
    }

    Ok(EventSpec {
        name: name.to_string(),
        type_code: resolved_type,
        config,
        period,
    })
}

/// Splits the comma-separated event list, keeping `flag=value` tails
/// attached to their element, and parses each element.
pub fn parse_event_list(list: &str, default_period: u64) -> Result<Vec<EventSpec>, ConfigError> {
    let mut elements: Vec<String> = Vec::new();
    for token in list.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let is_flag_tail = token
            .split_once('=')
            .map(|(name, _)| FLAGS.iter().any(|(f, _, _)| *f == name))
            .unwrap_or(false);
        match elements.last_mut() {
            Some(last) if is_flag_tail => {
                last.push(',');
                last.push_str(token);
            }
            _ => elements.push(token.to_string()),
        }
    }

    if elements.is_empty() {
        return Err(ConfigError::EmptyEventList);
    }
    elements
        .iter()
        .map(|e| parse_element(e, default_period))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_events_with_periods() {
        let specs = parse_event_list("cycles@1000003,instructions@1000003", 500).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].type_code, PERF_TYPE_HARDWARE);
        assert_eq!(specs[0].config, PERF_COUNT_HW_CPU_CYCLES);
        assert_eq!(specs[0].period, 1_000_003);
        assert_eq!(specs[1].config, PERF_COUNT_HW_INSTRUCTIONS);
    }

    #[test]
    fn default_period_applies() {
        let specs = parse_event_list("cycles", DEFAULT_SAMPLING_PERIOD).unwrap();
        assert_eq!(specs[0].period, DEFAULT_SAMPLING_PERIOD);
    }

    #[test]
    fn raw_code_default_type_is_raw() {
        let specs = parse_event_list("0x3c", 100_000).unwrap();
        assert_eq!(specs[0].type_code, PERF_TYPE_RAW);
        assert_eq!(specs[0].config, 0x3c);
    }

    #[test]
    fn explicit_type_code() {
        // A small @N is a kernel counter-type code, a large one a period.
        let specs = parse_event_list("0x10@8@250003", 0x1234).unwrap();
        assert_eq!(specs[0].type_code, 8);
        assert_eq!(specs[0].period, 250_003);

        let specs = parse_event_list("0x10@8", 999).unwrap();
        assert_eq!(specs[0].type_code, 8);
        assert_eq!(specs[0].period, 999);
    }

    #[test]
    fn flags_are_packed_into_config() {
        let specs = parse_event_list("0x0-event=0x3c,umask=0x1,cmask=0x5,inv=1", 100_000).unwrap();
        let config = specs[0].config;
        assert_eq!(config & 0xff, 0x3c);
        assert_eq!((config >> 8) & 0xff, 0x1);
        assert_eq!((config >> 24) & 0xff, 0x5);
        assert_eq!((config >> 23) & 1, 1);
    }

    #[test]
    fn flag_commas_do_not_split_the_list() {
        let specs = parse_event_list("0x0-event=0x3c,umask=0x0,cycles@500003", 100_000).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].name, "cycles");
    }

    #[test]
    fn dashes_in_names_are_not_flags() {
        let specs = parse_event_list("cache-misses@500003", 100).unwrap();
        assert_eq!(specs[0].config, PERF_COUNT_HW_CACHE_MISSES);
    }

    #[test]
    fn uncore_events_are_rejected() {
        match parse_event_list("DRAM_DATA_READS@500003", 100) {
            Err(ConfigError::UncoreEvent(name)) => assert_eq!(name, "DRAM_DATA_READS"),
            other => panic!("expected UncoreEvent, got {other:?}"),
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        assert!(matches!(
            parse_event_list("NOT_AN_EVENT", 100),
            Err(ConfigError::BadEvent(_))
        ));
    }

    #[test]
    fn zero_period_is_an_error() {
        assert!(matches!(
            parse_event_list("cycles@0", 100),
            Err(ConfigError::BadPeriod(_))
        ));
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(
            parse_event_list(" , ", 100),
            Err(ConfigError::EmptyEventList)
        ));
    }

    #[test]
    fn presets() {
        assert_eq!(preset_period("xsmall"), Some(250_003));
        assert_eq!(preset_period("default"), Some(2_000_003));
        assert_eq!(preset_period("big"), preset_period("large"));
        assert_eq!(preset_period("huge"), None);
    }
}
