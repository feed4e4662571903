//! Prometheus text exposition of the cache
//!
//! Numbers go through `itoa`/`ryu` stack buffers. Entries that have never
//! been confirmed by the device are left out rather than exported as zero.
//! Fault bitsets export one sample per active code, labelled `F<code>`.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::cache::{CacheEntry, Snapshot};
use crate::register_map::RegisterMap;

const PREFIX: &str = "invsrv_";

/// Render the whole snapshot as exposition text
pub fn render(map: &RegisterMap, snapshot: &Snapshot, now: DateTime<Utc>) -> String {
    let mut out = String::with_capacity(64 * (map.len() + 1));

    let mut cycles = itoa::Buffer::new();
    push_header(&mut out, "poll_cycles_total", "Completed poll cycles", "counter");
    push_sample(&mut out, "poll_cycles_total", None, cycles.format(snapshot.cycle));

    for reg in map.registers() {
        if let Some(entry) = valid(snapshot, &reg.name) {
            push_value(&mut out, &reg.name, &reg.description, &reg.unit, entry, now);
        }
    }
    for derived in map.derived() {
        if let Some(entry) = valid(snapshot, &derived.name) {
            push_value(&mut out, &derived.name, &derived.description, &derived.unit, entry, now);
        }
    }
    for block in map.faults() {
        let Some(entry) = snapshot.fault(&block.name).filter(|e| e.valid) else {
            continue;
        };
        let help = if block.description.is_empty() { &block.name } else { &block.description };
        push_header(&mut out, &block.name, help, "gauge");
        for code in &entry.codes {
            let label = format!("F{code}");
            push_sample(&mut out, &block.name, Some(("code", label.as_str())), "1");
        }
    }
    out
}

fn valid<'a>(snapshot: &'a Snapshot, name: &str) -> Option<&'a CacheEntry> {
    snapshot.get(name).filter(|e| e.valid)
}

fn push_value(
    out: &mut String,
    name: &str,
    description: &str,
    unit: &str,
    entry: &CacheEntry,
    now: DateTime<Utc>,
) {
    let help = if description.is_empty() { name } else { description };
    let mut number = ryu::Buffer::new();

    push_header(out, name, help, "gauge");
    push_sample(out, name, Some(("unit", unit)), number.format(entry.value));

    if let Some(age) = entry.age_seconds(now) {
        let age_name = format!("{name}_age_seconds");
        push_header(out, &age_name, "Seconds since the value was confirmed", "gauge");
        push_sample(out, &age_name, None, number.format(age));
    }
}

fn push_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {PREFIX}{name} {}", help.replace('\n', " "));
    let _ = writeln!(out, "# TYPE {PREFIX}{name} {kind}");
}

fn push_sample(out: &mut String, name: &str, label: Option<(&str, &str)>, value: &str) {
    out.push_str(PREFIX);
    out.push_str(name);
    if let Some((key, text)) = label {
        out.push('{');
        out.push_str(key);
        out.push_str("=\"");
        for c in text.chars() {
            match c {
                '\\' => out.push_str("\\\\"),
                '"' => out.push_str("\\\""),
                '\n' => out.push_str("\\n"),
                c => out.push(c),
            }
        }
        out.push_str("\"}");
    }
    out.push(' ');
    out.push_str(value);
    out.push('\n');
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::cache::{Cache, FaultEntry};
    use crate::register_map::FaultBlockDef;
    use crate::register_map::{Access, RegisterDef, Scale, WordCount};
    use std::collections::HashMap;

    fn map() -> RegisterMap {
        let reg = |name: &str, address: u16, unit: &str| RegisterDef {
            name: name.to_string(),
            address,
            word_count: WordCount::One,
            scale: Scale::UNIT,
            offset: 0.0,
            signed: false,
            access: Access::ReadOnly,
            unit: unit.to_string(),
            description: String::new(),
        };
        RegisterMap::new(
            vec![reg("battery_soc", 184, "%"), reg("pv1_power", 186, "W")],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn test_render_valid_entries_only() {
        let map = map();
        let cache = Cache::new(map.value_names());
        let at = Utc::now();
        cache.replace(HashMap::from([(
            "battery_soc".to_string(),
            CacheEntry::fresh(87.0, 87, at),
        )]));

        let text = render(&map, &cache.snapshot(), at + chrono::Duration::milliseconds(2500));

        assert!(text.contains("# TYPE invsrv_battery_soc gauge\n"));
        assert!(text.contains("invsrv_battery_soc{unit=\"%\"} 87.0\n"));
        assert!(text.contains("invsrv_battery_soc_age_seconds 2.5\n"));
        assert!(text.contains("invsrv_poll_cycles_total 1\n"));
        assert!(!text.contains("pv1_power"));
    }

    #[test]
    fn test_render_fault_codes() {
        let map = map()
            .with_faults(vec![FaultBlockDef {
                name: "sunsynk_fault_codes".to_string(),
                address: 103,
                words: 4,
                description: "Sunsynk Fault Codes".to_string(),
            }])
            .unwrap();
        let cache = Cache::for_map(&map);
        let now = Utc::now();

        let before = render(&map, &cache.snapshot(), now);
        assert!(!before.contains("fault_codes"));

        cache.commit(
            HashMap::new(),
            HashMap::from([(
                "sunsynk_fault_codes".to_string(),
                FaultEntry::fresh(vec![1, 8, 32], now),
            )]),
        );
        let text = render(&map, &cache.snapshot(), now);

        assert!(text.contains("# HELP invsrv_sunsynk_fault_codes Sunsynk Fault Codes\n"));
        assert!(text.contains("# TYPE invsrv_sunsynk_fault_codes gauge\n"));
        for code in ["F1", "F8", "F32"] {
            assert!(text.contains(&format!("invsrv_sunsynk_fault_codes{{code=\"{code}\"}} 1\n")));
        }
        assert!(!text.contains("code=\"F2\""));
    }

    #[test]
    fn test_label_escaping() {
        let mut out = String::new();
        push_sample(&mut out, "x", Some(("unit", "a\"b\\c")), "1");
        assert_eq!(out, "invsrv_x{unit=\"a\\\"b\\\\c\"} 1\n");
    }
}
