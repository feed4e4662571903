//! Register map: every sensor and setting the bridge knows about
//!
//! Built once at startup (built-in Sunsynk table or a YAML register file),
//! validated, then shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::derived::{Clamp, DerivedDef, Term};

/// Number of consecutive 16-bit registers holding one value.
///
/// Two-word values are laid out low word first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordCount {
    One,
    Two,
}

impl WordCount {
    pub fn len(self) -> u16 {
        match self {
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

/// Rational multiplier applied to the raw integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scale {
    pub numerator: i64,
    pub denominator: i64,
}

impl Scale {
    pub const UNIT: Scale = Scale {
        numerator: 1,
        denominator: 1,
    };

    pub const fn divide_by(denominator: i64) -> Self {
        Self {
            numerator: 1,
            denominator,
        }
    }

    pub fn apply(&self, raw: i64) -> f64 {
        raw as f64 * self.numerator as f64 / self.denominator as f64
    }

    /// Raw integer that scales back to exactly `value`, if there is one
    pub fn invert(&self, value: f64) -> Option<i64> {
        let raw = (value * self.denominator as f64 / self.numerator as f64).round();
        if !raw.is_finite() || raw.abs() > i64::MAX as f64 {
            return None;
        }
        let raw = raw as i64;
        let back = self.apply(raw);
        let tolerance = 1e-9 * value.abs().max(1.0);
        ((back - value).abs() <= tolerance).then_some(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Access {
    ReadOnly,
    Writable { min: f64, max: f64 },
}

/// Why a requested value cannot be written to a register
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EncodeError {
    #[error("{value} is outside {min}..={max}")]
    OutsideRange { value: f64, min: f64, max: f64 },

    #[error("{0} is not representable at this register's resolution")]
    NotRepresentable(f64),

    #[error("raw value {0} does not fit the register")]
    DoesNotFit(i64),

    #[error("register is read-only")]
    ReadOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterDef {
    pub name: String,
    pub address: u16,
    pub word_count: WordCount,
    pub scale: Scale,
    /// Added after scaling
    pub offset: f64,
    pub signed: bool,
    pub access: Access,
    pub unit: String,
    pub description: String,
}

impl RegisterDef {
    /// Last register address occupied by this value
    pub fn last_address(&self) -> u16 {
        self.address + (self.word_count.len() - 1)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.access, Access::Writable { .. })
    }

    /// Raw integer and scaled value from this register's words
    pub fn decode(&self, words: &[u16]) -> Option<(i64, f64)> {
        let raw = match (self.word_count, words) {
            (WordCount::One, [w, ..]) => {
                if self.signed {
                    i64::from(*w as i16)
                } else {
                    i64::from(*w)
                }
            },
            (WordCount::Two, [lo, hi, ..]) => {
                let combined = (u32::from(*hi) << 16) | u32::from(*lo);
                if self.signed {
                    i64::from(combined as i32)
                } else {
                    i64::from(combined)
                }
            },
            _ => return None,
        };
        Some((raw, self.scale.apply(raw) + self.offset))
    }

    /// Register word for `value`, checked against range, resolution and width
    pub fn encode(&self, value: f64) -> Result<(i64, u16), EncodeError> {
        let Access::Writable { min, max } = self.access else {
            return Err(EncodeError::ReadOnly);
        };
        if !value.is_finite() || value < min || value > max {
            return Err(EncodeError::OutsideRange { value, min, max });
        }

        let raw = self
            .scale
            .invert(value - self.offset)
            .ok_or(EncodeError::NotRepresentable(value))?;

        let word = if self.signed {
            i16::try_from(raw).map_err(|_| EncodeError::DoesNotFit(raw))? as u16
        } else {
            u16::try_from(raw).map_err(|_| EncodeError::DoesNotFit(raw))?
        };
        Ok((raw, word))
    }
}

/// Most words a fault bitset may span
pub const MAX_FAULT_WORDS: u16 = 16;

/// Consecutive registers read as one bitset of active fault codes
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaultBlockDef {
    pub name: String,
    pub address: u16,
    pub words: u16,
    pub description: String,
}

impl FaultBlockDef {
    pub fn last_address(&self) -> u16 {
        self.address + (self.words - 1)
    }
}

/// Active fault codes in a bitset, lowest word first.
///
/// Bit `b` of word `w` is code `16 * w + b + 1`.
pub fn decode_faults(words: &[u16]) -> Vec<u16> {
    let mut codes = Vec::new();
    for (index, word) in (0u16..).zip(words) {
        for bit in 0..16u16 {
            if word & (1 << bit) != 0 {
                codes.push(16 * index + bit + 1);
            }
        }
    }
    codes
}

#[derive(Debug, Error, PartialEq)]
pub enum RegisterMapError {
    #[error("register name cannot be empty (address {0})")]
    EmptyName(u16),

    #[error("duplicate name: {0}")]
    DuplicateName(String),

    #[error("{first} and {second} overlap at address {address}")]
    Overlap {
        first: String,
        second: String,
        address: u16,
    },

    #[error("{0} runs past the end of the register space")]
    AddressOverflow(String),

    #[error("{0}: writable registers must be a single word")]
    MultiWordWritable(String),

    #[error("{0}: scale numerator and denominator must be non-zero")]
    InvalidScale(String),

    #[error("{0}: writable range min must not exceed max")]
    InvalidRange(String),

    #[error("{0}: fault blocks span 1-{MAX_FAULT_WORDS} words")]
    InvalidFaultWords(String),

    #[error("derived value {derived} refers to unknown register {register}")]
    UnknownTerm { derived: String, register: String },

    #[error("register file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Immutable, validated register table
#[derive(Debug, Clone)]
pub struct RegisterMap {
    /// Sorted by address
    registers: Vec<RegisterDef>,
    by_name: HashMap<String, usize>,
    derived: Vec<DerivedDef>,
    faults: Vec<FaultBlockDef>,
}

impl RegisterMap {
    pub fn new(
        mut registers: Vec<RegisterDef>,
        derived: Vec<DerivedDef>,
    ) -> Result<Self, RegisterMapError> {
        registers.sort_by_key(|r| r.address);

        let mut by_name = HashMap::with_capacity(registers.len());
        for (idx, reg) in registers.iter().enumerate() {
            if reg.name.trim().is_empty() {
                return Err(RegisterMapError::EmptyName(reg.address));
            }
            if reg.scale.numerator == 0 || reg.scale.denominator == 0 {
                return Err(RegisterMapError::InvalidScale(reg.name.clone()));
            }
            if reg.address.checked_add(reg.word_count.len() - 1).is_none() {
                return Err(RegisterMapError::AddressOverflow(reg.name.clone()));
            }
            if let Access::Writable { min, max } = reg.access {
                if reg.word_count != WordCount::One {
                    return Err(RegisterMapError::MultiWordWritable(reg.name.clone()));
                }
                if min.is_nan() || max.is_nan() || min > max {
                    return Err(RegisterMapError::InvalidRange(reg.name.clone()));
                }
            }
            if by_name.insert(reg.name.clone(), idx).is_some() {
                return Err(RegisterMapError::DuplicateName(reg.name.clone()));
            }
        }

        for pair in registers.windows(2) {
            if pair[1].address <= pair[0].last_address() {
                return Err(RegisterMapError::Overlap {
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                    address: pair[1].address,
                });
            }
        }

        let mut derived_names = std::collections::HashSet::new();
        for d in &derived {
            if by_name.contains_key(&d.name) || !derived_names.insert(d.name.as_str()) {
                return Err(RegisterMapError::DuplicateName(d.name.clone()));
            }
            if let Some(term) = d.terms.iter().find(|t| !by_name.contains_key(&t.register)) {
                return Err(RegisterMapError::UnknownTerm {
                    derived: d.name.clone(),
                    register: term.register.clone(),
                });
            }
        }

        Ok(Self {
            registers,
            by_name,
            derived,
            faults: Vec::new(),
        })
    }

    /// Add fault bitsets, checked against every register and each other
    pub fn with_faults(mut self, mut faults: Vec<FaultBlockDef>) -> Result<Self, RegisterMapError> {
        faults.sort_by_key(|f| f.address);

        let mut spans: Vec<(u16, u16, &str)> = self
            .registers
            .iter()
            .map(|r| (r.address, r.last_address(), r.name.as_str()))
            .collect();
        let mut names = std::collections::HashSet::new();
        for block in &faults {
            if block.name.trim().is_empty() {
                return Err(RegisterMapError::EmptyName(block.address));
            }
            if block.words == 0 || block.words > MAX_FAULT_WORDS {
                return Err(RegisterMapError::InvalidFaultWords(block.name.clone()));
            }
            if block.address.checked_add(block.words - 1).is_none() {
                return Err(RegisterMapError::AddressOverflow(block.name.clone()));
            }
            if self.by_name.contains_key(&block.name)
                || self.find_derived(&block.name).is_some()
                || !names.insert(block.name.as_str())
            {
                return Err(RegisterMapError::DuplicateName(block.name.clone()));
            }
            spans.push((block.address, block.last_address(), block.name.as_str()));
        }

        spans.sort_by_key(|s| s.0);
        for pair in spans.windows(2) {
            if pair[1].0 <= pair[0].1 {
                return Err(RegisterMapError::Overlap {
                    first: pair[0].2.to_string(),
                    second: pair[1].2.to_string(),
                    address: pair[1].0,
                });
            }
        }

        self.faults = faults;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&RegisterDef> {
        self.by_name.get(name).map(|&i| &self.registers[i])
    }

    /// Registers in ascending address order
    pub fn registers(&self) -> &[RegisterDef] {
        &self.registers
    }

    pub fn derived(&self) -> &[DerivedDef] {
        &self.derived
    }

    pub fn find_derived(&self, name: &str) -> Option<&DerivedDef> {
        self.derived.iter().find(|d| d.name == name)
    }

    /// Fault bitsets in ascending address order
    pub fn faults(&self) -> &[FaultBlockDef] {
        &self.faults
    }

    pub fn find_faults(&self, name: &str) -> Option<&FaultBlockDef> {
        self.faults.iter().find(|f| f.name == name)
    }

    /// Every name that gets a cache entry: registers, then derived values
    pub fn value_names(&self) -> impl Iterator<Item = &str> {
        self.registers
            .iter()
            .map(|r| r.name.as_str())
            .chain(self.derived.iter().map(|d| d.name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RegisterMapError> {
        let file: RegisterFile =
            serde_yaml::from_str(yaml).map_err(|e| RegisterMapError::File {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;
        file.into_map()
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RegisterMapError> {
        let path = path.as_ref();
        let file_err = |reason: String| RegisterMapError::File {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))?;
        let file: RegisterFile =
            serde_yaml::from_str(&content).map_err(|e| file_err(e.to_string()))?;
        file.into_map()
    }
}

// ============================================================================
// Register file format
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterFile {
    registers: Vec<RegisterSpec>,
    #[serde(default)]
    derived: Vec<DerivedSpec>,
    #[serde(default)]
    faults: Vec<FaultSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterSpec {
    name: String,
    address: u16,
    #[serde(default = "one")]
    words: u8,
    #[serde(default = "one_i64")]
    multiplier: i64,
    #[serde(default = "one_i64")]
    divisor: i64,
    #[serde(default)]
    offset: f64,
    #[serde(default)]
    signed: bool,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    writable: Option<RangeSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeSpec {
    min: f64,
    max: f64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DerivedSpec {
    name: String,
    #[serde(default)]
    unit: String,
    #[serde(default)]
    description: String,
    terms: Vec<Term>,
    #[serde(default)]
    clamp: Clamp,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FaultSpec {
    name: String,
    address: u16,
    words: u16,
    #[serde(default)]
    description: String,
}

fn one() -> u8 {
    1
}

fn one_i64() -> i64 {
    1
}

impl RegisterFile {
    fn into_map(self) -> Result<RegisterMap, RegisterMapError> {
        let mut registers = Vec::with_capacity(self.registers.len());
        for spec in self.registers {
            let word_count = match spec.words {
                1 => WordCount::One,
                2 => WordCount::Two,
                n => {
                    return Err(RegisterMapError::File {
                        path: "<register file>".to_string(),
                        reason: format!("{}: words must be 1 or 2, got {n}", spec.name),
                    })
                },
            };
            registers.push(RegisterDef {
                name: spec.name,
                address: spec.address,
                word_count,
                scale: Scale {
                    numerator: spec.multiplier,
                    denominator: spec.divisor,
                },
                offset: spec.offset,
                signed: spec.signed,
                access: match spec.writable {
                    Some(r) => Access::Writable {
                        min: r.min,
                        max: r.max,
                    },
                    None => Access::ReadOnly,
                },
                unit: spec.unit,
                description: spec.description,
            });
        }
        let derived = self
            .derived
            .into_iter()
            .map(|d| DerivedDef {
                name: d.name,
                unit: d.unit,
                description: d.description,
                terms: d.terms,
                clamp: d.clamp,
            })
            .collect();
        let faults = self
            .faults
            .into_iter()
            .map(|f| FaultBlockDef {
                name: f.name,
                address: f.address,
                words: f.words,
                description: f.description,
            })
            .collect();
        RegisterMap::new(registers, derived)?.with_faults(faults)
    }
}

// ============================================================================
// Built-in Sunsynk table
// ============================================================================

struct Builder(Vec<RegisterDef>);

impl Builder {
    #[allow(clippy::too_many_arguments)]
    fn add(
        &mut self,
        name: &str,
        address: u16,
        word_count: WordCount,
        divisor: i64,
        signed: bool,
        unit: &str,
        description: &str,
    ) -> &mut RegisterDef {
        self.0.push(RegisterDef {
            name: name.to_string(),
            address,
            word_count,
            scale: Scale::divide_by(divisor),
            offset: 0.0,
            signed,
            access: Access::ReadOnly,
            unit: unit.to_string(),
            description: description.to_string(),
        });
        let last = self.0.len() - 1;
        &mut self.0[last]
    }

    fn word(&mut self, name: &str, address: u16, divisor: i64, signed: bool, unit: &str, description: &str) {
        self.add(name, address, WordCount::One, divisor, signed, unit, description);
    }

    fn energy_total(&mut self, name: &str, address: u16, description: &str) {
        self.add(name, address, WordCount::Two, 10, false, "kWh", description);
    }

    fn temperature(&mut self, name: &str, address: u16, description: &str) {
        self.add(name, address, WordCount::One, 10, false, "°C", description)
            .offset = -100.0;
    }

    #[allow(clippy::too_many_arguments)]
    fn setting(&mut self, name: &str, address: u16, divisor: i64, min: f64, max: f64, unit: &str, description: &str) {
        self.add(name, address, WordCount::One, divisor, false, unit, description)
            .access = Access::Writable { min, max };
    }
}

impl RegisterMap {
    /// Sunsynk hybrid inverter register table
    pub fn sunsynk() -> Result<Self, RegisterMapError> {
        let mut b = Builder(Vec::with_capacity(64));

        // Battery
        b.word("battery_voltage", 183, 100, false, "V", "Battery voltage");
        b.word("battery_soc", 184, 1, false, "%", "Battery state of charge");
        b.word("battery_power", 190, 1, true, "W", "Battery power, negative while charging");
        b.word("battery_current", 191, 100, true, "A", "Battery current");
        b.word("battery_charging_voltage", 312, 100, false, "V", "Battery charging voltage");
        b.word("battery_1_soc", 603, 1, false, "%", "Battery 1 state of charge (BMS)");
        b.word("battery_1_cycle", 611, 1, false, "", "Battery 1 cycle count (BMS)");

        // Inverter
        b.word("inverter_power", 175, 1, true, "W", "Inverter output power");
        b.word("inverter_voltage", 154, 10, false, "V", "Inverter output voltage");
        b.word("inverter_frequency", 195, 100, false, "Hz", "Inverter output frequency");

        // Grid
        b.word("grid_frequency", 79, 100, false, "Hz", "Grid frequency");
        b.word("grid_voltage", 150, 10, false, "V", "Grid voltage");
        b.word("grid_l1_current", 160, 100, true, "A", "Grid L1 current");
        b.word("grid_l2_current", 161, 100, true, "A", "Grid L2 current");
        b.word("grid_ld_power", 167, 1, true, "W", "Grid LD (L1) power");
        b.word("grid_l2_power", 168, 1, true, "W", "Grid L2 power");
        b.word("grid_power", 169, 1, true, "W", "Grid power (L1 + L2)");
        b.word("grid_ct_power", 172, 1, true, "W", "Grid power at the external CT");
        b.word("grid_connected", 194, 1, false, "", "Grid relay closed (1) or open (0)");

        // Load
        b.word("load_l1_power", 176, 1, true, "W", "Load L1 power");
        b.word("load_l2_power", 177, 1, true, "W", "Load L2 power");
        b.word("load_power", 178, 1, true, "W", "Load power (L1 + L2)");
        b.word("aux_power", 166, 1, true, "W", "AUX output power");

        // Solar
        b.word("pv1_voltage", 109, 10, false, "V", "PV string 1 voltage");
        b.word("pv1_current", 110, 10, false, "A", "PV string 1 current");
        b.word("pv2_voltage", 111, 10, false, "V", "PV string 2 voltage");
        b.word("pv2_current", 112, 10, false, "A", "PV string 2 current");
        b.word("pv1_power", 186, 1, true, "W", "PV string 1 power");
        b.word("pv2_power", 187, 1, true, "W", "PV string 2 power");

        // Energy counters
        b.word("day_active_energy", 60, 10, true, "kWh", "Active energy today");
        b.word("day_reactive_energy", 61, 10, true, "kVarh", "Reactive energy today");
        b.word("month_pv_energy", 65, 10, false, "kWh", "PV energy this month");
        b.word("month_load_energy", 66, 10, false, "kWh", "Load energy this month");
        b.word("month_grid_energy", 67, 10, false, "kWh", "Grid energy this month");
        b.word("day_battery_charge", 70, 10, false, "kWh", "Battery charge today");
        b.word("day_battery_discharge", 71, 10, false, "kWh", "Battery discharge today");
        b.word("day_grid_import", 76, 10, false, "kWh", "Grid import today");
        b.word("day_grid_export", 77, 10, false, "kWh", "Grid export today");
        b.word("day_load_energy", 84, 10, false, "kWh", "Load energy today");
        b.word("day_pv_energy", 108, 10, false, "kWh", "PV energy today");
        b.energy_total("total_active_energy", 63, "Active energy, lifetime");
        b.energy_total("year_pv_energy", 68, "PV energy this year");
        b.energy_total("total_battery_charge", 72, "Battery charge, lifetime");
        b.energy_total("total_battery_discharge", 74, "Battery discharge, lifetime");
        b.energy_total("total_grid_export", 81, "Grid export, lifetime");
        b.energy_total("total_load_energy", 85, "Load energy, lifetime");
        b.energy_total("year_load_energy", 87, "Load energy this year");
        b.energy_total("total_pv_energy", 96, "PV energy, lifetime");
        b.energy_total("year_grid_export", 98, "Grid export this year");

        // Temperatures (raw tenths of a degree, offset by 100 °C)
        b.temperature("dc_transformer_temperature", 90, "DC transformer temperature");
        b.temperature("radiator_temperature", 91, "Radiator temperature");
        b.temperature("environment_temperature", 95, "Environment temperature");
        b.temperature("battery_temperature", 182, "Battery temperature");

        // Settings
        b.word("control_mode", 200, 1, false, "", "Control mode");
        b.word("grid_charge_battery_current", 230, 1, false, "A", "Grid charge battery current");
        b.setting("battery_shutdown_voltage", 220, 100, 40.0, 60.0, "V", "Battery shutdown voltage");
        b.setting("grid_charge_enabled", 232, 1, 0.0, 1.0, "", "Charge the battery from the grid");
        b.setting("priority_load", 243, 1, 0.0, 1.0, "", "Load takes priority over battery charging");
        b.setting("grid_export_limit", 245, 1, 0.0, 8000.0, "W", "Maximum power exported to the grid");
        b.setting("solar_export", 247, 1, 0.0, 1.0, "", "Export surplus solar to the grid");
        b.setting("use_timer", 248, 1, 0.0, 1.0, "", "Follow the time-of-use programme");

        let derived = vec![
            DerivedDef {
                name: "essential_power".to_string(),
                unit: "W".to_string(),
                description: "Power drawn by the essential (backup) outputs".to_string(),
                terms: vec![
                    Term::new("inverter_power", 1.0),
                    Term::new("grid_ld_power", 1.0),
                    Term::new("aux_power", -1.0),
                ],
                clamp: Clamp::None,
            },
            DerivedDef {
                name: "non_essential_power".to_string(),
                unit: "W".to_string(),
                description: "Power drawn by loads behind the grid CT".to_string(),
                terms: vec![
                    Term::new("grid_ct_power", 1.0),
                    Term::new("load_l1_power", -1.0),
                ],
                clamp: Clamp::NonNegative,
            },
            DerivedDef {
                name: "grid_current".to_string(),
                unit: "A".to_string(),
                description: "Grid current (L1 + L2)".to_string(),
                terms: vec![
                    Term::new("grid_l1_current", 1.0),
                    Term::new("grid_l2_current", 1.0),
                ],
                clamp: Clamp::None,
            },
        ];

        let faults = vec![FaultBlockDef {
            name: "sunsynk_fault_codes".to_string(),
            address: 103,
            words: 4,
            description: "Sunsynk Fault Codes".to_string(),
        }];

        Self::new(b.0, derived)?.with_faults(faults)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn def(name: &str, address: u16, word_count: WordCount) -> RegisterDef {
        RegisterDef {
            name: name.to_string(),
            address,
            word_count,
            scale: Scale::UNIT,
            offset: 0.0,
            signed: false,
            access: Access::ReadOnly,
            unit: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn test_sunsynk_table_is_valid() {
        let map = RegisterMap::sunsynk().unwrap();
        assert!(map.len() > 50);
        assert!(map.get("battery_soc").is_some());
        assert!(map.get("grid_export_limit").unwrap().is_writable());
        assert!(!map.get("battery_soc").unwrap().is_writable());
        assert_eq!(map.value_names().count(), map.len() + 3);
        let faults = map.find_faults("sunsynk_fault_codes").unwrap();
        assert_eq!((faults.address, faults.words), (103, 4));

        let addresses: Vec<u16> = map.registers().iter().map(|r| r.address).collect();
        let mut sorted = addresses.clone();
        sorted.sort_unstable();
        assert_eq!(addresses, sorted);
    }

    #[test]
    fn test_overlapping_registers_rejected() {
        let err = RegisterMap::new(
            vec![def("total", 72, WordCount::Two), def("other", 73, WordCount::One)],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, RegisterMapError::Overlap { address: 73, .. }));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let err = RegisterMap::new(
            vec![def("soc", 1, WordCount::One), def("soc", 2, WordCount::One)],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, RegisterMapError::DuplicateName("soc".into()));
    }

    #[test]
    fn test_multi_word_writable_rejected() {
        let mut reg = def("limit", 10, WordCount::Two);
        reg.access = Access::Writable { min: 0.0, max: 10.0 };
        let err = RegisterMap::new(vec![reg], vec![]).unwrap_err();
        assert_eq!(err, RegisterMapError::MultiWordWritable("limit".into()));
    }

    #[test]
    fn test_address_overflow_rejected() {
        let err = RegisterMap::new(vec![def("edge", u16::MAX, WordCount::Two)], vec![]).unwrap_err();
        assert_eq!(err, RegisterMapError::AddressOverflow("edge".into()));
    }

    #[test]
    fn test_faults_decode() {
        assert_eq!(decode_faults(&[0x01, 0, 0, 0]), vec![1]);
        assert_eq!(decode_faults(&[0x80, 0, 0, 0]), vec![8]);
        assert_eq!(decode_faults(&[0, 0x8000, 0, 0]), vec![32]);
        assert_eq!(decode_faults(&[0x81, 0x8000, 0, 0]), vec![1, 8, 32]);
        assert_eq!(decode_faults(&[0, 0, 1, 0]), vec![33]);
        assert!(decode_faults(&[0, 0, 0, 0]).is_empty());
    }

    #[test]
    fn test_fault_block_must_not_overlap_registers() {
        let fault = |name: &str, address: u16, words: u16| FaultBlockDef {
            name: name.to_string(),
            address,
            words,
            description: String::new(),
        };
        let map = || RegisterMap::new(vec![def("pv_day", 108, WordCount::One)], vec![]).unwrap();

        assert!(map().with_faults(vec![fault("faults", 103, 4)]).is_ok());
        assert!(matches!(
            map().with_faults(vec![fault("faults", 105, 4)]).unwrap_err(),
            RegisterMapError::Overlap { address: 108, .. }
        ));
        assert_eq!(
            map().with_faults(vec![fault("faults", 103, 0)]).unwrap_err(),
            RegisterMapError::InvalidFaultWords("faults".into())
        );
        assert_eq!(
            map().with_faults(vec![fault("pv_day", 1, 1)]).unwrap_err(),
            RegisterMapError::DuplicateName("pv_day".into())
        );
    }

    #[test]
    fn test_decode_signed_single_word() {
        let mut reg = def("battery_power", 190, WordCount::One);
        reg.signed = true;
        assert_eq!(reg.decode(&[0xFFFF]), Some((-1, -1.0)));
        assert_eq!(reg.decode(&[0x8000]), Some((-32768, -32768.0)));
        assert_eq!(reg.decode(&[0x7FFF]), Some((32767, 32767.0)));
    }

    #[test]
    fn test_decode_two_words_low_word_first() {
        let mut reg = def("total_pv_energy", 96, WordCount::Two);
        reg.scale = Scale::divide_by(10);
        // 0x0001_0002 = 65538 -> 6553.8 kWh
        let (raw, value) = reg.decode(&[0x0002, 0x0001]).unwrap();
        assert_eq!(raw, 65538);
        assert!((value - 6553.8).abs() < 1e-9);
        assert_eq!(reg.decode(&[0x0002]), None);
    }

    #[test]
    fn test_decode_temperature_offset() {
        let map = RegisterMap::sunsynk().unwrap();
        let reg = map.get("battery_temperature").unwrap();
        // 1250 tenths -> 125.0 - 100 = 25.0 °C
        let (_, value) = reg.decode(&[1250]).unwrap();
        assert!((value - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_encode_checks_range_resolution_and_width() {
        let map = RegisterMap::sunsynk().unwrap();
        let shutdown = map.get("battery_shutdown_voltage").unwrap();
        assert_eq!(shutdown.encode(48.5).unwrap(), (4850, 4850));
        assert!(matches!(
            shutdown.encode(48.505),
            Err(EncodeError::NotRepresentable(_))
        ));
        assert!(matches!(
            shutdown.encode(70.0),
            Err(EncodeError::OutsideRange { .. })
        ));

        let mut wide = def("wide", 1, WordCount::One);
        wide.access = Access::Writable {
            min: 0.0,
            max: 100_000.0,
        };
        assert_eq!(wide.encode(70_000.0), Err(EncodeError::DoesNotFit(70_000)));
        assert_eq!(
            map.get("battery_soc").unwrap().encode(50.0),
            Err(EncodeError::ReadOnly)
        );
    }

    #[test]
    fn test_yaml_register_file() {
        let yaml = r#"
registers:
  - name: battery_soc
    address: 184
    unit: "%"
    writable: { min: 0, max: 100 }
  - name: pv_total
    address: 96
    words: 2
    divisor: 10
    unit: kWh
  - name: battery_power
    address: 190
    signed: true
derived:
  - name: doubled_power
    terms:
      - { register: battery_power, coefficient: 2 }
    clamp: absolute
faults:
  - { name: fault_codes, address: 103, words: 4 }
"#;
        let map = RegisterMap::from_yaml_str(yaml).unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("pv_total").unwrap().word_count, WordCount::Two);
        assert_eq!(
            map.get("battery_soc").unwrap().access,
            Access::Writable { min: 0.0, max: 100.0 }
        );
        assert_eq!(map.derived()[0].clamp, Clamp::Absolute);
        assert_eq!(map.faults()[0].words, 4);
    }

    #[test]
    fn test_yaml_unknown_term_rejected() {
        let yaml = r#"
registers:
  - { name: a, address: 1 }
derived:
  - name: b
    terms: [{ register: missing, coefficient: 1 }]
"#;
        let err = RegisterMap::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, RegisterMapError::UnknownTerm { .. }));
    }
}
