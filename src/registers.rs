use crate::auth::ProtectedRange;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Choice(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Choice(label) => write!(f, "{label}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataWidth {
    #[default]
    Word,
    DoubleWord,
}

impl DataWidth {
    pub const fn words(self) -> u16 {
        match self {
            DataWidth::Word => 1,
            DataWidth::DoubleWord => 2,
        }
    }
}

/// How a register may be used, resolved once when the table is loaded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    #[default]
    Readable,
    WritableNumeric {
        min: f64,
        max: f64,
    },
    WritableEnum,
}

fn unit_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub address: u16,
    pub name: String,
    #[serde(default)]
    pub width: DataWidth,
    #[serde(default)]
    pub signed: bool,
    #[serde(default = "unit_scale")]
    pub scale: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub kind: RegisterKind,
    /// Labels for enumerated registers, keyed by raw value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<u16, String>,
    /// Set from the protected-range table when the register table is built.
    #[serde(skip)]
    pub protected: bool,
}

impl RegisterDescriptor {
    pub fn new(address: u16, name: &str) -> Self {
        Self {
            address,
            name: name.to_string(),
            width: DataWidth::Word,
            signed: false,
            scale: 1.0,
            unit: None,
            kind: RegisterKind::Readable,
            options: BTreeMap::new(),
            protected: false,
        }
    }

    pub fn scaled(mut self, scale: f64, unit: &str) -> Self {
        self.scale = scale;
        self.unit = Some(unit.to_string());
        self
    }

    pub fn signed(mut self) -> Self {
        self.signed = true;
        self
    }

    pub fn double_word(mut self) -> Self {
        self.width = DataWidth::DoubleWord;
        self
    }

    pub fn writable(mut self, min: f64, max: f64) -> Self {
        self.kind = RegisterKind::WritableNumeric { min, max };
        self
    }

    pub fn options(mut self, options: &[(u16, &str)], writable: bool) -> Self {
        self.options = options
            .iter()
            .map(|(raw, label)| (*raw, (*label).to_string()))
            .collect();
        if writable {
            self.kind = RegisterKind::WritableEnum;
        }
        self
    }

    pub const fn words(&self) -> u16 {
        self.width.words()
    }

    pub fn is_writable(&self) -> bool {
        !matches!(self.kind, RegisterKind::Readable)
    }

    /// Last word address occupied by this register.
    pub fn end_address(&self) -> u16 {
        self.address + (self.words() - 1)
    }

    fn raw(&self, words: &[u16]) -> Option<i64> {
        match (self.width, self.signed) {
            (DataWidth::Word, false) => words.first().map(|&w| i64::from(w)),
            (DataWidth::Word, true) => words.first().map(|&w| i64::from(w as i16)),
            (DataWidth::DoubleWord, signed) => {
                let (hi, lo) = (*words.first()?, *words.get(1)?);
                let combined = (u32::from(hi) << 16) | u32::from(lo);
                Some(if signed {
                    i64::from(combined as i32)
                } else {
                    i64::from(combined)
                })
            }
        }
    }

    /// Interpret the raw words read from the device. `None` when too few words were supplied.
    pub fn decode(&self, words: &[u16]) -> Option<Value> {
        let raw = self.raw(words)?;
        if !self.options.is_empty() {
            let label = u16::try_from(raw)
                .ok()
                .and_then(|key| self.options.get(&key).cloned())
                .unwrap_or_else(|| format!("unknown ({raw})"));
            return Some(Value::Choice(label));
        }
        Some(Value::Number(round_to_scale(raw as f64 * self.scale, self.scale)))
    }

    /// Validate a requested value and convert it to the words to write.
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>, String> {
        let raw = match (&self.kind, value) {
            (RegisterKind::Readable, _) => return Err("register is read-only".to_string()),
            (RegisterKind::WritableNumeric { min, max }, Value::Number(n)) => {
                if !n.is_finite() || n < min || n > max {
                    return Err(format!("{n} outside {min}..={max}"));
                }
                (n / self.scale).round() as i64
            }
            (RegisterKind::WritableNumeric { .. }, Value::Choice(label)) => {
                return Err(format!("expected a number, got {label:?}"));
            }
            (RegisterKind::WritableEnum, Value::Choice(label)) => self
                .options
                .iter()
                .find(|(_, l)| l.eq_ignore_ascii_case(label))
                .map(|(raw, _)| i64::from(*raw))
                .ok_or_else(|| format!("{label:?} is not a valid option"))?,
            (RegisterKind::WritableEnum, Value::Number(n)) => {
                let key = *n as i64;
                if n.fract() != 0.0 || !u16::try_from(key).is_ok_and(|k| self.options.contains_key(&k)) {
                    return Err(format!("{n} is not a valid option"));
                }
                key
            }
        };
        self.raw_to_words(raw)
    }

    fn raw_to_words(&self, raw: i64) -> Result<Vec<u16>, String> {
        match (self.width, self.signed) {
            (DataWidth::Word, false) => u16::try_from(raw)
                .map(|w| vec![w])
                .map_err(|_| format!("raw value {raw} does not fit 16 bits")),
            (DataWidth::Word, true) => i16::try_from(raw)
                .map(|w| vec![w as u16])
                .map_err(|_| format!("raw value {raw} does not fit signed 16 bits")),
            (DataWidth::DoubleWord, false) => u32::try_from(raw)
                .map(|w| vec![(w >> 16) as u16, w as u16])
                .map_err(|_| format!("raw value {raw} does not fit 32 bits")),
            (DataWidth::DoubleWord, true) => i32::try_from(raw)
                .map(|w| vec![((w as u32) >> 16) as u16, w as u16])
                .map_err(|_| format!("raw value {raw} does not fit signed 32 bits")),
        }
    }

    /// Parse a command-line value for this register.
    pub fn parse_value(&self, input: &str) -> Result<Value, String> {
        let input = input.trim();
        if self.options.values().any(|l| l.eq_ignore_ascii_case(input)) {
            return Ok(Value::Choice(input.to_string()));
        }
        input
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|e| format!("{input:?}: {e}"))
    }
}

/// Drop the floating-point noise a fractional scale introduces (245 * 0.1 -> 24.5).
fn round_to_scale(value: f64, scale: f64) -> f64 {
    if scale >= 1.0 || scale <= 0.0 {
        return value;
    }
    let decimals = (-scale.log10()).ceil() as i32;
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Immutable descriptor table keyed by address.
#[derive(Debug, Clone, Default)]
pub struct RegisterTable {
    registers: BTreeMap<u16, RegisterDescriptor>,
}

impl RegisterTable {
    pub fn new(descriptors: Vec<RegisterDescriptor>) -> Result<Self, ConfigError> {
        let mut registers = BTreeMap::new();
        for descriptor in descriptors {
            validate(&descriptor)?;
            let address = descriptor.address;
            if registers.insert(address, descriptor).is_some() {
                return Err(ConfigError::DuplicateAddress(address));
            }
        }
        Ok(Self { registers })
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Mark every register that falls inside a protected range.
    pub fn with_protection(mut self, ranges: &[ProtectedRange]) -> Self {
        for descriptor in self.registers.values_mut() {
            descriptor.protected = ranges.iter().any(|r| r.contains(descriptor.address));
        }
        self
    }

    pub fn get(&self, address: u16) -> Option<&RegisterDescriptor> {
        self.registers.get(&address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.registers.values()
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Register table for the HF-series hybrid inverters.
    pub fn hf_series() -> Self {
        let descriptors = vec![
            RegisterDescriptor::new(0x0100, "battery_soc").scaled(1.0, "%"),
            RegisterDescriptor::new(0x0101, "battery_voltage").scaled(0.1, "V"),
            RegisterDescriptor::new(0x0102, "battery_current")
                .scaled(0.1, "A")
                .signed(),
            RegisterDescriptor::new(0x0107, "pv1_voltage").scaled(0.1, "V"),
            RegisterDescriptor::new(0x0108, "pv1_current").scaled(0.1, "A"),
            RegisterDescriptor::new(0x0109, "pv1_power").scaled(1.0, "W"),
            RegisterDescriptor::new(0x0210, "machine_state").options(
                &[
                    (0, "initializing"),
                    (1, "standby"),
                    (2, "ac_charging"),
                    (3, "pv_charging"),
                    (4, "ac_bypass"),
                    (5, "inverting"),
                    (6, "fault"),
                ],
                false,
            ),
            RegisterDescriptor::new(0x0213, "grid_voltage").scaled(0.1, "V"),
            RegisterDescriptor::new(0x0216, "inverter_voltage").scaled(0.1, "V"),
            RegisterDescriptor::new(0x021B, "load_power").scaled(1.0, "W"),
            RegisterDescriptor::new(0x021C, "load_apparent_power").scaled(1.0, "VA"),
            RegisterDescriptor::new(0xF02C, "pv_energy_total")
                .scaled(0.1, "kWh")
                .double_word(),
            RegisterDescriptor::new(0xE001, "pv_charge_current_limit")
                .scaled(0.1, "A")
                .writable(0.0, 150.0),
            RegisterDescriptor::new(0xE008, "boost_charge_voltage")
                .scaled(0.1, "V")
                .writable(10.0, 62.0),
            RegisterDescriptor::new(0xE009, "float_charge_voltage")
                .scaled(0.1, "V")
                .writable(10.0, 62.0),
            RegisterDescriptor::new(0xE204, "output_priority").options(
                &[(0, "solar"), (1, "line"), (2, "sbu")],
                true,
            ),
            RegisterDescriptor::new(0xE20F, "charge_source_priority").options(
                &[
                    (0, "pv_preferred"),
                    (1, "ac_preferred"),
                    (2, "hybrid"),
                    (3, "pv_only"),
                ],
                true,
            ),
        ];
        Self::new(descriptors).expect("built-in register table is valid")
    }
}

fn validate(descriptor: &RegisterDescriptor) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidRegister {
        address: descriptor.address,
        reason: reason.to_string(),
    };
    if !(descriptor.scale.is_finite() && descriptor.scale > 0.0) {
        return Err(invalid("scale must be positive"));
    }
    if descriptor.address.checked_add(descriptor.words() - 1).is_none() {
        return Err(invalid("register runs past FFFFh"));
    }
    match &descriptor.kind {
        RegisterKind::WritableNumeric { min, max } if min > max => {
            Err(invalid("min exceeds max"))
        }
        RegisterKind::WritableEnum if descriptor.options.is_empty() => {
            Err(invalid("enum register without options"))
        }
        _ => Ok(()),
    }
}
