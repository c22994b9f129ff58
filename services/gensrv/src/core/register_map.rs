//! Register maps and reading decode
//!
//! A register map is data, not code: each controller model lists the
//! contiguous blocks to read and how every field inside a block turns raw
//! registers into a number or a set of flags.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::protocols::modbus::constants::MAX_READ_REGISTERS;

/// Decimal places ever inferred from a fractional scale factor
const MAX_IMPLIED_PRECISION: u32 = 6;

/// Largest explicit `precision`; beyond this `10^places` stops being exact
pub const MAX_PRECISION: u32 = 15;

/// Blocks to read for one controller model, in read order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterMap {
    #[serde(default)]
    pub description: Option<String>,
    pub blocks: Vec<BlockSpec>,
}

/// One contiguous register range, read with a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSpec {
    pub name: String,
    pub start: u16,
    pub count: u16,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// How raw registers become a field value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeKind {
    /// raw × scale
    ScaledU16,
    /// named booleans by bit position
    BitfieldU16,
    /// `(high << 16) | low` × scale
    U32Pair,
}

impl DecodeKind {
    /// Registers consumed starting at the field offset
    pub fn width(self) -> u16 {
        match self {
            DecodeKind::ScaledU16 | DecodeKind::BitfieldU16 => 1,
            DecodeKind::U32Pair => 2,
        }
    }
}

/// One field within a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Register offset from the block start
    pub offset: u16,
    pub kind: DecodeKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Decimal places to round to; inferred from `scale` when absent
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Output name → bit position (bitfield_u16 only)
    #[serde(default)]
    pub bits: BTreeMap<String, u8>,
}

fn default_scale() -> f64 {
    1.0
}

/// A decoded value. Integral numbers serialize without a fractional part.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            FieldValue::Number(_) => None,
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // 2^53: beyond this f64 no longer holds every integer exactly
        const EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;
        match *self {
            FieldValue::Bool(b) => serializer.serialize_bool(b),
            FieldValue::Number(v) if v.fract() == 0.0 && v.abs() < EXACT_LIMIT => {
                serializer.serialize_i64(v as i64)
            },
            FieldValue::Number(v) => serializer.serialize_f64(v),
        }
    }
}

/// One poll cycle's decoded fields for a channel.
///
/// Field presence is meaningful: a field that is absent was not read this
/// cycle, it is never zero-filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub channel: String,
    pub captured_at: DateTime<Utc>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Reading {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            captured_at: Utc::now(),
            fields: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

impl RegisterMap {
    /// Names a decoded reading can carry, in block order
    pub fn output_names(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .flat_map(|block| block.fields.iter())
            .flat_map(FieldSpec::output_names)
            .collect()
    }

    /// Decode a reading as if every register read back zero
    pub fn decode_zeroed(&self, channel: &str) -> Reading {
        let mut reading = Reading::new(channel);
        for block in &self.blocks {
            let image = vec![0u16; block.count as usize];
            block.decode_into(&image, &mut reading.fields);
        }
        reading
    }

    /// Structural problems with this map, one message per problem
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.blocks.is_empty() {
            problems.push("no blocks defined".to_string());
        }

        let mut seen = HashSet::new();
        for block in &self.blocks {
            if block.count == 0 || block.count > MAX_READ_REGISTERS {
                problems.push(format!(
                    "block '{}': count {} outside 1..={}",
                    block.name, block.count, MAX_READ_REGISTERS
                ));
            }
            if u32::from(block.start) + u32::from(block.count) > 0x1_0000 {
                problems.push(format!(
                    "block '{}': range {}+{} exceeds the register space",
                    block.name, block.start, block.count
                ));
            }

            for field in &block.fields {
                let end = u32::from(field.offset) + u32::from(field.kind.width());
                if end > u32::from(block.count) {
                    problems.push(format!(
                        "block '{}': field '{}' at offset {} needs {} register(s), block has {}",
                        block.name,
                        field.name,
                        field.offset,
                        field.kind.width(),
                        block.count
                    ));
                }
                if !field.scale.is_finite() {
                    problems.push(format!("field '{}': scale is not finite", field.name));
                }
                if let Some(places) = field.precision.filter(|p| *p > MAX_PRECISION) {
                    problems.push(format!(
                        "field '{}': precision {} (max {})",
                        field.name, places, MAX_PRECISION
                    ));
                }
                match field.kind {
                    DecodeKind::BitfieldU16 => {
                        if field.bits.is_empty() {
                            problems.push(format!("field '{}': bitfield without bits", field.name));
                        }
                        for (name, bit) in &field.bits {
                            if *bit >= 16 {
                                problems.push(format!(
                                    "field '{}': bit '{}' at position {} (max 15)",
                                    field.name, name, bit
                                ));
                            }
                        }
                    },
                    _ if !field.bits.is_empty() => {
                        problems.push(format!(
                            "field '{}': bits only apply to bitfield_u16",
                            field.name
                        ));
                    },
                    _ => {},
                }

                for name in field.output_names() {
                    if !seen.insert(name) {
                        problems.push(format!("output '{}' defined more than once", name));
                    }
                }
            }
        }

        problems
    }
}

impl BlockSpec {
    /// Decode every field whose registers are all present in `registers`.
    ///
    /// `registers` may be shorter than `count` when the device returned a
    /// short frame; fields reaching past the data are skipped.
    pub fn decode_into(&self, registers: &[u16], out: &mut BTreeMap<String, FieldValue>) -> usize {
        let before = out.len();
        for field in &self.fields {
            field.decode_into(registers, out);
        }
        out.len() - before
    }
}

impl FieldSpec {
    fn output_names(&self) -> Vec<&str> {
        match self.kind {
            DecodeKind::BitfieldU16 => self.bits.keys().map(String::as_str).collect(),
            _ => vec![self.name.as_str()],
        }
    }

    fn decode_into(&self, registers: &[u16], out: &mut BTreeMap<String, FieldValue>) {
        let at = self.offset as usize;
        match self.kind {
            DecodeKind::ScaledU16 => {
                if let Some(&raw) = registers.get(at) {
                    out.insert(self.name.clone(), FieldValue::Number(self.scaled(f64::from(raw))));
                }
            },
            DecodeKind::U32Pair => {
                if let (Some(&high), Some(&low)) = (registers.get(at), registers.get(at + 1)) {
                    let raw = combine_u32(high, low);
                    out.insert(self.name.clone(), FieldValue::Number(self.scaled(f64::from(raw))));
                }
            },
            DecodeKind::BitfieldU16 => {
                if let Some(&raw) = registers.get(at) {
                    for (name, bit) in &self.bits {
                        out.insert(name.clone(), FieldValue::Bool(bit_set(raw, *bit)));
                    }
                }
            },
        }
    }

    fn scaled(&self, raw: f64) -> f64 {
        let value = raw * self.scale;
        match self.precision.or_else(|| implied_precision(self.scale)) {
            Some(places) => round_to(value, places.min(MAX_PRECISION)),
            None => value,
        }
    }
}

/// Big-endian register order: first register is the high word
pub fn combine_u32(high: u16, low: u16) -> u32 {
    (u32::from(high) << 16) | u32::from(low)
}

fn bit_set(raw: u16, bit: u8) -> bool {
    bit < 16 && raw & (1 << bit) != 0
}

/// Decimal places of a fractional scale factor, `None` for integral factors
fn implied_precision(scale: f64) -> Option<u32> {
    if scale.fract() == 0.0 {
        return None;
    }
    let text = format!("{}", scale.abs());
    let places = text
        .split_once('.')
        .map(|(_, decimals)| decimals.len() as u32)
        .unwrap_or(0);
    Some(places.min(MAX_IMPLIED_PRECISION))
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}
