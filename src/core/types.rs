/// Core types used throughout pperf: the sample field vector, its mapped
/// (interned) counterpart, and the per-instruction meta bitset.
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Version tags carried by persisted artifacts. Loaders compare these for
/// exact equality; see `storage`.
pub const CACHE_VERSION: &str = "c0.3";
pub const PROFILE_VERSION: &str = "0.5";
pub const AGG_PROFILE_VERSION: &str = "agg0.9";
pub const ANN_PROFILE_VERSION: &str = "ann0.1";

pub const LABEL_UNKNOWN: &str = "_unknown";
pub const LABEL_FOREIGN: &str = "_foreign";
pub const LABEL_KERNEL: &str = "_kernel";
pub const LABEL_UNSUPPORTED: &str = "_unsupported";

bitflags! {
    /// Flags describing a single instruction. `FUNCTION_HEAD` implies
    /// `BASICBLOCK_HEAD`; `FUNCTION_BACK` marks the last instruction before
    /// the next function head or the end of the section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Meta: u32 {
        const BRANCH                = 1;
        const BRANCH_TARGET         = 2;
        const DYNAMIC_BRANCH_TARGET = 4;
        const FUNCTION_HEAD         = 8;
        const FUNCTION_BACK         = 16;
        const BASICBLOCK_HEAD       = 32;
        const BASICBLOCK_BACK       = 64;
    }
}

impl Serialize for Meta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Meta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Meta::from_bits_truncate(u32::deserialize(deserializer)?))
    }
}

/// The named positions of the sample field vector. Positions are stable;
/// all producers and consumers agree on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SampleField {
    Pc,
    Binary,
    File,
    Function,
    Basicblock,
    Line,
    Instruction,
    Opcode,
    Meta,
}

impl SampleField {
    pub const ALL: [SampleField; 9] = [
        SampleField::Pc,
        SampleField::Binary,
        SampleField::File,
        SampleField::Function,
        SampleField::Basicblock,
        SampleField::Line,
        SampleField::Instruction,
        SampleField::Opcode,
        SampleField::Meta,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SampleField::Pc => "pc",
            SampleField::Binary => "binary",
            SampleField::File => "file",
            SampleField::Function => "function",
            SampleField::Basicblock => "basicblock",
            SampleField::Line => "line",
            SampleField::Instruction => "instruction",
            SampleField::Opcode => "opcode",
            SampleField::Meta => "meta",
        }
    }
}

impl fmt::Display for SampleField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleField {
    type Err = String;

    /// Accepts a field name or its numeric position.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(index) = s.parse::<usize>() {
            return SampleField::ALL
                .get(index)
                .copied()
                .ok_or_else(|| format!("sample field index {} out of range", index));
        }
        SampleField::ALL
            .iter()
            .copied()
            .find(|field| field.name() == s)
            .ok_or_else(|| format!("unknown sample field '{}'", s))
    }
}

/// One fully resolved sample: every string position carries its value.
/// Any field except `pc` may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub pc: u64,
    pub binary: Option<String>,
    pub file: Option<String>,
    pub function: Option<String>,
    pub basicblock: Option<String>,
    pub line: Option<u32>,
    pub instruction: Option<String>,
    pub opcode: Option<u128>,
    pub meta: Meta,
}

impl Sample {
    /// A sample that knows nothing but its own address.
    pub fn unknown(pc: u64) -> Sample {
        Sample {
            pc,
            binary: None,
            file: None,
            function: None,
            basicblock: None,
            line: None,
            instruction: None,
            opcode: None,
            meta: Meta::empty(),
        }
    }
}

/// The interned form of `Sample`: the five string positions hold indices
/// into the per-position dictionaries of a `Maps` object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MappedSample {
    pub pc: u64,
    pub binary: Option<u32>,
    pub file: Option<u32>,
    pub function: Option<u32>,
    pub basicblock: Option<u32>,
    pub line: Option<u32>,
    pub instruction: Option<u32>,
    pub opcode: Option<u128>,
    pub meta: Meta,
}

/// Parse a cpu list such as `0-3,5` into the individual entries.
pub fn parse_range(list: &str) -> Result<Vec<u32>, String> {
    let mut result = Vec::new();
    for part in list.split(',') {
        match part.split_once('-') {
            Some((a, b)) => {
                let a: u32 = a.trim().parse().map_err(|_| bad_range(part))?;
                let b: u32 = b.trim().parse().map_err(|_| bad_range(part))?;
                if a > b {
                    return Err(bad_range(part));
                }
                result.extend(a..=b);
            }
            None => result.push(part.trim().parse().map_err(|_| bad_range(part))?),
        }
    }
    result.sort_unstable();
    result.dedup();
    Ok(result)
}

fn bad_range(part: &str) -> String {
    format!("invalid cpu range '{}'", part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_flags_combine() {
        let meta = Meta::FUNCTION_HEAD | Meta::BASICBLOCK_HEAD;
        assert!(meta.contains(Meta::FUNCTION_HEAD));
        assert!(meta.contains(Meta::BASICBLOCK_HEAD));
        assert!(!meta.contains(Meta::BRANCH));
        assert_eq!(meta.bits(), 8 | 32);
    }

    #[test]
    fn meta_serde_roundtrip() {
        let meta = Meta::BRANCH | Meta::BASICBLOCK_BACK;
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, "65");
        let back: Meta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn sample_field_names_roundtrip() {
        for field in SampleField::ALL {
            assert_eq!(field.name().parse::<SampleField>().unwrap(), field);
        }
        assert!("bogus".parse::<SampleField>().is_err());
    }

    #[test]
    fn sample_fields_parse_by_index() {
        assert_eq!("0".parse::<SampleField>().unwrap(), SampleField::Pc);
        assert_eq!("3".parse::<SampleField>().unwrap(), SampleField::Function);
        assert!("9".parse::<SampleField>().is_err());
    }

    #[test]
    fn cpu_ranges() {
        assert_eq!(parse_range("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_range("2,0-1,2").unwrap(), vec![0, 1, 2]);
        assert!(parse_range("3-1").is_err());
        assert!(parse_range("x").is_err());
    }
}
