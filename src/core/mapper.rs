/// Reversible string interning for the five string-valued sample positions.
/// Samples carry small integer indices; the dictionaries travel alongside
/// any profile that uses them.
use std::collections::HashMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::core::types::{MappedSample, Sample};

/// The persisted dictionaries, one arena per interned position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Maps {
    pub binary: Vec<String>,
    pub file: Vec<String>,
    pub function: Vec<String>,
    pub basicblock: Vec<String>,
    pub instruction: Vec<String>,
}

/// A bidirectional interner over `Maps`, with a reverse index for O(1)
/// insertion.
#[derive(Debug, Default)]
pub struct ListMapper {
    maps: Maps,
    index: [HashMap<String, u32>; 5],
}

const BINARY: usize = 0;
const FILE: usize = 1;
const FUNCTION: usize = 2;
const BASICBLOCK: usize = 3;
const INSTRUCTION: usize = 4;

impl ListMapper {
    pub fn new() -> ListMapper {
        ListMapper::default()
    }

    /// Restore previously persisted dictionaries, rebuilding the reverse
    /// index.
    pub fn set_maps(&mut self, maps: Maps) {
        self.index = Default::default();
        for (slot, arena) in [
            (BINARY, &maps.binary),
            (FILE, &maps.file),
            (FUNCTION, &maps.function),
            (BASICBLOCK, &maps.basicblock),
            (INSTRUCTION, &maps.instruction),
        ] {
            for (i, value) in arena.iter().enumerate() {
                self.index[slot].insert(value.clone(), i as u32);
            }
        }
        self.maps = maps;
    }

    /// Snapshot the dictionaries for persisting.
    pub fn maps(&self) -> &Maps {
        &self.maps
    }

    pub fn into_maps(self) -> Maps {
        self.maps
    }

    /// Intern the string positions of `sample`. New values are appended to
    /// the dictionaries; repeated values map to their existing index.
    pub fn map(&mut self, sample: &Sample) -> MappedSample {
        MappedSample {
            pc: sample.pc,
            binary: self.intern(BINARY, sample.binary.as_deref()),
            file: self.intern(FILE, sample.file.as_deref()),
            function: self.intern(FUNCTION, sample.function.as_deref()),
            basicblock: self.intern(BASICBLOCK, sample.basicblock.as_deref()),
            line: sample.line,
            instruction: self.intern(INSTRUCTION, sample.instruction.as_deref()),
            opcode: sample.opcode,
            meta: sample.meta,
        }
    }

    /// Substitute the stored strings back. Fails on indices the
    /// dictionaries do not hold.
    pub fn remap(&self, sample: &MappedSample) -> Result<Sample> {
        Ok(Sample {
            pc: sample.pc,
            binary: self.lookup(BINARY, sample.binary)?,
            file: self.lookup(FILE, sample.file)?,
            function: self.lookup(FUNCTION, sample.function)?,
            basicblock: self.lookup(BASICBLOCK, sample.basicblock)?,
            line: sample.line,
            instruction: self.lookup(INSTRUCTION, sample.instruction)?,
            opcode: sample.opcode,
            meta: sample.meta,
        })
    }

    fn intern(&mut self, slot: usize, value: Option<&str>) -> Option<u32> {
        let value = value?;
        if let Some(&i) = self.index[slot].get(value) {
            return Some(i);
        }
        let arena = self.arena_mut(slot);
        let i = arena.len() as u32;
        arena.push(value.to_string());
        self.index[slot].insert(value.to_string(), i);
        Some(i)
    }

    fn lookup(&self, slot: usize, index: Option<u32>) -> Result<Option<String>> {
        let index = match index {
            Some(i) => i as usize,
            None => return Ok(None),
        };
        self.arena(slot)
            .get(index)
            .map(|s| Some(s.clone()))
            .ok_or_else(|| anyhow!("invalid remap request for index {} in map {}", index, slot))
    }

    fn arena(&self, slot: usize) -> &Vec<String> {
        match slot {
            BINARY => &self.maps.binary,
            FILE => &self.maps.file,
            FUNCTION => &self.maps.function,
            BASICBLOCK => &self.maps.basicblock,
            _ => &self.maps.instruction,
        }
    }

    fn arena_mut(&mut self, slot: usize) -> &mut Vec<String> {
        match slot {
            BINARY => &mut self.maps.binary,
            FILE => &mut self.maps.file,
            FUNCTION => &mut self.maps.function,
            BASICBLOCK => &mut self.maps.basicblock,
            _ => &mut self.maps.instruction,
        }
    }
}
