/// Renders mapped samples as delimited strings using a chosen subset of
/// sample fields. Pure given the dictionaries it was constructed with.
use anyhow::Result;

use crate::core::mapper::{ListMapper, Maps};
use crate::core::types::{MappedSample, Sample, SampleField};

pub struct SampleFormatter {
    mapper: ListMapper,
}

impl SampleFormatter {
    pub fn new(maps: Maps) -> SampleFormatter {
        let mut mapper = ListMapper::new();
        mapper.set_maps(maps);
        SampleFormatter { mapper }
    }

    /// Substitute dictionary indices back into strings.
    pub fn remap(&self, sample: &MappedSample) -> Result<Sample> {
        self.mapper.remap(sample)
    }

    /// Render `sample` as the chosen fields joined by `delimiter`. Absent
    /// fields render as `label_none`, `pc` as hex, `file` as its basename.
    pub fn format(
        &self,
        sample: &MappedSample,
        fields: &[SampleField],
        delimiter: &str,
        label_none: &str,
    ) -> Result<String> {
        let sample = self.remap(sample)?;
        Ok(format_sample(&sample, fields, delimiter, label_none))
    }
}

/// The formatting core, usable on already-remapped samples.
pub fn format_sample(
    sample: &Sample,
    fields: &[SampleField],
    delimiter: &str,
    label_none: &str,
) -> String {
    let parts: Vec<String> = fields
        .iter()
        .map(|&field| format_field(sample, field, label_none))
        .collect();
    parts.join(delimiter)
}

fn format_field(sample: &Sample, field: SampleField, label_none: &str) -> String {
    let missing = || label_none.to_string();
    match field {
        SampleField::Pc => format!("0x{:x}", sample.pc),
        SampleField::Binary => sample.binary.clone().unwrap_or_else(missing),
        SampleField::File => sample
            .file
            .as_deref()
            .map(basename)
            .map(str::to_string)
            .unwrap_or_else(missing),
        SampleField::Function => sample.function.clone().unwrap_or_else(missing),
        SampleField::Basicblock => sample.basicblock.clone().unwrap_or_else(missing),
        SampleField::Line => sample
            .line
            .map(|l| l.to_string())
            .unwrap_or_else(missing),
        SampleField::Instruction => sample.instruction.clone().unwrap_or_else(missing),
        SampleField::Opcode => sample
            .opcode
            .map(|o| o.to_string())
            .unwrap_or_else(missing),
        SampleField::Meta => sample.meta.bits().to_string(),
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
