/// Tabular and CSV rendering of aggregated, annotated and comparative
/// profiles.
use std::io;

use anyhow::Result;

use crate::profile::aggregate::AggregateProfile;
use crate::profile::annotate::AnnotatedProfile;
use crate::profile::compare::Comparison;
use crate::profile::full::FullProfile;

/// Print the retained aggregate entries, heaviest first, with a leading
/// `_total` row.
pub fn write_aggregate(
    w: &mut dyn io::Write,
    profile: &AggregateProfile,
    retained: &[usize],
) -> Result<()> {
    let mut rows: Vec<&usize> = retained.iter().collect();
    rows.sort_by(|&&a, &&b| {
        profile.profile[b]
            .time
            .partial_cmp(&profile.profile[a].time)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total_time = profile.total_time();
    let total_energy = profile.total_energy();
    let total_samples: f64 = profile.profile.iter().map(|e| e.samples).sum();
    let total_execs: f64 = profile.profile.iter().map(|e| e.execs).sum();
    let total_power = if total_time > 0.0 {
        total_energy / total_time
    } else {
        0.0
    };

    writeln!(
        w,
        "{:<40} {:>12} {:>12} {:>10} {:>12} {:>10} {:>7}",
        "Label", "Time [s]", "Executions", "Power [W]", "Energy [J]", "Samples", "%"
    )?;
    let mut write_row = |label: &str, time: f64, execs: f64, power: f64, energy: f64, samples: f64| {
        let share = if total_samples > 0.0 {
            samples / total_samples
        } else {
            0.0
        };
        writeln!(
            w,
            "{:<40} {:>12.6} {:>12.1} {:>10.3} {:>12.6} {:>10.1} {:>7.3}",
            label, time, execs, power, energy, samples, share
        )
    };
    write_row(
        "_total",
        total_time,
        total_execs,
        total_power,
        total_energy,
        total_samples,
    )?;
    for &&i in &rows {
        let e = &profile.profile[i];
        write_row(&e.label, e.time, e.execs, e.power, e.energy, e.samples)?;
    }
    Ok(())
}

/// The aggregate as a semicolon-separated table.
pub fn write_aggregate_csv(
    w: &mut dyn io::Write,
    profile: &AggregateProfile,
    retained: &[usize],
) -> Result<()> {
    writeln!(w, "key;time;power;energy;samples;execs")?;
    for &i in retained {
        let e = &profile.profile[i];
        writeln!(
            w,
            "{};{};{};{};{};{}",
            e.key, e.time, e.power, e.energy, e.samples, e.execs
        )?;
    }
    Ok(())
}

/// Print the comparison matrix: one row per key, one value column per
/// candidate, the reduction at the bottom when requested.
pub fn write_comparison(w: &mut dyn io::Write, comparison: &Comparison) -> Result<()> {
    write!(w, "{:<40} {:>14}", "Label", "baseline")?;
    for candidate in &comparison.candidates {
        write!(w, " {:>14}", candidate.name)?;
    }
    writeln!(w)?;
    for (i, label) in comparison.labels.iter().enumerate() {
        write!(w, "{:<40} {:>14.6}", label, comparison.baseline[i])?;
        for candidate in &comparison.candidates {
            write!(w, " {:>14.6}", candidate.errors[i])?;
        }
        writeln!(w)?;
    }
    if comparison
        .candidates
        .iter()
        .any(|c| c.reduced.is_some())
    {
        write!(w, "{:<40} {:>14}", "_reduced", "")?;
        for candidate in &comparison.candidates {
            match candidate.reduced {
                Some(value) => write!(w, " {:>14.6}", value)?,
                None => write!(w, " {:>14}", "")?,
            }
        }
        writeln!(w)?;
    }
    Ok(())
}

pub fn write_comparison_csv(w: &mut dyn io::Write, comparison: &Comparison) -> Result<()> {
    write!(w, "key;baseline")?;
    for candidate in &comparison.candidates {
        write!(w, ";{}", candidate.name)?;
    }
    writeln!(w)?;
    for (i, key) in comparison.keys.iter().enumerate() {
        write!(w, "{};{}", key, comparison.baseline[i])?;
        for candidate in &comparison.candidates {
            write!(w, ";{}", candidate.errors[i])?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// The annotated assembly listing: binaries and functions ordered by their
/// sample counts, instruction rows indented beneath them.
pub fn write_annotated_asm(
    w: &mut dyn io::Write,
    profile: &AnnotatedProfile,
    retained: &[usize],
) -> Result<()> {
    writeln!(
        w,
        "{:>10} {:>12} {:>9}  total",
        "Time [s]", "Energy [J]", "Samples"
    )?;
    writeln!(
        w,
        "{:>10.4} {:>12.4} {:>9.0}",
        profile.asm.iter().map(|r| r.time).sum::<f64>(),
        profile.asm.iter().map(|r| r.energy).sum::<f64>(),
        profile.asm.iter().map(|r| r.samples).sum::<f64>()
    )?;

    let mut order: Vec<(String, Option<String>)> = Vec::new();
    for &i in retained {
        let row = &profile.asm[i];
        let group = (row.binary.clone(), row.function.clone());
        if !order.contains(&group) {
            order.push(group);
        }
    }

    let mut last_binary: Option<&str> = None;
    for (binary, function) in &order {
        if last_binary != Some(binary.as_str()) {
            writeln!(w, "\n{}", binary)?;
            last_binary = Some(binary.as_str());
        }
        writeln!(w, "  {}", function.as_deref().unwrap_or("??"))?;
        for &i in retained {
            let row = &profile.asm[i];
            if &row.binary != binary || row.function.as_deref() != function.as_deref() {
                continue;
            }
            writeln!(
                w,
                "{:>10.4} {:>12.4} {:>9.0}    0x{:<10x} {:>6} {:<8} {}",
                row.time,
                row.energy,
                row.samples,
                row.pc,
                block_suffix(row.basicblock.as_deref().unwrap_or("")),
                row.instruction.as_deref().unwrap_or(""),
                row.args
            )?;
        }
    }
    Ok(())
}

/// The annotated source listing, grouped by binary and file.
pub fn write_annotated_source(
    w: &mut dyn io::Write,
    profile: &AnnotatedProfile,
    retained: &[usize],
) -> Result<()> {
    let mut last_file: Option<(&str, &str)> = None;
    for &i in retained {
        let row = &profile.source[i];
        if last_file != Some((row.binary.as_str(), row.file.as_str())) {
            writeln!(w, "\n{}: {}", row.binary, row.file)?;
            writeln!(
                w,
                "{:>10} {:>12} {:>9}  {:>5}  source",
                "Time [s]", "Energy [J]", "Samples", "Line"
            )?;
            last_file = Some((row.binary.as_str(), row.file.as_str()));
        }
        writeln!(
            w,
            "{:>10.4} {:>12.4} {:>9.0}  {:>5}  {}",
            row.time, row.energy, row.samples, row.line, row.source
        )?;
    }
    Ok(())
}

pub fn write_annotated_csv(
    w: &mut dyn io::Write,
    profile: &AnnotatedProfile,
    retained: &[usize],
) -> Result<()> {
    writeln!(w, "pc;binary;file;function;basicblock;line;instruction;args;time;energy;samples")?;
    for &i in retained {
        let row = &profile.asm[i];
        writeln!(
            w,
            "0x{:x};{};{};{};{};{};{};{};{};{};{}",
            row.pc,
            row.binary,
            row.file.as_deref().unwrap_or(""),
            row.function.as_deref().unwrap_or(""),
            row.basicblock.as_deref().unwrap_or(""),
            row.line.unwrap_or(0),
            row.instruction.as_deref().unwrap_or(""),
            row.args,
            row.time,
            row.energy,
            row.samples
        )?;
    }
    Ok(())
}

/// One-screen summary of a full profile.
pub fn write_profile_info(w: &mut dyn io::Write, profile: &FullProfile) -> Result<()> {
    writeln!(w, "name:          {}", profile.name)?;
    writeln!(w, "target:        {}", profile.target)?;
    writeln!(w, "samples:       {}", profile.samples)?;
    writeln!(w, "sampling time: {:.6} s", profile.sampling_time)?;
    writeln!(w, "latency time:  {:.6} s", profile.latency_time)?;
    if profile.samples > 0 {
        writeln!(
            w,
            "frequency:     {:.2} Hz",
            profile.samples as f64 / profile.sampling_time.max(f64::MIN_POSITIVE)
        )?;
    }
    writeln!(w, "volts:         {}", profile.volts)?;
    writeln!(w, "cpus:          {}", profile.cpus)?;
    writeln!(w, "energy:        {:.6} J", profile.energy)?;
    writeln!(w, "power:         {:.6} W", profile.power)?;
    writeln!(w, "toolchain:     {}", profile.toolchain)?;
    writeln!(w, "binaries:      {}", profile.maps.binary.join(", "))?;
    Ok(())
}

pub fn write_aggregate_info(w: &mut dyn io::Write, profile: &AggregateProfile) -> Result<()> {
    writeln!(w, "name:          {}", profile.name)?;
    writeln!(w, "target:        {}", profile.target)?;
    writeln!(w, "samples:       {:.1}", profile.samples)?;
    writeln!(w, "sampling time: {:.6} s", profile.sampling_time)?;
    writeln!(w, "averaged runs: {}", profile.averaged)?;
    writeln!(w, "keys:          {}", profile.profile.len())?;
    writeln!(w, "energy:        {:.6} J", profile.energy)?;
    writeln!(w, "toolchain:     {}", profile.toolchain)?;
    Ok(())
}

fn block_suffix(basicblock: &str) -> &str {
    // Tags look like `f12b3`; the function part is redundant beneath a
    // function heading.
    if basicblock.starts_with('f') {
        if let Some(split) = basicblock.find('b') {
            return &basicblock[split..];
        }
    }
    basicblock
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapper::ListMapper;
    use crate::core::types::{Meta, Sample, AGG_PROFILE_VERSION};
    use crate::profile::aggregate::AggregateEntry;

    fn aggregate_profile() -> AggregateProfile {
        let mut mapper = ListMapper::new();
        let sample = mapper.map(&Sample {
            pc: 0x1000,
            binary: Some("hello".to_string()),
            file: None,
            function: Some("main".to_string()),
            basicblock: None,
            line: None,
            instruction: None,
            opcode: None,
            meta: Meta::empty(),
        });
        AggregateProfile {
            version: AGG_PROFILE_VERSION.to_string(),
            name: "hello".to_string(),
            target: "hello".to_string(),
            samples: 1.0,
            sampling_time: 1.0,
            latency_time: 0.0,
            volts: 1.0,
            energy: 2.0,
            power: 2.0,
            averaged: 1,
            toolchain: "test".to_string(),
            maps: mapper.into_maps(),
            profile: vec![AggregateEntry {
                key: "hello:main".to_string(),
                time: 1.0,
                power: 2.0,
                energy: 2.0,
                samples: 1.0,
                execs: 1.0,
                label: "hello:main".to_string(),
                sample,
            }],
        }
    }

    #[test]
    fn aggregate_table_has_total_row() {
        let profile = aggregate_profile();
        let mut buf = Vec::new();
        write_aggregate(&mut buf, &profile, &[0]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("_total"));
        assert!(text.contains("hello:main"));
    }

    #[test]
    fn aggregate_csv_lists_retained_keys() {
        let profile = aggregate_profile();
        let mut buf = Vec::new();
        write_aggregate_csv(&mut buf, &profile, &[0]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("key;time;power;energy;samples;execs\n"));
        assert!(text.contains("hello:main;1;2;2;1;1"));
    }

    #[test]
    fn block_suffix_strips_the_function_part() {
        assert_eq!(block_suffix("f12b3"), "b3");
        assert_eq!(block_suffix("f0"), "f0");
        assert_eq!(block_suffix(""), "");
    }
}
