/// Correlates per-PC measurements onto the disassembly and source tables of
/// the ELF caches referenced by one or more full profiles.
use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::cache::CacheData;
use crate::core::formatter::SampleFormatter;
use crate::core::types::ANN_PROFILE_VERSION;
use crate::profile::aggregate::Mode;
use crate::profile::full::FullProfile;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsmRow {
    pub pc: u64,
    pub binary: String,
    pub file: Option<String>,
    pub function: Option<String>,
    pub basicblock: Option<String>,
    pub line: Option<u32>,
    pub instruction: Option<String>,
    pub args: String,
    pub time: f64,
    pub energy: f64,
    pub samples: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub binary: String,
    pub file: String,
    pub line: u32,
    pub source: String,
    pub time: f64,
    pub energy: f64,
    pub samples: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedProfile {
    pub version: String,
    pub name: String,
    pub target: String,
    pub samples: f64,
    pub sampling_time: f64,
    pub latency_time: f64,
    pub energy: f64,
    pub power: f64,
    pub toolchain: String,
    pub asm: Vec<AsmRow>,
    pub source: Vec<SourceRow>,
}

impl storage::Artifact for AnnotatedProfile {
    const VERSION: &'static str = ANN_PROFILE_VERSION;
    const KIND: &'static str = "annotated profile";
}

#[derive(Debug, Clone)]
pub struct AnnotateOptions {
    pub mode: Mode,
    pub account_latency: bool,
    pub use_wall_time: bool,
}

impl Default for AnnotateOptions {
    fn default() -> AnnotateOptions {
        AnnotateOptions {
            mode: Mode::Mean,
            account_latency: false,
            use_wall_time: false,
        }
    }
}

/// Build the annotated profile: one asm row per cached PC, one source row
/// per captured source line, measurements joined in from the profiles.
pub fn annotate(
    profiles: &[FullProfile],
    caches: &BTreeMap<String, CacheData>,
    options: &AnnotateOptions,
) -> Result<AnnotatedProfile> {
    if profiles.is_empty() {
        bail!("no profiles to annotate");
    }
    let mode_factor = match options.mode {
        Mode::Add => 1.0,
        Mode::Mean => 1.0 / profiles.len() as f64,
    };

    // (binary, pc) -> [time, energy, samples]
    let mut buckets: HashMap<(String, u64), [f64; 3]> = HashMap::new();

    let mut result = AnnotatedProfile {
        version: ANN_PROFILE_VERSION.to_string(),
        name: String::new(),
        target: String::new(),
        samples: 0.0,
        sampling_time: 0.0,
        latency_time: 0.0,
        energy: 0.0,
        power: 0.0,
        toolchain: String::new(),
        asm: Vec::new(),
        source: Vec::new(),
    };

    for (i, profile) in profiles.iter().enumerate() {
        if i == 0 {
            result.name = profile.name.clone();
            result.target = profile.target.clone();
            result.toolchain = profile.toolchain.clone();
        } else if result.toolchain != profile.toolchain {
            result.toolchain = "various".to_string();
        }
        result.samples += profile.samples as f64 * mode_factor;
        result.sampling_time += profile.sampling_time * mode_factor;
        result.latency_time += profile.latency_time * mode_factor;
        result.energy += profile.energy * mode_factor;

        let formatter = SampleFormatter::new(profile.maps.clone());
        let avg_latency = profile.avg_latency();

        let mut prev_wall = profile.profile.first().map(|s| s.wall_time).unwrap_or(0.0);
        for sample in &profile.profile {
            let active_cores = (sample.threads.len() as u32).min(profile.cpus).max(1);
            let sample_wall = sample.wall_time - prev_wall;
            for thread in &sample.threads {
                let mut time = if options.use_wall_time {
                    sample_wall
                } else {
                    thread.cpu_time
                };
                if options.account_latency {
                    time = (time - avg_latency).max(0.0);
                }
                let energy = if sample_wall != 0.0 {
                    sample.power * time * (time / (sample_wall * active_cores as f64))
                } else {
                    0.0
                };
                let binary = match thread.sample.binary {
                    Some(_) => formatter
                        .remap(&thread.sample)?
                        .binary
                        .unwrap_or_default(),
                    None => continue,
                };
                let bucket = buckets.entry((binary, thread.sample.pc)).or_insert([0.0; 3]);
                bucket[0] += time * mode_factor;
                bucket[1] += energy * mode_factor;
                bucket[2] += mode_factor;
            }
            prev_wall = sample.wall_time;
        }
    }

    for (binary, cache) in caches {
        for (&pc, sample) in &cache.cache {
            let measured = buckets
                .get(&(binary.clone(), pc))
                .copied()
                .unwrap_or([0.0; 3]);
            let args = cache
                .asm
                .get(&pc)
                .and_then(|asm| asm.split_once('\t'))
                .map(|(_, rest)| rest.replace('\t', " "))
                .unwrap_or_default();
            result.asm.push(AsmRow {
                pc,
                binary: binary.clone(),
                file: sample.file.clone(),
                function: sample.function.clone(),
                basicblock: sample.basicblock.clone(),
                line: sample.line,
                instruction: sample.instruction.clone(),
                args,
                time: measured[0],
                energy: measured[1],
                samples: measured[2],
            });
        }
    }

    // Source rows carry the (binary, file, line) sums of the asm table.
    let mut line_sums: HashMap<(&str, &str, u32), [f64; 3]> = HashMap::new();
    for row in &result.asm {
        if let (Some(file), Some(line)) = (row.file.as_deref(), row.line) {
            let sums = line_sums
                .entry((row.binary.as_str(), file, line))
                .or_insert([0.0; 3]);
            sums[0] += row.time;
            sums[1] += row.energy;
            sums[2] += row.samples;
        }
    }
    let mut source_rows = Vec::new();
    for (binary, cache) in caches {
        for (file, text) in &cache.source {
            let lines = match text {
                Some(lines) => lines,
                None => continue,
            };
            for (i, line_text) in lines.iter().enumerate() {
                let line = (i + 1) as u32;
                let sums = line_sums
                    .get(&(binary.as_str(), file.as_str(), line))
                    .copied()
                    .unwrap_or([0.0; 3]);
                source_rows.push(SourceRow {
                    binary: binary.clone(),
                    file: file.clone(),
                    line,
                    source: line_text.clone(),
                    time: sums[0],
                    energy: sums[1],
                    samples: sums[2],
                });
            }
        }
    }
    result.source = source_rows;

    result.power = if result.sampling_time > 0.0 {
        result.energy / result.sampling_time
    } else {
        0.0
    };
    Ok(result)
}

/// Rendering thresholds, by level. A row survives only if the sums of its
/// binary, function, basic-block and instruction groups all clear their
/// thresholds (0 disables a threshold).
#[derive(Debug, Clone, Copy, Default)]
pub struct Thresholds {
    pub binary_time: f64,
    pub binary_energy: f64,
    pub binary_samples: f64,
    pub function_time: f64,
    pub function_energy: f64,
    pub function_samples: f64,
    pub basicblock_time: f64,
    pub basicblock_energy: f64,
    pub basicblock_samples: f64,
    pub instruction_time: f64,
    pub instruction_energy: f64,
    pub instruction_samples: f64,
}

/// Retained asm and source row indices under `thresholds`.
pub fn apply_thresholds(
    profile: &AnnotatedProfile,
    thresholds: &Thresholds,
) -> (Vec<usize>, Vec<usize>) {
    let mut binary_sums: HashMap<&str, [f64; 3]> = HashMap::new();
    let mut function_sums: HashMap<(&str, &str), [f64; 3]> = HashMap::new();
    let mut block_sums: HashMap<(&str, &str, &str), [f64; 3]> = HashMap::new();
    for row in &profile.asm {
        let add = |sums: &mut [f64; 3]| {
            sums[0] += row.time;
            sums[1] += row.energy;
            sums[2] += row.samples;
        };
        add(binary_sums.entry(row.binary.as_str()).or_default());
        let function = row.function.as_deref().unwrap_or("");
        add(function_sums
            .entry((row.binary.as_str(), function))
            .or_default());
        let block = row.basicblock.as_deref().unwrap_or("");
        add(block_sums
            .entry((row.binary.as_str(), function, block))
            .or_default());
    }

    let clears = |sums: &[f64; 3], time: f64, energy: f64, samples: f64| {
        (time <= 0.0 || sums[0] >= time)
            && (energy <= 0.0 || sums[1] >= energy)
            && (samples <= 0.0 || sums[2] >= samples)
    };

    let mut asm_retained = Vec::new();
    for (i, row) in profile.asm.iter().enumerate() {
        let function = row.function.as_deref().unwrap_or("");
        let block = row.basicblock.as_deref().unwrap_or("");
        let own = [row.time, row.energy, row.samples];
        if clears(
            &binary_sums[row.binary.as_str()],
            thresholds.binary_time,
            thresholds.binary_energy,
            thresholds.binary_samples,
        ) && clears(
            &function_sums[&(row.binary.as_str(), function)],
            thresholds.function_time,
            thresholds.function_energy,
            thresholds.function_samples,
        ) && clears(
            &block_sums[&(row.binary.as_str(), function, block)],
            thresholds.basicblock_time,
            thresholds.basicblock_energy,
            thresholds.basicblock_samples,
        ) && clears(
            &own,
            thresholds.instruction_time,
            thresholds.instruction_energy,
            thresholds.instruction_samples,
        ) {
            asm_retained.push(i);
        }
    }

    let mut source_retained = Vec::new();
    for (i, row) in profile.source.iter().enumerate() {
        let sums = binary_sums.get(row.binary.as_str()).copied().unwrap_or([0.0; 3]);
        if clears(
            &sums,
            thresholds.binary_time,
            thresholds.binary_energy,
            thresholds.binary_samples,
        ) {
            source_retained.push(i);
        }
    }
    (asm_retained, source_retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapper::ListMapper;
    use crate::core::types::{Meta, Sample, CACHE_VERSION, PROFILE_VERSION};
    use crate::profile::full::{ProfileSample, ThreadSample};

    fn cache_sample(pc: u64, function: &str, line: u32, instruction: &str) -> Sample {
        Sample {
            pc,
            binary: Some("hello".to_string()),
            file: Some("/src/hello.c".to_string()),
            function: Some(function.to_string()),
            basicblock: Some("f0b0".to_string()),
            line: Some(line),
            instruction: Some(instruction.to_string()),
            opcode: Some(1),
            meta: Meta::empty(),
        }
    }

    fn hello_cache() -> CacheData {
        let mut cache = BTreeMap::new();
        let mut asm = BTreeMap::new();
        for (pc, function, line, instruction, rendered) in [
            (0x1000u64, "f1", 1u32, "mov", "mov\tx0, #0"),
            (0x1004, "f1", 2, "bl", "bl\t1008 <f2>"),
            (0x1008, "f2", 3, "ret", "ret"),
        ] {
            cache.insert(pc, cache_sample(pc, function, line, instruction));
            asm.insert(pc, rendered.to_string());
        }
        let mut source = BTreeMap::new();
        source.insert(
            "/src/hello.c".to_string(),
            Some(vec![
                "int main() {".to_string(),
                "  f2();".to_string(),
                "}".to_string(),
            ]),
        );
        CacheData {
            version: CACHE_VERSION.to_string(),
            binary: "hello".to_string(),
            name: "hello".to_string(),
            arch: "AArch64".to_string(),
            date: chrono::Utc::now(),
            toolchain: "test".to_string(),
            unwind_inline: false,
            cache,
            asm,
            source,
        }
    }

    fn hello_profile() -> FullProfile {
        let mut mapper = ListMapper::new();
        let s1 = mapper.map(&cache_sample(0x1000, "f1", 1, "mov"));
        let s2 = mapper.map(&cache_sample(0x1008, "f2", 3, "ret"));
        FullProfile {
            version: PROFILE_VERSION.to_string(),
            name: "hello".to_string(),
            target: "hello".to_string(),
            samples: 2,
            sampling_time: 0.001,
            latency_time: 0.0,
            volts: 1.0,
            cpus: 4,
            energy: 0.002,
            power: 2.0,
            toolchain: "test".to_string(),
            maps: mapper.into_maps(),
            cache_map: BTreeMap::from([("hello".to_string(), "hello_cache".to_string())]),
            profile: vec![
                ProfileSample {
                    power: 1.0,
                    wall_time: 0.0,
                    threads: vec![ThreadSample {
                        tid: 1,
                        cpu_time: 0.0,
                        sample: s1,
                    }],
                },
                ProfileSample {
                    power: 2.0,
                    wall_time: 0.001,
                    threads: vec![ThreadSample {
                        tid: 1,
                        cpu_time: 0.001,
                        sample: s2,
                    }],
                },
            ],
        }
    }

    fn caches() -> BTreeMap<String, CacheData> {
        BTreeMap::from([("hello".to_string(), hello_cache())])
    }

    #[test]
    fn asm_rows_cover_every_cached_pc() {
        let result = annotate(&[hello_profile()], &caches(), &AnnotateOptions::default())
            .unwrap();
        assert_eq!(result.asm.len(), 3);
        let row = result.asm.iter().find(|r| r.pc == 0x1004).unwrap();
        assert_eq!(row.instruction.as_deref(), Some("bl"));
        assert_eq!(row.args, "1008 <f2>");
        assert_eq!(row.samples, 0.0);
        assert_eq!(row.time, 0.0);
    }

    #[test]
    fn measurements_join_onto_sampled_pcs() {
        let result = annotate(&[hello_profile()], &caches(), &AnnotateOptions::default())
            .unwrap();
        let row = result.asm.iter().find(|r| r.pc == 0x1008).unwrap();
        assert!((row.time - 0.001).abs() < 1e-12);
        assert!((row.energy - 0.002).abs() < 1e-12);
        assert_eq!(row.samples, 1.0);
        let idle = result.asm.iter().find(|r| r.pc == 0x1000).unwrap();
        assert_eq!(idle.samples, 1.0);
        assert_eq!(idle.time, 0.0);
    }

    #[test]
    fn source_rows_sum_their_lines() {
        let result = annotate(&[hello_profile()], &caches(), &AnnotateOptions::default())
            .unwrap();
        assert_eq!(result.source.len(), 3);
        let line3 = result
            .source
            .iter()
            .find(|r| r.line == 3)
            .unwrap();
        assert_eq!(line3.source, "}");
        assert!((line3.time - 0.001).abs() < 1e-12);
        assert_eq!(line3.samples, 1.0);
        let line1 = result.source.iter().find(|r| r.line == 1).unwrap();
        assert_eq!(line1.samples, 1.0);
    }

    #[test]
    fn mean_mode_halves_two_identical_profiles() {
        let add = annotate(
            &[hello_profile(), hello_profile()],
            &caches(),
            &AnnotateOptions {
                mode: Mode::Add,
                ..Default::default()
            },
        )
        .unwrap();
        let mean = annotate(
            &[hello_profile(), hello_profile()],
            &caches(),
            &AnnotateOptions::default(),
        )
        .unwrap();
        let add_row = add.asm.iter().find(|r| r.pc == 0x1008).unwrap();
        let mean_row = mean.asm.iter().find(|r| r.pc == 0x1008).unwrap();
        assert!((add_row.time - 0.002).abs() < 1e-12);
        assert!((mean_row.time - 0.001).abs() < 1e-12);
        assert!((add.energy - 0.004).abs() < 1e-12);
        assert!((mean.energy - 0.002).abs() < 1e-12);
    }

    #[test]
    fn thresholds_prune_rows() {
        let result = annotate(&[hello_profile()], &caches(), &AnnotateOptions::default())
            .unwrap();
        let (asm, source) = apply_thresholds(
            &result,
            &Thresholds {
                function_samples: 1.0,
                ..Default::default()
            },
        );
        // All three rows belong to sampled functions.
        assert_eq!(asm.len(), 3);
        assert_eq!(source.len(), 3);

        let (asm, _) = apply_thresholds(
            &result,
            &Thresholds {
                instruction_samples: 1.0,
                ..Default::default()
            },
        );
        let pcs: Vec<u64> = asm.iter().map(|&i| result.asm[i].pc).collect();
        assert_eq!(pcs, vec![0x1000, 0x1008]);

        let (asm, source) = apply_thresholds(
            &result,
            &Thresholds {
                binary_time: 10.0,
                ..Default::default()
            },
        );
        assert!(asm.is_empty());
        assert!(source.is_empty());
    }
}
