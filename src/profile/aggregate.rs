/// Folds full profiles into keyed aggregates with cpu-share attribution and
/// latency compensation, composes multiple runs (add or mean), and filters
/// the result for rendering.
use std::collections::HashMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::core::formatter::SampleFormatter;
use crate::core::mapper::{ListMapper, Maps};
use crate::core::types::{MappedSample, Sample, SampleField, AGG_PROFILE_VERSION, LABEL_UNKNOWN};
use crate::profile::full::FullProfile;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub key: String,
    pub time: f64,
    pub power: f64,
    pub energy: f64,
    pub samples: f64,
    pub execs: f64,
    pub label: String,
    /// A representative mapped sample for the key, interned in the
    /// aggregate's own maps.
    pub sample: MappedSample,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateProfile {
    pub version: String,
    pub name: String,
    pub target: String,
    pub samples: f64,
    pub sampling_time: f64,
    pub latency_time: f64,
    pub volts: f64,
    pub energy: f64,
    pub power: f64,
    /// Number of runs folded into this aggregate.
    pub averaged: u32,
    pub toolchain: String,
    pub maps: Maps,
    /// Entries in first-seen order.
    pub profile: Vec<AggregateEntry>,
}

impl storage::Artifact for AggregateProfile {
    const VERSION: &'static str = AGG_PROFILE_VERSION;
    const KIND: &'static str = "aggregated profile";
}

impl AggregateProfile {
    pub fn total_time(&self) -> f64 {
        self.profile.iter().map(|e| e.time).sum()
    }

    pub fn total_energy(&self) -> f64 {
        self.profile.iter().map(|e| e.energy).sum()
    }

    pub fn entry(&self, key: &str) -> Option<&AggregateEntry> {
        self.profile.iter().find(|e| e.key == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Add,
    Mean,
}

#[derive(Debug, Clone)]
pub struct AggregateOptions {
    pub mode: Mode,
    /// Key fields for samples of the target binary.
    pub keys: Vec<SampleField>,
    pub delimiter: String,
    /// Key fields for every other ("external") sample.
    pub external_keys: Vec<SampleField>,
    pub external_delimiter: String,
    pub label_none: String,
    /// Subtract the mean sampling latency from every thread time.
    pub account_latency: bool,
    /// Attribute sample wall time instead of thread CPU time.
    pub use_wall_time: bool,
}

impl Default for AggregateOptions {
    fn default() -> AggregateOptions {
        AggregateOptions {
            mode: Mode::Mean,
            keys: vec![SampleField::Binary, SampleField::Function],
            delimiter: ":".to_string(),
            external_keys: vec![SampleField::Binary, SampleField::Function],
            external_delimiter: ":".to_string(),
            label_none: LABEL_UNKNOWN.to_string(),
            account_latency: false,
            use_wall_time: false,
        }
    }
}

/// One aggregation input: a freshly built full profile or a previously
/// aggregated one (so aggregates compose).
pub enum Input {
    Full(Box<FullProfile>),
    Aggregated(Box<AggregateProfile>),
}

impl Input {
    fn averaged(&self) -> u32 {
        match self {
            Input::Full(_) => 1,
            Input::Aggregated(p) => p.averaged,
        }
    }

    fn summary(&self) -> (f64, f64, f64, f64, &str, &str, &str) {
        match self {
            Input::Full(p) => (
                p.samples as f64,
                p.sampling_time,
                p.latency_time,
                p.volts,
                &p.name,
                &p.target,
                &p.toolchain,
            ),
            Input::Aggregated(p) => (
                p.samples,
                p.sampling_time,
                p.latency_time,
                p.volts,
                &p.name,
                &p.target,
                &p.toolchain,
            ),
        }
    }
}

struct Bucket {
    key: String,
    time: f64,
    energy: f64,
    samples: f64,
    execs: f64,
    label: String,
    sample: Sample,
}

/// Fold `inputs` into one aggregate. Mode `add` accumulates; mode `mean`
/// weights each input by its run count over the total so that re-aggregating
/// pre-aggregated profiles composes.
pub fn aggregate(inputs: &[Input], options: &AggregateOptions) -> Result<AggregateProfile> {
    if inputs.is_empty() {
        bail!("no profiles to aggregate");
    }
    let total_runs: u32 = inputs.iter().map(Input::averaged).sum();

    let mut entries: Vec<Bucket> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut name = String::new();
    let mut target = String::new();
    let mut toolchain = String::new();
    let mut volts = 0.0;
    let mut samples = 0.0;
    let mut sampling_time = 0.0;
    let mut latency_time = 0.0;

    for (i, input) in inputs.iter().enumerate() {
        let weight = match options.mode {
            Mode::Add => 1.0,
            Mode::Mean => input.averaged() as f64 / total_runs as f64,
        };
        let (in_samples, in_sampling, in_latency, in_volts, in_name, in_target, in_toolchain) =
            input.summary();
        if i == 0 {
            name = in_name.to_string();
            target = in_target.to_string();
            volts = in_volts;
            toolchain = in_toolchain.to_string();
        } else {
            if in_volts != volts {
                log::warn!(
                    "profile voltages don't match ({} vs {})",
                    in_volts,
                    volts
                );
            }
            if in_toolchain != toolchain {
                toolchain = "various".to_string();
            }
        }
        samples += in_samples * weight;
        sampling_time += in_sampling * weight;
        latency_time += in_latency * weight;

        match input {
            Input::Full(profile) => {
                fold_full(profile, options, weight, &mut entries, &mut index)?
            }
            Input::Aggregated(profile) => {
                fold_aggregated(profile, weight, &mut entries, &mut index)?
            }
        }
    }

    // Re-intern every representative sample into one coherent maps object.
    let mut mapper = ListMapper::new();
    let mut profile: Vec<AggregateEntry> = Vec::with_capacity(entries.len());
    let mut energy_total = 0.0;
    for bucket in entries {
        energy_total += bucket.energy;
        profile.push(AggregateEntry {
            key: bucket.key,
            time: bucket.time,
            power: if bucket.time != 0.0 {
                bucket.energy / bucket.time
            } else {
                0.0
            },
            energy: bucket.energy,
            samples: bucket.samples,
            execs: bucket.execs,
            label: bucket.label,
            sample: mapper.map(&bucket.sample),
        });
    }

    Ok(AggregateProfile {
        version: AGG_PROFILE_VERSION.to_string(),
        name,
        target,
        samples,
        sampling_time,
        latency_time,
        volts,
        energy: energy_total,
        power: if sampling_time > 0.0 {
            energy_total / sampling_time
        } else {
            0.0
        },
        averaged: total_runs,
        toolchain,
        maps: mapper.into_maps(),
        profile,
    })
}

fn fold_full(
    profile: &FullProfile,
    options: &AggregateOptions,
    weight: f64,
    entries: &mut Vec<Bucket>,
    index: &mut HashMap<String, usize>,
) -> Result<()> {
    let formatter = SampleFormatter::new(profile.maps.clone());
    let avg_latency = profile.avg_latency();

    // The per-profile sub-aggregate, folded into the global buckets with
    // `weight` afterwards.
    let mut sub: Vec<Bucket> = Vec::new();
    let mut sub_index: HashMap<String, usize> = HashMap::new();
    let mut thread_locations: HashMap<u32, usize> = HashMap::new();

    let mut prev_wall: Option<f64> = None;
    for sample in &profile.profile {
        let active_cores = (sample.threads.len() as u32).min(profile.cpus).max(1);
        let sample_wall = sample.wall_time - prev_wall.unwrap_or(sample.wall_time);
        prev_wall = Some(sample.wall_time);

        for thread in &sample.threads {
            let mut use_time = if options.use_wall_time {
                sample_wall
            } else {
                thread.cpu_time
            };
            if options.account_latency {
                use_time = (use_time - avg_latency).max(0.0);
            }
            let cpu_share = if sample_wall != 0.0 {
                use_time / (sample_wall * active_cores as f64)
            } else {
                0.0
            };

            let resolved = formatter.remap(&thread.sample)?;
            let external = resolved.binary.as_deref() != Some(profile.target.as_str());
            let key = if external {
                crate::core::formatter::format_sample(
                    &resolved,
                    &options.external_keys,
                    &options.external_delimiter,
                    &options.label_none,
                )
            } else {
                crate::core::formatter::format_sample(
                    &resolved,
                    &options.keys,
                    &options.delimiter,
                    &options.label_none,
                )
            };

            let slot = match sub_index.get(&key) {
                Some(&slot) => slot,
                None => {
                    sub.push(Bucket {
                        key: key.clone(),
                        time: 0.0,
                        energy: 0.0,
                        samples: 0.0,
                        execs: 0.0,
                        label: key.clone(),
                        sample: resolved.clone(),
                    });
                    sub_index.insert(key.clone(), sub.len() - 1);
                    sub.len() - 1
                }
            };
            let bucket = &mut sub[slot];
            bucket.time += use_time;
            bucket.energy += sample.power * cpu_share * use_time;
            bucket.samples += 1.0;
            if thread_locations.get(&thread.tid) != Some(&slot) {
                bucket.execs += 1.0;
            }
            thread_locations.insert(thread.tid, slot);
        }
    }

    for bucket in sub {
        fold_bucket(entries, index, bucket, weight);
    }
    Ok(())
}

fn fold_aggregated(
    profile: &AggregateProfile,
    weight: f64,
    entries: &mut Vec<Bucket>,
    index: &mut HashMap<String, usize>,
) -> Result<()> {
    let formatter = SampleFormatter::new(profile.maps.clone());
    for entry in &profile.profile {
        let resolved = formatter.remap(&entry.sample)?;
        fold_bucket(
            entries,
            index,
            Bucket {
                key: entry.key.clone(),
                time: entry.time,
                energy: entry.energy,
                samples: entry.samples,
                execs: entry.execs,
                label: entry.label.clone(),
                sample: resolved,
            },
            weight,
        );
    }
    Ok(())
}

fn fold_bucket(
    entries: &mut Vec<Bucket>,
    index: &mut HashMap<String, usize>,
    bucket: Bucket,
    weight: f64,
) {
    match index.get(&bucket.key) {
        Some(&slot) => {
            let existing = &mut entries[slot];
            existing.time += bucket.time * weight;
            existing.energy += bucket.energy * weight;
            existing.samples += bucket.samples * weight;
            existing.execs += bucket.execs * weight;
        }
        None => {
            index.insert(bucket.key.clone(), entries.len());
            entries.push(Bucket {
                time: bucket.time * weight,
                energy: bucket.energy * weight,
                samples: bucket.samples * weight,
                execs: bucket.execs * weight,
                ..bucket
            });
        }
    }
}

/// Post-aggregation entry selection, applied in order: exclusions,
/// contribution thresholds, top-N, cumulative limits. Returns the retained
/// indices in their original iteration order.
#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub exclude_binaries: Vec<String>,
    pub exclude_files: Vec<String>,
    pub exclude_functions: Vec<String>,
    pub exclude_external: bool,
    /// Keep entries with at least this share of total time (0 disables).
    pub time_threshold: f64,
    /// Keep entries with at least this share of total energy (0 disables).
    pub energy_threshold: f64,
    pub top_time: Option<usize>,
    pub top_energy: Option<usize>,
    /// Cumulative top share by time (0 disables).
    pub limit_time: f64,
    /// Cumulative top share by energy (0 disables).
    pub limit_energy: f64,
}

pub fn apply_filters(
    profile: &AggregateProfile,
    options: &FilterOptions,
) -> Result<Vec<usize>> {
    let formatter = SampleFormatter::new(profile.maps.clone());
    let total_time = profile.total_time();
    let total_energy = profile.total_energy();

    let mut retained: Vec<usize> = Vec::new();
    for (i, entry) in profile.profile.iter().enumerate() {
        let sample = formatter.remap(&entry.sample)?;
        if let Some(binary) = &sample.binary {
            if options.exclude_binaries.iter().any(|b| b == binary) {
                continue;
            }
            if options.exclude_external && binary != &profile.target {
                continue;
            }
        } else if options.exclude_external {
            continue;
        }
        if let Some(file) = &sample.file {
            let basename = file.rsplit('/').next().unwrap_or(file);
            if options
                .exclude_files
                .iter()
                .any(|f| f == file || f == basename)
            {
                continue;
            }
        }
        if let Some(function) = &sample.function {
            if options.exclude_functions.iter().any(|f| f == function) {
                continue;
            }
        }
        if options.time_threshold > 0.0
            && total_time > 0.0
            && entry.time / total_time < options.time_threshold
        {
            continue;
        }
        if options.energy_threshold > 0.0
            && total_energy > 0.0
            && entry.energy / total_energy < options.energy_threshold
        {
            continue;
        }
        retained.push(i);
    }

    if let Some(n) = options.top_time {
        retained = keep_top(profile, retained, n, |e| e.time);
    }
    if let Some(n) = options.top_energy {
        retained = keep_top(profile, retained, n, |e| e.energy);
    }
    if options.limit_time > 0.0 {
        retained = keep_cumulative(profile, retained, options.limit_time, |e| e.time);
    }
    if options.limit_energy > 0.0 {
        retained = keep_cumulative(profile, retained, options.limit_energy, |e| e.energy);
    }

    if retained.is_empty() {
        bail!("Nothing found to compare, limit too strict?");
    }
    Ok(retained)
}

fn keep_top<F: Fn(&AggregateEntry) -> f64>(
    profile: &AggregateProfile,
    retained: Vec<usize>,
    n: usize,
    metric: F,
) -> Vec<usize> {
    let mut ranked = retained.clone();
    // Stable sort keeps original iteration order among equal values.
    ranked.sort_by(|&a, &b| {
        metric(&profile.profile[b])
            .partial_cmp(&metric(&profile.profile[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let keep: std::collections::HashSet<usize> = ranked.into_iter().take(n).collect();
    retained.into_iter().filter(|i| keep.contains(i)).collect()
}

fn keep_cumulative<F: Fn(&AggregateEntry) -> f64>(
    profile: &AggregateProfile,
    retained: Vec<usize>,
    limit: f64,
    metric: F,
) -> Vec<usize> {
    let total: f64 = retained.iter().map(|&i| metric(&profile.profile[i])).sum();
    let mut ranked = retained.clone();
    ranked.sort_by(|&a, &b| {
        metric(&profile.profile[b])
            .partial_cmp(&metric(&profile.profile[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep = std::collections::HashSet::new();
    let mut accumulated = 0.0;
    for i in ranked {
        keep.insert(i);
        accumulated += metric(&profile.profile[i]);
        if accumulated >= limit * total {
            break;
        }
    }
    retained.into_iter().filter(|i| keep.contains(i)).collect()
}
