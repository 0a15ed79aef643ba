/// The full profile: every decoded sample with its parsed per-thread PCs,
/// plus wall-clock and power/energy totals.
use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::mapper::Maps;
use crate::core::parser::SampleParser;
use crate::core::types::{MappedSample, PROFILE_VERSION};
use crate::decode::pperf::RawProfile;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadSample {
    pub tid: u32,
    /// CPU time consumed since this thread's previous sample, seconds.
    pub cpu_time: f64,
    pub sample: MappedSample,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSample {
    pub power: f64,
    /// Wall clock relative to the first sample, seconds; monotonic
    /// non-decreasing.
    pub wall_time: f64,
    pub threads: Vec<ThreadSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullProfile {
    pub version: String,
    pub name: String,
    pub target: String,
    pub samples: u64,
    pub sampling_time: f64,
    pub latency_time: f64,
    pub volts: f64,
    pub cpus: u32,
    pub energy: f64,
    pub power: f64,
    pub toolchain: String,
    pub maps: Maps,
    /// binary name -> cache file name, for later annotation.
    pub cache_map: BTreeMap<String, String>,
    pub profile: Vec<ProfileSample>,
}

impl storage::Artifact for FullProfile {
    const VERSION: &'static str = PROFILE_VERSION;
    const KIND: &'static str = "profile";
}

impl FullProfile {
    pub fn avg_latency(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.latency_time / self.samples as f64
        }
    }
}

/// Options for building a full profile from a decoded sample stream.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Profile display name; defaults to the target binary.
    pub name: Option<String>,
    /// Multiplied into every PMU value to obtain watts.
    pub volts: f64,
    /// Number of active CPU cores during profiling.
    pub cpus: u32,
    pub toolchain: String,
}

/// Walk the decoded samples once: attach parsed PCs, convert cumulative
/// thread CPU times to deltas, and accumulate the energy total.
pub fn build(
    raw: &RawProfile,
    parser: &mut SampleParser,
    config: &BuildConfig,
) -> Result<FullProfile> {
    let target = parser.target().unwrap_or_default().to_string();
    let name = config.name.clone().unwrap_or_else(|| target.clone());

    let mut profile = Vec::with_capacity(raw.samples.len());
    let mut prev_cpu_times: HashMap<u32, f64> = HashMap::new();
    let start_wall = raw.samples.first().map(|s| s.wall_time).unwrap_or(0.0);
    let mut prev_wall = 0.0;
    let mut energy = 0.0;

    for raw_sample in &raw.samples {
        let wall_time = raw_sample.wall_time - start_wall;
        let power = raw_sample.pmu * config.volts;
        energy += power * (wall_time - prev_wall);
        prev_wall = wall_time;

        let mut threads = Vec::with_capacity(raw_sample.threads.len());
        for thread in &raw_sample.threads {
            let prev = *prev_cpu_times.entry(thread.tid).or_insert(thread.cpu_time);
            prev_cpu_times.insert(thread.tid, thread.cpu_time);
            threads.push(ThreadSample {
                tid: thread.tid,
                cpu_time: thread.cpu_time - prev,
                sample: parser.parse(thread.pc)?,
            });
        }
        profile.push(ProfileSample {
            power,
            wall_time,
            threads,
        });
    }

    let sampling_time = profile.last().map(|s| s.wall_time).unwrap_or(0.0);
    let samples = profile.len() as u64;

    Ok(FullProfile {
        version: PROFILE_VERSION.to_string(),
        name,
        target,
        samples,
        sampling_time,
        latency_time: raw.latency_time,
        volts: config.volts,
        cpus: config.cpus,
        energy,
        power: if sampling_time > 0.0 {
            energy / sampling_time
        } else {
            0.0
        },
        toolchain: config.toolchain.clone(),
        maps: parser.maps().clone(),
        cache_map: parser.cache_map().clone(),
        profile,
    })
}
