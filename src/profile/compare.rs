/// Aligns aggregated profiles by key against a baseline and computes
/// pointwise errors and optional reductions.
use std::str::FromStr;

use anyhow::Result;

use crate::profile::aggregate::{apply_filters, AggregateEntry, AggregateProfile, FilterOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Time,
    Power,
    Energy,
    Samples,
    Execs,
}

impl Metric {
    pub fn of(self, entry: &AggregateEntry) -> f64 {
        match self {
            Metric::Time => entry.time,
            Metric::Power => entry.power,
            Metric::Energy => entry.energy,
            Metric::Samples => entry.samples,
            Metric::Execs => entry.execs,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Metric::Time => "time",
            Metric::Power => "power",
            Metric::Energy => "energy",
            Metric::Samples => "samples",
            Metric::Execs => "execs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorFunction {
    Error,
    Absolute,
    #[default]
    Relative,
    AbsoluteRelative,
    Weighted,
    AbsoluteWeighted,
    WeightedRelative,
    AbsoluteWeightedRelative,
}

impl ErrorFunction {
    /// Pointwise error of `value` against `baseline`; `weight` is the
    /// baseline's share of the metric total.
    pub fn apply(self, baseline: f64, value: f64, weight: f64) -> f64 {
        let error = value - baseline;
        let relative = if baseline != 0.0 { error / baseline } else { 0.0 };
        match self {
            ErrorFunction::Error => error,
            ErrorFunction::Absolute => error.abs(),
            ErrorFunction::Relative => relative,
            ErrorFunction::AbsoluteRelative => relative.abs(),
            ErrorFunction::Weighted => error * weight,
            ErrorFunction::AbsoluteWeighted => (error * weight).abs(),
            ErrorFunction::WeightedRelative => relative * weight,
            ErrorFunction::AbsoluteWeightedRelative => (relative * weight).abs(),
        }
    }
}

impl FromStr for ErrorFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(ErrorFunction::Error),
            "absolute_error" => Ok(ErrorFunction::Absolute),
            "relative_error" => Ok(ErrorFunction::Relative),
            "absolute_relative_error" => Ok(ErrorFunction::AbsoluteRelative),
            "weighted_error" => Ok(ErrorFunction::Weighted),
            "absolute_weighted_error" => Ok(ErrorFunction::AbsoluteWeighted),
            "weighted_relative_error" => Ok(ErrorFunction::WeightedRelative),
            "absolute_weighted_relative_error" => Ok(ErrorFunction::AbsoluteWeightedRelative),
            _ => Err(format!("unknown error function '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Sum,
    Min,
    Max,
    Mean,
    WeightedMean,
    Rmse,
    WeightedRmse,
}

impl FromStr for Reduction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Reduction::Sum),
            "min" => Ok(Reduction::Min),
            "max" => Ok(Reduction::Max),
            "mean" => Ok(Reduction::Mean),
            "weighted_mean" => Ok(Reduction::WeightedMean),
            "rmse" => Ok(Reduction::Rmse),
            "wrmse" => Ok(Reduction::WeightedRmse),
            _ => Err(format!("unknown reduction '{}'", s)),
        }
    }
}

impl Reduction {
    /// Whether the pointwise error function feeds this reduction. The
    /// RMSE variants work on the raw values instead.
    pub fn uses_errors(self) -> bool {
        !matches!(self, Reduction::Rmse | Reduction::WeightedRmse)
    }

    fn apply(self, baselines: &[f64], values: &[f64], errors: &[f64], weights: &[f64]) -> f64 {
        match self {
            Reduction::Sum => errors.iter().sum(),
            Reduction::Min => errors.iter().copied().fold(f64::INFINITY, f64::min),
            Reduction::Max => errors.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reduction::Mean => errors.iter().sum::<f64>() / errors.len() as f64,
            Reduction::WeightedMean => {
                let weight_total: f64 = weights.iter().sum();
                if weight_total == 0.0 {
                    0.0
                } else {
                    errors
                        .iter()
                        .zip(weights)
                        .map(|(e, w)| e * w)
                        .sum::<f64>()
                        / weight_total
                }
            }
            Reduction::Rmse => {
                let sum: f64 = baselines
                    .iter()
                    .zip(values)
                    .map(|(b, v)| (v - b) * (v - b))
                    .sum();
                (sum / values.len() as f64).sqrt()
            }
            Reduction::WeightedRmse => baselines
                .iter()
                .zip(values)
                .zip(weights)
                .map(|((b, v), w)| (v - b) * (v - b) * w)
                .sum::<f64>()
                .sqrt(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompareOptions {
    pub metric: Metric,
    pub error: ErrorFunction,
    pub reduction: Option<Reduction>,
    pub filter: FilterOptions,
}

impl Default for CompareOptions {
    fn default() -> CompareOptions {
        CompareOptions {
            metric: Metric::Energy,
            error: ErrorFunction::default(),
            reduction: None,
            filter: FilterOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateReport {
    pub name: String,
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
    pub reduced: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub metric: Metric,
    /// Included baseline keys, sorted descending by the chosen metric;
    /// shared by every candidate column.
    pub keys: Vec<String>,
    pub labels: Vec<String>,
    pub baseline: Vec<f64>,
    /// Baseline share of the metric total, per key.
    pub weights: Vec<f64>,
    pub candidates: Vec<CandidateReport>,
}

/// Compare one or more candidate aggregates against a baseline.
pub fn compare(
    baseline: &AggregateProfile,
    candidates: &[(String, AggregateProfile)],
    options: &CompareOptions,
) -> Result<Comparison> {
    let mut retained = apply_filters(baseline, &options.filter)?;
    retained.sort_by(|&a, &b| {
        options
            .metric
            .of(&baseline.profile[b])
            .partial_cmp(&options.metric.of(&baseline.profile[a]))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let metric_total: f64 = baseline
        .profile
        .iter()
        .map(|e| options.metric.of(e))
        .sum();

    let mut keys = Vec::with_capacity(retained.len());
    let mut labels = Vec::with_capacity(retained.len());
    let mut baseline_values = Vec::with_capacity(retained.len());
    let mut weights = Vec::with_capacity(retained.len());
    for &i in &retained {
        let entry = &baseline.profile[i];
        keys.push(entry.key.clone());
        labels.push(entry.label.clone());
        baseline_values.push(options.metric.of(entry));
        weights.push(if metric_total != 0.0 {
            options.metric.of(entry) / metric_total
        } else {
            0.0
        });
    }

    let mut reports = Vec::with_capacity(candidates.len());
    for (name, candidate) in candidates {
        let values: Vec<f64> = keys
            .iter()
            .map(|key| candidate.entry(key).map(|e| options.metric.of(e)).unwrap_or(0.0))
            .collect();
        let errors: Vec<f64> = baseline_values
            .iter()
            .zip(&values)
            .zip(&weights)
            .map(|((&b, &v), &w)| options.error.apply(b, v, w))
            .collect();
        let reduced = options
            .reduction
            .map(|r| r.apply(&baseline_values, &values, &errors, &weights));
        reports.push(CandidateReport {
            name: name.clone(),
            values,
            errors,
            reduced,
        });
    }

    Ok(Comparison {
        metric: options.metric,
        keys,
        labels,
        baseline: baseline_values,
        weights,
        candidates: reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mapper::ListMapper;
    use crate::core::types::{Meta, Sample, AGG_PROFILE_VERSION};

    fn profile(entries: &[(&str, f64)]) -> AggregateProfile {
        let mut mapper = ListMapper::new();
        let rows = entries
            .iter()
            .map(|&(key, energy)| AggregateEntry {
                key: key.to_string(),
                time: energy / 2.0,
                power: 2.0,
                energy,
                samples: 1.0,
                execs: 1.0,
                label: key.to_string(),
                sample: mapper.map(&Sample {
                    pc: 0x1000,
                    binary: Some("hello".to_string()),
                    file: None,
                    function: Some(key.to_string()),
                    basicblock: None,
                    line: None,
                    instruction: None,
                    opcode: None,
                    meta: Meta::empty(),
                }),
            })
            .collect();
        AggregateProfile {
            version: AGG_PROFILE_VERSION.to_string(),
            name: "hello".to_string(),
            target: "hello".to_string(),
            samples: entries.len() as f64,
            sampling_time: 1.0,
            latency_time: 0.0,
            volts: 1.0,
            energy: entries.iter().map(|e| e.1).sum(),
            power: 1.0,
            averaged: 1,
            toolchain: "test".to_string(),
            maps: mapper.into_maps(),
            profile: rows,
        }
    }

    #[test]
    fn keys_sort_by_metric_descending() {
        let baseline = profile(&[("low", 1.0), ("high", 8.0), ("mid", 4.0)]);
        let comparison = compare(&baseline, &[], &CompareOptions::default()).unwrap();
        assert_eq!(comparison.keys, vec!["high", "mid", "low"]);
        assert_eq!(comparison.baseline, vec![8.0, 4.0, 1.0]);
    }

    #[test]
    fn missing_candidate_keys_compare_as_zero() {
        let baseline = profile(&[("a", 4.0), ("b", 4.0)]);
        let candidate = profile(&[("a", 6.0)]);
        let comparison = compare(
            &baseline,
            &[("run".to_string(), candidate)],
            &CompareOptions {
                error: ErrorFunction::Error,
                ..Default::default()
            },
        )
        .unwrap();
        let report = &comparison.candidates[0];
        assert_eq!(report.values, vec![6.0, 0.0]);
        assert_eq!(report.errors, vec![2.0, -4.0]);
    }

    #[test]
    fn error_functions() {
        let check = |f: ErrorFunction, expected: f64| {
            assert!((f.apply(4.0, 6.0, 0.5) - expected).abs() < 1e-12, "{:?}", f);
        };
        check(ErrorFunction::Error, 2.0);
        check(ErrorFunction::Absolute, 2.0);
        check(ErrorFunction::Relative, 0.5);
        check(ErrorFunction::AbsoluteRelative, 0.5);
        check(ErrorFunction::Weighted, 1.0);
        check(ErrorFunction::AbsoluteWeighted, 1.0);
        check(ErrorFunction::WeightedRelative, 0.25);
        check(ErrorFunction::AbsoluteWeightedRelative, 0.25);
        // A zero baseline defines the relative error as zero.
        assert_eq!(ErrorFunction::Relative.apply(0.0, 3.0, 0.5), 0.0);
    }

    #[test]
    fn reductions() {
        let baseline = profile(&[("a", 4.0), ("b", 4.0)]);
        let candidate = profile(&[("a", 6.0), ("b", 2.0)]);
        let run = |reduction: Reduction| {
            compare(
                &baseline,
                &[("run".to_string(), candidate.clone())],
                &CompareOptions {
                    error: ErrorFunction::Error,
                    reduction: Some(reduction),
                    ..Default::default()
                },
            )
            .unwrap()
            .candidates[0]
                .reduced
                .unwrap()
        };
        assert!((run(Reduction::Sum) - 0.0).abs() < 1e-12);
        assert!((run(Reduction::Min) - (-2.0)).abs() < 1e-12);
        assert!((run(Reduction::Max) - 2.0).abs() < 1e-12);
        assert!((run(Reduction::Mean) - 0.0).abs() < 1e-12);
        // Both keys weigh 0.5: rmse over raw values.
        assert!((run(Reduction::Rmse) - 2.0).abs() < 1e-12);
        assert!((run(Reduction::WeightedRmse) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn weighted_mean_uses_baseline_shares() {
        let baseline = profile(&[("a", 6.0), ("b", 2.0)]);
        let candidate = profile(&[("a", 7.0), ("b", 2.0)]);
        let comparison = compare(
            &baseline,
            &[("run".to_string(), candidate)],
            &CompareOptions {
                error: ErrorFunction::Error,
                reduction: Some(Reduction::WeightedMean),
                ..Default::default()
            },
        )
        .unwrap();
        // error a = 1 with share 0.75, error b = 0 with share 0.25.
        assert!((comparison.candidates[0].reduced.unwrap() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn inclusion_rules_shape_the_key_set() {
        let baseline = profile(&[("a", 8.0), ("b", 4.0), ("c", 1.0)]);
        let comparison = compare(
            &baseline,
            &[],
            &CompareOptions {
                filter: FilterOptions {
                    top_energy: Some(2),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(comparison.keys, vec!["a", "b"]);
    }
}
