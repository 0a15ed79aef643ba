use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use pperf::core::cache::{BuildOptions, CacheData, ElfCache};
use pperf::core::env::Environment;
use pperf::core::formatter::SampleFormatter;
use pperf::core::parser::SampleParser;
use pperf::core::toolchain::Toolchain;
use pperf::core::types::{
    parse_range, SampleField, AGG_PROFILE_VERSION, ANN_PROFILE_VERSION, LABEL_UNKNOWN,
    PROFILE_VERSION,
};
use pperf::decode::pperf::{decode, Endianness, PmuKind};
use pperf::profile::aggregate::{
    aggregate, apply_filters, AggregateOptions, AggregateProfile, FilterOptions, Input, Mode,
};
use pperf::profile::annotate::{annotate, apply_thresholds, AnnotatedProfile, AnnotateOptions, Thresholds};
use pperf::profile::compare::{compare, CompareOptions, ErrorFunction, Metric, Reduction};
use pperf::profile::full::{build, BuildConfig, FullProfile};
use pperf::storage;
use pperf::ui::table;

#[derive(Parser, Debug)]
#[command(name = "pperf", version, about = "Offline power/energy profile post-processor")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the ELF cache for a binary
    Cache(CacheArgs),
    /// Turn a raw PPerf profile into a full profile
    Postprocess(PostprocessArgs),
    /// Fold full profiles into a keyed aggregate
    Aggregate(AggregateArgs),
    /// Correlate profiles onto assembly and source
    Annotate(AnnotateArgs),
    /// Compare aggregated profiles against a baseline
    Compare(CompareArgs),
    /// Print the summary fields of any profile artifact
    Info(InfoArgs),
    /// Print a full profile sample by sample
    Dump(DumpArgs),
}

#[derive(clap::Args, Debug)]
struct CacheArgs {
    /// ELF binary to cache
    elf: PathBuf,
    /// Display name (defaults to the binary's basename)
    #[arg(long)]
    name: Option<String>,
    /// Directory to search for source files (repeatable)
    #[arg(short = 's', long = "search-path")]
    search_paths: Vec<PathBuf>,
    /// CSV with dynamic branch targets
    #[arg(long)]
    dynmap: Option<PathBuf>,
    /// Skip reading source files into the cache
    #[arg(long)]
    no_source: bool,
    /// Skip basic block reconstruction
    #[arg(long)]
    no_basic_blocks: bool,
    /// Rebuild even if a valid cache exists
    #[arg(long)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct PostprocessArgs {
    /// Raw profile from the sampler
    profile: PathBuf,
    /// Output file for the full profile
    #[arg(short, long)]
    output: PathBuf,
    /// Profile name
    #[arg(short, long)]
    name: Option<String>,
    /// PMU voltage, required for current measurements
    #[arg(short, long)]
    volts: Option<f64>,
    /// Directory to search for profiled binaries (repeatable)
    #[arg(short = 's', long = "search-path")]
    search_paths: Vec<PathBuf>,
    /// Active cpu cores during profiling, e.g. 0-3
    #[arg(short, long, default_value = "0-3")]
    cpus: String,
    /// Kernel symbol table captured during profiling
    #[arg(long)]
    kallsyms: Option<PathBuf>,
    /// Force little endian decoding
    #[arg(short = 'l', long, conflicts_with = "big_endian")]
    little_endian: bool,
    /// Force big endian decoding
    #[arg(short = 'b', long)]
    big_endian: bool,
    /// Write the embedded vmmap to a file
    #[arg(long)]
    dump_vmmap: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct KeyArgs {
    /// Key fields for target samples, comma separated
    #[arg(short = 'a', long, value_delimiter = ',', default_value = "binary,function")]
    aggregate: Vec<String>,
    /// Delimiter between key fields
    #[arg(short, long, default_value = ":")]
    delimiter: String,
    /// Key fields for external samples (defaults to --aggregate)
    #[arg(long = "external-aggregate", value_delimiter = ',')]
    external_aggregate: Vec<String>,
    /// Delimiter for external keys (defaults to --delimiter)
    #[arg(long = "external-delimiter")]
    external_delimiter: Option<String>,
    /// Label for absent field values
    #[arg(long = "label-none", default_value = LABEL_UNKNOWN)]
    label_none: String,
}

#[derive(clap::Args, Debug, Default)]
struct FilterArgs {
    /// Exclude these binaries (repeatable)
    #[arg(long = "exclude-binary")]
    exclude_binaries: Vec<String>,
    /// Exclude these files (repeatable)
    #[arg(long = "exclude-file")]
    exclude_files: Vec<String>,
    /// Exclude these functions (repeatable)
    #[arg(long = "exclude-function")]
    exclude_functions: Vec<String>,
    /// Drop samples outside the target binary
    #[arg(long = "exclude-external")]
    exclude_external: bool,
    /// Keep keys with at least this share of total time (0.0 - 1.0)
    #[arg(long = "time-threshold", default_value_t = 0.0)]
    time_threshold: f64,
    /// Keep keys with at least this share of total energy (0.0 - 1.0)
    #[arg(long = "energy-threshold", default_value_t = 0.0)]
    energy_threshold: f64,
    /// Keep only the N keys with the most time
    #[arg(long = "top-time")]
    top_time: Option<usize>,
    /// Keep only the N keys with the most energy
    #[arg(long = "top-energy")]
    top_energy: Option<usize>,
    /// Keep the heaviest keys covering this share of total time
    #[arg(long = "limit-time", default_value_t = 0.0)]
    limit_time: f64,
    /// Keep the heaviest keys covering this share of total energy
    #[arg(long = "limit-energy", default_value_t = 0.0)]
    limit_energy: f64,
}

impl FilterArgs {
    fn to_options(&self) -> Result<FilterOptions> {
        for share in [
            self.time_threshold,
            self.energy_threshold,
            self.limit_time,
            self.limit_energy,
        ] {
            if !(0.0..=1.0).contains(&share) {
                bail!("share arguments must be within 0.0 - 1.0");
            }
        }
        Ok(FilterOptions {
            exclude_binaries: self.exclude_binaries.clone(),
            exclude_files: self.exclude_files.clone(),
            exclude_functions: self.exclude_functions.clone(),
            exclude_external: self.exclude_external,
            time_threshold: self.time_threshold,
            energy_threshold: self.energy_threshold,
            top_time: self.top_time,
            top_energy: self.top_energy,
            limit_time: self.limit_time,
            limit_energy: self.limit_energy,
        })
    }
}

#[derive(clap::Args, Debug)]
struct AggregateArgs {
    /// Full or aggregated profiles, folded in command-line order
    #[arg(required = true)]
    profiles: Vec<PathBuf>,
    /// Write the aggregated profile here
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Compose runs as their mean or their sum
    #[arg(long, default_value = "mean")]
    mode: String,
    #[command(flatten)]
    keys: KeyArgs,
    /// Subtract the mean sampling latency from thread times
    #[arg(long = "account-latency")]
    account_latency: bool,
    /// Attribute sample wall time instead of thread cpu time
    #[arg(long = "use-wall-time", conflicts_with = "use_cpu_time")]
    use_wall_time: bool,
    /// Attribute thread cpu time (default)
    #[arg(long = "use-cpu-time")]
    use_cpu_time: bool,
    #[command(flatten)]
    filter: FilterArgs,
    /// Write the table as CSV
    #[arg(short, long)]
    table: Option<PathBuf>,
    /// Do not print the table
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::Args, Debug)]
struct AnnotateArgs {
    /// Full profiles (or one annotated profile to re-render)
    #[arg(required = true)]
    profiles: Vec<PathBuf>,
    /// Write the annotated profile here
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Compose runs as their mean or their sum
    #[arg(long, default_value = "mean")]
    mode: String,
    /// What to render
    #[arg(long, default_value = "asm")]
    annotate: String,
    /// Subtract the mean sampling latency from thread times
    #[arg(long = "account-latency")]
    account_latency: bool,
    /// Attribute sample wall time instead of thread cpu time
    #[arg(long = "use-wall-time", conflicts_with = "use_cpu_time")]
    use_wall_time: bool,
    /// Attribute thread cpu time (default)
    #[arg(long = "use-cpu-time")]
    use_cpu_time: bool,
    #[arg(long = "binary-time-threshold", default_value_t = 0.0)]
    binary_time_threshold: f64,
    #[arg(long = "binary-energy-threshold", default_value_t = 0.0)]
    binary_energy_threshold: f64,
    #[arg(long = "binary-sample-threshold", default_value_t = 0.0)]
    binary_sample_threshold: f64,
    #[arg(long = "function-time-threshold", default_value_t = 0.0)]
    function_time_threshold: f64,
    #[arg(long = "function-energy-threshold", default_value_t = 0.0)]
    function_energy_threshold: f64,
    #[arg(long = "function-sample-threshold", default_value_t = 1.0)]
    function_sample_threshold: f64,
    #[arg(long = "basicblock-time-threshold", default_value_t = 0.0)]
    basicblock_time_threshold: f64,
    #[arg(long = "basicblock-energy-threshold", default_value_t = 0.0)]
    basicblock_energy_threshold: f64,
    #[arg(long = "basicblock-sample-threshold", default_value_t = 0.0)]
    basicblock_sample_threshold: f64,
    #[arg(long = "instruction-time-threshold", default_value_t = 0.0)]
    instruction_time_threshold: f64,
    #[arg(long = "instruction-energy-threshold", default_value_t = 0.0)]
    instruction_energy_threshold: f64,
    #[arg(long = "instruction-sample-threshold", default_value_t = 0.0)]
    instruction_sample_threshold: f64,
    /// Write the asm table as CSV
    #[arg(short, long)]
    table: Option<PathBuf>,
    /// Do not print the annotation
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::Args, Debug)]
struct CompareArgs {
    /// Baseline aggregated profile
    baseline: PathBuf,
    /// Aggregated profiles to compare against the baseline
    #[arg(required = true)]
    profiles: Vec<PathBuf>,
    /// Compare time values
    #[arg(long = "use-time")]
    use_time: bool,
    /// Compare energy values (default)
    #[arg(long = "use-energy")]
    use_energy: bool,
    /// Compare power values
    #[arg(long = "use-power")]
    use_power: bool,
    /// Compare sample counters
    #[arg(long = "use-samples")]
    use_samples: bool,
    /// Compare execution counters
    #[arg(long = "use-execs")]
    use_execs: bool,
    /// Pointwise error function
    #[arg(short, long, default_value = "relative_error")]
    error: String,
    /// Reduce the pointwise errors per candidate
    #[arg(short, long)]
    reduce: Option<String>,
    /// Names for the candidate profiles (repeatable)
    #[arg(short, long = "name")]
    names: Vec<String>,
    #[command(flatten)]
    filter: FilterArgs,
    /// Write the comparison as CSV
    #[arg(short, long)]
    table: Option<PathBuf>,
    /// Do not print the comparison
    #[arg(short, long)]
    quiet: bool,
}

#[derive(clap::Args, Debug)]
struct InfoArgs {
    /// Any profile artifact
    artifact: PathBuf,
}

#[derive(clap::Args, Debug)]
struct DumpArgs {
    /// Full profile to dump
    profile: PathBuf,
    #[command(flatten)]
    keys: KeyArgs,
}

fn main() {
    env_logger::init();
    if let Err(e) = do_main() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn do_main() -> Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();
    let args = Args::parse();
    let env = Environment::from_env()?;
    match args.command {
        Command::Cache(cache_args) => run_cache(&env, cache_args),
        Command::Postprocess(postprocess_args) => run_postprocess(&env, postprocess_args),
        Command::Aggregate(aggregate_args) => run_aggregate(aggregate_args),
        Command::Annotate(annotate_args) => run_annotate(&env, annotate_args),
        Command::Compare(compare_args) => run_compare(compare_args, &raw_args),
        Command::Info(info_args) => run_info(info_args),
        Command::Dump(dump_args) => run_dump(dump_args),
    }
}

fn run_cache(env: &Environment, args: CacheArgs) -> Result<()> {
    let options = BuildOptions {
        name: args.name,
        source_search_paths: args.search_paths,
        dynmap: args.dynmap,
        include_source: !args.no_source,
        basicblock_reconstruction: !args.no_basic_blocks,
    };
    let mut cache = ElfCache::new(env);
    let data = if args.force {
        cache.build(&args.elf, &options)?
    } else {
        cache.load_or_build(&args.elf, &options)?
    };
    println!(
        "{}: {} instructions, {} source files, arch {}",
        data.name,
        data.cache.len(),
        data.source.values().filter(|s| s.is_some()).count(),
        data.arch
    );
    Ok(())
}

fn run_postprocess(env: &Environment, args: PostprocessArgs) -> Result<()> {
    let endianness = if args.little_endian {
        Some(Endianness::Little)
    } else if args.big_endian {
        Some(Endianness::Big)
    } else {
        None
    };
    let file = File::open(&args.profile)
        .with_context(|| format!("could not open {}", args.profile.display()))?;
    let raw = decode(std::io::BufReader::new(file), endianness)?;

    let volts = match raw.pmu_kind {
        PmuKind::Custom | PmuKind::Voltage => {
            log::warn!(
                "profile contains {} data which is passed through",
                if raw.pmu_kind == PmuKind::Custom { "custom" } else { "voltage" }
            );
            if args.volts.is_some() {
                log::warn!("volts argument ignored");
            }
            1.0
        }
        PmuKind::Current => args
            .volts
            .ok_or_else(|| anyhow!("profile contains current pmu data, --volts is required"))?,
        PmuKind::Power => 1.0,
    };

    if let Some(path) = &args.dump_vmmap {
        std::fs::write(path, raw.vmmap_text())?;
    }

    let cpus = parse_range(&args.cpus).map_err(|e| anyhow!(e))?;
    let toolchain = Toolchain::new(&env.cross_compile);

    let mut parser = SampleParser::new(env);
    for path in &args.search_paths {
        parser.add_search_path(path)?;
    }
    parser.add_search_path(&std::env::current_dir()?)?;
    parser.load_vmmap(&raw.vmmap_text())?;
    if let Some(kallsyms) = &args.kallsyms {
        parser.load_kallsyms_file(kallsyms)?;
    }

    let config = BuildConfig {
        name: args.name,
        volts,
        cpus: cpus.len() as u32,
        toolchain: toolchain.id()?,
    };
    let profile = build(&raw, &mut parser, &config)?;
    if parser.unknown_pcs() > 0 {
        log::warn!("{} samples hit unknown addresses", parser.unknown_pcs());
    }
    storage::save(&args.output, &profile)?;
    println!("Profile saved to {}", args.output.display());
    Ok(())
}

fn parse_fields(names: &[String]) -> Result<Vec<SampleField>> {
    names
        .iter()
        .map(|name| name.parse::<SampleField>().map_err(|e| anyhow!(e)))
        .collect()
}

fn parse_mode(mode: &str) -> Result<Mode> {
    match mode {
        "mean" => Ok(Mode::Mean),
        "add" => Ok(Mode::Add),
        _ => bail!("unknown mode '{}', expected 'mean' or 'add'", mode),
    }
}

fn load_aggregate_input(path: &Path) -> Result<Input> {
    let version = storage::peek_version(path)?;
    if version == PROFILE_VERSION {
        Ok(Input::Full(Box::new(storage::load::<FullProfile>(path)?)))
    } else if version == AGG_PROFILE_VERSION {
        Ok(Input::Aggregated(Box::new(storage::load::<AggregateProfile>(path)?)))
    } else {
        // Surface the usual version diagnostics for the closest artifact.
        storage::load::<FullProfile>(path).map(|p| Input::Full(Box::new(p)))
    }
}

fn run_aggregate(args: AggregateArgs) -> Result<()> {
    let keys = parse_fields(&args.keys.aggregate)?;
    let external_keys = if args.keys.external_aggregate.is_empty() {
        keys.clone()
    } else {
        parse_fields(&args.keys.external_aggregate)?
    };
    let options = AggregateOptions {
        mode: parse_mode(&args.mode)?,
        keys,
        delimiter: args.keys.delimiter.clone(),
        external_keys,
        external_delimiter: args
            .keys
            .external_delimiter
            .clone()
            .unwrap_or_else(|| args.keys.delimiter.clone()),
        label_none: args.keys.label_none.clone(),
        account_latency: args.account_latency,
        use_wall_time: args.use_wall_time,
    };

    let inputs = args
        .profiles
        .iter()
        .map(|path| load_aggregate_input(path))
        .collect::<Result<Vec<_>>>()?;
    let profile = aggregate(&inputs, &options)?;
    let retained = apply_filters(&profile, &args.filter.to_options()?)?;

    if let Some(path) = &args.table {
        let mut file = File::create(path)?;
        table::write_aggregate_csv(&mut file, &profile, &retained)?;
        println!("CSV saved to {}", path.display());
    }
    if let Some(path) = &args.output {
        storage::save(path, &profile)?;
        println!("Aggregated profile saved to {}", path.display());
    }
    if !args.quiet {
        table::write_aggregate(&mut std::io::stdout(), &profile, &retained)?;
    }
    Ok(())
}

fn run_annotate(env: &Environment, args: AnnotateArgs) -> Result<()> {
    let thresholds = Thresholds {
        binary_time: args.binary_time_threshold,
        binary_energy: args.binary_energy_threshold,
        binary_samples: args.binary_sample_threshold,
        function_time: args.function_time_threshold,
        function_energy: args.function_energy_threshold,
        function_samples: args.function_sample_threshold,
        basicblock_time: args.basicblock_time_threshold,
        basicblock_energy: args.basicblock_energy_threshold,
        basicblock_samples: args.basicblock_sample_threshold,
        instruction_time: args.instruction_time_threshold,
        instruction_energy: args.instruction_energy_threshold,
        instruction_samples: args.instruction_sample_threshold,
    };

    // A single already-annotated profile is just re-rendered.
    let annotated = if args.profiles.len() == 1
        && storage::peek_version(&args.profiles[0])? == ANN_PROFILE_VERSION
    {
        storage::load::<AnnotatedProfile>(&args.profiles[0])?
    } else {
        let mut profiles = Vec::with_capacity(args.profiles.len());
        let mut cache_map: BTreeMap<String, String> = BTreeMap::new();
        for path in &args.profiles {
            let profile: FullProfile = storage::load(path)?;
            for (binary, cache_file) in &profile.cache_map {
                cache_map
                    .entry(binary.clone())
                    .or_insert_with(|| cache_file.clone());
            }
            profiles.push(profile);
        }
        let mut caches: BTreeMap<String, CacheData> = BTreeMap::new();
        for (binary, cache_file) in &cache_map {
            caches.insert(binary.clone(), ElfCache::raw_cache(env, cache_file)?);
        }
        let options = AnnotateOptions {
            mode: parse_mode(&args.mode)?,
            account_latency: args.account_latency,
            use_wall_time: args.use_wall_time,
        };
        annotate(&profiles, &caches, &options)?
    };

    let (asm_rows, source_rows) = apply_thresholds(&annotated, &thresholds);

    if let Some(path) = &args.output {
        storage::save(path, &annotated)?;
        println!("Annotated profile saved to {}", path.display());
    }
    if let Some(path) = &args.table {
        let mut file = File::create(path)?;
        table::write_annotated_csv(&mut file, &annotated, &asm_rows)?;
        println!("CSV saved to {}", path.display());
    }
    if !args.quiet {
        let mut stdout = std::io::stdout();
        match args.annotate.as_str() {
            "asm" => table::write_annotated_asm(&mut stdout, &annotated, &asm_rows)?,
            "source" => table::write_annotated_source(&mut stdout, &annotated, &source_rows)?,
            other => bail!("unknown annotation mode '{}'", other),
        }
    }
    Ok(())
}

/// The last explicitly selected metric wins; energy is the default.
fn select_metric(raw_args: &[String]) -> Metric {
    let mut metric = Metric::Energy;
    for arg in raw_args {
        match arg.as_str() {
            "--use-time" => metric = Metric::Time,
            "--use-energy" => metric = Metric::Energy,
            "--use-power" => metric = Metric::Power,
            "--use-samples" => metric = Metric::Samples,
            "--use-execs" => metric = Metric::Execs,
            _ => {}
        }
    }
    metric
}

fn run_compare(args: CompareArgs, raw_args: &[String]) -> Result<()> {
    let error: ErrorFunction = args.error.parse().map_err(|e: String| anyhow!(e))?;
    let reduction = args
        .reduce
        .as_deref()
        .map(|r| r.parse::<Reduction>().map_err(|e| anyhow!(e)))
        .transpose()?;
    if let Some(reduction) = reduction {
        if !reduction.uses_errors() && args.error != "relative_error" {
            log::warn!("the error function does not influence this reduction");
        }
    }
    let options = CompareOptions {
        metric: select_metric(raw_args),
        error,
        reduction,
        filter: args.filter.to_options()?,
    };

    let baseline: AggregateProfile = storage::load(&args.baseline)?;
    let mut candidates = Vec::with_capacity(args.profiles.len());
    for (i, path) in args.profiles.iter().enumerate() {
        let profile: AggregateProfile = storage::load(path)?;
        let name = args
            .names
            .get(i)
            .cloned()
            .unwrap_or_else(|| default_candidate_name(&profile));
        candidates.push((name, profile));
    }

    let comparison = compare(&baseline, &candidates, &options)?;

    if let Some(path) = &args.table {
        let mut file = File::create(path)?;
        table::write_comparison_csv(&mut file, &comparison)?;
        println!("CSV saved to {}", path.display());
    }
    if !args.quiet {
        println!("metric: {}", comparison.metric.label());
        table::write_comparison(&mut std::io::stdout(), &comparison)?;
    }
    Ok(())
}

fn default_candidate_name(profile: &AggregateProfile) -> String {
    if profile.sampling_time > 0.0 && profile.samples > 0.0 {
        format!(
            "{:.2} Hz, {:.2} s",
            profile.samples / profile.sampling_time,
            profile.sampling_time
        )
    } else {
        profile.name.clone()
    }
}

fn run_info(args: InfoArgs) -> Result<()> {
    let version = storage::peek_version(&args.artifact)?;
    let mut stdout = std::io::stdout();
    if version == PROFILE_VERSION {
        let profile: FullProfile = storage::load(&args.artifact)?;
        table::write_profile_info(&mut stdout, &profile)?;
    } else if version == AGG_PROFILE_VERSION {
        let profile: AggregateProfile = storage::load(&args.artifact)?;
        table::write_aggregate_info(&mut stdout, &profile)?;
    } else if version == ANN_PROFILE_VERSION {
        let profile: AnnotatedProfile = storage::load(&args.artifact)?;
        writeln!(stdout, "name:          {}", profile.name)?;
        writeln!(stdout, "target:        {}", profile.target)?;
        writeln!(stdout, "asm rows:      {}", profile.asm.len())?;
        writeln!(stdout, "source rows:   {}", profile.source.len())?;
        writeln!(stdout, "energy:        {:.6} J", profile.energy)?;
    } else {
        bail!(
            "{} has unsupported version '{}'",
            args.artifact.display(),
            version
        );
    }
    Ok(())
}

fn run_dump(args: DumpArgs) -> Result<()> {
    let profile: FullProfile = storage::load(&args.profile)?;
    let fields = parse_fields(&args.keys.aggregate)?;
    let formatter = SampleFormatter::new(profile.maps.clone());
    let mut stdout = std::io::stdout();
    writeln!(stdout, "time\tpower\tthreads")?;
    for sample in &profile.profile {
        write!(stdout, "{:.6}\t{:.6}", sample.wall_time, sample.power)?;
        for thread in &sample.threads {
            let rendered = formatter.format(
                &thread.sample,
                &fields,
                &args.keys.delimiter,
                &args.keys.label_none,
            )?;
            write!(stdout, "\t{}:{}", thread.tid, rendered)?;
        }
        writeln!(stdout)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn last_metric_flag_wins() {
        let args: Vec<String> = ["pperf", "compare", "--use-time", "--use-energy"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(select_metric(&args), Metric::Energy);
        let args: Vec<String> = ["pperf", "compare", "--use-energy", "--use-time"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(select_metric(&args), Metric::Time);
        assert_eq!(select_metric(&["pperf".to_string()]), Metric::Energy);
    }

    #[test]
    fn aggregate_args_parse() {
        let args = Args::parse_from([
            "pperf",
            "aggregate",
            "a.json",
            "b.json",
            "--mode",
            "add",
            "-a",
            "binary,function,line",
            "--limit-time",
            "0.8",
        ]);
        match args.command {
            Command::Aggregate(aggregate_args) => {
                assert_eq!(aggregate_args.profiles.len(), 2);
                assert_eq!(
                    aggregate_args.keys.aggregate,
                    vec!["binary", "function", "line"]
                );
                assert_eq!(aggregate_args.filter.limit_time, 0.8);
                assert!(parse_mode(&aggregate_args.mode).is_ok());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn share_arguments_are_validated() {
        let filter = FilterArgs {
            limit_time: 1.5,
            ..Default::default()
        };
        assert!(filter.to_options().is_err());
    }
}
