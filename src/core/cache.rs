/// Per-binary ELF caches: the complete address -> (function, file, line,
/// basic block, assembly) tables, built once per binary content hash and
/// shared across runs through `${cache_dir}`.
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::core::env::Environment;
use crate::core::toolchain::{Instruction, Toolchain};
use crate::core::types::{Meta, Sample, CACHE_VERSION};
use crate::storage;

/// The persisted cache object for one ELF binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheData {
    pub version: String,
    /// Basename of the ELF file the cache was built from.
    pub binary: String,
    /// Display name attached to every cached sample.
    pub name: String,
    pub arch: String,
    pub date: DateTime<Utc>,
    pub toolchain: String,
    pub unwind_inline: bool,
    /// One entry per instruction of every executable section.
    pub cache: BTreeMap<u64, Sample>,
    /// The rendered assembly line per instruction, `mnemonic\targs`.
    pub asm: BTreeMap<u64, String>,
    /// Source text per referenced file, 1-indexed; decode failures and
    /// missing files stay `None`.
    pub source: BTreeMap<String, Option<Vec<String>>>,
}

impl storage::Artifact for CacheData {
    const VERSION: &'static str = CACHE_VERSION;
    const KIND: &'static str = "elf cache";
}

/// Control-flow mnemonics of one architecture. `remote` is the subset whose
/// target is not encoded as an immediate.
pub struct ArchBranches {
    pub all: &'static [&'static str],
    pub remote: &'static [&'static str],
}

lazy_static! {
    // Basic block reconstruction relies on these tables and, for indirect
    // branches, on dynamic branch information from a dynmap sidecar.
    // AArch64 is stable, RISC-V experimental.
    static ref ARCH_BRANCHES: HashMap<&'static str, ArchBranches> = HashMap::from([
        (
            "AArch64",
            ArchBranches {
                all: &[
                    "b", "b.eq", "b.ne", "b.cs", "b.hs", "b.cc", "b.lo", "b.mi", "b.pl",
                    "b.vs", "b.vc", "b.hi", "b.ls", "b.ge", "b.lt", "b.gt", "b.le", "b.al",
                    "b.nv", "bl", "br", "blr", "svc", "brk", "ret", "cbz", "cbnz", "tbnz",
                ],
                remote: &["svc", "brk", "blr", "ret"],
            },
        ),
        (
            "RISC-V",
            ArchBranches {
                all: &[
                    "j", "jal", "jr", "jalr", "ret", "call", "tail", "bne", "beq", "blt",
                    "bltu", "bge", "bgeu", "beqz", "bnez", "blez", "bgez", "bltz", "bgtz",
                    "bgt", "ble", "bgtu", "bleu", "ecall", "ebreak", "scall", "sbreak",
                ],
                remote: &["ebreak", "ecall", "sbreak", "scall", "jalr", "ret"],
            },
        ),
    ]);
}

pub fn arch_branches(arch: &str) -> Option<&'static ArchBranches> {
    ARCH_BRANCHES.get(arch)
}

/// Options for building one cache.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Display name; defaults to the ELF basename.
    pub name: Option<String>,
    pub source_search_paths: Vec<PathBuf>,
    /// Explicit dynamic-branch CSV; `<elf>.dynmap` is probed when absent.
    pub dynmap: Option<PathBuf>,
    pub include_source: bool,
    pub basicblock_reconstruction: bool,
}

impl Default for BuildOptions {
    fn default() -> BuildOptions {
        BuildOptions {
            name: None,
            source_search_paths: Vec::new(),
            dynmap: None,
            include_source: true,
            basicblock_reconstruction: true,
        }
    }
}

/// Open-or-create access to the caches of any number of ELF binaries.
/// Readers share the in-memory cache after first load; writers are
/// serialized by an advisory lock on `${cache_file}.lock`.
pub struct ElfCache {
    env: Environment,
    toolchain: Toolchain,
    caches: HashMap<PathBuf, CacheData>,
    cache_files: HashMap<PathBuf, PathBuf>,
}

impl ElfCache {
    pub fn new(env: &Environment) -> ElfCache {
        ElfCache {
            env: env.clone(),
            toolchain: Toolchain::new(&env.cross_compile),
            caches: HashMap::new(),
            cache_files: HashMap::new(),
        }
    }

    /// The on-disk cache path for `elf`, keyed by content hash and the
    /// inline-unwinding flag.
    pub fn cache_file(&mut self, elf: &Path) -> Result<PathBuf> {
        if let Some(path) = self.cache_files.get(elf) {
            return Ok(path.clone());
        }
        let mut file = File::open(elf)
            .with_context(|| format!("could not open ELF {}", elf.display()))?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let basename = elf
            .file_name()
            .ok_or_else(|| anyhow!("no file name in {}", elf.display()))?
            .to_string_lossy();
        let infix = if self.env.unwind_inline { "i" } else { "" };
        let path = self
            .env
            .cache_dir
            .join(format!("{}_{}{}", basename, infix, hasher.finalize().to_hex()));
        self.cache_files.insert(elf.to_path_buf(), path.clone());
        Ok(path)
    }

    /// The cached sample for a file-relative PC. Misses yield a sample
    /// carrying only the binary name and a warning.
    pub fn sample_for(&mut self, elf: &Path, pc: u64, options: &BuildOptions) -> Result<Sample> {
        let data = self.load_or_build(elf, options)?;
        match data.cache.get(&pc) {
            Some(sample) => Ok(sample.clone()),
            None => {
                log::warn!("0x{:x} does not exist in {}", pc, elf.display());
                let mut sample = Sample::unknown(pc);
                sample.binary = Some(data.name.clone());
                Ok(sample)
            }
        }
    }

    /// Load the cache for `elf`, building it first if missing or stale.
    pub fn load_or_build(&mut self, elf: &Path, options: &BuildOptions) -> Result<&CacheData> {
        if self.caches.contains_key(elf) {
            return Ok(&self.caches[elf]);
        }
        if self.env.disable_cache {
            log::warn!("cache disabled, constructing in-memory cache");
            let data = self.build_data(elf, options)?;
            return Ok(self.caches.entry(elf.to_path_buf()).or_insert(data));
        }
        let cache_file = self.cache_file(elf)?;
        fs::create_dir_all(&self.env.cache_dir)?;
        let lock = FileLock::acquire(&lock_path(&cache_file))?;
        if cache_file.is_file() {
            match self.load_valid(&cache_file) {
                Ok(data) => {
                    drop(lock);
                    return Ok(self.caches.entry(elf.to_path_buf()).or_insert(data));
                }
                Err(e) => log::warn!(
                    "rebuilding cache {}: {}",
                    cache_file.display(),
                    e
                ),
            }
        }
        let data = self.build_data(elf, options)?;
        storage::save(&cache_file, &data)?;
        drop(lock);
        Ok(self.caches.entry(elf.to_path_buf()).or_insert(data))
    }

    /// Rebuild the cache for `elf` unconditionally.
    pub fn build(&mut self, elf: &Path, options: &BuildOptions) -> Result<&CacheData> {
        let data = self.build_data(elf, options)?;
        if !self.env.disable_cache {
            let cache_file = self.cache_file(elf)?;
            fs::create_dir_all(&self.env.cache_dir)?;
            let lock = FileLock::acquire(&lock_path(&cache_file))?;
            storage::save(&cache_file, &data)?;
            drop(lock);
        }
        self.caches.insert(elf.to_path_buf(), data);
        Ok(&self.caches[elf])
    }

    /// Load a previously written cache by its stored file name, waiting out
    /// any concurrent writer.
    pub fn raw_cache(env: &Environment, cache_file_name: &str) -> Result<CacheData> {
        let path = env.cache_dir.join(cache_file_name);
        let lock = FileLock::acquire(&lock_path(&path))?;
        drop(lock);
        if !path.is_file() {
            bail!("could not find requested elf cache {}", path.display());
        }
        storage::load(&path)
    }

    #[cfg(test)]
    pub(crate) fn seed_for_tests(&mut self, elf: PathBuf, data: CacheData) {
        let basename = elf
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.cache_files.insert(
            elf.clone(),
            self.env.cache_dir.join(format!("{}_test", basename)),
        );
        self.caches.insert(elf, data);
    }

    fn load_valid(&self, cache_file: &Path) -> Result<CacheData> {
        let data: CacheData = storage::load(cache_file)?;
        let toolchain_id = self.toolchain.id()?;
        if data.toolchain != toolchain_id {
            bail!(
                "toolchain changed ('{}' vs '{}')",
                data.toolchain,
                toolchain_id
            );
        }
        Ok(data)
    }

    fn build_data(&mut self, elf: &Path, options: &BuildOptions) -> Result<CacheData> {
        let basename = elf
            .file_name()
            .ok_or_else(|| anyhow!("no file name in {}", elf.display()))?
            .to_string_lossy()
            .into_owned();
        let name = options.name.clone().unwrap_or_else(|| basename.clone());

        let mut data = CacheData {
            version: CACHE_VERSION.to_string(),
            binary: basename,
            name: name.clone(),
            arch: self.toolchain.arch(elf)?,
            date: Utc::now(),
            toolchain: self.toolchain.id()?,
            unwind_inline: self.env.unwind_inline,
            cache: BTreeMap::new(),
            asm: BTreeMap::new(),
            source: BTreeMap::new(),
        };

        let mut function_counter: i64 = -1;
        for section in self.toolchain.sections(elf)? {
            self.toolchain.disassemble(elf, &section.name, |instr| {
                insert_instruction(&mut data, &name, &mut function_counter, instr);
                Ok(())
            })?;
        }
        if data.cache.is_empty() {
            bail!("could not parse any instructions from {}", elf.display());
        }

        self.correlate(elf, &mut data)?;

        if options.include_source {
            load_sources(&mut data, &options.source_search_paths);
        }

        if options.basicblock_reconstruction {
            match arch_branches(&data.arch) {
                Some(branches) => {
                    let dynmap = load_dynmap_for(elf, options.dynmap.as_deref())?;
                    let unresolved = reconstruct_basicblocks(&mut data, branches, &dynmap)?;
                    if !unresolved.is_empty() {
                        log::warn!(
                            "{} dynamic branches might not be resolved ({})",
                            unresolved.len(),
                            unresolved
                                .iter()
                                .map(|pc| format!("0x{:x}", pc))
                                .collect::<Vec<_>>()
                                .join(", ")
                        );
                    }
                }
                None => log::warn!(
                    "disabling basic block reconstruction due to unknown architecture {}",
                    data.arch
                ),
            }
        }

        Ok(data)
    }

    /// Correlate every cached PC to (function, file, line) and demangle
    /// whatever the resolver left untouched.
    fn correlate(&self, elf: &Path, data: &mut CacheData) -> Result<()> {
        let pcs: Vec<u64> = data.cache.keys().copied().collect();
        let resolved = self
            .toolchain
            .resolve(elf, &pcs, self.env.unwind_inline)?;
        let mut leftover: Vec<u64> = Vec::new();
        for (&pc, sample) in data.cache.iter_mut() {
            match resolved.get(&pc) {
                Some(entry) => {
                    if entry.file.is_some() {
                        sample.file = entry.file.clone();
                    }
                    if entry.function.is_some() {
                        sample.function = entry.function.clone();
                    } else if sample.function.is_some() {
                        leftover.push(pc);
                    }
                    if entry.line.is_some() {
                        sample.line = entry.line;
                    }
                }
                None => bail!("0x{:x} missing from addr2line output for {}", pc, elf.display()),
            }
        }
        if !leftover.is_empty() {
            let names: Vec<String> = leftover
                .iter()
                .filter_map(|pc| data.cache[pc].function.clone())
                .collect();
            let demangled = self.toolchain.demangle(&names)?;
            if demangled.len() == names.len() {
                for (pc, name) in leftover.iter().zip(demangled) {
                    if let Some(sample) = data.cache.get_mut(pc) {
                        sample.function = Some(name);
                    }
                }
            }
        }
        Ok(())
    }
}

fn insert_instruction(
    data: &mut CacheData,
    name: &str,
    function_counter: &mut i64,
    instr: Instruction,
) {
    let mut meta = Meta::empty();
    if instr.function_offset.is_none() {
        meta |= Meta::FUNCTION_HEAD | Meta::BASICBLOCK_HEAD;
        *function_counter += 1;
    }
    let asm = match &instr.args {
        Some(args) => format!("{}\t{}", instr.mnemonic, args),
        None => instr.mnemonic.clone(),
    };
    data.asm.insert(instr.pc, asm);
    data.cache.insert(
        instr.pc,
        Sample {
            pc: instr.pc,
            binary: Some(name.to_string()),
            file: None,
            function: instr.function_label,
            basicblock: Some(format!("f{}", function_counter)),
            line: None,
            instruction: Some(instr.mnemonic),
            opcode: Some(instr.opcode),
            meta,
        },
    );
}

/// Dynamic branch targets observed by a separate analysis; may be
/// many-to-many.
pub type DynMap = HashMap<u64, Vec<u64>>;

fn load_dynmap_for(elf: &Path, explicit: Option<&Path>) -> Result<DynMap> {
    let sidecar = PathBuf::from(format!("{}.dynmap", elf.display()));
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None if sidecar.is_file() => sidecar,
        None => return Ok(DynMap::new()),
    };
    match fs::read_to_string(&path) {
        Ok(text) => Ok(parse_dynmap(&text)),
        Err(e) => {
            log::warn!(
                "could not read dynamic branch information from {}: {}",
                path.display(),
                e
            );
            Ok(DynMap::new())
        }
    }
}

/// Parse `fromPc,toPc` lines; hexadecimal (0x-prefixed) or decimal.
/// Unparsable lines are ignored.
pub fn parse_dynmap(text: &str) -> DynMap {
    let mut dynmap = DynMap::new();
    for line in text.lines() {
        let mut fields = line.split(',');
        let (from, to) = match (fields.next(), fields.next()) {
            (Some(a), Some(b)) => (parse_int(a), parse_int(b)),
            _ => continue,
        };
        if let (Some(from), Some(to)) = (from, to) {
            dynmap.entry(from).or_default().push(to);
        }
    }
    dynmap
}

fn parse_int(text: &str) -> Option<u64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_hex(text: &str) -> Option<u64> {
    let text = text.trim();
    let text = text.strip_prefix("0x").unwrap_or(text);
    u64::from_str_radix(text, 16).ok()
}

/// Two-pass basic block reconstruction over a populated cache. Returns the
/// PCs of static branches whose target could not be determined.
pub fn reconstruct_basicblocks(
    data: &mut CacheData,
    branches: &ArchBranches,
    dynmap: &DynMap,
) -> Result<Vec<u64>> {
    let pcs: Vec<u64> = data.cache.keys().copied().collect();
    let mut unresolved = Vec::new();

    // Pass 1: flag branches and immediate branch targets.
    for &pc in &pcs {
        let mnemonic = match &data.cache[&pc].instruction {
            Some(m) => m.clone(),
            None => continue,
        };
        if !branches.all.contains(&mnemonic.as_str()) {
            continue;
        }
        if let Some(sample) = data.cache.get_mut(&pc) {
            sample.meta |= Meta::BRANCH;
        }
        if branches.remote.contains(&mnemonic.as_str()) {
            continue;
        }
        let args = data
            .asm
            .get(&pc)
            .and_then(|asm| asm.split_once('\t'))
            .map(|(_, args)| args.to_string());
        let mut target = None;
        if let Some(args) = args {
            for token in args
                .split(|c| c == ',' || c == ' ')
                .rev()
                .filter(|t| !t.is_empty())
            {
                if let Some(candidate) = parse_hex(token) {
                    if data.cache.contains_key(&candidate) {
                        target = Some(candidate);
                        break;
                    }
                }
            }
        }
        match target {
            Some(target) => {
                if let Some(sample) = data.cache.get_mut(&target) {
                    sample.meta |= Meta::BRANCH_TARGET;
                }
            }
            None => {
                let function = data.cache[&pc].function.clone().unwrap_or_default();
                let plt = function.ends_with(".plt") || function.ends_with("@plt");
                if !dynmap.contains_key(&pc) && !plt {
                    unresolved.push(pc);
                }
            }
        }
    }

    // Apply dynamic branch information.
    let mut new_targets = 0usize;
    let mut known_targets = 0usize;
    for (&from, targets) in dynmap {
        let sample = data
            .cache
            .get(&from)
            .ok_or_else(|| anyhow!("dynmap address 0x{:x} is unknown", from))?;
        if !sample.meta.contains(Meta::BRANCH) {
            bail!("dynmap names an unknown branch at 0x{:x}", from);
        }
        for &to in targets {
            let target = data
                .cache
                .get_mut(&to)
                .ok_or_else(|| anyhow!("dynmap target 0x{:x} is unknown", to))?;
            if target.meta.intersects(Meta::BRANCH_TARGET | Meta::FUNCTION_HEAD) {
                known_targets += 1;
            } else {
                new_targets += 1;
            }
            target.meta |= Meta::DYNAMIC_BRANCH_TARGET;
        }
    }
    if new_targets > 0 {
        log::info!(
            "{} new branch targets identified with dynamic branch information",
            new_targets
        );
    }
    if known_targets > 0 {
        log::debug!(
            "{} branch targets from dynamic branch information were already known",
            known_targets
        );
    }

    // Pass 2: one linear scan in address order resolves the blocks.
    let mut block = 0u64;
    let mut prev: Option<u64> = None;
    for &pc in &pcs {
        let meta = data.cache[&pc].meta;
        if meta.contains(Meta::FUNCTION_HEAD) {
            // Functions open their own block.
            block = 0;
            if let Some(sample) = data.cache.get_mut(&pc) {
                sample.meta |= Meta::BASICBLOCK_HEAD;
            }
            if let Some(sample) = prev.and_then(|p| data.cache.get_mut(&p)) {
                sample.meta |= Meta::FUNCTION_BACK | Meta::BASICBLOCK_BACK;
            }
        } else {
            let prev_is_branch = prev
                .map(|p| data.cache[&p].meta.contains(Meta::BRANCH))
                .unwrap_or(false);
            if meta.intersects(Meta::BRANCH_TARGET | Meta::DYNAMIC_BRANCH_TARGET) || prev_is_branch
            {
                block += 1;
                if let Some(sample) = data.cache.get_mut(&pc) {
                    sample.meta |= Meta::BASICBLOCK_HEAD;
                }
                if let Some(sample) = prev.and_then(|p| data.cache.get_mut(&p)) {
                    sample.meta |= Meta::BASICBLOCK_BACK;
                }
            }
        }
        if let Some(sample) = data.cache.get_mut(&pc) {
            if let Some(bb) = sample.basicblock.as_mut() {
                bb.push_str(&format!("b{}", block));
            }
        }
        prev = Some(pc);
    }
    if let Some(sample) = prev.and_then(|last| data.cache.get_mut(&last)) {
        sample.meta |= Meta::FUNCTION_BACK | Meta::BASICBLOCK_BACK;
    }

    Ok(unresolved)
}

/// Read the source files referenced by the cache. The literal path is tried
/// first, then every search path with successively shorter suffixes of the
/// original path. Missing or undecodable files stay `None` with a warning.
fn load_sources(data: &mut CacheData, search_paths: &[PathBuf]) {
    let files: Vec<String> = data
        .cache
        .values()
        .filter_map(|s| s.file.clone())
        .collect();
    for file in files {
        if data.source.contains_key(&file) {
            continue;
        }
        let target = find_source_file(&file, search_paths);
        let text = match &target {
            Some(path) => match fs::read(path) {
                Ok(bytes) => Some(decode_source(&bytes)),
                Err(e) => {
                    log::warn!("could not read source code {}: {}", path.display(), e);
                    None
                }
            },
            None => {
                log::warn!(
                    "could not find source code for {}",
                    Path::new(&file)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| file.clone())
                );
                None
            }
        };
        data.source.insert(file, text);
    }
}

fn find_source_file(file: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let literal = Path::new(file);
    if literal.is_file() {
        return Some(literal.to_path_buf());
    }
    let components: Vec<&std::ffi::OsStr> = literal
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();
    for search in search_paths {
        for skip in 0..components.len() {
            let mut candidate = search.clone();
            for part in &components[skip..] {
                candidate.push(part);
            }
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Decode source text: strict UTF-8 first, then BOM-probed UTF-16, with
/// Latin-1 as the final fallback.
fn decode_source(bytes: &[u8]) -> Vec<String> {
    let text = match String::from_utf8(bytes.to_vec()) {
        Ok(text) => text,
        Err(_) => decode_utf16(bytes)
            .unwrap_or_else(|| bytes.iter().map(|&b| b as char).collect()),
    };
    text.lines().map(|l| l.trim_end_matches('\r').to_string()).collect()
}

fn decode_utf16(bytes: &[u8]) -> Option<String> {
    let (le, payload) = match bytes {
        [0xff, 0xfe, rest @ ..] => (true, rest),
        [0xfe, 0xff, rest @ ..] => (false, rest),
        _ => return None,
    };
    if payload.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|c| {
            if le {
                u16::from_le_bytes([c[0], c[1]])
            } else {
                u16::from_be_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

fn lock_path(cache_file: &Path) -> PathBuf {
    let mut path = cache_file.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

/// Advisory file lock guarding cache construction; released on drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> Result<FileLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .with_context(|| format!("could not create lock file {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("could not lock {}", path.display()))?;
        Ok(FileLock { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(pc: u64, mnemonic: &str, args: Option<&str>, head: bool) -> Instruction {
        Instruction {
            pc,
            opcode: 0xd503201f,
            mnemonic: mnemonic.to_string(),
            args: args.map(str::to_string),
            function_label: Some("f1".to_string()),
            function_offset: if head { None } else { Some(pc) },
        }
    }

    fn build_cache(instrs: Vec<Instruction>) -> CacheData {
        let mut data = CacheData {
            version: CACHE_VERSION.to_string(),
            binary: "hello".to_string(),
            name: "hello".to_string(),
            arch: "AArch64".to_string(),
            date: Utc::now(),
            toolchain: "test".to_string(),
            unwind_inline: false,
            cache: BTreeMap::new(),
            asm: BTreeMap::new(),
            source: BTreeMap::new(),
        };
        let mut counter = -1i64;
        for instr in instrs {
            insert_instruction(&mut data, "hello", &mut counter, instr);
        }
        data
    }

    #[test]
    fn function_heads_are_marked_and_counted() {
        let data = build_cache(vec![
            instruction(0x10, "mov", Some("x0, #0"), true),
            instruction(0x14, "ret", None, false),
            instruction(0x18, "mov", Some("x0, #1"), true),
        ]);
        assert!(data.cache[&0x10]
            .meta
            .contains(Meta::FUNCTION_HEAD | Meta::BASICBLOCK_HEAD));
        assert_eq!(data.cache[&0x10].basicblock.as_deref(), Some("f0"));
        assert_eq!(data.cache[&0x14].basicblock.as_deref(), Some("f0"));
        assert_eq!(data.cache[&0x18].basicblock.as_deref(), Some("f1"));
    }

    // The single-function scenario: a forward branch splits the tail of the
    // function into separate blocks.
    #[test]
    fn basicblock_reconstruction_single_function() {
        let mut data = build_cache(vec![
            instruction(0x10, "mov", Some("x0, #0"), true),
            instruction(0x14, "b", Some("1c <f1+0xc>"), false),
            instruction(0x18, "mov", Some("x0, #1"), false),
            instruction(0x1c, "ret", None, false),
        ]);
        let branches = arch_branches("AArch64").unwrap();
        let unresolved =
            reconstruct_basicblocks(&mut data, branches, &DynMap::new()).unwrap();
        assert!(unresolved.is_empty());

        assert_eq!(data.cache[&0x10].basicblock.as_deref(), Some("f0b0"));
        assert_eq!(data.cache[&0x14].basicblock.as_deref(), Some("f0b0"));
        assert!(data.cache[&0x14].meta.contains(Meta::BRANCH));
        assert!(data.cache[&0x14].meta.contains(Meta::BASICBLOCK_BACK));
        assert_eq!(data.cache[&0x18].basicblock.as_deref(), Some("f0b1"));
        assert!(data.cache[&0x18].meta.contains(Meta::BASICBLOCK_HEAD));
        assert_eq!(data.cache[&0x1c].basicblock.as_deref(), Some("f0b2"));
        let last = data.cache[&0x1c].meta;
        assert!(last.contains(Meta::BRANCH_TARGET));
        assert!(last.contains(Meta::BASICBLOCK_HEAD));
        assert!(last.contains(Meta::BRANCH));
        assert!(last.contains(Meta::FUNCTION_BACK));
        assert!(last.contains(Meta::BASICBLOCK_BACK));
    }

    #[test]
    fn basicblock_counter_resets_at_function_head() {
        let mut data = build_cache(vec![
            instruction(0x10, "mov", Some("x0, #0"), true),
            instruction(0x14, "b", Some("10 <f1>"), false),
            instruction(0x20, "mov", Some("x1, #2"), true),
            instruction(0x24, "ret", None, false),
        ]);
        let branches = arch_branches("AArch64").unwrap();
        reconstruct_basicblocks(&mut data, branches, &DynMap::new()).unwrap();
        assert_eq!(data.cache[&0x20].basicblock.as_deref(), Some("f1b0"));
        assert!(data.cache[&0x14]
            .meta
            .contains(Meta::FUNCTION_BACK | Meta::BASICBLOCK_BACK));
    }

    #[test]
    fn every_pc_has_a_basicblock_after_reconstruction() {
        let mut data = build_cache(vec![
            instruction(0x10, "mov", Some("x0, #0"), true),
            instruction(0x14, "cbz", Some("x0, 1c <f1+0xc>"), false),
            instruction(0x18, "svc", Some("#0"), false),
            instruction(0x1c, "ret", None, false),
        ]);
        let branches = arch_branches("AArch64").unwrap();
        reconstruct_basicblocks(&mut data, branches, &DynMap::new()).unwrap();
        for sample in data.cache.values() {
            let bb = sample.basicblock.as_deref().unwrap();
            assert!(bb.contains('b'), "unfinished basic block tag {}", bb);
        }
    }

    #[test]
    fn unresolved_branches_are_reported_and_silenced_by_dynmap() {
        let make = || {
            build_cache(vec![
                instruction(0x10, "mov", Some("x0, #0"), true),
                instruction(0x14, "br", Some("x3"), false),
                instruction(0x18, "ret", None, false),
            ])
        };
        let branches = arch_branches("AArch64").unwrap();

        let mut plain = make();
        let unresolved =
            reconstruct_basicblocks(&mut plain, branches, &DynMap::new()).unwrap();
        assert_eq!(unresolved, vec![0x14]);

        let mut with_dynmap = make();
        let dynmap = DynMap::from([(0x14u64, vec![0x18u64])]);
        let unresolved = reconstruct_basicblocks(&mut with_dynmap, branches, &dynmap).unwrap();
        assert!(unresolved.is_empty());
        assert!(with_dynmap.cache[&0x18]
            .meta
            .contains(Meta::DYNAMIC_BRANCH_TARGET));
        assert_eq!(with_dynmap.cache[&0x18].basicblock.as_deref(), Some("f0b1"));
    }

    #[test]
    fn dynmap_rejects_unknown_addresses() {
        let mut data = build_cache(vec![instruction(0x10, "mov", Some("x0, #0"), true)]);
        let branches = arch_branches("AArch64").unwrap();
        let dynmap = DynMap::from([(0x999u64, vec![0x10u64])]);
        assert!(reconstruct_basicblocks(&mut data, branches, &dynmap).is_err());
    }

    #[test]
    fn dynmap_parses_hex_and_decimal() {
        let dynmap = parse_dynmap("0x14,0x18\n20,24\nbad line\n");
        assert_eq!(dynmap[&0x14], vec![0x18]);
        assert_eq!(dynmap[&20], vec![24]);
        assert_eq!(dynmap.len(), 2);
    }

    #[test]
    fn source_decoding_falls_back() {
        assert_eq!(decode_source(b"int main;\n"), vec!["int main;"]);
        // Latin-1 bytes are never rejected.
        let latin = decode_source(&[b'a', 0xe9, b'\n']);
        assert_eq!(latin, vec!["a\u{e9}"]);
        // UTF-16 LE with BOM.
        let utf16: Vec<u8> = [0xffu8, 0xfe]
            .into_iter()
            .chain("hi".encode_utf16().flat_map(|u| u.to_le_bytes()))
            .collect();
        assert_eq!(decode_source(&utf16), vec!["hi"]);
    }

    #[test]
    fn source_search_walks_suffixes() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("src");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("hello.c"), "int x;\n").unwrap();
        let found = find_source_file(
            "/build/project/src/hello.c",
            &[dir.path().to_path_buf()],
        );
        assert_eq!(found, Some(nested.join("hello.c")));
        assert_eq!(find_source_file("/absent/no.c", &[dir.path().to_path_buf()]), None);
    }
}
