/// Translates runtime PCs into mapped samples using a virtual memory map,
/// the kernel symbol table, and the per-binary ELF caches.
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;

use crate::core::cache::{BuildOptions, ElfCache};
use crate::core::env::Environment;
use crate::core::mapper::{ListMapper, Maps};
use crate::core::toolchain::Toolchain;
use crate::core::types::{MappedSample, Sample, LABEL_KERNEL};

/// One entry of the runtime memory layout. `end = start + size`; the file
/// translation of a runtime PC is `pc` for static executables and
/// `(pc - start) + offset` otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryDescriptor {
    pub binary: String,
    pub path: PathBuf,
    pub kernel: bool,
    pub is_static: bool,
    /// File offset of the executable segment.
    pub offset: u64,
    pub start: u64,
    pub size: u64,
    pub end: u64,
}

impl BinaryDescriptor {
    fn contains(&self, pc: u64) -> bool {
        pc >= self.start && pc <= self.end
    }
}

pub struct SampleParser {
    toolchain: Toolchain,
    cache: ElfCache,
    mapper: ListMapper,
    cache_map: BTreeMap<String, String>,
    binaries: Vec<BinaryDescriptor>,
    /// (offset, name) sorted descending by offset; offsets are relative to
    /// the lowest kallsyms address.
    kallsyms: Vec<(u64, String)>,
    search_paths: Vec<PathBuf>,
    build_options: BuildOptions,
    memo: HashMap<u64, MappedSample>,
    unknown_pcs: u64,
}

impl SampleParser {
    pub fn new(env: &Environment) -> SampleParser {
        SampleParser {
            toolchain: Toolchain::new(&env.cross_compile),
            cache: ElfCache::new(env),
            mapper: ListMapper::new(),
            cache_map: BTreeMap::new(),
            binaries: Vec::new(),
            kallsyms: Vec::new(),
            search_paths: Vec::new(),
            build_options: BuildOptions::default(),
            memo: HashMap::new(),
            unknown_pcs: 0,
        }
    }

    pub fn set_build_options(&mut self, options: BuildOptions) {
        self.build_options = options;
    }

    pub fn add_search_path(&mut self, path: &Path) -> Result<()> {
        if !path.is_dir() {
            bail!("not a directory '{}'", path.display());
        }
        self.search_paths.push(path.to_path_buf());
        // Caches resolve source files along the same paths.
        self.build_options
            .source_search_paths
            .push(path.to_path_buf());
        Ok(())
    }

    /// Load a VMMap from `HEX_ADDR HEX_SIZE BASENAME` lines. Every entry
    /// must resolve to an ELF file under the search paths.
    pub fn load_vmmap(&mut self, text: &str) -> Result<()> {
        for line in text.lines().filter(|l| l.len() > 2) {
            let mut fields = line.splitn(3, ' ');
            let (addr, size, label) = match (fields.next(), fields.next(), fields.next()) {
                (Some(a), Some(s), Some(l)) => (a, s, l.trim()),
                _ => bail!("malformed vmmap line '{}'", line),
            };
            let addr = u64::from_str_radix(addr, 16)
                .with_context(|| format!("malformed vmmap line '{}'", line))?;
            let size = u64::from_str_radix(size, 16)
                .with_context(|| format!("malformed vmmap line '{}'", line))?;
            let descriptor = self
                .locate_binary(label, addr, size)?
                .ok_or_else(|| anyhow!("could not find {}", label))?;
            self.binaries.push(descriptor);
        }
        Ok(())
    }

    pub fn load_vmmap_file(&mut self, path: &Path) -> Result<()> {
        let text = read_text(path)?;
        self.load_vmmap(&text)
    }

    fn locate_binary(
        &mut self,
        label: &str,
        addr: u64,
        size: u64,
    ) -> Result<Option<BinaryDescriptor>> {
        for search in &self.search_paths {
            let path = search.join(label);
            if !path.is_file() {
                continue;
            }
            let is_static = match self.toolchain.is_static_executable(&path) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let offset = match self.toolchain.executable_segment_offset(&path) {
                Ok(v) => v,
                Err(_) => continue,
            };
            return Ok(Some(BinaryDescriptor {
                binary: label.to_string(),
                path,
                kernel: false,
                is_static,
                offset,
                start: addr,
                size,
                end: addr + size,
            }));
        }
        Ok(None)
    }

    /// Load kernel symbols from `HEX_ADDR TYPE NAME` lines and register the
    /// synthetic `_kernel` binary. Symbol offsets are rebased onto the
    /// lowest address; the last symbol owns everything above it.
    pub fn load_kallsyms(&mut self, text: &str) -> Result<()> {
        let mut symbols: Vec<(u64, String)> = Vec::new();
        for line in text.lines() {
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 3 {
                continue;
            }
            let addr = u64::from_str_radix(fields[0], 16)
                .with_context(|| format!("malformed kallsyms line '{}'", line))?;
            symbols.push((addr, fields[2].to_string()));
        }
        if symbols.is_empty() {
            return Ok(());
        }
        let kstart = symbols.iter().map(|&(a, _)| a).min().unwrap_or(0);
        let kend = symbols.iter().map(|&(a, _)| a).max().unwrap_or(0);
        self.binaries.push(BinaryDescriptor {
            binary: LABEL_KERNEL.to_string(),
            path: PathBuf::from(LABEL_KERNEL),
            kernel: true,
            is_static: false,
            offset: 0,
            start: kstart,
            size: kend - kstart,
            end: u64::MAX,
        });
        self.kallsyms = symbols
            .into_iter()
            .map(|(a, n)| (a - kstart, n))
            .collect();
        self.kallsyms.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(())
    }

    pub fn load_kallsyms_file(&mut self, path: &Path) -> Result<()> {
        let text = read_text(path)?;
        self.load_kallsyms(&text)
    }

    /// Translate one runtime PC. Unknown PCs yield an all-absent sample and
    /// are counted rather than failing the walk.
    pub fn parse(&mut self, pc: u64) -> Result<MappedSample> {
        if let Some(mapped) = self.memo.get(&pc) {
            return Ok(*mapped);
        }
        let sample = self.resolve_pc(pc)?;
        let mapped = self.mapper.map(&sample);
        self.memo.insert(pc, mapped);
        Ok(mapped)
    }

    fn resolve_pc(&mut self, pc: u64) -> Result<Sample> {
        let descriptor = match self.binaries.iter().find(|b| b.contains(pc)) {
            Some(d) => d.clone(),
            None => {
                self.unknown_pcs += 1;
                log::debug!("0x{:x} is not within any vmmap entry", pc);
                return Ok(Sample::unknown(pc));
            }
        };
        let file_pc = if descriptor.is_static {
            pc
        } else {
            (pc - descriptor.start) + descriptor.offset
        };
        if descriptor.kernel {
            let mut sample = Sample::unknown(file_pc);
            sample.binary = Some(descriptor.binary.clone());
            sample.function = self
                .kallsyms
                .iter()
                .find(|&&(offset, _)| offset <= file_pc)
                .map(|(_, name)| name.clone());
            return Ok(sample);
        }
        let sample = self
            .cache
            .sample_for(&descriptor.path, file_pc, &self.build_options)?;
        if let Some(binary) = &sample.binary {
            if !self.cache_map.contains_key(binary) {
                let cache_file = self.cache.cache_file(&descriptor.path)?;
                let basename = cache_file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.cache_map.insert(binary.clone(), basename);
            }
        }
        Ok(sample)
    }

    /// Substitute a mapped sample's indices back into strings.
    pub fn remap(&self, sample: &MappedSample) -> Result<Sample> {
        self.mapper.remap(sample)
    }

    pub fn maps(&self) -> &Maps {
        self.mapper.maps()
    }

    pub fn cache_map(&self) -> &BTreeMap<String, String> {
        &self.cache_map
    }

    pub fn binaries(&self) -> &[BinaryDescriptor] {
        &self.binaries
    }

    /// The profiled target: the first VMMap entry.
    pub fn target(&self) -> Option<&str> {
        self.binaries.first().map(|b| b.binary.as_str())
    }

    pub fn unknown_pcs(&self) -> u64 {
        self.unknown_pcs
    }

    #[cfg(test)]
    pub(crate) fn push_descriptor(&mut self, descriptor: BinaryDescriptor) {
        self.binaries.push(descriptor);
    }

    #[cfg(test)]
    pub(crate) fn seed_cache(&mut self, elf: PathBuf, data: crate::core::cache::CacheData) {
        self.cache.seed_for_tests(elf, data);
    }
}

/// Read a text file, transparently decompressing `.gz`.
pub fn read_text(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let mut text = String::new();
    if path.extension().is_some_and(|ext| ext == "gz") {
        GzDecoder::new(BufReader::new(file)).read_to_string(&mut text)?;
    } else {
        BufReader::new(file).read_to_string(&mut text)?;
    }
    Ok(text)
}
