/// Adapter around the target-architecture binutils. All textual parsing of
/// tool output is confined to this module; the rest of the crate consumes
/// the structured records defined here.
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;

#[derive(Debug, Clone)]
pub struct Toolchain {
    cross_compile: String,
}

/// One executable section of an ELF file.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub name: String,
    pub file_offset: u64,
    pub vaddr: u64,
    pub size: u64,
    pub flags: String,
}

/// One disassembled instruction. `function_offset` is absent when the
/// instruction starts a new function.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub pc: u64,
    pub opcode: u128,
    pub mnemonic: String,
    pub args: Option<String>,
    pub function_label: Option<String>,
    pub function_offset: Option<u64>,
}

/// The (function, file, line) correlation for one address. Unknown parts
/// stay absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolved {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

lazy_static! {
    static ref OBJDUMP_LINE: Regex = Regex::new(
        r"^([0-9a-fA-F]+) <([^+>]+)?\+?(0x[0-9a-fA-F]+)?> ([0-9a-fA-F ]+)\t+([^<\t ]+)?(.+)?$"
    )
    .unwrap();
    static ref ADDR2LINE_VERSION: Regex = Regex::new(r"[0-9]+\.[0-9.]+\s*$").unwrap();
}

impl Toolchain {
    pub fn new(cross_compile: &str) -> Toolchain {
        Toolchain {
            cross_compile: cross_compile.to_string(),
        }
    }

    fn tool(&self, name: &str) -> String {
        format!("{}{}", self.cross_compile, name)
    }

    /// A stable fingerprint of the toolchain, used to invalidate caches.
    pub fn id(&self) -> Result<String> {
        let output = self.run(Command::new(self.tool("addr2line")).arg("-v"))?;
        let first = output.lines().next().unwrap_or_default();
        let version = ADDR2LINE_VERSION
            .find(first)
            .map(|m| m.as_str().trim())
            .unwrap_or(first);
        Ok(format!("{}{}", self.cross_compile, version))
    }

    /// The machine string from the ELF header, e.g. `AArch64`.
    pub fn arch(&self, elf: &Path) -> Result<String> {
        let output = self.run(Command::new(self.tool("readelf")).arg("-h").arg(elf))?;
        for line in output.lines() {
            let line = line.trim();
            if let Some(machine) = line.strip_prefix("Machine:") {
                return Ok(machine.trim().to_string());
            }
        }
        bail!("no machine type in ELF header of {}", elf.display())
    }

    /// Whether the ELF is a static executable (header type EXEC).
    pub fn is_static_executable(&self, elf: &Path) -> Result<bool> {
        let output = self.run(Command::new(self.tool("readelf")).arg("-h").arg(elf))?;
        Ok(output
            .lines()
            .any(|line| line.trim().starts_with("Type:") && line.contains("EXEC")))
    }

    /// The file offset of the first loadable executable segment.
    pub fn executable_segment_offset(&self, elf: &Path) -> Result<u64> {
        let output = self.run(Command::new(self.tool("readelf")).arg("-lW").arg(elf))?;
        parse_load_segment_offset(&output)
            .ok_or_else(|| anyhow!("no executable LOAD segment in {}", elf.display()))
    }

    /// Enumerate the executable sections of `elf`.
    pub fn sections(&self, elf: &Path) -> Result<Vec<Section>> {
        let output = self.run(Command::new(self.tool("objdump")).arg("-wh").arg(elf))?;
        let mut sections = Vec::new();
        for line in output.lines() {
            if let Some(section) = parse_section_line(line) {
                sections.push(section);
            }
        }
        Ok(sections)
    }

    /// Stream the disassembly of one section, invoking `visit` once per
    /// instruction. The tool's stdout is consumed incrementally; the full
    /// text is never held in memory.
    pub fn disassemble<F>(&self, elf: &Path, section: &str, mut visit: F) -> Result<()>
    where
        F: FnMut(Instruction) -> Result<()>,
    {
        let mut cmd = Command::new(self.tool("objdump"));
        cmd.arg("-Dwz")
            .arg("--prefix-addresses")
            .arg("--show-raw-insn")
            .arg("-j")
            .arg(section)
            .arg(elf);
        let display = render_command(&cmd);
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", display))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("no stdout from '{}'", display))?;
        for line in BufReader::new(stdout).lines() {
            let line = line.with_context(|| format!("reading output of '{}'", display))?;
            if let Some(instruction) = parse_objdump_line(&line) {
                visit(instruction)?;
            }
        }
        let status = child.wait()?;
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut err) = child.stderr.take() {
                use std::io::Read;
                let _ = err.read_to_string(&mut stderr);
            }
            bail!("'{}' failed with {}: {}", display, status, stderr.trim());
        }
        Ok(())
    }

    /// Batch-correlate addresses to (function, file, line). With
    /// `unwind_inline` the innermost inlined frame is returned, otherwise
    /// the outermost physical frame.
    pub fn resolve(
        &self,
        elf: &Path,
        pcs: &[u64],
        unwind_inline: bool,
    ) -> Result<HashMap<u64, Resolved>> {
        if pcs.is_empty() {
            return Ok(HashMap::new());
        }
        let mut listing = String::new();
        for pc in pcs {
            listing.push_str(&format!("0x{:x}\n", pc));
        }
        let mut tmp = tempfile::NamedTempFile::new()?;
        tmp.write_all(listing.as_bytes())?;
        tmp.flush()?;

        // addr2line prints the inline chain with -i; the last entry per
        // address is the function the code was inlined into, so the flag is
        // logically inverted here: we take the last entry per address.
        let mut flags = String::from("-Cafr");
        if !unwind_inline {
            flags.push('i');
        }
        let output = self.run(
            Command::new(self.tool("addr2line"))
                .arg(&flags)
                .arg("-e")
                .arg(elf)
                .arg(format!("@{}", tmp.path().display())),
        )?;
        parse_addr2line_output(&output)
    }

    /// Demangle a batch of symbol names. Idempotent: unmangled names pass
    /// through unchanged.
    pub fn demangle(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = Command::new(self.tool("c++filt"));
        let display = render_command(&cmd);
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", display))?;
        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| anyhow!("no stdin for '{}'", display))?;
            for name in names {
                writeln!(stdin, "{}", name)?;
            }
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "'{}' failed with {}: {}",
                display,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn run(&self, cmd: &mut Command) -> Result<String> {
        let display = render_command(cmd);
        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn '{}'", display))?;
        if !output.status.success() {
            bail!(
                "'{}' failed with {}: {}",
                display,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn render_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Parse one `objdump -wh` section line; executable sections only.
pub fn parse_section_line(line: &str) -> Option<Section> {
    let normalized = line.replace(", ", ",");
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    if fields.len() < 8 || !fields[7].contains("CODE") {
        return None;
    }
    Some(Section {
        name: fields[1].to_string(),
        size: u64::from_str_radix(fields[2], 16).ok()?,
        vaddr: u64::from_str_radix(fields[3], 16).ok()?,
        file_offset: u64::from_str_radix(fields[5], 16).ok()?,
        flags: fields[7].to_string(),
    })
}

/// Parse one `objdump --prefix-addresses` disassembly line. Mnemonics are
/// lowercased; lines that are not instructions yield `None`.
pub fn parse_objdump_line(line: &str) -> Option<Instruction> {
    let caps = OBJDUMP_LINE.captures(line)?;
    let pc = u64::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
    let opcode_hex: String = caps.get(4)?.as_str().split_whitespace().collect();
    let opcode = u128::from_str_radix(&opcode_hex, 16).ok()?;
    let mnemonic = caps.get(5)?.as_str().trim().to_lowercase();
    let args = caps
        .get(6)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());
    let function_label = caps.get(2).map(|m| m.as_str().to_string());
    let function_offset = match caps.get(3) {
        Some(m) => Some(u64::from_str_radix(m.as_str().trim_start_matches("0x"), 16).ok()?),
        None => None,
    };
    Some(Instruction {
        pc,
        opcode,
        mnemonic,
        args,
        function_label,
        function_offset,
    })
}

/// Parse `addr2line -af` output into per-address correlations. With `-i`
/// an address may print several frames; the last pair wins.
pub fn parse_addr2line_output(output: &str) -> Result<HashMap<u64, Resolved>> {
    let mut resolved = HashMap::new();
    let mut current: Option<(u64, Vec<String>)> = None;
    for line in output.lines().filter(|l| !l.is_empty()) {
        if let Some(hex) = line.strip_prefix("0x") {
            if let Ok(pc) = u64::from_str_radix(hex.trim(), 16) {
                if let Some((done_pc, lines)) = current.take() {
                    resolved.insert(done_pc, decode_frames(&lines)?);
                }
                current = Some((pc, Vec::new()));
                continue;
            }
        }
        match current.as_mut() {
            Some((_, lines)) => lines.push(line.to_string()),
            None => bail!("could not decode addr2line entry '{}'", line),
        }
    }
    if let Some((pc, lines)) = current {
        resolved.insert(pc, decode_frames(&lines)?);
    }
    Ok(resolved)
}

fn decode_frames(lines: &[String]) -> Result<Resolved> {
    if lines.len() < 2 {
        bail!("truncated addr2line entry: {:?}", lines);
    }
    // The final (function, file:line) pair belongs to the frame we keep.
    let function = &lines[lines.len() - 2];
    let location = &lines[lines.len() - 1];
    let mut result = Resolved::default();
    if !function.trim_matches('?').is_empty() {
        result.function = Some(function.clone());
    }
    let (file, line) = match location.rsplit_once(':') {
        Some((file, rest)) => {
            // `:7 (discriminator 2)` keeps only the number.
            let number = rest.split_whitespace().next().unwrap_or(rest);
            (file, number.parse::<u32>().ok())
        }
        None => (location.as_str(), None),
    };
    if !file.trim_matches('?').is_empty() {
        result.file = Some(file.to_string());
    }
    result.line = line.filter(|&l| l != 0);
    Ok(result)
}

fn parse_load_segment_offset(readelf_lw: &str) -> Option<u64> {
    for line in readelf_lw.lines() {
        let line = line.trim();
        if !line.starts_with("LOAD") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        // LOAD offset vaddr paddr filesz memsz flags align
        if fields.len() < 7 {
            continue;
        }
        let flags = &fields[fields.len() - 2];
        if !flags.contains('E') {
            continue;
        }
        let offset = fields[1].trim_start_matches("0x");
        return u64::from_str_radix(offset, 16).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_line_keeps_code_sections() {
        let line = "  11 .text         000092c8  0000000000002640  0000000000002640  00002640  2**3  CONTENTS, ALLOC, LOAD, READONLY, CODE";
        let section = parse_section_line(line).unwrap();
        assert_eq!(section.name, ".text");
        assert_eq!(section.size, 0x92c8);
        assert_eq!(section.vaddr, 0x2640);
        assert_eq!(section.file_offset, 0x2640);
    }

    #[test]
    fn section_line_skips_data_sections() {
        let line = "  18 .data         00000468  0000000000014000  0000000000014000  00004000  2**3  CONTENTS, ALLOC, LOAD, DATA";
        assert!(parse_section_line(line).is_none());
    }

    #[test]
    fn objdump_line_function_head() {
        let line = "0000000000001000 <main> d10083ff\tsub\tsp, sp, #0x20";
        let instr = parse_objdump_line(line).unwrap();
        assert_eq!(instr.pc, 0x1000);
        assert_eq!(instr.opcode, 0xd10083ff);
        assert_eq!(instr.mnemonic, "sub");
        assert_eq!(instr.function_label.as_deref(), Some("main"));
        assert_eq!(instr.function_offset, None);
        assert_eq!(instr.args.as_deref(), Some("sp, sp, #0x20"));
    }

    #[test]
    fn objdump_line_with_offset() {
        let line = "0000000000001004 <main+0x4> 94000002\tbl\t0000000000001008 <f2>";
        let instr = parse_objdump_line(line).unwrap();
        assert_eq!(instr.pc, 0x1004);
        assert_eq!(instr.function_label.as_deref(), Some("main"));
        assert_eq!(instr.function_offset, Some(4));
        assert_eq!(instr.mnemonic, "bl");
    }

    #[test]
    fn objdump_line_lowercases_mnemonics() {
        let line = "0000000000002000 <start> 4889e5\tMOV\t%rsp,%rbp";
        let instr = parse_objdump_line(line).unwrap();
        assert_eq!(instr.mnemonic, "mov");
    }

    #[test]
    fn objdump_skips_non_instruction_lines() {
        assert!(parse_objdump_line("Disassembly of section .text:").is_none());
        assert!(parse_objdump_line("").is_none());
    }

    #[test]
    fn addr2line_output_plain() {
        let output = "0x0000000000001000\nmain\n/src/hello.c:7\n";
        let resolved = parse_addr2line_output(output).unwrap();
        let entry = &resolved[&0x1000];
        assert_eq!(entry.function.as_deref(), Some("main"));
        assert_eq!(entry.file.as_deref(), Some("/src/hello.c"));
        assert_eq!(entry.line, Some(7));
    }

    #[test]
    fn addr2line_output_takes_last_inline_frame() {
        let output = "0x0000000000001004\nhelper\n/src/inline.h:3\nmain\n/src/hello.c:9\n";
        let resolved = parse_addr2line_output(output).unwrap();
        let entry = &resolved[&0x1004];
        assert_eq!(entry.function.as_deref(), Some("main"));
        assert_eq!(entry.file.as_deref(), Some("/src/hello.c"));
        assert_eq!(entry.line, Some(9));
    }

    #[test]
    fn addr2line_output_unknowns_stay_absent() {
        let output = "0x0000000000000020\n??\n??:0\n";
        let resolved = parse_addr2line_output(output).unwrap();
        let entry = &resolved[&0x20];
        assert_eq!(entry.function, None);
        assert_eq!(entry.file, None);
        assert_eq!(entry.line, None);
    }

    #[test]
    fn load_segment_offset() {
        let listing = "\
Program Headers:
  Type           Offset   VirtAddr           PhysAddr           FileSiz  MemSiz   Flg Align
  LOAD           0x000000 0x0000000000000000 0x0000000000000000 0x000628 0x000628 R   0x1000
  LOAD           0x001000 0x0000000000001000 0x0000000000001000 0x0001f5 0x0001f5 R E 0x1000
  LOAD           0x002000 0x0000000000002000 0x0000000000002000 0x000148 0x000148 R   0x1000
";
        assert_eq!(parse_load_segment_offset(listing), Some(0x1000));
    }
}
