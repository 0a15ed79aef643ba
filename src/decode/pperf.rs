/// Decoder for the raw PPerf binary profile format.
///
/// Layout: `u32 magic; u64 wall-us; u64 latency-us; u64 sample-count;
/// u32 pmu-size; u32 vmmap-count`, followed by `sample-count` sample
/// records and `vmmap-count` vmmap records. Endianness is auto-detected by
/// probing the magic word unless forced.
use std::io::Read;

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};

/// What the PMU payload measures. Conversion to power multiplies current
/// readings by a constant `volts`; custom and voltage data pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmuKind {
    Custom,
    Current,
    Voltage,
    Power,
}

impl PmuKind {
    fn from_magic(magic: u32) -> Option<PmuKind> {
        match magic {
            0 => Some(PmuKind::Custom),
            1 => Some(PmuKind::Current),
            2 => Some(PmuKind::Voltage),
            3 => Some(PmuKind::Power),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// One decoded sample: instantaneous PMU value, wall clock in seconds, and
/// the per-thread entries with cumulative CPU time in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub pmu: f64,
    pub wall_time: f64,
    pub threads: Vec<RawThread>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawThread {
    pub tid: u32,
    pub pc: u64,
    pub cpu_time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawVmMapEntry {
    pub addr: u64,
    pub size: u64,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawProfile {
    pub pmu_kind: PmuKind,
    pub endianness: Endianness,
    /// Total sampling wall time in seconds (from the header).
    pub wall_time: f64,
    /// Accumulated sampling latency in seconds.
    pub latency_time: f64,
    pub samples: Vec<RawSample>,
    pub vmmap: Vec<RawVmMapEntry>,
}

impl RawProfile {
    /// Render the embedded VMMap in the textual `HEX_ADDR HEX_SIZE LABEL`
    /// form the sample parser consumes.
    pub fn vmmap_text(&self) -> String {
        let mut text = String::new();
        for entry in &self.vmmap {
            text.push_str(&format!("{:x} {:x} {}\n", entry.addr, entry.size, entry.label));
        }
        text
    }
}

/// Decode a raw profile, probing the endianness from the magic word when
/// `forced` is absent.
pub fn decode<R: Read>(mut reader: R, forced: Option<Endianness>) -> Result<RawProfile> {
    let mut magic_bytes = [0u8; 4];
    reader
        .read_exact(&mut magic_bytes)
        .context("unexpected end of file in profile header")?;

    let endianness = match forced {
        Some(endianness) => endianness,
        None => {
            // The magic is tiny; whichever byte order makes it valid wins.
            if PmuKind::from_magic(LittleEndian::read_u32(&magic_bytes)).is_some() {
                Endianness::Little
            } else {
                Endianness::Big
            }
        }
    };
    let magic = match endianness {
        Endianness::Little => LittleEndian::read_u32(&magic_bytes),
        Endianness::Big => BigEndian::read_u32(&magic_bytes),
    };
    let pmu_kind = match PmuKind::from_magic(magic) {
        Some(kind) => kind,
        None => bail!("invalid profile magic 0x{:x}", magic),
    };

    match endianness {
        Endianness::Little => decode_body::<LittleEndian, R>(reader, pmu_kind, endianness),
        Endianness::Big => decode_body::<BigEndian, R>(reader, pmu_kind, endianness),
    }
}

fn decode_body<E: ByteOrder, R: Read>(
    mut reader: R,
    pmu_kind: PmuKind,
    endianness: Endianness,
) -> Result<RawProfile> {
    let eof = "unexpected end of file in profile header";
    let wall_time_us = reader.read_u64::<E>().context(eof)?;
    let latency_time_us = reader.read_u64::<E>().context(eof)?;
    let sample_count = reader.read_u64::<E>().context(eof)?;
    let pmu_size = reader.read_u32::<E>().context(eof)?;
    let vmmap_count = reader.read_u32::<E>().context(eof)?;

    if pmu_size != 8 {
        bail!("pmu data size not supported: {}", pmu_size);
    }
    if sample_count == 0 {
        bail!("no samples found in profile");
    }

    let mut samples = Vec::with_capacity(sample_count.min(1 << 20) as usize);
    for _ in 0..sample_count {
        let eof = "unexpected end of file in sample stream";
        let wall_time_ns = reader.read_u64::<E>().context(eof)?;
        let pmu = reader.read_f64::<E>().context(eof)?;
        let thread_count = reader.read_u32::<E>().context(eof)?;
        let mut threads = Vec::with_capacity(thread_count.min(1 << 12) as usize);
        for _ in 0..thread_count {
            let tid = reader.read_u32::<E>().context(eof)?;
            let pc = reader.read_u64::<E>().context(eof)?;
            let cpu_time_ns = reader.read_u64::<E>().context(eof)?;
            threads.push(RawThread {
                tid,
                pc,
                cpu_time: cpu_time_ns as f64 / 1e9,
            });
        }
        samples.push(RawSample {
            pmu,
            wall_time: wall_time_ns as f64 / 1e9,
            threads,
        });
    }

    let mut vmmap = Vec::with_capacity(vmmap_count.min(1 << 12) as usize);
    for _ in 0..vmmap_count {
        let eof = "unexpected end of file in vmmap";
        let addr = reader.read_u64::<E>().context(eof)?;
        let size = reader.read_u64::<E>().context(eof)?;
        let mut label = [0u8; 256];
        reader.read_exact(&mut label).context(eof)?;
        let end = label.iter().position(|&b| b == 0).unwrap_or(label.len());
        vmmap.push(RawVmMapEntry {
            addr,
            size,
            label: String::from_utf8_lossy(&label[..end]).into_owned(),
        });
    }

    Ok(RawProfile {
        pmu_kind,
        endianness,
        wall_time: wall_time_us as f64 / 1e6,
        latency_time: latency_time_us as f64 / 1e6,
        samples,
        vmmap,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    fn encode<E: ByteOrder>(magic: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<E>(magic).unwrap();
        buf.write_u64::<E>(1_000_000).unwrap(); // wall us
        buf.write_u64::<E>(500).unwrap(); // latency us
        buf.write_u64::<E>(2).unwrap(); // samples
        buf.write_u32::<E>(8).unwrap(); // pmu size
        buf.write_u32::<E>(1).unwrap(); // vmmap entries

        // sample 0: one thread
        buf.write_u64::<E>(0).unwrap();
        buf.write_f64::<E>(1.0).unwrap();
        buf.write_u32::<E>(1).unwrap();
        buf.write_u32::<E>(7).unwrap();
        buf.write_u64::<E>(0x1000).unwrap();
        buf.write_u64::<E>(0).unwrap();

        // sample 1: one thread, 1ms later
        buf.write_u64::<E>(1_000_000).unwrap();
        buf.write_f64::<E>(2.0).unwrap();
        buf.write_u32::<E>(1).unwrap();
        buf.write_u32::<E>(7).unwrap();
        buf.write_u64::<E>(0x1008).unwrap();
        buf.write_u64::<E>(1_000_000).unwrap();

        // vmmap entry
        buf.write_u64::<E>(0x1000).unwrap();
        buf.write_u64::<E>(0x1000).unwrap();
        let mut label = [0u8; 256];
        label[..5].copy_from_slice(b"hello");
        buf.extend_from_slice(&label);
        buf
    }

    #[test]
    fn decodes_little_endian_by_probe() {
        let profile = decode(&encode::<LittleEndian>(3)[..], None).unwrap();
        assert_eq!(profile.endianness, Endianness::Little);
        assert_eq!(profile.pmu_kind, PmuKind::Power);
        assert_eq!(profile.wall_time, 1.0);
        assert_eq!(profile.latency_time, 0.0005);
        assert_eq!(profile.samples.len(), 2);
        assert_eq!(profile.samples[0].pmu, 1.0);
        assert_eq!(profile.samples[1].wall_time, 0.001);
        assert_eq!(profile.samples[1].threads[0].cpu_time, 0.001);
        assert_eq!(profile.vmmap[0].label, "hello");
    }

    #[test]
    fn decodes_big_endian_by_probe() {
        let profile = decode(&encode::<BigEndian>(1)[..], None).unwrap();
        assert_eq!(profile.endianness, Endianness::Big);
        assert_eq!(profile.pmu_kind, PmuKind::Current);
        assert_eq!(profile.samples[0].threads[0].pc, 0x1000);
    }

    #[test]
    fn forced_endianness_overrides_the_probe() {
        let bytes = encode::<BigEndian>(3);
        let err = decode(&bytes[..], Some(Endianness::Little)).unwrap_err();
        assert!(err.to_string().contains("invalid profile magic"));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut bytes = encode::<LittleEndian>(9);
        assert!(decode(&bytes[..], None).is_err());
        bytes = encode::<LittleEndian>(3);
        bytes.truncate(40);
        let err = decode(&bytes[..], None).unwrap_err().to_string();
        assert!(err.contains("unexpected end of file"), "{}", err);
    }

    #[test]
    fn rejects_unsupported_pmu_size() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(3).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(1).unwrap();
        buf.write_u32::<LittleEndian>(4).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        let err = decode(&buf[..], None).unwrap_err().to_string();
        assert!(err.contains("pmu data size"), "{}", err);
    }

    #[test]
    fn vmmap_renders_parser_form() {
        let profile = decode(&encode::<LittleEndian>(3)[..], None).unwrap();
        assert_eq!(profile.vmmap_text(), "1000 1000 hello\n");
    }
}
