/// Versioned artifact storage. Every persisted object (ELF cache, full,
/// aggregated and annotated profiles) is a JSON document carrying a
/// `version` field that must match the running binary exactly. Files whose
/// path ends in `.gz` are transparently de/compressed. Writes go through a
/// temporary file in the destination directory followed by an atomic
/// rename, so partial artifacts are never observable.
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A persistable artifact with a fixed version tag.
pub trait Artifact: Serialize + DeserializeOwned {
    /// The exact version tag this build reads and writes.
    const VERSION: &'static str;
    /// Human-readable artifact kind for diagnostics.
    const KIND: &'static str;
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("{kind} {path} has version '{found}', this build requires '{required}'")]
    VersionMismatch {
        kind: &'static str,
        path: String,
        found: String,
        required: &'static str,
    },
    #[error("{kind} {path} carries no version tag")]
    MissingVersion { kind: &'static str, path: String },
}

/// Load and version-check an artifact.
pub fn load<T: Artifact>(path: &Path) -> Result<T> {
    let reader = open_reader(path)?;
    let value: serde_json::Value = serde_json::from_reader(reader)
        .with_context(|| format!("could not read {} {}", T::KIND, path.display()))?;
    check_version::<T>(&value, path)?;
    let artifact = serde_json::from_value(value)
        .with_context(|| format!("malformed {} {}", T::KIND, path.display()))?;
    Ok(artifact)
}

/// Write an artifact atomically (temp file + rename), honoring `.gz`.
pub fn save<T: Artifact>(path: &Path, artifact: &T) -> Result<()> {
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    {
        let file = tmp.as_file_mut();
        if is_gz(path) {
            let mut encoder = GzEncoder::new(BufWriter::new(&mut *file), Compression::default());
            serde_json::to_writer(&mut encoder, artifact)?;
            encoder.finish()?.flush()?;
        } else {
            let mut writer = BufWriter::new(&mut *file);
            serde_json::to_writer(&mut writer, artifact)?;
            writer.flush()?;
        }
    }
    tmp.persist(path)
        .with_context(|| format!("could not write {} {}", T::KIND, path.display()))?;
    Ok(())
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file =
        File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let reader = BufReader::new(file);
    if is_gz(path) {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

fn is_gz(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "gz")
}

fn check_version<T: Artifact>(value: &serde_json::Value, path: &Path) -> Result<()> {
    match value.get("version").and_then(|v| v.as_str()) {
        Some(found) if found == T::VERSION => Ok(()),
        Some(found) => Err(StorageError::VersionMismatch {
            kind: T::KIND,
            path: path.display().to_string(),
            found: found.to_string(),
            required: T::VERSION,
        }
        .into()),
        None => Err(StorageError::MissingVersion {
            kind: T::KIND,
            path: path.display().to_string(),
        }
        .into()),
    }
}

/// Read only the version tag of an artifact, for dispatching loaders.
pub fn peek_version(path: &Path) -> Result<String> {
    let reader = open_reader(path)?;
    let value: serde_json::Value = serde_json::from_reader(reader)
        .with_context(|| format!("could not read {}", path.display()))?;
    value
        .get("version")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("{} carries no version tag", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        version: String,
        payload: u32,
    }

    impl Artifact for Doc {
        const VERSION: &'static str = "t1.0";
        const KIND: &'static str = "test document";
    }

    fn doc() -> Doc {
        Doc {
            version: Doc::VERSION.to_string(),
            payload: 7,
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        save(&path, &doc()).unwrap();
        let loaded: Doc = load(&path).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn save_load_roundtrip_gz() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json.gz");
        save(&path, &doc()).unwrap();
        let loaded: Doc = load(&path).unwrap();
        assert_eq!(loaded, doc());
    }

    #[test]
    fn version_mismatch_is_fatal_and_names_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"version":"t0.9","payload":7}"#).unwrap();
        let err = load::<Doc>(&path).unwrap_err().to_string();
        assert!(err.contains("t0.9"), "{}", err);
        assert!(err.contains("t1.0"), "{}", err);
    }

    #[test]
    fn missing_version_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        std::fs::write(&path, r#"{"payload":7}"#).unwrap();
        assert!(load::<Doc>(&path).is_err());
    }
}
