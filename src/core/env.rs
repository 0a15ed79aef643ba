/// Process-environment configuration, captured once at startup and passed
/// into constructors. Nothing else in the crate reads environment variables.
use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use directories::BaseDirs;

#[derive(Debug, Clone)]
pub struct Environment {
    /// Prefix prepended to every toolchain binary name, e.g.
    /// `aarch64-linux-gnu-`.
    pub cross_compile: String,
    /// Directory holding persisted ELF caches.
    pub cache_dir: PathBuf,
    /// Never read or write cache files; keep caches in memory only.
    pub disable_cache: bool,
    /// Resolve PCs to the innermost inlined frame instead of the physical
    /// enclosing function. Selects a distinct set of cache files.
    pub unwind_inline: bool,
}

impl Environment {
    pub fn from_env() -> Result<Environment> {
        let cache_dir = match env::var("PPERF_CACHE") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => default_cache_dir()?,
        };
        Ok(Environment {
            cross_compile: env::var("CROSS_COMPILE").unwrap_or_default(),
            cache_dir,
            disable_cache: env_flag("DISABLE_CACHE"),
            unwind_inline: env_flag("UNWIND_INLINE"),
        })
    }
}

impl Default for Environment {
    fn default() -> Environment {
        Environment {
            cross_compile: String::new(),
            cache_dir: default_cache_dir().unwrap_or_else(|_| PathBuf::from(".pperf-cache")),
            disable_cache: false,
            unwind_inline: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(env::var(name), Ok(v) if v == "1")
}

fn default_cache_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().ok_or_else(|| anyhow!("could not locate home directory"))?;
    Ok(base.home_dir().join(".cache").join("pperf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_environment() {
        let env = Environment::default();
        assert!(env.cross_compile.is_empty());
        assert!(!env.disable_cache);
        assert!(!env.unwind_inline);
    }
}
