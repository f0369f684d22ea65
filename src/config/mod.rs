//! Session configuration: backend choice, C toolchain settings, debug knobs.
//!
//! Loaded from a `weft.toml` with a minimal section-aware parser; the
//! `WEFT_ARCH` and `WEFT_CC` environment variables override the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{BackendError, Result};

/// Default global-temporary capacity in bytes.
pub const DEFAULT_GTMP_BYTES: usize = 64 * 1024;

/// Execution backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// Transpile to C, build and load a dynamic module.
    Cc,
    /// GPU compute through wgpu.
    Gfx,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::Cc => "cc",
            Arch::Gfx => "gfx",
        }
    }

    pub fn all() -> [Arch; 2] {
        [Arch::Cc, Arch::Gfx]
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Arch {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cc" | "c" => Ok(Arch::Cc),
            "gfx" | "gpu" | "wgpu" => Ok(Arch::Gfx),
            other => Err(BackendError::Config(format!(
                "unknown arch '{}' (expected 'cc' or 'gfx')",
                other
            ))),
        }
    }
}

/// Compile-time configuration shared by every kernel in a session.
#[derive(Clone, Debug, PartialEq)]
pub struct CompileConfig {
    pub arch: Arch,
    /// C compiler executable used by the transpile backend.
    pub cc_compiler: String,
    /// Extra flags appended after the built-in ones.
    pub cc_flags: Vec<String>,
    /// Where relinked modules are written. `None` uses the system temp dir.
    pub module_dir: Option<PathBuf>,
    /// Build modules with `-O0 -g` instead of `-O2`.
    pub debug: bool,
    /// Log every generated translation unit / shader at `info` level.
    pub print_kernel_source: bool,
    /// Size of the global-temporary region.
    pub gtmp_bytes: usize,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            arch: Arch::Cc,
            cc_compiler: "cc".to_string(),
            cc_flags: Vec::new(),
            module_dir: None,
            debug: false,
            print_kernel_source: false,
            gtmp_bytes: DEFAULT_GTMP_BYTES,
        }
    }
}

/// Parse a minimal TOML string array: `["a", "b"]` → `vec!["a", "b"]`.
fn parse_string_array(s: &str) -> Vec<String> {
    let s = s.trim();
    if !s.starts_with('[') || !s.ends_with(']') {
        return Vec::new();
    }
    s[1..s.len() - 1]
        .split(',')
        .map(|part| part.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(BackendError::Config(format!(
            "'{}' must be true or false, got '{}'",
            key, value
        ))),
    }
}

impl CompileConfig {
    pub fn for_arch(arch: Arch) -> Self {
        Self {
            arch,
            ..Self::default()
        }
    }

    /// Load from a weft.toml file, starting from the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse(&content, base)
    }

    /// Parse weft.toml content. Relative `module_dir` paths resolve against `base`.
    pub fn parse(content: &str, base: &Path) -> Result<Self> {
        let mut config = Self::default();
        let mut current_section = String::new();

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                current_section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(BackendError::Config(format!(
                    "line {}: expected 'key = value'",
                    lineno + 1
                )));
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim();
            let unquoted = value.trim_matches('"');

            match (current_section.as_str(), key) {
                ("program", "arch") => config.arch = unquoted.parse()?,
                ("program", "gtmp_bytes") => {
                    config.gtmp_bytes = unquoted.parse().map_err(|_| {
                        BackendError::Config(format!("invalid gtmp_bytes '{}'", unquoted))
                    })?;
                }
                ("cc", "compiler") => config.cc_compiler = unquoted.to_string(),
                ("cc", "flags") => config.cc_flags = parse_string_array(value),
                ("cc", "module_dir") => config.module_dir = Some(base.join(unquoted)),
                ("debug", "enabled") => config.debug = parse_bool(key, unquoted)?,
                ("debug", "print_kernel_source") => {
                    config.print_kernel_source = parse_bool(key, unquoted)?
                }
                _ => {
                    tracing::warn!(section = %current_section, key, "ignoring unknown config key");
                }
            }
        }

        if config.gtmp_bytes % 4 != 0 {
            return Err(BackendError::Config(format!(
                "gtmp_bytes must be a multiple of 4, got {}",
                config.gtmp_bytes
            )));
        }
        Ok(config)
    }

    /// Apply `WEFT_ARCH` / `WEFT_CC` from the process environment.
    pub fn with_env(self) -> Result<Self> {
        let arch = std::env::var("WEFT_ARCH").ok();
        let cc = std::env::var("WEFT_CC").ok();
        self.with_overrides(arch.as_deref(), cc.as_deref())
    }

    pub fn with_overrides(mut self, arch: Option<&str>, cc: Option<&str>) -> Result<Self> {
        if let Some(arch) = arch.filter(|a| !a.is_empty()) {
            self.arch = arch.parse()?;
        }
        if let Some(cc) = cc.filter(|c| !c.is_empty()) {
            self.cc_compiler = cc.to_string();
        }
        Ok(self)
    }

    /// Look for weft.toml in `start_dir` or its ancestors.
    pub fn find(start_dir: &Path) -> Option<PathBuf> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join("weft.toml");
            if candidate.exists() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
