//! Building and loading dynamic modules.
//!
//! `Toolchain` turns a translation unit into a module on disk and loads
//! it; `LoadedModule` resolves entry points from a loaded module. The
//! system implementation drives an external C compiler and `libloading`.

use std::path::{Path, PathBuf};
use std::process::Command;

use libloading::Library;

use super::runtime::KernelEntry;
use crate::config::CompileConfig;
use crate::diagnostic::parse_toolchain_output;
use crate::error::{BackendError, Result};

/// Builds modules from C source and loads them.
pub trait Toolchain: Send {
    /// Compile `source` into a dynamic module at `output`.
    fn build(&self, source: &str, output: &Path) -> Result<()>;

    /// Load the module at `path`.
    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>>;
}

/// A module mapped into the process. Dropping it unloads the module, so
/// every entry point resolved from it must be discarded first.
pub trait LoadedModule: Send {
    /// Resolve an exported kernel, or `None` if the symbol is absent.
    fn resolve(&self, symbol: &str) -> Option<KernelEntry>;
}

/// The platform C compiler.
#[derive(Clone, Debug)]
pub struct SystemToolchain {
    pub compiler: String,
    pub flags: Vec<String>,
    pub debug: bool,
}

impl SystemToolchain {
    pub fn from_config(config: &CompileConfig) -> Self {
        Self {
            compiler: config.cc_compiler.clone(),
            flags: config.cc_flags.clone(),
            debug: config.debug,
        }
    }

    /// Whether `compiler` can be spawned at all.
    pub fn is_available(compiler: &str) -> bool {
        Command::new(compiler)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.compiler);
        cmd.args(["-shared", "-fPIC", "-fwrapv", "-std=c99"]);
        if self.debug {
            cmd.args(["-O0", "-g"]);
        } else {
            cmd.arg("-O2");
        }
        cmd.args(&self.flags);
        cmd.arg("-o").arg(output).arg(input).arg("-lm");
        cmd
    }
}

fn source_path(output: &Path) -> PathBuf {
    output.with_extension("c")
}

impl Toolchain for SystemToolchain {
    fn build(&self, source: &str, output: &Path) -> Result<()> {
        let input = source_path(output);
        std::fs::write(&input, source)?;

        let result = self.command(&input, output).output().map_err(|e| {
            BackendError::LinkFailure {
                message: format!("cannot run '{}': {}", self.compiler, e),
                diagnostics: Vec::new(),
            }
        })?;
        let stderr = String::from_utf8_lossy(&result.stderr);
        if !result.status.success() {
            return Err(BackendError::LinkFailure {
                message: format!("'{}' exited with {}", self.compiler, result.status),
                diagnostics: parse_toolchain_output(&stderr, source),
            });
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(compiler = %self.compiler, output = %stderr.trim(), "toolchain output");
        }
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<Box<dyn LoadedModule>> {
        Ok(Box::new(DylibModule::open(path)?))
    }
}

/// A module loaded with `libloading`.
pub struct DylibModule {
    lib: Library,
    path: PathBuf,
}

impl DylibModule {
    pub fn open(path: &Path) -> Result<Self> {
        // SAFETY: the module was just built from our own translation unit,
        // which has no initializers.
        let lib = unsafe { Library::new(path) }.map_err(|e| BackendError::LinkFailure {
            message: format!("cannot load '{}': {}", path.display(), e),
            diagnostics: Vec::new(),
        })?;
        Ok(Self {
            lib,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LoadedModule for DylibModule {
    fn resolve(&self, symbol: &str) -> Option<KernelEntry> {
        // SAFETY: every exported kernel has the `KernelEntry` signature.
        let entry = unsafe { self.lib.get::<KernelEntry>(symbol.as_bytes()) }.ok()?;
        Some(*entry)
    }
}
