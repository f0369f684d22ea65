pub mod aot;
pub mod emit;
pub mod info;
pub mod run;

use std::path::Path;
use std::process;

use weft::diagnostic::render_diagnostics;
use weft::{BackendError, CompileConfig};

/// Configuration from the nearest weft.toml, the environment and the
/// command line, in increasing precedence.
pub fn load_config(arch: Option<&str>) -> CompileConfig {
    let cwd = std::env::current_dir().unwrap_or_else(|_| Path::new(".").to_path_buf());
    let base = match CompileConfig::find(&cwd) {
        Some(path) => CompileConfig::load(&path),
        None => Ok(CompileConfig::default()),
    };
    match base
        .and_then(CompileConfig::with_env)
        .and_then(|c| c.with_overrides(arch, None))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

/// Report `err` and exit. Link failures are rendered against `unit`, the
/// translation unit the toolchain rejected, when it is known.
pub fn fail(err: BackendError, unit: Option<&str>) -> ! {
    match (&err, unit) {
        (BackendError::LinkFailure { diagnostics, .. }, Some(source)) if !diagnostics.is_empty() => {
            render_diagnostics(diagnostics, "weft_module.c", source);
            eprintln!("error: {}", err);
        }
        _ => eprintln!("error: {}", err),
    }
    process::exit(1);
}
