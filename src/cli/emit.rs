use std::path::PathBuf;
use std::process;

use clap::Args;

use weft::program::cc::CcProgram;
use weft::program::gfx::aot::GfxAotModuleBuilder;
use weft::samples::Samples;
use weft::snode::Layouts;
use weft::{AotModuleBuilder, Arch, CompileConfig, DeviceCaps, ProgramImpl, Result};

use super::{fail, load_config};

#[derive(Args)]
pub struct EmitArgs {
    /// Backend whose source to emit (cc or gfx)
    #[arg(long)]
    pub arch: Option<String>,
    /// Write to a file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

pub fn cmd_emit(args: EmitArgs) {
    let config = load_config(args.arch.as_deref());
    let source = match config.arch {
        Arch::Cc => c_unit(&config),
        Arch::Gfx => wgsl_sources(&config),
    }
    .unwrap_or_else(|e| fail(e, None));

    match args.output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &source) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                process::exit(1);
            }
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", source),
    }
}

/// The combined C unit the transpile backend links for the samples.
/// Nothing is compiled.
pub fn c_unit(config: &CompileConfig) -> Result<String> {
    let samples = Samples::new()?;
    let mut program = CcProgram::new(config);
    let rb = program.materialize_runtime(None)?;
    program.materialize_snode_tree(&samples.tree, &rb)?;
    for kernel in samples.kernels() {
        program.compile(config, kernel)?;
    }
    let unit = program.translation_unit();
    program.finalize()?;
    unit
}

/// WGSL of every sample kernel, lowered for the baseline device limits.
fn wgsl_sources(config: &CompileConfig) -> Result<String> {
    let samples = Samples::new()?;
    let mut builder = Box::new(GfxAotModuleBuilder::new(
        DeviceCaps::default(),
        config.gtmp_bytes,
        Layouts::new(),
    ));
    builder.add_snode_tree(&samples.tree)?;
    for kernel in samples.kernels() {
        builder.add_kernel(kernel)?;
    }
    let module = builder.build()?;
    Ok(module
        .kernels
        .iter()
        .map(|k| k.source.as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}
