use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::aot::{cmd_aot, AotArgs};
use cli::emit::{cmd_emit, EmitArgs};
use cli::info::{cmd_info, InfoArgs};
use cli::run::{cmd_run, RunArgs};

#[derive(Parser)]
#[command(
    name = "weft",
    version,
    about = "Run data-oriented kernels on a C toolchain or a wgpu device"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show backends, device capabilities and data layouts
    Info(InfoArgs),
    /// Print the generated C unit or WGSL for the sample kernels
    Emit(EmitArgs),
    /// Run the sample kernels end to end and print their results
    Run(RunArgs),
    /// Build an ahead-of-time module for the GPU backend
    Aot(AotArgs),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Info(args) => cmd_info(args),
        Command::Emit(args) => cmd_emit(args),
        Command::Run(args) => cmd_run(args),
        Command::Aot(args) => cmd_aot(args),
    }
}
