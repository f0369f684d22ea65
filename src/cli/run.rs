use std::sync::Arc;
use std::time::Instant;

use clap::Args;

use weft::runtime::{KernelProfiler, RecordingProfiler};
use weft::samples::{self, Samples};
use weft::{create_program_impl, Arch, BackendError, Program};

use super::emit::c_unit;
use super::{fail, load_config};

#[derive(Args)]
pub struct RunArgs {
    /// Backend to run on (cc or gfx)
    #[arg(long)]
    pub arch: Option<String>,
    /// Number of cells each sample kernel touches
    #[arg(short, default_value_t = 16)]
    pub n: u32,
    /// Print per-kernel launch times
    #[arg(long)]
    pub profile: bool,
    /// Print the generated kernel source while compiling
    #[arg(long)]
    pub print_source: bool,
}

pub fn cmd_run(args: RunArgs) {
    let mut config = load_config(args.arch.as_deref());
    config.print_kernel_source |= args.print_source;
    let arch = config.arch;

    let samples = Samples::new().unwrap_or_else(|e| fail(e, None));
    let profiler = Arc::new(RecordingProfiler::new());
    let start = Instant::now();

    let report = create_program_impl(&config)
        .and_then(|backend| {
            Program::with_backend(
                config.clone(),
                backend,
                Some(profiler.clone() as Arc<dyn KernelProfiler>),
            )
        })
        .and_then(|mut program| {
            let report = samples::run(&mut program, &samples, args.n)?;
            program.finalize()?;
            Ok(report)
        });
    let report = match report {
        Ok(report) => report,
        Err(e @ BackendError::LinkFailure { .. }) if arch == Arch::Cc => {
            let unit = c_unit(&config).ok();
            fail(e, unit.as_deref())
        }
        Err(e) => fail(e, None),
    };

    eprintln!(
        "Ran samples on {} in {:.1}ms",
        arch,
        start.elapsed().as_secs_f64() * 1000.0
    );
    println!("n      = {}", report.n);
    println!("sum    = {}", report.sum);
    println!("scaled = {:?}", report.scaled);

    if args.profile {
        for (kernel, elapsed) in profiler.samples() {
            println!("  {:<8} {:>10.3}ms", kernel, elapsed.as_secs_f64() * 1000.0);
        }
    }
}
