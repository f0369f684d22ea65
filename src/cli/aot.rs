use std::path::{Path, PathBuf};

use clap::Args;

use weft::program::gfx::aot::GfxAotModuleBuilder;
use weft::program::gfx::device::try_create_device;
use weft::samples::Samples;
use weft::snode::Layouts;
use weft::{AotModuleBuilder, DeviceCaps, Result};

use super::{fail, load_config};

#[derive(Args)]
pub struct AotArgs {
    /// Output module path
    #[arg(short, long, default_value = "kernels.weft")]
    pub output: PathBuf,
    /// Target the limits every device guarantees instead of the local adapter
    #[arg(long)]
    pub portable: bool,
}

pub fn cmd_aot(args: AotArgs) {
    let config = load_config(None);
    let caps = if args.portable {
        DeviceCaps::default()
    } else {
        match try_create_device() {
            Some(device) => {
                eprintln!("Targeting {}", device.adapter_name);
                device.caps
            }
            None => {
                eprintln!("No GPU adapter found, targeting baseline limits");
                DeviceCaps::default()
            }
        }
    };

    if let Err(e) = build(config.gtmp_bytes, caps, &args.output) {
        fail(e, None);
    }
}

fn build(gtmp_bytes: usize, caps: DeviceCaps, output: &Path) -> Result<()> {
    let samples = Samples::new()?;
    let mut builder = Box::new(GfxAotModuleBuilder::new(caps, gtmp_bytes, Layouts::new()));
    builder.add_snode_tree(&samples.tree)?;
    for kernel in samples.kernels() {
        builder.add_kernel(kernel)?;
    }
    let module = builder.build()?;
    module.save(output)?;

    eprintln!("Wrote {}", output.display());
    for kernel in &module.kernels {
        println!(
            "  {:<8} {} task(s), {} binding(s)",
            kernel.name,
            kernel.tasks.len(),
            kernel.bindings.len()
        );
    }
    Ok(())
}
