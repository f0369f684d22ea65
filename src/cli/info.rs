use clap::Args;

use weft::program::cc::toolchain::SystemToolchain;
use weft::program::gfx::device::try_create_device;
use weft::{Arch, DataLayout, DeviceCaps};

use super::load_config;

#[derive(Args)]
pub struct InfoArgs {
    /// Only describe this backend (cc or gfx)
    #[arg(long)]
    pub arch: Option<String>,
}

pub fn cmd_info(args: InfoArgs) {
    let config = load_config(None);
    let archs: Vec<Arch> = match args.arch.as_deref() {
        Some(name) => match name.parse() {
            Ok(arch) => vec![arch],
            Err(e) => {
                eprintln!("error: {}", e);
                std::process::exit(1);
            }
        },
        None => Arch::all().to_vec(),
    };

    eprintln!("default backend: {}", config.arch);
    for arch in archs {
        match arch {
            Arch::Cc => {
                let available = SystemToolchain::is_available(&config.cc_compiler);
                println!("cc");
                println!(
                    "  compiler:  {} ({})",
                    config.cc_compiler,
                    if available { "found" } else { "not found" }
                );
                print_layouts(&DeviceCaps::host());
            }
            Arch::Gfx => {
                println!("gfx");
                match try_create_device() {
                    Some(device) => {
                        println!("  adapter:   {}", device.adapter_name);
                        print_caps(&device.caps);
                        print_layouts(&device.caps);
                    }
                    None => println!("  adapter:   none"),
                }
            }
        }
    }
}

fn print_caps(caps: &DeviceCaps) {
    println!(
        "  storage buffers per stage: {}",
        caps.max_storage_buffers_per_stage
    );
    println!(
        "  workgroups per dimension:  {}",
        caps.max_workgroups_per_dimension
    );
    println!(
        "  max binding size:          {} bytes",
        caps.max_storage_buffer_binding_size
    );
}

fn print_layouts(caps: &DeviceCaps) {
    println!(
        "  layouts:   args {}, returns {}",
        DataLayout::for_arguments(caps),
        DataLayout::RETURN
    );
}
