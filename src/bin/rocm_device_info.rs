//! List HIP devices and the kernel compiler the device layer would use

use anyhow::{Context, Result};
use clap::Parser;
use rocm_device::backend::hipew;
use rocm_device::backend::{enumerate_devices, DeviceInfo};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "rocm-device-info", version)]
#[command(about = "Show HIP devices, their capabilities and the hipcc compiler", long_about = None)]
struct Cli {
    /// Print machine-readable JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Flags passed to hipInit
    #[arg(long, default_value_t = 0)]
    init_flags: u32,
}

#[derive(Serialize)]
struct Report {
    devices: Vec<DeviceInfo>,
    compiler: Option<String>,
    compiler_version: Option<i32>,
}

fn main() -> Result<()> {
    rocm_device::init_logging_default();
    let cli = Cli::parse();

    let driver = hipew::global()
        .try_init(cli.init_flags)
        .context("HIP driver could not be initialized")?;

    let report = Report {
        devices: enumerate_devices(driver.as_ref()),
        compiler: hipew::compiler_path().map(|p| p.display().to_string()),
        compiler_version: hipew::compiler_version(),
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_table(&report);
    }
    Ok(())
}

fn print_table(report: &Report) {
    if report.devices.is_empty() {
        println!("No HIP devices found");
    }
    for device in &report.devices {
        let caps = &device.capabilities;
        println!(
            "[{}] {} ({}){}",
            device.ordinal,
            device.name,
            device.gcn_arch,
            if device.supported { "" } else { "  unsupported" }
        );
        println!("    id:            {}", device.id);
        println!("    compute:       {}.{}", caps.major, caps.minor);
        println!("    compute units: {}", caps.compute_units);
        println!("    memory:        {} MiB", caps.total_memory / (1024 * 1024));
        println!("    map host:      {}", caps.can_map_host_memory);
    }

    match (&report.compiler, report.compiler_version) {
        (Some(path), Some(version)) => {
            println!("hipcc: {} (HIP {}.{})", path, version / 10, version % 10)
        }
        (Some(path), None) => println!("hipcc: {} (version unknown)", path),
        _ => println!("hipcc: not found"),
    }
}
