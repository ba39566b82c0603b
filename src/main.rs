mod config;
mod dbus;
mod device;
mod domain;
mod error;
mod hotkey;
mod service;

use anyhow::{Context, Result};
use clap::Parser;
use service::Service;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};

/// Upper bound on acquiring the configured bus name. A denied name would
/// otherwise hang the service forever instead of failing the unit.
const BUS_NAME_TIMEOUT: Duration = Duration::from_secs(30);

/// Input-device replication service for KVM/libvirt workstations.
#[derive(Parser, Debug)]
#[command(name = "vfio-kvm", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// List available input devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Enable verbose (debug) logging when LOGLEVEL is not set.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    // LOGLEVEL from the environment wins over the --verbose flag.
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("LOGLEVEL", default_level))
        .format_timestamp_millis()
        .init();

    // One executor thread drives every task: device replication, grab
    // retries, and D-Bus dispatch all interleave cooperatively.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if cli.list_devices {
        list_devices();
        return Ok(());
    }

    log::info!("Loading config from: {}", cli.config.display());
    let options = config::load(&cli.config);
    let service = Service::new(options);

    let connection = tokio::time::timeout(BUS_NAME_TIMEOUT, connect(&service))
        .await
        .context("Timed out requesting the bus name; is the D-Bus policy installed?")?
        .context("Failed to connect to the system bus")?;
    service.set_connection(connection);

    log::info!("Listening for libvirtd events");

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sigquit = signal(SignalKind::quit()).context("Failed to install SIGQUIT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    let task_failed = tokio::select! {
        _ = sigint.recv() => {
            log::info!("SIGINT received, stopping");
            false
        }
        _ = sigquit.recv() => {
            log::info!("SIGQUIT received, stopping");
            false
        }
        _ = sigterm.recv() => {
            log::info!("SIGTERM received, stopping");
            false
        }
        _ = service.failed() => true,
    };

    service.stop().await;

    if task_failed {
        anyhow::bail!("A background task failed; shut down so the unit can restart");
    }
    log::info!("vfio-kvm stopped.");
    Ok(())
}

/// Connect to the system bus, request the configured name, and export the
/// service object.
async fn connect(service: &Arc<Service>) -> zbus::Result<zbus::Connection> {
    let options = service.options();
    zbus::connection::Builder::system()?
        .name(options.bus_name.as_str())?
        .serve_at(
            options.object_path.as_str(),
            dbus::KvmInterface::new(Arc::clone(service)),
        )?
        .build()
        .await
}

/// List all available evdev input devices with their names and paths.
///
/// An operator aid for the `--list-devices` CLI flag; the by-id symlink of a
/// listed device is what goes into the VM XML.
fn list_devices() {
    let devices: Vec<_> = evdev::enumerate().collect();

    if devices.is_empty() {
        println!("No input devices found.");
        println!("You may need to run as root or add your user to the 'input' group.");
        return;
    }

    println!("{:<30} {}", "PATH", "NAME");
    println!("{}", "-".repeat(70));

    for (path, device) in &devices {
        let name = device.name().unwrap_or("(unnamed)");
        println!("{:<30} {}", path.display(), name);
    }
}
