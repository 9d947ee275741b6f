use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use lumia_core::config::LumiaConfig;
use lumia_core::device::{DeviceInfo, DeviceSession, Mode, ModeSession};
use lumia_core::events::{DeviceEvent, TracingObserver};
use lumia_core::ffu::{BuildParams, FlashPart, PlanOptions, build_image, plan_payloads};
use lumia_core::flash::custom_flash;
use lumia_core::gpt::Gpt;
use lumia_core::progress::ProgressUpdater;
use lumia_core::protocol::constants::CHUNK_SIZE;
use lumia_core::restore::{RestoreSources, restore_parts};
use lumia_core::state::{DeviceMonitor, ModeSwitcher};
use lumia_core::transport::{NusbHost, UsbWatcher};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Lumia USB Device Tool (Pure Rust)", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print device arrivals and removals until interrupted
    Watch,

    /// Wait for a phone and print what it reports
    Info {
        /// Seconds to wait for a phone
        #[arg(long)]
        wait: Option<u64>,
    },

    /// Build a custom image header offline from a GPT dump
    BuildImage {
        /// Dump of the first 34 sectors of the phone
        #[arg(long)]
        gpt: PathBuf,

        #[arg(long)]
        platform_id: String,

        #[arg(long)]
        emmc_sectors: u64,

        /// Partition content as START_SECTOR:PATH
        #[arg(long = "part", required = true)]
        parts: Vec<PartArg>,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Switch the phone to flash mode and write raw parts
    Flash {
        /// Partition content as START_SECTOR:PATH
        #[arg(long = "part", required = true)]
        parts: Vec<PartArg>,
    },

    /// Restore partitions from raw image files
    Restore {
        #[arg(long)]
        efiesp: Option<PathBuf>,

        #[arg(long)]
        main_os: Option<PathBuf>,

        #[arg(long)]
        data: Option<PathBuf>,
    },
}

/// `START_SECTOR:PATH`
#[derive(Debug, Clone, PartialEq, Eq)]
struct PartArg {
    start_sector: u64,
    path: PathBuf,
}

impl FromStr for PartArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sector, path) = s
            .split_once(':')
            .ok_or_else(|| format!("expected START_SECTOR:PATH, got '{s}'"))?;
        let start_sector = sector
            .trim()
            .parse()
            .map_err(|e| format!("invalid start sector '{sector}': {e}"))?;
        if path.is_empty() {
            return Err("missing path".into());
        }
        Ok(Self {
            start_sector,
            path: path.into(),
        })
    }
}

impl PartArg {
    fn open(&self) -> Result<FlashPart> {
        let file = File::open(&self.path).with_context(|| format!("Failed to open {}", self.path.display()))?;
        let label = self
            .path
            .file_name()
            .map_or_else(|| self.path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Ok(FlashPart::new(BufReader::new(file), self.start_sector, label))
    }
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("Failed to install log subscriber");
    }

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => LumiaConfig::load_from_file(path)?,
        None => LumiaConfig::default(),
    };

    match args.command {
        Command::Watch => watch(&config),
        Command::Info { wait } => show_info(&config, wait.map(Duration::from_secs)),
        Command::BuildImage {
            gpt,
            platform_id,
            emmc_sectors,
            parts,
            output,
        } => build_offline(&config, &gpt, &platform_id, emmc_sectors, &parts, &output),
        Command::Flash { parts } => {
            let mut parts = parts.iter().map(PartArg::open).collect::<Result<Vec<_>>>()?;
            flash(&config, |_| Ok(std::mem::take(&mut parts)))
        }
        Command::Restore { efiesp, main_os, data } => {
            let sources = RestoreSources { efiesp, main_os, data };
            if sources.is_empty() {
                bail!("Nothing to restore; pass at least one of --efiesp, --main-os, --data");
            }
            flash(&config, |gpt| Ok(restore_parts(gpt, &sources)?))
        }
    }
}

fn start_monitor(config: &LumiaConfig) -> Result<DeviceMonitor> {
    DeviceMonitor::new(Arc::new(NusbHost), config.monitor.clone()).context("Failed to start device monitor")
}

fn start_watcher(config: &LumiaConfig, monitor: &DeviceMonitor) -> Result<UsbWatcher> {
    UsbWatcher::spawn(monitor.notifier(), config.monitor.poll_interval()).context("Failed to start USB watcher")
}

fn wait_for_phone(monitor: &DeviceMonitor, timeout: Option<Duration>) -> Result<Arc<ModeSession>> {
    if monitor.current_session().is_none() {
        info!("Waiting for a phone...");
    }
    Ok(monitor.wait_for_device(timeout)?)
}

fn watch(config: &LumiaConfig) -> Result<()> {
    let monitor = start_monitor(config)?;
    // Subscribed before the first scan so a phone already plugged in is reported.
    let events = monitor.subscribe();
    let _watcher = start_watcher(config, &monitor)?;
    info!("Watching for Lumia devices (Ctrl-C to stop)");
    loop {
        match events.recv(None)? {
            DeviceEvent::Arrival(arrival) => {
                println!("+ {} ({})", arrival.mode, arrival.device_path)
            }
            DeviceEvent::Removal { mode } => println!("- {mode}"),
        }
    }
}

fn show_info(config: &LumiaConfig, wait: Option<Duration>) -> Result<()> {
    let monitor = start_monitor(config)?;
    let _watcher = start_watcher(config, &monitor)?;
    let session = wait_for_phone(&monitor, wait)?;
    println!("Mode: {}", session.mode());
    if let Some(path) = monitor.current_device_path() {
        println!("Device path: {path}");
    }

    match session.read_info()? {
        DeviceInfo::Flash(info) => {
            println!("App: {}", info.app_type);
            println!("Protocol: {}.{}", info.protocol_major, info.protocol_minor);
            println!("Platform ID: {}", info.platform_id);
            println!("eMMC sectors: {}", info.emmc_sectors);
            println!("Write buffer: {} bytes", info.write_buffer_size);
            println!("Sync V2: {}", info.sync_v2);
            println!("Secure boot (platform): {}", info.security.platform_secure_boot);
            println!("Secure boot (UEFI): {}", info.security.uefi_secure_boot);
            println!("Secure FFU: {}", info.security.secure_ffu);
        }
        DeviceInfo::Phone {
            product_code,
            software_version,
        } => {
            println!("Product code: {product_code}");
            println!("Software version: {software_version}");
        }
        DeviceInfo::MassStorage { volume } => println!("Volume: {volume}"),
        DeviceInfo::Qualcomm { sub_mode } => println!("Qualcomm sub-mode: {sub_mode:?}"),
    }
    Ok(())
}

fn build_offline(
    config: &LumiaConfig,
    gpt_path: &Path,
    platform_id: &str,
    emmc_sectors: u64,
    parts: &[PartArg],
    output: &Path,
) -> Result<()> {
    let gpt_bytes = std::fs::read(gpt_path).with_context(|| format!("Failed to read {}", gpt_path.display()))?;
    let gpt = Gpt::parse(&gpt_bytes)?;

    let mut parts = parts.iter().map(PartArg::open).collect::<Result<Vec<_>>>()?;
    let options = PlanOptions {
        chunk_size: CHUNK_SIZE,
        check_alignment: config.flash.check_alignment,
    };
    let progress = ProgressUpdater::new(0, |r| tracing::debug!(percent = r.percentage, "Hashing"));
    let payloads = plan_payloads(&mut parts, &options, Some(&progress))?;

    let image = build_image(
        &payloads,
        &BuildParams {
            platform_id,
            emmc_sector_count: emmc_sectors,
            gpt: &gpt,
            manifest: &config.flash.manifest,
        },
    )?;
    std::fs::write(output, &image.data).with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        payloads = payloads.len(),
        header_bytes = image.len(),
        output = %output.display(),
        "Image header written"
    );
    Ok(())
}

/// Bring the phone to flash mode and flash the parts produced from its GPT.
fn flash<F>(config: &LumiaConfig, make_parts: F) -> Result<()>
where
    F: FnOnce(&Gpt) -> Result<Vec<FlashPart>>,
{
    let monitor = start_monitor(config)?;
    let _watcher = start_watcher(config, &monitor)?;
    wait_for_phone(&monitor, config.switch.timeout())?;

    let session = ModeSwitcher::new(&monitor)
        .with_timeout(config.switch.timeout())
        .switch_to(Mode::FlashApp)?;
    let flash_session = session
        .as_flash()
        .ok_or_else(|| anyhow!("Device is not in flash mode"))?;

    let gpt = Gpt::parse(&flash_session.read_gpt_chunk()?)?;
    let mut parts = make_parts(&gpt)?;

    let progress = ProgressUpdater::new(0, |r| {
        info!(
            percent = r.percentage,
            eta_secs = r.eta.map(|d| d.as_secs()),
            "Flashing {}/{}",
            r.completed,
            r.total
        )
    });
    let removal = monitor.subscribe();
    custom_flash(
        flash_session,
        &mut parts,
        &config.flash,
        &removal,
        config.switch.timeout(),
        &TracingObserver,
        &progress,
    )?;

    info!("Flash complete; the phone is rebooting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_part_arg_parsing() {
        let part: PartArg = "256:/tmp/efiesp.bin".parse().unwrap();
        assert_eq!(
            part,
            PartArg {
                start_sector: 256,
                path: "/tmp/efiesp.bin".into()
            }
        );
        // Windows drive letters keep their colon.
        let part: PartArg = r"0:C:\images\mainos.bin".parse().unwrap();
        assert_eq!(part.path, PathBuf::from(r"C:\images\mainos.bin"));

        assert!("efiesp.bin".parse::<PartArg>().is_err());
        assert!("x:efiesp.bin".parse::<PartArg>().is_err());
        assert!("256:".parse::<PartArg>().is_err());
    }

    #[test]
    fn test_flash_command_args() {
        let args = Args::try_parse_from([
            "lumia",
            "-v",
            "flash",
            "--part",
            "0:a.bin",
            "--part",
            "2048:b.bin",
        ])
        .unwrap();
        assert!(args.verbose);
        match args.command {
            Command::Flash { parts } => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[1].start_sector, 2048);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_flash_requires_parts() {
        assert!(Args::try_parse_from(["lumia", "flash"]).is_err());
    }

    #[test]
    fn test_restore_and_config_args() {
        let args = Args::try_parse_from([
            "lumia",
            "restore",
            "--main-os",
            "mainos.bin",
            "--config",
            "lumia.toml",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("lumia.toml")));
        match args.command {
            Command::Restore { efiesp, main_os, data } => {
                assert_eq!(efiesp, None);
                assert_eq!(main_os, Some(PathBuf::from("mainos.bin")));
                assert_eq!(data, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_build_image_args() {
        let args = Args::try_parse_from([
            "lumia",
            "build-image",
            "--gpt",
            "gpt.bin",
            "--platform-id",
            "Microsoft.MSM8994.P6211.1.0",
            "--emmc-sectors",
            "30777344",
            "--part",
            "0:efiesp.bin",
            "-o",
            "image.bin",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::BuildImage { emmc_sectors: 30_777_344, .. }
        ));
    }
}
