//! `disk-mapper`: prepares the encrypted state disk before the node joins.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use diskmapper_cloud::{PlatformResolver, ResolverSettings};
use diskmapper_core::config::{check_mapped_name, DEFAULT_CONFIG_PATH};
use diskmapper_core::keyservice::HttpKeyBroker;
use diskmapper_core::{
    logging, CancelToken, DiskBootstrap, DiskMapperConfig, DiskMapperError, KeyExchangeClient,
    RetryPolicy,
};
use diskmapper_luks::CryptsetupDevice;
use diskmapper_provider::{CryptDevice, Platform};
use log::{error, info, warn};
use std::path::PathBuf;

/// Top-level options shared by every subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "disk-mapper",
    version,
    about = "Unlock or initialise the LUKS2 state disk after remote attestation."
)]
struct Cli {
    /// Cloud service provider the image is running on (azure, gcp, qemu).
    #[arg(long, global = true, default_value = "")]
    csp: String,

    /// Path to the disk-mapper configuration file.
    #[arg(short, long, global = true, env = "DISK_MAPPER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Device-mapper target name (defaults to `[disk] mapped_name`).
    #[arg(long, global = true)]
    target: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Commands {
    /// Attest, fetch the disk key, and map the state disk (default).
    Prepare,
    /// Report whether the state disk carries a LUKS2 header and its UUID.
    Probe,
    /// Deactivate the mapped state disk.
    Unmap,
}

fn main() {
    logging::init("info");
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    info!(
        "starting disk-mapper version={} cloudProvider={}",
        env!("CARGO_PKG_VERSION"),
        cli.csp
    );

    let config = load_config(&cli)?;
    let target = resolve_target(cli.target.as_deref(), &config)?;
    let crypt = CryptsetupDevice::from_config(&config).context("locating cryptsetup")?;

    match cli.command.unwrap_or(Commands::Prepare) {
        Commands::Prepare => prepare(&cli.csp, &config, &crypt, &target),
        Commands::Probe => probe(&cli.csp, &config, &crypt),
        Commands::Unmap => {
            crypt
                .unmap(&target)
                .with_context(|| format!("failed to unmap {target}"))?;
            info!("unmapped {target}");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<DiskMapperConfig> {
    let config = DiskMapperConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    let issues = config.validate();
    if !issues.is_empty() {
        bail!(
            "invalid configuration {}: {}",
            cli.config.display(),
            issues.join("; ")
        );
    }
    Ok(config)
}

/// `--target` overrides `[disk] mapped_name` and gets the same checks.
fn resolve_target(flag: Option<&str>, config: &DiskMapperConfig) -> Result<String> {
    match flag {
        Some(name) => {
            if let Err(issue) = check_mapped_name(name) {
                bail!("invalid --target: {issue}");
            }
            Ok(name.to_string())
        }
        None => Ok(config.disk.mapped_name.clone()),
    }
}

fn prepare(
    csp: &str,
    config: &DiskMapperConfig,
    crypt: &CryptsetupDevice,
    target: &str,
) -> Result<()> {
    let cancel = CancelToken::new();
    let on_signal = cancel.clone();
    // First signal stops at the next step boundary; a second one exits.
    ctrlc::set_handler(move || {
        if on_signal.is_cancelled() {
            warn!("second termination request; exiting immediately");
            std::process::exit(130);
        }
        warn!("termination requested; stopping before the next disk operation");
        on_signal.cancel();
    })
    .context("failed to install signal handler")?;

    let broker = HttpKeyBroker::from_config(config).context("failed to set up key broker client")?;
    let policy = RetryPolicy {
        poll_interval: config.poll_interval(),
        max_attempts: config.max_attempts(),
    };
    let client = KeyExchangeClient::new(broker, policy, cancel);
    let resolver = PlatformResolver::new(ResolverSettings::from_config(config));

    let mut bootstrap = DiskBootstrap::new(&client, target);
    let report = bootstrap
        .run(|| resolver.resolve(csp), |path| crypt.open(path))
        .context("failed to prepare state disk")?;

    info!(
        "state disk {} ready at {} ({:?} disk)",
        report.disk_uuid,
        report.mapped_device.display(),
        report.flow
    );
    Ok(())
}

fn probe(csp: &str, config: &DiskMapperConfig, crypt: &CryptsetupDevice) -> Result<()> {
    let resolver = PlatformResolver::new(ResolverSettings::from_config(config));
    let platform = csp
        .parse::<Platform>()
        .map_err(|err| DiskMapperError::UnsupportedPlatform(err.to_string()))?;
    let device = resolver
        .state_disk_path(platform)
        .context("unable to determine state disk path")?;

    let mut session = crypt.open(&device)?;
    let uuid = if session.is_luks() {
        session.disk_uuid().map(Some)
    } else {
        Ok(None)
    };
    session.close()?;
    let uuid = uuid?;

    println!("device: {}", device.display());
    match uuid {
        Some(uuid) => {
            println!("luks2: yes");
            println!("uuid: {uuid}");
        }
        None => println!("luks2: no"),
    }
    Ok(())
}
