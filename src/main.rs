//! Virtual Keyboard - emulated HID keyboard
//!
//! Creates one device, lets it run its press/release cycle and tears it down
//! when the cycle limit is reached or on Ctrl+C.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use virtual_keyboard::{
    cli::{log_filter, Cli, Command, RunArgs},
    config::{self, Config},
    descriptor::{self, REPORT_DESCRIPTOR},
    DeviceState, Driver, RunSummary,
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Grace period for the closed notification after cleanup on Ctrl+C
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let cli = Cli::parse();

    let env = env_logger::Env::default().default_filter_or(log_filter(cli.verbose));
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    match cli.command {
        Command::Run(args) => run(&args),
        Command::Describe => {
            describe();
            Ok(())
        }
        Command::InitConfig { config, force } => init_config(config, force),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load().context("loading config")?,
    };
    Ok(config)
}

fn run(args: &RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_ref())?;
    args.apply(&mut config);
    config.validate().context("invalid cadence")?;

    let driver = Driver::from_config(&config, args.dry_run)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing Ctrl+C handler")?;

    let started_at = chrono::Utc::now();
    let start_time = Instant::now();
    let device = driver.device_add().context("creating device")?;

    let cadence = driver.cadence();
    log::info!(
        "{} on {}: first press in {:?}, every {:?}, held {:?}, {} cycles",
        config.device.name,
        driver.backend_name(),
        cadence.initial_delay,
        cadence.period,
        cadence.release_delay,
        cadence.cycle_limit
    );

    while device.state() != DeviceState::Closed && !interrupted.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);
    }

    let was_interrupted = interrupted.load(Ordering::SeqCst);
    if was_interrupted {
        log::info!("interrupted, tearing down");
    }
    device.cleanup();

    let deadline = Instant::now() + TEARDOWN_TIMEOUT;
    while device.state() != DeviceState::Closed && Instant::now() < deadline {
        thread::sleep(POLL_INTERVAL);
    }
    if device.state() != DeviceState::Closed {
        log::warn!("transport did not confirm teardown");
    }

    let stats = device.context().stats();
    let summary = RunSummary::new(
        started_at,
        start_time,
        &config,
        driver.backend_name(),
        stats,
        device.state(),
        was_interrupted,
    );

    if let Some(path) = &args.summary {
        summary
            .export_json(path)
            .with_context(|| format!("writing summary to {}", path.display()))?;
        log::info!("summary written to {}", path.display());
    }

    if summary.completed() {
        println!("\nVirtual keyboard session complete.");
    } else {
        println!("\nVirtual keyboard session stopped early.");
    }
    println!("Cycles completed: {}/{}", stats.cycles, cadence.cycle_limit);
    println!("Reports submitted: {}", stats.reports_submitted);
    if stats.submit_failures > 0 {
        println!("Submission failures: {}", stats.submit_failures);
    }
    println!("Duration: {:.1}s", summary.metadata.duration_secs);

    Ok(())
}

fn describe() {
    println!("Report descriptor ({} bytes):", REPORT_DESCRIPTOR.len());
    for item in descriptor::items() {
        let bytes = &REPORT_DESCRIPTOR[item.offset..item.offset + 1 + item.size];
        let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        println!("  {:<8} {}({})", hex.join(" "), item.name(), item.data);
    }
    println!(
        "Input report: {} bits, {} byte(s), report ID {}",
        descriptor::input_report_bits(&descriptor::items()),
        descriptor::REPORT_LEN,
        descriptor::REPORT_ID
    );
}

fn init_config(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => config::config_path()?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Config::default()
        .save_to(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
