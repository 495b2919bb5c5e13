// blelink: BLE session command-line tool
//
// Decodes advertisements and characteristic payloads, drives a simulated
// heart-rate strap end to end, and talks to real peripherals through the
// system Bluetooth adapter.

mod btle;
mod config;

use anyhow::{Context, Result};
use blelink_core::gatt::descriptor::{short_text, uuid_from_u16, uuid_from_u32};
use blelink_core::gatt::registry::{
    BATTERY_LEVEL, FIRMWARE_REVISION, HEART_RATE_MEASUREMENT, MANUFACTURER_NAME, MODEL_NUMBER,
};
use blelink_core::sim::{SimulatedHost, SimulatedScanBackend};
use blelink_core::{
    decode_heart_rate, decode_known, parse_advertisement, BleDevice, BleManager,
    CharacteristicDescriptor, ConnectionState, DeviceAddress, Feature, KnownValue, ScanListener,
    SessionEvent,
};
use clap::{ArgAction, Parser, Subcommand};
use colored::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

const SIMULATED_ADDRESS: &str = "C0:FF:EE:00:00:01";

#[derive(Parser)]
#[command(name = "blelink")]
#[command(about = "blelink: BLE sessions from the command line", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode raw advertising data (hex)
    Adv {
        hex: String,
        #[arg(long)]
        json: bool,
    },
    /// Decode a heart-rate measurement (hex)
    Hr {
        hex: String,
        #[arg(long)]
        json: bool,
    },
    /// Identify a characteristic and optionally decode a value (hex)
    Identify { uuid: String, value: Option<String> },
    /// Run a session against a simulated heart-rate strap
    Simulate {
        /// Heart-rate notifications to push
        #[arg(short, long, default_value = "5")]
        beats: u8,
        /// Skip the link-loss and reconnect step
        #[arg(long)]
        no_guard: bool,
    },
    /// Configure session defaults
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Scan for nearby peripherals
    Scan {
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
    /// Connect to a peripheral and read or listen
    Connect {
        address: String,
        /// Characteristic to read once ready (repeatable)
        #[arg(short, long)]
        read: Vec<String>,
        /// Seconds to print notifications before disconnecting
        #[arg(short, long, default_value = "0")]
        listen: u64,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Show the config file location
    Path,
    /// Restore the defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Adv { hex, json } => cmd_adv(&hex, json),
        Commands::Hr { hex, json } => cmd_hr(&hex, json),
        Commands::Identify { uuid, value } => cmd_identify(&uuid, value.as_deref()),
        Commands::Simulate { beats, no_guard } => cmd_simulate(beats, !no_guard).await,
        Commands::Config { action } => cmd_config(action),
        Commands::Scan { seconds } => cmd_scan(seconds).await,
        Commands::Connect {
            address,
            read,
            listen,
        } => cmd_connect(&address, &read, listen).await,
    }
}

/// `RUST_LOG` wins over `-v`. With `--log-file` the returned guard must
/// outlive the program so buffered lines are flushed.
fn init_logging(verbosity: u8, log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

// ============================================================================
// DECODERS
// ============================================================================

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let cleaned = cleaned.trim_start_matches("0x");
    hex::decode(cleaned).with_context(|| format!("Invalid hex: {}", text))
}

/// Accepts `2A19`, `0x2a19`, a 32-bit alias or the full hyphenated form.
fn parse_uuid(text: &str) -> Result<Uuid> {
    let trimmed = text.trim().trim_start_matches("0x");
    if trimmed.len() <= 8 {
        let short = u32::from_str_radix(trimmed, 16)
            .with_context(|| format!("Invalid UUID alias: {}", text))?;
        return Ok(match u16::try_from(short) {
            Ok(short) => uuid_from_u16(short),
            Err(_) => uuid_from_u32(short),
        });
    }
    Uuid::parse_str(trimmed).with_context(|| format!("Invalid UUID: {}", text))
}

fn cmd_adv(text: &str, json: bool) -> Result<()> {
    let record = parse_advertisement(&decode_hex(text)?);
    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!("{}", "Advertisement".bold());
    println!(
        "  Name:         {}",
        record.device_name.as_deref().unwrap_or("-").bright_cyan()
    );
    match record.tx_power_level {
        Some(level) => println!("  TX power:     {} dBm", level),
        None => println!("  TX power:     -"),
    }
    for uuid in &record.service_uuids {
        println!("  Service:      {} ({})", uuid, short_text(uuid).dimmed());
    }
    for (company, data) in &record.manufacturer_data {
        println!("  Manufacturer: 0x{:04X} {}", company, hex::encode(data));
    }
    for (uuid, data) in &record.service_data {
        println!("  Data:         {} {}", short_text(uuid), hex::encode(data));
    }
    Ok(())
}

fn cmd_hr(text: &str, json: bool) -> Result<()> {
    let measurement =
        decode_heart_rate(&decode_hex(text)?).context("Not a valid heart-rate measurement")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&measurement)?);
        return Ok(());
    }

    println!("{}", "Heart Rate".bold());
    println!("  BPM:      {}", measurement.bpm.to_string().bright_red().bold());
    println!(
        "  Format:   {}",
        if measurement.wide_format { "u16" } else { "u8" }
    );
    println!("  Contact:  {:?}", measurement.sensor_contact);
    if let Some(energy) = measurement.energy_expended_kj {
        println!("  Energy:   {} kJ", energy);
    }
    if !measurement.rr_intervals_ms.is_empty() {
        let intervals: Vec<String> = measurement
            .rr_intervals_ms
            .iter()
            .map(|ms| format!("{:.1}", ms))
            .collect();
        println!("  RR (ms):  {}", intervals.join(", "));
    }
    Ok(())
}

fn cmd_identify(text: &str, value: Option<&str>) -> Result<()> {
    let uuid = parse_uuid(text)?;
    println!("{}", "Characteristic".bold());
    println!("  UUID:     {}", uuid);
    println!("  Short:    {}", short_text(&uuid));
    println!("  Feature:  {}", Feature::identify(&uuid).to_string().bright_cyan());

    if let Some(value) = value {
        let bytes = decode_hex(value)?;
        match decode_known(&uuid, &bytes) {
            Some(known) => println!("  Value:    {}", render_known(&known).green()),
            None => println!("  Value:    {} {}", hex::encode(&bytes), "(not decoded)".dimmed()),
        }
    }
    Ok(())
}

// ============================================================================
// SIMULATION
// ============================================================================

async fn cmd_simulate(beats: u8, guarded: bool) -> Result<()> {
    let config = config::Config::load()?;
    let host = Arc::new(SimulatedHost::heart_rate_sensor());
    let manager = BleManager::new(
        host.clone(),
        Arc::new(SimulatedScanBackend::new()),
        config.scan_config(),
    );

    let mut session = config.session_config(SIMULATED_ADDRESS)?;
    session.enable_guarded_reconnect = guarded;
    session.reconnect_interval_ms = 500;
    let device = manager.get_or_create_device(session)?;
    device.register_observer(Arc::new(print_event));

    println!("{}", "Simulated heart-rate strap".bold());
    println!();
    device.connect()?;
    wait_ready(&device, Duration::from_secs(5)).await?;
    print_characteristics(&device.characteristics());

    for characteristic in [MANUFACTURER_NAME, MODEL_NUMBER, FIRMWARE_REVISION, BATTERY_LEVEL] {
        read_and_wait(&device, characteristic).await?;
    }

    for beat in 0..beats {
        let bpm = 64u8.saturating_add(beat.saturating_mul(3));
        let rr = (60_000u32 / bpm as u32 * 1024 / 1000) as u16;
        let mut payload = vec![0x16, bpm];
        payload.extend_from_slice(&rr.to_le_bytes());
        if !host.notify(HEART_RATE_MEASUREMENT, payload) {
            anyhow::bail!("Simulated link is down");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    if guarded {
        println!();
        println!("{}", "Dropping the link...".yellow());
        host.drop_link(0x08);
        device
            .wait_for_state(ConnectionState::Disconnected)
            .await
            .context("Session closed")?;
        wait_ready(&device, Duration::from_secs(10)).await?;
        println!("  {} Guardian restored the link", "✓".green());
    }

    let status = device.status().await?;
    println!();
    println!("{}", "Status".bold());
    println!("{}", serde_json::to_string_pretty(&status)?);

    manager.remove_all_devices().await;
    Ok(())
}

async fn read_and_wait(device: &BleDevice, characteristic: Uuid) -> Result<()> {
    let (done, finished) = oneshot::channel();
    device.read_with(characteristic, move |success| {
        let _ = done.send(success);
    })?;
    let success = tokio::time::timeout(Duration::from_secs(10), finished)
        .await
        .context("Read timed out")?
        .context("Session closed")?;
    if !success {
        anyhow::bail!("Read of {} failed", short_text(&characteristic));
    }
    Ok(())
}

async fn wait_ready(device: &BleDevice, limit: Duration) -> Result<()> {
    tokio::time::timeout(limit, device.wait_for_state(ConnectionState::Ready))
        .await
        .with_context(|| format!("{} did not become ready", device.address()))?
        .context("Session closed")
}

// ============================================================================
// CONFIG
// ============================================================================

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            match config.get(&key) {
                Some(value) => println!("{}", value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }
        ConfigAction::List => {
            let config = config::Config::load()?;
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:24} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => {
            println!("{}", config::Config::config_file()?.display());
        }
        ConfigAction::Reset => {
            config::Config::default().save()?;
            println!("{} Configuration reset", "✓".green());
        }
    }
    Ok(())
}

// ============================================================================
// HARDWARE
// ============================================================================

/// Prints each address once, with its name when the advertisement has one.
struct ScanPrinter {
    seen: parking_lot::Mutex<HashSet<String>>,
}

impl ScanListener for ScanPrinter {
    fn on_device(&self, address: &str, rssi: i16, advertisement: &[u8]) {
        if !self.seen.lock().insert(address.to_string()) {
            return;
        }
        let record = parse_advertisement(advertisement);
        let services: Vec<String> = record.service_uuids.iter().map(short_text).collect();
        println!(
            "  {}  {:>4} dBm  {:20} {}",
            address.bright_cyan(),
            rssi,
            record.device_name.as_deref().unwrap_or("-"),
            services.join(" ").dimmed()
        );
    }
}

/// Signals the first sighting of one address.
struct TargetWatch {
    target: DeviceAddress,
    found: mpsc::UnboundedSender<i16>,
}

impl ScanListener for TargetWatch {
    fn on_device(&self, address: &str, rssi: i16, _advertisement: &[u8]) {
        if self.target.matches(address) {
            let _ = self.found.send(rssi);
        }
    }
}

async fn open_hardware(config: &config::Config) -> Result<(btle::BtleStack, BleManager)> {
    let stack = btle::BtleStack::open().await?;
    let manager = BleManager::new(
        stack.host.clone(),
        stack.scan.clone(),
        config.scan_config(),
    );
    stack.scan.attach(manager.scanner().clone());
    Ok((stack, manager))
}

async fn cmd_scan(seconds: u64) -> Result<()> {
    let config = config::Config::load()?;
    let (_stack, manager) = open_hardware(&config).await?;

    println!("{}", format!("Scanning for {} s...", seconds).bold());
    let listener: Arc<dyn ScanListener> = Arc::new(ScanPrinter {
        seen: parking_lot::Mutex::new(HashSet::new()),
    });
    manager.scanner().start_scan(Arc::clone(&listener))?;
    tokio::time::sleep(Duration::from_secs(seconds)).await;
    manager.scanner().stop_scan(&listener);

    let status = manager.scanner().status().await?;
    println!();
    println!("  Scan windows started: {}", status.scan_starts);
    Ok(())
}

async fn cmd_connect(address: &str, reads: &[String], listen: u64) -> Result<()> {
    let config = config::Config::load()?;
    let session = config.session_config(address)?;
    let reads = reads
        .iter()
        .map(|text| parse_uuid(text))
        .collect::<Result<Vec<_>>>()?;
    let (_stack, manager) = open_hardware(&config).await?;

    // The adapter only connects to peripherals a scan has reported.
    println!("{} {}...", "Looking for".bold(), session.address);
    let (found, mut sightings) = mpsc::unbounded_channel();
    let watch: Arc<dyn ScanListener> = Arc::new(TargetWatch {
        target: session.address.clone(),
        found,
    });
    manager.scanner().start_scan(Arc::clone(&watch))?;
    let sighting = tokio::time::timeout(
        Duration::from_millis(session.connection_timeout_ms),
        sightings.recv(),
    )
    .await;
    manager.scanner().stop_scan(&watch);
    match sighting {
        Ok(Some(rssi)) => println!("  {} Found at {} dBm", "✓".green(), rssi),
        _ => anyhow::bail!("{} was not seen", session.address),
    }

    let limit = Duration::from_millis(session.connection_timeout_ms) * 2;
    let device = manager.get_or_create_device(session)?;
    device.register_observer(Arc::new(print_event));
    device.connect()?;
    wait_ready(&device, limit).await?;
    print_characteristics(&device.characteristics());

    for characteristic in reads {
        read_and_wait(&device, characteristic).await?;
    }
    if listen > 0 {
        println!("{}", format!("Listening for {} s...", listen).dimmed());
        tokio::time::sleep(Duration::from_secs(listen)).await;
    }

    device.disconnect()?;
    tokio::time::timeout(
        Duration::from_secs(5),
        device.wait_for_state(ConnectionState::Disconnected),
    )
    .await
    .ok();
    manager.remove_all_devices().await;
    Ok(())
}

// ============================================================================
// OUTPUT
// ============================================================================

fn render_known(value: &KnownValue) -> String {
    match value {
        KnownValue::BatteryLevel(level) => format!("{}%", level),
        KnownValue::Text(text) => text.clone(),
        KnownValue::SystemId(id) => id.clone(),
        KnownValue::HeartRate(measurement) => {
            let mut text = format!("{} bpm", measurement.bpm);
            if !measurement.rr_intervals_ms.is_empty() {
                let intervals: Vec<String> = measurement
                    .rr_intervals_ms
                    .iter()
                    .map(|ms| format!("{:.0}", ms))
                    .collect();
                text.push_str(&format!(" (RR {} ms)", intervals.join("/")));
            }
            text
        }
    }
}

fn describe_value(characteristic: &Uuid, value: &[u8]) -> String {
    match decode_known(characteristic, value) {
        Some(known) => render_known(&known),
        None => hex::encode(value),
    }
}

fn print_characteristics(characteristics: &[CharacteristicDescriptor]) {
    println!("{}", "Characteristics".bold());
    for descriptor in characteristics {
        let mut flags = Vec::new();
        if descriptor.can_read {
            flags.push("read");
        }
        if descriptor.can_write {
            flags.push("write");
        }
        if descriptor.can_write_no_response {
            flags.push("write-nr");
        }
        if descriptor.can_notify {
            flags.push("notify");
        }
        if descriptor.can_indicate {
            flags.push("indicate");
        }
        println!(
            "  {} {:24} {}",
            short_text(&descriptor.uuid).bright_cyan(),
            Feature::identify(&descriptor.uuid).to_string(),
            flags.join(",").dimmed()
        );
    }
    println!();
}

fn print_event(address: &DeviceAddress, event: &SessionEvent) {
    let prefix = format!("[{}]", address).dimmed();
    match event {
        SessionEvent::StateChanged { state, .. } => {
            let state = match state {
                ConnectionState::Ready => state.to_string().green().bold(),
                ConnectionState::Disconnected => state.to_string().red(),
                _ => state.to_string().yellow(),
            };
            println!("{} state {}", prefix, state);
        }
        SessionEvent::Disconnected { reason, status, .. } => {
            println!("{} disconnected: {:?} (status {})", prefix, reason, status);
        }
        SessionEvent::ServicesDiscovered(found) => {
            println!("{} {} characteristics discovered", prefix, found.len());
        }
        SessionEvent::MtuChanged(mtu) => println!("{} MTU {}", prefix, mtu),
        SessionEvent::Notification {
            characteristic,
            value,
        } => {
            println!(
                "{} {} {}",
                prefix,
                short_text(characteristic).bright_cyan(),
                describe_value(characteristic, value)
            );
        }
        SessionEvent::ReadComplete {
            characteristic,
            value: Some(value),
            success: true,
        } => {
            println!(
                "{} {} = {}",
                prefix,
                Feature::identify(characteristic),
                describe_value(characteristic, value).green()
            );
        }
        SessionEvent::ReadComplete { characteristic, .. } => {
            println!("{} read of {} failed", prefix, short_text(characteristic).red());
        }
        SessionEvent::WriteComplete {
            characteristic,
            success,
        } => {
            let outcome = if *success { "ok".green() } else { "failed".red() };
            println!("{} write {} {}", prefix, short_text(characteristic), outcome);
        }
        SessionEvent::NotificationEnabled {
            characteristic,
            enabled,
            success,
        } => {
            let verb = if *enabled { "subscribed" } else { "unsubscribed" };
            let outcome = if *success { "".normal() } else { " (failed)".red() };
            println!("{} {} {}{}", prefix, verb, short_text(characteristic), outcome);
        }
        SessionEvent::Error(error) => {
            println!("{} {} {}", prefix, "error:".red().bold(), error);
        }
        SessionEvent::RadioAvailabilityChanged(enabled) => {
            println!("{} radio {}", prefix, if *enabled { "on" } else { "off" });
        }
    }
}
