//! CLI command implementations
//!
//! Each command loads the configuration, opens the devices it names and
//! prints one JSON response. Nothing is kept running between commands.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::device::{BlockDevice, FileDevice, MasterSet};
use crate::log::{
    scan_log, DeltaKind, DeltaPayload, DeltaRange, LogConfig, LogHeader, LogUnit, SyncMode,
    TransactionContext, HEADER_SIZE,
};

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::write_response;

/// Bytes written by each exercise transaction.
const EXERCISE_WRITE_LEN: usize = 512;

/// Reservation requested by each exercise transaction.
const EXERCISE_RESERVATION: u64 = 1024;

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log device path (required)
    pub log_path: String,

    /// Log device size in bytes (optional, default 4MB)
    #[serde(default = "default_log_size")]
    pub log_size: u64,

    /// Master device paths, in ordinal order (required, non-empty)
    pub masters: Vec<String>,

    /// Size of newly created master devices (optional, default 16MB)
    #[serde(default = "default_master_size")]
    pub master_size: u64,

    /// Log unit tunables
    #[serde(default)]
    pub log: LogConfig,
}

fn default_log_size() -> u64 {
    4 * 1024 * 1024
}
fn default_master_size() -> u64 {
    16 * 1024 * 1024
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> CliResult<()> {
        if self.log_path.is_empty() {
            return Err(CliError::config_error("log_path must not be empty"));
        }

        if self.masters.is_empty() {
            return Err(CliError::config_error("at least one master device is required"));
        }

        if self.masters.len() > u8::MAX as usize + 1 {
            return Err(CliError::config_error(format!(
                "too many master devices: {} (max {})",
                self.masters.len(),
                u8::MAX as usize + 1
            )));
        }

        if self.master_size == 0 {
            return Err(CliError::config_error("master_size must be > 0"));
        }

        self.log
            .validate()
            .map_err(|e| CliError::config_error(format!("Log config error: {}", e.message())))?;

        Ok(())
    }

    fn open_log(&self) -> CliResult<Arc<dyn BlockDevice>> {
        let path = Path::new(&self.log_path);
        if !path.exists() {
            return Err(CliError::io_error(format!(
                "log device {} does not exist; run format first",
                self.log_path
            )));
        }
        Ok(Arc::new(FileDevice::open(path)?))
    }

    fn open_masters(&self) -> CliResult<MasterSet> {
        let mut devices: Vec<Arc<dyn BlockDevice>> = Vec::with_capacity(self.masters.len());
        for master in &self.masters {
            let path = Path::new(master);
            if !path.exists() {
                return Err(CliError::io_error(format!(
                    "master device {} does not exist; run format first",
                    master
                )));
            }
            devices.push(Arc::new(FileDevice::open(path)?));
        }
        Ok(MasterSet::new(devices))
    }
}

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Format { config } => format(&config),
        Command::Inspect { config } => inspect(&config),
        Command::Recover { config } => recover(&config),
        Command::Exercise {
            config,
            transactions,
            keep_log,
        } => exercise(&config, transactions, keep_log),
    }
}

/// Create the log and any missing master devices, then write a fresh
/// log header.
///
/// Existing master files are left untouched; the log is always recreated.
pub fn format(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;

    let log: Arc<dyn BlockDevice> =
        Arc::new(FileDevice::create(Path::new(&config.log_path), config.log_size)?);

    let mut created = Vec::new();
    for master in &config.masters {
        let path = Path::new(master);
        if !path.exists() {
            FileDevice::create(path, config.master_size)?;
            created.push(master.clone());
        }
    }

    let header = LogUnit::format(log, config.log_size, &config.log)?;

    write_response(json!({
        "formatted": true,
        "header": header,
        "masters_created": created,
    }))?;

    Ok(())
}

/// Print the header and every committed epoch still on the log.
///
/// Read-only: nothing is replayed and the header is not rewritten.
pub fn inspect(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let log = config.open_log()?;

    let mut raw = vec![0u8; HEADER_SIZE as usize];
    log.read_at(0, &mut raw)
        .map_err(|e| CliError::io_error(format!("Failed to read log header: {}", e)))?;
    let header = LogHeader::decode(&raw)?;

    let scan = scan_log(&log, &header)?;
    let epochs: Vec<Value> = scan
        .epochs
        .iter()
        .map(|epoch| {
            json!({
                "tid": epoch.tid,
                "start_lsn": epoch.start_lsn,
                "commit_lsn": epoch.commit_lsn,
                "deltas": epoch.deltas.iter().map(|d| json!({
                    "lsn": d.lsn,
                    "range": d.range.to_string(),
                    "kind": d.kind.name(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    write_response(json!({
        "header": header,
        "epochs": epochs,
        "tail_lsn": scan.tail,
        "discarded": scan.discarded,
        "max_tid": scan.max_tid,
        "stop": scan.stop.map(|s| format!("{:?}", s)),
    }))?;

    Ok(())
}

/// Mount the log, which replays it onto the masters, then unmount.
pub fn recover(config_path: &Path) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let log = config.open_log()?;
    let masters = config.open_masters()?;

    let unit = LogUnit::mount(log, masters, config.log.clone())?;
    let report = unit.recovery_report().clone();
    unit.unmount()?;

    write_response(json!({
        "recovered": true,
        "report": report,
    }))?;

    Ok(())
}

/// Commit `transactions` synchronous transactions against master 0.
///
/// Transaction `i` writes `EXERCISE_WRITE_LEN` bytes of `i % 250 + 1` at
/// the start of map block `i`. Every write is read back through the log
/// before the next transaction begins. With `keep_log` the unit is dropped
/// without unmounting, leaving unrolled epochs for the next mount.
pub fn exercise(config_path: &Path, transactions: u64, keep_log: bool) -> CliResult<()> {
    let config = Config::load(config_path)?;
    let log = config.open_log()?;
    let masters = config.open_masters()?;
    let block_size = config.log.map_block_size;

    let unit = LogUnit::mount(log, masters, config.log.clone())?;

    let mut verified = 0u64;
    for i in 0..transactions {
        let fill = (i % 250 + 1) as u8;
        let range = DeltaRange::new(0, i * block_size, EXERCISE_WRITE_LEN as u64);

        let mut ctx = TransactionContext::new();
        unit.begin_sync(&mut ctx, SyncMode::Normal, EXERCISE_RESERVATION)?;
        unit.declare_delta(
            &mut ctx,
            range,
            DeltaKind::Inode,
            DeltaPayload::Bytes(vec![fill; EXERCISE_WRITE_LEN]),
        )?;
        unit.end_sync(&mut ctx)?;

        let back = unit.read(0, range.offset, EXERCISE_WRITE_LEN)?;
        if back.iter().any(|b| *b != fill) {
            return Err(CliError::log_failed(format!(
                "read back of transaction {} does not match what was committed",
                i
            )));
        }
        verified += 1;
    }

    let coordinator = unit.coordinator_snapshot();
    let metrics = unit.metrics().snapshot();

    if keep_log {
        drop(unit);
    } else {
        unit.unmount()?;
    }

    write_response(json!({
        "transactions": transactions,
        "verified": verified,
        "unmounted": !keep_log,
        "coordinator": coordinator,
        "metrics": metrics,
    }))?;

    Ok(())
}
