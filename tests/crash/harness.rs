//! Crash test harness for subprocess management
//!
//! Every run spawns the real samwal binary. A crash point aborts it without
//! unwinding, so whatever reached the files before the abort is exactly
//! what the next mount sees.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use serde_json::{json, Value};
use tempfile::TempDir;

/// Map block size used by every crash workspace.
pub const BLOCK_SIZE: u64 = 8192;

/// Bytes written per exercise transaction.
pub const WRITE_LEN: usize = 512;

/// Result of one samwal invocation
#[derive(Debug)]
pub struct CrashTestResult {
    /// Whether the process exited unsuccessfully
    pub crashed: bool,
    /// Exit status if the process could be started
    pub exit_status: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
}

impl CrashTestResult {
    /// The `data` object of the JSON response on stdout.
    pub fn data(&self) -> Value {
        let line = self.stdout.lines().last().unwrap_or("{}");
        let response: Value = serde_json::from_str(line).expect("stdout is not JSON");
        assert_eq!(response["status"], "ok", "command failed: {}", self.stdout);
        response["data"].clone()
    }
}

/// Scratch directory holding one log and one master.
pub struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    /// Workspace whose roll engine thread never starts; rolling only
    /// happens during unmount.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = dir.path().join("samwal.json");
        let body = json!({
            "log_path": dir.path().join("log").to_string_lossy(),
            "log_size": 1 << 20,
            "masters": [dir.path().join("master0").to_string_lossy()],
            "master_size": 1 << 20,
            "log": {
                "map_block_size": BLOCK_SIZE,
                "no_roll": true
            }
        });
        fs::write(&config, serde_json::to_string_pretty(&body).unwrap())
            .expect("Failed to write config");
        Self { dir, config }
    }

    pub fn config(&self) -> &Path {
        &self.config
    }

    pub fn master_path(&self) -> PathBuf {
        self.dir.path().join("master0")
    }

    /// `WRITE_LEN` bytes at the start of map block `block` of the master.
    pub fn master_block(&self, block: u64) -> Vec<u8> {
        let bytes = fs::read(self.master_path()).expect("Failed to read master");
        let start = (block * BLOCK_SIZE) as usize;
        bytes[start..start + WRITE_LEN].to_vec()
    }

    /// Run `samwal <command> --config <config> <extra...>`.
    pub fn run(&self, command: &str, extra: &[&str], crash_point: Option<&str>) -> CrashTestResult {
        let config = self.config.to_string_lossy().to_string();
        let mut args = vec![command, "--config", config.as_str()];
        args.extend_from_slice(extra);
        execute_with_crash_point(crash_point, &args)
    }
}

/// Execute the samwal binary, with `SAMWAL_CRASH_POINT` set when given.
pub fn execute_with_crash_point(crash_point: Option<&str>, args: &[&str]) -> CrashTestResult {
    let mut command = Command::new(env!("CARGO_BIN_EXE_samwal"));
    command.args(args).env("SAMWAL_LOG_LEVEL", "error");
    match crash_point {
        Some(point) => command.env("SAMWAL_CRASH_POINT", point),
        None => command.env_remove("SAMWAL_CRASH_POINT"),
    };

    match command.output() {
        Ok(output) => CrashTestResult {
            crashed: !output.status.success(),
            exit_status: Some(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => CrashTestResult {
            crashed: true,
            exit_status: None,
            stdout: String::new(),
            stderr: format!("Failed to execute: {}", e),
        },
    }
}

/// Report crash test failure
pub fn report_failure(crash_point: &str, expected: &str, result: &CrashTestResult) {
    eprintln!("=== CRASH TEST FAILURE ===");
    eprintln!("Crash point: {}", crash_point);
    eprintln!("Expected: {}", expected);
    eprintln!("stdout:\n{}", result.stdout);
    eprintln!("stderr:\n{}", result.stderr);
    eprintln!("==========================");
}
