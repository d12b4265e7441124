//! CLI argument definitions using clap
//!
//! Commands:
//! - samwal format --config <path>
//! - samwal inspect --config <path>
//! - samwal recover --config <path>
//! - samwal exercise --config <path> --transactions <n>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// samwal - transactional metadata log with background rolling
#[derive(Parser, Debug)]
#[command(name = "samwal")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the log and master files and write a fresh log header
    Format {
        /// Path to configuration file
        #[arg(long, default_value = "./samwal.json")]
        config: PathBuf,
    },

    /// Print the log header and the committed epochs still on the log
    Inspect {
        /// Path to configuration file
        #[arg(long, default_value = "./samwal.json")]
        config: PathBuf,
    },

    /// Mount (replaying the log), then unmount cleanly
    Recover {
        /// Path to configuration file
        #[arg(long, default_value = "./samwal.json")]
        config: PathBuf,
    },

    /// Run a scripted synchronous workload
    Exercise {
        /// Path to configuration file
        #[arg(long, default_value = "./samwal.json")]
        config: PathBuf,

        /// Number of transactions to commit
        #[arg(long, default_value_t = 16)]
        transactions: u64,

        /// Leave committed epochs on the log instead of unmounting
        #[arg(long)]
        keep_log: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
