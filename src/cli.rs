//! Command-line interface definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use relayvisor::logging::LogFormat;
use relayvisor::worker::worker_main::WorkerMode;

/// Keep a pool of external worker processes warm and route work to them.
#[derive(Parser, Debug)]
#[command(name = "relayvisor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(
        short,
        long,
        global = true,
        env = "RELAYVISOR_CONFIG",
        default_value = "relayvisor.json"
    )]
    pub config: PathBuf,

    /// Increase log verbosity (-v for info, -vv for debug).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormatArg>,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the worker pool, HTTP gateway and RPC listener.
    Serve,

    /// Validate the configuration file and exit.
    Check,

    /// Run one job through a freshly started pool and print the reply body.
    Exec(ExecArgs),

    /// List the workers of a running server (via RPC).
    Workers(RemoteArgs),

    /// Replace every worker of a running server (via RPC).
    Reset(RemoteArgs),

    /// Reference worker used by tests and demos.
    #[command(hide = true)]
    InternalWorker(InternalWorkerArgs),
}

/// Arguments for the exec command.
#[derive(Parser, Debug)]
pub struct ExecArgs {
    /// Job body.
    pub body: String,

    /// Job context, usually JSON.
    #[arg(long, default_value = "")]
    pub context: String,
}

/// Arguments for commands that talk to a running server.
#[derive(Parser, Debug)]
pub struct RemoteArgs {
    /// RPC address; defaults to `rpc.listen` from the configuration.
    #[arg(long)]
    pub rpc: Option<String>,

    /// Print raw JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the internal worker.
#[derive(Parser, Debug)]
pub struct InternalWorkerArgs {
    #[arg(long, value_enum, default_value_t = WorkerMode::Echo)]
    pub mode: WorkerMode,

    /// Delay used by the slow mode.
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,
}

/// Log format argument (maps to LogFormat).
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}
