use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod context;
pub mod deploy;
pub mod security;
pub mod service;
pub mod setup;
pub mod troubleshoot;

#[derive(Parser)]
#[command(name = "berth", version, about = "SSH-based remote execution and deployment engine")]
pub struct Cli {
    /// Path to berth.toml
    #[arg(short, long, default_value = "berth.toml")]
    pub config: PathBuf,

    /// Directory release artifact zips are read from
    #[arg(long, default_value = "./artifacts")]
    pub artifacts_dir: PathBuf,

    /// Directory used to stage downloaded/extracted artifacts locally
    #[arg(long, default_value = "./.berth-stage")]
    pub stage_dir: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Span/event exporter: human-readable console lines or newline-delimited JSON
    #[arg(long, value_enum, default_value_t = LogFormat::Console)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum LogFormat {
    Console,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run connectivity/auth/sudo/clock-skew diagnostics against the target host
    Troubleshoot,

    /// Create the app user, authorize keys, provision directories, install packages, configure sudoers
    Setup {
        /// Path to a public key file to add to the app user's authorized_keys (may repeat)
        #[arg(long = "authorized-key")]
        authorized_keys: Vec<PathBuf>,
    },

    /// Firewall, fail2ban, sshd hardening, unattended upgrades
    Security {
        #[command(subcommand)]
        action: SecurityAction,
    },

    /// systemd service lifecycle and status for the configured app
    Service {
        #[command(subcommand)]
        action: ServiceAction,
    },

    /// First-deploy / update / rollback for the configured app
    Deploy {
        #[command(subcommand)]
        action: DeployAction,
    },
}

#[derive(Subcommand)]
pub enum SecurityAction {
    /// Apply the desired firewall/fail2ban/sshd/unattended-upgrades configuration
    Apply,
    /// Compare realized host state against the desired configuration without changing anything
    Audit,
}

#[derive(Subcommand)]
pub enum ServiceAction {
    /// Report the current ActiveState/SubState/PID/memory
    Status,
    /// Tail the unit's journal
    Logs {
        #[arg(short = 'n', long, default_value = "100")]
        lines: u32,
    },
    Start,
    Stop,
    Restart,
}

#[derive(Subcommand)]
pub enum DeployAction {
    /// Deploy a version to a host that has never run this app before
    First {
        /// Release version identifier, e.g. "2026.07.28-1"
        version: String,
        /// Artifact zip filename, resolved under --artifacts-dir
        artifact: String,
        /// Create an initial superuser with this email (prompts for password)
        #[arg(long)]
        bootstrap_email: Option<String>,
    },
    /// Replace the running version with a new one, with automatic rollback on failure
    Update {
        version: String,
        artifact: String,
    },
    /// Roll back to a previously deployed version
    Rollback {
        version: String,
        artifact: String,
    },
}
