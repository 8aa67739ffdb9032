//! Command-line interface definitions for the `pstorage` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, Subcommand};

/// Top-level CLI for the `pstorage` binary.
#[derive(Debug, Parser)]
#[command(
    name = "pstorage",
    about = "Operate the persistent volume engine: locks, node commands and drive names",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Inspect or break named locks.
    #[command(name = "lock", subcommand)]
    Lock(LockCommand),
    /// Run a shell command on a node.
    #[command(name = "exec", about = "Run a shell command on a node over SSH")]
    Exec(ExecCommand),
    /// Print the drive name of a volume.
    #[command(name = "drive-name", about = "Print the backend drive name of a volume")]
    DriveName(DriveNameCommand),
}

/// Operator actions on named locks.
#[derive(Debug, Subcommand)]
pub(crate) enum LockCommand {
    /// Show who holds a lock.
    #[command(name = "inspect", about = "Show the operation holding a lock")]
    Inspect {
        /// Lock key without the store prefix, for example `pod.<id>`.
        key: String,
    },
    /// Remove a lock regardless of its holder.
    #[command(name = "break", about = "Remove a lock regardless of its holder")]
    Break {
        /// Lock key without the store prefix.
        key: String,
    },
}

/// Arguments for the `pstorage exec` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ExecCommand {
    /// Timeout in seconds; defaults to the configured node command timeout.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Node address or host name.
    pub(crate) host: String,
    /// Command to execute on the node (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `pstorage drive-name` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct DriveNameCommand {
    /// Backend to compose the name for; defaults to the configured backend.
    #[arg(long, value_name = "KIND")]
    pub(crate) backend: Option<String>,
    /// Namespace prefix for network backends.
    #[arg(long, value_name = "NAMESPACE")]
    pub(crate) namespace: Option<String>,
    /// Owner id.
    pub(crate) owner_id: u64,
    /// Volume name.
    pub(crate) name: String,
}
