//! Remote command execution on cluster nodes.
//!
//! Every storage backend drives its node-side work through a
//! [`RemoteExecutor`]. The executor wraps the system `ssh` client (or a local
//! `sh -c` for single-host setups and tests), enforces a per-command timeout,
//! and classifies the exit status. Exit codes listed as "allowed" by the caller
//! surface as [`NodeCommandError::WrongExitCode`], a recognised negative
//! result, so callers can treat "not found" style answers as data rather than
//! faults. Nothing here retries.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backend::BackendFuture;

/// Default timeout applied to node commands.
pub const NODE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Exit status reported by `ssh` itself when the connection fails.
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised by a [`CommandRunner`] before an exit status is available.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the command outlives its timeout. The child is killed.
    #[error("{program} did not finish within {timeout:?}")]
    Timeout {
        /// Command that timed out.
        program: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started and
    /// [`RunnerError::Timeout`] when it does not finish in time.
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        timeout: Duration,
    ) -> BackendFuture<'a, CommandOutput, RunnerError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run<'a>(
        &'a self,
        program: &'a str,
        args: &'a [OsString],
        limit: Duration,
    ) -> BackendFuture<'a, CommandOutput, RunnerError> {
        Box::pin(async move {
            let mut command = Command::new(program);
            command
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true);

            let output = match timeout(limit, command.output()).await {
                Ok(result) => result.map_err(|err| RunnerError::Spawn {
                    program: program.to_owned(),
                    message: err.to_string(),
                })?,
                Err(_) => {
                    return Err(RunnerError::Timeout {
                        program: program.to_owned(),
                        timeout: limit,
                    });
                }
            };

            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Options for reaching nodes over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshOptions {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user to connect as.
    pub user: String,
    /// TCP port of the SSH daemon.
    pub port: u16,
    /// Optional private key passed with `-i`.
    pub identity_file: Option<Utf8PathBuf>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from("root"),
            port: 22,
            identity_file: None,
        }
    }
}

/// How commands reach their target host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Transport {
    /// Run through the system `ssh` client.
    Ssh(SshOptions),
    /// Run through `sh -c` on the local machine, ignoring the host name.
    LocalShell,
}

/// Errors surfaced by node command execution.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NodeCommandError {
    /// Raised when the node cannot be reached or the command cannot start.
    #[error("failed to reach {host}: {message}")]
    Unreachable {
        /// Target host.
        host: String,
        /// Transport error message.
        message: String,
    },
    /// Raised when the command exceeds its timeout.
    #[error("timeout reached after {timeout_secs}s while executing `{command}` on {host}")]
    Timeout {
        /// Target host.
        host: String,
        /// Command that was executed.
        command: String,
        /// Timeout that elapsed, in seconds.
        timeout_secs: u64,
    },
    /// Raised when the command exits with an unexpected status.
    #[error("remote command `{command}` on {host} failed (exit code = {status_text}): {stderr}")]
    Failed {
        /// Target host.
        host: String,
        /// Command that was executed.
        command: String,
        /// Exit code, when the process reported one.
        code: Option<i32>,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the command.
        stderr: String,
    },
    /// Raised when the command exits with a code the caller listed as
    /// expected. This is a normal negative answer, not a fault.
    #[error("remote command `{command}` on {host} exited with code {code}")]
    WrongExitCode {
        /// Target host.
        host: String,
        /// Command that was executed.
        command: String,
        /// Exit code reported by the command.
        code: i32,
    },
    /// Raised when the command output is not the expected JSON document.
    #[error("invalid json output of `{command}` on {host}: {message}")]
    InvalidJson {
        /// Target host.
        host: String,
        /// Command that was executed.
        command: String,
        /// Parser error message.
        message: String,
    },
}

impl NodeCommandError {
    /// Returns the exit code when this error is a recognised outcome.
    #[must_use]
    pub const fn recognized_code(&self) -> Option<i32> {
        match self {
            Self::WrongExitCode { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns `true` for recognised, caller-expected exit codes.
    #[must_use]
    pub const fn is_recognized(&self) -> bool {
        self.recognized_code().is_some()
    }
}

/// Runs commands on named hosts and classifies the outcome.
#[derive(Debug)]
pub struct RemoteExecutor<R: CommandRunner> {
    transport: Transport,
    default_timeout: Duration,
    runner: R,
}

impl RemoteExecutor<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    #[must_use]
    pub const fn with_process_runner(transport: Transport, default_timeout: Duration) -> Self {
        Self::new(transport, default_timeout, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteExecutor<R> {
    /// Creates an executor using the provided runner.
    #[must_use]
    pub const fn new(transport: Transport, default_timeout: Duration, runner: R) -> Self {
        Self {
            transport,
            default_timeout,
            runner,
        }
    }

    /// Timeout used by [`RemoteExecutor::run_default`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs `command` with the default timeout and no allowed exit codes.
    ///
    /// # Errors
    ///
    /// See [`RemoteExecutor::run`].
    pub async fn run_default(&self, host: &str, command: &str) -> Result<String, NodeCommandError> {
        self.run(host, command, self.default_timeout, &[]).await
    }

    /// Executes `command` on `host` and returns its standard output.
    ///
    /// # Errors
    ///
    /// Returns [`NodeCommandError::WrongExitCode`] when the command exits with
    /// one of `allowed_exit_codes`, [`NodeCommandError::Timeout`] when the
    /// timeout elapses, and [`NodeCommandError::Failed`] or
    /// [`NodeCommandError::Unreachable`] for every other failure.
    pub async fn run(
        &self,
        host: &str,
        command: &str,
        limit: Duration,
        allowed_exit_codes: &[i32],
    ) -> Result<String, NodeCommandError> {
        let (program, args) = self.build_invocation(host, command);
        debug!(host, command, timeout_secs = limit.as_secs(), "running node command");

        let output = self
            .runner
            .run(&program, &args, limit)
            .await
            .map_err(|err| match err {
                RunnerError::Spawn { message, .. } => NodeCommandError::Unreachable {
                    host: host.to_owned(),
                    message,
                },
                RunnerError::Timeout { timeout, .. } => NodeCommandError::Timeout {
                    host: host.to_owned(),
                    command: command.to_owned(),
                    timeout_secs: timeout.as_secs(),
                },
            })?;

        self.classify(host, command, output, allowed_exit_codes)
    }

    /// Executes `command` and parses its standard output as JSON.
    ///
    /// # Errors
    ///
    /// Returns any error from [`RemoteExecutor::run`], or
    /// [`NodeCommandError::InvalidJson`] when parsing fails.
    pub async fn run_json<T: DeserializeOwned>(
        &self,
        host: &str,
        command: &str,
        limit: Duration,
        allowed_exit_codes: &[i32],
    ) -> Result<T, NodeCommandError> {
        let stdout = self.run(host, command, limit, allowed_exit_codes).await?;
        serde_json::from_str(&stdout).map_err(|err| NodeCommandError::InvalidJson {
            host: host.to_owned(),
            command: command.to_owned(),
            message: err.to_string(),
        })
    }

    fn classify(
        &self,
        host: &str,
        command: &str,
        output: CommandOutput,
        allowed_exit_codes: &[i32],
    ) -> Result<String, NodeCommandError> {
        match output.code {
            Some(0) => Ok(output.stdout),
            Some(SSH_CONNECTION_FAILURE) if matches!(self.transport, Transport::Ssh(_)) => {
                warn!(host, stderr = %output.stderr.trim(), "ssh connection failed");
                Err(NodeCommandError::Unreachable {
                    host: host.to_owned(),
                    message: output.stderr.trim().to_owned(),
                })
            }
            Some(code) if allowed_exit_codes.contains(&code) => {
                Err(NodeCommandError::WrongExitCode {
                    host: host.to_owned(),
                    command: command.to_owned(),
                    code,
                })
            }
            code => {
                let status_text = code.map_or_else(|| String::from("unknown"), |c| c.to_string());
                Err(NodeCommandError::Failed {
                    host: host.to_owned(),
                    command: command.to_owned(),
                    code,
                    status_text,
                    stderr: output.stderr.trim().to_owned(),
                })
            }
        }
    }

    fn build_invocation(&self, host: &str, command: &str) -> (String, Vec<OsString>) {
        match &self.transport {
            Transport::LocalShell => (
                String::from("sh"),
                vec![OsString::from("-c"), OsString::from(command)],
            ),
            Transport::Ssh(options) => {
                let mut args = vec![
                    OsString::from("-p"),
                    OsString::from(options.port.to_string()),
                    OsString::from("-o"),
                    OsString::from("BatchMode=yes"),
                    OsString::from("-o"),
                    OsString::from("StrictHostKeyChecking=no"),
                    OsString::from("-o"),
                    OsString::from("UserKnownHostsFile=/dev/null"),
                    OsString::from("-o"),
                    OsString::from("LogLevel=ERROR"),
                ];
                if let Some(identity) = &options.identity_file {
                    args.push(OsString::from("-i"));
                    args.push(OsString::from(identity.as_str()));
                }
                args.push(OsString::from(format!("{}@{host}", options.user)));
                args.push(OsString::from(command));
                (options.ssh_bin.clone(), args)
            }
        }
    }
}

/// Shell-escapes a single argument for inclusion in a remote command line.
#[must_use]
pub fn quote(value: &str) -> String {
    shell_escape::unix::escape(value.into()).into_owned()
}
