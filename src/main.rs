//! Binary entry point for the pstorage operator CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use pstorage::backend::BackendKind;
use pstorage::config::{ConfigError, PstorageConfig};
use pstorage::drive_name::DriveName;
use pstorage::executor::{NodeCommandError, quote};
use pstorage::lock::LockError;

mod cli;

use cli::{Cli, DriveNameCommand, ExecCommand, LockCommand};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("lock store error: {0}")]
    Lock(#[from] LockError),
    #[error("node command failed: {0}")]
    Node(#[from] NodeCommandError),
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PSTORAGE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let config = PstorageConfig::load_without_cli_args()?;
    match cli {
        Cli::Lock(command) => lock_command(&config, command).await,
        Cli::Exec(command) => exec_command(&config, command).await,
        Cli::DriveName(command) => drive_name_command(&config, &command),
    }
}

async fn lock_command(config: &PstorageConfig, command: LockCommand) -> Result<i32, CliError> {
    let locks = config.shared_lock_manager()?;
    let mut stdout = io::stdout();
    match command {
        LockCommand::Inspect { key } => match locks.inspect(&key).await? {
            Some(payload) => {
                let task = payload.task_id.as_deref().unwrap_or("-");
                writeln!(
                    stdout,
                    "{key}: {} (task {task}, since {})",
                    payload.operation, payload.acquired_at
                )?;
                Ok(0)
            }
            None => {
                writeln!(stdout, "{key}: not locked")?;
                Ok(1)
            }
        },
        LockCommand::Break { key } => {
            let removed = locks.break_lock(&key).await?;
            writeln!(
                stdout,
                "{key}: {}",
                if removed { "removed" } else { "not locked" }
            )?;
            Ok(0)
        }
    }
}

async fn exec_command(config: &PstorageConfig, args: ExecCommand) -> Result<i32, CliError> {
    validate_command_args(&args.command)?;
    let command = render_remote_command(&args.command);
    let limit = args
        .timeout
        .map_or_else(|| config.command_timeout(), Duration::from_secs);
    match config.executor().run(&args.host, &command, limit, &[]).await {
        Ok(stdout) => {
            write!(io::stdout(), "{stdout}")?;
            Ok(0)
        }
        Err(NodeCommandError::Failed {
            code: Some(code),
            stderr,
            ..
        }) => {
            write!(io::stderr(), "{stderr}")?;
            Ok(code)
        }
        Err(err) => Err(err.into()),
    }
}

fn drive_name_command(config: &PstorageConfig, args: &DriveNameCommand) -> Result<i32, CliError> {
    let kind = match args.backend.as_deref() {
        Some(raw) => raw.parse::<BackendKind>().map_err(|err| {
            CliError::Config(ConfigError::Invalid(err.to_string()))
        })?,
        None => config.backend_kind()?,
    };
    let namespace = args.namespace.as_deref().or(config.namespace.as_deref());
    let drive = DriveName::compose(kind, namespace, args.owner_id, &args.name);
    writeln!(io::stdout(), "{drive}")?;
    Ok(0)
}

fn render_remote_command(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\n' | '\r' | '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_command_args_rejects_control_characters() {
        let err = validate_command_args(&[String::from("echo\tbad")])
            .expect_err("tab should be rejected");

        assert!(
            matches!(err, CliError::InvalidCommand(ref message) if message.contains("control characters")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_command_args_accepts_safe_arguments() {
        assert!(validate_command_args(&[String::from("echo"), String::from("ok")]).is_ok());
    }

    #[test]
    fn render_remote_command_escapes_arguments() {
        let args = vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ];
        let rendered = render_remote_command(&args);

        assert_eq!(rendered, "echo 'a b' 'c'\\''d'");
    }

    #[test]
    fn drive_name_uses_flag_over_config() {
        let config = PstorageConfig::default();
        let args = DriveNameCommand {
            backend: Some(String::from("ceph")),
            namespace: Some(String::from("team")),
            owner_id: 5,
            name: String::from("data"),
        };
        assert_eq!(drive_name_command(&config, &args).expect("compose"), 0);
    }

    #[test]
    fn drive_name_rejects_unknown_backend() {
        let config = PstorageConfig::default();
        let args = DriveNameCommand {
            backend: Some(String::from("nfs")),
            namespace: None,
            owner_id: 5,
            name: String::from("data"),
        };
        assert!(matches!(
            drive_name_command(&config, &args),
            Err(CliError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::InvalidCommand(String::from("bad"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("invalid command argument: bad"),
            "rendered: {rendered}"
        );
    }
}
