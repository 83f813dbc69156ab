//! serupload CLI - upload firmware images over a device's serial console.
//!
//! ## Features
//!
//! - Segmented image upload with retransmission and progress display
//! - Device reset
//! - Serial port discovery with USB bridge classification
//! - Shell completion generation
//! - Environment variable and configuration file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::{debug, warn};
use serupload::port::{DEFAULT_SPEED, SUPPORTED_SPEEDS, is_supported_speed};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors raised by the CLI layer itself.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad combination of arguments or configuration values.
    #[error("{0}")]
    Usage(String),
    /// The user aborted the operation.
    #[error("{0}")]
    Cancelled(String),
}

/// serupload - upload firmware images to a device over its serial console.
///
/// Environment variables:
///   SERUPLOAD_DEVICE  - Default serial device
///   SERUPLOAD_SPEED   - Default link speed (default: 115200)
///   RUST_LOG          - Override the log filter
#[derive(Parser, Debug)]
#[command(name = "serupload")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial device to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "SERUPLOAD_DEVICE")]
    pub(crate) device: Option<String>,

    /// Link speed (115200, 230400 or 1000000).
    #[arg(short, long, global = true, env = "SERUPLOAD_SPEED", value_parser = parse_speed)]
    pub(crate) speed: Option<u32>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub(crate) config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub(crate) command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Upload a firmware image.
    Upload {
        /// Path to the image file.
        #[arg(short, long, value_name = "PATH")]
        file: PathBuf,

        /// Maximum chunk size in bytes (64-2048, default 512).
        #[arg(short, long, value_parser = parse_chunk)]
        chunk: Option<usize>,

        /// Give up after this many retransmissions of one segment.
        #[arg(long, value_name = "N")]
        max_retries: Option<u32>,

        /// Reset the device after a successful upload.
        #[arg(long)]
        reset: bool,
    },

    /// Reset the device.
    Reset,

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a link speed, accepting only the supported rates.
fn parse_speed(s: &str) -> Result<u32, String> {
    let speed: u32 = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid speed: {s}"))?;
    if is_supported_speed(speed) {
        Ok(speed)
    } else {
        Err(format!(
            "Unsupported speed {speed}; expected one of {}",
            speed_list()
        ))
    }
}

/// Parse a chunk size within the accepted bounds.
fn parse_chunk(s: &str) -> Result<usize, String> {
    use serupload::upload::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

    let chunk: usize = s
        .trim()
        .parse()
        .map_err(|_| format!("Invalid chunk size: {s}"))?;
    if (MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk) {
        Ok(chunk)
    } else {
        Err(format!(
            "Chunk size {chunk} out of range ({MIN_CHUNK_SIZE}-{MAX_CHUNK_SIZE})"
        ))
    }
}

fn speed_list() -> String {
    SUPPORTED_SPEEDS
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolve the link speed: flag/env, then config files, then the default.
pub(crate) fn resolve_speed(cli: &Cli, config: &Config) -> Result<u32> {
    let speed = cli
        .speed
        .or(config.connection.speed)
        .unwrap_or(DEFAULT_SPEED);
    if is_supported_speed(speed) {
        Ok(speed)
    } else {
        Err(CliError::Usage(format!(
            "Unsupported speed {speed} in configuration; expected one of {}",
            speed_list()
        ))
        .into())
    }
}

/// Resolve the serial device: flag/env, then config files, then discovery.
pub(crate) fn resolve_device(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(device) = cli
        .device
        .as_ref()
        .or(config.connection.device.as_ref())
    {
        return Ok(device.clone());
    }

    let detected = serupload::auto_detect_port()
        .context("No serial device given; use --device or set SERUPLOAD_DEVICE")?;
    debug!("Auto-detected {} ({})", detected.name, detected.device.name());
    Ok(detected.name)
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload {
            file,
            chunk,
            max_retries,
            reset,
        } => commands::upload::cmd_upload(cli, &config, file, *chunk, *max_retries, *reset),
        Commands::Reset => commands::upload::cmd_reset(cli, &config),
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // --help and --version are reported through the error path too.
            let code = u8::from(err.use_stderr());
            let _ = err.print();
            return ExitCode::from(code);
        },
    };

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    init_logging(&cli);

    debug!(
        "serupload v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        warn!("Failed to install Ctrl-C handler: {err}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_command_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_upload() {
        let cli = Cli::try_parse_from(["serupload", "upload", "-f", "app.img"]).unwrap();
        match cli.command {
            Commands::Upload {
                file,
                chunk,
                max_retries,
                reset,
            } => {
                assert_eq!(file, PathBuf::from("app.img"));
                assert_eq!(chunk, None);
                assert_eq!(max_retries, None);
                assert!(!reset);
            },
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_cli_parse_upload_with_all_options() {
        let cli = Cli::try_parse_from([
            "serupload",
            "-d",
            "/dev/ttyUSB0",
            "-s",
            "1000000",
            "upload",
            "--file",
            "app.img",
            "--chunk",
            "1024",
            "--max-retries",
            "5",
            "--reset",
        ])
        .unwrap();

        assert_eq!(cli.device.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.speed, Some(1_000_000));
        match cli.command {
            Commands::Upload {
                chunk,
                max_retries,
                reset,
                ..
            } => {
                assert_eq!(chunk, Some(1024));
                assert_eq!(max_retries, Some(5));
                assert!(reset);
            },
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn test_cli_upload_requires_file() {
        assert!(Cli::try_parse_from(["serupload", "upload"]).is_err());
    }

    #[test]
    fn test_cli_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["serupload", "reset", "-vv", "-d", "COM3"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.device.as_deref(), Some("COM3"));
        assert!(matches!(cli.command, Commands::Reset));
    }

    #[test]
    fn test_cli_parse_list_ports_json() {
        let cli = Cli::try_parse_from(["serupload", "list-ports", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::ListPorts { json: true }));
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["serupload", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["serupload"]).is_err());
    }

    #[test]
    fn test_parse_speed() {
        assert_eq!(parse_speed("115200"), Ok(115200));
        assert_eq!(parse_speed(" 1000000 "), Ok(1_000_000));
        assert!(parse_speed("9600").is_err());
        assert!(parse_speed("921600").is_err());
        assert!(parse_speed("fast").is_err());
    }

    #[test]
    fn test_parse_chunk_bounds() {
        assert_eq!(parse_chunk("64"), Ok(64));
        assert_eq!(parse_chunk("2048"), Ok(2048));
        assert!(parse_chunk("63").is_err());
        assert!(parse_chunk("2049").is_err());
        assert!(parse_chunk("-1").is_err());
    }

    #[test]
    fn test_resolve_speed_precedence() {
        let mut config = Config::default();
        let cli = Cli::try_parse_from(["serupload", "reset"]).unwrap();
        // SERUPLOAD_SPEED may be set in the test environment.
        if cli.speed.is_none() {
            assert_eq!(resolve_speed(&cli, &config).unwrap(), DEFAULT_SPEED);
            config.connection.speed = Some(230400);
            assert_eq!(resolve_speed(&cli, &config).unwrap(), 230400);
            config.connection.speed = Some(9600);
            assert!(resolve_speed(&cli, &config).is_err());
        }

        config.connection.speed = Some(230400);
        let cli = Cli::try_parse_from(["serupload", "-s", "1000000", "reset"]).unwrap();
        assert_eq!(resolve_speed(&cli, &config).unwrap(), 1_000_000);
    }

    #[test]
    fn test_resolve_device_from_flag_and_config() {
        let mut config = Config::default();
        config.connection.device = Some("/dev/ttyACM0".to_string());

        let cli = Cli::try_parse_from(["serupload", "-d", "/dev/ttyUSB3", "reset"]).unwrap();
        assert_eq!(resolve_device(&cli, &config).unwrap(), "/dev/ttyUSB3");

        let cli = Cli::try_parse_from(["serupload", "reset"]).unwrap();
        if cli.device.is_none() {
            assert_eq!(resolve_device(&cli, &config).unwrap(), "/dev/ttyACM0");
        }
    }

    #[test]
    fn test_cli_error_display() {
        let err = CliError::Cancelled("Interrupted by user".to_string());
        assert_eq!(err.to_string(), "Interrupted by user");
    }
}
