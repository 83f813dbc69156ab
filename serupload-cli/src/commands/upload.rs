//! Upload and reset command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serupload::{NativePort, SerialConfig, UploadEvent, UploadReport, Uploader};
use std::io::Write as _;
use std::path::Path;

use crate::config::Config;
use crate::{Cli, CliError, resolve_device, resolve_speed, use_fancy_output, was_interrupted};

/// How upload progress is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    Bar,
    Dots,
    Silent,
}

fn progress_mode(cli: &Cli) -> ProgressMode {
    if cli.quiet || cli.verbose > 0 {
        // Verbose runs get per-offset log lines from the library instead.
        ProgressMode::Silent
    } else if use_fancy_output() {
        ProgressMode::Bar
    } else {
        ProgressMode::Dots
    }
}

fn percent(offset: u64, total: usize) -> u64 {
    if total == 0 {
        return 100;
    }
    (offset.min(total as u64) * 100) / total as u64
}

/// Map library interruption onto the CLI's cancellation error.
fn map_interrupted(err: serupload::Error) -> anyhow::Error {
    if matches!(err, serupload::Error::Interrupted) {
        CliError::Cancelled("Interrupted by user".to_string()).into()
    } else {
        err.into()
    }
}

/// Open the device and prepare its console for management requests.
fn open_uploader(
    cli: &Cli,
    config: &Config,
    chunk: Option<usize>,
    max_retries: Option<u32>,
) -> Result<Uploader<NativePort>> {
    let device = resolve_device(cli, config)?;
    let speed = resolve_speed(cli, config)?;
    let upload_config = config.upload_config(chunk, max_retries);
    upload_config
        .validate()
        .context("Invalid upload configuration")?;

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&device).green(),
            speed
        );
    }

    let port = NativePort::open(&SerialConfig::new(&device, speed))
        .with_context(|| format!("Failed to open serial port {device}"))?;
    let mut uploader =
        Uploader::with_config(port, upload_config).with_interrupt_checker(was_interrupted);

    uploader
        .flush_console()
        .context("Failed to write to device console")?;
    uploader
        .set_echo(false)
        .map_err(map_interrupted)
        .context("Failed to disable console echo")?;
    Ok(uploader)
}

/// Upload command implementation.
pub(crate) fn cmd_upload(
    cli: &Cli,
    config: &Config,
    file: &Path,
    chunk: Option<usize>,
    max_retries: Option<u32>,
    reset: bool,
) -> Result<()> {
    let image =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    if image.is_empty() {
        return Err(CliError::Usage(format!("{} is empty", file.display())).into());
    }

    if !cli.quiet {
        eprintln!(
            "{} Loaded {} ({} bytes)",
            style("📦").cyan(),
            file.display(),
            image.len()
        );
    }

    let mut uploader = open_uploader(cli, config, chunk, max_retries)?;

    let mode = progress_mode(cli);
    let pb = if mode == ProgressMode::Bar {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    } else {
        ProgressBar::hidden()
    };

    let result = uploader.upload(&image, |event| match event {
        UploadEvent::Started { total } => {
            pb.set_message(format!("{total} bytes"));
        },
        UploadEvent::Acknowledged { .. } => {
            if mode == ProgressMode::Dots {
                eprint!(".");
                let _ = std::io::stderr().flush();
            }
        },
        UploadEvent::Committed { offset, total } => {
            pb.set_position(percent(offset as u64, total));
        },
        UploadEvent::Retransmit { segment, .. } => {
            if mode == ProgressMode::Bar {
                pb.set_message(format!("resending {segment}"));
            }
        },
        UploadEvent::Sent(_) => {},
    });

    if mode == ProgressMode::Dots {
        eprintln!();
    }

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            return Err(map_interrupted(err)).context("Upload failed");
        },
    };
    pb.finish_with_message("done");

    if !cli.quiet {
        print_report(&report);
    }

    if reset {
        if !cli.quiet {
            eprintln!("{} Resetting device", style("🔄").cyan());
        }
        uploader
            .reset()
            .map_err(map_interrupted)
            .context("Failed to reset device")?;
    }

    Ok(())
}

fn print_report(report: &UploadReport) {
    let secs = report.elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        report.bytes as f64 / secs
    } else {
        0.0
    };
    eprintln!(
        "{} Uploaded {} bytes in {:.1}s ({:.0} B/s, {} segments, {} retransmits)",
        style("✓").green().bold(),
        report.bytes,
        secs,
        rate,
        report.segments,
        report.retransmits
    );
}

/// Reset command implementation.
pub(crate) fn cmd_reset(cli: &Cli, config: &Config) -> Result<()> {
    let mut uploader = open_uploader(cli, config, None, None)?;

    if !cli.quiet {
        eprintln!("{} Resetting device", style("🔄").cyan());
    }
    uploader
        .reset()
        .map_err(map_interrupted)
        .context("Failed to reset device")?;

    if !cli.quiet {
        eprintln!("{} Done", style("✓").green().bold());
    }
    Ok(())
}
