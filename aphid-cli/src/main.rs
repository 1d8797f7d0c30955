//! Cameo/Aphid ProFile emulator CLI.
//!
//! Usage:
//!   aphid [options] <image_file>
//!
//! Examples:
//!   aphid profile.image                     # Serve profile.image
//!   aphid -c new.image                      # Create a 5 MB image first
//!   aphid -v -d /dev/rpmsg_pru31 lisa.image # Chatty, explicit device

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aphid_core::extension::{ExtensionContext, BUILTIN};
use aphid_core::{
    run_sessions, CancelToken, EngineConfig, ExitReason, Image, PollChannel, SessionConfig,
};

/// ProFile hard drive emulator for the Cameo/Aphid
#[derive(Parser, Debug)]
#[command(name = "aphid")]
#[command(about = "Emulate a ProFile hard drive over PRU 1's RPMsg channel")]
struct Args {
    /// Disk image file to serve
    image_file: PathBuf,

    /// RPMsg character device for talking to PRU 1
    #[arg(short, long, default_value = "/dev/rpmsg_pru31")]
    device: PathBuf,

    /// Log every command
    #[arg(short, long)]
    verbose: bool,

    /// Create a new 5 MB image at image_file first (refuses to overwrite)
    #[arg(short, long)]
    create: bool,

    /// Seconds to wait after a write before flushing data to disk
    #[arg(long, default_value_t = 4.0)]
    flush_delay: f64,

    /// Seconds to wait for PRU 1 during each transfer (negative waits forever)
    #[arg(long, default_value_t = 5.0, allow_negative_numbers = true)]
    io_timeout: f64,

    /// Directory holding the zipped Selector images
    #[arg(long, default_value = "/home/debian/aphid/selector")]
    selector_dir: PathBuf,

    /// Don't load any "magic block" extensions
    #[arg(long)]
    no_extensions: bool,
}

fn seconds(value: f64, what: &str) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("invalid {what} {value}: {e}"))
}

/// Channel timeout; any negative value means no limit.
fn io_timeout(value: f64) -> Result<Option<Duration>, String> {
    if value < 0.0 {
        return Ok(None);
    }
    seconds(value, "I/O timeout").map(Some)
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    if args.create {
        Image::create(&args.image_file)?;
    }

    let flush_delay = seconds(args.flush_delay, "flush delay")?;
    let config = SessionConfig {
        image_path: args.image_file.clone(),
        flush_delay,
        engine: EngineConfig {
            io_timeout: io_timeout(args.io_timeout)?,
            ..EngineConfig::default()
        },
        extensions: ExtensionContext {
            selector_dir: args.selector_dir.clone(),
            flush_delay,
            ..ExtensionContext::default()
        },
        extension_table: if args.no_extensions {
            Vec::new()
        } else {
            BUILTIN.to_vec()
        },
    };

    info!("Opening {}...", args.device.display());
    let mut channel = PollChannel::open(&args.device)?;

    let cancel = CancelToken::new();
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

    // Turn Ctrl-C and SIGTERM into a clean shutdown
    let signal_cancel = cancel.clone();
    let mut sigterm = signal(SignalKind::terminate())?;
    let signal_handle = tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.recv() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received; shutting down...");
                signal_cancel.cancel();
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down...");
                signal_cancel.cancel();
            }
        }
    });

    let session_cancel = cancel.clone();
    let emu_handle =
        tokio::task::spawn_blocking(move || run_sessions(&mut channel, &config, &session_cancel));

    let reason = emu_handle.await?;

    let _ = shutdown_tx.send(()).await;
    let _ = signal_handle.await;

    match reason {
        ExitReason::Interrupted => info!("Emulator stopped by request."),
        ExitReason::Halted => info!("Emulator halted by the Apple."),
        ExitReason::Error(ref e) => error!("Emulator stopped unexpectedly: {}", e),
    }
    if reason.is_intentional() {
        Ok(ExitCode::SUCCESS)
    } else {
        warn!("Exiting with failure status.");
        Ok(ExitCode::FAILURE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_io_timeout_is_unbounded() {
        assert_eq!(io_timeout(-1.0), Ok(None));
        assert_eq!(io_timeout(-0.5), Ok(None));
        assert_eq!(io_timeout(2.5), Ok(Some(Duration::from_millis(2500))));
        assert!(io_timeout(f64::NAN).is_err());
    }

    #[test]
    fn test_negative_io_timeout_parses() {
        let args = Args::try_parse_from(["aphid", "--io-timeout", "-1", "disk.image"]).unwrap();
        assert_eq!(args.io_timeout, -1.0);
        assert_eq!(args.image_file, PathBuf::from("disk.image"));
    }

    #[test]
    fn test_negative_flush_delay_is_rejected() {
        assert!(seconds(-1.0, "flush delay").is_err());
    }
}
