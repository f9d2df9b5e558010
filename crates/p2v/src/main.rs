//! p2v - Convert a physical machine to use KVM.

use camino::Utf8PathBuf;
use clap::Parser;
use color_eyre::eyre::{bail, Context as _};
use color_eyre::{Report, Result};
use tracing::debug;

use p2v::cmdline::{self, CmdlineSource};
use p2v::config::Config;
use p2v::conversion::Supervisor;
use p2v::disks::{self, DiskInventory};
use p2v::kernel;
use p2v::nbd::NbdLauncher;

/// Convert a physical machine to use KVM.
///
/// The conversion is driven by a remote virt-v2v on a conversion server;
/// the configuration is normally taken from the kernel command line when
/// booting from the p2v installation image.
#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Use this string instead of /proc/cmdline (for debugging command
    /// line parsing)
    #[arg(long, value_name = "CMDLINE")]
    cmdline: Option<String>,

    /// Use ANSI colour sequences even if stdout is not a tty
    #[arg(long, visible_alias = "colour", aliases = ["colors", "colours"])]
    color: bool,

    /// Running in the fixed installation-image environment
    #[arg(long)]
    iso: bool,

    /// For testing, use a disk image as the only disk (at most once)
    #[arg(long, value_name = "DISK.IMG")]
    test_disk: Vec<Utf8PathBuf>,

    /// Verbose messages (accepted for compatibility; verbose is always
    /// enabled)
    #[arg(short, long)]
    verbose: bool,
}

/// Install and configure the tracing/logging system.
///
/// Structured logging to stderr with environment-based filtering via
/// RUST_LOG, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// There is some raciness between slow devices being discovered by the
/// kernel and udev and this program starting.  Settling udev first is a
/// partial workaround.
fn udevadm_settle() {
    let _ = std::process::Command::new("udevadm").arg("settle").status();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let Cli {
        cmdline,
        color,
        iso,
        test_disk,
        verbose: _verbose,
    } = Cli::parse();

    udevadm_settle();

    let nbd = NbdLauncher::new(iso)?;

    // Find all block devices in the system, unless a test disk overrides
    // them.
    let inventory = match test_disk.as_slice() {
        [] => disks::find_all_disks()?,
        [disk] => {
            if !disk.is_absolute() {
                bail!("--test-disk must be an absolute path");
            }
            DiskInventory {
                disks: vec![disk.to_string()],
                removable: Vec::new(),
            }
        }
        _ => bail!("only a single --test-disk option can be used"),
    };

    let mut config = Config::new();
    config.set_defaults(&inventory.disks, &inventory.removable)?;

    // The kernel command line provides the configuration (with --cmdline
    // taking precedence, for debugging).
    let (parsed, source) = match &cmdline {
        Some(text) => (
            Some(cmdline::parse_cmdline_string(text)),
            CmdlineSource::CommandLine,
        ),
        None => (cmdline::parse_proc_cmdline(), CmdlineSource::ProcCmdline),
    };
    if let Some(parsed) = &parsed {
        debug!("configuration source: {:?}", source);
        cmdline::update_config_from_cmdline(&mut config, parsed)
            .context("parsing the kernel command line")?;
    }

    // If p2v.server exists we run the non-interactive conversion;
    // otherwise an interactive front-end would take over, and this build
    // has none.
    if config.remote.server.is_none() {
        bail!(
            "no conversion server was configured (set p2v.server on the kernel \
             command line or via --cmdline); the interactive GUI front-end is a \
             separate program"
        );
    }

    let supervisor = Supervisor::new(nbd);
    kernel::run(&mut config, &supervisor, color)
}
