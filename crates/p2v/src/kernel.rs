//! The headless (kernel-configured) conversion flow.
//!
//! Runs when `p2v.server` was supplied on the kernel-style command line:
//! interrogate virt-v2v on the conversion server, then run the whole
//! conversion synchronously on the calling thread, printing observer
//! events to stdout.

use std::io::Write as _;
use std::os::fd::AsFd;

use color_eyre::eyre::Context as _;
use color_eyre::Result;
use tracing::debug;

use crate::config::Config;
use crate::conversion::{Event, Supervisor};
use crate::physical::LibvirtDescription;
use crate::ssh;

/// The name this program reports in its own output.
pub const PROGRAM_NAME: &str = "p2v";

fn use_colour(force_colour: bool) -> bool {
    force_colour || rustix::termios::isatty(std::io::stdout().as_fd())
}

fn print_status(colour: bool, message: &str) {
    if colour {
        println!("\x1b[1;32m{PROGRAM_NAME}: {message}\x1b[0m");
    } else {
        println!("{PROGRAM_NAME}: {message}");
    }
}

/// Negotiate with the conversion server and perform the conversion in
/// text mode.
pub fn run(config: &mut Config, supervisor: &Supervisor, force_colour: bool) -> Result<()> {
    let server = config.remote.server.clone().unwrap_or_default();
    let port = config.remote.port;
    let features = ssh::test_connection(config).with_context(|| {
        format!("error opening control connection to {server}:{port}")
    })?;
    debug!(
        "remote virt-v2v {} (input drivers: {:?}, output drivers: {:?})",
        features.version, features.input_drivers, features.output_drivers
    );

    let colour = use_colour(force_colour);
    let mut observer = |event: Event<'_>| match event {
        Event::LogDir(path) => {
            print_status(colour, &format!("remote log directory location: {path}"));
        }
        Event::RemoteMessage(bytes) => {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(bytes);
            let _ = stdout.flush();
        }
        Event::Status(message) => print_status(colour, message),
    };

    supervisor
        .start_conversion(config, &LibvirtDescription, &features, Some(&mut observer))
        .context("error during conversion")
}
