//! Supervision of the local read-only NBD servers.
//!
//! One nbdkit process serves each physical disk.  We bind the listening
//! sockets ourselves on an ephemeral local port and hand them to nbdkit
//! via the systemd socket-activation protocol (fds 3... plus `LISTEN_FDS`
//! and `LISTEN_PID`), so there is no race waiting for the server to come
//! up before ssh forwards the port.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command, Stdio};

use camino::Utf8Path;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};
use rand::Rng as _;
use rustix::process::{Pid, Signal};
use tracing::{debug, warn};

/// Ports at and above this are never considered.
const PORT_SEARCH_END: u16 = 60000;

/// Fixed start port when running from the installation image, where we
/// control the environment and a predictable port either always works or
/// never works.
const ISO_START_PORT: u16 = 50123;

/// Socket-activation fds start here by convention.
const FIRST_SOCKET_ACTIVATION_FD: i32 = 3;

/// Errors from the NBD server domain.
#[derive(Debug, thiserror::Error)]
pub enum NbdError {
    /// nbdkit is not installed.
    #[error("nbdkit was not found, cannot continue")]
    NotFound,
    /// The port search ran out of candidates.
    #[error("cannot find a free local port")]
    NoFreePort,
}

/// Launches NBD servers, remembering the next port to try and the probed
/// nbdkit capabilities.
#[derive(Debug)]
pub struct NbdLauncher {
    next_port: u16,
    exit_with_parent: bool,
}

/// A running nbdkit serving one device read-only on a local port.
///
/// Dropping the value terminates and reaps the server.
#[derive(Debug)]
pub struct NbdServer {
    child: Child,
    port: u16,
}

impl NbdLauncher {
    /// Check that nbdkit exists and which flags it understands.  A missing
    /// nbdkit is fatal.
    pub fn new(iso_environment: bool) -> Result<NbdLauncher> {
        let found = Command::new("nbdkit")
            .args(["file", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !found {
            return Err(NbdError::NotFound.into());
        }

        let exit_with_parent = Command::new("nbdkit")
            .args(["--exit-with-parent", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        debug!(
            "found nbdkit ({} exit with parent)",
            if exit_with_parent { "can" } else { "cannot" }
        );

        let next_port = if iso_environment {
            ISO_START_PORT
        } else {
            50000 + rand::rng().random_range(0..10000)
        };

        Ok(NbdLauncher {
            next_port,
            exit_with_parent,
        })
    }

    /// A launcher that has probed nothing, for tests that never spawn.
    #[cfg(test)]
    pub(crate) fn stub() -> NbdLauncher {
        NbdLauncher {
            next_port: 50000,
            exit_with_parent: false,
        }
    }

    /// Start an NBD server for one device, searching for a free local
    /// port.
    pub fn start(&mut self, device: &Utf8Path) -> Result<NbdServer> {
        let mut port = self.next_port;
        while port < PORT_SEARCH_END {
            match bind_tcpip_socket(port)? {
                Some(fds) => {
                    debug!("bound to localhost:{} ({} socket(s))", port, fds.len());
                    // Don't retry the port we just bound to next time.
                    self.next_port = port + 1;
                    let child = spawn_nbdkit(device, fds, self.exit_with_parent)?;
                    return Ok(NbdServer { child, port });
                }
                None => port += 1,
            }
        }
        Err(NbdError::NoFreePort.into())
    }
}

/// Bind listening sockets for every address family `localhost` resolves
/// to.  Returns `None` when the port is in use (the caller advances to the
/// next one).
fn bind_tcpip_socket(port: u16) -> Result<Option<Vec<OwnedFd>>> {
    use std::net::ToSocketAddrs as _;

    let addrs = ("localhost", port)
        .to_socket_addrs()
        .context("getaddrinfo: localhost")?;

    let mut fds: Vec<OwnedFd> = Vec::new();
    let mut addr_in_use = false;
    for addr in addrs {
        let family = if addr.is_ipv6() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let sock = socket::socket(family, SockType::Stream, SockFlag::empty(), None)
            .context("socket")?;
        if let Err(e) = socket::setsockopt(&sock, sockopt::ReuseAddr, &true) {
            warn!("setsockopt: SO_REUSEADDR: {}", e);
        }
        if addr.is_ipv6() {
            if let Err(e) = socket::setsockopt(&sock, sockopt::Ipv6V6Only, &true) {
                warn!("setsockopt: IPV6_V6ONLY: {}", e);
            }
        }
        match socket::bind(sock.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) => {}
            Err(Errno::EADDRINUSE) => {
                addr_in_use = true;
                continue;
            }
            Err(e) => {
                warn!("bind: localhost:{}: {}", port, e);
                continue;
            }
        }
        match socket::listen(&sock, Backlog::MAXCONN) {
            Ok(()) => fds.push(sock),
            Err(e) => warn!("listen: {}", e),
        }
    }

    if fds.is_empty() {
        if addr_in_use {
            debug!("unable to bind to localhost:{}: address in use", port);
            return Ok(None);
        }
        color_eyre::eyre::bail!("could not bind any socket on localhost:{port}");
    }
    Ok(Some(fds))
}

/// Spawn nbdkit with the file plugin, read-only, taking the pre-bound
/// listening sockets through the socket-activation protocol.
fn spawn_nbdkit(device: &Utf8Path, fds: Vec<OwnedFd>, exit_with_parent: bool) -> Result<Child> {
    debug!("starting nbdkit for {} using socket activation", device);

    let nofork_opt = if exit_with_parent {
        "--exit-with-parent"
    } else {
        "-f"
    };

    let mut cmd = Command::new("nbdkit");
    // Readonly is vital.
    cmd.arg("-r")
        .arg(nofork_opt)
        .arg("file")
        .arg(format!("file={device}"));
    cmd.stdin(Stdio::null());

    let nr_fds = fds.len();
    let raw_fds: Vec<i32> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    // SAFETY: dup2/close are safe in a forked child; setenv runs before
    // exec while the child is still single threaded.
    #[allow(unsafe_code)]
    unsafe {
        cmd.pre_exec(move || {
            for (i, &fd) in raw_fds.iter().enumerate() {
                let target = FIRST_SOCKET_ACTIVATION_FD + i as i32;
                if fd != target {
                    if libc::dup2(fd, target) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    libc::close(fd);
                }
            }
            std::env::set_var("LISTEN_FDS", nr_fds.to_string());
            std::env::set_var(
                "LISTEN_PID",
                rustix::process::getpid().as_raw_nonzero().to_string(),
            );
            Ok(())
        });
    }

    let child = cmd.spawn().context("Failed to spawn nbdkit")?;
    // The child owns the dup'ed copies now.
    drop(fds);
    Ok(child)
}

impl NbdServer {
    /// The bound local port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Process ID of the nbdkit server.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

impl Drop for NbdServer {
    fn drop(&mut self) {
        if let Some(pid) = Pid::from_raw(self.child.id() as i32) {
            let _ = rustix::process::kill_process(pid, Signal::TERM);
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_in_use_is_not_an_error() {
        // Find a port we can fully occupy, then check that a second bind
        // reports it as busy rather than failing.
        for port in 57000..57100 {
            if let Some(fds) = bind_tcpip_socket(port).unwrap() {
                assert!(!fds.is_empty());
                assert!(bind_tcpip_socket(port).unwrap().is_none());
                return;
            }
        }
        panic!("no bindable port in the test range");
    }
}
