//! Best-effort power-saving inhibition.
//!
//! A conversion can run for hours; a laptop going to sleep half way
//! through would sever every connection.  The inhibitor is held by an
//! external `systemd-inhibit` helper whose lifetime brackets the
//! conversion; failure to start it is ignored.

use std::process::{Child, Command, Stdio};

use tracing::debug;

/// Holds a power-saving inhibitor until dropped.
#[derive(Debug)]
pub struct Inhibitor {
    child: Child,
}

/// Try to inhibit power saving for the duration of the conversion.
/// Returns `None` when no inhibitor could be taken.
pub fn power_saving() -> Option<Inhibitor> {
    let child = Command::new("systemd-inhibit")
        .args([
            "--what=sleep:idle",
            "--who=p2v",
            "--why=virt-v2v conversion is running",
            "--mode=block",
            "sleep",
            "infinity",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;
    debug!("power saving inhibited (pid {})", child.id());
    Some(Inhibitor { child })
}

impl Drop for Inhibitor {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
