//! The conversion supervisor.
//!
//! The conversion itself is done by virt-v2v running on the remote
//! conversion server; this module manages one whole attempt: start an NBD
//! server and a reverse-forwarded data connection per disk, upload the
//! machine description and a generated wrapper script, invoke the wrapper
//! over the control connection, stream its output to the observer, and
//! guarantee teardown in reverse order whatever happens.
//!
//! A GUI front-end runs [`Supervisor::start_conversion`] on a worker
//! thread and calls [`Supervisor::cancel`] from the UI thread; the
//! headless flow calls it on the main thread.

use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt as _;
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context as _};
use color_eyre::Result;
use indoc::indoc;
use tracing::{debug, warn};

use crate::config::{Config, OutputAllocation};
use crate::expect::{self, Chunk, Session};
use crate::inhibit;
use crate::nbd::{NbdLauncher, NbdServer};
use crate::ssh::{self, RemoteFeatures};
use crate::util::random_base36;

/// How often the streaming loop wakes up to poll for cancellation.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Events delivered to the conversion observer.
#[derive(Debug)]
pub enum Event<'a> {
    /// Location of the remote log directory.
    LogDir(&'a str),
    /// A chunk of output from the remote virt-v2v.
    RemoteMessage(&'a [u8]),
    /// A new stage in the conversion process.
    Status(&'a str),
}

/// Contract for the external machine-description generator.  The
/// supervisor ships the produced file to the remote tool without ever
/// inspecting its contents.
pub trait DescriptionGenerator {
    /// Write the machine description for this conversion to `path`.
    fn generate(&self, config: &Config, conns: &[DataConn], path: &Utf8Path) -> Result<()>;
}

/// The pair of processes serving one physical disk: the local NBD server
/// and the ssh session holding its reverse port forward.
///
/// Dropping the value hangs up the ssh session and then terminates and
/// reaps the NBD server, in that order.
#[derive(Debug)]
pub struct DataConn {
    // Held only for its Drop impl, which hangs up the ssh session.
    #[allow(dead_code)]
    session: Session,
    nbd: NbdServer,
    remote_port: u16,
}

impl DataConn {
    /// Remote port assigned by sshd for this disk's forward.
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Local port the NBD server listens on.
    pub fn local_port(&self) -> u16 {
        self.nbd.port()
    }

    /// Process ID of the NBD server.
    pub fn nbd_pid(&self) -> u32 {
        self.nbd.pid()
    }
}

#[derive(Debug, Default)]
struct CancelState {
    requested: bool,
    /// Master fd of the registered control session, if one is open.  Held
    /// under the same lock as `requested` so the interrupt write cannot
    /// race the session being closed.
    control: Option<Arc<OwnedFd>>,
}

/// Owns the lifecycle of conversion attempts and the cancellation
/// rendezvous.  At most one conversion runs at a time.
#[derive(Debug)]
pub struct Supervisor {
    nbd: Mutex<NbdLauncher>,
    running: Mutex<bool>,
    cancel: Mutex<CancelState>,
}

fn notify(observer: &mut Option<&mut dyn FnMut(Event<'_>)>, event: Event<'_>) {
    if let Some(callback) = observer {
        callback(event);
    }
}

impl Supervisor {
    /// Create a supervisor around a probed NBD launcher.
    pub fn new(nbd: NbdLauncher) -> Supervisor {
        Supervisor {
            nbd: Mutex::new(nbd),
            running: Mutex::new(false),
            cancel: Mutex::new(CancelState::default()),
        }
    }

    /// Whether a conversion attempt is currently in flight.
    pub fn is_running(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn set_running(&self, running: bool) {
        *self.running.lock().unwrap() = running;
    }

    /// Request cooperative cancellation of the running conversion.
    ///
    /// Sends a single interrupt byte to the control session (if one is
    /// registered) so the remote virt-v2v knows the connection is being
    /// cancelled; the supervisor notices the flag between reads and
    /// unwinds to teardown.  Safe to call from any thread.
    pub fn cancel(&self) {
        let mut state = self.cancel.lock().unwrap();
        state.requested = true;
        if let Some(fd) = &state.control {
            expect::send_interrupt(fd);
        }
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.lock().unwrap().requested
    }

    fn set_control(&self, fd: Option<Arc<OwnedFd>>) {
        self.cancel.lock().unwrap().control = fd;
    }

    /// Run one complete conversion attempt.
    ///
    /// The observer, when given, receives [`Event`]s on the calling
    /// thread.  On failure the returned error is the "last error" of the
    /// attempt; teardown has already happened by the time this returns.
    pub fn start_conversion(
        &self,
        config: &mut Config,
        generator: &dyn DescriptionGenerator,
        features: &RemoteFeatures,
        mut observer: Option<&mut dyn FnMut(Event<'_>)>,
    ) -> Result<()> {
        if let Ok(json) = serde_json::to_string_pretty(config) {
            debug!("starting conversion with configuration:\n{}", json);
        }

        self.set_control(None);
        self.set_running(true);
        self.cancel.lock().unwrap().requested = false;

        let inhibitor = inhibit::power_saving();
        if inhibitor.is_none() {
            warn!("cannot inhibit power saving during conversion");
        }

        let mut data_conns: Vec<DataConn> = Vec::new();
        let mut control: Option<Session> = None;
        let mut result = self.convert(
            config,
            generator,
            features,
            &mut observer,
            &mut data_conns,
            &mut control,
        );

        // Teardown, always, in this order: the control session, the data
        // connections in reverse, the power-saving inhibitor.
        if let Some(mut session) = control.take() {
            self.set_control(None);
            match session.close() {
                Ok(status) => {
                    if result.is_ok() {
                        if let Some(code) = status.code() {
                            if code != 0 {
                                result = Err(eyre!("virt-v2v exited with status {code}"));
                            }
                        }
                    }
                }
                Err(e) => {
                    if result.is_ok() {
                        result = Err(e);
                    } else {
                        warn!("closing control connection: {:#}", e);
                    }
                }
            }
        }
        for conn in data_conns.drain(..).rev() {
            debug!(
                "closing data connection (remote port {}, NBD pid {})",
                conn.remote_port(),
                conn.nbd_pid()
            );
            drop(conn);
        }
        drop(inhibitor);

        self.set_running(false);
        result
    }

    fn convert(
        &self,
        config: &mut Config,
        generator: &dyn DescriptionGenerator,
        features: &RemoteFeatures,
        observer: &mut Option<&mut dyn FnMut(Event<'_>)>,
        data_conns: &mut Vec<DataConn>,
        control: &mut Option<Session>,
    ) -> Result<()> {
        // Start the data connections and NBD server processes, one per
        // disk, in disk order.
        let disks = config.disks.clone();
        for disk in &disks {
            let device = if disk.starts_with('/') {
                Utf8PathBuf::from(disk)
            } else {
                Utf8PathBuf::from(format!("/dev/{disk}"))
            };

            notify(
                observer,
                Event::Status(&format!("Starting local NBD server for {disk} ...")),
            );
            let nbd = self
                .nbd
                .lock()
                .unwrap()
                .start(&device)
                .context("NBD server error")?;

            notify(
                observer,
                Event::Status(&format!("Opening data connection for {disk} ...")),
            );
            let (session, remote_port) = ssh::open_data_connection(config, nbd.port()).context(
                "could not open data connection over SSH to the conversion server",
            )?;
            debug!(
                "data connection for {}: SSH remote port {}, local port {}",
                device,
                remote_port,
                nbd.port()
            );
            data_conns.push(DataConn {
                session,
                nbd,
                remote_port,
            });
        }

        // The remote directory holds the machine description, log files
        // and other stuff.  It is left in place after the run: it is
        // useful for post-mortem debugging and only contains small files.
        let remote_dir = remote_dir_name(chrono::Utc::now());
        notify(observer, Event::LogDir(&remote_dir));

        let tmpdir = tempfile::Builder::new()
            .prefix("p2v.")
            .tempdir_in("/tmp")
            .context("mkdtemp")?;
        let tmp = Utf8Path::from_path(tmpdir.path())
            .ok_or_else(|| eyre!("non-UTF-8 temporary directory"))?;

        // Generate the static files.
        let name_file = tmp.join("name");
        std::fs::write(&name_file, format!("{}\n", config.guestname))
            .with_context(|| format!("write {name_file}"))?;
        let physical_xml_file = tmp.join("physical.xml");
        generator.generate(config, data_conns, &physical_xml_file)?;
        let wrapper_file = tmp.join("virt-v2v-wrapper.sh");
        std::fs::write(
            &wrapper_file,
            generate_wrapper_script(config, features.colours_option, &remote_dir),
        )
        .with_context(|| format!("write {wrapper_file}"))?;
        let mut permissions = std::fs::metadata(&wrapper_file)?.permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&wrapper_file, permissions)?;
        generate_system_data(tmp);
        generate_version_file(tmp);

        // Open the control connection.  This also creates remote_dir.
        notify(observer, Event::Status("Setting up the control connection ..."));
        let session = ssh::start_control_connection(config, &remote_dir).context(
            "could not open control connection over SSH to the conversion server",
        )?;
        self.set_control(session.master());
        *control = Some(session);

        // Copy the static files to the remote dir.  These three must not
        // fail; the diagnostics are best effort.
        ssh::scp_file(
            config,
            &remote_dir,
            &[&name_file, &physical_xml_file, &wrapper_file],
        )
        .with_context(|| format!("scp: {remote_dir}"))?;
        let diagnostics = ["dmesg", "lscpu", "lspci", "lsscsi", "lsusb", "p2v-version"]
            .map(|name| tmp.join(name));
        let diagnostic_refs: Vec<&Utf8Path> = diagnostics.iter().map(|p| p.as_path()).collect();
        if let Err(e) = ssh::scp_file(config, &remote_dir, &diagnostic_refs) {
            debug!("uploading diagnostics: {:#}", e);
        }

        // Do the conversion.  This runs until virt-v2v exits.  The
        // wrapper writes virt-v2v's exit status to the status file and we
        // make the remote shell exit with it.
        notify(observer, Event::Status("Doing conversion ..."));
        let session = control
            .as_mut()
            .ok_or_else(|| eyre!("control session disappeared"))?;
        session.send(&format!(
            "{remote_dir}/virt-v2v-wrapper.sh; exit $(< {remote_dir}/status)\n"
        ))?;

        // Read output from the remote virt-v2v and echo it through the
        // observer until the remote closes the connection.
        loop {
            if self.cancel_requested() {
                break;
            }
            match session.read_chunk(256, READ_POLL_INTERVAL)? {
                Chunk::Data(bytes) => notify(observer, Event::RemoteMessage(&bytes)),
                Chunk::Eof => break,
                Chunk::Timeout => continue,
            }
        }

        if self.cancel_requested() {
            notify(observer, Event::Status("Conversion cancelled by user."));
            bail!("cancelled by user");
        }

        notify(observer, Event::Status("Control connection closed by remote."));
        Ok(())
    }
}

/// Compose the remote working directory name.  The path must never
/// require shell quoting.
fn remote_dir_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "/tmp/virt-p2v-{}-{}",
        now.format("%Y%m%d"),
        random_base36(8)
    )
}

/// Print a shell-quoted string.
fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '$' | '`' | '\\' | '"') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Construct the virt-v2v wrapper script.
///
/// The script is uploaded to the remote server and invoked there; that is
/// easier than trying to "type" a long and complex command line into the
/// ssh connection.  Its output is deterministic for a given
/// configuration.
fn generate_wrapper_script(config: &Config, colours: bool, remote_dir: &str) -> String {
    use std::fmt::Write as _;

    let mut script = String::new();
    script.push_str("#!/bin/bash -\n\n");
    let _ = writeln!(script, "cd {remote_dir}");
    script.push('\n');

    // The virt-v2v command, as a shell function called "v2v".
    script.push_str("v2v ()\n{\n");
    if config.auth.sudo {
        script.push_str("sudo -n ");
    }
    script.push_str("virt-v2v -v -x");
    if colours {
        script.push_str(" --colours");
    }
    script.push_str(" -i libvirtxml");
    if let Some(kind) = &config.output.kind {
        let _ = write!(script, " -o {}", shell_quote(kind));
    }
    match config.output.allocation {
        OutputAllocation::None => {}
        allocation => {
            let _ = write!(script, " -oa {allocation}");
        }
    }
    if let Some(format) = &config.output.format {
        let _ = write!(script, " -of {}", shell_quote(format));
    }
    if let Some(storage) = &config.output.storage {
        let _ = write!(script, " -os {}", shell_quote(storage));
    }
    for option in &config.output.misc {
        let _ = write!(script, " -oo {}", shell_quote(option));
    }
    script.push_str(" --root first physical.xml </dev/null\n");
    script.push_str("# Save the exit code of virt-v2v into the 'status' file.\n");
    script.push_str("echo $? > status\n");
    script.push_str("}\n\n");

    script.push_str(indoc! {"
        # Write a pre-emptive error status, in case the virt-v2v
        # command doesn't get to run at all.  This will be
        # overwritten with the true exit code when virt-v2v runs.
        echo 99 > status

        log=virt-v2v-conversion-log.txt
        rm -f $log

        # Log the environment where virt-v2v will run.
        printenv > environment

        # Log the version of virt-v2v (for information only).
    "});
    if config.auth.sudo {
        script.push_str("sudo -n ");
    }
    script.push_str("virt-v2v --version > v2v-version\n\n");

    script.push_str(
        &indoc! {r#"
            # Run virt-v2v.  Send stdout back over the control connection.
            # Send stdout and stderr (debugging info) to the log file.
            v2v 2>> $log | tee -a $log

            # If virt-v2v failed then the error message (sent to stderr)
            # will not be seen on the control connection.  Send the last
            # few lines of the log back in this case.
            if [ "$(< status)" -ne 0 ]; then
                echo
                echo
                echo
                echo -ne '\e[1;31m'
                echo '***' virt-v2v command failed '***'
                echo
                echo The full log is available on the conversion server in:
                echo '   ' {REMOTE_DIR}/$log
                echo Only the last 50 lines are shown below.
                echo -ne '\e[0m'
                echo
                echo
                echo
                tail -50 $log
            fi

            # EOF
        "#}
        .replace("{REMOTE_DIR}", remote_dir),
    );
    script
}

/// Collect diagnostic data about the machine being converted (dmesg
/// output, PCI devices and so on), for post-mortem use when things go
/// wrong.  Any command failing is non-fatal.
fn generate_system_data(dir: &Utf8Path) {
    let cmd = format!(
        "dmesg >{0}/dmesg 2>&1; \
         lscpu >{0}/lscpu 2>&1; \
         lspci -vvv >{0}/lspci 2>&1; \
         lsscsi -v >{0}/lsscsi 2>&1; \
         lsusb -v >{0}/lsusb 2>&1",
        dir
    );
    let _ = Command::new("sh").args(["-c", &cmd]).status();
}

/// Record which version of this program did the conversion.  The
/// virt-v2v version ends up in the conversion log.
fn generate_version_file(dir: &Utf8Path) {
    let _ = std::fs::write(
        dir.join("p2v-version"),
        concat!("p2v ", env!("CARGO_PKG_VERSION"), "\n"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    fn scenario_config() -> Config {
        let mut config = Config::new();
        config.auth.sudo = true;
        config.output.kind = Some("local".to_string());
        config.output.allocation = OutputAllocation::Sparse;
        config.output.storage = Some("/var/tmp".to_string());
        config.output.format = None;
        config
    }

    #[test]
    fn test_wrapper_scenario() {
        let script = generate_wrapper_script(&scenario_config(), false, "/tmp/virt-p2v-20240101-abcdefgh");
        assert!(script.contains(
            "sudo -n virt-v2v -v -x -i libvirtxml -o \"local\" -oa sparse -os \"/var/tmp\" \
             --root first physical.xml </dev/null\n"
        ));
    }

    #[test]
    fn test_wrapper_invariants() {
        let mut config = scenario_config();
        config.output.misc = vec!["opt1".to_string(), "opt2".to_string()];
        let script = generate_wrapper_script(&config, true, "/tmp/virt-p2v-20240101-abcdefgh");

        assert_eq!(script.matches("--root first physical.xml </dev/null").count(), 1);
        assert_eq!(script.matches("echo $? > status").count(), 1);
        assert_eq!(script.matches("echo 99 > status").count(), 1);
        assert!(script.starts_with("#!/bin/bash -\n"));
        assert!(script.contains("cd /tmp/virt-p2v-20240101-abcdefgh\n"));
        assert!(script.contains(" --colours "));
        assert!(script.contains(" -oo \"opt1\" -oo \"opt2\" "));
        assert!(script.contains("v2v 2>> $log | tee -a $log\n"));
        assert!(script.contains("tail -50 $log\n"));
    }

    #[test]
    fn test_wrapper_omits_unset_options() {
        let mut config = Config::new();
        config.output.kind = None;
        config.output.storage = None;
        config.output.allocation = OutputAllocation::None;
        let script = generate_wrapper_script(&config, false, "/tmp/virt-p2v-20240101-abcdefgh");
        assert!(script.contains("virt-v2v -v -x -i libvirtxml --root first physical.xml </dev/null\n"));
        assert!(!script.contains(" -oa "));
        assert!(!script.contains(" -o \""));
        assert!(!script.contains("sudo"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("local"), "\"local\"");
        assert_eq!(shell_quote("a$b"), "\"a\\$b\"");
        assert_eq!(shell_quote("a`b\\c\"d"), "\"a\\`b\\\\c\\\"d\"");
    }

    /// The quoted form, passed through a real shell, must recover the
    /// original string.
    #[test]
    fn test_shell_quote_round_trip() {
        for s in [
            "simple",
            "with space",
            "dollar $HOME",
            "backtick `id`",
            "back\\slash",
            "quote\"quote",
            "all $` \\\" of them",
        ] {
            let output = Command::new("sh")
                .args(["-c", &format!("printf %s {}", shell_quote(s))])
                .output()
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&output.stdout), s, "quoting {s:?}");
        }
    }

    #[test]
    fn test_remote_dir_name() {
        let now = chrono::DateTime::from_timestamp(1700000000, 0).unwrap();
        let dir = remote_dir_name(now);
        assert!(dir.starts_with("/tmp/virt-p2v-20231114-"), "{dir}");
        let suffix = dir.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        // Nothing in the path may require shell quoting.
        assert!(dir
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '/' || c == '-'));
    }

    #[test]
    fn test_cancel_flag() {
        let supervisor = Supervisor::new(crate::nbd::NbdLauncher::stub());
        assert!(!supervisor.is_running());
        assert!(!supervisor.cancel_requested());
        supervisor.cancel();
        assert!(supervisor.cancel_requested());
    }
}
