//! ssh connections to the conversion server.
//!
//! Several connections are opened over the lifetime of a conversion.
//! First [`test_connection`] opens one to check the server is reachable
//! and interrogate virt-v2v (right version, supported drivers); it is then
//! closed.  Once conversion starts there is one control connection used to
//! upload files and drive virt-v2v, plus one data connection per disk,
//! each carrying a reverse port forward to the local NBD server for that
//! disk.  The remote port of a data connection is assigned by sshd.
//!
//! All interactions run through the expect engine: spawn the ssh
//! subprocess on a pty, then match its output against a fixed set of
//! patterns.  An interactive shell is tamed by replacing its prompt with a
//! random synchronization token (see [`synchronize_prompt`]).

use std::io::Write as _;
use std::os::unix::process::ExitStatusExt as _;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{bail, eyre, Context as _};
use color_eyre::Result;
use regex::bytes::Regex;
use tracing::debug;

use crate::config::{AuthConfig, Config};
use crate::expect::{PtyMode, Reply, Session};
use crate::util::random_base36;

/// ssh ConnectTimeout.  The expect timeout is kept a little larger so an
/// unresponsive server surfaces ssh's own error rather than ours.
const SSH_TIMEOUT: Duration = Duration::from_secs(60);

/// Expect timeout while synchronizing the shell prompt.  Tight, because a
/// missed echo is retried up to 30 times.
const PROMPT_SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors from the ssh domain.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// The subprocess closed the stream while a pattern was awaited.
    #[error("remote server closed the connection unexpectedly, waiting for: {0}")]
    UnexpectedEof(&'static str),
    /// Nothing matched before the timeout.
    #[error("remote server timed out unexpectedly, waiting for: {0}")]
    UnexpectedTimeout(&'static str),
    /// A password prompt appeared after authentication should have been
    /// complete.
    #[error("Login failed.  Probably the username and/or password is wrong.")]
    LoginFailed,
    /// 30 prompt exchanges went unanswered.
    #[error("Failed to synchronize with remote shell after 60 seconds.")]
    SyncFailed,
    /// Anything else, already formatted.
    #[error("{0}")]
    Message(String),
}

struct Patterns {
    password: Regex,
    ssh_message: Regex,
    sudo_password: Regex,
    /// The magic synchronization prompts all match this.
    prompt: Regex,
    version: Regex,
    feature_libguestfs_rewrite: Regex,
    feature_colours: Regex,
    feature_input: Regex,
    feature_output: Regex,
    portfwd: Regex,
}

static PATTERNS: LazyLock<Patterns> = LazyLock::new(|| Patterns {
    password: Regex::new("password:").unwrap(),
    ssh_message: Regex::new("(ssh: [^\r\n]*)").unwrap(),
    sudo_password: Regex::new("sudo: a password is required").unwrap(),
    prompt: Regex::new("###([0-9a-z]{8})### ").unwrap(),
    // Require the trailing newline so a version split across reads cannot
    // be matched half-way.
    version: Regex::new(r"virt-v2v ([1-9][^\r\n]*)\r?\n").unwrap(),
    feature_libguestfs_rewrite: Regex::new("libguestfs-rewrite").unwrap(),
    feature_colours: Regex::new("colours-option").unwrap(),
    // These must match the same names virt-v2v prints in its
    // machine-readable output.
    feature_input: Regex::new(r"input:([-\w]+)[^-\w]").unwrap(),
    feature_output: Regex::new(r"output:([-\w]+)[^-\w]").unwrap(),
    portfwd: Regex::new(r"Allocated port (\d+) for remote forward").unwrap(),
});

/// What the remote virt-v2v told us about itself.
#[derive(Debug, Clone)]
pub struct RemoteFeatures {
    /// Remote virt-v2v version string.
    pub version: String,
    /// Whether virt-v2v supports the `--colours` option.
    pub colours_option: bool,
    /// Supported input driver names (`-i`).
    pub input_drivers: Vec<String>,
    /// Supported output driver names (`-o`), filtered.
    pub output_drivers: Vec<String>,
}

/// Escape a URL into curl config-file syntax.
fn curl_config(url: &str) -> String {
    let mut out = String::from("url = \"");
    for c in url.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x0b' => out.push_str("\\v"),
            _ => out.push(c),
        }
    }
    out.push_str("\"\n");
    out
}

/// Download a URL to a local file using the external curl command.  A
/// config file is used because escaping into it is easier than escaping
/// into a command line.
fn curl_download(url: &str, local_file: &Utf8Path) -> Result<()> {
    let mut config_file = tempfile::Builder::new()
        .prefix("curl.")
        .tempfile_in("/tmp")
        .context("mkstemp")?;
    config_file.write_all(curl_config(url).as_bytes())?;
    config_file.flush()?;

    let output = Command::new("curl")
        .args(["-f", "-s", "-S", "-o", local_file.as_str(), "-K"])
        .arg(config_file.path())
        .output()
        .context("failed to run curl")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SshError::Message(format!("{url}: {}", stderr.trim_end())).into());
    }
    Ok(())
}

/// Re-fetch the identity URL into a local temporary file if needed.  The
/// file is created 0600 and cached for the lifetime of the process.
fn cache_ssh_identity(auth: &mut AuthConfig) -> Result<()> {
    let Some(url) = auth.identity.url.clone() else {
        return Ok(());
    };
    if !auth.identity.file_needs_update {
        return Ok(());
    }

    let file = tempfile::Builder::new()
        .prefix("id.")
        .tempfile_in("/tmp")
        .context("mkstemp")?;
    let (_, path) = file.keep().context("persisting identity file")?;
    let path = Utf8PathBuf::from_path_buf(path)
        .map_err(|p| eyre!("non-UTF-8 identity path: {}", p.display()))?;

    match curl_download(&url, &path) {
        Ok(()) => {
            auth.identity.file = Some(path);
            auth.identity.file_needs_update = false;
            Ok(())
        }
        Err(e) => {
            auth.identity.file = None;
            auth.identity.file_needs_update = true;
            Err(e)
        }
    }
}

fn push_auth_args(args: &mut Vec<String>, auth: &AuthConfig) {
    match &auth.identity.file {
        // Only use password authentication.
        None => {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=keyboard-interactive,password".to_string());
        }
        // Use the identity file (private key).
        Some(file) => {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=publickey".to_string());
            args.push("-i".to_string());
            args.push(file.to_string());
        }
    }
}

/// Handle the password exchange after spawning ssh or scp.  Diagnostic
/// lines from ssh are remembered so an eventual hangup can surface them.
fn authenticate(session: &mut Session, password: &str, program: &str) -> Result<()> {
    let mut diagnostic: Option<String> = None;
    loop {
        match session.expect(&[
            (100, &PATTERNS.password),
            (101, &PATTERNS.ssh_message),
        ])? {
            Reply::Matched { tag: 100, .. } => {
                // Got the password prompt.
                session.send_secret(password)?;
                session.send("\n")?;
                return Ok(());
            }
            Reply::Matched { groups, .. } => {
                diagnostic = groups.into_iter().nth(1).flatten();
            }
            // This is where we get to if the user entered an incorrect or
            // impossible hostname or port number.  Hopefully ssh printed
            // an error message and we picked it up above.
            Reply::Eof => {
                return Err(match diagnostic {
                    Some(msg) => SshError::Message(msg),
                    None => SshError::Message(format!(
                        "{program} closed the connection without printing an error."
                    )),
                }
                .into())
            }
            Reply::Timeout => return Err(SshError::UnexpectedTimeout("password prompt").into()),
        }
    }
}

/// Ensure the remote shell is bash, set LANG=C, and synchronize with the
/// command prompt by setting it to a random known string.
///
/// We cannot control the initial prompt (that would need AcceptEnv on the
/// server), we don't know whether the login shell is Bourne-like or csh,
/// and we don't know how command line editing is set up.  What we can do
/// is repeatedly send `export PS1=<magic>` until we see the magic echoed
/// back as a prompt.
fn synchronize_prompt(session: &mut Session) -> Result<()> {
    session.send("exec bash --noediting --noprofile --norc\n")?;

    let saved = session.set_timeout(PROMPT_SYNC_TIMEOUT);
    let result = (|| {
        for _ in 0..30 {
            let magic = random_base36(8);
            // The '' inside the string ensure we don't mistake the command
            // echo for the prompt.
            session.send(&format!("export LANG=C PS1='###''{magic}''### '\n"))?;

            loop {
                match session.expect(&[
                    (100, &PATTERNS.password),
                    (101, &PATTERNS.prompt),
                ])? {
                    // Got a password prompt unexpectedly.
                    Reply::Matched { tag: 100, .. } => {
                        return Err(SshError::LoginFailed.into());
                    }
                    Reply::Matched { groups, .. } => {
                        // It might be an earlier prompt; only accept the
                        // token we just sent.
                        if groups.get(1).and_then(|g| g.as_deref()) == Some(magic.as_str()) {
                            return Ok(());
                        }
                    }
                    Reply::Eof => {
                        return Err(SshError::UnexpectedEof("the command prompt").into());
                    }
                    // Timeout here is not an error: ssh may "eat" commands
                    // sent before the shell at the other end is ready.
                    Reply::Timeout => break,
                }
            }
        }
        Err(SshError::SyncFailed.into())
    })();
    session.set_timeout(saved);
    result
}

/// Start an ssh subprocess with the standard argument set plus
/// `extra_args`, authenticate, and optionally synchronize with the remote
/// shell prompt.
fn start_ssh(
    config: &mut Config,
    extra_args: &[String],
    wait_prompt: bool,
    mode: PtyMode,
) -> Result<Session> {
    cache_ssh_identity(&mut config.auth)?;
    let using_password_auth = config.auth.identity.file.is_none();
    let server = config
        .remote
        .server
        .clone()
        .ok_or_else(|| eyre!("no conversion server configured"))?;

    let mut args: Vec<String> = vec![
        "-p".to_string(),
        config.remote.port.to_string(),
        "-l".to_string(),
        config.auth.username.clone(),
        // The host key will always be novel.
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", SSH_TIMEOUT.as_secs()),
        // Send ping packets every 5 mins to sshd.
        "-o".to_string(),
        "ServerAliveInterval=300".to_string(),
        "-o".to_string(),
        "ServerAliveCountMax=6".to_string(),
    ];
    push_auth_args(&mut args, &config.auth);
    args.extend(extra_args.iter().cloned());
    args.push(server);

    debug!("ssh command: ssh {}", args.join(" "));
    let mut session = Session::spawn("ssh", &args, mode)?;
    session.set_timeout(SSH_TIMEOUT + Duration::from_secs(20));

    if using_password_auth && !config.auth.password.is_empty() {
        authenticate(&mut session, &config.auth.password, "ssh")?;
    }

    if wait_prompt {
        synchronize_prompt(&mut session)?;
    }
    Ok(session)
}

/// Upload local files to a remote target using scp, with the same
/// authentication as the ssh sessions.
pub fn scp_file(config: &mut Config, target: &str, local: &[&Utf8Path]) -> Result<()> {
    cache_ssh_identity(&mut config.auth)?;
    let using_password_auth = config.auth.identity.file.is_none();
    let server = config
        .remote
        .server
        .clone()
        .ok_or_else(|| eyre!("no conversion server configured"))?;

    let mut args: Vec<String> = vec![
        "-P".to_string(),
        config.remote.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", SSH_TIMEOUT.as_secs()),
    ];
    push_auth_args(&mut args, &config.auth);
    for file in local {
        args.push(file.to_string());
    }
    args.push(format!("{}@{}:{}", config.auth.username, server, target));

    debug!("scp command: scp {}", args.join(" "));
    let mut session = Session::spawn("scp", &args, PtyMode::Raw)?;
    session.set_timeout(SSH_TIMEOUT + Duration::from_secs(20));

    if using_password_auth && !config.auth.password.is_empty() {
        authenticate(&mut session, &config.auth.password, "scp")?;
    }

    // Wait for the scp subprocess to finish.
    match session.expect_eof()? {
        Reply::Eof => {}
        _ => return Err(SshError::UnexpectedTimeout("copying (scp) file").into()),
    }
    let status = session.close()?;
    if !status.success() {
        return Err(SshError::Message(format!("scp failed: {status}")).into());
    }
    Ok(())
}

/// Reject virt-v2v versions this program cannot drive.  The major version
/// must be 1 or 2, and 1.x must be at least 1.28 (the 1.27 releases were
/// experimental).
pub(crate) fn compatible_version(version: &str) -> Result<()> {
    if !version.starts_with("1.") && !version.starts_with("2.") {
        return Err(SshError::Message(format!(
            "virt-v2v major version is neither 1 nor 2 (\"{version}\"), \
             this version of virt-p2v is not compatible."
        ))
        .into());
    }
    let minor: u32 = version[2..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .map_err(|_| eyre!("cannot parse virt-v2v version string (\"{version}\")"))?;
    if version.starts_with("1.") && minor < 28 {
        return Err(SshError::Message(format!(
            "virt-v2v version is < 1.28 (\"{version}\"), you must upgrade to \
             virt-v2v >= 1.28 on the conversion server."
        ))
        .into());
    }
    Ok(())
}

/// Ignore the 'vdsm' driver, which should only be used by VDSM, and the
/// 'openstack' and 'rhv-upload' drivers, since we do not support passing
/// all the options they need.
pub(crate) fn output_driver_accepted(name: &str) -> bool {
    !matches!(name, "vdsm" | "openstack" | "rhv-upload")
}

/// Open a throwaway connection to the conversion server and interrogate
/// virt-v2v: version compatibility and supported drivers.
pub fn test_connection(config: &mut Config) -> Result<RemoteFeatures> {
    let sudo_prefix = if config.auth.sudo { "sudo -n " } else { "" };
    let username = config.auth.username.clone();

    let mut session = start_ssh(config, &[], true, PtyMode::Raw)?;

    // Send 'virt-v2v --version' and hope we get back a version string.
    // Note old virt-v2v did not understand the -V option.
    session.send(&format!("{sudo_prefix}virt-v2v --version\n"))?;
    let mut version: Option<String> = None;
    loop {
        match session.expect(&[
            (100, &PATTERNS.version),
            (101, &PATTERNS.sudo_password),
            (102, &PATTERNS.prompt),
        ])? {
            Reply::Matched { tag: 100, groups } => {
                version = groups.into_iter().nth(1).flatten();
            }
            Reply::Matched { tag: 101, .. } => {
                return Err(SshError::Message(format!(
                    "sudo for user \"{username}\" requires a password.  Edit /etc/sudoers \
                     on the conversion server to ensure the \"NOPASSWD:\" option is set \
                     for this user."
                ))
                .into());
            }
            // Got the prompt: end of output.
            Reply::Matched { .. } => break,
            Reply::Eof => {
                return Err(SshError::UnexpectedEof("\"virt-v2v --version\" output").into())
            }
            Reply::Timeout => {
                return Err(SshError::UnexpectedTimeout("\"virt-v2v --version\" output").into())
            }
        }
    }

    // Got the prompt but no version number.
    let version = version.ok_or_else(|| {
        SshError::Message(
            "virt-v2v is not installed on the conversion server, \
             or it might be a too old version."
                .to_string(),
        )
    })?;
    debug!("remote virt-v2v version: {}", version);
    compatible_version(&version)?;

    // Get the virt-v2v feature list.
    session.send(&format!("{sudo_prefix}virt-v2v --machine-readable\n"))?;
    let mut libguestfs_rewrite = false;
    let mut colours_option = false;
    let mut input_drivers = Vec::new();
    let mut output_drivers = Vec::new();
    loop {
        match session.expect(&[
            (100, &PATTERNS.feature_libguestfs_rewrite),
            (101, &PATTERNS.feature_colours),
            (102, &PATTERNS.feature_input),
            (103, &PATTERNS.feature_output),
            (104, &PATTERNS.prompt),
        ])? {
            Reply::Matched { tag: 100, .. } => libguestfs_rewrite = true,
            Reply::Matched { tag: 101, .. } => {
                debug!("remote virt-v2v supports the --colours option");
                colours_option = true;
            }
            Reply::Matched { tag: 102, groups } => {
                if let Some(driver) = groups.into_iter().nth(1).flatten() {
                    debug!("remote virt-v2v supports input driver {}", driver);
                    input_drivers.push(driver);
                }
            }
            Reply::Matched { tag: 103, groups } => {
                if let Some(driver) = groups.into_iter().nth(1).flatten() {
                    if output_driver_accepted(&driver) {
                        debug!("remote virt-v2v supports output driver {}", driver);
                        output_drivers.push(driver);
                    }
                }
            }
            // Got the prompt: end of output.
            Reply::Matched { .. } => break,
            Reply::Eof => {
                return Err(
                    SshError::UnexpectedEof("\"virt-v2v --machine-readable\" output").into(),
                )
            }
            Reply::Timeout => {
                return Err(
                    SshError::UnexpectedTimeout("\"virt-v2v --machine-readable\" output").into(),
                )
            }
        }
    }
    if !libguestfs_rewrite {
        return Err(SshError::Message(
            "Invalid output of \"virt-v2v --machine-readable\" command.".to_string(),
        )
        .into());
    }

    // Test finished, shut down ssh.
    session.send("exit\n")?;
    match session.expect_eof()? {
        Reply::Eof => {}
        _ => return Err(SshError::UnexpectedTimeout("end of ssh session").into()),
    }
    let status = session.close()?;
    // A hangup on close is benign.
    if status.signal() != Some(libc::SIGHUP) && !status.success() {
        bail!("unexpected close status from ssh subprocess ({status})");
    }

    Ok(RemoteFeatures {
        version,
        colours_option,
        input_drivers,
        output_drivers,
    })
}

/// Open one data connection: an ssh session whose only job is a reverse
/// port forward from a remote ephemeral port to the local NBD server.
/// Returns the session and the remote port sshd chose.
///
/// These sessions run no remote command (`-N`) and are never usable for
/// shell commands; the only way to end them is a signal.
pub fn open_data_connection(config: &mut Config, local_port: u16) -> Result<(Session, u16)> {
    let extra_args = vec![
        "-R".to_string(),
        format!("0:localhost:{local_port}"),
        "-N".to_string(),
    ];
    let mut session = start_ssh(config, &extra_args, false, PtyMode::Raw)?;

    match session.expect(&[(100, &PATTERNS.portfwd)])? {
        Reply::Matched { groups, .. } => {
            let port_str = groups
                .into_iter()
                .nth(1)
                .flatten()
                .ok_or_else(|| eyre!("port forward match without a port"))?;
            let remote_port: u16 = port_str
                .parse()
                .map_err(|_| eyre!("cannot extract the port number from '{port_str}'"))?;
            Ok((session, remote_port))
        }
        Reply::Eof => Err(SshError::UnexpectedEof("\"ssh -R\" output").into()),
        Reply::Timeout => Err(SshError::UnexpectedTimeout("\"ssh -R\" output").into()),
    }
}

/// Wait for the synchronized prompt.
pub fn wait_for_prompt(session: &mut Session) -> Result<()> {
    match session.expect(&[(100, &PATTERNS.prompt)])? {
        Reply::Matched { .. } => Ok(()),
        Reply::Eof => Err(SshError::UnexpectedEof("command prompt").into()),
        Reply::Timeout => Err(SshError::UnexpectedTimeout("command prompt").into()),
    }
}

/// Open the control connection and create the remote working directory.
///
/// This connection is opened in cooked mode so that ^C can be sent if the
/// conversion is cancelled; that also means we must be careful never to
/// send any other control characters over it.
pub fn start_control_connection(config: &mut Config, remote_dir: &str) -> Result<Session> {
    let mut session = start_ssh(config, &[], true, PtyMode::Cooked)?;

    session.send(&format!("mkdir {remote_dir}\n"))?;
    wait_for_prompt(&mut session)?;

    // Creating the remote 'time' file by running date is the simplest way
    // that sends no special control characters.
    session.send(&format!("date > {remote_dir}/time\n"))?;
    wait_for_prompt(&mut session)?;

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatible_versions() {
        assert!(compatible_version("1.27.5").is_err());
        assert!(compatible_version("1.28.0").is_ok());
        assert!(compatible_version("1.99.9").is_ok());
        assert!(compatible_version("2.0.0").is_ok());
        assert!(compatible_version("2.1.0").is_ok());
        assert!(compatible_version("3.0.0").is_err());
        assert!(compatible_version("0.9.1").is_err());
    }

    #[test]
    fn test_version_too_old_message() {
        let err = compatible_version("1.27.5").unwrap_err();
        assert!(err.to_string().contains("virt-v2v version is < 1.28"));
    }

    #[test]
    fn test_version_regex() {
        let caps = PATTERNS
            .version
            .captures(b"virt-v2v 2.1.0\r\n###aaaaaaaa### ")
            .unwrap();
        assert_eq!(&caps[1], b"2.1.0");
        // The echoed command itself must not match.
        assert!(PATTERNS.version.captures(b"virt-v2v --version\r\n").is_none());
    }

    #[test]
    fn test_prompt_regex() {
        let caps = PATTERNS.prompt.captures(b"###a1b2c3d4### ").unwrap();
        assert_eq!(&caps[1], b"a1b2c3d4");
        // The quoted command echo must not match.
        assert!(PATTERNS
            .prompt
            .captures(b"export LANG=C PS1='###''a1b2c3d4''### '")
            .is_none());
    }

    #[test]
    fn test_portfwd_regex() {
        let caps = PATTERNS
            .portfwd
            .captures(b"Allocated port 45123 for remote forward to localhost:50123\r\n")
            .unwrap();
        assert_eq!(&caps[1], b"45123");
    }

    /// Remote advertises libguestfs-rewrite plus one input and two output
    /// drivers; vdsm must be filtered from the outputs.
    #[test]
    fn test_machine_readable_parsing() {
        let output = b"libguestfs-rewrite\ninput:disk\noutput:local\noutput:vdsm\n";
        assert!(PATTERNS.feature_libguestfs_rewrite.is_match(output));

        let inputs: Vec<String> = PATTERNS
            .feature_input
            .captures_iter(output)
            .map(|c| String::from_utf8_lossy(&c[1]).into_owned())
            .collect();
        assert_eq!(inputs, ["disk"]);

        let outputs: Vec<String> = PATTERNS
            .feature_output
            .captures_iter(output)
            .map(|c| String::from_utf8_lossy(&c[1]).into_owned())
            .filter(|name| output_driver_accepted(name))
            .collect();
        assert_eq!(outputs, ["local"]);
    }

    /// Remote sends "virt-v2v 1.27.5\n###aaaaaaaa### ": the version is
    /// captured, the prompt ends the wait, and the version is rejected as
    /// too old.
    #[test]
    fn test_version_negotiation_against_fake_remote() {
        let args = vec![
            "-c".to_string(),
            "printf 'virt-v2v 1.27.5\\n###aaaaaaaa### '".to_string(),
        ];
        let mut session = Session::spawn("sh", &args, PtyMode::Raw).unwrap();
        session.set_timeout(Duration::from_secs(10));

        let mut version: Option<String> = None;
        loop {
            match session
                .expect(&[(100, &PATTERNS.version), (102, &PATTERNS.prompt)])
                .unwrap()
            {
                Reply::Matched { tag: 100, groups } => {
                    version = groups.into_iter().nth(1).flatten();
                }
                Reply::Matched { .. } => break,
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        assert_eq!(version.as_deref(), Some("1.27.5"));
        let err = compatible_version(&version.unwrap()).unwrap_err();
        assert!(err.to_string().contains("virt-v2v version is < 1.28"));
        session.hangup();
    }

    /// Remote advertises drivers over the machine-readable protocol; the
    /// full expect loop collects them and filters vdsm.
    #[test]
    fn test_machine_readable_against_fake_remote() {
        let args = vec![
            "-c".to_string(),
            "printf 'libguestfs-rewrite\\ninput:disk\\noutput:local\\noutput:vdsm\\n###bbbbbbbb### '"
                .to_string(),
        ];
        let mut session = Session::spawn("sh", &args, PtyMode::Raw).unwrap();
        session.set_timeout(Duration::from_secs(10));

        let mut libguestfs_rewrite = false;
        let mut input_drivers: Vec<String> = Vec::new();
        let mut output_drivers: Vec<String> = Vec::new();
        loop {
            match session
                .expect(&[
                    (100, &PATTERNS.feature_libguestfs_rewrite),
                    (101, &PATTERNS.feature_colours),
                    (102, &PATTERNS.feature_input),
                    (103, &PATTERNS.feature_output),
                    (104, &PATTERNS.prompt),
                ])
                .unwrap()
            {
                Reply::Matched { tag: 100, .. } => libguestfs_rewrite = true,
                Reply::Matched { tag: 101, .. } => {}
                Reply::Matched { tag: 102, groups } => {
                    input_drivers.extend(groups.into_iter().nth(1).flatten());
                }
                Reply::Matched { tag: 103, groups } => {
                    if let Some(driver) = groups.into_iter().nth(1).flatten() {
                        if output_driver_accepted(&driver) {
                            output_drivers.push(driver);
                        }
                    }
                }
                Reply::Matched { .. } => break,
                other => panic!("unexpected reply: {other:?}"),
            }
        }
        assert!(libguestfs_rewrite);
        assert_eq!(input_drivers, ["disk"]);
        assert_eq!(output_drivers, ["local"]);
        session.hangup();
    }

    #[test]
    fn test_curl_config_escaping() {
        assert_eq!(
            curl_config("https://example.com/key"),
            "url = \"https://example.com/key\"\n"
        );
        assert_eq!(
            curl_config("https://example.com/a\"b\\c\td"),
            "url = \"https://example.com/a\\\"b\\\\c\\td\"\n"
        );
    }
}
