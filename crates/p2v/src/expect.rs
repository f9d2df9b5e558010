//! Pty-backed expect engine for driving interactive subprocesses.
//!
//! Every remote-shell interaction in this program is pattern matched: spawn
//! a subprocess on a pseudo-terminal, accumulate its output in a buffer,
//! and wait until one of a fixed set of regular expressions matches (or the
//! stream ends, or a timeout expires).  This module provides that one
//! primitive; the ssh layer builds everything else on top of it.

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt as _;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::eyre::{eyre, Context as _};
use color_eyre::Result;
use regex::bytes::Regex;
use rustix::event::{PollFd, PollFlags, Timespec};
use rustix::fs::{Mode, OFlags};
use rustix::process::Signal;
use rustix::termios::OptionalActions;
use tracing::{debug, trace};

/// Default per-call match timeout.  The ssh ConnectTimeout is 60 seconds;
/// keeping the expect timeout a little larger means an unresponsive server
/// surfaces the error from ssh itself rather than a timeout from us.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(80);

/// Terminal discipline for the slave side of the pty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyMode {
    /// Raw mode: no echo, no line editing, no signal generation.
    Raw,
    /// Cooked mode: leave the terminal defaults in place so that control
    /// characters (notably an interrupt) are interpreted by the remote.
    Cooked,
}

/// Result of waiting on a session with a pattern set.
#[derive(Debug)]
pub enum Reply {
    /// One of the patterns matched.
    Matched {
        /// The caller-assigned tag of the matching pattern.
        tag: u32,
        /// Capture groups of the match, lossily decoded.  Index 0 is the
        /// whole match.
        groups: Vec<Option<String>>,
    },
    /// The subprocess closed its side of the pty.
    Eof,
    /// No pattern matched within the session timeout.
    Timeout,
}

/// A chunk read from the session while streaming output verbatim.
#[derive(Debug)]
pub enum Chunk {
    /// Bytes read from the subprocess.
    Data(Vec<u8>),
    /// The subprocess closed its side of the pty.
    Eof,
    /// Nothing arrived within the given interval.
    Timeout,
}

/// One spawned subprocess plus the master side of its pty, match buffer,
/// and timeout state.
#[derive(Debug)]
pub struct Session {
    child: Child,
    /// `None` once the master has been closed.  Shared so that the
    /// cancellation path can write an interrupt byte from another thread.
    master: Option<Arc<OwnedFd>>,
    buffer: Vec<u8>,
    timeout: Duration,
    saw_eof: bool,
}

fn openpty() -> Result<(OwnedFd, OwnedFd)> {
    let master = rustix::fs::open(
        "/dev/ptmx",
        OFlags::RDWR | OFlags::NOCTTY,
        Mode::empty(),
    )
    .context("open /dev/ptmx")?;
    rustix::pty::grantpt(&master).context("grantpt")?;
    rustix::pty::unlockpt(&master).context("unlockpt")?;
    let name = rustix::pty::ptsname(&master, Vec::new()).context("ptsname")?;
    let slave = rustix::fs::open(&name, OFlags::RDWR | OFlags::NOCTTY, Mode::empty())
        .with_context(|| format!("open pty slave {name:?}"))?;
    Ok((master, slave))
}

impl Session {
    /// Spawn `program` with `args` on a fresh pseudo-terminal.
    ///
    /// The child becomes the session leader of its own session with the pty
    /// as controlling terminal, and receives SIGHUP if this process dies.
    pub fn spawn(program: &str, args: &[String], mode: PtyMode) -> Result<Session> {
        let (master, slave) = openpty()?;

        if mode == PtyMode::Raw {
            let mut tio = rustix::termios::tcgetattr(&slave).context("tcgetattr")?;
            tio.make_raw();
            rustix::termios::tcsetattr(&slave, OptionalActions::Now, &tio)
                .context("tcsetattr")?;
        }

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::from(slave.try_clone()?));
        cmd.stdout(Stdio::from(slave.try_clone()?));
        cmd.stderr(Stdio::from(slave));

        // SAFETY: setsid/ioctl/prctl are all safe to call in a forked child.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(|| {
                rustix::process::setsid()?;
                // stdin is already the pty slave; adopt it as the
                // controlling terminal of the new session.
                rustix::process::ioctl_tiocsctty(std::io::stdin())?;
                rustix::process::set_parent_process_death_signal(Some(Signal::HUP))
                    .map_err(Into::into)
            });
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;
        debug!("spawned {} (pid {})", program, child.id());

        Ok(Session {
            child,
            master: Some(Arc::new(master)),
            buffer: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            saw_eof: false,
        })
    }

    /// Process ID of the subprocess.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// A shared handle to the master fd, for out-of-band writes (the
    /// cancellation interrupt).
    pub fn master(&self) -> Option<Arc<OwnedFd>> {
        self.master.clone()
    }

    /// Replace the per-call match timeout, returning the previous value.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        std::mem::replace(&mut self.timeout, timeout)
    }

    fn master_fd(&self) -> Result<&Arc<OwnedFd>> {
        self.master
            .as_ref()
            .ok_or_else(|| eyre!("session already closed"))
    }

    /// Write bytes to the subprocess, logging them at trace level.
    pub fn send(&mut self, s: &str) -> Result<()> {
        trace!("send: {:?}", s);
        self.write_all(s.as_bytes())
    }

    /// Write bytes to the subprocess without logging the contents.
    pub fn send_secret(&mut self, s: &str) -> Result<()> {
        trace!("send: (secret)");
        self.write_all(s.as_bytes())
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        let fd = self.master_fd()?.clone();
        while !buf.is_empty() {
            match rustix::io::write(&fd, buf) {
                Ok(n) => buf = &buf[n..],
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e).context("write to session"),
            }
        }
        Ok(())
    }

    /// Wait until the earliest match of any pattern in `patterns`, end of
    /// stream, or the session timeout.
    ///
    /// On a match, everything in the buffer up to and including the matched
    /// text is consumed.  When several patterns match, the one whose match
    /// starts earliest in the stream wins; ties go to pattern order.
    pub fn expect(&mut self, patterns: &[(u32, &Regex)]) -> Result<Reply> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(reply) = self.match_buffer(patterns) {
                return Ok(reply);
            }
            if self.saw_eof {
                return Ok(Reply::Eof);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Reply::Timeout);
            }
            if !self.poll_readable(remaining)? {
                return Ok(Reply::Timeout);
            }
            self.fill_buffer()?;
        }
    }

    /// Wait for the subprocess to close the stream, discarding output.
    pub fn expect_eof(&mut self) -> Result<Reply> {
        let deadline = Instant::now() + self.timeout;
        loop {
            self.buffer.clear();
            if self.saw_eof {
                return Ok(Reply::Eof);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.poll_readable(remaining)? {
                return Ok(Reply::Timeout);
            }
            self.fill_buffer()?;
        }
    }

    fn match_buffer(&mut self, patterns: &[(u32, &Regex)]) -> Option<Reply> {
        let mut best: Option<(usize, u32, Vec<Option<String>>, usize)> = None;
        for (tag, re) in patterns {
            if let Some(caps) = re.captures(&self.buffer) {
                let whole = caps.get(0).unwrap();
                let better = match &best {
                    Some((start, ..)) => whole.start() < *start,
                    None => true,
                };
                if better {
                    let groups = (0..caps.len())
                        .map(|i| {
                            caps.get(i)
                                .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
                        })
                        .collect();
                    best = Some((whole.start(), *tag, groups, whole.end()));
                }
            }
        }
        let (_, tag, groups, end) = best?;
        self.buffer.drain(..end);
        Some(Reply::Matched { tag, groups })
    }

    /// Read up to `max` bytes, waiting at most `interval` for something to
    /// arrive.  Bytes left over from a previous match are returned first.
    pub fn read_chunk(&mut self, max: usize, interval: Duration) -> Result<Chunk> {
        if !self.buffer.is_empty() {
            let n = max.min(self.buffer.len());
            return Ok(Chunk::Data(self.buffer.drain(..n).collect()));
        }
        if self.saw_eof {
            return Ok(Chunk::Eof);
        }
        if !self.poll_readable(interval)? {
            return Ok(Chunk::Timeout);
        }
        let fd = self.master_fd()?.clone();
        let mut buf = vec![0u8; max];
        match rustix::io::read(&fd, &mut buf) {
            Ok(0) => {
                self.saw_eof = true;
                Ok(Chunk::Eof)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Chunk::Data(buf))
            }
            Err(rustix::io::Errno::INTR) => Ok(Chunk::Timeout),
            // A closed pty reports EIO on the master side.
            Err(rustix::io::Errno::IO) => {
                self.saw_eof = true;
                Ok(Chunk::Eof)
            }
            Err(e) => Err(e).context("read from session"),
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> Result<bool> {
        let fd = self.master_fd()?.clone();
        let timespec = Timespec {
            tv_sec: timeout.as_secs() as i64,
            tv_nsec: i64::from(timeout.subsec_nanos()),
        };
        let mut fds = [PollFd::new(&fd, PollFlags::IN)];
        loop {
            match rustix::event::poll(&mut fds, Some(&timespec)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(rustix::io::Errno::INTR) => continue,
                Err(e) => return Err(e).context("poll session"),
            }
        }
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let fd = self.master_fd()?.clone();
        let mut buf = [0u8; 1024];
        match rustix::io::read(&fd, &mut buf) {
            Ok(0) => self.saw_eof = true,
            Ok(n) => {
                trace!("read: {:?}", String::from_utf8_lossy(&buf[..n]));
                self.buffer.extend_from_slice(&buf[..n]);
            }
            Err(rustix::io::Errno::INTR) => {}
            Err(rustix::io::Errno::IO) => self.saw_eof = true,
            Err(e) => return Err(e).context("read from session"),
        }
        Ok(())
    }

    /// Send a signal to the subprocess.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        let pid = rustix::process::Pid::from_raw(self.child.id() as i32)
            .ok_or_else(|| eyre!("session subprocess has no pid"))?;
        rustix::process::kill_process(pid, signal).context("kill session subprocess")?;
        Ok(())
    }

    /// Close the master side and reap the subprocess, returning its exit
    /// status.
    pub fn close(&mut self) -> Result<ExitStatus> {
        self.master = None;
        self.child.wait().context("wait for session subprocess")
    }

    /// Terminate a session that has no shell prompt to exit from: signal
    /// SIGHUP, close the pty, and reap.  Errors are ignored.
    pub fn hangup(&mut self) {
        let _ = self.send_signal(Signal::HUP);
        self.master = None;
        let _ = self.child.wait();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.master.is_some() {
            self.hangup();
        }
    }
}

/// Write a single interrupt byte (Ctrl-C) to a session's master fd.
///
/// This is a single `write(2)` call so it is safe to issue from the
/// cancellation path while the owning thread is blocked reading.
pub fn send_interrupt(master: &OwnedFd) {
    let _ = rustix::io::write(master, b"\x03");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    static HELLO: LazyLock<Regex> = LazyLock::new(|| Regex::new("hello ([a-z]+)").unwrap());

    #[test]
    fn test_expect_match_and_eof() {
        let args = vec!["-c".to_string(), "echo hello world".to_string()];
        let mut session = Session::spawn("sh", &args, PtyMode::Raw).unwrap();
        session.set_timeout(Duration::from_secs(10));
        match session.expect(&[(100, &HELLO)]).unwrap() {
            Reply::Matched { tag, groups } => {
                assert_eq!(tag, 100);
                assert_eq!(groups[1].as_deref(), Some("world"));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        match session.expect_eof().unwrap() {
            Reply::Eof => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(session.close().unwrap().success());
    }

    #[test]
    fn test_expect_timeout() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut session = Session::spawn("sh", &args, PtyMode::Raw).unwrap();
        session.set_timeout(Duration::from_millis(100));
        match session.expect(&[(100, &HELLO)]).unwrap() {
            Reply::Timeout => {}
            other => panic!("unexpected reply: {other:?}"),
        }
        session.hangup();
    }

    #[test]
    fn test_earliest_match_wins() {
        static FIRST: LazyLock<Regex> = LazyLock::new(|| Regex::new("first").unwrap());
        static SECOND: LazyLock<Regex> = LazyLock::new(|| Regex::new("second").unwrap());
        let args = vec!["-c".to_string(), "printf 'first second'".to_string()];
        let mut session = Session::spawn("sh", &args, PtyMode::Raw).unwrap();
        session.set_timeout(Duration::from_secs(10));
        // Pattern order says SECOND, stream order says FIRST.
        match session.expect(&[(200, &SECOND), (100, &FIRST)]).unwrap() {
            Reply::Matched { tag, .. } => assert_eq!(tag, 100),
            other => panic!("unexpected reply: {other:?}"),
        }
        session.hangup();
    }
}
