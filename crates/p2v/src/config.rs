//! The process-wide conversion configuration.
//!
//! One [`Config`] value is built at startup from machine-derived defaults
//! and then overridden by the kernel-style command line (see
//! [`crate::cmdline`]).  It is handed by reference to the ssh layer and the
//! conversion supervisor.

use camino::Utf8PathBuf;
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use serde::Serialize;
use tracing::warn;

use crate::util::random_base36;

/// Where and how to reach the conversion server.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteConfig {
    /// Hostname of the conversion server.  `None` means no headless
    /// conversion was requested.
    pub server: Option<String>,
    /// ssh port on the conversion server.
    pub port: u16,
}

/// An ssh identity (private key), either a local file or a URL that is
/// fetched into a temporary file on first use.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IdentityConfig {
    /// URL the identity is fetched from, if any.
    pub url: Option<String>,
    /// Local path of the identity file.
    pub file: Option<Utf8PathBuf>,
    /// Whether [`IdentityConfig::url`] must be (re-)fetched into
    /// [`IdentityConfig::file`] before the next use.
    pub file_needs_update: bool,
}

/// Credentials for the conversion server.
#[derive(Debug, Clone, Serialize)]
pub struct AuthConfig {
    /// Remote username.
    pub username: String,
    /// Remote password.  Empty means ssh is left to its own devices
    /// (agent, unencrypted key, ...).
    #[serde(skip_serializing)]
    pub password: String,
    /// ssh identity, used instead of the password when set.
    pub identity: IdentityConfig,
    /// Whether remote commands run under `sudo -n`.
    pub sudo: bool,
}

/// How the remote tool should allocate output storage (`-oa`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum OutputAllocation {
    /// No preference; the option is omitted.
    #[default]
    None,
    /// Sparse allocation.
    Sparse,
    /// Preallocated storage.
    Preallocated,
}

/// Output selection passed through to the remote tool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputConfig {
    /// Output driver name (`-o`).
    pub kind: Option<String>,
    /// Output allocation (`-oa`).
    pub allocation: OutputAllocation,
    /// Output connection URI (`-oc`).
    pub connection: Option<String>,
    /// Output format (`-of`).
    pub format: Option<String>,
    /// Output storage location (`-os`).
    pub storage: Option<String>,
    /// Extra output options, one `-oo` each.
    pub misc: Vec<String>,
}

/// The complete conversion configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Conversion server location.
    pub remote: RemoteConfig,
    /// Authentication for the conversion server.
    pub auth: AuthConfig,
    /// Name of the guest to create.
    pub guestname: String,
    /// Number of virtual CPUs to give the guest.
    pub vcpus: u32,
    /// Guest memory in bytes.
    pub memory: u64,
    /// Fixed disks to convert, in order (device basenames or absolute
    /// paths).
    pub disks: Vec<String>,
    /// Removable (optical) devices, in order.
    pub removable: Vec<String>,
    /// Network interfaces of the physical machine, in order.
    pub interfaces: Vec<String>,
    /// Network mapping strings, in order.
    pub network_map: Vec<String>,
    /// Output selection for the remote tool.
    pub output: OutputConfig,
}

impl Config {
    /// A configuration with fixed defaults and nothing machine-derived.
    pub fn new() -> Config {
        Config {
            remote: RemoteConfig {
                server: None,
                port: 22,
            },
            auth: AuthConfig {
                username: "root".to_string(),
                password: String::new(),
                identity: IdentityConfig::default(),
                sudo: false,
            },
            guestname: String::new(),
            vcpus: 1,
            memory: 1024 * 1024 * 1024,
            disks: Vec::new(),
            removable: Vec::new(),
            interfaces: Vec::new(),
            network_map: Vec::new(),
            output: OutputConfig {
                kind: Some("local".to_string()),
                storage: Some("/var/tmp".to_string()),
                ..OutputConfig::default()
            },
        }
    }

    /// Fill in the machine-derived defaults: guest name from the local
    /// hostname, vcpus and memory from the physical hardware, and the
    /// discovered disk, removable-media and network-interface sets.
    pub fn set_defaults(&mut self, disks: &[String], removable: &[String]) -> Result<()> {
        self.guestname = default_guestname();
        self.vcpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        self.memory = default_memory();
        self.disks = disks.to_vec();
        self.removable = removable.to_vec();
        self.interfaces = find_all_interfaces()?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

/// Default guest name, derived from the source hostname.  If we assume the
/// machine gets its hostname from DHCP there is a better than average
/// chance this is the real name; it beats fishing around in the guest
/// filesystem.  An FQDN is truncated before the first dot.
fn default_guestname() -> String {
    let uname = rustix::system::uname();
    let hostname = uname.nodename().to_string_lossy();
    match hostname.split('.').next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => random_base36(8),
    }
}

/// Physical RAM rounded up to the next power of two, since the total
/// physical pages reported by the kernel exclude kernel memory.
fn default_memory() -> u64 {
    // SAFETY: sysconf is a simple libc query with no memory arguments.
    #[allow(unsafe_code)]
    let (phys_pages, page_size) = unsafe {
        (
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_PAGESIZE),
        )
    };
    if phys_pages <= 0 || page_size <= 0 {
        warn!("sysconf failed, defaulting guest memory to 1G");
        return 1024 * 1024 * 1024;
    }
    round_up_power_of_2(phys_pages as u64 * page_size as u64)
}

pub(crate) fn round_up_power_of_2(n: u64) -> u64 {
    n.next_power_of_two()
}

/// Enumerate the network interfaces in `/sys/class/net` which match the
/// common patterns for physical NICs (systemd predictable names,
/// biosdevname, classic ethN, wireless).  PPP, SLIP, WWAN, bridges and the
/// like are ignored.
fn find_all_interfaces() -> Result<Vec<String>> {
    interfaces_in("/sys/class/net").context("reading /sys/class/net")
}

fn interfaces_in(dir: &str) -> std::io::Result<Vec<String>> {
    let mut interfaces = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if ["em", "en", "eth", "wl"].iter().any(|p| name.starts_with(p)) {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    Ok(interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up_power_of_2() {
        assert_eq!(round_up_power_of_2(1), 1);
        assert_eq!(round_up_power_of_2(2), 2);
        assert_eq!(round_up_power_of_2(3), 4);
        assert_eq!(round_up_power_of_2(4 * 1024 * 1024 * 1024 - 1), 4 * 1024 * 1024 * 1024);
        assert_eq!(round_up_power_of_2(4 * 1024 * 1024 * 1024), 4 * 1024 * 1024 * 1024);
        assert_eq!(
            round_up_power_of_2(3 * 1024 * 1024 * 1024),
            4 * 1024 * 1024 * 1024
        );
    }

    #[test]
    fn test_output_allocation_display() {
        assert_eq!(OutputAllocation::Sparse.to_string(), "sparse");
        assert_eq!(OutputAllocation::Preallocated.to_string(), "preallocated");
    }

    #[test]
    fn test_config_serializes_without_secrets() {
        let mut config = Config::new();
        config.auth.password = "hunter2".to_string();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    #[test]
    fn test_interfaces_filter_and_sort() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["lo", "eth1", "eth0", "wlp3s0", "virbr0", "ppp0", "enp0s31f6"] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
        }
        let interfaces = interfaces_in(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(interfaces, ["enp0s31f6", "eth0", "eth1", "wlp3s0"]);
    }
}
