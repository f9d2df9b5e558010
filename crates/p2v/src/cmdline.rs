//! Kernel-style command line parsing and configuration ingestion.
//!
//! The configuration can be passed on the kernel command line (when
//! booting from the fixed installation image) or via `--cmdline` for
//! debugging.  Both are a flat list of whitespace-separated `key=value`
//! tokens; values may be double-quoted.  All recognized keys carry the
//! `p2v.` prefix.

use color_eyre::eyre::{bail, eyre, Result};
use tracing::warn;

use crate::config::{Config, OutputAllocation};

/// Where the kernel-style command line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdlineSource {
    /// The `--cmdline` option.
    CommandLine,
    /// `/proc/cmdline`.
    ProcCmdline,
}

/// A parsed command line: ordered `(key, value)` pairs.  A key without
/// `=value` is recorded with an empty value.
pub type Cmdline = Vec<(String, String)>;

/// Parse a kernel-style command line string.
pub fn parse_cmdline_string(cmdline: &str) -> Cmdline {
    let mut out = Vec::new();
    let mut chars = cmdline.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '"' {
                        break;
                    }
                    value.push(c);
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }
        out.push((key, value));
    }
    out
}

/// Parse `/proc/cmdline`, or return `None` if it cannot be read (e.g. not
/// on Linux, or inside a restricted container).
pub fn parse_proc_cmdline() -> Option<Cmdline> {
    let content = std::fs::read_to_string("/proc/cmdline").ok()?;
    Some(parse_cmdline_string(content.trim_end_matches('\n')))
}

/// Look up a key, returning the value of its first occurrence.
pub fn get_cmdline_key<'a>(cmdline: &'a Cmdline, key: &str) -> Option<&'a str> {
    cmdline
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::to_string).collect()
}

/// Parse a `p2v.memory` value: an integer immediately followed by `M` or
/// `G`, normalized to bytes.
fn parse_memory(value: &str) -> Result<u64> {
    let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
    let suffix = &value[digits.len()..];
    if digits.is_empty() {
        bail!("cannot parse p2v.memory from kernel command line");
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| eyre!("cannot parse p2v.memory from kernel command line"))?;
    match suffix {
        "M" => Ok(n * 1024 * 1024),
        "G" => Ok(n * 1024 * 1024 * 1024),
        _ => bail!("p2v.memory on kernel command line must be followed by 'G' or 'M'"),
    }
}

/// Override configuration fields from the recognized `p2v.*` keys.
pub fn update_config_from_cmdline(config: &mut Config, cmdline: &Cmdline) -> Result<()> {
    if let Some(p) = get_cmdline_key(cmdline, "p2v.server") {
        config.remote.server = Some(p.to_string());
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.port") {
        config.remote.port = p
            .parse()
            .map_err(|_| eyre!("cannot parse p2v.port from kernel command line"))?;
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.username") {
        config.auth.username = p.to_string();
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.password") {
        config.auth.password = p.to_string();
    }
    // Presence of the key enables sudo, with or without a value.
    if get_cmdline_key(cmdline, "p2v.sudo").is_some() {
        config.auth.sudo = true;
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.name") {
        config.guestname = p.to_string();
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.vcpus") {
        config.vcpus = p
            .parse()
            .map_err(|_| eyre!("cannot parse p2v.vcpus from kernel command line"))?;
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.memory") {
        config.memory = parse_memory(p)?;
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.disks") {
        config.disks = split_list(p);
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.removable") {
        config.removable = split_list(p);
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.interfaces") {
        config.interfaces = split_list(p);
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.network") {
        config.network_map = split_list(p);
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.o") {
        config.output.kind = Some(p.to_string());
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.oa") {
        match p {
            "sparse" => config.output.allocation = OutputAllocation::Sparse,
            "preallocated" => config.output.allocation = OutputAllocation::Preallocated,
            _ => warn!("don't know what p2v.oa={} means", p),
        }
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.oc") {
        config.output.connection = Some(p.to_string());
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.of") {
        config.output.format = Some(p.to_string());
    }
    if let Some(p) = get_cmdline_key(cmdline, "p2v.os") {
        config.output.storage = Some(p.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmdline_string() {
        let cmdline = parse_cmdline_string("foo=bar baz  p2v.test=\"a b c\" flag");
        assert_eq!(
            cmdline,
            vec![
                ("foo".to_string(), "bar".to_string()),
                ("baz".to_string(), String::new()),
                ("p2v.test".to_string(), "a b c".to_string()),
                ("flag".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_get_cmdline_key() {
        let cmdline = parse_cmdline_string("a=1 b=2 a=3");
        assert_eq!(get_cmdline_key(&cmdline, "a"), Some("1"));
        assert_eq!(get_cmdline_key(&cmdline, "b"), Some("2"));
        assert_eq!(get_cmdline_key(&cmdline, "c"), None);
    }

    #[test]
    fn test_ingestion_scenario() {
        // p2v.server=host p2v.port=22 p2v.memory=4G p2v.disks=sda,sdb
        let cmdline =
            parse_cmdline_string("p2v.server=host p2v.port=22 p2v.memory=4G p2v.disks=sda,sdb");
        let mut config = Config::new();
        update_config_from_cmdline(&mut config, &cmdline).unwrap();
        assert_eq!(config.remote.server.as_deref(), Some("host"));
        assert_eq!(config.remote.port, 22);
        assert_eq!(config.memory, 4 * 1024 * 1024 * 1024);
        assert_eq!(config.disks, ["sda", "sdb"]);
        // p2v.server present engages the headless flow.
        assert!(config.remote.server.is_some());
    }

    #[test]
    fn test_memory_suffixes() {
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("4G").unwrap(), 4 * 1024 * 1024 * 1024);
        assert!(parse_memory("4096").is_err());
        assert!(parse_memory("4T").is_err());
        assert!(parse_memory("G").is_err());
    }

    #[test]
    fn test_sudo_presence_enables() {
        let mut config = Config::new();
        update_config_from_cmdline(&mut config, &parse_cmdline_string("p2v.sudo")).unwrap();
        assert!(config.auth.sudo);

        let mut config = Config::new();
        update_config_from_cmdline(&mut config, &parse_cmdline_string("p2v.sudo=")).unwrap();
        assert!(config.auth.sudo);
    }

    /// Only the enumerated p2v.* keys are ingested; in particular the
    /// authentication mode cannot be switched to pubkey from here.
    #[test]
    fn test_unrecognized_keys_are_ignored() {
        let mut config = Config::new();
        update_config_from_cmdline(
            &mut config,
            &parse_cmdline_string("p2v.identity=https://example.com/key p2v.oo=compressed"),
        )
        .unwrap();
        assert_eq!(config.auth.identity.url, None);
        assert!(!config.auth.identity.file_needs_update);
        assert!(config.output.misc.is_empty());
    }

    #[test]
    fn test_unknown_oa_is_ignored() {
        let mut config = Config::new();
        update_config_from_cmdline(&mut config, &parse_cmdline_string("p2v.oa=thick")).unwrap();
        assert_eq!(config.output.allocation, OutputAllocation::None);
    }

    #[test]
    fn test_bad_port_is_an_error() {
        let mut config = Config::new();
        assert!(
            update_config_from_cmdline(&mut config, &parse_cmdline_string("p2v.port=x")).is_err()
        );
    }
}
