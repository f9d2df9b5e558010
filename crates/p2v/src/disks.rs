//! Enumeration of the local block devices to convert.
//!
//! Reads `/sys/block` once at startup and produces two sorted sets of
//! device basenames: fixed disks and removable (optical) media.  The
//! device holding the root filesystem is excluded, as are removable
//! devices with no medium inserted (empty floppy and card readers).

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::Context as _;
use color_eyre::Result;
use rustix::fs::{major, makedev, minor, Mode, OFlags};
use tracing::debug;

const SYS_BLOCK: &str = "/sys/block";
const SYS_DEV_BLOCK: &str = "/sys/dev/block";

/// The discovered block devices, immutable after discovery.
#[derive(Debug, Clone, Default)]
pub struct DiskInventory {
    /// Fixed disks, sorted.
    pub disks: Vec<String>,
    /// Removable (optical) devices, sorted.
    pub removable: Vec<String>,
}

/// True if this `/sys/block` entry matches the common patterns for disk
/// names.
fn is_disk_name(name: &str) -> bool {
    ["cciss!", "hd", "nvme", "sd", "ubd", "vd"]
        .iter()
        .any(|p| name.starts_with(p))
}

/// cciss device `/dev/cciss/c0d0` appears as `/sys/block/cciss!c0d0`.
fn normalize_name(name: &str) -> String {
    name.replacen('!', "/", 1)
}

/// Parse the contents of a sysfs `dev` file ("MAJOR:MINOR") into a device
/// number.
fn parse_dev_number(content: &str) -> Option<u64> {
    let (maj, min) = content.trim_end().split_once(':')?;
    Some(makedev(maj.parse().ok()?, min.parse().ok()?))
}

/// Get the parent device of a partition via
/// `/sys/dev/block/MAJ:MIN/../dev`, or `None` if there is none.
fn partition_parent(sys_dev_block: &Utf8Path, part_dev: u64) -> Option<u64> {
    let path = sys_dev_block.join(format!(
        "{}:{}/../dev",
        major(part_dev),
        minor(part_dev)
    ));
    let content = std::fs::read_to_string(path).ok()?;
    parse_dev_number(&content)
}

/// Whether the named device (eg. `sda`) contains the root filesystem.
/// `root_device` is the device number of the root mount (eg. 8:1 for
/// `/dev/sda1`).  This doesn't work for LVs and so on, but the root device
/// is a regular partition when booted from the installation image, which
/// is where it matters.
fn device_contains(
    rdev: Option<u64>,
    root_device: u64,
    parent_of: &dyn Fn(u64) -> Option<u64>,
) -> bool {
    let Some(rdev) = rdev else {
        return false;
    };
    if rdev == root_device {
        return true;
    }
    parent_of(root_device) == Some(rdev)
}

fn rdev_of(name: &str) -> Option<u64> {
    let stat = rustix::fs::stat(format!("/dev/{name}")).ok()?;
    Some(stat.st_rdev)
}

/// Whether a device has its `removable` attribute set but reports "no
/// medium" when opened, ie. an empty floppy or card reader that cannot be
/// converted.
fn lacks_medium(sys_block: &Utf8Path, name: &str) -> bool {
    let attr = sys_block.join(name).join("removable");
    match std::fs::read_to_string(attr) {
        Ok(s) if s.trim_end() == "1" => {}
        _ => return false,
    }
    matches!(
        rustix::fs::open(
            format!("/dev/{name}"),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        ),
        Err(rustix::io::Errno::NOMEDIUM)
    )
}

fn filter_disks(
    candidates: Vec<String>,
    root_device: u64,
    rdev_of: &dyn Fn(&str) -> Option<u64>,
    parent_of: &dyn Fn(u64) -> Option<u64>,
    lacks_medium: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    let mut disks: Vec<String> = candidates
        .into_iter()
        .filter(|name| !device_contains(rdev_of(name), root_device, parent_of))
        .filter(|name| !(name.starts_with("sd") && lacks_medium(name)))
        .map(|name| normalize_name(&name))
        .collect();
    disks.sort();
    disks
}

/// Enumerate all disks and removable devices in `/sys/block`.
pub fn find_all_disks() -> Result<DiskInventory> {
    let root_device = rustix::fs::stat("/").map(|st| st.st_dev).unwrap_or(0);
    let sys_block = Utf8PathBuf::from(SYS_BLOCK);
    let sys_dev_block = Utf8PathBuf::from(SYS_DEV_BLOCK);

    let mut candidates = Vec::new();
    let mut removable = Vec::new();
    for entry in std::fs::read_dir(&sys_block)
        .with_context(|| format!("opendir: {SYS_BLOCK}"))?
    {
        let entry = entry.with_context(|| format!("readdir: {SYS_BLOCK}"))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_disk_name(&name) {
            candidates.push(name);
        } else if name.starts_with("sr") {
            removable.push(name);
        }
    }

    let disks = filter_disks(
        candidates,
        root_device,
        &rdev_of,
        &|dev| partition_parent(&sys_dev_block, dev),
        &|name| lacks_medium(&sys_block, name),
    );
    removable.sort();

    debug!("disks: {:?} removable: {:?}", disks, removable);
    Ok(DiskInventory { disks, removable })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_name_patterns() {
        for name in ["sda", "sdb", "hda", "nvme0n1", "vda", "ubda", "cciss!c0d0"] {
            assert!(is_disk_name(name), "{name} should be a disk candidate");
        }
        for name in ["sr0", "loop0", "dm-0", "md0", "ram0", "zram0"] {
            assert!(!is_disk_name(name), "{name} should not be a disk candidate");
        }
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("cciss!c0d0"), "cciss/c0d0");
        assert_eq!(normalize_name("sda"), "sda");
    }

    #[test]
    fn test_parse_dev_number() {
        assert_eq!(parse_dev_number("8:16\n"), Some(makedev(8, 16)));
        assert_eq!(parse_dev_number("259:0"), Some(makedev(259, 0)));
        assert_eq!(parse_dev_number("banana"), None);
    }

    /// Two local disks sda and sdb, root on sdc1: the expected disk set is
    /// ["sda", "sdb"], sorted, with sdc excluded as the root's parent.
    #[test]
    fn test_root_disk_excluded() {
        let root_device = makedev(8, 33); // sdc1
        let rdev = |name: &str| -> Option<u64> {
            match name {
                "sdb" => Some(makedev(8, 16)),
                "sda" => Some(makedev(8, 0)),
                "sdc" => Some(makedev(8, 32)),
                _ => None,
            }
        };
        let parent = |dev: u64| -> Option<u64> {
            (dev == makedev(8, 33)).then(|| makedev(8, 32))
        };
        let disks = filter_disks(
            vec!["sdb".to_string(), "sda".to_string(), "sdc".to_string()],
            root_device,
            &rdev,
            &parent,
            &|_| false,
        );
        assert_eq!(disks, ["sda", "sdb"]);
    }

    #[test]
    fn test_empty_removable_excluded() {
        let disks = filter_disks(
            vec!["sda".to_string(), "sdb".to_string()],
            0,
            &|_| None,
            &|_| None,
            &|name| name == "sdb",
        );
        assert_eq!(disks, ["sda"]);
    }

    #[test]
    fn test_partition_parent_via_sysfs_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let sysfs = Utf8Path::from_path(tmp.path()).unwrap();
        // Mimic the sysfs layout: /sys/dev/block/8:33 is a symlink into the
        // parent device's directory tree, so "8:33/../dev" resolves to the
        // parent's dev file.
        let sdc = sysfs.join("devices/sdc");
        std::fs::create_dir_all(sdc.join("sdc1")).unwrap();
        std::fs::write(sdc.join("dev"), "8:32\n").unwrap();
        std::fs::write(sdc.join("sdc1/dev"), "8:33\n").unwrap();
        let by_num = sysfs.join("dev/block");
        std::fs::create_dir_all(&by_num).unwrap();
        std::os::unix::fs::symlink("../../devices/sdc/sdc1", by_num.join("8:33")).unwrap();

        assert_eq!(partition_parent(&by_num, makedev(8, 33)), Some(makedev(8, 32)));
        assert_eq!(partition_parent(&by_num, makedev(8, 34)), None);
    }
}
