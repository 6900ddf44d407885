// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stable identifier for the worker machine.
//!
//! The identifier is written into every claim this process takes, and the
//! recovery sweep uses it to find claims left behind by a previous run on the
//! same host. It must therefore survive restarts: it is derived from the
//! systemd/dbus machine id when one exists, and otherwise from a SHA-256 over
//! host attributes (OS, hostname, release, version, architecture, processor,
//! first hardware MAC address).

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::debug;

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Resolve the processor identifier, preferring an explicit override.
pub fn processor_identifier(override_id: Option<&str>) -> String {
    match override_id.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => id.to_string(),
        None => derive(),
    }
}

/// Derive the identifier from the host.
pub fn derive() -> String {
    if let Some(machine_id) = read_machine_id(MACHINE_ID_PATHS) {
        debug!("Processor identifier derived from machine id");
        return digest(&["machine-id", &machine_id]);
    }

    debug!("No machine id found, deriving processor identifier from host attributes");
    HostAttributes::collect().fingerprint()
}

/// First non-empty machine id among `paths`.
fn read_machine_id<P: AsRef<Path>>(paths: &[P]) -> Option<String> {
    paths.iter().find_map(|path| {
        fs::read_to_string(path)
            .ok()
            .map(|content| content.trim().to_string())
            .filter(|id| !id.is_empty())
    })
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Host attributes feeding the generic fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HostAttributes {
    system: String,
    hostname: String,
    release: String,
    version: String,
    machine: String,
    processor: String,
    mac: String,
}

impl HostAttributes {
    #[cfg(unix)]
    fn collect() -> Self {
        let mut attrs = Self::default();

        if let Ok(uts) = nix::sys::utsname::uname() {
            attrs.system = uts.sysname().to_string_lossy().into_owned();
            attrs.release = uts.release().to_string_lossy().into_owned();
            attrs.version = uts.version().to_string_lossy().into_owned();
            attrs.machine = uts.machine().to_string_lossy().into_owned();
        }
        if let Ok(hostname) = nix::unistd::gethostname() {
            attrs.hostname = hostname.to_string_lossy().into_owned();
        }

        attrs.processor = cpu_model().unwrap_or_else(|| attrs.machine.clone());
        attrs.mac = first_mac_address(Path::new("/sys/class/net")).unwrap_or_default();
        attrs
    }

    #[cfg(not(unix))]
    fn collect() -> Self {
        Self {
            system: std::env::consts::OS.to_string(),
            hostname: std::env::var("COMPUTERNAME").unwrap_or_default(),
            machine: std::env::consts::ARCH.to_string(),
            processor: std::env::var("PROCESSOR_IDENTIFIER").unwrap_or_default(),
            ..Self::default()
        }
    }

    fn fingerprint(&self) -> String {
        digest(&[
            &self.system,
            &self.hostname,
            &self.release,
            &self.version,
            &self.machine,
            &self.processor,
            &self.mac,
        ])
    }
}

#[cfg(unix)]
fn cpu_model() -> Option<String> {
    let cpuinfo = fs::read_to_string("/proc/cpuinfo").ok()?;
    cpuinfo
        .lines()
        .find(|line| line.starts_with("model name"))
        .and_then(|line| line.split_once(':'))
        .map(|(_, model)| model.trim().to_string())
        .filter(|model| !model.is_empty())
}

/// MAC address of the first non-loopback interface, in name order.
fn first_mac_address(net_dir: &Path) -> Option<String> {
    let mut names: Vec<String> = fs::read_dir(net_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.iter().find_map(|name| {
        fs::read_to_string(net_dir.join(name).join("address"))
            .ok()
            .map(|mac| mac.trim().to_ascii_lowercase())
            .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_wins() {
        assert_eq!(processor_identifier(Some("worker-1")), "worker-1");
        assert_eq!(processor_identifier(Some("  worker-2 ")), "worker-2");
    }

    #[test]
    fn test_blank_override_is_ignored() {
        assert_eq!(processor_identifier(Some("   ")), derive());
    }

    #[test]
    fn test_derive_is_stable_sha256_hex() {
        let first = derive();
        assert_eq!(first, derive());
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_machine_id_lookup_order() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty");
        let missing = dir.path().join("missing");
        let real = dir.path().join("machine-id");
        fs::write(&empty, "\n").unwrap();
        fs::write(&real, "abc123\n").unwrap();

        assert_eq!(
            read_machine_id(&[&missing, &empty, &real]),
            Some("abc123".to_string())
        );
        assert_eq!(read_machine_id(&[&missing, &empty]), None);
    }

    #[test]
    fn test_fingerprint_distinguishes_hosts() {
        let a = HostAttributes {
            system: "Linux".to_string(),
            hostname: "worker-a".to_string(),
            machine: "x86_64".to_string(),
            ..Default::default()
        };
        let b = HostAttributes {
            hostname: "worker-b".to_string(),
            ..a.clone()
        };

        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_first_mac_address_skips_loopback_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        for (iface, mac) in [
            ("lo", "00:00:00:00:00:00"),
            ("dummy0", "00:00:00:00:00:00"),
            ("eth1", "AA:BB:CC:DD:EE:02"),
            ("eth0", "aa:bb:cc:dd:ee:01"),
        ] {
            let iface_dir = dir.path().join(iface);
            fs::create_dir_all(&iface_dir).unwrap();
            fs::write(iface_dir.join("address"), format!("{}\n", mac)).unwrap();
        }

        assert_eq!(
            first_mac_address(dir.path()),
            Some("aa:bb:cc:dd:ee:01".to_string())
        );
    }
}
