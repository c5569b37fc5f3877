//! Host facts for the `system` endpoint: uptime, load, memory, root disk, identity.
//!
//! Everything is read from `/proc`, `/etc/os-release` and `statvfs`; no
//! privileged commands are needed. Each part degrades to an empty value on its
//! own so one unreadable file never blanks the whole report.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{MpError, Result};

/// Snapshot served by the `system` endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemFacts {
    /// Human uptime, e.g. `up 3 days, 04:05`.
    pub uptime: String,
    /// 1, 5 and 15 minute load averages separated by spaces.
    pub load: String,
    pub mem_mb: MemoryMb,
    pub disk_root: DiskUsage,
    /// `Static hostname: … | Operating System: … | Kernel: …`.
    pub host: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemoryMb {
    pub total: u64,
    pub used: u64,
}

/// Root filesystem usage in `df -hP` style strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskUsage {
    pub fs: String,
    pub size: String,
    pub used: String,
    pub avail: String,
    pub usep: String,
    pub mount: String,
}

impl Default for DiskUsage {
    fn default() -> Self {
        Self {
            fs: String::new(),
            size: String::new(),
            used: String::new(),
            avail: String::new(),
            usep: String::new(),
            mount: "/".to_string(),
        }
    }
}

/// Mount-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub path: PathBuf,
    pub device: String,
    pub fs_type: String,
}

/// Reads host facts relative to configurable roots so tests can stage files.
#[derive(Debug, Clone)]
pub struct FactsCollector {
    proc_dir: PathBuf,
    os_release: PathBuf,
    disk_path: PathBuf,
}

impl Default for FactsCollector {
    fn default() -> Self {
        Self {
            proc_dir: PathBuf::from("/proc"),
            os_release: PathBuf::from("/etc/os-release"),
            disk_path: PathBuf::from("/"),
        }
    }
}

impl FactsCollector {
    #[must_use]
    pub fn with_roots(proc_dir: PathBuf, os_release: PathBuf, disk_path: PathBuf) -> Self {
        Self {
            proc_dir,
            os_release,
            disk_path,
        }
    }

    /// Collect every fact, substituting defaults for parts that fail.
    pub fn collect(&self) -> SystemFacts {
        let uptime = read_to_string(&self.proc_dir.join("uptime"))
            .ok()
            .and_then(|raw| parse_uptime_secs(&raw))
            .map(format_uptime)
            .unwrap_or_default();
        let load = read_to_string(&self.proc_dir.join("loadavg"))
            .ok()
            .map(|raw| parse_loadavg(&raw))
            .unwrap_or_default();
        let mem_mb = read_to_string(&self.proc_dir.join("meminfo"))
            .and_then(|raw| parse_meminfo(&raw))
            .unwrap_or_else(|error| {
                eprintln!("[MP-FACTS] memory info unavailable: {error}");
                MemoryMb::default()
            });
        let disk_root = self.disk_usage().unwrap_or_else(|error| {
            eprintln!("[MP-FACTS] disk usage unavailable: {error}");
            DiskUsage::default()
        });

        SystemFacts {
            uptime,
            load,
            mem_mb,
            disk_root,
            host: self.host_summary(),
        }
    }

    fn disk_usage(&self) -> Result<DiskUsage> {
        let stat = nix::sys::statvfs::statvfs(&self.disk_path).map_err(|errno| MpError::Io {
            path: self.disk_path.clone(),
            source: std::io::Error::from(errno),
        })?;
        let fragment = stat.fragment_size();
        let total = stat.blocks().saturating_mul(fragment);
        let free = stat.blocks_free().saturating_mul(fragment);
        let avail = stat.blocks_available().saturating_mul(fragment);

        let mounts = read_to_string(&self.proc_dir.join("self").join("mounts"))
            .map(|raw| parse_proc_mounts(&raw))
            .unwrap_or_default();
        let mount = find_mount(&self.disk_path, &mounts);

        Ok(DiskUsage {
            fs: mount.map(|m| m.device.clone()).unwrap_or_default(),
            size: human_size(total),
            used: human_size(total.saturating_sub(free)),
            avail: human_size(avail),
            usep: format!("{}%", used_percent(total, free, avail)),
            mount: mount.map_or_else(
                || self.disk_path.display().to_string(),
                |m| m.path.display().to_string(),
            ),
        })
    }

    fn host_summary(&self) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Ok(name) = nix::unistd::gethostname() {
            parts.push(format!("Static hostname: {}", name.to_string_lossy()));
        }
        if let Some(pretty) = read_to_string(&self.os_release)
            .ok()
            .and_then(|raw| parse_os_release(&raw).remove("PRETTY_NAME"))
        {
            parts.push(format!("Operating System: {pretty}"));
        }
        if let Ok(uts) = nix::sys::utsname::uname() {
            parts.push(format!(
                "Kernel: {} {}",
                uts.sysname().to_string_lossy(),
                uts.release().to_string_lossy()
            ));
        }
        parts.join(" | ")
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| MpError::io(path, source))
}

fn parse_uptime_secs(raw: &str) -> Option<u64> {
    let first = raw.split_whitespace().next()?;
    let secs = first.split('.').next()?;
    secs.parse().ok()
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    match days {
        0 => format!("up {hours:02}:{minutes:02}"),
        1 => format!("up 1 day, {hours:02}:{minutes:02}"),
        _ => format!("up {days} days, {hours:02}:{minutes:02}"),
    }
}

fn parse_loadavg(raw: &str) -> String {
    raw.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

/// `used` follows `free -m`: total minus available.
fn parse_meminfo(raw: &str) -> Result<MemoryMb> {
    let mut values = HashMap::<&str, u64>::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Some((key, rest)) = line.split_once(':') else {
            return Err(MpError::Runtime {
                details: format!("invalid meminfo line (missing ':'): {line}"),
            });
        };
        let mut fields = rest.split_whitespace();
        let value = fields
            .next()
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| MpError::Runtime {
                details: format!("invalid meminfo value in line: {line}"),
            })?;
        let kib = match fields.next() {
            Some("kB") => value,
            None => value / 1024,
            Some(unit) => {
                return Err(MpError::Runtime {
                    details: format!("unsupported meminfo unit {unit:?} in line: {line}"),
                });
            }
        };
        values.insert(key.trim(), kib);
    }

    let field = |key: &str| {
        values.get(key).copied().ok_or_else(|| MpError::Runtime {
            details: format!("missing required meminfo field: {key}"),
        })
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    Ok(MemoryMb {
        total: total / 1024,
        used: total.saturating_sub(available) / 1024,
    })
}

fn parse_proc_mounts(raw: &str) -> Vec<MountPoint> {
    raw.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountPoint {
                path: unescape_mount_path(path),
                device: device.to_string(),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

fn find_mount<'a>(path: &Path, mounts: &'a [MountPoint]) -> Option<&'a MountPoint> {
    mounts
        .iter()
        .filter(|mount| path.starts_with(&mount.path))
        .max_by_key(|mount| mount.path.as_os_str().len())
}

/// Decode the kernel's `\NNN` octal escapes in mount paths.
fn unescape_mount_path(raw: &str) -> PathBuf {
    let input = raw.as_bytes();
    let mut bytes = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'\\'
            && i + 3 < input.len()
            && input[i + 1..=i + 3].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            bytes.push(
                (input[i + 1] - b'0') * 64 + (input[i + 2] - b'0') * 8 + (input[i + 3] - b'0'),
            );
            i += 4;
        } else {
            bytes.push(input[i]);
            i += 1;
        }
    }
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_vec(bytes))
    }
    #[cfg(not(unix))]
    {
        PathBuf::from(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn parse_os_release(raw: &str) -> HashMap<String, String> {
    raw.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_string(),
                value.trim().trim_matches('"').trim_matches('\'').to_string(),
            )
        })
        .collect()
}

/// Percentage as `df` reports it: used / (used + avail), rounded up.
fn used_percent(total: u64, free: u64, avail: u64) -> u64 {
    let used = total.saturating_sub(free);
    let denom = used + avail;
    if denom == 0 {
        return 0;
    }
    (used * 100).div_ceil(denom)
}

/// Power-of-1024 size with a single-letter suffix, like `df -h`.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["", "K", "M", "G", "T", "P"];
    let mut unit = 0;
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}")
    } else if value < 10.0 {
        format!("{:.1}{}", (value * 10.0).ceil() / 10.0, UNITS[unit])
    } else {
        format!("{:.0}{}", value.ceil(), UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_like_the_uptime_command() {
        assert_eq!(parse_uptime_secs("350735.47 234388.90\n"), Some(350_735));
        assert_eq!(format_uptime(350_735), "up 4 days, 01:25");
        assert_eq!(format_uptime(90_000), "up 1 day, 01:00");
        assert_eq!(format_uptime(3_660), "up 01:01");
    }

    #[test]
    fn loadavg_keeps_three_averages() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/389 12345\n"), "0.52 0.58 0.59");
    }

    #[test]
    fn meminfo_reports_used_as_total_minus_available() {
        let mem = parse_meminfo(
            "MemTotal:        4096000 kB\n\
             MemFree:          512000 kB\n\
             MemAvailable:    1024000 kB\n",
        )
        .expect("meminfo should parse");
        assert_eq!(mem.total, 4000);
        assert_eq!(mem.used, 3000);
    }

    #[test]
    fn meminfo_missing_available_is_error() {
        let error = parse_meminfo("MemTotal: 1024 kB\n").expect_err("should fail");
        assert!(error.to_string().contains("MemAvailable"));
    }

    #[test]
    fn mount_lookup_prefers_longest_prefix() {
        let mounts = parse_proc_mounts(
            "/dev/vda1 / ext4 rw,relatime 0 0\n\
             /dev/vdb1 /var/mail xfs rw 0 0\n\
             tmpfs /run tmpfs rw 0 0\n",
        );
        let mount = find_mount(Path::new("/var/mail/spool"), &mounts).expect("mount");
        assert_eq!(mount.device, "/dev/vdb1");
        let root = find_mount(Path::new("/"), &mounts).expect("root");
        assert_eq!(root.fs_type, "ext4");
    }

    #[test]
    fn mount_paths_are_unescaped() {
        assert_eq!(
            unescape_mount_path("/mnt/mail\\040store"),
            PathBuf::from("/mnt/mail store")
        );
        assert_eq!(unescape_mount_path("/mnt/a\\04"), PathBuf::from("/mnt/a\\04"));
    }

    #[test]
    fn os_release_pretty_name_is_unquoted() {
        let parsed = parse_os_release("NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n");
        assert_eq!(
            parsed.get("PRETTY_NAME").map(String::as_str),
            Some("Debian GNU/Linux 12 (bookworm)")
        );
    }

    #[test]
    fn human_sizes_match_df_style() {
        assert_eq!(human_size(512), "512");
        assert_eq!(human_size(20 * 1024 * 1024 * 1024), "20G");
        assert_eq!(human_size(4_831_838_208), "4.5G");
        assert_eq!(used_percent(100, 40, 50), 55);
        assert_eq!(used_percent(0, 0, 0), 0);
    }

    #[test]
    fn collect_from_staged_proc_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let proc_dir = dir.path().join("proc");
        fs::create_dir_all(proc_dir.join("self")).expect("mkdir");
        fs::write(proc_dir.join("uptime"), "7200.00 100.00\n").expect("uptime");
        fs::write(proc_dir.join("loadavg"), "1.00 0.50 0.25 2/100 42\n").expect("loadavg");
        fs::write(
            proc_dir.join("meminfo"),
            "MemTotal: 2048000 kB\nMemAvailable: 1024000 kB\n",
        )
        .expect("meminfo");
        let os_release = dir.path().join("os-release");
        fs::write(&os_release, "PRETTY_NAME=\"Test OS 1\"\n").expect("os-release");

        let facts =
            FactsCollector::with_roots(proc_dir, os_release, dir.path().to_path_buf()).collect();
        assert_eq!(facts.uptime, "up 02:00");
        assert_eq!(facts.load, "1.00 0.50 0.25");
        assert_eq!(facts.mem_mb, MemoryMb { total: 2000, used: 1000 });
        assert!(facts.host.contains("Operating System: Test OS 1"));
        assert!(facts.disk_root.usep.ends_with('%'));
    }

    #[test]
    fn missing_proc_files_degrade_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let facts = FactsCollector::with_roots(
            dir.path().join("absent"),
            dir.path().join("absent-os-release"),
            dir.path().to_path_buf(),
        )
        .collect();
        assert!(facts.uptime.is_empty());
        assert_eq!(facts.mem_mb, MemoryMb::default());
    }
}
