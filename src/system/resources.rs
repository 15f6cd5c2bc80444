//! System resource monitoring
//!
//! RAM readings used by the load-time resource check and `/system/info`.

use serde::Serialize;

#[cfg(any(target_os = "windows", target_os = "macos"))]
use std::process::Command;

/// System memory usage in MB. All zero when the platform query fails.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResourceUsage {
    pub ram_used_mb: u64,
    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
}

impl ResourceUsage {
    /// True when the platform query produced real numbers
    pub fn is_known(&self) -> bool {
        self.ram_total_mb > 0
    }

    /// Percentage of RAM in use
    pub fn usage_percent(&self) -> f64 {
        if self.ram_total_mb == 0 {
            return 0.0;
        }
        self.ram_used_mb as f64 * 100.0 / self.ram_total_mb as f64
    }
}

/// Get system memory usage (best effort)
pub fn get_resource_usage() -> ResourceUsage {
    #[cfg(target_os = "linux")]
    let usage = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| parse_meminfo(&s))
        .unwrap_or_default();

    #[cfg(target_os = "macos")]
    let usage = get_resource_usage_macos();

    #[cfg(target_os = "windows")]
    let usage = get_resource_usage_windows();

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    let usage = ResourceUsage::default();

    usage
}

/// Number of logical CPUs
pub fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Parse `/proc/meminfo` (values in kB)
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo(contents: &str) -> Option<ResourceUsage> {
    let field = |name: &str| -> Option<u64> {
        contents
            .lines()
            .find(|l| l.starts_with(name))?
            .trim_start_matches(name)
            .trim()
            .trim_end_matches("kB")
            .trim()
            .parse::<u64>()
            .ok()
    };

    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;

    Some(ResourceUsage {
        ram_used_mb: total_kb.saturating_sub(available_kb) / 1024,
        ram_total_mb: total_kb / 1024,
        ram_available_mb: available_kb / 1024,
    })
}

// =============================================================================
// macOS
// =============================================================================

#[cfg(target_os = "macos")]
fn get_resource_usage_macos() -> ResourceUsage {
    let total_mb = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8_lossy(&o.stdout).trim().parse::<u64>().ok())
        .map(|bytes| bytes / 1024 / 1024)
        .unwrap_or(0);

    let used_mb = Command::new("vm_stat")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| parse_vm_stat(&String::from_utf8_lossy(&o.stdout)))
        .unwrap_or(0);

    ResourceUsage {
        ram_used_mb: used_mb,
        ram_total_mb: total_mb,
        ram_available_mb: total_mb.saturating_sub(used_mb),
    }
}

/// Used RAM from vm_stat: (active + wired) pages x page size
#[cfg(target_os = "macos")]
fn parse_vm_stat(stdout: &str) -> u64 {
    let mut page_size: u64 = 16384;
    let mut active_pages: u64 = 0;
    let mut wired_pages: u64 = 0;

    let pages = |line: &str, prefix: &str| -> Option<u64> {
        line.strip_prefix(prefix)?
            .trim()
            .trim_end_matches('.')
            .parse::<u64>()
            .ok()
    };

    for line in stdout.lines() {
        if let Some(start) = line.find("page size of ") {
            if let Some(ps) = line[start + 13..]
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
            {
                page_size = ps;
            }
        }
        if let Some(v) = pages(line, "Pages active:") {
            active_pages = v;
        }
        if let Some(v) = pages(line, "Pages wired down:") {
            wired_pages = v;
        }
    }

    (active_pages + wired_pages) * page_size / 1024 / 1024
}

// =============================================================================
// Windows
// =============================================================================

#[cfg(target_os = "windows")]
fn get_resource_usage_windows() -> ResourceUsage {
    let Ok(output) = Command::new("wmic")
        .args(["OS", "get", "FreePhysicalMemory,TotalVisibleMemorySize", "/Value"])
        .output()
    else {
        return ResourceUsage::default();
    };

    if !output.status.success() {
        return ResourceUsage::default();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = |key: &str| -> Option<u64> {
        stdout
            .lines()
            .find_map(|l| l.trim().strip_prefix(key))
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    match (value("FreePhysicalMemory="), value("TotalVisibleMemorySize=")) {
        (Some(free_kb), Some(total_kb)) if total_kb > 0 => ResourceUsage {
            ram_used_mb: total_kb.saturating_sub(free_kb) / 1024,
            ram_total_mb: total_kb / 1024,
            ram_available_mb: free_kb / 1024,
        },
        _ => ResourceUsage::default(),
    }
}
