//! GPU detection
//!
//! Looks for an accelerator the inference backend can offload to. Detection is
//! best effort: every failure path reports "no accelerator" rather than erroring.

use serde::Serialize;
use std::process::Command;

/// Kind of accelerator found on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuKind {
    #[default]
    None,
    Cuda,
    Metal,
    Other,
}

impl GpuKind {
    /// Device label reported in model info (`cuda`, `metal`, `cpu`, ...)
    pub fn device_label(&self) -> &'static str {
        match self {
            GpuKind::None => "cpu",
            GpuKind::Cuda => "cuda",
            GpuKind::Metal => "metal",
            GpuKind::Other => "gpu",
        }
    }
}

/// GPU information
#[derive(Debug, Clone, Default, Serialize)]
pub struct GpuInfo {
    pub name: String,
    pub kind: GpuKind,
    pub vram_total_mb: u64,
    pub vram_used_mb: u64,
    /// Whether `vram_used_mb` is a live reading rather than a placeholder
    pub vram_usage_available: bool,
    pub is_available: bool,
}

impl GpuInfo {
    fn not_detected() -> Self {
        Self {
            name: "GPU not detected".to_string(),
            ..Self::default()
        }
    }

    /// Free VRAM in MB when a live reading exists
    pub fn vram_free_mb(&self) -> Option<u64> {
        if self.is_available && self.vram_usage_available {
            Some(self.vram_total_mb.saturating_sub(self.vram_used_mb))
        } else {
            None
        }
    }

    /// Fraction of VRAM in use, when measurable
    pub fn utilization(&self) -> Option<f64> {
        if self.is_available && self.vram_usage_available && self.vram_total_mb > 0 {
            Some(self.vram_used_mb as f64 / self.vram_total_mb as f64)
        } else {
            None
        }
    }
}

/// Detect available GPU (best effort)
pub fn detect_gpu() -> GpuInfo {
    if let Some(info) = detect_gpu_nvidia_smi() {
        return info;
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(info) = detect_gpu_apple_silicon() {
            return info;
        }
    }

    GpuInfo::not_detected()
}

/// Query nvidia-smi for the first device. Works on Linux and Windows.
fn detect_gpu_nvidia_smi() -> Option<GpuInfo> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

fn parse_nvidia_smi(stdout: &str) -> Option<GpuInfo> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
    if parts.len() < 3 {
        return None;
    }

    Some(GpuInfo {
        name: parts[0].to_string(),
        kind: GpuKind::Cuda,
        vram_total_mb: parts[1].parse::<u64>().ok()?,
        vram_used_mb: parts[2].parse::<u64>().ok()?,
        vram_usage_available: true,
        is_available: true,
    })
}

/// Apple Silicon exposes unified memory to Metal; report system RAM as VRAM.
#[cfg(target_os = "macos")]
fn detect_gpu_apple_silicon() -> Option<GpuInfo> {
    let output = Command::new("sysctl")
        .args(["-n", "machdep.cpu.brand_string"])
        .output()
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let brand = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !brand.contains("Apple") {
        return None;
    }

    let total_ram_mb = crate::system::resources::get_resource_usage().ram_total_mb;

    Some(GpuInfo {
        name: format!("{} GPU (Metal, Unified Memory)", brand),
        kind: GpuKind::Metal,
        vram_total_mb: total_ram_mb,
        vram_used_mb: 0,
        vram_usage_available: false,
        is_available: true,
    })
}
