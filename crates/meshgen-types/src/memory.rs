use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Compute device the heavy stages are placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cuda,
    Cpu,
    Mps,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
            Device::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Device::Cuda),
            "cpu" => Ok(Device::Cpu),
            "mps" => Ok(Device::Mps),
            other => Err(format!("unknown device '{other}' (expected cuda, cpu or mps)")),
        }
    }
}

/// Point-in-time device memory snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub device: Device,
    pub allocated_bytes: u64,
    pub reserved_bytes: u64,
    pub total_bytes: u64,
}

impl MemoryInfo {
    pub fn allocated_gb(&self) -> f64 {
        self.allocated_bytes as f64 / BYTES_PER_GB
    }

    pub fn reserved_gb(&self) -> f64 {
        self.reserved_bytes as f64 / BYTES_PER_GB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / BYTES_PER_GB
    }

    /// Human summary shown in the unload message and status page.
    pub fn summary(&self) -> String {
        if self.total_bytes == 0 {
            return "GPU not available".to_string();
        }
        format!(
            "GPU Memory: {:.1}GB allocated, {:.1}GB reserved, {:.1}GB total",
            self.allocated_gb(),
            self.reserved_gb(),
            self.total_gb()
        )
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}
