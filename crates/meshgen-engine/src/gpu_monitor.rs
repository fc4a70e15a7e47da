//! Device memory probe and footprint accounting.
//!
//! `total` comes from the hardware (nvidia-smi for CUDA, host RAM for cpu/mps).
//! `allocated` and `reserved` are accounted from the footprints stages report
//! when they are instantiated and dropped, mirroring an allocator that keeps
//! freed blocks cached until asked to release them.

use std::process::Command;
use std::sync::Mutex;

use meshgen_types::{Device, MemoryInfo};

pub const MB_TO_BYTES: u64 = 1024 * 1024;

/// Read-only probe plus the accounting sink stages report to.
pub trait MemoryMonitor: Send + Sync {
    fn snapshot(&self) -> MemoryInfo;
    fn record_allocation(&self, bytes: u64);
    fn record_release(&self, bytes: u64);
    /// Return cached-but-unused memory (reserved above allocated) to the device.
    fn release_cached(&self);
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    allocated: u64,
    reserved: u64,
}

pub struct DeviceMemoryMonitor {
    device: Device,
    total_bytes: u64,
    counters: Mutex<Counters>,
}

impl DeviceMemoryMonitor {
    /// Probe the device once for its capacity.
    pub fn probe(device: Device) -> Self {
        let total_bytes = match device {
            Device::Cuda => query_cuda_total_bytes().unwrap_or_else(|| {
                log::warn!(target: "monitor", "Could not query CUDA memory via nvidia-smi, reporting GPU as unavailable");
                0
            }),
            Device::Cpu | Device::Mps => host_total_bytes(),
        };
        log::info!(
            target: "monitor",
            "Memory monitor for {device}: {:.1}GB total",
            total_bytes as f64 / (1024.0 * MB_TO_BYTES as f64)
        );
        Self::with_total(device, total_bytes)
    }

    pub fn with_total(device: Device, total_bytes: u64) -> Self {
        Self {
            device,
            total_bytes,
            counters: Mutex::new(Counters::default()),
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryMonitor for DeviceMemoryMonitor {
    fn snapshot(&self) -> MemoryInfo {
        let counters = *self.counters();
        MemoryInfo {
            device: self.device,
            allocated_bytes: counters.allocated,
            reserved_bytes: counters.reserved,
            total_bytes: self.total_bytes,
        }
    }

    fn record_allocation(&self, bytes: u64) {
        let mut counters = self.counters();
        counters.allocated = counters.allocated.saturating_add(bytes);
        counters.reserved = counters.reserved.max(counters.allocated);
    }

    fn record_release(&self, bytes: u64) {
        // Freed blocks stay reserved until release_cached.
        let mut counters = self.counters();
        counters.allocated = counters.allocated.saturating_sub(bytes);
    }

    fn release_cached(&self) {
        let mut counters = self.counters();
        counters.reserved = counters.allocated;
    }
}

/// Total memory of the first GPU in bytes, via nvidia-smi.
pub fn query_cuda_total_bytes() -> Option<u64> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=memory.total", "--format=csv,noheader,nounits"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_nvidia_smi_mb(&String::from_utf8_lossy(&output.stdout)).map(|mb| mb * MB_TO_BYTES)
}

// One line per GPU, value in MiB.
fn parse_nvidia_smi_mb(output: &str) -> Option<u64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
        .filter(|mb| *mb > 0.0)
        .map(|mb| mb as u64)
}

fn host_total_bytes() -> u64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    system.total_memory()
}
