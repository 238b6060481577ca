use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use sysinfo::System;

const BYTES_PER_MIB: u64 = 1024 * 1024;
const BYTES_PER_GIB: u64 = 1024 * BYTES_PER_MIB;

/// Live hardware capacity used for context and offload sizing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub total_ram: u64,
    pub free_ram: u64,
    pub cpu_threads: u32,
    pub gpu_present: bool,
    pub gpu_kind: GpuKind,
    pub vram_total: Option<u64>,
    pub vram_free: Option<u64>,
}

impl HardwareSnapshot {
    /// Coarse key for caching derived settings; free memory is bucketed to whole GiB
    pub fn signature(&self) -> String {
        format!(
            "ram{}-{}:cpu{}:{:?}:vram{}-{}",
            self.total_ram / BYTES_PER_GIB,
            self.free_ram / BYTES_PER_GIB,
            self.cpu_threads,
            self.gpu_kind,
            self.vram_total.unwrap_or(0) / BYTES_PER_GIB,
            self.vram_free.unwrap_or(0) / BYTES_PER_GIB,
        )
    }

    /// Usable VRAM when a GPU is present and reports free memory
    pub fn usable_vram(&self) -> Option<u64> {
        if !self.gpu_present {
            return None;
        }
        self.vram_free.or(self.vram_total).filter(|v| *v > 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuKind {
    #[default]
    None,
    Metal,      // Apple Silicon
    Cuda,       // NVIDIA
    Vulkan,     // AMD/Intel
}

/// Source of hardware snapshots
pub trait HardwareProbe: Send + Sync {
    fn snapshot(&self) -> HardwareSnapshot;
}

/// Probe backed by sysinfo and the GPU vendor tools, cached for a short TTL
pub struct SystemHardwareProbe {
    ttl: Duration,
    cached: Mutex<Option<(Instant, HardwareSnapshot)>>,
}

impl SystemHardwareProbe {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    fn detect() -> HardwareSnapshot {
        let mut sys = System::new();
        sys.refresh_memory();

        let total_ram = sys.total_memory();
        let free_ram = sys.available_memory();
        let cpu_threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4); // Default to 4 threads

        let (gpu_kind, vram_total, vram_free) = Self::detect_gpu(total_ram, free_ram);

        let snapshot = HardwareSnapshot {
            total_ram,
            free_ram,
            cpu_threads,
            gpu_present: gpu_kind != GpuKind::None,
            gpu_kind,
            vram_total,
            vram_free,
        };
        debug!("Hardware snapshot: {:?}", snapshot);
        snapshot
    }

    /// Detect GPU kind and VRAM, querying the device where a tool exists
    fn detect_gpu(total_ram: u64, free_ram: u64) -> (GpuKind, Option<u64>, Option<u64>) {
        // Apple Silicon shares memory with the GPU
        if cfg!(target_os = "macos") && std::env::consts::ARCH == "aarch64" {
            let budget = total_ram / 3 * 2;
            return (GpuKind::Metal, Some(budget), Some(free_ram.min(budget)));
        }

        if let Some((total, free)) = Self::query_nvidia_smi() {
            return (GpuKind::Cuda, Some(total), Some(free));
        }

        if Self::has_vulkan_loader() {
            // Vulkan presence tells us nothing about capacity
            return (GpuKind::Vulkan, None, None);
        }

        (GpuKind::None, None, None)
    }

    /// Query the first NVIDIA device for total and free memory
    fn query_nvidia_smi() -> Option<(u64, u64)> {
        let smi = which::which("nvidia-smi").ok()?;
        let output = Command::new(smi)
            .args(["--query-gpu=memory.total,memory.free", "--format=csv,noheader,nounits"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_nvidia_smi(&text)
    }

    fn has_vulkan_loader() -> bool {
        if std::env::var("VULKAN_SDK").is_ok() {
            return true;
        }

        // Linux paths
        if std::path::Path::new("/usr/lib/x86_64-linux-gnu/libvulkan.so.1").exists()
            || std::path::Path::new("/usr/lib/libvulkan.so.1").exists()
        {
            return true;
        }

        // Windows: Check for Vulkan runtime
        #[cfg(target_os = "windows")]
        {
            if std::path::Path::new("C:\\Windows\\System32\\vulkan-1.dll").exists() {
                return true;
            }
        }

        false
    }
}

impl Default for SystemHardwareProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl HardwareProbe for SystemHardwareProbe {
    fn snapshot(&self) -> HardwareSnapshot {
        let mut guard = match self.cached.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some((at, snapshot)) = guard.as_ref() {
            if at.elapsed() < self.ttl {
                return snapshot.clone();
            }
        }

        let snapshot = Self::detect();
        if guard.is_none() {
            info!(
                "Detected hardware: {} GiB RAM, {} threads, GPU {:?}",
                snapshot.total_ram / BYTES_PER_GIB,
                snapshot.cpu_threads,
                snapshot.gpu_kind
            );
        }
        *guard = Some((Instant::now(), snapshot.clone()));
        snapshot
    }
}

/// Parse the first line of `nvidia-smi` memory output (MiB values)
fn parse_nvidia_smi(text: &str) -> Option<(u64, u64)> {
    let line = text.lines().next()?;
    let mut parts = line.split(',').map(|p| p.trim().parse::<u64>());
    let total = parts.next()?.ok()?;
    let free = parts.next()?.ok()?;
    Some((total * BYTES_PER_MIB, free * BYTES_PER_MIB))
}
