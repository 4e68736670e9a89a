//! Host resource monitoring: procfs CPU/memory sampling, statvfs mount
//! usage and an optional nvidia-smi GPU probe.
//!
//! The static snapshot goes out once in the hello frame; the dynamic
//! snapshot rides every heartbeat. All reads degrade to empty/zero
//! values rather than failing the heartbeat.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs;
use std::process::Command;

use symphony_proto::{
    CpuCoreUsage, CpuDynamic, CpuStatic, DynamicResources, GpuDynamic, GpuStatic, MemoryDynamic,
    MemoryStatic, StaticResources, StorageMountDynamic, StorageMountStatic,
};
use tracing::debug;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

/// Samples host resources. CPU percentages are deltas between
/// consecutive `sample` calls, so the first heartbeat reports zero.
pub struct ResourceMonitor {
    mount_points: Vec<String>,
    prev_total: Option<CpuTimes>,
    prev_cores: Vec<CpuTimes>,
    /// Disabled after the first failed nvidia-smi invocation.
    gpu_probe: bool,
}

impl ResourceMonitor {
    pub fn new(mount_points: Vec<String>) -> Self {
        Self {
            mount_points,
            prev_total: None,
            prev_cores: Vec::new(),
            gpu_probe: true,
        }
    }

    /// Inventory for the hello frame.
    pub fn static_snapshot(&mut self) -> StaticResources {
        let (_, cores) = read_cpu_times();
        let logical_cores = cores.len().max(1) as u32;

        let meminfo = read_meminfo();
        let fs_types = read_mount_fs_types();

        let storage_mounts = self
            .mount_points
            .iter()
            .filter_map(|mp| {
                let (total, _, _) = statvfs(mp)?;
                Some(StorageMountStatic {
                    mount_point: mp.clone(),
                    fs_type: fs_types.get(mp.as_str()).cloned().unwrap_or_default(),
                    total_bytes: total,
                })
            })
            .collect();

        StaticResources {
            cpu: CpuStatic {
                logical_cores,
                max_millicores_total: logical_cores as u64 * 1000,
            },
            memory: MemoryStatic {
                total_bytes: meminfo.total,
            },
            storage_mounts,
            gpus: self.probe_static_gpus(),
        }
    }

    /// Live usage for the heartbeat.
    pub fn sample(&mut self) -> DynamicResources {
        let (total, cores) = read_cpu_times();

        let total_percent = self
            .prev_total
            .map(|prev| usage_percent(prev, total))
            .unwrap_or(0.0);
        let per_core = cores
            .iter()
            .enumerate()
            .map(|(i, times)| CpuCoreUsage {
                core_id: i as u32,
                used_percent: self
                    .prev_cores
                    .get(i)
                    .map(|prev| usage_percent(*prev, *times))
                    .unwrap_or(0.0),
            })
            .collect();
        self.prev_total = Some(total);
        self.prev_cores = cores;

        let meminfo = read_meminfo();
        let used = meminfo.total.saturating_sub(meminfo.available);

        let storage_mounts = self
            .mount_points
            .iter()
            .filter_map(|mp| {
                let (total_bytes, used_bytes, available_bytes) = statvfs(mp)?;
                Some(StorageMountDynamic {
                    mount_point: mp.clone(),
                    used_bytes,
                    available_bytes,
                    used_percent: percent(used_bytes, total_bytes),
                })
            })
            .collect();

        DynamicResources {
            cpu: CpuDynamic {
                total_percent,
                per_core,
            },
            memory: MemoryDynamic {
                used_bytes: used,
                available_bytes: meminfo.available,
                used_percent: percent(used, meminfo.total),
                free_bytes: meminfo.free,
                buffers_bytes: meminfo.buffers,
                cached_bytes: meminfo.cached,
            },
            storage_mounts,
            gpus: self.probe_dynamic_gpus(),
        }
    }

    fn probe_static_gpus(&mut self) -> Vec<GpuStatic> {
        if !self.gpu_probe {
            return Vec::new();
        }
        let Some(rows) = nvidia_smi_query("index,name,memory.total") else {
            self.gpu_probe = false;
            return Vec::new();
        };
        rows.iter()
            .filter_map(|fields| {
                Some(GpuStatic {
                    index: fields.first()?.parse().ok()?,
                    name: fields.get(1)?.clone(),
                    mem_total_bytes: fields.get(2)?.parse::<u64>().ok()? * MIB,
                })
            })
            .collect()
    }

    fn probe_dynamic_gpus(&mut self) -> Vec<GpuDynamic> {
        if !self.gpu_probe {
            return Vec::new();
        }
        let Some(rows) = nvidia_smi_query(
            "index,utilization.gpu,utilization.memory,memory.used,memory.free,temperature.gpu,power.draw",
        ) else {
            self.gpu_probe = false;
            return Vec::new();
        };
        rows.iter()
            .filter_map(|fields| {
                Some(GpuDynamic {
                    index: fields.first()?.parse().ok()?,
                    util_percent: fields.get(1)?.parse().unwrap_or(0.0),
                    mem_util_percent: fields.get(2)?.parse().unwrap_or(0.0),
                    mem_used_bytes: fields.get(3)?.parse::<u64>().unwrap_or(0) * MIB,
                    mem_free_bytes: fields.get(4)?.parse::<u64>().unwrap_or(0) * MIB,
                    temperature_c: fields.get(5)?.parse().unwrap_or(0),
                    power_w: fields.get(6)?.parse().unwrap_or(0.0),
                })
            })
            .collect()
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (part as f64 / whole as f64) * 100.0
    }
}

fn usage_percent(prev: CpuTimes, current: CpuTimes) -> f64 {
    let total = current.total.saturating_sub(prev.total);
    let busy = current.busy.saturating_sub(prev.busy);
    if total == 0 {
        0.0
    } else {
        (busy as f64 / total as f64) * 100.0
    }
}

/// Aggregate and per-core jiffies from /proc/stat.
fn read_cpu_times() -> (CpuTimes, Vec<CpuTimes>) {
    let content = fs::read_to_string("/proc/stat").unwrap_or_default();
    let mut total = CpuTimes::default();
    let mut cores = Vec::new();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else { continue };
        if !label.starts_with("cpu") {
            continue;
        }
        let values: Vec<u64> = parts.filter_map(|v| v.parse().ok()).collect();
        if values.len() < 4 {
            continue;
        }
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let sum: u64 = values.iter().sum();
        let times = CpuTimes {
            busy: sum.saturating_sub(idle),
            total: sum,
        };
        if label == "cpu" {
            total = times;
        } else {
            cores.push(times);
        }
    }
    (total, cores)
}

#[derive(Debug, Default)]
struct MemInfo {
    total: u64,
    available: u64,
    free: u64,
    buffers: u64,
    cached: u64,
}

fn read_meminfo() -> MemInfo {
    let content = fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let mut info = MemInfo::default();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }
        let value: u64 = parts[1].parse::<u64>().unwrap_or(0) * 1024;
        match parts[0] {
            "MemTotal:" => info.total = value,
            "MemAvailable:" => info.available = value,
            "MemFree:" => info.free = value,
            "Buffers:" => info.buffers = value,
            "Cached:" => info.cached = value,
            _ => {}
        }
    }
    if info.available == 0 {
        info.available = info.free + info.buffers + info.cached;
    }
    info
}

fn read_mount_fs_types() -> HashMap<String, String> {
    let content = fs::read_to_string("/proc/mounts").unwrap_or_default();
    content
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _device = parts.next()?;
            let mount_point = parts.next()?.to_string();
            let fs_type = parts.next()?.to_string();
            Some((mount_point, fs_type))
        })
        .collect()
}

/// (total, used, available) bytes for a mount point.
fn statvfs(path: &str) -> Option<(u64, u64, u64)> {
    let c_path = CString::new(path).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: valid NUL-terminated path and an out-param we own.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    let frsize = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * frsize;
    let available = stat.f_bavail as u64 * frsize;
    let used = total.saturating_sub(stat.f_bfree as u64 * frsize);
    Some((total, used, available))
}

/// Run one nvidia-smi CSV query; `None` disables further probing.
fn nvidia_smi_query(fields: &str) -> Option<Vec<Vec<String>>> {
    let output = Command::new("nvidia-smi")
        .arg(format!("--query-gpu={fields}"))
        .arg("--format=csv,noheader,nounits")
        .output()
        .ok()?;
    if !output.status.success() {
        debug!("nvidia-smi query failed, disabling GPU probe");
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    Some(
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.split(',').map(|f| f.trim().to_string()).collect())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_produces_bounded_percentages() {
        let mut monitor = ResourceMonitor::new(vec!["/".to_string()]);
        monitor.gpu_probe = false;

        let first = monitor.sample();
        assert_eq!(first.cpu.total_percent, 0.0);

        let second = monitor.sample();
        assert!((0.0..=100.0).contains(&second.cpu.total_percent));
        for core in &second.cpu.per_core {
            assert!((0.0..=100.0).contains(&core.used_percent));
        }
        assert!(second.memory.used_percent <= 100.0);
    }

    #[test]
    fn static_snapshot_reports_inventory() {
        let mut monitor = ResourceMonitor::new(vec!["/".to_string()]);
        monitor.gpu_probe = false;

        let snapshot = monitor.static_snapshot();
        assert!(snapshot.cpu.logical_cores >= 1);
        assert_eq!(
            snapshot.cpu.max_millicores_total,
            snapshot.cpu.logical_cores as u64 * 1000
        );
    }

    #[test]
    fn root_mount_is_measurable() {
        let (total, used, available) = statvfs("/").unwrap();
        assert!(total > 0);
        assert!(used <= total);
        assert!(available <= total);
    }

    #[test]
    fn missing_mount_is_skipped() {
        assert!(statvfs("/definitely/not/a/mount").is_none());
    }
}
