use super::{DeviceInfo, DeviceProbe, DeviceStatus};
use async_trait::async_trait;

/// The CPU device is always online; only its memory figures can fail to
/// resolve, in which case we still report online with best-effort numbers.
/// Memory probing shells out to the platform's own tools rather than pulling
/// in a system-info crate, matching the reference codebase's own approach to
/// hardware probing.
pub struct CpuProbe;

#[async_trait]
impl DeviceProbe for CpuProbe {
    fn name(&self) -> &str {
        "CPU"
    }

    async fn probe(&self) -> DeviceStatus {
        let (total_mb, available_mb) = tokio::task::spawn_blocking(read_memory_mb)
            .await
            .unwrap_or((0, 0));
        let used_mb = total_mb.saturating_sub(available_mb);
        let usage_pct = if total_mb > 0 {
            used_mb as f32 / total_mb as f32 * 100.0
        } else {
            0.0
        };
        DeviceStatus::online(DeviceInfo {
            total_mb,
            available_mb,
            used_mb,
            usage_pct,
            temp_c: None,
        })
    }
}

#[cfg(target_os = "linux")]
fn read_memory_mb() -> (u64, u64) {
    let content = match std::fs::read_to_string("/proc/meminfo") {
        Ok(c) => c,
        Err(_) => return (0, 0),
    };
    let mut total_kb = 0u64;
    let mut available_kb = 0u64;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(rest);
        }
    }
    (total_kb / 1024, available_kb / 1024)
}

#[cfg(target_os = "linux")]
fn parse_kb(field: &str) -> u64 {
    field
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
}

#[cfg(target_os = "macos")]
fn read_memory_mb() -> (u64, u64) {
    let total_bytes = Command::new("sysctl")
        .args(["-n", "hw.memsize"])
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let free_bytes = Command::new("vm_stat")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| parse_vm_stat_free_bytes(&s))
        .unwrap_or(0);

    (total_bytes / 1024 / 1024, free_bytes / 1024 / 1024)
}

#[cfg(target_os = "macos")]
fn parse_vm_stat_free_bytes(output: &str) -> u64 {
    let mut page_size = 4096u64;
    let mut free_pages = 0u64;
    for line in output.lines() {
        if line.contains("page size of") {
            if let Some(size) = line
                .split_whitespace()
                .skip_while(|w| *w != "of")
                .nth(1)
                .and_then(|s| s.parse::<u64>().ok())
            {
                page_size = size;
            }
        } else if let Some(rest) = line.strip_prefix("Pages free:") {
            free_pages = rest
                .trim()
                .trim_end_matches('.')
                .parse::<u64>()
                .unwrap_or(0);
        }
    }
    free_pages * page_size
}

#[cfg(target_os = "windows")]
fn read_memory_mb() -> (u64, u64) {
    let output = Command::new("wmic")
        .args(["OS", "get", "TotalVisibleMemorySize,FreePhysicalMemory", "/value"])
        .output();
    let mut total_kb = 0u64;
    let mut free_kb = 0u64;
    if let Ok(output) = output {
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if let Some(v) = line.strip_prefix("TotalVisibleMemorySize=") {
                total_kb = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("FreePhysicalMemory=") {
                free_kb = v.trim().parse().unwrap_or(0);
            }
        }
    }
    (total_kb / 1024, free_kb / 1024)
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
fn read_memory_mb() -> (u64, u64) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cpu_is_always_online() {
        let status = CpuProbe.probe().await;
        assert!(status.online);
        assert!(status.info.is_some());
    }
}
