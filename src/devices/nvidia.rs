use super::{DeviceInfo, DeviceProbe, DeviceStatus};
use async_trait::async_trait;
use tokio::process::Command;

/// One `nvidia-smi`-reported GPU, addressed by index (`gpu0`, `gpu1`, ...).
/// Offline whenever the binary is missing, exits non-zero, or the index
/// doesn't appear in its output -- an illustrative, non-default device
/// probe, not part of the mandatory baseline (CPU always registers; GPUs are
/// opt-in per deployment).
pub struct NvidiaSmiProbe {
    pub index: usize,
}

impl NvidiaSmiProbe {
    pub fn name_for(index: usize) -> String {
        format!("gpu{index}")
    }
}

#[async_trait]
impl DeviceProbe for NvidiaSmiProbe {
    fn name(&self) -> &str {
        // Leaked once per probe instance; there are at most a handful of
        // GPUs per host so this is not a meaningful long-term leak.
        Box::leak(Self::name_for(self.index).into_boxed_str())
    }

    async fn probe(&self) -> DeviceStatus {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,memory.total,memory.used,memory.free,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                return DeviceStatus::offline(format!(
                    "nvidia-smi exited with {}",
                    o.status
                ))
            }
            Err(e) => return DeviceStatus::offline(e.to_string()),
        };

        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 5 {
                continue;
            }
            let Ok(idx) = parts[0].parse::<usize>() else {
                continue;
            };
            if idx != self.index {
                continue;
            }
            let total_mb = parts[1].parse::<u64>().unwrap_or(0);
            let used_mb = parts[2].parse::<u64>().unwrap_or(0);
            let available_mb = parts[3].parse::<u64>().unwrap_or(0);
            let temp_c = parts[4].parse::<f32>().ok();
            let usage_pct = if total_mb > 0 {
                used_mb as f32 / total_mb as f32 * 100.0
            } else {
                0.0
            };
            return DeviceStatus::online(DeviceInfo {
                total_mb,
                available_mb,
                used_mb,
                usage_pct,
                temp_c,
            });
        }
        DeviceStatus::offline(format!("gpu index {} not reported by nvidia-smi", self.index))
    }
}
