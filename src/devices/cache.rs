use super::{DeviceProbe, DeviceStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TICK_INTERVAL: Duration = Duration::from_secs(3);
const TICK_GRANULARITY: Duration = Duration::from_millis(100);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Decouples slow hardware probes from request-serving code. A background
/// ticker refreshes a whole-map snapshot roughly every three seconds; reads
/// are lock-then-clone and never block on a probe. Probes are isolated from
/// each other: every probe runs concurrently and under its own
/// `PROBE_TIMEOUT`, so one probe hanging (a wedged `nvidia-smi`, say) only
/// turns that one device offline for the tick instead of stalling the
/// others or the hot path.
pub struct DeviceStatusCache {
    probes: Vec<Arc<dyn DeviceProbe>>,
    status: Mutex<HashMap<String, DeviceStatus>>,
    running: AtomicBool,
}

impl DeviceStatusCache {
    pub fn new(probes: Vec<Arc<dyn DeviceProbe>>) -> Arc<Self> {
        Arc::new(Self {
            probes,
            status: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        })
    }

    /// Deep copy of the current snapshot.
    pub fn snapshot(&self) -> HashMap<String, DeviceStatus> {
        self.status.lock().clone()
    }

    pub fn online_set(&self) -> std::collections::HashSet<String> {
        self.status
            .lock()
            .iter()
            .filter(|(_, status)| status.online)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Synchronous single pass, used by the resource arbiter right after an
    /// eviction to defeat the cache's own staleness window.
    pub async fn update_now(&self) {
        let fresh = self.probe_all().await;
        *self.status.lock() = fresh;
    }

    async fn probe_all(&self) -> HashMap<String, DeviceStatus> {
        let results = futures_util::future::join_all(self.probes.iter().map(|probe| async move {
            let name = probe.name().to_string();
            let status = match tokio::time::timeout(PROBE_TIMEOUT, probe.probe()).await {
                Ok(status) => status,
                Err(_) => DeviceStatus::offline(format!("probe timed out after {PROBE_TIMEOUT:?}")),
            };
            (name, status)
        }))
        .await;
        results.into_iter().collect()
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs until `stop()` is called. Sleeps in small increments so shutdown
    /// is prompt rather than waiting out a full tick.
    pub async fn run(self: Arc<Self>) {
        self.update_now().await;
        while self.running.load(Ordering::SeqCst) {
            let mut waited = Duration::ZERO;
            while waited < TICK_INTERVAL {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(TICK_GRANULARITY).await;
                waited += TICK_GRANULARITY;
            }
            self.update_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceInfo, DeviceProbe};
    use async_trait::async_trait;

    struct AlwaysOnline;
    #[async_trait]
    impl DeviceProbe for AlwaysOnline {
        fn name(&self) -> &str {
            "always"
        }
        async fn probe(&self) -> DeviceStatus {
            DeviceStatus::online(DeviceInfo {
                total_mb: 100,
                available_mb: 50,
                used_mb: 50,
                usage_pct: 50.0,
                temp_c: None,
            })
        }
    }

    struct AlwaysFails;
    #[async_trait]
    impl DeviceProbe for AlwaysFails {
        fn name(&self) -> &str {
            "broken"
        }
        async fn probe(&self) -> DeviceStatus {
            DeviceStatus::offline("probe failed")
        }
    }

    #[tokio::test]
    async fn one_bad_probe_does_not_prevent_others_from_reporting() {
        let cache = DeviceStatusCache::new(vec![Arc::new(AlwaysOnline), Arc::new(AlwaysFails)]);
        cache.update_now().await;
        let snapshot = cache.snapshot();
        assert!(snapshot["always"].online);
        assert!(!snapshot["broken"].online);
        assert_eq!(cache.online_set(), ["always".to_string()].into_iter().collect());
    }

    struct Hangs;
    #[async_trait]
    impl DeviceProbe for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }
        async fn probe(&self) -> DeviceStatus {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            DeviceStatus::offline("unreachable")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn a_hanging_probe_times_out_instead_of_blocking_the_others() {
        let cache = DeviceStatusCache::new(vec![Arc::new(AlwaysOnline), Arc::new(Hangs)]);
        cache.update_now().await;
        let snapshot = cache.snapshot();
        assert!(snapshot["always"].online);
        assert!(!snapshot["hangs"].online);
    }
}
