use crate::config::ConfigManager;
use crate::devices::DeviceStatusCache;
use crate::error::{Result, SupervisorError};
use crate::logging::ModelLogWriter;
use crate::plugins::InterfacePlugin;
use crate::process::{LineSink, ProcessSupervisor};
use crate::state::{ModelStateTable, ModelStatus};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

const STARTUP_GATE_TIMEOUT: Duration = Duration::from_secs(60);
const WAIT_PATH_POLL_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_PATH_MAX_ITERATIONS: u32 = 120;
const HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(300);
const RESOURCE_ARBITER_MAX_PASSES: u32 = 2;
const EVICTION_SETTLE_DELAY: Duration = Duration::from_secs(3);
const IDLE_REAP_TICK: Duration = Duration::from_secs(30);

/// Orchestrates the per-model state machine: coalesced startup,
/// resource-arbitrated placement, idempotent teardown, and the idle reaper.
/// Owns references to everything the state machine consults but does not
/// itself own the model state table's storage -- that's shared with the
/// gateway through `Arc<ModelStateTable>`.
pub struct LifecycleController {
    pub config: Arc<ConfigManager>,
    pub devices: Arc<DeviceStatusCache>,
    pub process: Arc<ProcessSupervisor>,
    pub states: Arc<ModelStateTable>,
    pub plugins: HashMap<String, Arc<dyn InterfacePlugin>>,
    logs_root: PathBuf,
    log_writers: Mutex<HashMap<String, Arc<Mutex<ModelLogWriter>>>>,
}

impl LifecycleController {
    pub fn new(
        config: Arc<ConfigManager>,
        devices: Arc<DeviceStatusCache>,
        process: Arc<ProcessSupervisor>,
        states: Arc<ModelStateTable>,
        plugins: HashMap<String, Arc<dyn InterfacePlugin>>,
        logs_root: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            devices,
            process,
            states,
            plugins,
            logs_root,
            log_writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn subscribe_logs(&self, model_name: &str) -> Option<broadcast::Receiver<String>> {
        self.log_writers
            .lock()
            .get(model_name)
            .map(|writer| writer.lock().subscribe())
    }

    /// Ensures `name` is routing, coalescing concurrent callers onto
    /// a single startup attempt.
    pub async fn start_model(self: &Arc<Self>, name: &str) -> Result<()> {
        let record = self
            .states
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownAlias(name.to_string()))?;

        match record.status() {
            ModelStatus::Routing => {
                record.touch();
                return Ok(());
            }
            status if status.is_startup_state() => {
                return self.wait_for_routing(name).await;
            }
            _ => {}
        }

        let guard = tokio::time::timeout(STARTUP_GATE_TIMEOUT, record.startup_gate.lock()).await;
        let _gate = match guard {
            Ok(gate) => gate,
            Err(_) => return Err(SupervisorError::StartupLockTimeout),
        };

        // Recheck: another caller may have finished (or started) while we
        // waited for the gate.
        match record.status() {
            ModelStatus::Routing => {
                record.touch();
                return Ok(());
            }
            status if status.is_startup_state() => {
                drop(_gate);
                return self.wait_for_routing(name).await;
            }
            _ => {}
        }

        record.set_status(ModelStatus::Starting);
        record.set_failure_reason(None);

        let result = self.start_intelligent(name, &record).await;
        if let Err(e) = &result {
            warn!(model = name, error = %e, "model startup failed");
        }
        result
    }

    async fn wait_for_routing(&self, name: &str) -> Result<()> {
        let record = self
            .states
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownAlias(name.to_string()))?;
        for _ in 0..WAIT_PATH_MAX_ITERATIONS {
            match record.status() {
                ModelStatus::Routing => {
                    record.touch();
                    return Ok(());
                }
                ModelStatus::Failed | ModelStatus::Stopped => {
                    return Err(SupervisorError::HealthCheckFailed(
                        record
                            .failure_reason()
                            .unwrap_or_else(|| "startup failed".to_string()),
                    ));
                }
                _ => tokio::time::sleep(WAIT_PATH_POLL_INTERVAL).await,
            }
        }
        Err(SupervisorError::HealthCheckTimeout)
    }

    async fn start_intelligent(
        self: &Arc<Self>,
        name: &str,
        record: &Arc<crate::state::ModelRecord>,
    ) -> Result<()> {
        let online_devices = if self.config.program().disable_gpu_monitoring {
            self.config.all_required_devices()
        } else {
            self.devices.online_set()
        };

        let run_config = match self.config.adaptive_config(name, &online_devices) {
            Ok(c) => c,
            Err(e) => {
                record.set_status(ModelStatus::Failed);
                record.set_failure_reason(Some(e.to_string()));
                return Err(e);
            }
        };
        record.set_current_variant(Some(run_config.clone()));

        if let Err(e) = self.ensure_resources(name, &run_config).await {
            record.set_status(ModelStatus::Failed);
            record.set_failure_reason(Some(e.to_string()));
            return Err(e);
        }

        record.set_status(ModelStatus::InitScript);
        let writer = match ModelLogWriter::open(&self.logs_root, name) {
            Ok(w) => Arc::new(Mutex::new(w)),
            Err(e) => {
                record.set_status(ModelStatus::Failed);
                record.set_failure_reason(Some(e.to_string()));
                return Err(SupervisorError::Internal(e.to_string()));
            }
        };
        self.log_writers
            .lock()
            .insert(name.to_string(), writer.clone());

        let sink: LineSink = Arc::new(move |(stream, text)| {
            writer.lock().write_line(&stream, &text);
        });

        let pid = match self.process.start(name, &run_config.script_path, sink).await {
            Ok(pid) => pid,
            Err(e) => {
                record.set_status(ModelStatus::Failed);
                record.set_failure_reason(Some(e.to_string()));
                return Err(e);
            }
        };
        record.set_pid(Some(pid));
        record.set_status(ModelStatus::HealthCheck);

        let plugin = self
            .plugins
            .get(&run_config.mode)
            .cloned()
            .ok_or_else(|| SupervisorError::Internal(format!("no interface plugin for mode '{}'", run_config.mode)))?;

        match plugin
            .health_check(name, run_config.port, HEALTH_CHECK_DEADLINE)
            .await
        {
            Ok(()) => {
                record.set_status(ModelStatus::Routing);
                record.touch();
                info!(model = name, pid, port = run_config.port, "model is routing");
                Ok(())
            }
            Err(e) => {
                let _ = self.process.stop(name, true, Duration::from_secs(5)).await;
                record.set_pid(None);
                record.set_status(ModelStatus::Stopped);
                Err(e)
            }
        }
    }

    /// Evict-to-fit resource arbiter.
    async fn ensure_resources(
        self: &Arc<Self>,
        starting_model: &str,
        run_config: &crate::config::RunConfig,
    ) -> Result<()> {
        for pass in 0..RESOURCE_ARBITER_MAX_PASSES {
            let snapshot = self.devices.snapshot();

            for device in &run_config.required_devices {
                match snapshot.get(device) {
                    Some(status) if status.online => {}
                    _ => return Err(SupervisorError::InsufficientResources),
                }
            }

            let mut deficits: HashMap<String, i64> = HashMap::new();
            for (device, required_mb) in &run_config.memory_mb {
                let available = snapshot
                    .get(device)
                    .and_then(|s| s.info.as_ref())
                    .map(|i| i.available_mb)
                    .unwrap_or(0);
                let deficit = *required_mb as i64 - available as i64;
                if deficit > 0 {
                    deficits.insert(device.clone(), deficit);
                }
            }

            if deficits.is_empty() {
                return Ok(());
            }

            let deficit_devices: std::collections::HashSet<String> = deficits.keys().cloned().collect();
            let victim = self.pick_eviction_victim(starting_model, &deficit_devices);

            let Some(victim) = victim else {
                if pass + 1 >= RESOURCE_ARBITER_MAX_PASSES {
                    return Err(SupervisorError::InsufficientResources);
                }
                continue;
            };

            self.stop_model(&victim, "evicted to free resources").await?;
            tokio::time::sleep(EVICTION_SETTLE_DELAY).await;
            self.devices.update_now().await;
        }

        Err(SupervisorError::InsufficientResources)
    }

    fn pick_eviction_victim(
        &self,
        starting_model: &str,
        deficit_devices: &std::collections::HashSet<String>,
    ) -> Option<String> {
        let mut candidates: Vec<(String, i64)> = self
            .states
            .all()
            .filter(|r| r.name != starting_model)
            .filter(|r| r.status() == ModelStatus::Routing)
            .filter(|r| r.in_flight() == 0)
            .filter_map(|r| {
                let variant = r.current_variant()?;
                let intersects = variant
                    .required_devices
                    .iter()
                    .any(|d| deficit_devices.contains(d));
                if intersects {
                    Some((r.name.clone(), r.last_access().unwrap_or(0)))
                } else {
                    None
                }
            })
            .collect();

        candidates.sort_by_key(|(_, last_access)| *last_access);
        candidates.into_iter().next().map(|(name, _)| name)
    }

    /// Idempotent teardown, funnel point for the reaper, admin stop,
    /// and eviction.
    pub async fn stop_model(&self, name: &str, reason: &str) -> Result<()> {
        let record = self
            .states
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownAlias(name.to_string()))?;

        if record.status() == ModelStatus::Stopped {
            return Ok(());
        }

        record.set_status(ModelStatus::Stopped);
        record.set_failure_reason(Some(reason.to_string()));
        self.process.stop(name, true, Duration::from_secs(10)).await?;
        record.set_pid(None);
        record.set_current_variant(None);
        info!(model = name, reason, "model stopped");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.states.all().map(|r| r.name.clone()).collect();
        for name in names {
            let _ = self.stop_model(&name, "stop-all requested").await;
        }
    }

    /// Every 30s, stop any routing-and-idle-past-`alive_time` model.
    /// `alive_time <= 0` disables the reaper entirely.
    pub async fn run_idle_reaper(self: Arc<Self>) {
        let alive_time_secs = self.config.program().alive_time * 60;
        if alive_time_secs <= 0 {
            info!("idle reaper disabled (alive_time <= 0)");
            return;
        }

        loop {
            tokio::time::sleep(IDLE_REAP_TICK).await;
            let now = Utc::now().timestamp();

            for record in self.states.all() {
                if record.status() != ModelStatus::Routing {
                    continue;
                }
                if record.in_flight() != 0 {
                    continue;
                }
                let Some(last_access) = record.last_access() else {
                    continue;
                };
                if now - last_access > alive_time_secs {
                    info!(model = record.name, "idle reaper stopping model");
                    let _ = self.stop_model(&record.name, "idle timeout").await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::cpu::CpuProbe;
    use std::collections::HashSet;

    fn make_states() -> Arc<ModelStateTable> {
        Arc::new(ModelStateTable::new(["m".to_string()]))
    }

    #[test]
    fn eviction_skips_models_with_in_flight_requests() {
        let states = make_states();
        let record = states.get("m").unwrap();
        record.set_status(ModelStatus::Routing);
        record.increment_in_flight();
        record.set_current_variant(Some(crate::config::RunConfig {
            aliases: vec!["m".to_string()],
            mode: "Chat".to_string(),
            port: 9000,
            auto_start: false,
            script_path: "run.sh".to_string(),
            memory_mb: HashMap::new(),
            required_devices: ["gpu0".to_string()].into_iter().collect(),
            config_source: "gpu".to_string(),
        }));

        let controller = LifecycleController {
            config: Arc::new(dummy_config()),
            devices: DeviceStatusCache::new(vec![Arc::new(CpuProbe)]),
            process: ProcessSupervisor::new(),
            states: states.clone(),
            plugins: HashMap::new(),
            logs_root: std::env::temp_dir(),
            log_writers: Mutex::new(HashMap::new()),
        };

        let deficit: HashSet<String> = ["gpu0".to_string()].into_iter().collect();
        assert_eq!(controller.pick_eviction_victim("other", &deficit), None);
    }

    fn dummy_config() -> ConfigManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "program:\n  port: 8080\n").unwrap();
        std::mem::forget(dir);
        ConfigManager::load(&path).unwrap()
    }
}
