pub mod admin;
pub mod config;
pub mod devices;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod logging;
pub mod plugins;
pub mod process;
pub mod state;

use crate::config::ConfigManager;
use crate::devices::cpu::CpuProbe;
use crate::devices::nvidia::NvidiaSmiProbe;
use crate::devices::{DeviceProbe, DeviceStatusCache};
use crate::error::{Result, SupervisorError};
use crate::gateway::{gateway_router, AppState};
use crate::lifecycle::LifecycleController;
use crate::plugins::chat::ChatInterface;
use crate::plugins::embedding::EmbeddingInterface;
use crate::plugins::InterfacePlugin;
use crate::process::ProcessSupervisor;
use crate::state::ModelStateTable;
use axum::Router;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Brings up every component (device cache, process supervisor, plugin
/// registry, state table, lifecycle controller, gateway, admin surface),
/// serves HTTP until a shutdown signal arrives, then tears every running
/// model down before returning.
pub async fn run(config_path: PathBuf) -> Result<()> {
    let config = Arc::new(ConfigManager::load(&config_path)?);
    for warning in config.validate() {
        warn!("{warning}");
    }

    let probes = build_device_probes(&config);
    let devices = DeviceStatusCache::new(probes);
    let process = ProcessSupervisor::new();
    let states = Arc::new(ModelStateTable::new(config.model_names()));

    let mut plugins: HashMap<String, Arc<dyn InterfacePlugin>> = HashMap::new();
    plugins.insert(ChatInterface.mode().to_string(), Arc::new(ChatInterface));
    plugins.insert(
        EmbeddingInterface.mode().to_string(),
        Arc::new(EmbeddingInterface),
    );

    let logs_root = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".modelgate");
    std::fs::create_dir_all(&logs_root).map_err(|e| SupervisorError::Internal(e.to_string()))?;

    let lifecycle = LifecycleController::new(
        config.clone(),
        devices.clone(),
        process.clone(),
        states.clone(),
        plugins,
        logs_root,
    );

    let device_ticker = tokio::spawn(devices.clone().run());
    let reaper = tokio::spawn(lifecycle.clone().run_idle_reaper());

    for name in config.model_names() {
        let auto_start = config.model_config(&name).map(|e| e.auto_start).unwrap_or(false);
        if auto_start {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                if let Err(e) = lifecycle.start_model(&name).await {
                    error!(model = name, error = %e, "auto-start failed");
                }
            });
        }
    }

    let app_state = AppState::new(config.clone(), states.clone(), lifecycle.clone());
    let app: Router = Router::new()
        .merge(admin::admin_router(app_state.clone()))
        .merge(gateway_router(app_state));

    let addr = format!("{}:{}", config.program().host, config.program().port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| SupervisorError::Internal(format!("failed to bind {addr}: {e}")))?;
    info!(addr, "modelgate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| SupervisorError::Internal(e.to_string()))?;

    info!("shutting down, stopping all models");
    devices.stop();
    lifecycle.stop_all().await;
    device_ticker.abort();
    reaper.abort();

    Ok(())
}

/// CPU always registers. GPUs are opt-in: only probed when some model's
/// config actually references a `gpuN` device name.
fn build_device_probes(config: &ConfigManager) -> Vec<Arc<dyn DeviceProbe>> {
    let mut probes: Vec<Arc<dyn DeviceProbe>> = vec![Arc::new(CpuProbe)];
    for device in config.all_required_devices() {
        if let Some(index) = device
            .strip_prefix("gpu")
            .and_then(|s| s.parse::<usize>().ok())
        {
            probes.push(Arc::new(NvidiaSmiProbe { index }));
        }
    }
    probes
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received ctrl-c, shutting down");
        }
        _ = terminate => {
            info!("received terminate signal, shutting down");
        }
    }
}
