use super::{ModelEntry, RunConfig};
use std::collections::HashSet;

/// Picks the first variant block (in definition order) whose
/// `required_devices` is a subset of `online_devices`. Pure function so it's
/// directly testable against the literal scenarios the selector is specified
/// against.
pub fn select_variant(
    entry: &ModelEntry,
    primary_name: &str,
    online_devices: &HashSet<String>,
) -> Option<RunConfig> {
    for (key, variant) in entry.variants() {
        let required: HashSet<String> = variant.required_devices.iter().cloned().collect();
        if required.is_subset(online_devices) {
            return Some(RunConfig {
                aliases: entry.aliases_or_default(primary_name),
                mode: entry.mode.clone(),
                port: entry.port,
                auto_start: entry.auto_start,
                script_path: variant.script_path,
                memory_mb: variant.memory_mb,
                required_devices: required,
                config_source: key.to_string(),
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigManager;

    fn load(contents: &str) -> ConfigManager {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        // leak the tempdir so the file stays alive for the test's duration
        std::mem::forget(dir);
        ConfigManager::load(&path).unwrap()
    }

    #[test]
    fn picks_first_variant_whose_devices_are_all_online() {
        let cfg = load(
            r#"
m:
  mode: Chat
  port: 9000
  gpu:
    required_devices: [gpu0]
    script_path: run_gpu.sh
    memory_mb:
      gpu0: 4000
  cpu:
    required_devices: [CPU]
    script_path: run_cpu.sh
    memory_mb:
      CPU: 2048
"#,
        );
        let online: HashSet<String> = ["CPU".to_string()].into_iter().collect();
        let run = cfg.adaptive_config("m", &online).unwrap();
        // gpu0 isn't online, so the cpu variant (defined second but the only
        // satisfiable one) must win.
        assert_eq!(run.config_source, "cpu");
        assert_eq!(run.script_path, "run_cpu.sh");
    }

    #[test]
    fn definition_order_is_preferred_when_multiple_variants_are_satisfiable() {
        let cfg = load(
            r#"
m:
  mode: Chat
  port: 9000
  best:
    required_devices: [CPU]
    script_path: best.sh
    memory_mb:
      CPU: 1024
  fallback:
    required_devices: [CPU]
    script_path: fallback.sh
    memory_mb:
      CPU: 512
"#,
        );
        let online: HashSet<String> = ["CPU".to_string()].into_iter().collect();
        let run = cfg.adaptive_config("m", &online).unwrap();
        assert_eq!(run.config_source, "best");
    }

    #[test]
    fn no_satisfiable_variant_returns_none() {
        let cfg = load(
            r#"
m:
  mode: Chat
  port: 9000
  gpu:
    required_devices: [gpu0]
    script_path: run_gpu.sh
    memory_mb:
      gpu0: 4000
"#,
        );
        let online: HashSet<String> = HashSet::new();
        let err = cfg.adaptive_config("m", &online).unwrap_err();
        assert!(matches!(err, crate::error::SupervisorError::NoSuitableVariant));
    }
}
