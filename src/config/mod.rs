mod selector;

pub use selector::select_variant;

use crate::error::{Result, SupervisorError};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// `program` block of the config document.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgramConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_device_plugin_dir")]
    pub device_plugin_dir: String,
    #[serde(default = "default_interface_plugin_dir")]
    pub interface_plugin_dir: String,
    /// Minutes. <= 0 disables the idle reaper.
    #[serde(default = "default_alive_time")]
    pub alive_time: i64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, rename = "Disable_GPU_monitoring")]
    pub disable_gpu_monitoring: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_device_plugin_dir() -> String {
    "plugins/devices".to_string()
}
fn default_interface_plugin_dir() -> String {
    "plugins/interfaces".to_string()
}
fn default_alive_time() -> i64 {
    60
}
fn default_log_level() -> String {
    "INFO".to_string()
}

/// One hardware variant block: `required_devices` + `memory_mb` + `script_path`,
/// plus whatever else an operator stuffed into the block (unused, kept for
/// forward-compatible deserialization).
#[derive(Debug, Clone, Deserialize)]
pub struct VariantBlock {
    pub required_devices: Vec<String>,
    pub script_path: String,
    pub memory_mb: HashMap<String, u64>,
}

/// A model entry as written in the config document. The variant blocks are
/// open-ended keys, so they're captured via `flatten` into a generic value
/// map and sorted out at selection time rather than modeled as a closed set
/// of Rust fields.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    #[serde(default)]
    pub aliases: Vec<String>,
    pub mode: String,
    pub port: u16,
    #[serde(default)]
    pub auto_start: bool,
    /// `serde_yaml::Mapping`, not a `BTreeMap`, specifically because it
    /// preserves document order -- variant selection depends on trying
    /// blocks in the order the operator wrote them, not alphabetically.
    #[serde(flatten)]
    pub rest: serde_yaml::Mapping,
}

impl ModelEntry {
    pub fn aliases_or_default(&self, key: &str) -> Vec<String> {
        if self.aliases.is_empty() {
            vec![key.to_string()]
        } else {
            self.aliases.clone()
        }
    }

    /// Variant blocks are any `rest` entry whose value is a mapping
    /// containing a `required_devices` key, walked in the order `serde_yaml`
    /// preserved them in (insertion order of the source document).
    pub fn variants(&self) -> Vec<(&str, VariantBlock)> {
        let mut out = Vec::new();
        for (key, value) in &self.rest {
            let Some(key) = key.as_str() else { continue };
            if let serde_yaml::Value::Mapping(map) = value {
                let has_required_devices = map
                    .keys()
                    .any(|k| k.as_str() == Some("required_devices"));
                if !has_required_devices {
                    continue;
                }
                if let Ok(block) = serde_yaml::from_value::<VariantBlock>(value.clone()) {
                    out.push((key, block));
                }
            }
        }
        out
    }
}

/// The resolved config a model is actually started with: top-level fields
/// plus exactly the chosen variant's fields. No other top-level keys
/// propagate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunConfig {
    pub aliases: Vec<String>,
    pub mode: String,
    pub port: u16,
    pub auto_start: bool,
    pub script_path: String,
    pub memory_mb: HashMap<String, u64>,
    pub required_devices: HashSet<String>,
    pub config_source: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    program: Option<ProgramConfig>,
    #[serde(flatten)]
    models: BTreeMap<String, ModelEntry>,
}

/// Loads `config.yaml`, resolves alias -> primary-name mappings once, and
/// answers the read-only queries the rest of the supervisor needs. Holds no
/// mutable state after construction; reload is "construct a new one".
#[derive(Debug)]
pub struct ConfigManager {
    program: ProgramConfig,
    models: BTreeMap<String, ModelEntry>,
    alias_to_primary: HashMap<String, String>,
}

impl ConfigManager {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(SupervisorError::ConfigNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| SupervisorError::ConfigInvalid(e.to_string()))?;
        let raw: RawConfig =
            serde_yaml::from_str(&text).map_err(|e| SupervisorError::ConfigInvalid(e.to_string()))?;
        let program = raw.program.unwrap_or_else(|| {
            serde_yaml::from_str("{}").expect("empty program config must parse")
        });

        let mut alias_to_primary = HashMap::new();
        for (key, entry) in &raw.models {
            let aliases = entry.aliases_or_default(key);
            let primary = aliases[0].clone();
            for alias in aliases {
                alias_to_primary.insert(alias, primary.clone());
            }
        }

        Ok(Self {
            program,
            models: raw.models,
            alias_to_primary,
        })
    }

    pub fn program(&self) -> &ProgramConfig {
        &self.program
    }

    pub fn resolve_primary_name(&self, alias: &str) -> String {
        self.alias_to_primary
            .get(alias)
            .cloned()
            .unwrap_or_else(|| alias.to_string())
    }

    /// Model config lookup keyed by primary name (not raw config key).
    pub fn model_config(&self, primary_name: &str) -> Option<&ModelEntry> {
        self.models.iter().find_map(|(key, entry)| {
            let aliases = entry.aliases_or_default(key);
            if aliases.first().map(|s| s.as_str()) == Some(primary_name) {
                Some(entry)
            } else {
                None
            }
        })
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models
            .iter()
            .map(|(key, entry)| entry.aliases_or_default(key)[0].clone())
            .collect()
    }

    pub fn model_entries(&self) -> impl Iterator<Item = (String, &ModelEntry)> {
        self.models
            .iter()
            .map(|(key, entry)| (entry.aliases_or_default(key)[0].clone(), entry))
    }

    /// All device names referenced by any variant of any model, used to
    /// simulate a fully-online device set when GPU monitoring is disabled.
    pub fn all_required_devices(&self) -> HashSet<String> {
        let mut set = HashSet::new();
        for entry in self.models.values() {
            for (_, variant) in entry.variants() {
                set.extend(variant.required_devices);
            }
        }
        set
    }

    pub fn adaptive_config(
        &self,
        primary_name: &str,
        online_devices: &HashSet<String>,
    ) -> Result<RunConfig> {
        let entry = self
            .model_config(primary_name)
            .ok_or_else(|| SupervisorError::UnknownAlias(primary_name.to_string()))?;
        select_variant(entry, primary_name, online_devices)
            .ok_or(SupervisorError::NoSuitableVariant)
    }

    /// Warnings only -- an operator may stage a model before giving it a
    /// variant, so this never fails startup on its own.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (key, entry) in &self.models {
            if entry.variants().is_empty() {
                warnings.push(format!(
                    "model '{key}' has no valid hardware variant (needs required_devices, script_path, memory_mb)"
                ));
            }
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = ConfigManager::load("/nonexistent/config.yaml").unwrap_err();
        assert!(matches!(err, SupervisorError::ConfigNotFound(_)));
    }

    #[test]
    fn alias_resolution_uses_first_alias_as_primary() {
        let (_dir, path) = write_config(
            r#"
program:
  host: 127.0.0.1
  port: 9090
m:
  aliases: [m, m-alias]
  mode: Chat
  port: 9000
  cpu:
    required_devices: [CPU]
    script_path: run.sh
    memory_mb:
      CPU: 2048
"#,
        );
        let cfg = ConfigManager::load(&path).unwrap();
        assert_eq!(cfg.resolve_primary_name("m-alias"), "m");
        assert_eq!(cfg.resolve_primary_name("m"), "m");
        assert_eq!(cfg.resolve_primary_name("unknown"), "unknown");
        assert_eq!(cfg.program().port, 9090);
    }

    #[test]
    fn model_without_variant_is_flagged_by_validate() {
        let (_dir, path) = write_config(
            r#"
staged:
  mode: Chat
  port: 9001
"#,
        );
        let cfg = ConfigManager::load(&path).unwrap();
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("staged"));
    }
}
