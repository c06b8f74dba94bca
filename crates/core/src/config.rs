use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::debug_event::DEFAULT_LOG_CAPACITY;
use crate::scheduler::SchedulerOptions;
use crate::vm::module::{
    ModuleOptions, DEFAULT_DISPLAY_HEIGHT, DEFAULT_DISPLAY_WIDTH, DEFAULT_MEMORY_BYTES,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "SEQFLOW_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub debugger: DebuggerConfig,
    pub vm: VmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub log_capacity: usize,
    /// Upper bound on ticks for one `run` invocation.
    pub max_ticks: usize,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct DebuggerConfig {
    pub attach_on_start: bool,
    pub break_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VmConfig {
    pub display_width: u32,
    pub display_height: u32,
    pub memory_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
            max_ticks: 10_000,
            tick_interval_ms: 0,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            display_width: DEFAULT_DISPLAY_WIDTH,
            display_height: DEFAULT_DISPLAY_HEIGHT,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

impl SchedulerConfig {
    pub fn options(&self) -> SchedulerOptions {
        SchedulerOptions {
            log_capacity: self.log_capacity,
        }
    }
}

impl VmConfig {
    pub fn options(&self) -> ModuleOptions {
        ModuleOptions {
            display_width: self.display_width,
            display_height: self.display_height,
            memory_bytes: self.memory_bytes,
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory: CLI override, then `SEQFLOW_DATA_DIR`, then `./data`.
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Creates the data directory and a default config.toml if either is missing.
/// An existing config file is left alone.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        RuntimeConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();

        assert_eq!(cfg.scheduler.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(cfg.scheduler.max_ticks, 10_000);
        assert_eq!(cfg.scheduler.tick_interval_ms, 0);
        assert!(!cfg.debugger.attach_on_start);
        assert!(!cfg.debugger.break_on_start);
        assert_eq!(cfg.vm.display_width, 480);
        assert_eq!(cfg.vm.display_height, 272);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let mut original = RuntimeConfig::default();
        original.debugger.attach_on_start = true;
        original.vm.memory_bytes = 4096;
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: RuntimeConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_file_fills_missing_sections_with_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = config_path(temp.path());
        fs::write(&path, "[scheduler]\nmax_ticks = 5\n").expect("write config");

        let loaded = RuntimeConfig::load_from_path(&path).expect("load config");
        assert_eq!(loaded.scheduler.max_ticks, 5);
        assert_eq!(loaded.scheduler.log_capacity, DEFAULT_LOG_CAPACITY);
        assert_eq!(loaded.vm, VmConfig::default());
    }

    #[test]
    fn load_from_nonexistent_or_empty_file_returns_defaults() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = config_path(temp.path());
        assert_eq!(
            RuntimeConfig::load_from_path(&path).expect("missing file"),
            RuntimeConfig::default()
        );

        fs::write(&path, "  \n").expect("write empty config");
        assert_eq!(
            RuntimeConfig::load_from_path(&path).expect("empty file"),
            RuntimeConfig::default()
        );
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = config_path(temp.path());
        fs::write(&path, "[scheduler\n").expect("write config");
        assert!(RuntimeConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn data_dir_env_then_default() {
        let old = env::var_os(ENV_DATA_DIR);

        env::set_var(ENV_DATA_DIR, "/env/path");
        let from_env = data_dir(None);
        env::remove_var(ENV_DATA_DIR);
        let fallback = data_dir(None);

        if let Some(value) = old {
            env::set_var(ENV_DATA_DIR, value);
        }
        assert_eq!(from_env, PathBuf::from("/env/path"));
        assert_eq!(fallback, PathBuf::from("data"));
    }

    #[test]
    fn initialize_creates_data_dir_and_preserves_existing_config() {
        let temp = tempfile::tempdir().expect("temp dir");
        let root = temp.path().join("nested");
        initialize_data_dir(&root).expect("initialize data dir");
        assert!(config_path(&root).exists());

        let custom = "[vm]\nmemory_bytes = 1024\n";
        fs::write(config_path(&root), custom).expect("write custom config");
        initialize_data_dir(&root).expect("initialize again");
        let content = fs::read_to_string(config_path(&root)).expect("read config");
        assert_eq!(content, custom);
    }
}
