//! Server configuration, loaded from a TOML file.
//!
//! A bare name resolves to `/etc/vidforge/<name>.toml`; anything
//! containing `/` or `.` is treated as a path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use job::engine::{TaskTypeConfig, TaskTypeConfigs};
use job::JobModuleConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub worker: WorkerSection,
    /// Per-kind execution limit overrides, all in seconds.
    #[serde(default)]
    pub limits: LimitsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { data_dir: "/var/lib/vidforge".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// "veo" or "demo".
    pub mode: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key; never put the key
    /// itself in the config file.
    pub api_key_env: String,
    /// Wall-clock seconds a demo generation pretends to run.
    pub demo_delay_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            mode: "demo".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "veo-3.0-generate-001".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            demo_delay_secs: 7,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerSection {
    pub slots: Option<usize>,
    pub recycle_after: Option<u32>,
    /// Queue lease visibility window, in seconds.
    pub visibility_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitOverride {
    pub poll_interval_secs: Option<u64>,
    pub soft_time_limit_secs: Option<u64>,
    pub hard_time_limit_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_ceiling_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LimitsSection {
    #[serde(default)]
    pub generate_from_image: LimitOverride,
    #[serde(default)]
    pub extract_frames: LimitOverride,
    #[serde(default)]
    pub edit_video: LimitOverride,
}

impl ServerConfig {
    pub fn resolve_path(name_or_path: &str) -> PathBuf {
        if name_or_path.contains('/') || name_or_path.contains('.') {
            PathBuf::from(name_or_path)
        } else {
            PathBuf::from(format!("/etc/vidforge/{name_or_path}.toml"))
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ServerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Assemble the job module configuration from defaults plus any
    /// overrides in the file.
    pub fn job_module_config(&self) -> JobModuleConfig {
        let mut config = JobModuleConfig::default();
        if let Some(slots) = self.worker.slots {
            config.worker.slots = slots;
        }
        if let Some(recycle) = self.worker.recycle_after {
            config.worker.recycle_after = recycle;
        }
        if let Some(secs) = self.worker.visibility_secs {
            config.queue_visibility = Duration::from_secs(secs);
        }
        config.types = TaskTypeConfigs {
            generate_from_image: apply_override(
                config.types.generate_from_image,
                &self.limits.generate_from_image,
            ),
            extract_frames: apply_override(config.types.extract_frames, &self.limits.extract_frames),
            edit_video: apply_override(config.types.edit_video, &self.limits.edit_video),
        };
        config
    }
}

fn apply_override(mut cfg: TaskTypeConfig, over: &LimitOverride) -> TaskTypeConfig {
    if let Some(s) = over.poll_interval_secs {
        cfg.poll_interval = Duration::from_secs(s);
    }
    if let Some(s) = over.soft_time_limit_secs {
        cfg.soft_time_limit = Duration::from_secs(s);
    }
    if let Some(s) = over.hard_time_limit_secs {
        cfg.hard_time_limit = Duration::from_secs(s);
    }
    if let Some(n) = over.max_retries {
        cfg.retry.max_retries = n;
    }
    if let Some(s) = over.backoff_base_secs {
        cfg.retry.backoff_base = Duration::from_secs(s);
    }
    if let Some(s) = over.backoff_ceiling_secs {
        cfg.retry.backoff_ceiling = Duration::from_secs(s);
    }
    cfg
}
