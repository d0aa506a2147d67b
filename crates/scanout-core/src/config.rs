use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration, loaded from scanout.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanoutConfig {
    #[serde(default)]
    pub waiter: WaiterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaiterConfig {
    /// Name given to the poll loop thread
    #[serde(default = "default_thread_name")]
    pub thread_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Commits take their own reference on the memoised framebuffer
    #[serde(default = "default_true")]
    pub lock_framebuffers: bool,
    /// Capacity of the commit event queue (0 = unbounded)
    #[serde(default = "default_event_queue")]
    pub event_queue: usize,
}

/// Parameters for `scanout simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_frames")]
    pub frames: u32,
    /// Number of distinct client buffers cycled through (swapchain length)
    #[serde(default = "default_buffers")]
    pub buffers: u32,
    #[serde(default = "default_min_latency")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency")]
    pub max_latency_ms: u64,
    /// Fraction of frames whose fence is abandoned instead of signaled
    #[serde(default = "default_hang_up_ratio")]
    pub hang_up_ratio: f64,
    #[serde(default = "default_frame_interval")]
    pub frame_interval_ms: u64,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            thread_name: default_thread_name(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock_framebuffers: true,
            event_queue: default_event_queue(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            frames: default_frames(),
            buffers: default_buffers(),
            min_latency_ms: default_min_latency(),
            max_latency_ms: default_max_latency(),
            hang_up_ratio: default_hang_up_ratio(),
            frame_interval_ms: default_frame_interval(),
        }
    }
}

impl ScanoutConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot be used.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sim = &self.simulation;
        if !sim.hang_up_ratio.is_finite() || !(0.0..=1.0).contains(&sim.hang_up_ratio) {
            return Err(ConfigError::Invalid(format!(
                "simulation.hang_up_ratio must be between 0 and 1, got {}",
                sim.hang_up_ratio
            )));
        }
        if sim.min_latency_ms > sim.max_latency_ms {
            return Err(ConfigError::Invalid(format!(
                "simulation.min_latency_ms ({}) exceeds max_latency_ms ({})",
                sim.min_latency_ms, sim.max_latency_ms
            )));
        }
        Ok(())
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!("ignoring config {}: {}", path, e);
                Self::default()
            }
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Returns the default config file path.
/// Search order:
/// 1. System-wide config: `/etc/scanout/scanout.toml`
/// 2. Local fallback: `./scanout.toml`
pub fn default_config_path() -> String {
    let system_path = "/etc/scanout/scanout.toml";
    if std::path::Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "scanout.toml".to_string()
}

fn default_thread_name() -> String {
    "scanout-waiter".to_string()
}

fn default_true() -> bool {
    true
}

fn default_event_queue() -> usize {
    256
}

fn default_frames() -> u32 {
    240
}

fn default_buffers() -> u32 {
    3
}

fn default_min_latency() -> u64 {
    1
}

fn default_max_latency() -> u64 {
    12
}

fn default_hang_up_ratio() -> f64 {
    0.02
}

fn default_frame_interval() -> u64 {
    4
}
