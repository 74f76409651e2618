use crate::configurator::{CounterSettings, DEFAULT_SAMPLE_PERIOD, DEFAULT_TRACE_BUFFER_BYTES};
use crate::executor::{CommandExecutorConfig, InputDelivery};
use crate::mode::CounterMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub working_dir: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    2000
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            input_delivery: ConfigInputDelivery::default(),
            timeout_ms: default_timeout_ms(),
            working_dir: None,
        }
    }
}

impl TargetSettings {
    pub fn executor_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            command: self.command.clone(),
            input_delivery: match &self.input_delivery {
                ConfigInputDelivery::StdIn => InputDelivery::StdIn,
                ConfigInputDelivery::File { template } => InputDelivery::File(template.clone()),
            },
            timeout: Duration::from_millis(self.timeout_ms),
            working_dir: self.working_dir.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CounterConfig {
    #[serde(default)]
    pub mode: CounterMode,
    #[serde(default = "default_sample_period")]
    pub sample_period: u64,
    #[serde(default = "default_trace_buffer_bytes")]
    pub trace_buffer_bytes: usize,
    /// Signal name (`SIGIO`, `SIGUSR1`, ...) or number.
    #[serde(default = "default_overflow_signal")]
    pub overflow_signal: String,
}

fn default_sample_period() -> u64 {
    DEFAULT_SAMPLE_PERIOD
}

fn default_trace_buffer_bytes() -> usize {
    DEFAULT_TRACE_BUFFER_BYTES
}

fn default_overflow_signal() -> String {
    "SIGIO".to_string()
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            mode: CounterMode::default(),
            sample_period: default_sample_period(),
            trace_buffer_bytes: default_trace_buffer_bytes(),
            overflow_signal: default_overflow_signal(),
        }
    }
}

pub fn parse_signal(name: &str) -> Result<libc::c_int, anyhow::Error> {
    let signal = match name.trim().to_ascii_uppercase().trim_start_matches("SIG") {
        "IO" | "POLL" => libc::SIGIO,
        "USR1" => libc::SIGUSR1,
        "USR2" => libc::SIGUSR2,
        "URG" => libc::SIGURG,
        other => other
            .parse::<libc::c_int>()
            .map_err(|_| anyhow::anyhow!("Unknown overflow signal '{name}'"))?,
    };
    if signal <= 0 || signal > libc::SIGRTMAX() {
        anyhow::bail!("Overflow signal {signal} is out of range");
    }
    Ok(signal)
}

impl CounterConfig {
    pub fn settings(&self) -> Result<CounterSettings, anyhow::Error> {
        Ok(CounterSettings {
            sample_period: self.sample_period,
            trace_buffer_bytes: self.trace_buffer_bytes,
            overflow_signal: parse_signal(&self.overflow_signal)?,
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PerfeedConfig {
    #[serde(default)]
    pub counter: CounterConfig,
    #[serde(default)]
    pub target: Option<TargetSettings>,
}

impl PerfeedConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: PerfeedConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}
