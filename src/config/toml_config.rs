use crate::adapters::vxi11::Vxi11Options;
use crate::core::{ConfigProvider, ConnectionSettings};
use crate::domain::model::ModelSelection;
use crate::utils::error::{Result, ScopeError};
use crate::utils::validation::{self, Validate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

pub const OUTPUT_FORMATS: &[&str] = &["csv", "json"];
pub const UNITS: &[&str] = &["volts", "divisions"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub scope: ScopeSection,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSection {
    pub host: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub device_name: Option<String>,
    pub timeout_ms: Option<u64>,
    pub lock_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub portmap_port: Option<u16>,
    pub core_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<u8>,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    pub single: Option<bool>,
    #[serde(default = "default_busy")]
    pub busy: bool,
    #[serde(default = "default_units")]
    pub units: String,
    pub record_length: Option<u64>,
    pub average_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_path")]
    pub path: String,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
}

fn default_model() -> String {
    "auto".to_string()
}

fn default_channels() -> Vec<u8> {
    vec![1]
}

fn default_count() -> usize {
    1
}

fn default_tick_ms() -> u64 {
    100
}

fn default_busy() -> bool {
    true
}

fn default_units() -> String {
    "volts".to_string()
}

fn default_output_path() -> String {
    "./output".to_string()
}

fn default_formats() -> Vec<String> {
    vec!["csv".to_string()]
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            count: default_count(),
            tick_ms: default_tick_ms(),
            single: None,
            busy: default_busy(),
            units: default_units(),
            record_length: None,
            average_count: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            formats: default_formats(),
        }
    }
}

impl ScopeConfig {
    /// 以主機名稱建立預設配置
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            scope: ScopeSection {
                host: host.into(),
                model: default_model(),
                device_name: None,
                timeout_ms: None,
                lock_timeout_ms: None,
                poll_interval_ms: None,
                portmap_port: None,
                core_port: None,
            },
            acquisition: AcquisitionConfig::default(),
            output: OutputConfig::default(),
        }
    }

    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(ScopeError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content);

        toml::from_str(&processed_content).map_err(|e| ScopeError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${SCOPE_HOST})，未定義的變數保持原樣
    fn substitute_env_vars(content: &str) -> String {
        static ENV_VAR: OnceLock<Regex> = OnceLock::new();
        let re = ENV_VAR.get_or_init(|| {
            Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var pattern")
        });

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        })
        .to_string()
    }

    pub fn validate_config(&self) -> Result<()> {
        validation::validate_host("scope.host", &self.scope.host)?;
        self.model_selection()?;

        if let Some(name) = &self.scope.device_name {
            validation::validate_non_empty_string("scope.device_name", name)?;
        }
        if let Some(timeout) = self.scope.timeout_ms {
            validation::validate_positive_number("scope.timeout_ms", timeout, 1)?;
        }

        validation::validate_channels("acquisition.channels", &self.acquisition.channels)?;
        validation::validate_positive_number(
            "acquisition.count",
            self.acquisition.count as u64,
            1,
        )?;
        validation::validate_one_of("acquisition.units", &self.acquisition.units, UNITS)?;
        if let Some(length) = self.acquisition.record_length {
            validation::validate_positive_number("acquisition.record_length", length, 1)?;
        }
        if let Some(count) = self.acquisition.average_count {
            validation::validate_positive_number("acquisition.average_count", u64::from(count), 1)?;
        }

        validation::validate_path("output.path", &self.output.path)?;
        for format in &self.output.formats {
            validation::validate_one_of("output.formats", format, OUTPUT_FORMATS)?;
        }

        Ok(())
    }

    pub fn model_selection(&self) -> Result<ModelSelection> {
        self.scope.model.parse()
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.scope.timeout_ms.unwrap_or(10_000))
    }

    pub fn vxi11_options(&self) -> Vxi11Options {
        let defaults = Vxi11Options::default();
        Vxi11Options {
            device_name: self
                .scope
                .device_name
                .clone()
                .unwrap_or(defaults.device_name),
            io_timeout: self.io_timeout(),
            lock_timeout: self
                .scope
                .lock_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            portmap_port: self.scope.portmap_port.unwrap_or(defaults.portmap_port),
            core_port: self.scope.core_port,
            ..defaults
        }
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        let defaults = ConnectionSettings::default();
        ConnectionSettings {
            io_timeout: self.io_timeout(),
            poll_interval: self
                .scope
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

impl ConfigProvider for ScopeConfig {
    fn output_path(&self) -> &str {
        &self.output.path
    }

    fn output_formats(&self) -> &[String] {
        &self.output.formats
    }

    fn channels(&self) -> &[u8] {
        &self.acquisition.channels
    }

    fn acquisition_count(&self) -> usize {
        self.acquisition.count
    }

    fn tick(&self) -> Duration {
        Duration::from_millis(self.acquisition.tick_ms)
    }

    fn single(&self) -> Option<bool> {
        self.acquisition.single
    }

    fn busy_wait(&self) -> bool {
        self.acquisition.busy
    }

    fn convert_to_volts(&self) -> bool {
        self.acquisition.units == "volts"
    }

    fn record_length(&self) -> Option<u64> {
        self.acquisition.record_length
    }

    fn average_count(&self) -> Option<u32> {
        self.acquisition.average_count
    }
}

impl Validate for ScopeConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}
