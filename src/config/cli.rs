use crate::config::toml_config::ScopeConfig;
use crate::utils::error::{Result, ScopeError};
use clap::{Parser, Subcommand};

#[derive(Debug, Clone, Parser)]
#[command(name = "rohdescope")]
#[command(version, about = "Remote control of R&S oscilloscopes over VXI-11")]
pub struct CliConfig {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Scope host name or IP address (overrides the configuration file)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Scope model: auto, generic, rtm or rto
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Instrument io timeout in milliseconds
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: ScopeCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ScopeCommand {
    /// Print the scope identifier
    Idn,
    /// Print the acquisition status
    Status,
    /// Send a raw SCPI command; queries ending in '?' print the answer
    Send { command: String },
    /// Reset the scope (*RST)
    Reset,
    /// Run the autoset procedure
    Autoset,
    /// Start continuous acquisition
    Run,
    /// Stop acquiring
    Stop,
    /// Device clear: abort pending I/O and drop unread output
    Clear,
    /// Acquire waveforms and store them on disk
    Acquire {
        /// Channels to read, e.g. 1,2
        #[arg(long, value_delimiter = ',')]
        channels: Option<Vec<u8>>,

        /// Number of acquisitions
        #[arg(long)]
        count: Option<usize>,

        /// Tick in milliseconds; an empty acquisition waits out the rest of it
        #[arg(long)]
        tick_ms: Option<u64>,

        /// Output directory
        #[arg(long)]
        output: Option<String>,

        /// Keep raw values in divisions instead of volts
        #[arg(long)]
        divisions: bool,
    },
}

impl CliConfig {
    /// 合併配置檔與命令列參數
    pub fn resolve(&self) -> Result<ScopeConfig> {
        let mut config = match (&self.config, &self.host) {
            (Some(path), _) => ScopeConfig::from_file(path)?,
            (None, Some(host)) => ScopeConfig::for_host(host.clone()),
            (None, None) => {
                return Err(ScopeError::MissingConfigError {
                    field: "--host or --config".to_string(),
                })
            }
        };

        if let Some(host) = &self.host {
            config.scope.host = host.clone();
        }
        if let Some(model) = &self.model {
            config.scope.model = model.clone();
        }
        if let Some(timeout) = self.timeout_ms {
            config.scope.timeout_ms = Some(timeout);
        }

        if let ScopeCommand::Acquire {
            channels,
            count,
            tick_ms,
            output,
            divisions,
        } = &self.command
        {
            if let Some(channels) = channels {
                config.acquisition.channels = channels.clone();
            }
            if let Some(count) = count {
                config.acquisition.count = *count;
            }
            if let Some(tick_ms) = tick_ms {
                config.acquisition.tick_ms = *tick_ms;
            }
            if let Some(output) = output {
                config.output.path = output.clone();
            }
            if *divisions {
                config.acquisition.units = "divisions".to_string();
            }
        }

        Ok(config)
    }
}
