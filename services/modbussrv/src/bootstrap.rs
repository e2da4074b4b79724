//! Command line and startup helpers

use std::path::PathBuf;

use clap::Parser;
use ladder_modbus::ModbusConfig;

use crate::logging::LogOptions;

/// Command-line arguments for modbussrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "modbussrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus master/slave service for the ladder controller",
    long_about = None
)]
pub struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short = 'c', long, env = "MODBUSSRV_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error) or a full filter
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,

    /// Directory for daily rolling log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Do not start the master polling engine
    #[arg(long)]
    pub no_master: bool,

    /// Do not start the slave socket server
    #[arg(long)]
    pub no_slave: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    pub validate: bool,
}

impl Args {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            ansi: !self.no_color,
            ..LogOptions::default()
        }
    }
}

/// Human-readable request table, one line per slot
pub fn describe_requests(config: &ModbusConfig) -> Vec<String> {
    config
        .requests
        .iter()
        .enumerate()
        .map(|(index, slot)| {
            if !slot.is_used() {
                return format!("#{:<2} (unused)", index);
            }
            let kind = config.master_map.kind_for(slot.function);
            format!(
                "#{:<2} {:<22} {} elements {}..+{} -> {}[{}]{}",
                index,
                slot.target_address,
                slot.function,
                slot.first_element,
                slot.quantity(),
                kind,
                slot.variable_offset,
                if slot.logic_inverted { " (inverted)" } else { "" }
            )
        })
        .collect()
}
