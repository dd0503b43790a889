//! Logging infrastructure for the spend engine
//!
//! The engine logs through the `log` facade. This module configures an
//! `env_logger` backend once per process and offers a structured helper for
//! spend events:
//! - Outpoints and scripts are truncated before they reach a log line
//! - Events are tagged with the stage of the attempt that produced them
//! - Output is human-readable by default, JSON lines when configured
//!
//! # Usage
//!
//! ```
//! use bitvault_spend::logging::{self, LogConfig, LogContext, LogLevel};
//! use serde_json::json;
//!
//! logging::init(&LogConfig::default()).expect("Failed to initialize logging");
//!
//! logging::log_spend(
//!     LogLevel::Info,
//!     LogContext::Assembly,
//!     "excess added to fee",
//!     Some(json!({ "excess_sat": 120 })),
//! );
//! ```

use bitcoin::{OutPoint, Script};
use chrono::Local;
use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::sync::Once;

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error conditions
    Error,
    /// Warning conditions
    Warn,
    /// Informational messages
    Info,
    /// Debug-level messages
    Debug,
    /// Trace level (very verbose)
    Trace,
}

/// Stage of a construction attempt a log line belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogContext {
    /// Fee rate resolution
    Fees,
    /// Coin filtering and selection
    Selection,
    /// Fee/change iteration and output placement
    Assembly,
    /// Reservation and locking of coins
    Reservation,
    /// External signer interaction
    Signing,
    /// Funding of partially built transactions
    Funding,
}

/// Configuration for the logging system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default log level
    pub level: LogLevel,
    /// Path to log file (None for console-only)
    pub log_file: Option<String>,
    /// Whether to include timestamps in log messages
    pub include_timestamps: bool,
    /// Whether to include source location in log messages
    pub include_source_location: bool,
    /// Whether to use JSON format for logs (machine-readable)
    pub json_format: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            include_timestamps: true,
            include_source_location: false,
            json_format: false,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warn => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

// Ensure logging is only initialized once
static LOGGING_INIT: Once = Once::new();

/// Initialize the logging system with the given configuration
///
/// Safe to call more than once; only the first call configures the logger.
/// A logger installed elsewhere (for example by a test harness) is left in
/// place.
pub fn init(config: &LogConfig) -> Result<(), String> {
    let mut result = Ok(());

    let include_timestamps = config.include_timestamps;
    let include_source_location = config.include_source_location;
    let json_format = config.json_format;
    let log_file = config.log_file.clone();
    let level = config.level;

    LOGGING_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(level.into());

        builder.format(move |buf, record| {
            let timestamp = if include_timestamps {
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
            } else {
                String::new()
            };

            let source_location = if include_source_location {
                format!(" [{}:{}]", record.file().unwrap_or("unknown"), record.line().unwrap_or(0))
            } else {
                String::new()
            };

            if json_format {
                let line = json!({
                    "timestamp": timestamp,
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "location": source_location.trim(),
                    "message": record.args().to_string(),
                });
                writeln!(buf, "{}", line)
            } else {
                if include_timestamps {
                    write!(buf, "{} ", timestamp)?;
                }
                writeln!(buf, "[{}{}] {}", record.level(), source_location, record.args())
            }
        });

        if let Some(file_path) = &log_file {
            match OpenOptions::new().create(true).append(true).open(file_path) {
                Ok(file) => {
                    builder.target(env_logger::Target::Pipe(Box::new(file)));
                }
                Err(e) => {
                    result = Err(format!("Failed to open log file {}: {}", file_path, e));
                    return;
                }
            }
        }

        if let Err(e) = builder.try_init() {
            debug!("Logger already initialized, using existing instance: {}", e);
        }
    });

    result
}

/// Update the log level dynamically
pub fn set_log_level(level: LogLevel) {
    log::set_max_level(level.into());
}

/// Truncate a potentially identifying string for logging
pub fn sanitize_for_logging(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let len = input.len();
    if len <= 8 || !input.is_ascii() {
        return "*****".to_string();
    }

    format!("{}...{}", &input[0..4], &input[len - 4..len])
}

/// Outpoint with a truncated txid
pub fn sanitize_outpoint(outpoint: &OutPoint) -> String {
    format!("{}:{}", sanitize_for_logging(&outpoint.txid.to_string()), outpoint.vout)
}

/// Script with its hex truncated
pub fn sanitize_script(script: &Script) -> String {
    let hex: String = script.as_bytes().iter().map(|b| format!("{:02x}", b)).collect();
    sanitize_for_logging(&hex)
}

/// Log a spend event with structured parameters
pub fn log_spend(level: LogLevel, context: LogContext, message: &str, params: Option<serde_json::Value>) {
    match params {
        Some(params) => log::log!(level.into(), "[{:?}] {} - {}", context, message, params),
        None => log::log!(level.into(), "[{:?}] {}", context, message),
    }
}
