//! env_logger setup from the `logging` config section.
//!
//! `RUST_LOG` still wins over the configured level.

use std::io::Write;

use anyhow::{Context, Result};
use env_logger::WriteStyle;
use log::LevelFilter;

use crate::config::LoggingConfig;

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable, no colour.
    Plain,
    /// Human readable with ANSI colour.
    Color,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Parse a format name (case-insensitive). Empty means plain.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "plain" => Some(Self::Plain),
            "color" => Some(Self::Color),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parse a level name (case-insensitive).
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    name.trim().parse().ok()
}

fn json_line(record: &log::Record<'_>) -> String {
    serde_json::json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "level": record.level().as_str().to_ascii_lowercase(),
        "target": record.target(),
        "message": record.args().to_string(),
    })
    .to_string()
}

/// Install the global logger.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level);
    let format = LogFormat::parse(&config.format);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.unwrap_or(LevelFilter::Info));
    builder.parse_env(env_logger::Env::default());

    match format.unwrap_or(LogFormat::Plain) {
        LogFormat::Plain => {
            builder.write_style(WriteStyle::Never).format_timestamp_secs();
        }
        LogFormat::Color => {
            builder.write_style(WriteStyle::Always).format_timestamp_secs();
        }
        LogFormat::Json => {
            builder
                .write_style(WriteStyle::Never)
                .format(|buf, record| writeln!(buf, "{}", json_line(record)));
        }
    }

    builder.try_init().context("Logger already initialised")?;

    if format.is_none() {
        log::warn!("Unknown log format {}, defaulting to plain", config.format);
    }
    match level {
        Some(level) => log::debug!("Log level set to {level}"),
        None => log::warn!("Unknown log level {}, defaulting to info", config.level),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(LogFormat::parse(""), Some(LogFormat::Plain));
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("color"), Some(LogFormat::Color));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::Debug));
        assert_eq!(parse_level("WARN"), Some(LevelFilter::Warn));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_json_line() {
        let line = json_line(
            &log::Record::builder()
                .args(format_args!("relayed {}", 3))
                .level(log::Level::Info)
                .target("gotify_matrix_relay::relay")
                .build(),
        );
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["target"], "gotify_matrix_relay::relay");
        assert_eq!(value["message"], "relayed 3");
        assert!(value["timestamp"].is_string());
    }
}
