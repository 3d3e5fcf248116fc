use crate::config::LoggingConfig;
use crate::error::MonitorError;
use log::LevelFilter;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;
use std::str::FromStr;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Routes diagnostics to the configured file. The JSON-lines event log is separate and never goes through here.
pub fn setup_logging(settings: &LoggingConfig) -> Result<(), MonitorError> {
    let level = parse_level(&settings.log_level)?;

    let log_file = match &settings.log_file {
        Some(path) => path,
        None => {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
    };

    // Create log directory if it doesn't exist
    if let Some(dir) = Path::new(log_file).parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .map_err(|e| MonitorError::Logging(format!("failed to create log directory: {}", e)))?;
        }
    }

    let logfile = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .append(true)
        .build(log_file)
        .map_err(|e| MonitorError::Logging(format!("failed to create log file: {}", e)))?;

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(logfile)))
        .build(Root::builder().appender("file").build(level))
        .map_err(|e| MonitorError::Logging(format!("failed to build log config: {}", e)))?;

    log4rs::init_config(config)
        .map_err(|e| MonitorError::Logging(format!("logging initialization failed: {}", e)))?;

    Ok(())
}

fn parse_level(name: &str) -> Result<LevelFilter, MonitorError> {
    LevelFilter::from_str(name.trim())
        .map_err(|_| MonitorError::Logging(format!("unknown log level '{}'", name)))
}
