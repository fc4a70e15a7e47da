// log4rs setup: one timestamped file per server start plus the console

use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// `<log_dir>/<YYYY-mm-dd-HH_MM>.log`
pub fn log_file_path(log_dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    log_dir.join(format!("{timestamp}.log"))
}

/// Build the logging config without installing it.
pub fn build_config(log_path: &Path, level: LevelFilter) -> anyhow::Result<Config> {
    let file_appender = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_path)?;
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file_appender)))
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(Root::builder().appender("file").appender("console").build(level))?;
    Ok(config)
}

/// Install the global logger. Returns the file being written.
pub fn setup_logging(log_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_file_path(log_dir);
    log4rs::init_config(build_config(&log_path, LevelFilter::Info)?)?;
    Ok(log_path)
}
