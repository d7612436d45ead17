use crate::common::config::LoggerConfig;
use log::{debug, error, info, trace, warn, LevelFilter};
use log4rs::{
    append::{
        console::{ConsoleAppender, Target},
        rolling_file::{
            policy::compound::{
                roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
            },
            RollingFileAppender,
        },
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use std::fs;
use std::path::Path;
use std::str::FromStr;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}\n";

/// Stderr always; a rolling file as well when `config.path` is set.
pub fn setup_logger(config: LoggerConfig) -> Result<log4rs::Handle, Box<dyn std::error::Error>> {
    let level = LevelFilter::from_str(&config.level).unwrap_or(LevelFilter::Info);

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if !config.path.is_empty() {
        let trigger = SizeTrigger::new(config.file_size * 1024 * 1024);
        let roller = FixedWindowRoller::builder()
            .base(0)
            .build(&config.archive_pattern, config.file_count)?;
        let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

        if let Some(parent) = Path::new(&config.path).parent() {
            fs::create_dir_all(parent)?;
        }

        let logfile = RollingFileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(&config.path, Box::new(policy))?;

        builder = builder.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let handle = log4rs::init_config(builder.build(root.build(level))?)?;

    match level {
        LevelFilter::Trace => trace!("Logger initialized (trace)"),
        LevelFilter::Debug => debug!("Logger initialized (debug)"),
        LevelFilter::Info => info!("Logger initialized (info)"),
        LevelFilter::Warn => warn!("Logger initialized (warn)"),
        LevelFilter::Error => error!("Logger initialized (error)"),
        LevelFilter::Off => (),
    }

    if !config.path.is_empty() {
        info!(
            "Log file: '{}', archive: '{}'",
            config.path, config.archive_pattern
        );
    }

    Ok(handle)
}
