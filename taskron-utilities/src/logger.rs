use std::{env, time::SystemTime};

use log::{LevelFilter, info};
use taskron_models::errors::SendableError;

pub fn format_line(level: log::Level, target: &str, message: &std::fmt::Arguments<'_>) -> String {
    format!(
        "[{} {} {}] {}",
        humantime::format_rfc3339_seconds(SystemTime::now()),
        level,
        target,
        message
    )
}

/// Installs the global logger, writing to stdout and appending to `log_file`.
/// sqlx statement logging stays at warn unless the level is debug or lower.
pub fn setup_logger(level: LevelFilter, log_file: &str) -> Result<(), SendableError> {
    let sqlx_level = if level >= LevelFilter::Debug {
        level
    } else {
        level.min(LevelFilter::Warn)
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}",
                format_line(record.level(), record.target(), message)
            ))
        })
        .level(level)
        .level_for("sqlx", sqlx_level)
        .level_for("hyper", level.min(LevelFilter::Info))
        .chain(std::io::stdout())
        .chain(fern::log_file(log_file)?)
        .apply()?;
    Ok(())
}

pub fn print_env() -> std::io::Result<()> {
    let path = env::current_dir()?;
    info!("The current directory is {}", path.display());
    Ok(())
}
