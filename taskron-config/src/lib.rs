use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use clap::{ArgAction, Parser};
use log::LevelFilter;
use taskron_models::errors::{RuntimeError, SendableError};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub database: String,
    pub scheduler_frequency: Duration,
    pub execution_timeout: Duration,
    pub output_limit_bytes: usize,
    pub log_retention: u32,
    pub shutdown_grace: Duration,
    pub stats_sample_window: Duration,
    pub require_bearer: bool,
    pub api_token: Option<String>,
    pub log_file: String,
    pub log_level: LevelFilter,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Webservice port to bind to
    #[arg(long, env = "TASKRON_PORT", default_value_t = 8080)]
    port: u16,

    /// Address the webservice binds to
    #[arg(long, env = "TASKRON_BIND", default_value = "0.0.0.0")]
    bind: String,

    /// Path to the SQLite database file
    #[arg(long, env = "TASKRON_DATABASE", default_value = "taskron.db")]
    database: String,

    /// Seconds between scheduler ticks
    #[arg(long, env = "TASKRON_SCHEDULER_FREQUENCY_SECONDS", default_value_t = 1)]
    scheduler_frequency_seconds: u64,

    /// Upper bound on a single task run
    #[arg(long, env = "TASKRON_EXECUTION_TIMEOUT_SECONDS", default_value_t = 30)]
    execution_timeout_seconds: u64,

    /// Captured output and error text are cut at this many bytes
    #[arg(long, env = "TASKRON_OUTPUT_LIMIT_BYTES", default_value_t = 65536)]
    output_limit_bytes: usize,

    /// Log entries kept per task, 0 keeps all of them
    #[arg(long, env = "TASKRON_LOG_RETENTION", default_value_t = 0)]
    log_retention: u32,

    /// Seconds running tasks get to finish on shutdown
    #[arg(long, env = "TASKRON_SHUTDOWN_GRACE_SECONDS", default_value_t = 10)]
    shutdown_grace_seconds: u64,

    /// Window between the two CPU samples behind /system/stats
    #[arg(long, env = "TASKRON_STATS_SAMPLE_MILLIS", default_value_t = 250)]
    stats_sample_millis: u64,

    /// Reject API calls without an `Authorization: Bearer` header
    #[arg(long, env = "TASKRON_REQUIRE_BEARER", default_value_t = true, action = ArgAction::Set)]
    require_bearer: bool,

    /// When set, bearer tokens must equal this value
    #[arg(long, env = "TASKRON_API_TOKEN")]
    api_token: Option<String>,

    #[arg(long, env = "TASKRON_LOG_FILE", default_value = "taskron.log")]
    log_file: String,

    /// off, error, warn, info, debug or trace
    #[arg(long, env = "TASKRON_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

pub fn parse_config() -> Result<Config, SendableError> {
    from_args(CliArgs::parse())
}

/// Parses an explicit argument list, first element being the program name.
pub fn parse_config_from<I, T>(args: I) -> Result<Config, SendableError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    from_args(CliArgs::try_parse_from(args)?)
}

fn from_args(args: CliArgs) -> Result<Config, SendableError> {
    let bind_ip: IpAddr = args.bind.parse().map_err(|err| -> SendableError {
        Box::new(RuntimeError::new(
            "config.bind",
            format!("invalid bind address '{}': {}", args.bind, err),
        ))
    })?;
    let listen_addr = SocketAddr::new(bind_ip, args.port);

    let log_level = args.log_level.parse::<LevelFilter>().map_err(|_| -> SendableError {
        Box::new(RuntimeError::new(
            "config.log_level",
            format!("unknown log level '{}'", args.log_level),
        ))
    })?;

    if args.scheduler_frequency_seconds == 0 {
        return Err(Box::new(RuntimeError::new(
            "config.scheduler_frequency_seconds",
            "scheduler frequency must be at least one second",
        )));
    }
    if args.execution_timeout_seconds == 0 {
        return Err(Box::new(RuntimeError::new(
            "config.execution_timeout_seconds",
            "execution timeout must be at least one second",
        )));
    }

    let api_token = args.api_token.filter(|token| !token.trim().is_empty());

    Ok(Config {
        listen_addr,
        database: args.database,
        scheduler_frequency: Duration::from_secs(args.scheduler_frequency_seconds),
        execution_timeout: Duration::from_secs(args.execution_timeout_seconds),
        output_limit_bytes: args.output_limit_bytes,
        log_retention: args.log_retention,
        shutdown_grace: Duration::from_secs(args.shutdown_grace_seconds),
        stats_sample_window: Duration::from_millis(args.stats_sample_millis),
        require_bearer: args.require_bearer,
        api_token,
        log_file: args.log_file,
        log_level,
    })
}
