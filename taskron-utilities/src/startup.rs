use log::{LevelFilter, info};
use taskron_models::errors::SendableError;

use crate::logger::{self, print_env};

pub fn startup(name: &str, level: LevelFilter, log_file: &str) -> Result<(), SendableError> {
    logger::setup_logger(level, log_file)?;
    log_panics::init();

    info!("--- {} ---", name);
    print_env()?;

    Ok(())
}
