use std::sync::Arc;

use interfaces::DatabaseImpl;
use log::info;
use taskron_models::errors::TaskronError;

pub mod interfaces;
mod mappers;
pub mod sqlite;

pub async fn initialize_database(pool: &Arc<impl DatabaseImpl>) -> Result<(), TaskronError> {
    info!("Creating task store schema");
    pool.initialize().await?;
    Ok(())
}
