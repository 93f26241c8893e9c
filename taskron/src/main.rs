use std::sync::Arc;

use log::{error, info};
use taskron_config::parse_config;
use taskron_database::{initialize_database, sqlite::SqliteDb};
use taskron_metrics::MetricsCollector;
use taskron_models::errors::SendableError;
use taskron_scheduler::{SchedulerConfig, SchedulerContext};
use taskron_utilities::startup;
use taskron_ws::{AppState, AuthConfig, run_webserver};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), SendableError> {
    let config = parse_config()?;
    startup::startup("Taskron", config.log_level, &config.log_file)?;

    info!("Initialize database pool");
    let pool = Arc::new(SqliteDb::new(&config.database).await?);
    initialize_database(&pool).await?;

    info!("Initialize scheduler");
    let scheduler = SchedulerContext::new(
        pool.clone(),
        SchedulerConfig {
            frequency: config.scheduler_frequency,
            execution_timeout: config.execution_timeout,
            output_limit: config.output_limit_bytes,
            log_retention: config.log_retention,
            shutdown_grace: config.shutdown_grace,
        },
    )?;

    let shutdown = CancellationToken::new();
    let shutdown_listener = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", err);
            return;
        }
        info!("Received shutdown signal. Shutting down...");
        shutdown_listener.cancel();
    });

    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = scheduler.run(shutdown.clone()).await;
            shutdown.cancel();
            result
        })
    };

    info!("Initialize web server");
    let state = AppState {
        scheduler,
        metrics: Arc::new(MetricsCollector::new(config.stats_sample_window)),
        auth: AuthConfig {
            require_bearer: config.require_bearer,
            api_token: config.api_token.clone(),
        },
    };
    let listen_addr = config.listen_addr;
    let web_server_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = run_webserver(listen_addr, state, shutdown.clone()).await;
            // A web server that stops on its own takes the scheduler down with it.
            shutdown.cancel();
            result
        })
    };

    info!("Initialization complete!");

    let (scheduler_result, web_result) = tokio::join!(scheduler_task, web_server_task);

    for (name, result) in [("scheduler", scheduler_result), ("web server", web_result)] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("The {} stopped with an error: {}", name, err),
            Err(err) => error!("The {} task failed: {:?}", name, err),
        }
    }

    info!("Application shutdown complete.");
    Ok(())
}
