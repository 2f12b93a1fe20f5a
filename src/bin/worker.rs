use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use cadence::config::Config;
use cadence::services::channels::{
    email::EmailAdapter, network::NetworkAdapter, voice::VoiceAdapter, ChannelSet,
};
use cadence::services::personalizer::AiClient;
use cadence::services::rate_governor::RateGovernor;
use cadence::services::scheduler::Scheduler;
use cadence::services::step_executor::StepExecutor;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("Failed to create pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let pool = Arc::new(pool);

    println!("🔄 Cadence worker started");
    println!("   - Claiming due enrollments (batch {})", config.claim_batch_size);
    println!("   - Worker pool size {}", config.global_concurrency);
    println!("   - Per-sender sends serialized");

    let channels = Arc::new(ChannelSet {
        email: EmailAdapter::new(),
        voice: VoiceAdapter::new(config.voice_api_url.clone(), config.voice_api_key.clone()),
        network: NetworkAdapter::new(
            config.browser_bridge_url.clone(),
            Duration::from_secs(config.network_min_interval_secs),
            Duration::from_secs(config.network_max_interval_secs),
            config.network_daily_cap,
        ),
    });

    let governor = Arc::new(RateGovernor::new(pool.clone()));
    let executor = Arc::new(StepExecutor::new(
        pool.clone(),
        governor.clone(),
        channels,
        AiClient::from_env(),
        config.max_attempts,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("🛑 Shutdown signal received, draining in-flight work");
            let _ = shutdown_tx.send(true);
        }
    });

    let scheduler = Scheduler::new(pool, governor, executor, config, shutdown_rx);
    scheduler.run().await;

    println!("Worker stopped");
    Ok(())
}
