//! Start command - runs an in-memory broker until interrupted.
//!
//! The wire listener and codec live outside this crate; a broker started
//! from the CLI accepts transports through the embedding API. Useful for
//! soak-testing session logic and as a wiring example.

use crate::broker::Broker;
use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::protocol::Qos;
use anyhow::Result;
use bytes::Bytes;
use tracing_subscriber::EnvFilter;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    init_tracing(config.telemetry.log_level.as_deref());

    let broker = Broker::builder().config(config.broker.clone()).build();
    broker
        .publish(
            "$SYS/broker/version",
            Bytes::from_static(env!("CARGO_PKG_VERSION").as_bytes()),
            Qos::AtMostOnce,
            true,
        )
        .await?;
    tracing::info!(
        "broker running max_inflight_messages={}",
        config.broker.max_inflight_messages
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        "shutting down connected_clients={}",
        broker.server().connected_clients()
    );
    Ok(())
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
