use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod sqlite;

use config::BusKind;

const BUS_NAME: &str = "org.freedesktop.Roster1";
const OBJECT_PATH: &str = "/org/freedesktop/Roster1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rosterd starting");

    let config = config::Config::from_env().context("loading configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        db = %config.db_path.display(),
        bus = ?config.bus,
        required_pose_count = config.pipeline.required_pose_count,
        "configuration loaded"
    );

    let (engine, slot) = engine::spawn_engine(&config).context("starting engine")?;
    let iface = dbus_interface::RosterInterface::new(engine, slot);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, iface)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rosterd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rosterd shutting down");

    Ok(())
}
