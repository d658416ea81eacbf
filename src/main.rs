use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ja2mqtt::config::AppConfig;
use ja2mqtt::runtime;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("JA2MQTT_CONFIG").ok())
        .ok_or_else(|| {
            eyre!("No configuration file. Pass it as the first argument or set JA2MQTT_CONFIG.")
        })?;
    let config = AppConfig::load(Path::new(&config_path)).await?;

    info!(
        "ja2mqtt, Jablotron JA-121T serial MQTT bridge, version {}",
        env!("CARGO_PKG_VERSION")
    );
    runtime::run(config).await
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    setup_logging();
    Ok(())
}

fn setup_logging() {
    let debug = env_flag("JA2MQTT_DEBUG");
    let no_ansi = env_flag("JA2MQTT_NO_ANSI");
    FmtSubscriber::builder()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_ansi(!no_ansi)
        .init();
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|value| matches!(value.as_str(), "1" | "true" | "True"))
        .unwrap_or(false)
}
