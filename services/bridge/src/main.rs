// bridge: Bidirectional MQTT relay between a local broker and vendor cloud
// brokers for home-energy storage devices.

use tracing::info;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "bridge starting");

    if let Err(err) = bridge::bootstrap::run().await {
        eprintln!("FATAL: {err}");
        std::process::exit(1);
    }
}
