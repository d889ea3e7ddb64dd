use ldapcache::builder::Builder;
use ldapcache::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Build a platform with config, cache, server and signal handling...
    let platform = Builder::new().enable_all().build().await?;

    // Serve clients until we're terminated. Failing to bind the listen address is fatal...
    platform.require::<Server>().event_loop().await?;

    log::info!("Shutdown complete.");
    Ok(())
}
