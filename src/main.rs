use std::error::Error;

use clap::Parser;

use ferry::config::RelayConfig;

fn main() -> Result<(), Box<dyn Error>> {
    let config = RelayConfig::parse();

    // Configure logging based on verbose flag
    if config.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    // Built by hand so --worker-threads takes effect
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(ferry::server::run(config))
}
