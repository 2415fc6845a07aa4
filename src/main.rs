use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uringkv::config::Config;
use uringkv::signal;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        sq_entries = config.sq_entries,
        recv_buffers = config.recv_buffers,
        recv_buffer_size = config.recv_buffer_size,
        "starting uringkv"
    );

    let running = signal::install_signal_handlers();

    if let Err(e) = uringkv::run(&config, running) {
        error!(error = %e, "server failed");
        return Err(e.into());
    }

    Ok(())
}
