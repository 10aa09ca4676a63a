use std::{
    error::Error,
    net::SocketAddr,
    path::PathBuf,
    process,
    sync::atomic::{AtomicBool, Ordering},
};

use clap::Parser;
use cube_network::protocol::CubeServer;
use log::{info, warn};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding the report files
    path: PathBuf,
    /// Listen for new connections at address
    address: SocketAddr,
    /// Number of connections served at once
    #[arg(short, long, default_value_t = 15)]
    workers: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let server = CubeServer::bind(cli.address, cli.path, cli.workers)?;

    let handle = server.shutdown_handle();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            warn!("interrupted twice, exiting without waiting for clients");
            process::exit(130);
        }
        info!("shutting down, waiting for connected clients");
        handle.shutdown();
    })?;

    server.listen()?;
    Ok(())
}
