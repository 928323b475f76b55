use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use streamgraphd::config::Config;
use streamgraphd::daemon::producerd::ProducerDaemon;
use streamgraphd::daemon::{daemonize, init_socket, install_signal_handlers, run_accept_loop};


/// Owns camera capture pipelines and exposes them to consumerd over shm.
#[derive(Parser, Debug)]
#[command(name = "producerd")]
struct Args {
    /// Path to the shared streamgraphd config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the pipeline-worker binary this daemon spawns per camera.
    #[arg(long, default_value = "pipeline-worker")]
    worker_exe: String,

    /// Stay attached to the terminal instead of daemonizing; used in tests.
    #[arg(long)]
    foreground: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(config.log.filter.clone()))
        .init();

    let sock_path = config.producer_sock_path();

    if !args.foreground {
        daemonize()?;
    }

    let listener = init_socket(&sock_path)?;
    install_signal_handlers(sock_path.clone())?;

    info!(sock = %sock_path.display(), "producerd listening");

    let daemon = Arc::new(ProducerDaemon::new(config, args.worker_exe));

    run_accept_loop(listener, move |stream| {
        daemon.handle_connection(stream);
    })?;

    Ok(())
}
