use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use streamgraphd::config::Config;
use streamgraphd::daemon::consumerd::ConsumerDaemon;
use streamgraphd::daemon::{daemonize, init_socket, install_signal_handlers, run_accept_loop};

/// Owns outgoing SRT/recording/image-capture targets and links them to
/// camera pipelines published by producerd.
#[derive(Parser, Debug)]
#[command(name = "consumerd")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the target-worker binary this daemon spawns per target.
    #[arg(long, default_value = "target-worker")]
    worker_exe: String,

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

    let sock_path = config.consumer_sock_path();

    if !args.foreground {
        daemonize()?;
    }

    let listener = init_socket(&sock_path)?;
    install_signal_handlers(sock_path.clone())?;

    info!(sock = %sock_path.display(), "consumerd listening");

    let daemon = Arc::new(ConsumerDaemon::new(&config, args.worker_exe));

    run_accept_loop(listener, move |stream| {
        daemon.handle_connection(stream);
    })?;

    Ok(())
}
