//! Shared daemon scaffolding: daemonize sequence, Unix-socket setup, and the
//! accept loop both producerd and consumerd follow.
//!
//! The original daemons fork a child per connection because their per-node
//! state lives entirely in the shm registry and the pipeline/target objects
//! never outlive a single connection. This port keeps a long-lived
//! `pipeline-worker`/`target-worker` subprocess per node instead (see
//! `DESIGN.md`), so the daemon process itself must hold a persistent
//! `node_id -> WorkerHandle` table across requests — a table a forked
//! child's copy-on-write memory cannot publish back to its parent once the
//! child exits. `run_accept_loop` therefore spawns a thread per connection
//! against one shared `Arc<Daemon>` rather than forking, so there is no
//! per-connection child process for a daemon-wide `SIGCHLD` handler to reap.
//! The worker subprocesses are this process's only real children, and they
//! are reaped explicitly by `WorkerHandle::wait()` at the controlled point
//! in `destroy_pipeline`/`destroy_target` where the daemon is done with
//! them — not opportunistically by a signal handler that can't tell a
//! crashed worker from one still in use.

pub mod consumerd;
pub mod producerd;

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, ForkResult};
use tracing::{error, info};

use crate::error::{Result, StreamError};

/// Performs the classic double-detach daemonize sequence: fork (parent
/// exits), `umask(0)`, `setsid`, `chdir("/")`. Logging is left attached to
/// stderr/a file rather than syslog (see SPEC_FULL's ambient-logging note);
/// everything else matches the original daemons' sequence exactly.
///
/// Returns `Ok(())` in the child that should continue running as the
/// daemon. The parent process calls `std::process::exit(0)` before this
/// function returns to it.
pub fn daemonize() -> Result<()> {
    match unsafe { unistd::fork() }.map_err(|e| StreamError::IpcFailed(format!("fork failed: {e}")))? {
        ForkResult::Parent { .. } => {
            std::process::exit(0);
        }
        ForkResult::Child => {}
    }

    unistd::umask(Mode::empty());

    unistd::setsid().map_err(|e| StreamError::IpcFailed(format!("setsid failed: {e}")))?;

    std::env::set_current_dir("/").map_err(StreamError::Io)?;

    Ok(())
}

/// Creates and binds an `AF_UNIX SOCK_STREAM` socket at `sock_path`,
/// unlinking any stale socket file left over from a previous run first.
pub fn init_socket(sock_path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(sock_path);
    UnixListener::bind(sock_path).map_err(StreamError::Io)
}

/// Installs the daemon's signal handlers: `SIGTERM` unlinks the listening
/// socket and kills the whole process group. There is no `SIGCHLD` handler
/// here — unlike the original, this daemon never forks a per-connection
/// child, and blindly reaping `waitpid(None, ...)` would race the explicit
/// `WorkerHandle::wait()` reap of a worker subprocess, swallowing its exit
/// status with `ECHILD` and masking a crash.
pub fn install_signal_handlers(sock_path: std::path::PathBuf) -> Result<()> {
    // SIGTERM needs the socket path, which nix's plain `SigHandler` cannot
    // carry; stash it in a process-global the handler can see.
    SOCK_PATH
        .set(sock_path)
        .map_err(|_| StreamError::IpcFailed("signal handlers installed twice".into()))?;
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_sigterm))
            .map_err(|e| StreamError::IpcFailed(format!("sigaction SIGTERM failed: {e}")))?;
    }
    Ok(())
}

static SOCK_PATH: once_cell::sync::OnceCell<std::path::PathBuf> = once_cell::sync::OnceCell::new();

extern "C" fn handle_sigterm(_sig: libc::c_int) {
    if let Some(path) = SOCK_PATH.get() {
        let _ = std::fs::remove_file(path);
    }
    unsafe {
        libc::kill(0, libc::SIGKILL);
    }
    std::process::exit(0);
}

/// Runs the accept loop: blocks on `accept`, then spawns a thread per
/// connection against the shared `handler`. Each thread runs `handler`
/// against its own connection and exits when the handler returns (normally
/// when the peer closes); the accept loop itself never blocks on a
/// connection's lifetime.
pub fn run_accept_loop<F>(listener: UnixListener, handler: F) -> Result<()>
where
    F: Fn(UnixStream) + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    loop {
        let (stream, _addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "accept failed");
                return Err(StreamError::IpcFailed(format!("accept failed: {e}")));
            }
        };

        let handler = Arc::clone(&handler);
        std::thread::spawn(move || {
            info!("accepted connection, dispatching on worker thread");
            handler(stream);
        });
    }
}

/// `poll`s a single connection fd with the original's 10s timeout loop,
/// calling `on_readable` each time data is available. Returns when the
/// peer closes, a poll error that is not `EINTR` occurs (fatal, matching
/// the original), or `on_readable` asks to stop.
pub fn poll_connection<F>(stream: &UnixStream, mut on_readable: F) -> Result<()>
where
    F: FnMut(&UnixStream) -> Result<bool>,
{
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use std::os::fd::AsFd;

    loop {
        let borrowed = stream.as_fd();
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(10_000u16).unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, timeout) {
            Ok(0) => continue, // timed out, loop and poll again
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => {
                return Err(StreamError::IpcFailed("poll interrupted".into()));
            }
            Err(e) => {
                return Err(StreamError::IpcFailed(format!("poll failed: {e}")));
            }
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.contains(PollFlags::POLLERR) || revents.contains(PollFlags::POLLHUP) {
            return Ok(());
        }
        if revents.contains(PollFlags::POLLIN) {
            let keep_going = on_readable(stream)?;
            if !keep_going {
                return Ok(());
            }
        }
    }
}
