//! Worker subprocess protocol. Each `pipeline-worker` and `target-worker`
//! is a long-lived child spawned by `producerd`/`consumerd` with its
//! stdin/stdout repurposed as a private control/event pipe pair: the
//! parent writes fixed-layout control records to the child's stdin and
//! reads fixed-layout event records from the child's stdout. The actual
//! GStreamer bus traffic never crosses the pipe; only the handful of
//! state transitions the parent needs to know about do.

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use crate::error::{Result, StreamError};
use crate::ipc::{recv_exact, send_exact};

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineCtrlType {
    SetResolution = 1,
    SetFps = 2,
    Terminate = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PipelineCtrlMsg {
    pub msg_type: u32,
    pub width: u32,
    pub height: u32,
    pub fps: i32,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEventType {
    Ready = 1,
    Error = 2,
    Stopped = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PipelineEventMsg {
    pub event_type: u32,
    pub code: i32,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCtrlType {
    Stop = 1,
    SetBitrate = 2,
    SetBitrateControl = 3,
    SetQuantizer = 4,
    SetAdaptorKind = 5,
    SetAdaptiveStreaming = 6,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TargetCtrlMsg {
    pub msg_type: u32,
    /// Meaning depends on `msg_type`: bitrate in bps, a `BitrateControl`
    /// discriminant, a quantizer value, an `AdaptorKind` discriminant, or
    /// a boolean (0/1) for `SetAdaptiveStreaming`. `Stop` ignores it.
    pub value: u32,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetEventType {
    SrtMode = 1,
    CallerAdded = 2,
    CallerRemoved = 3,
    NotifyEncoderBitrateChange = 4,
    NotifyEncoderQuantizerChange = 5,
    NotifyEncoderBitrateControlChange = 6,
    Stopped = 7,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TargetEventMsg {
    pub event_type: u32,
    pub value: u32,
}

enum EventSource<E> {
    /// `recv_event` reads the pipe itself.
    Direct(ChildStdout),
    /// A background thread owns the pipe and forwards records through this
    /// channel; installed by `start_pump` once the worker's event stream
    /// carries messages that can arrive outside of any `recv_event` call
    /// (e.g. target-worker's `CallerAdded`/`CallerRemoved`) and so would
    /// otherwise sit unread behind whatever `recv_event` next expects.
    Pumped(std::sync::mpsc::Receiver<E>),
}

/// A spawned worker subprocess, with its control pipe (our write side of
/// its stdin) and event pipe (our read side of its stdout) kept open for
/// the worker's lifetime. `E` is the event record type this worker's
/// stdout carries (`PipelineEventMsg` or `TargetEventMsg`).
pub struct WorkerHandle<E> {
    child: Child,
    ctrl: ChildStdin,
    events: EventSource<E>,
}

impl<E: Copy + Send + 'static> WorkerHandle<E> {
    /// Spawns `program` with `args`, wiring its stdin/stdout as pipes and
    /// leaving stderr inherited so worker logs land in the daemon's own
    /// log stream.
    pub fn spawn(program: &str, args: &[String]) -> Result<WorkerHandle<E>> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(StreamError::Io)?;

        let ctrl = child
            .stdin
            .take()
            .ok_or_else(|| StreamError::IpcFailed("worker stdin not piped".into()))?;
        let events = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::IpcFailed("worker stdout not piped".into()))?;

        Ok(WorkerHandle { child, ctrl, events: EventSource::Direct(events) })
    }

    pub fn send_ctrl<T: Copy>(&mut self, msg: &T) -> Result<()> {
        send_exact(&mut self.ctrl, msg)
    }

    pub fn recv_event(&mut self) -> Result<E> {
        match &mut self.events {
            EventSource::Direct(events) => recv_exact(events),
            EventSource::Pumped(rx) => rx
                .recv()
                .map_err(|_| StreamError::IpcFailed("worker event pump closed".into())),
        }
    }

    /// Hands exclusive ownership of the event pipe to a background thread:
    /// every record read from it is passed to `dispatch`, which returns
    /// `Some(event)` to make it available to a later `recv_event` call, or
    /// `None` to consume it here instead. Call once, before relying on
    /// `recv_event` for anything this worker can emit unprompted.
    pub fn start_pump<F>(&mut self, mut dispatch: F)
    where
        F: FnMut(E) -> Option<E> + Send + 'static,
    {
        let (tx, rx) = std::sync::mpsc::channel();
        let previous = std::mem::replace(&mut self.events, EventSource::Pumped(rx));
        if let EventSource::Direct(mut events) = previous {
            std::thread::spawn(move || loop {
                let event: E = match recv_exact(&mut events) {
                    Ok(e) => e,
                    Err(_) => return,
                };
                if let Some(forwarded) = dispatch(event) {
                    if tx.send(forwarded).is_err() {
                        return;
                    }
                }
            });
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Waits for the worker to exit. The daemon has no `SIGCHLD` handler of
    /// its own, so this is the only place a worker subprocess gets reaped —
    /// called at the controlled point where the daemon is done with it
    /// (`destroy_pipeline`/`destroy_target`), not opportunistically from a
    /// signal handler that could race this call.
    pub fn wait(&mut self) -> Result<std::process::ExitStatus> {
        self.child.wait().map_err(StreamError::Io)
    }

    pub fn kill(&mut self) -> Result<()> {
        self.child.kill().map_err(StreamError::Io)
    }
}

/// Runs a worker's stdin/stdout pump: reads fixed-layout control records
/// one at a time from stdin, dispatches each to `on_ctrl`, and lets
/// `on_ctrl` push zero or more event records out via the `emit` callback
/// it's given. Returns when stdin is closed (parent died or sent
/// `Terminate` and the handler chose to stop) or `on_ctrl` asks to stop.
pub fn run_worker_loop<C, E, F>(mut stdin: impl Read, mut stdout: impl Write, mut on_ctrl: F) -> Result<()>
where
    C: Copy,
    E: Copy,
    F: FnMut(C, &mut dyn FnMut(&E) -> Result<()>) -> Result<bool>,
{
    loop {
        let ctrl: C = match recv_exact(&mut stdin) {
            Ok(c) => c,
            Err(StreamError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut emit = |event: &E| -> Result<()> { send_exact(&mut stdout, event) };
        let keep_going = on_ctrl(ctrl, &mut emit)?;
        if !keep_going {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_fixed() {
        assert_eq!(std::mem::size_of::<PipelineCtrlMsg>(), 16);
        assert_eq!(std::mem::size_of::<PipelineEventMsg>(), 8);
        assert_eq!(std::mem::size_of::<TargetCtrlMsg>(), 8);
        assert_eq!(std::mem::size_of::<TargetEventMsg>(), 8);
    }

    #[test]
    fn worker_loop_pumps_ctrl_to_events_over_a_pipe() {
        // Drive run_worker_loop over an in-memory byte buffer standing in
        // for the stdin/stdout pipe pair.
        let mut ctrl_bytes = Vec::new();
        send_exact(&mut ctrl_bytes, &TargetCtrlMsg { msg_type: TargetCtrlType::SetBitrate as u32, value: 4_000_000 }).unwrap();

        let mut stdout = Vec::new();
        let reader = std::io::Cursor::new(ctrl_bytes);

        run_worker_loop::<TargetCtrlMsg, TargetEventMsg, _>(reader, &mut stdout, |ctrl, emit| {
            assert_eq!(ctrl.msg_type, TargetCtrlType::SetBitrate as u32);
            emit(&TargetEventMsg {
                event_type: TargetEventType::NotifyEncoderBitrateChange as u32,
                value: ctrl.value,
            })?;
            Ok(false)
        })
        .unwrap();

        let event: TargetEventMsg = recv_exact(&mut std::io::Cursor::new(stdout)).unwrap();
        assert_eq!(event.value, 4_000_000);
    }

    /// `start_pump` must fold the records its dispatch closure swallows
    /// (returns `None` for) out of the stream entirely, while still
    /// handing the rest to `recv_event` in order. Drives a real
    /// `WorkerHandle` against `cat`, which echoes whatever we write to its
    /// stdin back out its stdout, standing in for a worker's event pipe.
    #[test]
    fn start_pump_filters_and_forwards() {
        let mut handle: WorkerHandle<TargetEventMsg> = WorkerHandle::spawn("cat", &[]).unwrap();

        let swallowed = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let swallowed_in_pump = std::sync::Arc::clone(&swallowed);
        handle.start_pump(move |event: TargetEventMsg| {
            if event.event_type == TargetEventType::CallerAdded as u32 {
                swallowed_in_pump.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                None
            } else {
                Some(event)
            }
        });

        handle
            .send_ctrl(&TargetEventMsg { event_type: TargetEventType::CallerAdded as u32, value: 1 })
            .unwrap();
        handle
            .send_ctrl(&TargetEventMsg { event_type: TargetEventType::SrtMode as u32, value: 2 })
            .unwrap();

        let forwarded: TargetEventMsg = handle.recv_event().unwrap();
        assert_eq!(forwarded.event_type, TargetEventType::SrtMode as u32);
        assert_eq!(forwarded.value, 2);
        assert_eq!(swallowed.load(std::sync::atomic::Ordering::SeqCst), 1);

        let _ = handle.kill();
        let _ = handle.wait();
    }
}
