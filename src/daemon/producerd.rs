//! `producerd` core: owns one `pipeline-worker` subprocess per camera
//! node, dispatches `ProviderMsg` requests against them, and publishes
//! pipeline state to the shared-memory registry so `consumerd` (a
//! separate process) can discover it.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::Config;
use crate::daemon::poll_connection;
use crate::error::{Result, StreamError};
use crate::ipc::{recv_exact, send_exact, ProviderMsg, ProviderMsgType, ProviderRsp, ProviderRspType};
use crate::registry::Registry;
use crate::worker::{PipelineCtrlMsg, PipelineCtrlType, PipelineEventMsg, PipelineEventType, WorkerHandle};

pub struct ProducerDaemon {
    config: Config,
    registry: Registry,
    workers: Mutex<HashMap<i32, WorkerHandle<PipelineEventMsg>>>,
    worker_exe: String,
}

impl ProducerDaemon {
    pub fn new(config: Config, worker_exe: String) -> ProducerDaemon {
        let registry = Registry::new(config.runtime.shm_prefix.clone());
        ProducerDaemon {
            config,
            registry,
            workers: Mutex::new(HashMap::new()),
            worker_exe,
        }
    }

    /// Entry point run on the connection's handler thread: `poll`s the
    /// connection fd with the protocol's 10s timeout, reads one
    /// `ProviderMsg` once the fd is readable, dispatches it, writes back one
    /// `ProviderRsp`, and returns. A connection handles exactly one request,
    /// matching the original protocol's request/response-then-close shape.
    pub fn handle_connection(&self, stream: UnixStream) {
        let result = poll_connection(&stream, |conn| {
            let mut reader = conn;
            let msg: ProviderMsg = recv_exact(&mut reader)?;

            let rsp_type = match self.dispatch(msg) {
                Ok(rsp_type) => rsp_type,
                Err(e) => {
                    warn!(error = %e, node_id = msg.node_id, "dispatch failed");
                    ProviderRspType::Fail
                }
            };

            let rsp = ProviderRsp { rsp_type: rsp_type as u32 };
            let mut writer = conn;
            send_exact(&mut writer, &rsp)?;
            Ok(false)
        });

        if let Err(e) = result {
            warn!(error = %e, "producerd connection handling failed");
        }
    }

    fn dispatch(&self, msg: ProviderMsg) -> Result<ProviderRspType> {
        match msg.msg_type {
            t if t == ProviderMsgType::CreatePipeline as u32 => {
                self.create_pipeline(msg.node_id)?;
                Ok(ProviderRspType::CreateSuccess)
            }
            t if t == ProviderMsgType::DestroyPipeline as u32 => {
                self.destroy_pipeline(msg.node_id)?;
                Ok(ProviderRspType::DestroySuccess)
            }
            other => Err(StreamError::InvalidArgument(format!(
                "unknown ProviderMsg type {other}"
            ))),
        }
    }

    fn create_pipeline(&self, node_id: i32) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(&node_id) {
            info!(node_id, "pipeline already running, treating as idempotent");
            return Ok(());
        }

        let camera = self.config.camera(node_id as u32).ok_or_else(|| {
            StreamError::InvalidArgument(format!("no camera config for node {node_id}"))
        })?;

        let args = vec![
            "--node-id".to_string(),
            node_id.to_string(),
            "--device".to_string(),
            camera.device.clone(),
            "--source-kind".to_string(),
            camera.source_kind.cli_str().to_string(),
            "--show-overlay".to_string(),
            camera.show_overlay.to_string(),
        ];
        let mut handle = WorkerHandle::spawn(&self.worker_exe, &args)?;

        handle.send_ctrl(&PipelineCtrlMsg {
            msg_type: PipelineCtrlType::SetResolution as u32,
            width: camera.resolution.width,
            height: camera.resolution.height,
            fps: camera.framerate,
        })?;

        let event: PipelineEventMsg = handle.recv_event()?;
        if event.event_type != PipelineEventType::Ready as u32 {
            return Err(StreamError::IpcFailed(format!(
                "pipeline-worker for node {node_id} failed to start (code {})",
                event.code
            )));
        }

        self.registry.pipeline_new(
            node_id as u32,
            crate::registry::PipelineDescriptor {
                node_id: node_id as u32,
                source_kind: camera.source_kind as u32,
                resolution_width: camera.resolution.width,
                resolution_height: camera.resolution.height,
                framerate: camera.framerate,
                target_count: 0,
            },
        )?;

        workers.insert(node_id, handle);
        info!(node_id, "pipeline-worker ready");
        Ok(())
    }

    fn destroy_pipeline(&self, node_id: i32) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        let mut handle = workers
            .remove(&node_id)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no pipeline for node {node_id}")))?;

        handle.send_ctrl(&PipelineCtrlMsg {
            msg_type: PipelineCtrlType::Terminate as u32,
            width: 0,
            height: 0,
            fps: 0,
        })?;
        let _ = handle.wait();

        if let Ok(region) = self.registry.pipeline_read(node_id as u32) {
            let _ = region.close();
        }

        info!(node_id, "pipeline-worker terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn destroy_unknown_pipeline_is_an_error() {
        let daemon = ProducerDaemon::new(Config::default(), "true".to_string());
        let result = daemon.destroy_pipeline(999);
        assert!(result.is_err());
    }
}
