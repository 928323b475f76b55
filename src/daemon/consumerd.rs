//! `consumerd` core: owns one `target-worker` subprocess per live target,
//! dispatches `ConsumerMsg` requests against them, and keeps each target's
//! shared-memory descriptor in sync with the worker's reported state.

use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use tracing::{info, warn};

use crate::config::Config;
use crate::daemon::poll_connection;
use crate::error::{Result, StreamError};
use crate::ipc::{
    recv_exact, send_exact, ConsumerMsg, ConsumerMsgType, ConsumerRsp, ConsumerRspType,
};
use crate::registry::{Registry, TargetDescriptor};
use crate::types::{Codec, TargetKind};
use crate::worker::{TargetCtrlMsg, TargetCtrlType, TargetEventMsg, TargetEventType, WorkerHandle};

pub struct ConsumerDaemon {
    config: Config,
    registry: Registry,
    targets: Mutex<HashMap<u32, WorkerHandle<TargetEventMsg>>>,
    worker_exe: String,
}

impl ConsumerDaemon {
    pub fn new(config: &Config, worker_exe: String) -> ConsumerDaemon {
        ConsumerDaemon {
            registry: Registry::new(config.runtime.shm_prefix.clone()),
            config: config.clone(),
            targets: Mutex::new(HashMap::new()),
            worker_exe,
        }
    }

    /// Entry point run on the connection's handler thread: `poll`s the
    /// connection fd with the protocol's 10s timeout, reads one
    /// `ConsumerMsg`, dispatches it, writes back one `ConsumerRsp`.
    pub fn handle_connection(&self, stream: UnixStream) {
        let result = poll_connection(&stream, |conn| {
            let mut reader = conn;
            let msg: ConsumerMsg = recv_exact(&mut reader)?;

            let rsp_type = match self.dispatch(&msg) {
                Ok(rsp_type) => rsp_type,
                Err(e) => {
                    warn!(error = %e, hash_id = msg.hash_id, "dispatch failed");
                    ConsumerRspType::Fail
                }
            };

            let rsp = ConsumerRsp { rsp_type: rsp_type as u32 };
            let mut writer = conn;
            send_exact(&mut writer, &rsp)?;
            Ok(false)
        });

        if let Err(e) = result {
            warn!(error = %e, "consumerd connection handling failed");
        }
    }

    fn dispatch(&self, msg: &ConsumerMsg) -> Result<ConsumerRspType> {
        match msg.msg_type {
            t if t == ConsumerMsgType::CreateSrtTarget as u32 => {
                self.create_target(msg, TargetKind::Srt)?;
                Ok(ConsumerRspType::CreateTargetSuccess)
            }
            t if t == ConsumerMsgType::CreateRecordingTarget as u32 => {
                self.create_target(msg, TargetKind::Recording)?;
                Ok(ConsumerRspType::CreateTargetSuccess)
            }
            t if t == ConsumerMsgType::CreateImageCaptureTarget as u32 => {
                self.create_target(msg, TargetKind::ImageCapture)?;
                Ok(ConsumerRspType::CreateTargetSuccess)
            }
            t if t == ConsumerMsgType::StartTarget as u32 => {
                // The worker begins streaming as soon as its pipeline bin
                // reaches Playing during creation, so StartTarget is a
                // liveness confirmation rather than a separate action.
                let targets = self.targets.lock().unwrap();
                if targets.contains_key(&msg.hash_id) {
                    Ok(ConsumerRspType::StartSuccess)
                } else {
                    Err(StreamError::InvalidArgument(format!(
                        "no target with hash_id {}",
                        msg.hash_id
                    )))
                }
            }
            t if t == ConsumerMsgType::DestroyTarget as u32 => {
                self.destroy_target(msg.hash_id, msg.output_node_id)?;
                Ok(ConsumerRspType::DestroyTargetSuccess)
            }
            other => Err(StreamError::InvalidArgument(format!(
                "unknown ConsumerMsg type {other}"
            ))),
        }
    }

    fn create_target(&self, msg: &ConsumerMsg, kind: TargetKind) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        if targets.contains_key(&msg.hash_id) {
            info!(hash_id = msg.hash_id, "target already running, treating as idempotent");
            return Ok(());
        }

        let codec = Codec::from_wire(msg.codec)
            .ok_or_else(|| StreamError::InvalidArgument(format!("unknown codec {}", msg.codec)))?;

        // The producer's pipeline for this node must already be live in shm
        // before a target can be created against it — the registry, not the
        // local config, is the channel by which this daemon learns that.
        self.registry.pipeline_read(msg.input_node_id).map_err(|_| {
            StreamError::InvalidArgument(format!(
                "no producer pipeline for node {} (CreatePipeline not run yet)",
                msg.input_node_id
            ))
        })?;

        let camera = self.config.camera(msg.input_node_id).ok_or_else(|| {
            StreamError::InvalidArgument(format!("no camera config for node {}", msg.input_node_id))
        })?;

        let args = vec![
            "--kind".to_string(),
            kind.cli_str().to_string(),
            "--codec".to_string(),
            codec.cli_str().to_string(),
            "--uri".to_string(),
            msg.uri_str(),
            "--username".to_string(),
            msg.username_str(),
            "--bitrate".to_string(),
            msg.bitrate.to_string(),
            "--node-id".to_string(),
            msg.input_node_id.to_string(),
            "--device".to_string(),
            camera.device.clone(),
            "--source-kind".to_string(),
            camera.source_kind.cli_str().to_string(),
        ];
        let mut handle = WorkerHandle::spawn(&self.worker_exe, &args)?;

        let mut srt_mode_value = 0u32;
        if kind == TargetKind::Srt {
            let event: TargetEventMsg = handle.recv_event()?;
            if event.event_type == TargetEventType::SrtMode as u32 {
                srt_mode_value = event.value;
            }
        }

        self.registry.target_new(
            msg.hash_id,
            msg.output_node_id,
            TargetDescriptor {
                id: msg.hash_id,
                kind: kind as u32,
                codec: msg.codec,
                bitrate: msg.bitrate,
                bitrate_actual: msg.bitrate,
                quantizer: 0,
                srt_mode: srt_mode_value,
                caller_count: 0,
            },
        )?;

        // CallerAdded/CallerRemoved can arrive from the worker at any time,
        // not just in response to a request this daemon made, so they are
        // handled here as soon as they show up rather than competing with
        // `set_bitrate`'s synchronous `recv_event` for the same pipe.
        let registry = self.registry.clone();
        let hash_id = msg.hash_id;
        let node_id = msg.output_node_id;
        handle.start_pump(move |event: TargetEventMsg| {
            if event.event_type == TargetEventType::CallerAdded as u32
                || event.event_type == TargetEventType::CallerRemoved as u32
            {
                if let Ok(mut region) = registry.target_read(hash_id, node_id) {
                    let mut descriptor = region.get();
                    descriptor.caller_count = if event.event_type == TargetEventType::CallerAdded as u32 {
                        descriptor.caller_count.saturating_add(1)
                    } else {
                        descriptor.caller_count.saturating_sub(1)
                    };
                    region.set(&descriptor);
                }
                None
            } else {
                Some(event)
            }
        });

        targets.insert(msg.hash_id, handle);
        info!(hash_id = msg.hash_id, ?kind, "target-worker ready");
        Ok(())
    }

    fn destroy_target(&self, hash_id: u32, node_id: u32) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let mut handle = targets
            .remove(&hash_id)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no target with hash_id {hash_id}")))?;

        handle.send_ctrl(&TargetCtrlMsg {
            msg_type: TargetCtrlType::Stop as u32,
            value: 0,
        })?;
        let _ = handle.wait();

        if let Ok(region) = self.registry.target_read(hash_id, node_id) {
            let _ = region.close();
        }

        info!(hash_id, "target-worker terminated");
        Ok(())
    }

    /// Forwards a bitrate-control change to a running target's worker and
    /// updates its shm descriptor with the value the worker reports back.
    pub fn set_bitrate(&self, hash_id: u32, node_id: u32, bitrate: u32) -> Result<()> {
        let mut targets = self.targets.lock().unwrap();
        let handle = targets
            .get_mut(&hash_id)
            .ok_or_else(|| StreamError::InvalidArgument(format!("no target with hash_id {hash_id}")))?;

        handle.send_ctrl(&TargetCtrlMsg {
            msg_type: TargetCtrlType::SetBitrate as u32,
            value: bitrate,
        })?;
        let event: TargetEventMsg = handle.recv_event()?;
        if event.event_type != TargetEventType::NotifyEncoderBitrateChange as u32 {
            return Err(StreamError::IpcFailed("worker did not confirm bitrate change".into()));
        }

        if let Ok(mut region) = self.registry.target_read(hash_id, node_id) {
            let mut descriptor = region.get();
            descriptor.bitrate_actual = event.value;
            region.set(&descriptor);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destroy_unknown_target_is_an_error() {
        let daemon = ConsumerDaemon::new(&Config::default(), "true".to_string());
        let result = daemon.destroy_target(42, 1);
        assert!(result.is_err());
    }

    #[test]
    fn start_unknown_target_is_rejected_by_dispatch() {
        let daemon = ConsumerDaemon::new(&Config::default(), "true".to_string());
        let msg = ConsumerMsg::new(ConsumerMsgType::StartTarget, 1, 1, 1, 0, 42, "", "").unwrap();
        assert!(daemon.dispatch(&msg).is_err());
    }
}
