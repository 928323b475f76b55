//! The media graph core: one Pipeline per physical capture source, fanning
//! out through a tee to any number of attached Targets.
//!
//! Attach/detach is modeled as a short-lived `Linker` value carrying
//! `(tee_src_pad, target, intent)`, consumed exactly once by a blocking pad
//! probe installed on that pad. The probe callback removes itself before
//! doing anything else, so it is never re-entered and never risks blocking
//! the event-loop thread against itself.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use gstreamer::prelude::*;
use gstreamer::{Bin, Caps, Element, GhostPad, PadProbeReturn, PadProbeType, State};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::{Result, StreamError};
use crate::media::MediaFramework;
use crate::target::{Target, TargetParams, TargetState};
use crate::types::{Resolution, SourceKind};

/// Maps a `SourceKind` + device string to a GStreamer launch fragment.
/// Shared by `Pipeline` and by `target-worker`, which builds its own
/// private capture source rather than sharing a tee across the process
/// boundary (see the worker-protocol design notes in `DESIGN.md`).
pub fn source_description_for(source_kind: SourceKind, device: &str) -> String {
    match source_kind {
        SourceKind::V4l2Like => format!("v4l2src device={device}"),
        SourceKind::TestPattern => "videotestsrc is-live=true pattern=0".to_string(),
        SourceKind::ArgusLike => format!("nvarguscamerasrc sensor-id={device}"),
    }
}

/// The caps-filter union this pipeline's tee sink accepts: raw, raw(NVMM),
/// or MJPEG, all at the same fixed resolution/framerate. Shared by the
/// initial build and by live `SetResolution`/`SetFps` rewrites so both
/// produce byte-identical caps strings.
fn caps_string(resolution: Resolution, framerate: i32) -> String {
    format!(
        "video/x-raw,width={w},height={h},framerate={fps}/1;\
         video/x-raw(memory:NVMM),width={w},height={h},framerate={fps}/1;\
         image/jpeg,width={w},height={h},framerate={fps}/1",
        w = resolution.width,
        h = resolution.height,
        fps = framerate
    )
}

/// Assembles the full source-branch launch string: source element chain,
/// caps-filter, decoder, an optional `timeoverlay` gated by `show_overlay`,
/// and the fan-out tee. Split out from `build_source_branch` so the
/// `show_overlay` wiring is covered by a plain string-building unit test
/// rather than one that needs a live GStreamer registry.
fn source_branch_description(
    source_desc: &str,
    node_id: u32,
    resolution: Resolution,
    framerate: i32,
    show_overlay: bool,
) -> String {
    let caps = caps_string(resolution, framerate);
    let overlay = if show_overlay {
        format!("timeoverlay name=pipeline_{node_id}_overlay ! ")
    } else {
        String::new()
    };
    format!(
        "{source_desc} ! capsfilter name=pipeline_{node_id}_caps caps=\"{caps}\" ! decodebin ! {overlay}tee name=pipeline_{node_id}_tee"
    )
}

fn hash32(s: &str) -> u32 {
    // FNV-1a; stable across processes, which is what the shm key scheme
    // and the idempotent add_target-by-uri-hash rule both depend on.
    let mut hash: u32 = 0x811c_9dc5;
    for b in s.as_bytes() {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

enum LinkIntent {
    Link,
    Unlink,
}

struct Linker {
    pipeline: Weak<PipelineInner>,
    target: Arc<Target>,
    intent: LinkIntent,
}

struct PipelineInner {
    _framework: MediaFramework,
    id: u32,
    source_kind: SourceKind,
    device: String,
    show_overlay: bool,
    gst_pipeline: gstreamer::Pipeline,
    resolution: Mutex<Option<Resolution>>,
    framerate: Mutex<Option<i32>>,
    tee: Mutex<Option<Element>>,
    capsfilter: Mutex<Option<Element>>,
    targets: Mutex<HashMap<u32, Arc<Target>>>,
    pending_target_removals: AtomicU32,
    stop_source: Mutex<Option<glib::SourceId>>,
    source_built: Mutex<bool>,
}

/// A capture source and its live set of attached targets. Cheap to clone:
/// internally an `Arc`.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    /// Pure constructor: no media objects are built until the first
    /// `add_target`.
    pub fn open(
        node_id: u32,
        source_kind: SourceKind,
        device: impl Into<String>,
        show_overlay: bool,
    ) -> Result<Pipeline> {
        let framework = MediaFramework::acquire()?;
        let gst_pipeline = gstreamer::Pipeline::builder()
            .name(format!("pipeline-{node_id}"))
            .build();

        Ok(Pipeline {
            inner: Arc::new(PipelineInner {
                _framework: framework,
                id: node_id,
                source_kind,
                device: device.into(),
                show_overlay,
                gst_pipeline,
                resolution: Mutex::new(None),
                framerate: Mutex::new(None),
                tee: Mutex::new(None),
                capsfilter: Mutex::new(None),
                targets: Mutex::new(HashMap::new()),
                pending_target_removals: AtomicU32::new(0),
                stop_source: Mutex::new(None),
                source_built: Mutex::new(false),
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    fn source_description(&self) -> String {
        source_description_for(self.inner.source_kind, &self.inner.device)
    }

    /// Builds and starts the shared capture/tee source branch without
    /// attaching any target. Used by `pipeline-worker`, which only keeps
    /// this branch alive and reports its health; targets attach from a
    /// separate process and are not this struct's concern there.
    pub fn start(&self, resolution: Resolution, framerate: i32) -> Result<()> {
        self.build_source_branch(resolution, framerate)
    }

    fn build_source_branch(&self, resolution: Resolution, framerate: i32) -> Result<()> {
        let mut built = self.inner.source_built.lock();
        if *built {
            return Ok(());
        }

        let desc = source_branch_description(
            &self.source_description(),
            self.inner.id,
            resolution,
            framerate,
            self.inner.show_overlay,
        );

        let bin = gstreamer::parse::bin_from_description(&desc, false)
            .map_err(|e| StreamError::ResourceUnsupported(format!("{e}")))?;
        let bin: Bin = bin.downcast().expect("parse::bin_from_description returns a Bin");

        let tee = bin
            .by_name(&format!("pipeline_{id}_tee", id = self.inner.id))
            .ok_or_else(|| StreamError::ResourceUnsupported("tee element missing".into()))?;
        let capsfilter = bin
            .by_name(&format!("pipeline_{id}_caps", id = self.inner.id))
            .ok_or_else(|| StreamError::ResourceUnsupported("capsfilter element missing".into()))?;

        // Reconfigure-drop probe on the tee's sink pad: renegotiation events
        // arriving from downstream must not propagate back upstream, since
        // resolution/framerate are fixed for the pipeline's lifetime once
        // the first target attaches.
        if let Some(sink_pad) = tee.static_pad("sink") {
            sink_pad.add_probe(PadProbeType::EVENT_UPSTREAM, |_pad, info| {
                if let Some(gstreamer::PadProbeData::Event(ev)) = &info.data {
                    if ev.type_() == gstreamer::EventType::Reconfigure {
                        return PadProbeReturn::Drop;
                    }
                }
                PadProbeReturn::Ok
            });
        }

        self.install_bus_watch(&bin);

        self.inner
            .gst_pipeline
            .add(&bin)
            .map_err(StreamError::Glib)?;
        bin.sync_state_with_parent().map_err(StreamError::Glib)?;
        self.inner
            .gst_pipeline
            .set_state(State::Playing)
            .map_err(|_| StreamError::TransmitFailed("source branch failed to reach Playing".into()))?;

        *self.inner.tee.lock() = Some(tee);
        *self.inner.capsfilter.lock() = Some(capsfilter);
        *self.inner.resolution.lock() = Some(resolution);
        *self.inner.framerate.lock() = Some(framerate);
        *built = true;
        Ok(())
    }

    /// Rewrites the capsfilter in place to a new resolution and/or framerate
    /// (whichever is given; the other keeps its current value), per
    /// `SetResolution`/`SetFps`. On non-Argus sources the source branch is
    /// cycled `Ready -> prior state` first so the decoder rediscovers the
    /// new format; Argus sources do not support this cycle and are left
    /// running, matching §4.1's "Resolution change" rule.
    fn rewrite_caps(&self, resolution: Option<Resolution>, framerate: Option<i32>) -> Result<()> {
        if !*self.inner.source_built.lock() {
            return Err(StreamError::ResourceUnsupported(
                "cannot change caps before the source branch is built".into(),
            ));
        }

        let resolution = resolution.unwrap_or_else(|| {
            self.inner.resolution.lock().unwrap_or(Resolution::HD)
        });
        let framerate = framerate.unwrap_or_else(|| self.inner.framerate.lock().unwrap_or(30));

        let capsfilter = self
            .inner
            .capsfilter
            .lock()
            .clone()
            .ok_or_else(|| StreamError::ResourceUnsupported("capsfilter not built".into()))?;

        let caps = Caps::from_str(&caps_string(resolution, framerate))
            .map_err(|e| StreamError::InvalidArgument(format!("invalid caps: {e}")))?;

        let cyclable = self.inner.source_kind != SourceKind::ArgusLike;
        let prior_state = if cyclable {
            let (_, current, _) = self.inner.gst_pipeline.state(gstreamer::ClockTime::NONE);
            self.inner
                .gst_pipeline
                .set_state(State::Ready)
                .map_err(|_| StreamError::TransmitFailed("source branch failed to reach Ready for reconfigure".into()))?;
            Some(current)
        } else {
            None
        };

        capsfilter.set_property("caps", &caps);

        if let Some(prior) = prior_state {
            self.inner
                .gst_pipeline
                .set_state(prior)
                .map_err(|_| StreamError::TransmitFailed("source branch failed to restore state after reconfigure".into()))?;
        }

        *self.inner.resolution.lock() = Some(resolution);
        *self.inner.framerate.lock() = Some(framerate);
        info!(node_id = self.inner.id, width = resolution.width, height = resolution.height, framerate, "caps rewritten");
        Ok(())
    }

    /// `SetResolution` worker control message: rewrite the caps-filter to a
    /// new resolution, keeping the current framerate.
    pub fn set_resolution(&self, resolution: Resolution) -> Result<()> {
        self.rewrite_caps(Some(resolution), None)
    }

    /// `SetFps` worker control message: rewrite the caps-filter to a new
    /// framerate, keeping the current resolution.
    pub fn set_framerate(&self, framerate: i32) -> Result<()> {
        self.rewrite_caps(None, Some(framerate))
    }

    fn install_bus_watch(&self, bin: &Bin) {
        if let Some(bus) = bin.bus() {
            let id = self.inner.id;
            let _ = bus.add_watch(move |_bus, msg| {
                use gstreamer::MessageView;
                match msg.view() {
                    MessageView::Error(err) => {
                        error!(node_id = id, error = %err.error(), debug = ?err.debug(), "pipeline bus error");
                    }
                    MessageView::Warning(w) => {
                        warn!(node_id = id, warning = %w.error(), "pipeline bus warning");
                    }
                    MessageView::Eos(_) => {
                        info!(node_id = id, "pipeline reached end of stream");
                    }
                    _ => {}
                }
                glib::ControlFlow::Continue
            });
        }
    }

    /// Atomically attach an encoder/sink branch. Returns the target id
    /// (`hash32(uri)`); calling again with a URI that hashes to an existing
    /// target is a no-op success per the idempotence invariant.
    pub fn add_target(&self, params: TargetParams) -> Result<u32> {
        params.validate()?;

        let id = hash32(&params.uri);
        {
            let targets = self.inner.targets.lock();
            if targets.contains_key(&id) {
                return Ok(id);
            }
        }

        // cancel any scheduled teardown before building/attaching
        self.cancel_scheduled_stop();

        let resolution = self
            .inner
            .resolution
            .lock()
            .unwrap_or(Resolution::HD);
        let framerate = self.inner.framerate.lock().unwrap_or(30);
        self.build_source_branch(resolution, framerate)?;

        let target = Arc::new(Target::new(self.inner.id, id, params)?);
        target.set_state(TargetState::Linking);

        self.link_target(Arc::clone(&target))?;

        self.inner.targets.lock().insert(id, target);
        Ok(id)
    }

    fn link_target(&self, target: Arc<Target>) -> Result<()> {
        let tee = {
            let guard = self.inner.tee.lock();
            guard.clone().ok_or_else(|| {
                StreamError::ResourceUnsupported("source branch not built before link".into())
            })?
        };

        let tee_src = tee
            .request_pad_simple("src_%u")
            .ok_or_else(|| StreamError::ResourceUnsupported("tee refused a new request pad".into()))?;

        self.inner
            .gst_pipeline
            .add(target.bin())
            .map_err(StreamError::Glib)?;

        let linker = Arc::new(Linker {
            pipeline: Arc::downgrade(&self.inner),
            target: Arc::clone(&target),
            intent: LinkIntent::Link,
        });

        let pending_pad = tee_src.clone();
        let probe_id = tee_src
            .add_probe(PadProbeType::BLOCK_DOWNSTREAM, move |pad, _info| {
                // Returning `Remove` detaches this probe before the callback's
                // effects (attaching the target's sub-bin, linking pads) are
                // observed by any other thread; the probe can never re-enter.
                run_link_probe(&linker, pad);
                PadProbeReturn::Remove
            })
            .ok_or_else(|| StreamError::ResourceUnsupported("tee src pad refused a probe".into()))?;
        target.set_pending_link_probe(pending_pad, probe_id);

        Ok(())
    }

    /// Detach a target. A target id unknown to this pipeline is a no-op
    /// success.
    pub fn remove_target(&self, target_id: u32) -> Result<()> {
        let target = {
            let mut targets = self.inner.targets.lock();
            match targets.remove(&target_id) {
                Some(t) => t,
                None => return Ok(()),
            }
        };

        target.set_state(TargetState::Unlinking);
        self.inner.pending_target_removals.fetch_add(1, Ordering::SeqCst);
        self.unlink_target(target);
        Ok(())
    }

    fn unlink_target(&self, target: Arc<Target>) {
        let ghost_sink = target.ghost_sink().clone();
        let src_pad = match ghost_sink.peer() {
            Some(p) => p,
            None => {
                // The link probe hasn't fired yet: cancel it instead of
                // letting it run against a target we're about to tear down,
                // and release the tee's request pad ourselves since
                // `finish_target_removal` only does that when there was a
                // peer to read it from.
                if let Some((tee_src, probe_id)) = target.take_pending_link_probe() {
                    tee_src.remove_probe(probe_id);
                    let tee = self.inner.tee.lock().clone();
                    if let Some(tee) = tee {
                        let _ = tee.release_request_pad(&tee_src);
                    }
                }
                self.finish_target_removal(target);
                return;
            }
        };

        let linker = Arc::new(Linker {
            pipeline: Arc::downgrade(&self.inner),
            target,
            intent: LinkIntent::Unlink,
        });

        src_pad.add_probe(PadProbeType::BLOCK_DOWNSTREAM, move |pad, _info| {
            run_unlink_probe(&linker, pad);
            PadProbeReturn::Remove
        });
    }

    fn finish_target_removal(&self, target: Arc<Target>) {
        let tee = self.inner.tee.lock().clone();
        if let (Some(tee), Some(peer)) = (tee, target.ghost_sink().peer()) {
            let _ = tee.release_request_pad(&peer);
        }
        let _ = self.inner.gst_pipeline.remove(target.bin());
        let _ = target.bin().set_state(State::Null);
        target.set_state(TargetState::Stopped);
        info!(target_id = target.id, "stream-stopped");

        self.inner.pending_target_removals.fetch_sub(1, Ordering::SeqCst);
        self.maybe_schedule_stop();
    }

    fn maybe_schedule_stop(&self) {
        let empty = self.inner.targets.lock().is_empty();
        let none_pending = self.inner.pending_target_removals.load(Ordering::SeqCst) == 0;
        if !(empty && none_pending) {
            return;
        }

        let mut stop_source = self.inner.stop_source.lock();
        if stop_source.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = glib::idle_add_once(move || {
            if let Some(inner) = weak.upgrade() {
                Pipeline { inner }.stop();
            }
        });
        *stop_source = Some(id);
    }

    fn cancel_scheduled_stop(&self) {
        if let Some(id) = self.inner.stop_source.lock().take() {
            id.remove();
        }
    }

    /// Sets the source branch state to `Null`, cancels any scheduled
    /// self-stop, and drops the tee reference. Must be called on the main
    /// thread (the glib idle callback or the caller's own event loop).
    pub fn stop(&self) {
        self.cancel_scheduled_stop();
        let _ = self.inner.gst_pipeline.set_state(State::Null);
        *self.inner.tee.lock() = None;
        *self.inner.capsfilter.lock() = None;
        *self.inner.source_built.lock() = false;
    }

    pub fn bytes_sent(&self, target_id: u32) -> u64 {
        self.inner
            .targets
            .lock()
            .get(&target_id)
            .map(|t| t.bytes_sent())
            .unwrap_or(0)
    }

    pub fn target_count(&self) -> usize {
        self.inner.targets.lock().len()
    }

    pub fn target(&self, id: u32) -> Option<Arc<Target>> {
        self.inner.targets.lock().get(&id).cloned()
    }
}

fn run_link_probe(linker: &Linker, tee_src_pad: &gstreamer::Pad) {
    let pipeline_inner = match linker.pipeline.upgrade() {
        Some(p) => p,
        None => return,
    };
    let pipeline = Pipeline { inner: pipeline_inner };
    let target = &linker.target;

    // The probe has already fired and removed itself; drop the stale id so
    // a racing `unlink_target` doesn't try to cancel a probe that's gone.
    target.take_pending_link_probe();

    if let Err(e) = target.bin().sync_state_with_parent() {
        error!(target_id = target.id, error = %e, "target sub-bin failed to sync state");
        return;
    }

    let ghost_src = GhostPad::with_target(tee_src_pad).expect("ghost pad over tee src pad");
    let _ = pipeline.inner.gst_pipeline.add_pad(&ghost_src);

    if ghost_src.link(target.ghost_sink()).is_err() {
        error!(target_id = target.id, "failed to link ghost src to target ghost sink");
        return;
    }

    target.set_state(TargetState::Streaming);
    info!(target_id = target.id, "stream-started");
}

fn run_unlink_probe(linker: &Linker, src_pad: &gstreamer::Pad) {
    let pipeline_inner = match linker.pipeline.upgrade() {
        Some(p) => p,
        None => return,
    };
    let pipeline = Pipeline { inner: pipeline_inner };
    let target = Arc::clone(&linker.target);

    let _ = target.ghost_sink().unlink(src_pad);
    pipeline.inner.gst_pipeline.remove_pad(src_pad).ok();

    pipeline.finish_target_removal(target);
}

#[cfg(test)]
mod tests {
    use super::{caps_string, hash32, source_branch_description};
    use crate::types::Resolution;

    #[test]
    fn caps_string_covers_raw_nvmm_and_mjpeg() {
        let caps = caps_string(Resolution::HD, 30);
        assert!(caps.contains("video/x-raw,width=1280,height=720,framerate=30/1"));
        assert!(caps.contains("video/x-raw(memory:NVMM),width=1280,height=720,framerate=30/1"));
        assert!(caps.contains("image/jpeg,width=1280,height=720,framerate=30/1"));
    }

    #[test]
    fn hash32_is_stable() {
        assert_eq!(hash32("srt://127.0.0.1:8888"), hash32("srt://127.0.0.1:8888"));
    }

    #[test]
    fn hash32_differs_for_different_uris() {
        assert_ne!(hash32("srt://127.0.0.1:8888"), hash32("srt://127.0.0.1:8889"));
    }

    #[test]
    fn source_branch_description_omits_overlay_by_default() {
        let desc = source_branch_description("videotestsrc", 1, Resolution::HD, 30, false);
        assert!(!desc.contains("timeoverlay"));
        assert!(desc.contains("tee name=pipeline_1_tee"));
    }

    #[test]
    fn source_branch_description_inserts_overlay_before_tee_when_requested() {
        let desc = source_branch_description("videotestsrc", 1, Resolution::HD, 30, true);
        let overlay_pos = desc.find("timeoverlay").expect("overlay element present");
        let tee_pos = desc.find("tee name=pipeline_1_tee").expect("tee present");
        assert!(overlay_pos < tee_pos);
    }
}
