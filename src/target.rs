//! A Target: one outgoing encode+mux+transport branch attached to a
//! Pipeline's tee. Construction follows the ten steps in order; any failure
//! aborts construction and surfaces the captured error unchanged.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use gstreamer::prelude::*;
use gstreamer::{Bin, Element, GhostPad, Pad, PadProbeId, State};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::adaptor::{self, BaselineParameters, StreamAdaptor};
use crate::error::{Result, StreamError};
use crate::mapper::{self, ParamKind};
use crate::types::{
    AdaptorKind, BitrateControl, Codec, EncoderVariant, EncodingFamily, EncodingParameters, SrtMode, TargetKind,
};

/// Operator-supplied parameters for a new target, as accepted by
/// `Pipeline::add_target`.
#[derive(Debug, Clone)]
pub struct TargetParams {
    pub kind: TargetKind,
    pub codec: Codec,
    pub encoding_family: EncodingFamily,
    pub uri: String,
    pub username: Option<String>,
    pub passphrase: Option<String>,
    pub pbkeylen: u32,
    pub buffer_size: Option<u32>,
    pub idr_period: u32,
    pub bitrate: u32,
    pub bitrate_control: BitrateControl,
    pub quantizer: u32,
    pub adaptive_streaming: bool,
    /// How often the `StreamAdaptor` samples the transport sink's stats.
    /// Must be >= 1; `run_adaptor_tick` is driven on this period by whatever
    /// process owns the target's event loop (`target-worker`'s poll loop).
    pub stats_interval_ms: u32,
}

impl TargetParams {
    pub fn validate(&self) -> Result<()> {
        if self.bitrate == 0 {
            return Err(StreamError::InvalidArgument("bitrate must be >= 1".into()));
        }
        if self.stats_interval_ms == 0 {
            return Err(StreamError::InvalidArgument("stats_interval_ms must be >= 1".into()));
        }
        if self.kind == TargetKind::Srt && !self.uri.starts_with("srt://") {
            return Err(StreamError::InvalidArgument(format!(
                "srt target uri must start with srt://, got {}",
                self.uri
            )));
        }
        if let Some(p) = &self.passphrase {
            if !p.is_empty() && p.len() < 10 {
                return Err(StreamError::TransmitFailed(
                    "passphrase shorter than 10 characters".into(),
                ));
            }
            if ![0, 16, 24, 32].contains(&self.pbkeylen) {
                return Err(StreamError::InvalidArgument(
                    "pbkeylen must be one of 0, 16, 24, 32".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Rewrites an SRT URI with the worker-process streamid form, the canonical
/// one per the resolved ambiguity between the in-process and worker-process
/// code paths: `#!::u=<username>[,h8l_bufsize=<n>]`.
pub fn rewrite_uri(uri: &str, username: Option<&str>, buffer_size: Option<u32>) -> String {
    let mut uri = uri.to_string();
    if let Some(user) = username {
        let streamid = match buffer_size {
            Some(n) => format!("#!::u={user},h8l_bufsize={n}"),
            None => format!("#!::u={user}"),
        };
        let sep = if uri.contains('?') { '&' } else { '?' };
        uri = format!("{uri}{sep}streamid={streamid}");
    } else if let Some(n) = buffer_size {
        let sep = if uri.contains('?') { '&' } else { '?' };
        uri = format!("{uri}{sep}sndbuf={n}");
    }
    uri
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Created,
    Linking,
    Streaming,
    Unlinking,
    Stopped,
}

pub struct Target {
    pub id: u32,
    pub params: TargetParams,
    pub variant: EncoderVariant,
    state: Mutex<TargetState>,
    bin: Bin,
    encoder: Element,
    sink: Element,
    ghost_sink: GhostPad,
    adaptor: Mutex<Box<dyn StreamAdaptor>>,
    srt_mode: Mutex<Option<SrtMode>>,
    bitrate_actual: AtomicU32,
    quantizer_actual: AtomicU32,
    rate_control_actual: AtomicU32,
    caller_count: AtomicU32,
    bytes_sent_hint: AtomicU64,
    /// The tee src pad probe installed by `link_target`, while it is still
    /// waiting to fire. `unlink_target` must cancel this via `remove_probe`
    /// when a removal races a link still in flight, instead of letting the
    /// probe fire against a target that is already torn down.
    pending_link_probe: Mutex<Option<(Pad, PadProbeId)>>,
}

fn codec_pipeline_template(codec: Codec, family: EncodingFamily, node_id: u32) -> String {
    let variant = EncoderVariant::resolve(codec, family);
    format!(
        "videoconvert name=target_{node_id}_convert ! {enc} name=target_{node_id}_enc ! mpegtsmux name=target_{node_id}_mux",
        enc = variant.element_factory_name(),
    )
}

fn sink_element_for(kind: TargetKind, uri: &str) -> Result<(&'static str, Vec<(&'static str, String)>)> {
    match kind {
        TargetKind::Srt => Ok(("srtsink", vec![("uri".into(), uri.to_string())])),
        TargetKind::Recording => Ok(("filesink", vec![("location".into(), uri.to_string())])),
        TargetKind::ImageCapture => Ok(("multifilesink", vec![("location".into(), uri.to_string())])),
    }
}

impl Target {
    /// Builds the sub-bin for this target. `node_id` is used only to make
    /// element names unique across concurrently-constructed targets sharing
    /// a process. Does not attach anywhere; `Pipeline::add_target` owns the
    /// link probe that does that.
    pub fn new(node_id: u32, id: u32, params: TargetParams) -> Result<Target> {
        params.validate()?;

        // (1) choose encoder-pipeline string by codec + family
        let variant = EncoderVariant::resolve(params.codec, params.encoding_family);
        let template = codec_pipeline_template(params.codec, params.encoding_family, node_id);

        // (2)+(3) rewrite uri for username/buffer_size, apply passphrase
        let uri = rewrite_uri(&params.uri, params.username.as_deref(), params.buffer_size);

        let (sink_factory, sink_props) = sink_element_for(params.kind, &uri)?;

        // (4) parse the full string into an encoder+muxer+sink sub-graph
        let bin_desc = format!("{template} ! {sink_factory} name=target_{node_id}_sink");
        let bin = gstreamer::parse::bin_from_description(&bin_desc, false)
            .map_err(|e| StreamError::ResourceUnsupported(format!("{e}")))?;

        let encoder = bin
            .by_name(&format!("target_{node_id}_enc"))
            .ok_or_else(|| StreamError::ResourceUnsupported("encoder element missing from parsed bin".into()))?;
        let sink = bin
            .by_name(&format!("target_{node_id}_sink"))
            .ok_or_else(|| StreamError::ResourceUnsupported("sink element missing from parsed bin".into()))?;

        for (name, value) in &sink_props {
            sink.set_property_from_str(name, value);
        }
        if params.kind == TargetKind::Srt {
            if let Some(pass) = &params.passphrase {
                if !pass.is_empty() {
                    sink.set_property_from_str("passphrase", pass);
                    sink.set_property("pbkeylen", params.pbkeylen as i32);
                }
            }
        }

        // (5) bus sync-handler translating ResourceError/OpenWrite into the
        // target's error channel. `sync_handler`, unlike `add_watch`, runs
        // synchronously on the thread that posts the message (the sink's own
        // state-change call, here), so the classified error is available the
        // moment `set_state` below returns rather than arriving later on a
        // main-loop iteration nobody is pumping yet during construction.
        let captured_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        if let Some(bus) = bin.bus() {
            let captured = Arc::clone(&captured_error);
            bus.set_sync_handler(move |_bus, msg| {
                if let gstreamer::MessageView::Error(err) = msg.view() {
                    if err.error().matches(gstreamer::ResourceError::OpenWrite)
                        || err.error().matches(gstreamer::ResourceError::OpenReadWrite)
                        || err.error().matches(gstreamer::ResourceError::Busy)
                    {
                        *captured.lock() = Some(err.error().to_string());
                        return gstreamer::BusSyncReply::Drop;
                    }
                }
                gstreamer::BusSyncReply::Pass
            });
        }

        // (6) bring the transport sink to Ready; an `OpenWrite`-class bus
        // error captured above is classified via `from_bus_resource_error`
        // (AddressInUse vs. a generic transmit failure); anything else
        // surfaces as a generic TransmitFailed.
        if let Err(_state_err) = sink.set_state(State::Ready) {
            let message = captured_error.lock().take();
            return Err(match message {
                Some(m) => StreamError::from_bus_resource_error(&m),
                None => StreamError::TransmitFailed("sink failed to reach Ready".into()),
            });
        }
        if let Some(bus) = bin.bus() {
            bus.unset_sync_handler();
        }

        // (7) construct a StreamAdaptor of the pipeline's declared kind
        let baseline = BaselineParameters {
            bitrate: params.bitrate,
            quantizer: params.quantizer,
            rate_control: params.bitrate_control,
        };
        let adaptor_kind = if params.adaptive_streaming {
            AdaptorKind::Bandwidth
        } else {
            AdaptorKind::Null
        };
        let adaptor = adaptor::new_adaptor(adaptor_kind, baseline);

        mapper::apply(
            &encoder,
            variant,
            &EncodingParameters {
                bitrate: Some(params.bitrate),
                quantizer: Some(params.quantizer),
                rate_control: Some(params.bitrate_control),
            },
        );
        mapper::apply_idr_period(&encoder, variant, params.idr_period);

        // (8) wire notification hooks: a change to the encoder's tracked
        // properties posts an application message on the bin's bus so the
        // owning Pipeline's bus watch can lift it to a public signal.
        install_encoder_notify_hooks(&encoder, &bin, variant);
        if params.kind == TargetKind::Srt {
            install_caller_signal_hooks(&sink, &bin);
        }

        // (9) expose ghost_sink on the sub-bin targeting the encoder's
        // first input pad
        let enc_sink_pad = encoder
            .static_pad("sink")
            .ok_or_else(|| StreamError::ResourceUnsupported("encoder has no sink pad".into()))?;
        let ghost_sink = GhostPad::with_target(&enc_sink_pad)
            .map_err(StreamError::Glib)?;
        bin.add_pad(&ghost_sink).map_err(StreamError::Glib)?;

        // (10) observed srt_mode is read back after Ready and reported by
        // the caller once the bus confirms it; default placeholder here.
        let srt_mode = if params.kind == TargetKind::Srt {
            read_srt_mode(&sink)
        } else {
            None
        };

        // The bitrate just written above is quantized to kbps on every
        // variant but the OMX pair (`mapper::bitrate_quantizes_to_kbps`);
        // `bitrate_actual` must reflect that rounding from construction
        // onward, not just after the first later `apply_parameters` call,
        // per the Target invariant that `bitrate_actual` always reflects
        // the encoder's current setting.
        let initial_bitrate_actual = quantize_bitrate(variant, params.bitrate);

        Ok(Target {
            id,
            bitrate_actual: AtomicU32::new(initial_bitrate_actual),
            quantizer_actual: AtomicU32::new(params.quantizer),
            rate_control_actual: AtomicU32::new(params.bitrate_control.to_wire()),
            params,
            variant,
            state: Mutex::new(TargetState::Created),
            bin,
            encoder,
            sink,
            ghost_sink,
            adaptor: Mutex::new(adaptor),
            srt_mode: Mutex::new(srt_mode),
            caller_count: AtomicU32::new(0),
            bytes_sent_hint: AtomicU64::new(0),
            pending_link_probe: Mutex::new(None),
        })
    }

    pub fn bin(&self) -> &Bin {
        &self.bin
    }

    /// The sub-bin's own bus. Carries the application messages posted by
    /// the encoder-notify and caller-added/removed signal hooks; the
    /// owning worker process drains it to forward those as wire events.
    pub fn bus(&self) -> Option<gstreamer::Bus> {
        self.bin.bus()
    }

    pub fn ghost_sink(&self) -> &GhostPad {
        &self.ghost_sink
    }

    /// Records the tee src pad probe `link_target` just installed, so a
    /// concurrent `unlink_target` can cancel it if it hasn't fired yet.
    pub fn set_pending_link_probe(&self, pad: Pad, id: PadProbeId) {
        *self.pending_link_probe.lock() = Some((pad, id));
    }

    /// Takes the pending link probe, if one is still recorded. Called both
    /// by the probe callback itself (the probe has already fired, so the
    /// stored id is stale) and by `unlink_target` (to cancel a probe that
    /// hasn't fired yet).
    pub fn take_pending_link_probe(&self) -> Option<(Pad, PadProbeId)> {
        self.pending_link_probe.lock().take()
    }

    pub fn state(&self) -> TargetState {
        *self.state.lock()
    }

    pub fn set_state(&self, s: TargetState) {
        *self.state.lock() = s;
    }

    pub fn srt_mode(&self) -> Option<SrtMode> {
        *self.srt_mode.lock()
    }

    pub fn bitrate_actual(&self) -> u32 {
        self.bitrate_actual.load(Ordering::Relaxed)
    }

    pub fn quantizer_actual(&self) -> u32 {
        self.quantizer_actual.load(Ordering::Relaxed)
    }

    pub fn bitrate_control_actual(&self) -> u32 {
        self.rate_control_actual.load(Ordering::Relaxed)
    }

    /// Swaps the running `StreamAdaptor` for a freshly constructed one of
    /// `kind`, seeded from this target's baseline parameters. Used by
    /// `SetAdaptorKind` and `SetAdaptiveStreaming` control messages.
    pub fn set_adaptor_kind(&self, kind: AdaptorKind) {
        let baseline = BaselineParameters {
            bitrate: self.params.bitrate,
            quantizer: self.params.quantizer,
            rate_control: self.params.bitrate_control,
        };
        *self.adaptor.lock() = adaptor::new_adaptor(kind, baseline);
        info!(id = self.id, ?kind, "adaptor kind changed");
    }

    pub fn set_adaptive_streaming(&self, enabled: bool) {
        self.set_adaptor_kind(if enabled { AdaptorKind::Bandwidth } else { AdaptorKind::Null });
    }

    pub fn caller_count(&self) -> u32 {
        self.caller_count.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        let structure_val = self.sink.property::<Option<gstreamer::Structure>>("stats");
        match structure_val {
            Some(s) => s.get::<u64>("bytes-sent").unwrap_or(0),
            None => self.bytes_sent_hint.load(Ordering::Relaxed),
        }
    }

    pub fn on_caller_added(&self) {
        self.caller_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_caller_removed(&self) {
        self.caller_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Applies a set of parameter changes through the mapper, cycling the
    /// encoder through Ready first for any change that requires it.
    pub fn apply_parameters(&self, params: EncodingParameters) -> Result<()> {
        let needs_cycle = [
            (params.bitrate.is_some(), ParamKind::Bitrate),
            (params.quantizer.is_some(), ParamKind::Quantizer),
            (params.rate_control.is_some(), ParamKind::RateControl),
        ]
        .into_iter()
        .any(|(present, kind)| present && mapper::requires_ready_cycle(self.variant, kind));

        if needs_cycle {
            let (_, prior) = self.encoder.state(gstreamer::ClockTime::NONE);
            self.encoder
                .set_state(State::Ready)
                .map_err(|_| StreamError::TransmitFailed("encoder failed to reach Ready for reconfigure".into()))?;
            mapper::apply(&self.encoder, self.variant, &params);
            self.encoder
                .set_state(prior)
                .map_err(|_| StreamError::TransmitFailed("encoder failed to restore state after reconfigure".into()))?;
        } else {
            mapper::apply(&self.encoder, self.variant, &params);
        }

        if let Some(b) = params.bitrate {
            self.bitrate_actual.store(quantize_bitrate(self.variant, b), Ordering::Relaxed);
        }
        if let Some(q) = params.quantizer {
            self.quantizer_actual.store(q, Ordering::Relaxed);
        }
        if let Some(rc) = params.rate_control {
            self.rate_control_actual.store(rc.to_wire(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Runs one adaptor tick against the sink's current stats; applies the
    /// resulting change, or drives from baseline when adaptation is off.
    /// Returns the parameters actually applied, or `None` when nothing
    /// changed, so the caller can decide whether to surface an event.
    pub fn run_adaptor_tick(&self) -> Result<Option<EncodingParameters>> {
        let stats = self
            .sink
            .property::<Option<gstreamer::Structure>>("stats")
            .unwrap_or_else(|| gstreamer::Structure::builder("stats").build());

        let mut adaptor = self.adaptor.lock();
        if !adaptor.enabled() {
            let baseline = EncodingParameters {
                bitrate: Some(self.params.bitrate),
                quantizer: Some(self.params.quantizer),
                rate_control: Some(self.params.bitrate_control),
            };
            let drifted = self.bitrate_actual() != self.params.bitrate
                || self.quantizer_actual() != self.params.quantizer
                || self.bitrate_control_actual() != self.params.bitrate_control.to_wire();
            if !drifted {
                return Ok(None);
            }
            self.apply_parameters(baseline)?;
            return Ok(Some(baseline));
        }

        let change = adaptor.on_stats(&stats);
        if change == EncodingParameters::default() {
            return Ok(None);
        }
        drop(adaptor);
        self.apply_parameters(change)?;
        Ok(Some(change))
    }
}

/// Rounds `bitrate` down to the nearest kbps on variants whose encoder
/// property is itself kbps-denominated (everything but the OMX pair), so
/// `bitrate_actual` always reflects what the encoder was actually set to.
fn quantize_bitrate(variant: EncoderVariant, bitrate: u32) -> u32 {
    if mapper::bitrate_quantizes_to_kbps(variant) {
        bitrate - (bitrate % 1000)
    } else {
        bitrate
    }
}

fn read_srt_mode(sink: &Element) -> Option<SrtMode> {
    let mode: Option<String> = sink.try_property("mode").ok();
    match mode.as_deref() {
        Some("caller") => Some(SrtMode::Caller),
        Some("listener") => Some(SrtMode::Listener),
        Some("rendezvous") => Some(SrtMode::Rendezvous),
        _ => None,
    }
}

fn install_encoder_notify_hooks(encoder: &Element, bin: &Bin, variant: EncoderVariant) {
    let tracked: &[&str] = match variant {
        EncoderVariant::X264 => &["bitrate", "quantizer", "pass"],
        EncoderVariant::X265 => &["bitrate", "qp", "option-string"],
        EncoderVariant::Vaapi264 | EncoderVariant::Vaapi265 => &["bitrate", "init-qp", "rate-control"],
        EncoderVariant::Omx264 | EncoderVariant::Omx265 => &["bitrate", "control-rate"],
    };

    for prop in tracked {
        let bin_weak = bin.downgrade();
        let prop_name = prop.to_string();
        encoder.connect_notify(Some(prop), move |_element, _pspec| {
            if let Some(bin) = bin_weak.upgrade() {
                let structure = gstreamer::Structure::builder("streamgraph/notify-encoder")
                    .field("property", prop_name.clone())
                    .build();
                let msg = gstreamer::message::Application::builder(structure).src(&bin).build();
                if let Some(bus) = bin.bus() {
                    let _ = bus.post(msg);
                }
            }
        });
    }
    info!(variant = ?variant, "installed encoder notify hooks");
}

/// Connects `srtsink`'s `caller-added`/`caller-removed` signals and posts
/// each as an application message on the bin's bus, carrying the peer
/// socket fd. The owning worker process drains the bus and forwards these
/// verbatim to its parent daemon so it can account active readers.
fn install_caller_signal_hooks(sink: &Element, bin: &Bin) {
    for (signal, structure_name) in [
        ("caller-added", "streamgraph/caller-added"),
        ("caller-removed", "streamgraph/caller-removed"),
    ] {
        let bin_weak = bin.downgrade();
        sink.connect(signal, false, move |values| {
            let sock = values[1].get::<i32>().unwrap_or(-1);
            if let Some(bin) = bin_weak.upgrade() {
                let structure = gstreamer::Structure::builder(structure_name)
                    .field("sock", sock)
                    .build();
                let msg = gstreamer::message::Application::builder(structure).src(&bin).build();
                if let Some(bus) = bin.bus() {
                    let _ = bus.post(msg);
                }
            }
            None
        });
    }
    info!("installed SRT caller-added/removed signal hooks");
}

impl Drop for Target {
    fn drop(&mut self) {
        if self.state() != TargetState::Stopped {
            warn!(id = self.id, "Target dropped without a prior stop()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_uri_with_username() {
        let uri = rewrite_uri("srt://127.0.0.1:1234", Some("alice"), None);
        assert_eq!(uri, "srt://127.0.0.1:1234?streamid=#!::u=alice");
    }

    #[test]
    fn rewrite_uri_with_username_and_buffer() {
        let uri = rewrite_uri("srt://127.0.0.1:1234", Some("alice"), Some(8192));
        assert_eq!(uri, "srt://127.0.0.1:1234?streamid=#!::u=alice,h8l_bufsize=8192");
    }

    #[test]
    fn rewrite_uri_with_buffer_only() {
        let uri = rewrite_uri("srt://127.0.0.1:1234", None, Some(8192));
        assert_eq!(uri, "srt://127.0.0.1:1234?sndbuf=8192");
    }

    #[test]
    fn rewrite_uri_noop() {
        let uri = rewrite_uri("srt://127.0.0.1:1234", None, None);
        assert_eq!(uri, "srt://127.0.0.1:1234");
    }

    #[test]
    fn validate_rejects_short_passphrase() {
        let params = TargetParams {
            kind: TargetKind::Srt,
            codec: Codec::H264,
            encoding_family: EncodingFamily::General,
            uri: "srt://127.0.0.1:1234".into(),
            username: None,
            passphrase: Some("short".into()),
            pbkeylen: 16,
            buffer_size: None,
            idr_period: 30,
            bitrate: 2_000_000,
            bitrate_control: BitrateControl::Cbr,
            quantizer: 23,
            adaptive_streaming: false,
            stats_interval_ms: 1000,
        };
        assert!(matches!(params.validate(), Err(StreamError::TransmitFailed(_))));
    }

    #[test]
    fn validate_rejects_non_srt_scheme_for_srt_kind() {
        let params = TargetParams {
            kind: TargetKind::Srt,
            codec: Codec::H264,
            encoding_family: EncodingFamily::General,
            uri: "file:///tmp/out.ts".into(),
            username: None,
            passphrase: None,
            pbkeylen: 0,
            buffer_size: None,
            idr_period: 30,
            bitrate: 2_000_000,
            bitrate_control: BitrateControl::Cbr,
            quantizer: 23,
            adaptive_streaming: false,
            stats_interval_ms: 1000,
        };
        assert!(matches!(params.validate(), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn validate_rejects_zero_bitrate() {
        let params = TargetParams {
            kind: TargetKind::Recording,
            codec: Codec::H264,
            encoding_family: EncodingFamily::General,
            uri: "/tmp/out.ts".into(),
            username: None,
            passphrase: None,
            pbkeylen: 0,
            buffer_size: None,
            idr_period: 30,
            bitrate: 0,
            bitrate_control: BitrateControl::Cbr,
            quantizer: 23,
            adaptive_streaming: false,
            stats_interval_ms: 1000,
        };
        assert!(matches!(params.validate(), Err(StreamError::InvalidArgument(_))));
    }

    #[test]
    fn bitrate_actual_rounds_to_kbps_on_quantizing_variants() {
        assert_eq!(quantize_bitrate(EncoderVariant::X264, 1_500_000), 1_500_000);
        assert_eq!(quantize_bitrate(EncoderVariant::X264, 3_000_000), 3_000_000);
        assert_eq!(quantize_bitrate(EncoderVariant::X264, 9_999_999), 9_999_000);
    }

    #[test]
    fn bitrate_actual_is_exact_on_omx_variants() {
        assert_eq!(quantize_bitrate(EncoderVariant::Omx264, 9_999_999), 9_999_999);
    }
}
