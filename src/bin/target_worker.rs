//! Long-lived subprocess running one outgoing target (SRT stream,
//! recording, or still-image capture). Spawned by `consumerd`; builds its
//! own private capture source rather than sharing a tee across the
//! process boundary with the camera's `pipeline-worker` (see
//! `DESIGN.md` for why).

use std::io::{stdin, stdout, Stdout};

use clap::Parser;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use streamgraphd::error::StreamError;
use streamgraphd::ipc::{recv_exact, send_exact};
use streamgraphd::media::MediaFramework;
use streamgraphd::pipeline::source_description_for;
use streamgraphd::target::{Target, TargetParams};
use streamgraphd::types::{AdaptorKind, BitrateControl, Codec, EncodingFamily, SourceKind, TargetKind};
use streamgraphd::worker::{TargetCtrlMsg, TargetCtrlType, TargetEventMsg, TargetEventType};

/// Serializes writes to the event pipe across the control loop, the
/// adaptor-tick thread, and the bus-drain thread below.
fn send_event(stdout: &Mutex<Stdout>, msg: &TargetEventMsg) -> streamgraphd::error::Result<()> {
    send_exact(&mut *stdout.lock(), msg)
}

#[derive(Parser, Debug)]
#[command(name = "target-worker")]
struct Args {
    #[arg(long, value_enum)]
    kind: TargetKindArg,

    #[arg(long, value_enum)]
    codec: CodecArg,

    #[arg(long)]
    uri: String,

    #[arg(long, default_value = "")]
    username: String,

    #[arg(long)]
    bitrate: u32,

    #[arg(long)]
    node_id: u32,

    #[arg(long)]
    device: String,

    #[arg(long, value_enum)]
    source_kind: SourceKindArg,

    #[arg(long, default_value_t = 1000)]
    stats_interval_ms: u32,

    #[arg(long, default_value_t = false)]
    adaptive_streaming: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum TargetKindArg {
    Srt,
    Recording,
    ImageCapture,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CodecArg {
    H264,
    H265,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum SourceKindArg {
    V4l2Like,
    TestPattern,
    ArgusLike,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    MediaFramework::acquire()?;

    let kind = match args.kind {
        TargetKindArg::Srt => TargetKind::Srt,
        TargetKindArg::Recording => TargetKind::Recording,
        TargetKindArg::ImageCapture => TargetKind::ImageCapture,
    };
    let codec = match args.codec {
        CodecArg::H264 => Codec::H264,
        CodecArg::H265 => Codec::H265,
    };
    let source_kind = match args.source_kind {
        SourceKindArg::V4l2Like => SourceKind::V4l2Like,
        SourceKindArg::TestPattern => SourceKind::TestPattern,
        SourceKindArg::ArgusLike => SourceKind::ArgusLike,
    };

    let params = TargetParams {
        kind,
        codec,
        encoding_family: EncodingFamily::General,
        uri: args.uri.clone(),
        username: if args.username.is_empty() { None } else { Some(args.username.clone()) },
        passphrase: None,
        pbkeylen: 0,
        buffer_size: None,
        idr_period: 30,
        bitrate: args.bitrate,
        bitrate_control: BitrateControl::Cbr,
        quantizer: 23,
        adaptive_streaming: args.adaptive_streaming,
        stats_interval_ms: args.stats_interval_ms,
    };

    let target = std::sync::Arc::new(Target::new(args.node_id, 0, params)?);

    let gst_pipeline = gstreamer::Pipeline::builder()
        .name(format!("target-worker-{}", args.node_id))
        .build();

    let source_desc = format!(
        "{src} ! videoconvert",
        src = source_description_for(source_kind, &args.device)
    );
    let source_bin = gstreamer::parse::bin_from_description(&source_desc, false)
        .map_err(|e| StreamError::ResourceUnsupported(format!("{e}")))?;

    gst_pipeline.add(&source_bin).map_err(StreamError::Glib)?;
    gst_pipeline.add(target.bin()).map_err(StreamError::Glib)?;

    let src_pad = source_bin
        .static_pad("src")
        .ok_or_else(|| StreamError::ResourceUnsupported("source bin has no src pad".into()))?;
    src_pad
        .link(target.ghost_sink())
        .map_err(|e| StreamError::ResourceUnsupported(format!("failed to link source into target: {e:?}")))?;

    let stdout = std::sync::Arc::new(Mutex::new(stdout()));

    match gst_pipeline.set_state(gstreamer::State::Playing) {
        Ok(_) => {}
        Err(_) => {
            error!("target-worker failed to reach Playing");
            std::process::exit(1);
        }
    }

    if kind == TargetKind::Srt {
        if let Some(mode) = target.srt_mode() {
            send_event(&stdout, &TargetEventMsg { event_type: TargetEventType::SrtMode as u32, value: mode as u32 })?;
        }
    }

    // §4.3: the adaptor samples the transport sink's stats on a periodic
    // timer of stats_interval_ms, independent of the control pipe. Runs on
    // its own thread so a quiet control pipe never stalls adaptation.
    // Parameter changes it drives are surfaced the same way explicit
    // SetBitrate/SetQuantizer/SetBitrateControl requests are below, since
    // from the parent's point of view both are just encoder state moving.
    {
        let adaptor_target = std::sync::Arc::clone(&target);
        let adaptor_stdout = std::sync::Arc::clone(&stdout);
        let interval = std::time::Duration::from_millis(args.stats_interval_ms as u64);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            match adaptor_target.run_adaptor_tick() {
                Ok(Some(applied)) => {
                    if applied.bitrate.is_some() {
                        let _ = send_event(
                            &adaptor_stdout,
                            &TargetEventMsg {
                                event_type: TargetEventType::NotifyEncoderBitrateChange as u32,
                                value: adaptor_target.bitrate_actual(),
                            },
                        );
                    }
                    if applied.quantizer.is_some() {
                        let _ = send_event(
                            &adaptor_stdout,
                            &TargetEventMsg {
                                event_type: TargetEventType::NotifyEncoderQuantizerChange as u32,
                                value: adaptor_target.quantizer_actual(),
                            },
                        );
                    }
                    if applied.rate_control.is_some() {
                        let _ = send_event(
                            &adaptor_stdout,
                            &TargetEventMsg {
                                event_type: TargetEventType::NotifyEncoderBitrateControlChange as u32,
                                value: adaptor_target.bitrate_control_actual(),
                            },
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "adaptor tick failed"),
            }
        });
    }

    // Drains the target bin's own bus for the caller-added/removed
    // application messages posted by the signal hooks installed in
    // `Target::new`, forwarding each verbatim to the parent daemon.
    if let Some(bus) = target.bus() {
        let caller_target = std::sync::Arc::clone(&target);
        let caller_stdout = std::sync::Arc::clone(&stdout);
        std::thread::spawn(move || loop {
            let Some(msg) = bus.timed_pop(gstreamer::ClockTime::from_mseconds(500)) else {
                continue;
            };
            match msg.view() {
                gstreamer::MessageView::Application(app) => {
                    let Some(structure) = app.structure() else { continue };
                    let event_type = match structure.name() {
                        "streamgraph/caller-added" => {
                            caller_target.on_caller_added();
                            Some(TargetEventType::CallerAdded)
                        }
                        "streamgraph/caller-removed" => {
                            caller_target.on_caller_removed();
                            Some(TargetEventType::CallerRemoved)
                        }
                        _ => None,
                    };
                    if let Some(event_type) = event_type {
                        let sock: i32 = structure.get("sock").unwrap_or(-1);
                        let _ = send_event(
                            &caller_stdout,
                            &TargetEventMsg { event_type: event_type as u32, value: sock as u32 },
                        );
                    }
                }
                gstreamer::MessageView::Error(err) => {
                    warn!(error = %err.error(), "error on target bus after construction");
                }
                _ => {}
            }
        });
    }

    let mut stdin = stdin();
    loop {
        let ctrl: TargetCtrlMsg = match recv_exact(&mut stdin) {
            Ok(c) => c,
            Err(_) => break, // parent closed the pipe
        };

        match ctrl.msg_type {
            t if t == TargetCtrlType::Stop as u32 => {
                let _ = gst_pipeline.set_state(gstreamer::State::Null);
                target.set_state(streamgraphd::target::TargetState::Stopped);
                info!("target-worker stopping on request");
                break;
            }
            t if t == TargetCtrlType::SetBitrate as u32 => {
                let result = target.apply_parameters(streamgraphd::types::EncodingParameters {
                    bitrate: Some(ctrl.value),
                    quantizer: None,
                    rate_control: None,
                });
                if result.is_ok() {
                    send_event(
                        &stdout,
                        &TargetEventMsg {
                            event_type: TargetEventType::NotifyEncoderBitrateChange as u32,
                            value: target.bitrate_actual(),
                        },
                    )?;
                }
            }
            t if t == TargetCtrlType::SetQuantizer as u32 => {
                let _ = target.apply_parameters(streamgraphd::types::EncodingParameters {
                    bitrate: None,
                    quantizer: Some(ctrl.value),
                    rate_control: None,
                });
                send_event(
                    &stdout,
                    &TargetEventMsg {
                        event_type: TargetEventType::NotifyEncoderQuantizerChange as u32,
                        value: target.quantizer_actual(),
                    },
                )?;
            }
            t if t == TargetCtrlType::SetBitrateControl as u32 => {
                match BitrateControl::from_wire(ctrl.value) {
                    Some(rate_control) => {
                        let result = target.apply_parameters(streamgraphd::types::EncodingParameters {
                            bitrate: None,
                            quantizer: None,
                            rate_control: Some(rate_control),
                        });
                        if result.is_ok() {
                            send_event(
                                &stdout,
                                &TargetEventMsg {
                                    event_type: TargetEventType::NotifyEncoderBitrateControlChange as u32,
                                    value: target.bitrate_control_actual(),
                                },
                            )?;
                        }
                    }
                    None => info!(value = ctrl.value, "unknown bitrate control discriminant, ignoring"),
                }
            }
            t if t == TargetCtrlType::SetAdaptorKind as u32 => match AdaptorKind::from_wire(ctrl.value) {
                Some(kind) => target.set_adaptor_kind(kind),
                None => info!(value = ctrl.value, "unknown adaptor kind discriminant, ignoring"),
            },
            t if t == TargetCtrlType::SetAdaptiveStreaming as u32 => {
                target.set_adaptive_streaming(ctrl.value != 0);
            }
            _ => {
                info!("ignoring unsupported target control message");
            }
        }
    }

    Ok(())
}
