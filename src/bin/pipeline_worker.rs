//! Long-lived subprocess holding one camera's capture/tee source branch.
//! Spawned by `producerd`, one per camera node; talks to its parent over
//! its own stdin (control messages) and stdout (event messages).

use std::io::{stdin, stdout};

use clap::Parser;
use tracing::{error, info};

use streamgraphd::ipc::recv_exact;
use streamgraphd::pipeline::Pipeline;
use streamgraphd::types::{Resolution, SourceKind};
use streamgraphd::worker::{PipelineCtrlMsg, PipelineCtrlType, PipelineEventMsg, PipelineEventType};

#[derive(Parser, Debug)]
#[command(name = "pipeline-worker")]
struct Args {
    #[arg(long)]
    node_id: u32,

    #[arg(long)]
    device: String,

    #[arg(long, value_enum)]
    source_kind: SourceKindArg,

    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    show_overlay: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum SourceKindArg {
    V4l2Like,
    TestPattern,
    ArgusLike,
}

impl From<SourceKindArg> for SourceKind {
    fn from(v: SourceKindArg) -> SourceKind {
        match v {
            SourceKindArg::V4l2Like => SourceKind::V4l2Like,
            SourceKindArg::TestPattern => SourceKind::TestPattern,
            SourceKindArg::ArgusLike => SourceKind::ArgusLike,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let pipeline = Pipeline::open(args.node_id, args.source_kind.into(), args.device.clone(), args.show_overlay)?;

    let mut stdin = stdin();
    let mut stdout = stdout();

    // The first control message from producerd is always the initial
    // resolution/framerate; everything after that is handled on a
    // background thread while the main thread pumps the glib main loop
    // that bus watches depend on.
    let first: PipelineCtrlMsg = recv_exact(&mut stdin)?;
    if first.msg_type != PipelineCtrlType::SetResolution as u32 {
        anyhow::bail!("pipeline-worker expected SetResolution as its first message");
    }
    let resolution = Resolution { width: first.width, height: first.height };

    let ready_event = match pipeline.start(resolution, first.fps) {
        Ok(()) => PipelineEventMsg { event_type: PipelineEventType::Ready as u32, code: 0 },
        Err(e) => {
            error!(error = %e, "pipeline-worker failed to start source branch");
            PipelineEventMsg { event_type: PipelineEventType::Error as u32, code: 1 }
        }
    };
    streamgraphd::ipc::send_exact(&mut stdout, &ready_event)?;
    if ready_event.event_type == PipelineEventType::Error as u32 {
        std::process::exit(1);
    }

    let main_loop = glib::MainLoop::new(None, false);

    let loop_clone = main_loop.clone();
    let control_pipeline = pipeline.clone();
    std::thread::spawn(move || loop {
        let ctrl: PipelineCtrlMsg = match recv_exact(&mut stdin) {
            Ok(c) => c,
            Err(_) => {
                // parent closed the pipe (died or finished); shut down
                control_pipeline.stop();
                loop_clone.quit();
                return;
            }
        };
        match ctrl.msg_type {
            t if t == PipelineCtrlType::Terminate as u32 => {
                control_pipeline.stop();
                loop_clone.quit();
                return;
            }
            t if t == PipelineCtrlType::SetResolution as u32 => {
                let resolution = streamgraphd::types::Resolution { width: ctrl.width, height: ctrl.height };
                if let Err(e) = control_pipeline.set_resolution(resolution) {
                    error!(error = %e, "failed to apply live resolution change");
                }
            }
            t if t == PipelineCtrlType::SetFps as u32 => {
                if let Err(e) = control_pipeline.set_framerate(ctrl.fps) {
                    error!(error = %e, "failed to apply live framerate change");
                }
            }
            _ => {
                info!("ignoring unsupported pipeline control message");
            }
        }
    });

    main_loop.run();
    Ok(())
}
