//! End-to-end coverage for the scenarios that only make sense across real
//! process boundaries: spawning the actual `producerd`/`consumerd`
//! binaries, talking to them over their Unix sockets, and observing their
//! responses. Scenarios that are really about a single process's internal
//! state (parameter plumbing, adaptor convergence, churn) are covered by
//! unit tests alongside the modules that implement them instead.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use streamgraphd::ipc::{
    recv_exact, send_exact, ProviderMsg, ProviderMsgType, ProviderRsp, ProviderRspType,
};

struct TestDaemon {
    child: Child,
    sock_path: PathBuf,
}

impl TestDaemon {
    fn spawn(bin: &str, config_path: &std::path::Path) -> TestDaemon {
        let exe = if bin == "consumerd" {
            env!("CARGO_BIN_EXE_consumerd")
        } else {
            env!("CARGO_BIN_EXE_producerd")
        };

        let worker_exe = if bin == "consumerd" {
            env!("CARGO_BIN_EXE_target-worker")
        } else {
            env!("CARGO_BIN_EXE_pipeline-worker")
        };

        let child = Command::new(exe)
            .arg("--config")
            .arg(config_path)
            .arg("--foreground")
            .arg("--worker-exe")
            .arg(worker_exe)
            .spawn()
            .expect("failed to spawn daemon under test");

        let sock_name = if bin == "consumerd" {
            "streamgraph-consumerd.sock"
        } else {
            "streamgraph-producerd.sock"
        };
        let sock_path = config_path.parent().unwrap().join(sock_name);

        // Give the daemon a moment to bind its socket before any test
        // tries to connect.
        for _ in 0..50 {
            if sock_path.exists() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        TestDaemon { child, sock_path }
    }

    fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.sock_path).expect("failed to connect to daemon socket")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_test_config(dir: &std::path::Path) -> PathBuf {
    let config_toml = format!(
        r#"
[runtime]
dir = "{dir}"

[log]
filter = "info"

[[camera]]
node-id = 1
source-kind = "test-pattern"
device = ""
resolution = {{ width = 640, height = 480 }}
framerate = 30
"#,
        dir = dir.display()
    );
    let path = dir.join("streamgraph.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(config_toml.as_bytes()).unwrap();
    path
}

/// CreatePipeline/DestroyPipeline round trip over the wire protocol for a
/// configured node. The real S1 (SRT target streaming to a live receiver,
/// then `stream-stopped`) is covered in `seed_scenarios.rs`, which exercises
/// `Pipeline`/`Target` directly rather than through a daemon socket.
#[test]
fn create_pipeline_then_destroy_pipeline_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(dir.path());
    let daemon = TestDaemon::spawn("producerd", &config_path);

    let mut stream = daemon.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::CreatePipeline as u32, node_id: 1 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::CreateSuccess as u32);

    let mut stream = daemon.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::DestroyPipeline as u32, node_id: 1 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::DestroySuccess as u32);
}

/// Requesting a pipeline for a node with no camera configuration fails
/// cleanly instead of wedging the connection. The real S3 (`TransmitAddrInUse`
/// from two listener targets on the same port) is covered in
/// `seed_scenarios.rs`.
#[test]
fn create_pipeline_for_unconfigured_node_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(dir.path());
    let daemon = TestDaemon::spawn("producerd", &config_path);

    let mut stream = daemon.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::CreatePipeline as u32, node_id: 99 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::Fail as u32);
}

/// The daemon keeps accepting new connections while a previous one is still
/// open — the per-connection thread model must not serialize clients behind
/// a single listener thread. The real S4 (listener pending-peer non-stall)
/// is covered in `seed_scenarios.rs`.
#[test]
fn accepts_concurrent_connections_without_stalling() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(dir.path());
    let daemon = TestDaemon::spawn("producerd", &config_path);

    let _pending = daemon.connect();
    let mut second = daemon.connect();

    let msg = ProviderMsg { msg_type: ProviderMsgType::CreatePipeline as u32, node_id: 1 };
    send_exact(&mut second, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut second).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::CreateSuccess as u32);
}

/// Destroying a pipeline that was never created is rejected rather than
/// silently succeeding, so a misbehaving client finds out.
#[test]
fn destroy_pipeline_for_unconfigured_node_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(dir.path());
    let daemon = TestDaemon::spawn("producerd", &config_path);

    let mut stream = daemon.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::DestroyPipeline as u32, node_id: 1 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::Fail as u32);
}

/// S6: producerd's `CreatePipeline` writes the pipeline's shm descriptor;
/// consumerd's `CreateSrtTarget` reads it (refusing to create a target for a
/// node producerd never built), then writes its own target descriptor under
/// `output_node_id`. `StartTarget`/`DestroyTarget`/`DestroyPipeline` clean up
/// both regions, leaving neither readable afterward.
#[test]
fn s6_cross_process_pipeline_and_target_lifecycle() {
    use streamgraphd::ipc::{ConsumerMsg, ConsumerMsgType, ConsumerRsp, ConsumerRspType};
    use streamgraphd::registry::Registry;

    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(dir.path());

    let producer = TestDaemon::spawn("producerd", &config_path);
    let consumer = TestDaemon::spawn("consumerd", &config_path);

    let registry = Registry::new("streamgraph");
    let input_node_id = 1u32;
    let output_node_id = 2u32;
    let hash_id = 777u32;

    let mut stream = producer.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::CreatePipeline as u32, node_id: input_node_id as i32 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::CreateSuccess as u32);
    assert!(registry.pipeline_read(input_node_id).is_ok(), "producerd should have written the pipeline's shm descriptor");

    let mut stream = consumer.connect();
    let msg = ConsumerMsg::new(
        ConsumerMsgType::CreateSrtTarget,
        1,
        input_node_id,
        output_node_id,
        2_048_000,
        hash_id,
        "srt://127.0.0.1:18950?mode=listener",
        "",
    )
    .unwrap();
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ConsumerRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ConsumerRspType::CreateTargetSuccess as u32);
    assert!(
        registry.target_read(hash_id, output_node_id).is_ok(),
        "consumerd should have written the target's shm descriptor keyed by output_node_id"
    );

    let mut stream = consumer.connect();
    let msg = ConsumerMsg::new(
        ConsumerMsgType::StartTarget,
        1,
        input_node_id,
        output_node_id,
        2_048_000,
        hash_id,
        "",
        "",
    )
    .unwrap();
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ConsumerRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ConsumerRspType::StartSuccess as u32);

    let mut stream = consumer.connect();
    let msg = ConsumerMsg::new(
        ConsumerMsgType::DestroyTarget,
        1,
        input_node_id,
        output_node_id,
        0,
        hash_id,
        "",
        "",
    )
    .unwrap();
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ConsumerRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ConsumerRspType::DestroyTargetSuccess as u32);
    assert!(registry.target_read(hash_id, output_node_id).is_err(), "target shm region should be cleaned up");

    let mut stream = producer.connect();
    let msg = ProviderMsg { msg_type: ProviderMsgType::DestroyPipeline as u32, node_id: input_node_id as i32 };
    send_exact(&mut stream, &msg).unwrap();
    let rsp: ProviderRsp = recv_exact(&mut stream).unwrap();
    assert_eq!(rsp.rsp_type, ProviderRspType::DestroySuccess as u32);
    assert!(registry.pipeline_read(input_node_id).is_err(), "pipeline shm region should be cleaned up");
}
