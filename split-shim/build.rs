//! Generates the `containerd.task.v2.Task` service from a Rust-side method
//! table. Message types are hand-written prost structs in `src/proto.rs`, so
//! no protoc is needed.

use tonic_build::manual::{Builder, Method, Service};

const METHODS: &[(&str, &str, &str, &str)] = &[
    ("create", "Create", "CreateTaskRequest", "CreateTaskResponse"),
    ("start", "Start", "StartRequest", "StartResponse"),
    ("delete", "Delete", "DeleteRequest", "DeleteResponse"),
    ("exec", "Exec", "ExecProcessRequest", "Empty"),
    ("resize_pty", "ResizePty", "ResizePtyRequest", "Empty"),
    ("state", "State", "StateRequest", "StateResponse"),
    ("pause", "Pause", "PauseRequest", "Empty"),
    ("resume", "Resume", "ResumeRequest", "Empty"),
    ("kill", "Kill", "KillRequest", "Empty"),
    ("pids", "Pids", "PidsRequest", "PidsResponse"),
    ("close_io", "CloseIO", "CloseIoRequest", "Empty"),
    ("checkpoint", "Checkpoint", "CheckpointTaskRequest", "Empty"),
    // `connect` would clash with the generated client's constructor.
    ("connect_shim", "Connect", "ConnectRequest", "ConnectResponse"),
    ("shutdown", "Shutdown", "ShutdownRequest", "Empty"),
    ("stats", "Stats", "StatsRequest", "StatsResponse"),
    ("update", "Update", "UpdateTaskRequest", "Empty"),
    ("wait", "Wait", "WaitRequest", "WaitResponse"),
];

fn main() {
    let mut service = Service::builder()
        .name("Task")
        .package("containerd.task.v2");

    for (name, route, input, output) in METHODS {
        service = service.method(
            Method::builder()
                .name(name)
                .route_name(route)
                .input_type(format!("crate::proto::{input}"))
                .output_type(format!("crate::proto::{output}"))
                .codec_path("tonic::codec::ProstCodec")
                .build(),
        );
    }

    Builder::new().compile(&[service.build()]);
    println!("cargo:rerun-if-changed=build.rs");
}
