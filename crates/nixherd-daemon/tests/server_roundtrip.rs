//! Framed-protocol roundtrips against a live listener.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use nixherd_core::builder::{BuildArtifact, Builder, BuilderError, TargetInfo};
use nixherd_core::bus::{LogBus, LogEvent, LogStream};
use nixherd_core::ipc::{self, Request, Response};
use nixherd_core::materializer::Materializer;
use nixherd_core::registry::RepoRegistry;
use nixherd_core::supervisor::{RunnableSpec, Supervisor};
use nixherd_daemon::commands::CommandContext;
use nixherd_daemon::server;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

struct NoTargets;

#[async_trait]
impl Builder for NoTargets {
    async fn enumerate(
        &self,
        _repo_url: &str,
    ) -> Result<BTreeMap<String, TargetInfo>, BuilderError> {
        Ok(BTreeMap::new())
    }

    async fn build(&self, _repo_url: &str, _key: &str) -> Result<BuildArtifact, BuilderError> {
        Err(BuilderError::NoStorePath)
    }
}

async fn spawn_server() -> (std::net::SocketAddr, Arc<CommandContext>, watch::Sender<bool>) {
    let registry = Arc::new(RepoRegistry::in_memory().unwrap());
    let bus = Arc::new(LogBus::new());
    let supervisor = Supervisor::new(Arc::clone(&bus));
    let materializer = Materializer::new(Box::new(NoTargets) as Box<dyn Builder>, supervisor.clone());
    let ctx = Arc::new(CommandContext {
        registry,
        supervisor,
        materializer,
        bus,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(server::run(listener, Arc::clone(&ctx), shutdown_rx));
    (addr, ctx, shutdown_tx)
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_roundtrip_over_the_wire() {
    let (addr, _ctx, _shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    ipc::write_frame(
        &mut stream,
        &Request::Exec {
            argv: vec!["ctx".to_string()],
        },
    )
    .await
    .unwrap();

    let response: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    match response {
        Response::Exec {
            exit_code, stdout, ..
        } => {
            assert_eq!(exit_code, 0);
            assert!(stdout.contains("No repository set"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn exec_exit_codes_travel_back() {
    let (addr, _ctx, _shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    ipc::write_frame(
        &mut stream,
        &Request::Exec {
            argv: vec!["definitely-not-a-command".to_string()],
        },
    )
    .await
    .unwrap();

    let response: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    match response {
        Response::Exec {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 1);
            assert!(!stderr.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_requests_stream_chunks_until_exit() {
    let (addr, ctx, _shutdown) = spawn_server().await;

    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "ticker",
        "i=0\nwhile [ $i -lt 5 ]; do echo \"tick $i\"; i=$((i+1)); sleep 0.1; done",
    );
    let mut specs = BTreeMap::new();
    specs.insert("ticker".to_string(), RunnableSpec::built("ticker", script));
    ctx.supervisor.replace_all(specs);
    ctx.supervisor.start("ticker").unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    ipc::write_frame(
        &mut stream,
        &Request::Tail {
            key: "ticker".to_string(),
        },
    )
    .await
    .unwrap();

    let mut collected = String::new();
    let drain = async {
        loop {
            let response: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
            match response {
                Response::Chunk { text } => collected.push_str(&text),
                Response::End => break,
                other => panic!("unexpected response: {other:?}"),
            }
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), drain)
        .await
        .expect("tail stream never ended");
    assert!(collected.contains("tick"), "got: {collected:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn tail_of_an_unknown_package_reports_the_error() {
    let (addr, _ctx, _shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    ipc::write_frame(
        &mut stream,
        &Request::Tail {
            key: "ghost".to_string(),
        },
    )
    .await
    .unwrap();

    let response: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    match response {
        Response::Exec {
            exit_code, stderr, ..
        } => {
            assert_eq!(exit_code, 1);
            assert!(stderr.contains("not found"), "stderr: {stderr}");
        }
        other => panic!("unexpected response: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_frames_get_an_error_response() {
    let (addr, _ctx, _shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let garbage = b"this is not json";
    let mut frame = Vec::new();
    frame.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
    frame.extend_from_slice(garbage);
    tokio::io::AsyncWriteExt::write_all(&mut stream, &frame)
        .await
        .unwrap();

    let response: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    assert!(matches!(response, Response::Error { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn attached_sessions_receive_broadcasts() {
    let (addr, ctx, _shutdown) = spawn_server().await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    ipc::write_frame(
        &mut stream,
        &Request::Attach {
            focus: Some("web".to_string()),
        },
    )
    .await
    .unwrap();

    // Wait for the session to register before publishing.
    let registered = async {
        while ctx.bus.subscriber_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), registered)
        .await
        .expect("session never attached");

    ctx.bus
        .publish(&LogEvent::now("other", LogStream::Stdout, "filtered out"));
    ctx.bus
        .publish(&LogEvent::now("web", LogStream::System, "started"));
    ctx.bus
        .publish(&LogEvent::now("web", LogStream::Stdout, "hello"));

    let first: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    match first {
        Response::Event { event } => {
            assert_eq!(event.package_key, "web");
            assert_eq!(event.text, "started");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    let second: Response = ipc::read_frame(&mut stream).await.unwrap().unwrap();
    match second {
        Response::Event { event } => {
            assert_eq!(event.stream, LogStream::Stdout);
            assert_eq!(event.text, "hello");
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // Hanging up deregisters the session.
    drop(stream);
    let detached = async {
        while ctx.bus.subscriber_count() != 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(5), detached)
        .await
        .expect("session never detached");
}
