//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! End to end tests for the sshmux-service crate
//!
//! Every test runs a real server on a loopback TCP socket and drives it with
//! the in-process loopback transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use sshmux_service::{
    ChannelChain, CommandHandler, CommandHandlerFn, ConnContext, FaultKind, ProxyV1Decoder,
    RequestHandler, Result, ServeMux, ServerBuilder, ServerFault, SessionHandler, SshServer,
    SshdError, UNSUPPORTED_CHANNEL_MESSAGE,
};
use sshmux_transport::loopback::{ClientChannel, LoopbackClient, LoopbackEngine};
use sshmux_transport::wire::{CommandRequest, EnvRequest, ExitStatus, WireMessage};
use sshmux_transport::{Permissions, RejectionReason, Request, TransportConfig, TransportError};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn open_config(_ctx: &ConnContext) -> TransportConfig {
    TransportConfig::default().with_no_client_auth(true)
}

/// Start serving on an ephemeral port
async fn start(server: &SshServer) -> (SocketAddr, JoinHandle<Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let runner = server.clone();
    let handle = tokio::spawn(async move { runner.serve(listener).await });
    (addr, handle)
}

async fn connect(engine: &LoopbackEngine, addr: SocketAddr) -> LoopbackClient {
    let mut client = engine.client("git");
    client.connect(addr).await.unwrap();
    client
}

async fn exec(channel: &ClientChannel, command: &str) -> bool {
    let request = CommandRequest {
        command: command.to_string(),
    };
    channel.request("exec", request.encode()).await.unwrap().0
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Read the exit status the server reports for a channel
async fn exit_status(channel: &mut ClientChannel) -> u32 {
    let event = timeout(Duration::from_secs(5), channel.next_event())
        .await
        .expect("no exit-status")
        .expect("channel closed without exit-status");
    assert_eq!(event.name, "exit-status");
    assert!(!event.want_reply);
    ExitStatus::decode(&event.payload).unwrap().status
}

fn git_upload_pack(cc: &mut ChannelChain) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let args = cc.split_shell_cmd(cc.raw_command()).unwrap_or_default();
        if args.first().map(String::as_str) != Some("git-upload-pack") {
            return Ok(());
        }
        let line = format!("upload-pack {} for {}\n", args[1..].join(" "), cc.user());
        cc.stdout()?.write_all(line.as_bytes()).await?;
        cc.abort();
        cc.exit(0).await
    })
}

fn list_dir(cc: &mut ChannelChain) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let args = cc.split_shell_cmd(cc.raw_command()).unwrap_or_default();
        let line = format!("{:?} LANG={}\n", args, cc.get_env("LANG"));
        cc.stdout()?.write_all(line.as_bytes()).await?;
        cc.exit(0).await
    })
}

fn whoami(cc: &mut ChannelChain) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let tenant = cc.context().get_data::<String>("tenant").unwrap_or_default();
        let line = format!(
            "{} {} {} {}\n",
            cc.client_ip(),
            cc.perm_extension("conn-id"),
            cc.perm_extension("key-id"),
            tenant
        );
        cc.stdout()?.write_all(line.as_bytes()).await?;
        cc.exit(0).await
    })
}

/// Fails after explaining why on stderr
struct Denied;

#[async_trait]
impl CommandHandler for Denied {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        let msg = format!("{}: permission denied\n", cc.raw_command());
        cc.stderr()?.write_all(msg.as_bytes()).await?;
        cc.exit(128).await?;
        Err(SshdError::Other("permission denied".to_string()))
    }
}

/// Sleeps well past any test deadline
struct Slow;

#[async_trait]
impl CommandHandler for Slow {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cc.exit(0).await
    }
}

/// Appends its payload to the `NOTES` environment entry
struct Note;

#[async_trait]
impl RequestHandler for Note {
    async fn serve(&self, cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
        let notes = format!(
            "{}{}",
            cc.get_env("NOTES"),
            String::from_utf8_lossy(request.payload())
        );
        cc.accept_env("NOTES", notes);
        (true, Bytes::new())
    }
}

fn notes(cc: &mut ChannelChain) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        let line = format!("{}\n", cc.get_env("NOTES"));
        cc.stdout()?.write_all(line.as_bytes()).await?;
        cc.exit(0).await
    })
}

fn session_mux() -> ServeMux {
    let session = SessionHandler::new(|args: &[String]| {
        let steps: Vec<Arc<dyn CommandHandler>> = match args.first().map(String::as_str) {
            Some("deny") => vec![Arc::new(Denied)],
            Some("sleep") => vec![Arc::new(Slow)],
            Some("whoami") => vec![Arc::new(CommandHandlerFn::new(whoami))],
            Some("notes") => vec![Arc::new(CommandHandlerFn::new(notes))],
            _ => vec![
                Arc::new(CommandHandlerFn::new(git_upload_pack)),
                Arc::new(CommandHandlerFn::new(list_dir)),
            ],
        };
        steps
    })
    .with_accept_env("LANG")
    .with_request_handler("note@sshmux", Arc::new(Note));

    ServeMux::new().with_handler("session", session)
}

fn builder(engine: &Arc<LoopbackEngine>) -> ServerBuilder {
    SshServer::builder(engine.clone(), session_mux()).with_config_factory(open_config)
}

#[tokio::test]
async fn test_exec_pipeline_falls_through_to_second_step() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine).build();
    let (addr, _handle) = start(&server).await;
    let client = connect(&engine, addr).await;

    let mut channel = client.open_channel("session").await.unwrap();
    let env = EnvRequest {
        name: "LANG".to_string(),
        value: "en_US.UTF-8".to_string(),
    };
    assert!(channel.request("env", env.encode()).await.unwrap().0);
    assert!(exec(&channel, "ls -la /tmp").await);

    assert_eq!(
        channel.read_stdout().await.unwrap(),
        b"[\"ls\", \"-la\", \"/tmp\"] LANG=en_US.UTF-8\n"
    );
    assert_eq!(exit_status(&mut channel).await, 0);

    let mut channel = client.open_channel("session").await.unwrap();
    assert!(exec(&channel, "git-upload-pack 'group/project.git'").await);
    assert_eq!(
        channel.read_stdout().await.unwrap(),
        b"upload-pack group/project.git for git\n"
    );
    assert_eq!(exit_status(&mut channel).await, 0);

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_failing_command_exits_non_zero() {
    let engine = Arc::new(LoopbackEngine::new());
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = faults.clone();
    let server = builder(&engine)
        .with_error_logger(move |fault: &ServerFault| sink.lock().unwrap().push(fault.clone()))
        .build();
    let (addr, _handle) = start(&server).await;
    let client = connect(&engine, addr).await;

    let mut channel = client.open_channel("session").await.unwrap();
    assert!(exec(&channel, "deny push").await);
    assert_eq!(
        channel.read_stderr().await.unwrap(),
        b"deny push: permission denied\n"
    );
    assert_eq!(exit_status(&mut channel).await, 128);

    let faults = faults.lock().unwrap().clone();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::Command);
    assert_eq!(
        faults[0].message,
        "Command step 0 failed: permission denied"
    );

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_unsupported_requests_and_channels() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine).build();
    let (addr, _handle) = start(&server).await;
    let client = connect(&engine, addr).await;

    match client.open_channel("direct-tcpip").await {
        Err(TransportError::Rejected { reason, message }) => {
            assert_eq!(reason, RejectionReason::UnknownChannelType);
            assert_eq!(message, UNSUPPORTED_CHANNEL_MESSAGE);
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }

    let (ok, _) = client
        .global_request("keepalive@openssh.com", Bytes::new())
        .await
        .unwrap();
    assert!(!ok);

    let channel = client.open_channel("session").await.unwrap();
    assert!(!channel.request("x11-req", Bytes::new()).await.unwrap().0);
    let env = EnvRequest {
        name: "LD_PRELOAD".to_string(),
        value: "/tmp/evil.so".to_string(),
    };
    assert!(!channel.request("env", env.encode()).await.unwrap().0);

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_requests_are_ordered_per_channel() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine).build();
    let (addr, _handle) = start(&server).await;
    let client = connect(&engine, addr).await;

    let mut first = client.open_channel("session").await.unwrap();
    let mut second = client.open_channel("session").await.unwrap();
    for (a, b) in ["a", "b", "c", "d"].iter().zip(["w", "x", "y", "z"]) {
        first
            .send_request("note@sshmux", false, Bytes::copy_from_slice(a.as_bytes()))
            .unwrap();
        second
            .send_request("note@sshmux", false, Bytes::copy_from_slice(b.as_bytes()))
            .unwrap();
    }
    assert!(exec(&first, "notes").await);
    assert!(exec(&second, "notes").await);

    assert_eq!(first.read_stdout().await.unwrap(), b"abcd\n");
    assert_eq!(second.read_stdout().await.unwrap(), b"wxyz\n");
    assert_eq!(exit_status(&mut first).await, 0);
    assert_eq!(exit_status(&mut second).await, 0);

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_config_factory_is_per_connection() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = SshServer::builder(engine.clone(), session_mux())
        .with_config_factory(|ctx: &ConnContext| {
            let id = ctx.id();
            TransportConfig::default().with_password_callback(move |meta, password| {
                if password == b"hunter2" {
                    Ok(Permissions::default()
                        .with_extension("conn-id", id.to_string())
                        .with_extension("key-id", meta.user.clone()))
                } else {
                    Err("invalid password".to_string())
                }
            })
        })
        .build();
    let (addr, _handle) = start(&server).await;

    let mut ids = Vec::new();
    for _ in 0..2 {
        let mut client = engine.client("deploy").with_password("hunter2");
        client.connect(addr).await.unwrap();
        let mut channel = client.open_channel("session").await.unwrap();
        assert!(exec(&channel, "whoami").await);
        let out = String::from_utf8(channel.read_stdout().await.unwrap()).unwrap();
        let fields: Vec<&str> = out.split_whitespace().collect();
        assert_eq!(fields[0], "127.0.0.1");
        assert_eq!(fields[2], "deploy");
        ids.push(fields[1].to_string());
        assert_eq!(exit_status(&mut channel).await, 0);
    }
    assert_ne!(ids[0], ids[1]);

    let mut intruder = engine.client("deploy").with_password("letmein");
    assert!(matches!(
        intruder.connect(addr).await,
        Err(TransportError::AuthFailed(_))
    ));

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_conn_context_hook_and_proxy_header() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine)
        .with_proxy_protocol(ProxyV1Decoder)
        .with_conn_context(|_conn, ctx| {
            ctx.set_data("tenant", "acme".to_string());
            ctx
        })
        .build();
    let (addr, _handle) = start(&server).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 2222\r\n")
        .await
        .unwrap();
    let mut client = engine.client("git");
    client.connect_stream(Box::new(stream)).await.unwrap();

    let mut channel = client.open_channel("session").await.unwrap();
    assert!(exec(&channel, "whoami").await);
    assert_eq!(
        channel.read_stdout().await.unwrap(),
        b"203.0.113.7   acme\n"
    );
    assert_eq!(exit_status(&mut channel).await, 0);

    let info = server.manager().get_all_connection_infos().remove(0);
    assert_eq!(info.peer_addr, Some("203.0.113.7:56324".parse().unwrap()));

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_bad_proxy_header_drops_connection() {
    let engine = Arc::new(LoopbackEngine::new());
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = faults.clone();
    let server = builder(&engine)
        .with_proxy_protocol(ProxyV1Decoder)
        .with_error_logger(move |fault: &ServerFault| sink.lock().unwrap().push(fault.kind))
        .build();
    let (addr, _handle) = start(&server).await;

    let mut client = engine.client("git");
    // the identification line is not a PROXY header
    assert!(client.connect(addr).await.is_err());
    wait_until(|| !faults.lock().unwrap().is_empty()).await;
    assert_eq!(*faults.lock().unwrap(), vec![FaultKind::Proxy]);

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_silent_proxy_client_times_out() {
    let engine = Arc::new(LoopbackEngine::new());
    let faults = Arc::new(Mutex::new(Vec::new()));
    let sink = faults.clone();
    let server = builder(&engine)
        .with_proxy_protocol(ProxyV1Decoder)
        .with_read_timeout(Duration::from_millis(200))
        .with_idle_timeout(Duration::from_millis(200))
        .with_error_logger(move |fault: &ServerFault| sink.lock().unwrap().push(fault.clone()))
        .build();
    let (addr, _handle) = start(&server).await;

    // connect and never send the header
    let mut stream = TcpStream::connect(addr).await.unwrap();
    wait_until(|| server.connection_count() == 0 && !faults.lock().unwrap().is_empty()).await;

    let fault = faults.lock().unwrap()[0].clone();
    assert_eq!(fault.kind, FaultKind::Proxy);
    assert!(fault.message.contains("timed out"), "{}", fault.message);

    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("socket was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));

    server.shutdown(Some(Duration::from_secs(2))).await.unwrap();
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine)
        .with_idle_timeout(Duration::from_millis(200))
        .build();
    let (addr, _handle) = start(&server).await;

    let mut client = connect(&engine, addr).await;
    timeout(Duration::from_secs(5), client.wait_closed())
        .await
        .expect("idle connection was not closed")
        .unwrap();

    wait_until(|| server.connection_count() == 0).await;

    server.shutdown(None).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine).build();
    let (addr, handle) = start(&server).await;

    let mut client = connect(&engine, addr).await;
    let mut channel = client.open_channel("session").await.unwrap();
    assert!(exec(&channel, "ls").await);
    assert_eq!(exit_status(&mut channel).await, 0);
    client.disconnect().await.unwrap();

    server.shutdown(Some(Duration::from_secs(2))).await.unwrap();
    assert!(handle.await.unwrap().unwrap_err().is_server_closed());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_deadline_exceeded() {
    let engine = Arc::new(LoopbackEngine::new());
    let server = builder(&engine).build();
    let (addr, handle) = start(&server).await;

    let client = connect(&engine, addr).await;
    let channel = client.open_channel("session").await.unwrap();
    let request = CommandRequest {
        command: "sleep 5".to_string(),
    };
    let _reply = channel.send_request("exec", true, request.encode()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = server
        .shutdown(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_deadline_exceeded());
    // the listener is gone even though connections remain
    assert!(handle.await.unwrap().unwrap_err().is_server_closed());
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_listen_and_serve_bind_error() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();
    let server = SshServer::new(
        Arc::new(LoopbackEngine::new()),
        sshmux_service::default_config_factory(),
        ServeMux::new(),
    );

    let err = server.listen_and_serve(&addr).await.unwrap_err();
    assert!(matches!(err, SshdError::Io(_)));
    assert!(!server.is_running());
}
