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

//! GitLab Shell Style Server Example
//!
//! This example shows a git-over-SSH front end in the style of gitlab-shell:
//! - A `session` channel handler with an allow-listed environment
//! - Commands routed to pipelines of command steps
//! - Per-connection authentication that tags the session with a key id
//! - Graceful shutdown with a deadline
//!
//! The server runs on the in-process loopback transport, so the example also
//! drives a few client sessions itself.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --example gitlab_shell
//! ```

use async_trait::async_trait;
use sshmux_service::{
    ChannelChain, CommandHandler, ConnContext, Result, ServeMux, SessionHandler, SshServer,
    SshdError,
};
use sshmux_transport::loopback::LoopbackEngine;
use sshmux_transport::wire::{CommandRequest, EnvRequest, ExitStatus, WireMessage};
use sshmux_transport::{Permissions, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

/// Users and the key id their password maps to
const ACCOUNTS: &[(&str, &str, &str)] = &[("alice", "wonderland", "key-17"), ("bob", "builder", "key-42")];

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing for logging
    tracing_subscriber::fmt::init();

    let session = SessionHandler::new(route)
        .with_accept_env("GIT_PROTOCOL")
        .with_accept_env("LANG");
    let mux = ServeMux::new().with_handler("session", session);

    let engine = Arc::new(LoopbackEngine::new());
    let server = SshServer::builder(engine.clone(), mux)
        .with_idle_timeout(Duration::from_secs(300))
        .with_config_factory(authenticate)
        .build();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    println!("GitLab shell listening on {}", addr);

    let runner = server.clone();
    let serving = tokio::spawn(async move { runner.serve(listener).await });

    for (user, password, command) in [
        ("alice", "wonderland", ""),
        ("alice", "wonderland", "git-upload-pack 'group/project.git'"),
        ("bob", "builder", "git-receive-pack group/project.git"),
        ("bob", "builder", "2fa_recovery_codes"),
    ] {
        let mut client = engine.client(user).with_password(password);
        client.connect(addr).await?;

        let mut channel = client.open_channel("session").await?;
        let env = EnvRequest {
            name: "GIT_PROTOCOL".to_string(),
            value: "version=2".to_string(),
        };
        channel.request("env", env.encode()).await?;
        let exec = CommandRequest {
            command: command.to_string(),
        };
        channel.request("exec", exec.encode()).await?;

        let stdout = channel.read_stdout().await?;
        let stderr = channel.read_stderr().await?;
        let status = match channel.next_event().await {
            Some(event) => ExitStatus::decode(&event.payload)?.status,
            None => 255,
        };
        println!("$ ssh {}@gitlab {:?}", user, command);
        print!("{}", String::from_utf8_lossy(&stdout));
        print!("{}", String::from_utf8_lossy(&stderr));
        println!("[exit {}]\n", status);

        client.disconnect().await?;
    }

    println!("{}", server.snapshot());
    server.shutdown(Some(Duration::from_secs(5))).await?;
    match serving.await? {
        Err(SshdError::ServerClosed) => println!("Server stopped"),
        other => println!("Server stopped unexpectedly: {:?}", other),
    }
    Ok(())
}

/// Transport configuration for one connection
fn authenticate(ctx: &ConnContext) -> TransportConfig {
    let connection = ctx.id().to_string();
    TransportConfig::default().with_password_callback(move |meta, password| {
        ACCOUNTS
            .iter()
            .find(|(user, secret, _)| *user == meta.user && secret.as_bytes() == password)
            .map(|(_, _, key_id)| {
                Permissions::default()
                    .with_extension("key-id", *key_id)
                    .with_extension("connection", connection.as_str())
            })
            .ok_or_else(|| "invalid credentials".to_string())
    })
}

/// Map a command line to its pipeline
fn route(args: &[String]) -> Vec<Arc<dyn CommandHandler>> {
    let Some(command) = args.first() else {
        return vec![Arc::new(Discover)];
    };
    let git = matches!(
        command.as_str(),
        "git-upload-pack" | "git-receive-pack" | "git-upload-archive"
    );
    if git {
        vec![Arc::new(RequireRepository), Arc::new(GitCommand)]
    } else {
        vec![Arc::new(Unknown)]
    }
}

/// Greets the user when no command was given
struct Discover;

#[async_trait]
impl CommandHandler for Discover {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        let greeting = format!("Welcome to GitLab, @{}!\n", cc.user());
        cc.stdout()?.write_all(greeting.as_bytes()).await?;
        cc.exit(0).await
    }
}

/// Rejects git commands without a repository path
struct RequireRepository;

#[async_trait]
impl CommandHandler for RequireRepository {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        let args = cc.split_shell_cmd(cc.raw_command()).unwrap_or_default();
        if args.len() != 2 {
            cc.stderr()?
                .write_all(b"ERROR: Repository path not provided\n")
                .await?;
            cc.abort();
            return cc.exit(1).await;
        }
        Ok(())
    }
}

/// Pretends to run the git service
struct GitCommand;

#[async_trait]
impl CommandHandler for GitCommand {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        let args = cc.split_shell_cmd(cc.raw_command()).unwrap_or_default();
        let line = format!(
            "{} {} as {} ({}, {}, {})\n",
            args[0],
            args[1],
            cc.user(),
            cc.perm_extension("key-id"),
            cc.get_env("GIT_PROTOCOL"),
            cc.client_ip(),
        );
        cc.stdout()?.write_all(line.as_bytes()).await?;
        cc.exit(0).await
    }
}

/// Reports an unknown command
struct Unknown;

#[async_trait]
impl CommandHandler for Unknown {
    async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
        let message = format!("ERROR: Unknown command: {}\n", cc.raw_command());
        cc.stderr()?.write_all(message.as_bytes()).await?;
        cc.exit(127).await
    }
}
