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

//! Stock handler for `session` channels
//!
//! [`SessionHandler`] accepts the channel, records allowed environment
//! variables, and turns `exec` and `shell` requests into command pipelines
//! chosen by a router. Every other request is declined unless a handler for
//! it is added with [`SessionHandler::with_request_handler`].

use crate::{
    ChannelChain, ChannelHandler, CommandHandler, DEFAULT_REQUEST_HANDLER, RequestHandler,
    RequestHandlers, Result,
};
use async_trait::async_trait;
use bytes::Bytes;
use sshmux_transport::wire::{
    CommandRequest, EnvRequest, REQUEST_ENV, REQUEST_EXEC, REQUEST_SHELL, REQUEST_SUBSYSTEM,
    WireMessage,
};
use sshmux_transport::{NewChannel, Request};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

/// Chooses the pipeline for a command
///
/// Receives the command split into shell words (empty for `shell`).
pub type CommandRouter = Arc<dyn Fn(&[String]) -> Vec<Arc<dyn CommandHandler>> + Send + Sync>;

/// Handler for `session` channels
#[derive(Clone)]
pub struct SessionHandler {
    handlers: RequestHandlers,
    accept_envs: HashSet<String>,
    router: CommandRouter,
}

impl SessionHandler {
    /// Create a handler routing commands through `router`
    pub fn new<F>(router: F) -> Self
    where
        F: Fn(&[String]) -> Vec<Arc<dyn CommandHandler>> + Send + Sync + 'static,
    {
        let router: CommandRouter = Arc::new(router);
        let command: Arc<dyn RequestHandler> = Arc::new(CommandRequestHandler {
            router: router.clone(),
        });

        let mut handlers = RequestHandlers::new();
        handlers.insert(REQUEST_EXEC.to_string(), command.clone());
        handlers.insert(REQUEST_SHELL.to_string(), command.clone());
        handlers.insert(REQUEST_SUBSYSTEM.to_string(), command);
        handlers.insert(
            DEFAULT_REQUEST_HANDLER.to_string(),
            Arc::new(DeclineRequestHandler),
        );

        let mut this = Self {
            handlers,
            accept_envs: HashSet::new(),
            router,
        };
        this.install_env_handler();
        this
    }

    /// Allow the client to set an environment variable
    pub fn with_accept_env(mut self, name: impl Into<String>) -> Self {
        self.accept_envs.insert(name.into());
        self.install_env_handler();
        self
    }

    /// Add or replace the handler for a request type
    pub fn with_request_handler(
        mut self,
        request_type: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        self.handlers.insert(request_type.into(), handler);
        self
    }

    /// Environment variables the client may set
    pub fn accept_envs(&self) -> &HashSet<String> {
        &self.accept_envs
    }

    /// Request handlers used for accepted channels
    pub fn request_handlers(&self) -> &RequestHandlers {
        &self.handlers
    }

    /// The command router
    pub fn router(&self) -> &CommandRouter {
        &self.router
    }

    fn install_env_handler(&mut self) {
        self.handlers.insert(
            REQUEST_ENV.to_string(),
            Arc::new(EnvRequestHandler {
                accept: self.accept_envs.clone(),
            }),
        );
    }
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    async fn serve_channel(&self, cc: &mut ChannelChain, offer: Box<dyn NewChannel>) -> Result<()> {
        let (channel, requests) = offer.accept().await?;
        trace!(user = cc.user(), "Session channel accepted");
        cc.handle_requests(channel, requests, Some(&self.handlers)).await;
        Ok(())
    }
}

impl fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut requests: Vec<&String> = self.handlers.keys().collect();
        requests.sort();
        f.debug_struct("SessionHandler")
            .field("requests", &requests)
            .field("accept_envs", &self.accept_envs)
            .finish_non_exhaustive()
    }
}

/// Accepts `env` requests for allow-listed names
struct EnvRequestHandler {
    accept: HashSet<String>,
}

#[async_trait]
impl RequestHandler for EnvRequestHandler {
    async fn serve(&self, cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
        let env = match EnvRequest::decode(request.payload()) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "Malformed env request");
                return (false, Bytes::new());
            }
        };
        if !self.accept.contains(&env.name) {
            trace!(name = %env.name, "Declining env request");
            return (false, Bytes::new());
        }
        cc.accept_env(env.name, env.value);
        (true, Bytes::new())
    }
}

/// Runs `exec`, `shell` and `subsystem` requests as command pipelines
struct CommandRequestHandler {
    router: CommandRouter,
}

#[async_trait]
impl RequestHandler for CommandRequestHandler {
    async fn serve(&self, cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
        let command = if request.request_type() == REQUEST_SHELL {
            String::new()
        } else {
            match CommandRequest::decode(request.payload()) {
                Ok(req) => req.command,
                Err(e) => {
                    debug!(error = %e, request = request.request_type(), "Malformed command request");
                    return (false, Bytes::new());
                }
            }
        };

        let args = if command.is_empty() {
            Vec::new()
        } else {
            match cc.split_shell_cmd(&command) {
                Some(args) => args,
                None => {
                    debug!(command = %command, "Unparseable command");
                    return (false, Bytes::new());
                }
            }
        };

        let steps = (self.router)(&args);
        let envs = cc.accepted_envs().clone();
        if let Err(e) = cc.handle_command(command, envs, steps).await {
            debug!(error = %e, "Command pipeline aborted");
        }
        (true, Bytes::new())
    }
}

/// Answers every request negatively
struct DeclineRequestHandler;

#[async_trait]
impl RequestHandler for DeclineRequestHandler {
    async fn serve(&self, _cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
        trace!(request = request.request_type(), "Declining request");
        (false, Bytes::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::tests::test_chain;
    use crate::SshdError;
    use sshmux_transport::loopback::channel_pair;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    struct Echo(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl CommandHandler for Echo {
        async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
            self.0.lock().unwrap().push(cc.raw_command().to_string());
            let line = format!("{} {}\n", cc.raw_command(), cc.get_env("LANG"));
            cc.stdout()?.write_all(line.as_bytes()).await?;
            cc.exit(0).await
        }
    }

    struct Fail;

    #[async_trait]
    impl CommandHandler for Fail {
        async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
            cc.stderr()?.write_all(b"not allowed\n").await?;
            cc.exit(1).await?;
            Err(SshdError::Other("not allowed".to_string()))
        }
    }

    fn handler(seen: Arc<Mutex<Vec<String>>>) -> SessionHandler {
        SessionHandler::new(move |args: &[String]| {
            if args.first().map(String::as_str) == Some("deny") {
                vec![Arc::new(Fail) as Arc<dyn CommandHandler>]
            } else {
                vec![Arc::new(Echo(seen.clone())) as Arc<dyn CommandHandler>]
            }
        })
        .with_accept_env("LANG")
    }

    #[tokio::test]
    async fn test_exec_runs_pipeline() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = handler(seen.clone());
        let (offer, pending) = channel_pair("session");

        let server = tokio::spawn(async move {
            let mut cc = test_chain();
            handler.serve_channel(&mut cc, Box::new(offer)).await
        });

        let mut client = pending.opened().await.unwrap();
        let env = EnvRequest {
            name: "LANG".to_string(),
            value: "C".to_string(),
        };
        assert!(client.request("env", env.encode()).await.unwrap().0);
        let rejected = EnvRequest {
            name: "LD_PRELOAD".to_string(),
            value: "/tmp/x.so".to_string(),
        };
        assert!(!client.request("env", rejected.encode()).await.unwrap().0);
        assert!(!client.request("x11-req", Bytes::new()).await.unwrap().0);

        let exec = CommandRequest {
            command: "ls -la /tmp".to_string(),
        };
        assert!(client.request("exec", exec.encode()).await.unwrap().0);

        assert_eq!(client.read_stdout().await.unwrap(), b"ls -la /tmp C\n");
        let event = client.next_event().await.unwrap();
        assert_eq!(event.name, "exit-status");

        server.await.unwrap().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["ls -la /tmp"]);
    }

    #[tokio::test]
    async fn test_failing_command_reports_on_stderr() {
        let handler = handler(Arc::new(Mutex::new(Vec::new())));
        let (offer, pending) = channel_pair("session");

        let server = tokio::spawn(async move {
            let mut cc = test_chain();
            handler.serve_channel(&mut cc, Box::new(offer)).await
        });

        let mut client = pending.opened().await.unwrap();
        let exec = CommandRequest {
            command: "deny everything".to_string(),
        };
        assert!(client.request("exec", exec.encode()).await.unwrap().0);

        assert_eq!(client.read_stderr().await.unwrap(), b"not allowed\n");
        let event = client.next_event().await.unwrap();
        assert_eq!(event.payload.as_ref(), &[0, 0, 0, 1]);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_exec_declined() {
        let handler = handler(Arc::new(Mutex::new(Vec::new())));
        let (offer, pending) = channel_pair("session");

        let server = tokio::spawn(async move {
            let mut cc = test_chain();
            handler.serve_channel(&mut cc, Box::new(offer)).await
        });

        let mut client = pending.opened().await.unwrap();
        assert!(!client.request("exec", Bytes::from_static(&[0, 0])).await.unwrap().0);
        let unbalanced = CommandRequest {
            command: "echo 'oops".to_string(),
        };
        assert!(!client.request("exec", unbalanced.encode()).await.unwrap().0);

        client.close();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_request_handler_table() {
        let handler = SessionHandler::new(|_args: &[String]| Vec::new())
            .with_accept_env("LANG")
            .with_accept_env("GIT_PROTOCOL");
        let table = handler.request_handlers();
        for key in ["env", "exec", "shell", "subsystem", "default"] {
            assert!(table.contains_key(key), "missing {}", key);
        }
        assert!(handler.accept_envs().contains("GIT_PROTOCOL"));
    }
}
