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

//! Per-channel state and the command pipeline
//!
//! A [`ChannelChain`] is created for every channel offer and handed to the
//! top-level [`ChannelHandler`]. It owns the accepted channel, the accepted
//! environment and the command pipeline.
//!
//! ```text
//! offer → ChannelHandler::serve_channel(cc, offer)
//!           ↓ accept
//!         cc.handle_requests(channel, requests, handlers)
//!           ↓ exec / shell
//!         cc.handle_command(command, envs, [step0, step1, ...])
//!           ↓
//!         step0.execute(cc) → step1.execute(cc) → ... until cc.abort()
//! ```

use crate::fault::{FaultKind, FaultReporter, ServerFault};
use crate::{
    ChannelHandler, CommandHandler, ConnContext, RequestHandler, Result, SshdError,
};
use bytes::Bytes;
use futures::StreamExt;
use sshmux_transport::wire::{ExitStatus, REQUEST_EXIT_STATUS, WireMessage};
use sshmux_transport::{Channel, NewChannel, Requests, Session, TransportConfig};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, trace};

/// Key of the fallback entry in a [`RequestHandlers`] table
pub const DEFAULT_REQUEST_HANDLER: &str = "default";

/// Request handlers keyed by request type
pub type RequestHandlers = HashMap<String, Arc<dyn RequestHandler>>;

/// Progress of a command pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No step has run yet
    NotStarted,
    /// The step with this index is the most recently started one
    Running(usize),
    /// A step aborted or failed; further `next` calls do nothing
    Aborted,
    /// Every step has run
    Exhausted,
}

/// State of one channel
pub struct ChannelChain {
    context: ConnContext,
    session: Arc<dyn Session>,
    transport_config: Arc<TransportConfig>,
    handler: Arc<dyn ChannelHandler>,
    reporter: FaultReporter,
    channel_type: String,
    channel: Option<Box<dyn Channel>>,
    accepted_envs: HashMap<String, String>,
    raw_command: String,
    steps: Vec<Arc<dyn CommandHandler>>,
    state: PipelineState,
}

impl ChannelChain {
    /// Create the chain for a channel offer on `session`
    pub fn new(
        context: ConnContext,
        session: Arc<dyn Session>,
        transport_config: Arc<TransportConfig>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Self {
        Self {
            context,
            session,
            transport_config,
            handler,
            reporter: FaultReporter::default(),
            channel_type: String::new(),
            channel: None,
            accepted_envs: HashMap::new(),
            raw_command: String::new(),
            steps: Vec::new(),
            state: PipelineState::NotStarted,
        }
    }

    pub(crate) fn with_reporter(mut self, reporter: FaultReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Hand a channel offer to the top-level handler
    pub async fn dispatch(&mut self, offer: Box<dyn NewChannel>) -> Result<()> {
        self.channel_type = offer.channel_type().to_string();
        trace!(channel_type = %self.channel_type, "Dispatching channel offer");
        let handler = self.handler.clone();
        handler.serve_channel(self, offer).await
    }

    /// Serve the requests of an accepted channel until the stream ends
    ///
    /// Each request goes to the handler registered for its type, or to the
    /// [`DEFAULT_REQUEST_HANDLER`] entry. Requests nobody handles are
    /// answered negatively. Requests are served strictly in arrival order.
    pub async fn handle_requests(
        &mut self,
        channel: Box<dyn Channel>,
        mut requests: Requests,
        handlers: Option<&RequestHandlers>,
    ) {
        self.channel = Some(channel);

        while let Some(request) = requests.next().await {
            let handler = handlers.and_then(|handlers| {
                handlers
                    .get(request.request_type())
                    .or_else(|| handlers.get(DEFAULT_REQUEST_HANDLER))
                    .cloned()
            });

            let (ok, payload) = match handler {
                Some(handler) => handler.serve(self, request.as_ref()).await,
                None => (false, Bytes::new()),
            };
            trace!(request = request.request_type(), ok, "Channel request served");

            if let Err(e) = request.reply(ok, payload).await {
                debug!(error = %e, "Failed to reply to channel request");
            }
        }

        if let Some(channel) = self.channel.as_mut() {
            if !channel.is_closed() {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Failed to close channel");
                }
            }
        }
    }

    /// Run a command pipeline
    ///
    /// Resets the pipeline, records the command and the accepted
    /// environment, then runs the steps. A failing step aborts the pipeline;
    /// its error is logged and returned.
    pub async fn handle_command(
        &mut self,
        command: impl Into<String>,
        envs: HashMap<String, String>,
        steps: Vec<Arc<dyn CommandHandler>>,
    ) -> Result<()> {
        self.raw_command = command.into();
        self.accepted_envs = envs;
        self.steps = steps;
        self.state = PipelineState::NotStarted;

        let result = self.next().await;
        if let Err(e) = &result {
            self.reporter.report(
                ServerFault::new(FaultKind::Command, e.to_string())
                    .with_connection(self.context.id(), self.context.peer_addr()),
            );
        }
        result
    }

    /// Run the remaining pipeline steps
    ///
    /// Steps run in order until the pipeline is exhausted or aborted. A step
    /// may call `next` itself to run the rest of the pipeline before it
    /// continues; every step still runs exactly once. Does nothing once the
    /// pipeline is exhausted or aborted.
    pub async fn next(&mut self) -> Result<()> {
        loop {
            let index = match self.state {
                PipelineState::NotStarted => 0,
                PipelineState::Running(index) => index + 1,
                PipelineState::Aborted | PipelineState::Exhausted => return Ok(()),
            };
            let Some(step) = self.steps.get(index).cloned() else {
                self.state = PipelineState::Exhausted;
                return Ok(());
            };

            self.state = PipelineState::Running(index);
            if let Err(e) = step.execute(self).await {
                self.state = PipelineState::Aborted;
                return Err(match e {
                    SshdError::CommandFailed { .. } => e,
                    other => SshdError::CommandFailed {
                        step: index,
                        source: Box::new(other),
                    },
                });
            }
        }
    }

    /// Stop the pipeline; no further step runs for this command
    pub fn abort(&mut self) {
        if !self.is_aborted() {
            trace!(state = ?self.state, "Pipeline aborted");
        }
        self.state = PipelineState::Aborted;
    }

    /// Check whether the pipeline was aborted
    pub fn is_aborted(&self) -> bool {
        self.state == PipelineState::Aborted
    }

    /// Report the exit status to the peer and close the channel
    pub async fn exit(&mut self, status: u32) -> Result<()> {
        let channel = self.channel_mut()?;
        channel
            .send_request(REQUEST_EXIT_STATUS, false, ExitStatus { status }.encode())
            .await?;
        channel.close().await?;
        Ok(())
    }

    /// Close the channel without reporting an exit status
    pub async fn close(&mut self) -> Result<()> {
        self.channel_mut()?.close().await?;
        Ok(())
    }

    fn channel_mut(&mut self) -> Result<&mut Box<dyn Channel>> {
        self.channel.as_mut().ok_or(SshdError::ChannelNotAccepted)
    }

    /// The channel's input stream
    pub fn stdin(&mut self) -> Result<&mut dyn Channel> {
        Ok(self.channel_mut()?.as_mut())
    }

    /// The channel's output stream
    pub fn stdout(&mut self) -> Result<&mut dyn Channel> {
        Ok(self.channel_mut()?.as_mut())
    }

    /// The channel's extended (stderr) stream
    pub fn stderr(&mut self) -> Result<&mut (dyn AsyncWrite + Send + Unpin)> {
        Ok(self.channel_mut()?.stderr())
    }

    /// Check whether a channel has been accepted on this chain
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    /// Record an accepted environment variable
    pub fn accept_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.accepted_envs.insert(name.into(), value.into());
    }

    /// Value of an accepted environment variable, or `""`
    pub fn get_env(&self, name: &str) -> &str {
        self.accepted_envs
            .get(name)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// All accepted environment variables
    pub fn accepted_envs(&self) -> &HashMap<String, String> {
        &self.accepted_envs
    }

    /// The command line of the running pipeline
    pub fn raw_command(&self) -> &str {
        &self.raw_command
    }

    /// Split a command line using shell quoting rules
    ///
    /// Returns `None` for malformed input such as unbalanced quotes.
    pub fn split_shell_cmd(&self, command: &str) -> Option<Vec<String>> {
        shlex::split(command)
    }

    /// Progress of the command pipeline
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Number of steps in the command pipeline
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Channel type of the offer this chain serves
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Connection context
    pub fn context(&self) -> &ConnContext {
        &self.context
    }

    /// The session the channel belongs to
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Transport configuration the session was negotiated with
    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport_config
    }

    /// The top-level channel handler
    pub fn handler(&self) -> Arc<dyn ChannelHandler> {
        self.handler.clone()
    }

    /// Authenticated user name
    pub fn user(&self) -> &str {
        self.session.user()
    }

    /// Hex encoded session identifier
    pub fn session_id(&self) -> String {
        hex::encode(self.session.session_id())
    }

    /// Client identification string
    pub fn client_version(&self) -> &str {
        self.session.client_version()
    }

    /// Server identification string
    pub fn server_version(&self) -> &str {
        self.session.server_version()
    }

    /// Client IP address, or `""` when unknown
    pub fn client_ip(&self) -> String {
        ip_string(self.session.remote_addr())
    }

    /// Server IP address, or `""` when unknown
    pub fn server_ip(&self) -> String {
        ip_string(self.session.local_addr())
    }

    /// Permission extension set during authentication, or `""`
    pub fn perm_extension(&self, key: &str) -> &str {
        self.session
            .permissions()
            .extensions
            .get(key)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Critical option set during authentication, or `""`
    pub fn perm_critical_option(&self, key: &str) -> &str {
        self.session
            .permissions()
            .critical_options
            .get(key)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn ip_string(addr: Option<SocketAddr>) -> String {
    addr.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

impl fmt::Debug for ChannelChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelChain")
            .field("connection", &self.context.id())
            .field("user", &self.session.user())
            .field("channel_type", &self.channel_type)
            .field("has_channel", &self.channel.is_some())
            .field("raw_command", &self.raw_command)
            .field("state", &self.state)
            .field("steps", &self.steps.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{ConnectionId, RequestHandlerFn};
    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use sshmux_transport::loopback::{ClientChannel, channel_pair};
    use sshmux_transport::{Permissions, Request, TransportResult};
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    pub(crate) struct StubSession {
        pub(crate) permissions: Permissions,
    }

    #[async_trait]
    impl Session for StubSession {
        fn user(&self) -> &str {
            "git"
        }

        fn session_id(&self) -> &[u8] {
            &[0xde, 0xad, 0xbe, 0xef]
        }

        fn client_version(&self) -> &str {
            "SSH-2.0-OpenSSH_9.6"
        }

        fn server_version(&self) -> &str {
            "SSH-2.0-sshmux"
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            Some("192.0.2.10:51000".parse().unwrap())
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn permissions(&self) -> &Permissions {
            &self.permissions
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl ChannelHandler for NoopHandler {
        async fn serve_channel(&self, _cc: &mut ChannelChain, _offer: Box<dyn NewChannel>) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn test_chain() -> ChannelChain {
        ChannelChain::new(
            ConnContext::new(ConnectionId::new(1), None, None, CancellationToken::new()),
            Arc::new(StubSession {
                permissions: Permissions::default().with_extension("user-id", "42"),
            }),
            Arc::new(TransportConfig::default()),
            Arc::new(NoopHandler),
        )
    }

    /// Records its index, then behaves as configured
    #[derive(Clone, Copy, Default)]
    struct Behavior {
        call_next: bool,
        abort_at: Option<usize>,
        fail_at: Option<usize>,
    }

    struct Step {
        index: usize,
        log: Arc<Mutex<Vec<usize>>>,
        behavior: Behavior,
    }

    #[async_trait]
    impl CommandHandler for Step {
        async fn execute(&self, cc: &mut ChannelChain) -> Result<()> {
            self.log.lock().unwrap().push(self.index);
            if self.behavior.fail_at == Some(self.index) {
                return Err(SshdError::Other(format!("step {} failed", self.index)));
            }
            if self.behavior.abort_at == Some(self.index) {
                cc.abort();
            }
            if self.behavior.call_next {
                cc.next().await?;
            }
            Ok(())
        }
    }

    fn steps(count: usize, behavior: Behavior) -> (Vec<Arc<dyn CommandHandler>>, Arc<Mutex<Vec<usize>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = (0..count)
            .map(|index| {
                Arc::new(Step {
                    index,
                    log: log.clone(),
                    behavior,
                }) as Arc<dyn CommandHandler>
            })
            .collect();
        (steps, log)
    }

    #[tokio::test]
    async fn test_pipeline_runs_every_step_in_order() {
        let mut cc = test_chain();
        let (steps, log) = steps(4, Behavior::default());
        assert!(!cc.is_aborted());

        cc.handle_command("ls -la /tmp", HashMap::new(), steps).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(cc.state(), PipelineState::Exhausted);
        assert!(!cc.is_aborted());
        assert_eq!(cc.raw_command(), "ls -la /tmp");
        assert_eq!(cc.step_count(), 4);
    }

    #[tokio::test]
    async fn test_step_calling_next_runs_each_step_once() {
        let mut cc = test_chain();
        let (steps, log) = steps(
            4,
            Behavior {
                call_next: true,
                ..Default::default()
            },
        );

        cc.handle_command("", HashMap::new(), steps).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(cc.state(), PipelineState::Exhausted);
    }

    #[tokio::test]
    async fn test_abort_stops_pipeline() {
        for count in [3, 5, 40] {
            let mut cc = test_chain();
            let (steps, log) = steps(
                count,
                Behavior {
                    abort_at: Some(1),
                    ..Default::default()
                },
            );

            cc.handle_command("", HashMap::new(), steps).await.unwrap();

            assert_eq!(*log.lock().unwrap(), vec![0, 1]);
            assert!(cc.is_aborted());
        }
    }

    #[tokio::test]
    async fn test_abort_is_sticky() {
        // more steps than fit in a u8 index
        let mut cc = test_chain();
        let (steps, log) = steps(
            300,
            Behavior {
                abort_at: Some(0),
                ..Default::default()
            },
        );

        cc.handle_command("", HashMap::new(), steps).await.unwrap();
        for _ in 0..600 {
            cc.next().await.unwrap();
            assert!(cc.is_aborted());
        }
        assert_eq!(*log.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_long_pipeline_runs_to_exhaustion() {
        let mut cc = test_chain();
        let (steps, log) = steps(300, Behavior::default());

        cc.handle_command("", HashMap::new(), steps).await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 300);
        assert_eq!(log.lock().unwrap()[299], 299);
        assert_eq!(cc.state(), PipelineState::Exhausted);

        // further calls are no-ops
        cc.next().await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 300);
        assert!(!cc.is_aborted());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failing_step_aborts_pipeline() {
        let mut cc = test_chain();
        let (steps, log) = steps(
            4,
            Behavior {
                fail_at: Some(2),
                ..Default::default()
            },
        );

        let err = cc.handle_command("", HashMap::new(), steps).await.unwrap_err();

        match err {
            SshdError::CommandFailed { step, .. } => assert_eq!(step, 2),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
        assert!(cc.is_aborted());
        assert!(logs_contain("Command step 2 failed: step 2 failed"));

        cc.next().await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_nested_failure_keeps_failing_step() {
        let mut cc = test_chain();
        let (steps, _) = steps(
            3,
            Behavior {
                call_next: true,
                fail_at: Some(2),
                ..Default::default()
            },
        );

        match cc.handle_command("", HashMap::new(), steps).await {
            Err(SshdError::CommandFailed { step, .. }) => assert_eq!(step, 2),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handle_command_resets_pipeline() {
        let mut cc = test_chain();
        let (first, _) = steps(
            1,
            Behavior {
                abort_at: Some(0),
                ..Default::default()
            },
        );
        cc.handle_command("a", HashMap::new(), first).await.unwrap();
        assert!(cc.is_aborted());

        let (second, log) = steps(2, Behavior::default());
        let mut envs = HashMap::new();
        envs.insert("LANG".to_string(), "C".to_string());
        cc.handle_command("b", envs, second).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec![0, 1]);
        assert!(!cc.is_aborted());
        assert_eq!(cc.get_env("LANG"), "C");
        assert_eq!(cc.raw_command(), "b");
    }

    #[tokio::test]
    async fn test_accessors() {
        let mut cc = test_chain();
        assert_eq!(cc.user(), "git");
        assert_eq!(cc.session_id(), "deadbeef");
        assert_eq!(cc.client_ip(), "192.0.2.10");
        assert_eq!(cc.server_ip(), "");
        assert_eq!(cc.perm_extension("user-id"), "42");
        assert_eq!(cc.perm_extension("missing"), "");
        assert_eq!(cc.get_env("HOME"), "");

        cc.accept_env("GIT_PROTOCOL", "version=2");
        assert_eq!(cc.get_env("GIT_PROTOCOL"), "version=2");

        assert_eq!(
            cc.split_shell_cmd("git-upload-pack 'group/my project.git'"),
            Some(vec!["git-upload-pack".to_string(), "group/my project.git".to_string()])
        );
        assert_eq!(cc.split_shell_cmd("echo 'unterminated"), None);

        assert!(matches!(cc.stdout(), Err(SshdError::ChannelNotAccepted)));
        assert!(matches!(cc.exit(0).await, Err(SshdError::ChannelNotAccepted)));
    }

    fn recording_handler(seen: Arc<Mutex<Vec<String>>>) -> Arc<dyn RequestHandler> {
        struct Recorder(Arc<Mutex<Vec<String>>>);

        #[async_trait]
        impl RequestHandler for Recorder {
            async fn serve(&self, _cc: &mut ChannelChain, request: &dyn Request) -> (bool, Bytes) {
                self.0.lock().unwrap().push(request.request_type().to_string());
                (true, Bytes::new())
            }
        }

        Arc::new(Recorder(seen))
    }

    async fn serve_channel(handlers: RequestHandlers) -> (ClientChannel, tokio::task::JoinHandle<ChannelChain>) {
        let (offer, pending) = channel_pair("session");
        let (channel, requests) = Box::new(offer).accept().await.unwrap();
        let client = pending.opened().await.unwrap();
        let task = tokio::spawn(async move {
            let mut cc = test_chain();
            cc.handle_requests(channel, requests, Some(&handlers)).await;
            cc
        });
        (client, task)
    }

    #[tokio::test]
    async fn test_requests_dispatched_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = RequestHandlers::new();
        handlers.insert("env".to_string(), recording_handler(seen.clone()));
        handlers.insert("pty-req".to_string(), recording_handler(seen.clone()));

        let (mut client, task) = serve_channel(handlers).await;

        let replies = vec![
            client.send_request("env", true, Bytes::new()).unwrap(),
            client.send_request("pty-req", true, Bytes::new()).unwrap(),
            client.send_request("env", true, Bytes::new()).unwrap(),
            client.send_request("x11-req", true, Bytes::new()).unwrap(),
        ];
        let mut answers = Vec::new();
        for reply in replies {
            answers.push(reply.recv().await.unwrap().0);
        }

        assert_eq!(answers, vec![true, true, true, false]);
        assert_eq!(*seen.lock().unwrap(), vec!["env", "pty-req", "env"]);

        client.close();
        let cc = task.await.unwrap();
        assert!(cc.has_channel());
    }

    #[tokio::test]
    async fn test_default_request_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handlers = RequestHandlers::new();
        handlers.insert(DEFAULT_REQUEST_HANDLER.to_string(), recording_handler(seen.clone()));

        let (mut client, task) = serve_channel(handlers).await;
        let (ok, _) = client.request("auth-agent-req@openssh.com", Bytes::new()).await.unwrap();
        assert!(ok);
        assert_eq!(*seen.lock().unwrap(), vec!["auth-agent-req@openssh.com"]);

        client.close();
        task.await.unwrap();
    }

    fn exit_three<'a>(cc: &'a mut ChannelChain, _request: &'a dyn Request) -> BoxFuture<'a, (bool, Bytes)> {
        Box::pin(async move {
            let _ = cc.stdout().unwrap().write_all(b"bye\n").await;
            cc.exit(3).await.unwrap();
            // the second exit fails because the channel is closed
            assert!(cc.exit(3).await.is_err());
            (true, Bytes::new())
        })
    }

    #[tokio::test]
    async fn test_exit_sends_status_and_closes() {
        let mut handlers = RequestHandlers::new();
        handlers.insert(
            "exec".to_string(),
            Arc::new(RequestHandlerFn::new(exit_three)) as Arc<dyn RequestHandler>,
        );

        let (mut client, task) = serve_channel(handlers).await;
        let reply = client.send_request("exec", true, Bytes::new()).unwrap();

        let event = client.next_event().await.unwrap();
        assert_eq!(event.name, "exit-status");
        assert!(!event.want_reply);
        assert_eq!(ExitStatus::decode(&event.payload).unwrap().status, 3);
        assert_eq!(client.read_stdout().await.unwrap(), b"bye\n");

        assert!(reply.recv().await.unwrap().0);
        client.close();
        task.await.unwrap();
    }
}
