//! Agent client - runs the loop controller on its own task
//!
//! Commands from an [`AgentHandle`], transport responses and background tool
//! completions arrive on channels and are applied to the controller one at a
//! time. Synchronous tools run inline on this task; asynchronous tools and
//! the HTTP exchange run on spawned tasks. Cancel aborts the HTTP exchange
//! only. Asynchronous tools run to completion and their results are dropped
//! by the controller's epoch check.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::Error;
use crate::Result;

use super::controller::{LoopController, Outbound, Step, ToolPlan};
use super::event::AgentEvent;
use super::message::{ConversationMessage, ToolCall};
use super::transport::{HttpResponse, Transport};

enum Command {
    Send {
        text: String,
        images: Vec<Vec<u8>>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel,
    Clear,
    History(oneshot::Sender<Vec<ConversationMessage>>),
}

/// Work finished off the client task
enum Completion {
    Response { epoch: u64, result: Result<HttpResponse> },
    Tool { epoch: u64, call: ToolCall, outcome: Result<String> },
}

/// Cloneable handle for talking to a running [`AgentClient`]
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl AgentHandle {
    /// Start a turn. Returns once the request is on its way; progress arrives as events.
    pub async fn send_message(&self, text: impl Into<String>, images: Vec<Vec<u8>>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { text: text.into(), images, reply })
            .map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())?
    }

    /// Abandon the in-flight turn, if any
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel);
    }

    /// Forget the conversation
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    pub async fn history(&self) -> Result<Vec<ConversationMessage>> {
        let (reply, response) = oneshot::channel();
        self.commands.send(Command::History(reply)).map_err(|_| stopped())?;
        response.await.map_err(|_| stopped())
    }
}

fn stopped() -> Error {
    Error::InvalidState("Agent client has stopped".to_string())
}

/// Owns the controller and performs the I/O it asks for
pub struct AgentClient {
    controller: LoopController,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<AgentEvent>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    in_flight: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl AgentClient {
    /// Start the client task. Must be called inside a tokio runtime.
    pub fn spawn(
        controller: LoopController,
        transport: Arc<dyn Transport>,
    ) -> (AgentHandle, mpsc::UnboundedReceiver<AgentEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();

        let client = Self {
            controller,
            transport,
            events: event_tx,
            completion_tx,
            completions,
            in_flight: None,
            background: Vec::new(),
        };
        tokio::spawn(client.run(command_rx));

        (AgentHandle { commands: command_tx }, event_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Agent client started ({} mode)", self.controller.mode().as_str());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion).await
                }
            }
        }

        self.abort_all();
        debug!("Agent client stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send { text, images, reply } => {
                let result = match self.controller.send_message(&text, images) {
                    Ok(outbound) => {
                        self.start_request(outbound);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                self.flush_events();
                let _ = reply.send(result);
            }
            Command::Cancel => {
                self.abort_request();
                self.controller.cancel();
                self.flush_events();
            }
            Command::Clear => {
                self.abort_request();
                self.controller.clear();
                self.flush_events();
            }
            Command::History(reply) => {
                let _ = reply.send(self.controller.history());
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        let step = match completion {
            Completion::Response { epoch, result } => {
                if epoch == self.controller.epoch() {
                    self.in_flight = None;
                }
                self.controller.on_response(epoch, result)
            }
            Completion::Tool { epoch, call, outcome } => {
                self.controller.complete_tool(epoch, &call, outcome);
                if epoch == self.controller.epoch() {
                    self.controller.try_continue()
                } else {
                    Step::Wait
                }
            }
        };
        self.advance(step).await;
    }

    async fn advance(&mut self, mut step: Step) {
        loop {
            self.flush_events();
            step = match step {
                Step::Send(outbound) => {
                    self.start_request(outbound);
                    break;
                }
                Step::Dispatch(calls) => self.dispatch(calls).await,
                Step::Wait | Step::Idle => break,
            };
        }
        self.flush_events();
    }

    /// Run a batch in order: inline tools are awaited, async tools spawned.
    async fn dispatch(&mut self, calls: Vec<ToolCall>) -> Step {
        let epoch = self.controller.epoch();
        self.background.retain(|task| !task.is_finished());

        for call in calls {
            match self.controller.begin_tool(&call) {
                ToolPlan::Inline(tool, params) => {
                    self.flush_events();
                    let outcome = tool.execute(params).await;
                    self.controller.complete_tool(epoch, &call, outcome);
                }
                ToolPlan::Background(tool, params) => {
                    debug!("Running {} in the background", call.name);
                    let completions = self.completion_tx.clone();
                    self.background.push(tokio::spawn(async move {
                        let outcome = tool.execute(params).await;
                        let _ = completions.send(Completion::Tool { epoch, call, outcome });
                    }));
                }
                ToolPlan::Answered => {}
            }
        }

        self.controller.finish_dispatch()
    }

    fn start_request(&mut self, outbound: Outbound) {
        let transport = self.transport.clone();
        let completions = self.completion_tx.clone();
        let epoch = outbound.epoch;

        self.in_flight = Some(tokio::spawn(async move {
            let result = transport.send(outbound.request).await;
            let _ = completions.send(Completion::Response { epoch, result });
        }));
    }

    fn abort_request(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
    }

    /// Shutdown only. Cancel and clear leave background tools running.
    fn abort_all(&mut self) {
        self.abort_request();
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    fn flush_events(&mut self) {
        for event in self.controller.drain_events() {
            let _ = self.events.send(event);
        }
    }
}
