//! Serialized command queue in front of one worker
//!
//! `start` and `restart` are fire-and-forget: they enqueue and return at once.
//! `stop` and `close` enqueue and wait for the reply. Since the queue is FIFO,
//! a stop issued after a pending restart only runs once that restart is done.

use super::{Worker, WorkerError};
use crate::observability::metrics::{metrics, WorkerEvent};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, Instrument};

type Reply = oneshot::Sender<Result<(), WorkerError>>;

enum Command {
    Start,
    Restart,
    Stop(Reply),
    Close(Reply),
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Start => "start",
            Command::Restart => "restart",
            Command::Stop(_) => "stop",
            Command::Close(_) => "close",
        }
    }
}

/// Handle to the command loop that owns one worker
pub struct WorkerHandle {
    name: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    /// Take ownership of a worker and spawn its command loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(worker: Box<dyn Worker>) -> Self {
        let name = worker.name().to_string();
        let (commands, receiver) = mpsc::unbounded_channel();
        let span = crate::worker_span!(worker = %name);
        tokio::spawn(Self::run(worker, receiver).instrument(span));

        Self { name, commands }
    }

    /// Worker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a start; failures are reported by the command loop
    pub fn start(&self) {
        self.enqueue(Command::Start);
    }

    /// Enqueue a restart; failures are reported by the command loop
    pub fn restart(&self) {
        self.enqueue(Command::Restart);
    }

    /// Stop the worker once every earlier command has run
    pub async fn stop(&self) -> Result<(), WorkerError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Stop(reply))
            .map_err(|_| WorkerError::Closed)?;
        outcome.await.map_err(|_| WorkerError::Closed)?
    }

    /// Close the worker and end its command loop
    pub async fn close(&self) -> Result<(), WorkerError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Close(reply))
            .map_err(|_| WorkerError::Closed)?;
        outcome.await.map_err(|_| WorkerError::Closed)?
    }

    fn enqueue(&self, command: Command) {
        let label = command.label();
        if self.commands.send(command).is_err() {
            error!(worker = %self.name, command = label, "Worker is closed, command dropped");
            metrics().worker_event(&self.name, WorkerEvent::Failed);
        }
    }

    async fn run(mut worker: Box<dyn Worker>, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            let label = command.label();
            debug!(worker = %worker.name(), command = label, "Running worker command");

            match command {
                Command::Start => {
                    let outcome = worker.start().await;
                    Self::report(worker.name(), label, WorkerEvent::Started, outcome);
                }
                Command::Restart => {
                    let outcome = worker.restart().await;
                    Self::report(worker.name(), label, WorkerEvent::Restarted, outcome);
                }
                Command::Stop(reply) => {
                    let outcome = worker.stop().await;
                    Self::count(worker.name(), WorkerEvent::Stopped, &outcome);
                    let _ = reply.send(outcome);
                }
                Command::Close(reply) => {
                    let outcome = worker.close().await;
                    Self::count(worker.name(), WorkerEvent::Closed, &outcome);
                    let _ = reply.send(outcome);
                    break;
                }
            }
        }

        debug!(worker = %worker.name(), "Worker command loop finished");
    }

    /// Log a fire-and-forget failure; nobody is waiting for the outcome
    fn report(name: &str, label: &str, success: WorkerEvent, outcome: Result<(), WorkerError>) {
        Self::count(name, success, &outcome);
        if let Err(e) = outcome {
            error!(worker = %name, command = label, error = %e, "Worker command failed");
        }
    }

    fn count(name: &str, success: WorkerEvent, outcome: &Result<(), WorkerError>) {
        let event = if outcome.is_ok() {
            success
        } else {
            WorkerEvent::Failed
        };
        metrics().worker_event(name, event);
    }
}
