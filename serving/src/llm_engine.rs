use std::collections::HashMap;

use metrics::counter;
use thiserror::Error;
use tokio::sync::{
    mpsc::{error::TryRecvError, UnboundedReceiver},
    oneshot, watch,
};
use tracing::{debug, error, info, info_span, instrument, trace, Span};

use crate::{
    llm_service::ShutdownPolicy,
    model_executor::ModelExecutor,
    policy::FcfsPolicy,
    scheduler::{RequestOutput, Scheduler, SchedulerError, SchedulerSnapshot},
    sequence::{FinishReason, Sequence},
};

/// A response streamed to the caller of a request.
///
/// Responses of one request are delivered in order: zero or more `Tokens`
/// followed by exactly one `Finished`.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamResponse {
    /// Newly generated tokens, in order
    Tokens(Vec<u32>),
    /// Terminal response
    Finished {
        /// Why the request finished
        reason: FinishReason,
        /// Error details, for engine errors and rejections
        message: Option<String>,
    },
}

/// `EngineCommand` - A command sent to the `LlmEngine` through its hand-off
/// channel, drained once per iteration.
#[derive(Debug)]
pub enum EngineCommand {
    /// Enqueues a new sequence, its outputs are streamed through `sender`
    Generate {
        sequence: Sequence,
        sender: flume::Sender<StreamResponse>,
    },
    /// Cancels a request, a no-op if the request already finished
    Cancel { request_id: String },
    /// Forks a running request into a new request sharing its KV cache blocks
    Fork {
        parent_request_id: String,
        child_sequence_id: u64,
        child_request_id: String,
        sender: flume::Sender<StreamResponse>,
        response: oneshot::Sender<Result<(), String>>,
    },
    /// Stops accepting requests and exits once every sequence finished
    Drain,
    /// Stops the engine, following the given policy for unfinished sequences
    Shutdown { policy: ShutdownPolicy },
}

/// `LlmEngine` - The scheduling loop.
///
/// It owns the `Scheduler` and the `ModelExecutor`, and is the only mutator of
/// the queues and of the KV cache block pool. It runs on a dedicated blocking
/// thread, and communicates with the `LlmService` only through its command
/// channel, per request output streams and a snapshot channel.
pub struct LlmEngine<M> {
    /// Instance of the `Scheduler` with a First-Come-First-Serve policy.
    scheduler: Scheduler<FcfsPolicy>,
    /// Runs each scheduled batch
    executor: M,
    /// Channel for receiving commands from the `LlmService`
    command_receiver: UnboundedReceiver<EngineCommand>,
    /// Output streams of the unfinished requests
    streams: HashMap<String, flume::Sender<StreamResponse>>,
    /// Publishes a scheduler snapshot after every iteration
    snapshot_sender: watch::Sender<SchedulerSnapshot>,
    /// Set once the engine stops accepting requests
    stopping: bool,
    /// Tracing span for logging and monitoring.
    span: Span,
}

impl<M> LlmEngine<M>
where
    M: ModelExecutor,
{
    /// Constructor
    pub fn new(
        scheduler: Scheduler<FcfsPolicy>,
        executor: M,
        command_receiver: UnboundedReceiver<EngineCommand>,
        snapshot_sender: watch::Sender<SchedulerSnapshot>,
    ) -> Self {
        Self {
            scheduler,
            executor,
            command_receiver,
            streams: HashMap::new(),
            snapshot_sender,
            stopping: false,
            span: info_span!("llm-engine"),
        }
    }

    /// Main loop of the `LlmEngine`.
    ///
    /// Each iteration:
    /// 1. Drains the pending commands, blocking on the channel while there is no
    ///    work left.
    /// 2. Cancels the requests whose caller dropped its stream.
    /// 3. Runs a scheduler step and streams the resulting outputs.
    /// 4. Publishes a snapshot of the scheduler state.
    ///
    /// The loop exits once it stopped accepting requests (drain, shutdown or a
    /// closed command channel) and every sequence finished. The block pool is
    /// released on exit. A scheduler error is fatal: every outstanding request
    /// receives an `EngineError` completion and the error is returned.
    #[instrument(skip_all)]
    pub fn run(mut self) -> Result<(), EngineError> {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Starting `LlmEngine` loop..");

        let result = self.run_loop();
        if let Err(e) = &result {
            error!("`LlmEngine` loop failed with error: {e}");
            self.fail_all_streams(&e.to_string());
        }

        if let Err(e) = self.scheduler.reset() {
            error!("Failed to release the block pool, with error: {e}");
        }
        self.publish_snapshot();
        info!("`LlmEngine` loop stopped");

        result
    }

    fn run_loop(&mut self) -> Result<(), EngineError> {
        loop {
            if !self.stopping && !self.scheduler.has_unfinished_sequences() {
                trace!("No work left, waiting for new commands..");
                match self.command_receiver.blocking_recv() {
                    Some(command) => self.handle_command(command)?,
                    None => self.stop_accepting(),
                }
            }

            loop {
                match self.command_receiver.try_recv() {
                    Ok(command) => self.handle_command(command)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.stop_accepting();
                        break;
                    }
                }
            }

            self.cancel_dropped_streams()?;

            if self.scheduler.has_unfinished_sequences() {
                let outputs = self.scheduler.step(&mut self.executor)?;
                self.deliver(outputs);
            } else if self.stopping {
                return Ok(());
            }

            self.publish_snapshot();
        }
    }

    /// Applies a command received from the `LlmService`
    #[instrument(skip_all)]
    fn handle_command(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        match command {
            EngineCommand::Generate { sequence, sender } => {
                let request_id = sequence.request_id().to_string();
                if self.stopping {
                    debug!("Refusing request with id = {request_id}, engine is stopping");
                    sender
                        .send(StreamResponse::Finished {
                            reason: FinishReason::Cancelled,
                            message: Some("engine is stopping".to_string()),
                        })
                        .ok();
                    return Ok(());
                }
                match self.scheduler.add_sequence(sequence) {
                    Ok(()) => {
                        trace!("Received new sequence for request with id = {request_id}");
                        self.streams.insert(request_id, sender);
                    }
                    Err(SchedulerError::AdmissionRejected { reason, .. }) => {
                        counter!("llm-service-requests-rejected-total").increment(1);
                        sender
                            .send(StreamResponse::Finished {
                                reason: FinishReason::AdmissionRejected,
                                message: Some(reason),
                            })
                            .ok();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            EngineCommand::Cancel { request_id } => {
                if let Some(output) = self.scheduler.abort_sequence(&request_id)? {
                    self.deliver(vec![output]);
                }
            }
            EngineCommand::Fork {
                parent_request_id,
                child_sequence_id,
                child_request_id,
                sender,
                response,
            } => {
                match self.scheduler.fork_sequence(
                    &parent_request_id,
                    child_sequence_id,
                    child_request_id.clone(),
                ) {
                    Ok(()) => {
                        self.streams.insert(child_request_id, sender);
                        response.send(Ok(())).ok();
                    }
                    Err(SchedulerError::CannotFork(reason)) => {
                        response.send(Err(reason)).ok();
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            EngineCommand::Drain => {
                info!("Draining `LlmEngine`, {} unfinished sequences", self.scheduler.num_unfinished_sequences());
                self.stop_accepting();
            }
            EngineCommand::Shutdown { policy } => {
                info!("Shutting down `LlmEngine` with policy {policy:?}");
                self.stop_accepting();
                if policy == ShutdownPolicy::Cancel {
                    let outputs = self.scheduler.abort_all()?;
                    self.deliver(outputs);
                }
            }
        }
        Ok(())
    }

    fn stop_accepting(&mut self) {
        if !self.stopping {
            debug!("`LlmEngine` stops accepting new requests");
            self.stopping = true;
        }
    }

    /// Cancels the requests whose caller dropped the output stream
    fn cancel_dropped_streams(&mut self) -> Result<(), EngineError> {
        let dropped = self
            .streams
            .iter()
            .filter(|(_, sender)| sender.is_disconnected())
            .map(|(request_id, _)| request_id.clone())
            .collect::<Vec<_>>();
        for request_id in dropped {
            debug!("Stream of request with id = {request_id} was dropped, cancelling it");
            self.scheduler.abort_sequence(&request_id)?;
            self.streams.remove(&request_id);
        }
        Ok(())
    }

    /// Streams request outputs to their callers
    fn deliver(&mut self, outputs: Vec<RequestOutput>) {
        for RequestOutput {
            request_id,
            new_token_ids,
            finish_reason,
            error,
        } in outputs
        {
            let Some(sender) = self.streams.get(&request_id) else {
                trace!("No stream for request with id = {request_id}");
                continue;
            };
            // A dropped receiver is cancelled on the next iteration
            if !new_token_ids.is_empty() {
                sender.send(StreamResponse::Tokens(new_token_ids)).ok();
            }
            if let Some(reason) = finish_reason {
                sender
                    .send(StreamResponse::Finished {
                        reason,
                        message: error,
                    })
                    .ok();
                self.streams.remove(&request_id);
            }
        }
    }

    fn fail_all_streams(&mut self, message: &str) {
        for (_, sender) in self.streams.drain() {
            sender
                .send(StreamResponse::Finished {
                    reason: FinishReason::EngineError,
                    message: Some(message.to_string()),
                })
                .ok();
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_sender.send_replace(self.scheduler.snapshot());
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Scheduler error: `{0}`")]
    SchedulerError(#[from] SchedulerError),
}
