use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, UnboundedSender},
        oneshot, watch,
    },
    task::{JoinError, JoinHandle},
};
use tracing::{error, info, info_span, instrument, trace, Span};

use crate::{
    config::{
        CacheConfig, CacheConfigError, SchedulerConfig, SchedulerConfigError, ServiceConfig,
        ServiceConfigError,
    },
    llm_engine::{EngineCommand, EngineError, LlmEngine, StreamResponse},
    model_executor::ModelExecutor,
    policy::FcfsPolicy,
    scheduler::{Scheduler, SchedulerError, SchedulerSnapshot},
    sequence::{Sequence, SequenceError},
    types::GenerateParameters,
    validation::{Validation, ValidationError},
};

/// What happens to the unfinished sequences on shutdown
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
    /// Unfinished sequences run to completion
    #[default]
    Drain,
    /// Unfinished sequences are cancelled
    Cancel,
}

/// `RequestHandle` - Handle of an admitted request, its outputs are streamed
/// through `receiver`
#[derive(Debug)]
pub struct RequestHandle {
    /// Request id, used to cancel or fork the request
    pub request_id: String,
    /// Output stream, dropping it cancels the request
    pub receiver: flume::Receiver<StreamResponse>,
}

/// `LlmService` - the entrypoint of the inference service.
///
/// It validates incoming requests, hands them over to the `LlmEngine` running
/// on a blocking thread, and owns the engine lifecycle (start, drain,
/// shutdown).
pub struct LlmService {
    /// Sender to communicate with the underlying `LlmEngine` running instance
    engine_sender: UnboundedSender<EngineCommand>,
    /// Join handle for the blocking task running the `LlmEngine` loop
    engine_handle: JoinHandle<Result<(), EngineError>>,
    /// Latest snapshot of the scheduler state
    snapshot_receiver: watch::Receiver<SchedulerSnapshot>,
    /// A request validation instance
    validation: Validation,
    /// Block size
    block_size: usize,
    /// Policy applied by `shutdown`
    shutdown_policy: ShutdownPolicy,
    /// Sequence id counter, request ids derive from it
    sequence_counter: AtomicU64,
    /// Starting time of the instance
    start_time: Instant,
    /// Tracing span
    span: Span,
}

impl LlmService {
    /// Starts the service, spawning the `LlmEngine` loop on a blocking thread.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip_all)]
    pub fn start<M>(
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
        service_config: ServiceConfig,
        executor: M,
    ) -> Result<Self, LlmServiceError>
    where
        M: ModelExecutor + Send + 'static,
    {
        let span = info_span!("llm-service");
        let _span = span.clone();
        let _enter = _span.enter();

        info!("Starting a new `LlmService` instance..");

        let block_size = cache_config.block_size();
        let validation = Validation::new(
            service_config.max_stop_sequences(),
            scheduler_config.max_model_len(),
            service_config.default_max_new_tokens(),
            block_size,
            cache_config.num_gpu_blocks(),
        );
        let scheduler = Scheduler::<FcfsPolicy>::new(cache_config, scheduler_config)?;

        let (engine_sender, command_receiver) = mpsc::unbounded_channel();
        let (snapshot_sender, snapshot_receiver) = watch::channel(scheduler.snapshot());
        let engine_handle = tokio::task::spawn_blocking(move || {
            LlmEngine::new(scheduler, executor, command_receiver, snapshot_sender).run()
        });

        Ok(Self {
            engine_sender,
            engine_handle,
            snapshot_receiver,
            validation,
            block_size,
            shutdown_policy: service_config.shutdown_policy(),
            sequence_counter: AtomicU64::new(0),
            start_time: Instant::now(),
            span,
        })
    }

    /// Starts the service from the `[cache]`, `[scheduler]` and `[service]`
    /// tables of a configuration file
    pub fn start_from_file_path<M, P>(path: P, executor: M) -> Result<Self, LlmServiceError>
    where
        M: ModelExecutor + Send + 'static,
        P: AsRef<Path>,
    {
        let cache_config = CacheConfig::from_file_path(path.as_ref())?;
        let scheduler_config = SchedulerConfig::from_file_path(path.as_ref())?;
        let service_config = ServiceConfig::from_file_path(path.as_ref())?;
        Self::start(cache_config, scheduler_config, service_config, executor)
    }

    /// Validates a new request and hands it over to the engine.
    ///
    /// # Errors
    ///
    /// `LlmServiceError::AdmissionRejected` if the prompt and its first generated
    /// token can never fit the KV cache pool, `LlmServiceError::ValidationError` for invalid parameters.
    /// No sequence is created in either case.
    #[instrument(skip_all)]
    pub fn new_request(
        &self,
        prompt_token_ids: Vec<u32>,
        parameters: GenerateParameters,
    ) -> Result<RequestHandle, LlmServiceError> {
        let _enter = self.span.enter();
        let arrival_time = Instant::now();

        let valid_request = match self.validation.validate(prompt_token_ids, parameters) {
            Ok(valid_request) => valid_request,
            Err(e @ ValidationError::AdmissionRejected { .. }) => {
                info!("Rejecting request: {e}");
                counter!("llm-service-requests-rejected-total").increment(1);
                return Err(LlmServiceError::AdmissionRejected(e.to_string()));
            }
            Err(e) => {
                error!("Failed to validate request, with error: {e}");
                return Err(e.into());
            }
        };

        let sequence_id = self.sequence_counter.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("{sequence_id:016x}");
        let sequence = Sequence::new(
            sequence_id,
            request_id.clone(),
            valid_request.prompt_token_ids,
            self.block_size,
            arrival_time,
            valid_request.parameters,
            valid_request.stopping_parameters,
        )?;

        let (sender, receiver) = flume::unbounded();
        self.send(EngineCommand::Generate { sequence, sender })?;
        counter!("llm-service-requests-total").increment(1);
        info!(
            request_id = %request_id,
            input_token_len = valid_request.input_token_len,
            "Received and validated new request"
        );

        Ok(RequestHandle {
            request_id,
            receiver,
        })
    }

    /// Cancels a request. Cancelling an unknown or finished request is a no-op.
    #[instrument(skip_all)]
    pub fn cancel(&self, request_id: &str) -> Result<(), LlmServiceError> {
        let _enter = self.span.enter();
        trace!("Cancelling request with id = {request_id}");
        self.send(EngineCommand::Cancel {
            request_id: request_id.to_string(),
        })
    }

    /// Forks a running request, the new request shares the KV cache blocks of
    /// its parent and continues the generation on its own.
    #[instrument(skip_all)]
    pub async fn fork_request(&self, request_id: &str) -> Result<RequestHandle, LlmServiceError> {
        let child_sequence_id = self.sequence_counter.fetch_add(1, Ordering::Relaxed);
        let child_request_id = format!("{child_sequence_id:016x}");
        let (sender, receiver) = flume::unbounded();
        let (response_sender, response_receiver) = oneshot::channel();
        self.send(EngineCommand::Fork {
            parent_request_id: request_id.to_string(),
            child_sequence_id,
            child_request_id: child_request_id.clone(),
            sender,
            response: response_sender,
        })?;

        match response_receiver.await {
            Ok(Ok(())) => Ok(RequestHandle {
                request_id: child_request_id,
                receiver,
            }),
            Ok(Err(reason)) => {
                error!("Failed to fork request with id = {request_id}: {reason}");
                Err(LlmServiceError::CannotFork(reason))
            }
            Err(_) => Err(LlmServiceError::EngineStopped),
        }
    }

    /// Latest snapshot of the scheduler state, taken between two iterations
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshot_receiver.borrow().clone()
    }

    /// Subscribes to the scheduler snapshots, published after every iteration
    pub fn subscribe_snapshots(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshot_receiver.clone()
    }

    /// Stops accepting requests, waits for every unfinished sequence to
    /// complete and stops the engine
    #[instrument(skip_all)]
    pub async fn drain(self) -> Result<(), LlmServiceError> {
        info!("Draining the `LlmService` instance..");
        self.send(EngineCommand::Drain)?;
        self.join().await
    }

    /// Stops the service, following the configured `ShutdownPolicy`
    pub async fn shutdown(self) -> Result<(), LlmServiceError> {
        let policy = self.shutdown_policy;
        self.shutdown_with_policy(policy).await
    }

    /// Stops the service, following `policy` for the unfinished sequences.
    /// The block pool is released once the engine stopped.
    #[instrument(skip_all)]
    pub async fn shutdown_with_policy(self, policy: ShutdownPolicy) -> Result<(), LlmServiceError> {
        info!("Shutting down the `LlmService` instance with policy {policy:?}..");
        self.send(EngineCommand::Shutdown { policy })?;
        self.join().await
    }

    async fn join(self) -> Result<(), LlmServiceError> {
        let result = match self.engine_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("`LlmEngine` failed, with error: {e}");
                Err(LlmServiceError::EngineError(e))
            }
            Err(e) => {
                error!("Failed to join the `LlmEngine` task: {e}");
                Err(LlmServiceError::JoinError(e))
            }
        };
        info!(
            "`LlmService` stopped, running time: {:?}",
            self.start_time.elapsed()
        );
        result
    }

    fn send(&self, command: EngineCommand) -> Result<(), LlmServiceError> {
        self.engine_sender.send(command).map_err(|_| {
            error!("Could not send command to the `LlmEngine`, it stopped");
            LlmServiceError::EngineStopped
        })
    }
}

#[derive(Debug, Error)]
pub enum LlmServiceError {
    #[error("Admission rejected: `{0}`")]
    AdmissionRejected(String),
    #[error("Validation error: `{0}`")]
    ValidationError(#[from] ValidationError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Scheduler error: `{0}`")]
    SchedulerError(#[from] SchedulerError),
    #[error("Engine error: `{0}`")]
    EngineError(#[from] EngineError),
    #[error("Cache config error: `{0}`")]
    CacheConfigError(#[from] CacheConfigError),
    #[error("Scheduler config error: `{0}`")]
    SchedulerConfigError(#[from] SchedulerConfigError),
    #[error("Service config error: `{0}`")]
    ServiceConfigError(#[from] ServiceConfigError),
    #[error("Cannot fork request: `{0}`")]
    CannotFork(String),
    #[error("Engine stopped")]
    EngineStopped,
    #[error("Join error: `{0}`")]
    JoinError(#[from] JoinError),
}
