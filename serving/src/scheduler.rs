use std::{
    collections::{HashMap, HashSet, VecDeque},
    marker::PhantomData,
    time::Instant,
};

use crate::{
    batch::{
        BatchBuilder, BatchBuilderError, BatchBuilderOutputs, BatchDescriptor, Candidate,
        Residency, ScheduledSequence, SchedulingBudget,
    },
    block::{num_blocks_for_tokens, BlockId},
    block_manager::{BlockSpaceManager, BlockSpaceManagerError},
    config::{CacheConfig, ExecutionContext, SchedulerConfig, SchedulerConfigError},
    model_executor::ModelExecutor,
    policy::Policy,
    sequence::{FinishReason, Sequence, SequenceError, SequenceOutput, SequenceStatus},
};
use metrics::{counter, gauge, histogram};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, info_span, instrument, trace, warn, Span};

/// Preemption modes.
///
/// 1. `Swap`: Swap out the blocks of the preempted sequences to CPU memory
///     and swap them back in when the sequences are resumed. Falls back to
///     recomputation when the CPU pool cannot hold the block table.
/// 2. `Recomputation`: Discard the blocks of the preempted sequences and
///     recompute them when the sequences are resumed, treating the sequences as
///     new prompts (prompt and generated tokens).
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PreemptionMode {
    Swap,
    #[default]
    Recomputation,
}

/// Output of one request, produced by a scheduling iteration.
///
/// `new_token_ids` are the tokens appended to the sequence during the
/// iteration, in order. `finish_reason` is set once the request reached a
/// terminal state, in which case no further output follows.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOutput {
    /// Request id
    pub request_id: String,
    /// Newly generated tokens
    pub new_token_ids: Vec<u32>,
    /// Terminal reason, if the request finished
    pub finish_reason: Option<FinishReason>,
    /// Error message, for `EngineError` completions
    pub error: Option<String>,
}

impl RequestOutput {
    /// Terminal output carrying no new tokens
    pub fn finished(request_id: String, finish_reason: FinishReason, error: Option<String>) -> Self {
        Self {
            request_id,
            new_token_ids: vec![],
            finish_reason: Some(finish_reason),
            error,
        }
    }

    /// Checks if the request reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }
}

/// `SchedulerOutputs` - The scheduling decision made from a scheduler.
#[derive(Debug)]
pub struct SchedulerOutputs {
    /// The batch to execute
    pub batch: BatchDescriptor,
    /// Scheduled sequences, in batch order
    pub scheduled: Vec<ScheduledSequence>,
    /// Terminal outputs of the sequences rejected while scheduling
    pub rejected: Vec<RequestOutput>,
    /// Sequences swapped out by this iteration
    pub swapped_out: Vec<u64>,
    /// Sequences whose copy-on-write block copies are part of this iteration
    pub copied: Vec<u64>,
    /// Number of scheduled sequences in the prefill stage
    pub num_prefill_sequences: usize,
    /// Number of sequences preempted by this iteration
    pub num_preempted: usize,
    /// The number of requests in the running queue
    pub running_queue_size: usize,
}

impl SchedulerOutputs {
    /// Checks if there is no work for the engine
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Ids of every sequence whose KV cache state depends on this iteration
    fn affected_sequence_ids(&self) -> Vec<u64> {
        let mut seen = HashSet::new();
        self.scheduled
            .iter()
            .map(|s| s.sequence_id)
            .chain(self.swapped_out.iter().copied())
            .chain(self.copied.iter().copied())
            .filter(|sequence_id| seen.insert(*sequence_id))
            .collect()
    }
}

/// A consistent view of the scheduler state, taken between iterations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerSnapshot {
    /// Number of sequences in the waiting queue
    pub num_waiting: usize,
    /// Number of sequences in the running queue
    pub num_running: usize,
    /// Number of sequences in the preempted queue
    pub num_preempted: usize,
    /// Number of free GPU blocks
    pub num_free_gpu_blocks: usize,
    /// Total number of GPU blocks
    pub num_total_gpu_blocks: usize,
    /// Number of free CPU blocks
    pub num_free_cpu_blocks: usize,
    /// Total number of CPU blocks
    pub num_total_cpu_blocks: usize,
    /// Number of preemptions since start
    pub num_cumulative_preemption: usize,
}

/// A copy-on-write block copy, to be performed by the next engine call
#[derive(Clone, Copy, Debug)]
struct BlockCopy {
    sequence_id: u64,
    source: BlockId,
    destination: BlockId,
}

/// `Scheduler` - Responsible for managing the scheduling and execution of inference requests
///
/// The Scheduler handles the lifecycle of every `Sequence`, including:
/// - Queueing new requests
/// - Allocating GPU/CPU memory resources
/// - Scheduling prefill (initial prompt processing) and decoding steps
/// - Managing preemption and swapping of sequences between GPU and CPU
/// - Committing the engine results and releasing finished sequences
///
/// It is the sole owner of the queues and of the `BlockSpaceManager`, and must
/// be driven from a single thread.
#[derive(Debug)]
pub struct Scheduler<P> {
    /// Cache configuration
    pub(crate) cache_config: CacheConfig,
    /// `Scheduler` configuration
    pub(crate) scheduler_config: SchedulerConfig,
    /// `BlockSpaceManager` to handle block resources efficiently
    block_manager: BlockSpaceManager,
    /// Packs the candidates of each iteration into a batch
    batch_builder: BatchBuilder,
    /// Devices and data type attached to every batch
    context: ExecutionContext,
    /// Queue of sequences waiting to be scheduled
    waiting: VecDeque<Sequence>,
    /// Queue of sequences currently owning GPU blocks
    running: VecDeque<Sequence>,
    /// Queue of sequences evicted mid-generation
    preempted: VecDeque<Sequence>,
    /// Copy-on-write copies produced by the last commit
    pending_copies: Vec<BlockCopy>,
    /// Sequences of the batch currently executed by the engine
    in_flight: HashSet<u64>,
    /// In flight sequences cancelled while the engine runs
    pending_cancellations: HashSet<u64>,
    /// Time at previous scheduling step
    previous_time: Instant,
    /// Tracks if a prompt was scheduled in the previous step, used for latency calculations
    previous_prompt: bool,
    /// Duration of the last prompt processing, used for scheduling heuristics
    last_prompt_latency: f32,
    /// Total number of times sequences have been preempted, used for logging/monitoring
    num_cumulative_preemption: usize,
    /// Generic parameter for the scheduling policy
    _phantom: PhantomData<P>,
    /// Tracing span
    span: Span,
}

impl<P> Scheduler<P> {
    /// Constructor
    pub fn new(
        cache_config: CacheConfig,
        scheduler_config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if scheduler_config.preemption_mode() == PreemptionMode::Swap
            && cache_config.num_cpu_blocks() == 0
        {
            error!("Swap preemption requires a non empty CPU block pool");
            return Err(SchedulerError::SwapWithoutCpuBlocks);
        }
        let context = ExecutionContext::new(&cache_config, &scheduler_config)?;

        Ok(Self {
            block_manager: BlockSpaceManager::new(
                cache_config.block_size(),
                cache_config.num_cpu_blocks(),
                cache_config.num_gpu_blocks(),
            ),
            batch_builder: BatchBuilder::new(
                scheduler_config.max_model_len(),
                scheduler_config.enable_chunked_prefill(),
            ),
            context,
            cache_config,
            scheduler_config,
            waiting: VecDeque::new(),
            running: VecDeque::new(),
            preempted: VecDeque::new(),
            pending_copies: vec![],
            in_flight: HashSet::new(),
            pending_cancellations: HashSet::new(),
            previous_time: Instant::now(),
            previous_prompt: false,
            last_prompt_latency: 0.0,
            num_cumulative_preemption: 0,
            span: info_span!("scheduler"),
            _phantom: PhantomData,
        })
    }

    /// Adds a new sequence to the waiting queue.
    ///
    /// # Errors
    ///
    /// `SchedulerError::AdmissionRejected` if the prompt and its first generated
    /// token need more blocks than the GPU pool holds, or if the prompt reaches
    /// the maximum model length. The block
    /// pool is left untouched.
    #[instrument(skip_all)]
    pub fn add_sequence(&mut self, sequence: Sequence) -> Result<(), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        // The prompt and its first generated token
        let num_required_blocks =
            num_blocks_for_tokens(sequence.length() + 1, self.cache_config.block_size());
        let num_total_blocks = self.block_manager.get_num_total_gpu_blocks();
        if num_required_blocks > num_total_blocks {
            info!(
                "Rejecting request with id = {}, prompt requires {num_required_blocks} blocks but the pool holds {num_total_blocks}",
                sequence.request_id()
            );
            return Err(SchedulerError::AdmissionRejected {
                request_id: sequence.request_id().to_string(),
                reason: format!(
                    "prompt requires {num_required_blocks} blocks but the pool holds {num_total_blocks}"
                ),
            });
        }
        if sequence.length() >= self.scheduler_config.max_model_len() {
            info!(
                "Rejecting request with id = {}, prompt reaches the maximum model length",
                sequence.request_id()
            );
            return Err(SchedulerError::AdmissionRejected {
                request_id: sequence.request_id().to_string(),
                reason: format!(
                    "prompt length {} reaches the maximum model length {}",
                    sequence.length(),
                    self.scheduler_config.max_model_len()
                ),
            });
        }

        debug!(
            "Adding sequence with id = {} for request with id = {}",
            sequence.sequence_id(),
            sequence.request_id()
        );
        self.waiting.push_back(sequence);
        Ok(())
    }

    /// Aborts the sequence of the request with the given id.
    ///
    /// Waiting, preempted and running sequences are cancelled right away, and
    /// their blocks released. A sequence that is part of the batch currently
    /// executed by the engine is cancelled when the batch is committed, after
    /// its token of this iteration is delivered.
    ///
    /// # Returns
    ///
    /// The terminal `Cancelled` output if the sequence was cancelled right away,
    /// `None` if the request is unknown, already finished, or in flight. Aborting
    /// twice is therefore a no-op.
    #[instrument(skip_all)]
    pub fn abort_sequence(
        &mut self,
        request_id: &str,
    ) -> Result<Option<RequestOutput>, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        debug!("Aborting request with id = {request_id}..");

        if let Some(sequence) = self.running.iter().find(|s| s.request_id() == request_id) {
            if self.in_flight.contains(&sequence.sequence_id()) {
                trace!("Request with id = {request_id} is in flight, cancelling on commit");
                self.pending_cancellations.insert(sequence.sequence_id());
                return Ok(None);
            }
        }

        let sequence = remove_by_request_id(&mut self.waiting, request_id)
            .or_else(|| remove_by_request_id(&mut self.running, request_id))
            .or_else(|| remove_by_request_id(&mut self.preempted, request_id));
        let Some(mut sequence) = sequence else {
            trace!("Request with id = {request_id} is unknown or already finished");
            return Ok(None);
        };

        self.finish_sequence(&mut sequence, SequenceStatus::Cancelled, Instant::now())?;
        self.update_gauges();
        Ok(Some(RequestOutput::finished(
            request_id.to_string(),
            FinishReason::Cancelled,
            None,
        )))
    }

    /// Cancels every unfinished sequence, releasing their blocks
    #[instrument(skip_all)]
    pub fn abort_all(&mut self) -> Result<Vec<RequestOutput>, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let now = Instant::now();
        let sequences = self
            .waiting
            .drain(..)
            .chain(self.running.drain(..))
            .chain(self.preempted.drain(..))
            .collect::<Vec<_>>();
        info!("Aborting {} unfinished sequences", sequences.len());

        let mut outputs = Vec::with_capacity(sequences.len());
        for mut sequence in sequences {
            self.finish_sequence(&mut sequence, SequenceStatus::Cancelled, now)?;
            outputs.push(RequestOutput::finished(
                sequence.request_id().to_string(),
                FinishReason::Cancelled,
                None,
            ));
        }
        self.in_flight.clear();
        self.pending_cancellations.clear();
        self.update_gauges();
        Ok(outputs)
    }

    /// Forks a running sequence, the child shares every KV cache block of the
    /// parent and continues the generation independently.
    ///
    /// # Errors
    ///
    /// `SchedulerError::CannotFork` if the parent is not running on the GPU, is
    /// part of the batch in flight, or if the running queue is full.
    #[instrument(skip_all)]
    pub fn fork_sequence(
        &mut self,
        parent_request_id: &str,
        child_sequence_id: u64,
        child_request_id: String,
    ) -> Result<(), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        if self.running.len() >= self.scheduler_config.max_num_sequences() {
            error!("Cannot fork request with id = {parent_request_id}, running queue is full");
            return Err(SchedulerError::CannotFork(format!(
                "{parent_request_id}: running queue is full"
            )));
        }
        // Preempted sequences arrived before the child and are resumed first
        if !self.preempted.is_empty() {
            error!(
                "Cannot fork request with id = {parent_request_id}, {} sequences are preempted",
                self.preempted.len()
            );
            return Err(SchedulerError::CannotFork(format!(
                "{parent_request_id}: preempted sequences are pending"
            )));
        }
        let Some(parent) = self
            .running
            .iter()
            .find(|s| s.request_id() == parent_request_id)
        else {
            error!("Cannot fork request with id = {parent_request_id}, it is not running");
            return Err(SchedulerError::CannotFork(format!(
                "{parent_request_id}: not running"
            )));
        };
        if self.in_flight.contains(&parent.sequence_id()) {
            error!("Cannot fork request with id = {parent_request_id}, it is in flight");
            return Err(SchedulerError::CannotFork(format!(
                "{parent_request_id}: in flight"
            )));
        }

        self.block_manager
            .fork(parent.sequence_id(), child_sequence_id)?;
        let child = parent.fork(child_sequence_id, child_request_id, Instant::now());
        debug!(
            "Forked request with id = {parent_request_id} into request with id = {}",
            child.request_id()
        );
        self.running.push_back(child);
        Ok(())
    }

    /// Checks if there are any unfinished sequences
    pub fn has_unfinished_sequences(&self) -> bool {
        !self.waiting.is_empty() || !self.running.is_empty() || !self.preempted.is_empty()
    }

    /// Number of unfinished sequences
    pub fn num_unfinished_sequences(&self) -> usize {
        self.waiting.len() + self.running.len() + self.preempted.len()
    }

    /// A consistent snapshot of the queues and of the block pools
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            num_waiting: self.waiting.len(),
            num_running: self.running.len(),
            num_preempted: self.preempted.len(),
            num_free_gpu_blocks: self.block_manager.get_number_of_free_gpu_blocks(),
            num_total_gpu_blocks: self.block_manager.get_num_total_gpu_blocks(),
            num_free_cpu_blocks: self.block_manager.get_number_of_free_cpu_blocks(),
            num_total_cpu_blocks: self.block_manager.get_num_total_cpu_blocks(),
            num_cumulative_preemption: self.num_cumulative_preemption,
        }
    }

    /// Drops every sequence and releases both block pools
    #[instrument(skip_all)]
    pub fn reset(&mut self) -> Result<(), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        info!("Resetting scheduler, releasing the block pool");
        self.waiting.clear();
        self.running.clear();
        self.preempted.clear();
        self.pending_copies.clear();
        self.in_flight.clear();
        self.pending_cancellations.clear();
        self.block_manager.reset()?;
        self.update_gauges();
        Ok(())
    }

    /// Moves a sequence to a terminal state and releases its blocks
    fn finish_sequence(
        &mut self,
        sequence: &mut Sequence,
        status: SequenceStatus,
        now: Instant,
    ) -> Result<(), SchedulerError> {
        sequence.set_sequence_status(status)?;
        sequence.set_finished_time(now);
        self.release(sequence.sequence_id())
    }

    /// Releases the blocks of a sequence, with its pending block copies
    fn release(&mut self, sequence_id: u64) -> Result<(), SchedulerError> {
        self.block_manager.free(sequence_id)?;
        self.pending_copies
            .retain(|copy| copy.sequence_id != sequence_id);
        Ok(())
    }

    fn update_gauges(&self) {
        gauge!("scheduler-free-gpu-blocks")
            .set(self.block_manager.get_number_of_free_gpu_blocks() as f64);
        gauge!("scheduler-running-sequences").set(self.running.len() as f64);
        gauge!("scheduler-waiting-sequences").set(self.waiting.len() as f64);
        gauge!("scheduler-preempted-sequences").set(self.preempted.len() as f64);
    }
}

impl<P: Policy> Scheduler<P> {
    /// Schedules the next iteration.
    ///
    /// 1. Sorts the running queue by priority and preempts its lowest priority
    ///    sequences (the latest arrivals) until the GPU pool can hold the next
    ///    token of every running sequence.
    /// 2. Builds the candidates: running sequences first, then preempted ones in
    ///    arrival order, then waiting ones. Waiting sequences are only considered
    ///    when nothing is preempted and the prompt delay has passed.
    /// 3. Builds the batch with the `BatchBuilder`, and moves every sequence
    ///    back to its queue.
    ///
    /// The scheduled sequences stay in flight until `process_outputs` or
    /// `fail_batch` is called with the returned outputs.
    #[instrument(skip_all)]
    pub fn schedule(&mut self) -> Result<SchedulerOutputs, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        trace!("Scheduling..");
        let now = Instant::now();

        P::sort_by_priority(now, &mut self.running);
        let mut blocks_to_swap_out = HashMap::new();
        let mut swapped_out = vec![];
        let mut newly_preempted = vec![];
        while self.running_blocks_demand()? > self.block_manager.get_number_of_free_gpu_blocks() {
            let Some(victim) = self.running.pop_back() else {
                break;
            };
            let (victim, preemption_mode) = self.preempt(victim, &mut blocks_to_swap_out)?;
            if preemption_mode == PreemptionMode::Swap {
                swapped_out.push(victim.sequence_id());
            }
            newly_preempted.push(victim);
        }

        let passed_delay = self.passed_delay(now);
        let admit_waiting = passed_delay && self.preempted.is_empty() && newly_preempted.is_empty();

        let mut budget = SchedulingBudget::new(
            self.scheduler_config.max_num_batched_tokens(),
            self.scheduler_config.max_num_sequences(),
        );
        let mut candidates =
            Vec::with_capacity(self.running.len() + self.preempted.len() + self.waiting.len());
        for sequence in self.running.drain(..) {
            budget.add_number_sequences(sequence.sequence_id(), 1);
            candidates.push(Candidate::new(sequence, Residency::Resident));
        }
        P::sort_by_priority(now, &mut self.preempted);
        for sequence in self.preempted.drain(..) {
            let residency = if self.block_manager.is_swapped(sequence.sequence_id()) {
                Residency::Swapped
            } else {
                Residency::Unallocated
            };
            candidates.push(Candidate::new(sequence, residency));
        }
        if admit_waiting {
            P::sort_by_priority(now, &mut self.waiting);
            for sequence in self.waiting.drain(..) {
                candidates.push(Candidate::new(sequence, Residency::Unallocated));
            }
        }

        let BatchBuilderOutputs {
            mut batch,
            scheduled,
            admitted,
            deferred,
            rejected,
        } = self.batch_builder.build(
            candidates,
            &mut budget,
            &mut self.block_manager,
            self.context.clone(),
        )?;

        batch.blocks_to_swap_out = blocks_to_swap_out;
        let copied = self
            .pending_copies
            .iter()
            .map(|copy| copy.sequence_id)
            .collect();
        batch.blocks_to_copy = self
            .pending_copies
            .drain(..)
            .map(|copy| (copy.source, copy.destination))
            .collect();

        let mut num_prefill_sequences = 0;
        for Candidate {
            mut sequence,
            residency,
        } in admitted
        {
            if sequence.is_prefill() {
                num_prefill_sequences += 1;
            }
            if residency != Residency::Resident {
                sequence.set_sequence_status(SequenceStatus::Running)?;
                if let Some(time_in_queue) = sequence.maybe_set_first_scheduled_time(now) {
                    histogram!("sequence-time-in-queue").record(time_in_queue.as_secs_f64());
                }
            }
            self.in_flight.insert(sequence.sequence_id());
            self.running.push_back(sequence);
        }

        for Candidate {
            sequence,
            residency,
        } in deferred
        {
            match (residency, sequence.get_sequence_status()) {
                (Residency::Resident, _) => self.running.push_back(sequence),
                (_, SequenceStatus::Waiting) => self.waiting.push_back(sequence),
                _ => self.preempted.push_back(sequence),
            }
        }

        let mut rejected_outputs = Vec::with_capacity(rejected.len());
        for Candidate { mut sequence, .. } in rejected {
            info!(
                "Sequence with id = {} for request with id = {} can never be scheduled, finishing it",
                sequence.sequence_id(),
                sequence.request_id()
            );
            self.finish_sequence(
                &mut sequence,
                SequenceStatus::Finished(FinishReason::LengthCapped),
                now,
            )?;
            rejected_outputs.push(RequestOutput::finished(
                sequence.request_id().to_string(),
                FinishReason::LengthCapped,
                None,
            ));
        }

        let num_preempted = newly_preempted.len();
        self.preempted.extend(newly_preempted);
        self.previous_prompt = num_prefill_sequences > 0;
        self.update_gauges();

        trace!(
            "Scheduled {} sequences ({num_prefill_sequences} prefills), {num_preempted} preempted",
            scheduled.len()
        );

        Ok(SchedulerOutputs {
            batch,
            scheduled,
            rejected: rejected_outputs,
            swapped_out,
            copied,
            num_prefill_sequences,
            num_preempted,
            running_queue_size: self.running.len(),
        })
    }

    /// Commits the engine results of a batch.
    ///
    /// For every scheduled sequence, the computed tokens are accounted for and, if
    /// a token was sampled, the block table is extended to hold it before it is
    /// appended. Stop conditions are evaluated right after. Finished and cancelled
    /// sequences leave the running queue and release their blocks.
    ///
    /// A sequence the engine reports as failed (or for which the engine returned no
    /// token) finishes with `FinishReason::EngineError`.
    ///
    /// # Errors
    ///
    /// Failing to extend a block table is a broken invariant, since capacity was
    /// reserved while scheduling, and is returned as an error.
    #[instrument(skip_all)]
    pub fn process_outputs(
        &mut self,
        outputs: &SchedulerOutputs,
        results: Vec<SequenceOutput>,
    ) -> Result<Vec<RequestOutput>, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let now = Instant::now();
        let max_model_len = self.scheduler_config.max_model_len();
        let block_size = self.block_manager.block_size();
        let num_total_gpu_blocks = self.block_manager.get_num_total_gpu_blocks();
        let results = results
            .into_iter()
            .map(|result| (result.sequence_id, result))
            .collect::<HashMap<_, _>>();

        let mut request_outputs = vec![];
        let mut finished = vec![];
        for scheduled in outputs.scheduled.iter() {
            let sequence_id = scheduled.sequence_id;
            let sequence = self
                .running
                .iter_mut()
                .find(|s| s.sequence_id() == sequence_id)
                .ok_or_else(|| {
                    error!("Missing scheduled sequence with id = {sequence_id}");
                    SchedulerError::MissingScheduledSequence(sequence_id)
                })?;
            sequence.update_num_computed_tokens(scheduled.token_chunk_size)?;

            let result = results.get(&sequence_id);
            let mut new_token_ids = vec![];
            let mut finish_reason = None;
            let mut error_message = None;
            if result.map(|r| !r.success).unwrap_or(false) {
                error!("Engine failed to process sequence with id = {sequence_id}");
                finish_reason = Some(FinishReason::EngineError);
                error_message = Some("Engine failed to process the sequence".to_string());
            } else if scheduled.do_sample {
                match result {
                    Some(result) => {
                        let length = sequence.length();
                        if let Some((source, destination)) =
                            self.block_manager
                                .append_slots(sequence_id, length, length + 1)?
                        {
                            self.pending_copies.push(BlockCopy {
                                sequence_id,
                                source,
                                destination,
                            });
                        }
                        sequence.add_token_id(result.output_token, result.logprob);
                        new_token_ids.push(result.output_token);
                        if let Some(time_to_first_token) = sequence.maybe_set_first_token_time(now)
                        {
                            histogram!("sequence-time-to-first-token")
                                .record(time_to_first_token.as_secs_f64());
                        }

                        finish_reason = sequence.check_stop(result.is_stop_token, max_model_len);
                        // The next token could never fit the pool
                        if finish_reason.is_none()
                            && num_blocks_for_tokens(sequence.length() + 1, block_size)
                                > num_total_gpu_blocks
                        {
                            finish_reason = Some(FinishReason::LengthCapped);
                        }
                    }
                    None => {
                        error!("Missing engine output for sequence with id = {sequence_id}");
                        finish_reason = Some(FinishReason::EngineError);
                        error_message = Some("Missing engine output for the sequence".to_string());
                    }
                }
            }

            let cancelled = self.pending_cancellations.remove(&sequence_id);
            let status = match finish_reason {
                Some(reason) => Some(SequenceStatus::Finished(reason)),
                None if cancelled => {
                    finish_reason = Some(FinishReason::Cancelled);
                    Some(SequenceStatus::Cancelled)
                }
                None => None,
            };
            if let Some(status) = status {
                finished.push((sequence_id, status));
            }

            if !new_token_ids.is_empty() || finish_reason.is_some() {
                request_outputs.push(RequestOutput {
                    request_id: scheduled.request_id.clone(),
                    new_token_ids,
                    finish_reason,
                    error: error_message,
                });
            }
        }
        self.in_flight.clear();
        self.pending_cancellations.clear();

        for (sequence_id, status) in finished {
            if let Some(mut sequence) = remove_by_sequence_id(&mut self.running, sequence_id) {
                debug!("Sequence with id = {sequence_id} finished with {status:?}");
                self.finish_sequence(&mut sequence, status, now)?;
            }
        }
        self.update_gauges();

        Ok(request_outputs)
    }

    /// Fails every sequence depending on a batch the engine could not execute.
    ///
    /// Scheduled sequences, as well as the sequences swapped out or copied by the
    /// batch, finish with `FinishReason::EngineError` and release their blocks.
    /// Nothing is retried.
    #[instrument(skip_all)]
    pub fn fail_batch(
        &mut self,
        outputs: &SchedulerOutputs,
        error_message: &str,
    ) -> Result<Vec<RequestOutput>, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        error!("Engine failed to execute batch: {error_message}");
        let now = Instant::now();

        let mut request_outputs = vec![];
        for sequence_id in outputs.affected_sequence_ids() {
            let sequence = remove_by_sequence_id(&mut self.running, sequence_id)
                .or_else(|| remove_by_sequence_id(&mut self.preempted, sequence_id));
            if let Some(mut sequence) = sequence {
                self.finish_sequence(
                    &mut sequence,
                    SequenceStatus::Finished(FinishReason::EngineError),
                    now,
                )?;
                request_outputs.push(RequestOutput::finished(
                    sequence.request_id().to_string(),
                    FinishReason::EngineError,
                    Some(error_message.to_string()),
                ));
            }
        }
        self.in_flight.clear();
        self.pending_cancellations.clear();
        self.update_gauges();

        Ok(request_outputs)
    }

    /// Runs a full iteration: schedule, execute the batch on `executor` and
    /// commit its results (or fail the batch).
    #[instrument(skip_all)]
    pub fn step<M: ModelExecutor>(
        &mut self,
        executor: &mut M,
    ) -> Result<Vec<RequestOutput>, SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut outputs = self.schedule()?;
        let mut request_outputs = std::mem::take(&mut outputs.rejected);
        if outputs.is_empty() {
            return Ok(request_outputs);
        }

        let start = Instant::now();
        match executor.execute(&outputs.batch) {
            Ok(results) => {
                histogram!("llm-engine-step-time").record(start.elapsed().as_secs_f64());
                request_outputs.extend(self.process_outputs(&outputs, results)?);
            }
            Err(e) => {
                request_outputs.extend(self.fail_batch(&outputs, &e.to_string())?);
            }
        }
        Ok(request_outputs)
    }

    /// Number of GPU blocks the running sequences need to append their next token
    fn running_blocks_demand(&self) -> Result<usize, SchedulerError> {
        self.running
            .iter()
            .try_fold(0, |acc, sequence| -> Result<usize, SchedulerError> {
                let length = sequence.length();
                Ok(acc
                    + self.block_manager.num_required_blocks(
                        sequence.sequence_id(),
                        length,
                        length + 1,
                    )?)
            })
    }

    /// Preempts a running sequence, either by swapping its blocks out to the CPU
    /// pool or by releasing them so that it gets recomputed later.
    ///
    /// Swapping is used when configured and the CPU pool can hold the block
    /// table, recomputation otherwise. No generated token is lost either way.
    #[instrument(skip_all)]
    fn preempt(
        &mut self,
        mut sequence: Sequence,
        blocks_to_swap_out: &mut HashMap<BlockId, BlockId>,
    ) -> Result<(Sequence, PreemptionMode), SchedulerError> {
        let span = self.span.clone();
        let _enter = span.enter();
        let sequence_id = sequence.sequence_id();
        let preemption_mode = if self.scheduler_config.preemption_mode() == PreemptionMode::Swap
            && self.block_manager.can_swap_out(sequence_id)?
        {
            PreemptionMode::Swap
        } else {
            PreemptionMode::Recomputation
        };

        if self.num_cumulative_preemption % 50 == 0 {
            warn!(
                "Sequence with id = {sequence_id} is preempted by {preemption_mode:?} mode because there is not enough KV cache space. This can affect the end-to-end performance. Increase `num_gpu_blocks` to provide more KV cache memory. `total_num_cumulative_preemption = {}`",
                self.num_cumulative_preemption + 1
            );
        }
        self.num_cumulative_preemption += 1;
        counter!("scheduler-preemptions-total").increment(1);

        match preemption_mode {
            PreemptionMode::Swap => {
                blocks_to_swap_out.extend(self.block_manager.swap_out(sequence_id)?);
            }
            PreemptionMode::Recomputation => {
                self.release(sequence_id)?;
                sequence.reset_state_for_recompute();
            }
        }
        sequence.set_sequence_status(SequenceStatus::Preempted)?;

        Ok((sequence, preemption_mode))
    }

    /// Whether enough time has passed since the last prompt batch to schedule new prompts.
    ///
    /// 1. Updates the last prompt latency if a prompt was scheduled in the previous step.
    /// 2. If a delay factor is configured and there are waiting requests, returns true if either:
    ///      a) The time since the earliest arrival exceeds the delay factor * last prompt latency.
    ///      b) There are no currently running requests.
    /// 3. Returns true otherwise.
    fn passed_delay(&mut self, now: Instant) -> bool {
        if self.previous_prompt {
            self.last_prompt_latency = now.saturating_duration_since(self.previous_time).as_secs_f32();
        }

        self.previous_time = now;
        self.previous_prompt = false;

        // Delay scheduling prompts to let waiting queue fill up
        let delay_factor = self.scheduler_config.delay_factor();
        match self.waiting.iter().map(|s| s.arrival_time()).min() {
            Some(earliest_arrival_time) if delay_factor > 0.0 => {
                now.saturating_duration_since(earliest_arrival_time)
                    .as_secs_f32()
                    > delay_factor * self.last_prompt_latency
                    || self.running.is_empty()
            }
            _ => true,
        }
    }
}

fn remove_by_request_id(queue: &mut VecDeque<Sequence>, request_id: &str) -> Option<Sequence> {
    let index = queue.iter().position(|s| s.request_id() == request_id)?;
    queue.remove(index)
}

fn remove_by_sequence_id(queue: &mut VecDeque<Sequence>, sequence_id: u64) -> Option<Sequence> {
    let index = queue.iter().position(|s| s.sequence_id() == sequence_id)?;
    queue.remove(index)
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Block space manager error: `{0}`")]
    BlockSpaceManagerError(#[from] BlockSpaceManagerError),
    #[error("Batch builder error: `{0}`")]
    BatchBuilderError(#[from] BatchBuilderError),
    #[error("Sequence error: `{0}`")]
    SequenceError(#[from] SequenceError),
    #[error("Scheduler config error: `{0}`")]
    SchedulerConfigError(#[from] SchedulerConfigError),
    #[error("Admission rejected for request with id = `{request_id}`: {reason}")]
    AdmissionRejected { request_id: String, reason: String },
    #[error("Swap preemption requires a non empty CPU block pool")]
    SwapWithoutCpuBlocks,
    #[error("Missing scheduled sequence with id = `{0}`")]
    MissingScheduledSequence(u64),
    #[error("Cannot fork request `{0}`")]
    CannotFork(String),
}

#[cfg(test)]
impl<P> Scheduler<P> {
    /// Request ids of the waiting, running and preempted queues
    pub(crate) fn queue_request_ids(&self) -> (Vec<String>, Vec<String>, Vec<String>) {
        let ids = |queue: &VecDeque<Sequence>| {
            queue
                .iter()
                .map(|s| s.request_id().to_string())
                .collect::<Vec<_>>()
        };
        (ids(&self.waiting), ids(&self.running), ids(&self.preempted))
    }
}
