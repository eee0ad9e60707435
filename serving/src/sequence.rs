use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info_span, instrument, trace, Span};

use crate::{
    block::num_blocks_for_tokens,
    validation::{NextTokenChooserParameters, StoppingCriteriaParameters},
};

/// The reason why a sequence reached a terminal state.
///
/// Every variant has a stable string code, which is what callers observe on
/// the per-request completion channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum FinishReason {
    /// A stop condition (EOS, stop token or stop sequence) was produced
    #[serde(rename = "stop")]
    Stopped,
    /// The sequence reached `max_new_tokens`, the model maximum length or
    /// the capacity of the KV cache pool
    #[serde(rename = "length")]
    LengthCapped,
    /// The caller cancelled the request
    #[serde(rename = "cancelled")]
    Cancelled,
    /// The request can never be served with the configured capacity
    #[serde(rename = "admission_rejected")]
    AdmissionRejected,
    /// The batch containing the sequence failed on the engine
    #[serde(rename = "engine_error")]
    EngineError,
}

impl FinishReason {
    /// Stable reason code
    ///
    /// # Examples
    ///
    /// ```
    /// use paged_serving::sequence::FinishReason;
    ///
    /// assert_eq!(FinishReason::Stopped.as_str(), "stop");
    /// assert_eq!(FinishReason::AdmissionRejected.as_str(), "admission_rejected");
    /// ```
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stop",
            Self::LengthCapped => "length",
            Self::Cancelled => "cancelled",
            Self::AdmissionRejected => "admission_rejected",
            Self::EngineError => "engine_error",
        }
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `SequenceStatus` represents the current status of a `Sequence` in the generation process.
///
/// `Waiting:` The sequence is waiting to be admitted.
/// `Running:` The sequence owns a GPU block table and takes part in batches.
/// `Preempted:` The sequence was evicted to reclaim KV cache space, its blocks were
///     either released (recomputation) or moved to the CPU pool (swap).
/// `Finished:` The sequence reached a terminal state, for the given reason.
/// `Cancelled:` The caller cancelled the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStatus {
    Waiting,
    Running,
    Preempted,
    Finished(FinishReason),
    Cancelled,
}

impl SequenceStatus {
    /// Checks if the sequence reached a terminal state.
    ///
    /// ```
    /// use paged_serving::sequence::{FinishReason, SequenceStatus};
    ///
    /// assert!(SequenceStatus::Finished(FinishReason::Stopped).is_finished());
    /// assert!(SequenceStatus::Cancelled.is_finished());
    /// assert!(!SequenceStatus::Preempted.is_finished());
    /// ```
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Finished(_) | Self::Cancelled => true,
            Self::Waiting | Self::Running | Self::Preempted => false,
        }
    }

    /// Returns the reason why the sequence finished, if it did.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        match self {
            Self::Finished(reason) => Some(*reason),
            Self::Cancelled => Some(FinishReason::Cancelled),
            Self::Waiting | Self::Running | Self::Preempted => None,
        }
    }

    /// Checks if a transition from `self` to `to` is allowed.
    fn can_transition_to(&self, to: &Self) -> bool {
        match (self, to) {
            (Self::Waiting, Self::Running) => true,
            (Self::Running, Self::Preempted) | (Self::Preempted, Self::Running) => true,
            (Self::Running, Self::Finished(_)) => true,
            (
                Self::Waiting | Self::Preempted,
                Self::Finished(
                    FinishReason::AdmissionRejected
                    | FinishReason::LengthCapped
                    | FinishReason::EngineError,
                ),
            ) => true,
            (from, Self::Cancelled) => !from.is_finished(),
            _ => false,
        }
    }
}

/// Represents the current stage of processing for a `Sequence`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceStage {
    /// The stage where the prompt (or, after a recomputation, the prompt and
    /// the already generated tokens) is processed in a single forward pass.
    Prefill,
    /// The stage where new tokens are generated one at a time.
    Decode,
}

/// Metrics tracking various time points of a request's lifecycle.
#[derive(Clone, Debug)]
pub struct RequestMetrics {
    /// The time when the request was received by the service.
    pub arrival_time: Instant,
    /// The time when the request was first scheduled.
    pub first_scheduled_time: Option<Instant>,
    /// The time when the first token was generated for this request.
    pub first_token_time: Option<Instant>,
    /// The duration the request spent waiting before being scheduled for the first time.
    pub time_in_queue: Option<Duration>,
    /// The time when the request reached a terminal state.
    pub finished_time: Option<Instant>,
}

/// `SequenceData` - Represents the token state associated with a `Sequence`
#[derive(Clone, Debug)]
pub struct SequenceData {
    /// The token IDs of the initial prompt
    prompt_token_ids: Vec<u32>,
    /// The token IDs of the generated output
    output_token_ids: Vec<u32>,
    /// The cumulative log probability of the generated tokens
    cumulative_logprob: f32,
    /// The number of tokens whose KV state is in the cache
    num_computed_tokens: usize,
    /// The current processing stage of the sequence
    stage: SequenceStage,
}

impl SequenceData {
    /// Constructor
    pub fn new(prompt_token_ids: Vec<u32>, output_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            output_token_ids,
            cumulative_logprob: 0.0,
            num_computed_tokens: 0,
            stage: SequenceStage::Prefill,
        }
    }

    /// Appends a newly generated token id, updating the cumulative log probability.
    pub fn add_token_id(&mut self, token_id: u32, logprob: f32) {
        self.output_token_ids.push(token_id);
        self.cumulative_logprob += logprob;
    }

    /// Returns the total number of tokens in the sequence (prompt and output).
    ///
    /// ```
    /// use paged_serving::sequence::SequenceData;
    ///
    /// let sequence_data = SequenceData::new(vec![1, 2, 3], vec![4, 5]);
    /// assert_eq!(sequence_data.length(), 5);
    /// ```
    pub fn length(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    /// Number of prompt tokens
    pub fn get_prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    /// Number of generated tokens
    pub fn get_output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Returns all token ids, prompt tokens followed by output tokens.
    pub fn get_token_ids(&self) -> Vec<u32> {
        let mut output = Vec::with_capacity(self.length());
        output.extend(&self.prompt_token_ids);
        output.extend(&self.output_token_ids);
        output
    }

    /// Token ids in positions `[start, end)`, spanning prompt and output.
    pub fn get_token_ids_range(&self, start: usize, end: usize) -> Vec<u32> {
        self.prompt_token_ids
            .iter()
            .chain(self.output_token_ids.iter())
            .skip(start)
            .take(end.saturating_sub(start))
            .copied()
            .collect()
    }

    /// Returns the number of tokens that have been computed so far.
    pub fn get_num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// Number of tokens that have not been processed yet.
    ///
    /// Uses `length()` rather than the prompt length: after a recomputation,
    /// both the prompt and the previously generated tokens must be prefilled again.
    pub fn get_num_uncomputed_tokens(&self) -> usize {
        self.length() - self.num_computed_tokens
    }

    /// Updates the number of computed tokens, after a forward pass processed
    /// `num_new_computed_tokens` tokens of the sequence.
    ///
    /// Once every token has been computed the sequence transits to the `Decode` stage.
    ///
    /// # Errors
    ///
    /// `SequenceError::InvalidNumberGeneratedTokens` if more tokens than the sequence
    /// length would be computed.
    pub fn update_num_computed_tokens(
        &mut self,
        num_new_computed_tokens: usize,
    ) -> Result<(), SequenceError> {
        if self.num_computed_tokens + num_new_computed_tokens > self.length() {
            error!(
                "Failed to update number of computed tokens: num_computed_tokens = {}, num_new_computed_tokens = {}, length = {}",
                self.num_computed_tokens,
                num_new_computed_tokens,
                self.length()
            );
            return Err(SequenceError::InvalidNumberGeneratedTokens);
        }
        self.num_computed_tokens += num_new_computed_tokens;
        if self.get_num_uncomputed_tokens() == 0 {
            self.stage = SequenceStage::Decode;
        }
        Ok(())
    }

    /// Resets the state for recomputation, used when a sequence is preempted
    /// and its KV cache blocks are released.
    pub fn reset_state_for_recompute(&mut self) {
        self.num_computed_tokens = 0;
        self.stage = SequenceStage::Prefill
    }

    /// Returns the last token id, of the output if any, of the prompt otherwise.
    pub fn get_last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .or(self.prompt_token_ids.last())
            .copied()
    }

    /// Getter for `prompt_token_ids`
    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    /// Getter for `output_token_ids`
    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Getter for `cumulative_logprob`
    pub fn cumulative_logprob(&self) -> f32 {
        self.cumulative_logprob
    }

    /// Getter for `stage`
    pub fn stage(&self) -> SequenceStage {
        self.stage
    }
}

/// `Sequence` - A single generation request, its tokens, status and parameters.
///
/// Sequences are exclusively owned by the scheduler queues. Block tables are
/// not stored here, they live in the `BlockSpaceManager`, keyed by `sequence_id`.
#[derive(Clone, Debug)]
pub struct Sequence {
    /// Unique identifier for the sequence, used to key its block table.
    sequence_id: u64,
    /// Opaque request id, as seen by the caller.
    request_id: String,
    /// Token state of the sequence
    sequence_data: SequenceData,
    /// Size of each KV cache block
    block_size: usize,
    /// Current status of the sequence
    sequence_status: SequenceStatus,
    /// Parameters forwarded to the engine to choose the next token
    next_token_chooser_params: NextTokenChooserParameters,
    /// Parameters driving stop detection
    stopping_criteria_params: StoppingCriteriaParameters,
    /// Lifecycle timings
    metrics: RequestMetrics,
    /// Tracing span
    span: Span,
}

impl Sequence {
    /// Constructor
    ///
    /// # Errors
    ///
    /// `SequenceError::EmptyPrompt` if `prompt_token_ids` is empty.
    pub fn new(
        sequence_id: u64,
        request_id: String,
        prompt_token_ids: Vec<u32>,
        block_size: usize,
        arrival_time: Instant,
        next_token_chooser_params: NextTokenChooserParameters,
        stopping_criteria_params: StoppingCriteriaParameters,
    ) -> Result<Self, SequenceError> {
        if prompt_token_ids.is_empty() {
            error!("Cannot create sequence for request with id = {request_id}, empty prompt");
            return Err(SequenceError::EmptyPrompt(request_id));
        }
        Ok(Self {
            sequence_id,
            span: info_span!("sequence", request_id = %request_id),
            request_id,
            sequence_data: SequenceData::new(prompt_token_ids, vec![]),
            block_size,
            sequence_status: SequenceStatus::Waiting,
            next_token_chooser_params,
            stopping_criteria_params,
            metrics: RequestMetrics {
                arrival_time,
                first_scheduled_time: None,
                first_token_time: None,
                time_in_queue: None,
                finished_time: None,
            },
        })
    }

    /// Getter for `sequence_id`
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Getter for `request_id`
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Getter for `arrival_time`
    pub fn arrival_time(&self) -> Instant {
        self.metrics.arrival_time
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `sequence_data`
    pub fn sequence_data(&self) -> &SequenceData {
        &self.sequence_data
    }

    /// Getter for `metrics`
    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    /// Getter for `next_token_chooser_params`
    pub fn next_token_chooser_params(&self) -> &NextTokenChooserParameters {
        &self.next_token_chooser_params
    }

    /// Getter for `stopping_criteria_params`
    pub fn stopping_criteria_params(&self) -> &StoppingCriteriaParameters {
        &self.stopping_criteria_params
    }

    /// Total number of tokens, prompt and generated
    pub fn length(&self) -> usize {
        self.sequence_data.length()
    }

    /// Number of prompt tokens
    pub fn get_prompt_len(&self) -> usize {
        self.sequence_data.get_prompt_len()
    }

    /// Number of generated tokens
    pub fn get_output_len(&self) -> usize {
        self.sequence_data.get_output_len()
    }

    /// Prompt token ids
    pub fn prompt_token_ids(&self) -> &[u32] {
        self.sequence_data.prompt_token_ids()
    }

    /// Generated token ids
    pub fn output_token_ids(&self) -> &[u32] {
        self.sequence_data.output_token_ids()
    }

    /// Number of tokens whose KV state is in the cache
    pub fn get_num_computed_tokens(&self) -> usize {
        self.sequence_data.get_num_computed_tokens()
    }

    /// Number of KV cache blocks needed to hold the whole sequence
    pub fn num_required_blocks(&self) -> usize {
        num_blocks_for_tokens(self.length(), self.block_size)
    }

    /// Get the number of new tokens to be computed in the next iteration.
    ///
    /// # Returns
    /// - For the Decode stage: 1, a single token is processed per iteration.
    /// - For the Prefill stage: the number of tokens not yet computed.
    pub fn get_num_new_tokens(&self) -> usize {
        if self.sequence_data.stage() == SequenceStage::Decode {
            return 1;
        }
        self.sequence_data.get_num_uncomputed_tokens()
    }

    /// Checks if the sequence is in the `Prefill` stage
    pub fn is_prefill(&self) -> bool {
        self.sequence_data.stage() == SequenceStage::Prefill
    }

    /// Updates the number of computed tokens, see `SequenceData::update_num_computed_tokens`
    pub fn update_num_computed_tokens(
        &mut self,
        num_new_computed_tokens: usize,
    ) -> Result<(), SequenceError> {
        self.sequence_data
            .update_num_computed_tokens(num_new_computed_tokens)
    }

    /// Resets the state of the sequence for recomputation
    pub fn reset_state_for_recompute(&mut self) {
        self.sequence_data.reset_state_for_recompute()
    }

    /// Appends a single generated token to the sequence.
    ///
    /// The caller is responsible to extend the block table of the sequence
    /// before appending, so that it covers the new length.
    #[instrument(skip_all)]
    pub fn add_token_id(&mut self, token_id: u32, logprob: f32) {
        let _enter = self.span.enter();
        trace!("Adding token id = {token_id} to sequence");
        self.sequence_data.add_token_id(token_id, logprob);
    }

    /// Returns the current status of the sequence
    pub fn get_sequence_status(&self) -> SequenceStatus {
        self.sequence_status
    }

    /// Updates the status of the sequence.
    ///
    /// # Errors
    ///
    /// `SequenceError::InvalidTransition` if the state machine does not allow
    /// moving from the current status to `sequence_status`. Terminal states
    /// never change.
    #[instrument(skip_all)]
    pub fn set_sequence_status(
        &mut self,
        sequence_status: SequenceStatus,
    ) -> Result<(), SequenceError> {
        let _enter = self.span.enter();
        if !self.sequence_status.can_transition_to(&sequence_status) {
            error!(
                "Invalid status transition for sequence with id = {}: {:?} -> {:?}",
                self.sequence_id, self.sequence_status, sequence_status
            );
            return Err(SequenceError::InvalidTransition {
                sequence_id: self.sequence_id,
                from: self.sequence_status,
                to: sequence_status,
            });
        }
        debug!(
            "Sequence with id = {} transits {:?} -> {:?}",
            self.sequence_id, self.sequence_status, sequence_status
        );
        self.sequence_status = sequence_status;
        Ok(())
    }

    /// Checks if the sequence reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.sequence_status.is_finished()
    }

    /// Returns the reason why the sequence finished, if it did
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.sequence_status.finish_reason()
    }

    /// Evaluates the stop conditions, right after a token was appended.
    ///
    /// # Arguments
    ///
    /// * `is_eos` - Whether the engine reported the last token as an end of sequence token
    /// * `max_model_len` - Maximum number of tokens (prompt and output) the model supports
    ///
    /// # Returns
    ///
    /// * `Some(FinishReason::Stopped)` on an EOS token (unless `ignore_eos_token` is set),
    ///     a stop token id, or when the output ends with one of the stop sequences
    /// * `Some(FinishReason::LengthCapped)` when `max_new_tokens` tokens were generated or
    ///     the sequence reached `max_model_len`
    /// * `None` otherwise
    pub fn check_stop(&self, is_eos: bool, max_model_len: usize) -> Option<FinishReason> {
        let stopping = &self.stopping_criteria_params;
        let output_token_ids = self.output_token_ids();

        if let Some(last_token_id) = output_token_ids.last() {
            if is_eos && !stopping.ignore_eos_token {
                return Some(FinishReason::Stopped);
            }
            if stopping.stop_token_ids.contains(last_token_id) {
                return Some(FinishReason::Stopped);
            }
            if stopping
                .stop_sequences
                .iter()
                .any(|stop| !stop.is_empty() && output_token_ids.ends_with(stop))
            {
                return Some(FinishReason::Stopped);
            }
        }

        if self.get_output_len() >= stopping.max_new_tokens as usize {
            return Some(FinishReason::LengthCapped);
        }
        if self.length() >= max_model_len {
            return Some(FinishReason::LengthCapped);
        }
        None
    }

    /// Creates a new `Sequence` by forking the current one.
    ///
    /// The child owns a copy of the token state and of the parameters, with its own
    /// identifiers and arrival time. Its KV cache blocks are shared with the parent
    /// through `BlockSpaceManager::fork`.
    #[instrument(skip_all)]
    pub fn fork(&self, new_sequence_id: u64, new_request_id: String, arrival_time: Instant) -> Self {
        let _enter = self.span.enter();
        trace!(
            "Forking sequence with id = {} into sequence with id = {new_sequence_id}",
            self.sequence_id
        );
        let mut new_sequence = self.clone();
        new_sequence.sequence_id = new_sequence_id;
        new_sequence.span = info_span!("sequence", request_id = %new_request_id);
        new_sequence.request_id = new_request_id;
        new_sequence.metrics = RequestMetrics {
            arrival_time,
            first_scheduled_time: None,
            first_token_time: None,
            time_in_queue: None,
            finished_time: None,
        };
        new_sequence
    }

    /// Records the first time the sequence is scheduled, returning the time it
    /// spent in the queue if this is the first time.
    pub fn maybe_set_first_scheduled_time(&mut self, now: Instant) -> Option<Duration> {
        if self.metrics.first_scheduled_time.is_some() {
            return None;
        }
        let time_in_queue = now.saturating_duration_since(self.metrics.arrival_time);
        self.metrics.first_scheduled_time = Some(now);
        self.metrics.time_in_queue = Some(time_in_queue);
        Some(time_in_queue)
    }

    /// Records the time of the first generated token, returning the time to
    /// first token if this is the first one.
    pub fn maybe_set_first_token_time(&mut self, now: Instant) -> Option<Duration> {
        if self.metrics.first_token_time.is_some() {
            return None;
        }
        self.metrics.first_token_time = Some(now);
        Some(now.saturating_duration_since(self.metrics.arrival_time))
    }

    /// Records the time the sequence reached a terminal state
    pub fn set_finished_time(&mut self, now: Instant) {
        self.metrics.finished_time = Some(now);
    }
}

/// The engine result for a single sequence of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceOutput {
    /// The id of the sequence
    pub sequence_id: u64,
    /// The id of the token sampled for the sequence
    pub output_token: u32,
    /// Log probability of the sampled token
    pub logprob: f32,
    /// Indicates whether the token is an end of sequence token
    pub is_stop_token: bool,
    /// Whether the engine processed the sequence successfully
    pub success: bool,
}

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("Invalid number of newly generated tokens for sequence")]
    InvalidNumberGeneratedTokens,
    #[error("Empty prompt for request with id = `{0}`")]
    EmptyPrompt(String),
    #[error("Invalid status transition for sequence with id = `{sequence_id}`: `{from:?}` -> `{to:?}`")]
    InvalidTransition {
        sequence_id: u64,
        from: SequenceStatus,
        to: SequenceStatus,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Create a dummy prompt sequence with tokens `0..prompt_length`.
    pub(crate) fn create_dummy_prompt(
        sequence_id: u64,
        prompt_length: usize,
        block_size: usize,
        max_new_tokens: u32,
    ) -> Sequence {
        let prompt_tokens: Vec<u32> = (0..(prompt_length as u32)).collect();
        Sequence::new(
            sequence_id,
            format!("req-{sequence_id}"),
            prompt_tokens,
            block_size,
            Instant::now(),
            NextTokenChooserParameters::default(),
            StoppingCriteriaParameters {
                max_new_tokens,
                ..Default::default()
            },
        )
        .expect("Failed to create prompt sequence")
    }

    #[test]
    fn test_sequence_data_prefill() {
        let mut sequence_data = SequenceData::new(vec![1, 2, 3, 4], vec![]);
        assert_eq!(sequence_data.get_num_uncomputed_tokens(), 4);
        assert_eq!(sequence_data.get_num_computed_tokens(), 0);

        // advance by `2`
        sequence_data
            .update_num_computed_tokens(2)
            .expect("Failed to update");
        assert_eq!(sequence_data.get_num_uncomputed_tokens(), 2);
        assert_eq!(sequence_data.stage(), SequenceStage::Prefill);

        // advance by `2`, prompt is computed
        sequence_data
            .update_num_computed_tokens(2)
            .expect("Failed to update");
        assert_eq!(sequence_data.get_num_uncomputed_tokens(), 0);
        assert_eq!(sequence_data.stage(), SequenceStage::Decode);

        // cannot compute more tokens than the sequence holds
        assert!(sequence_data.update_num_computed_tokens(1).is_err());

        // append tokens and reset, simulating recompute
        sequence_data.add_token_id(1, 0.0);
        sequence_data.reset_state_for_recompute();
        assert_eq!(sequence_data.get_num_uncomputed_tokens(), 5);
        assert_eq!(sequence_data.get_num_computed_tokens(), 0);
        assert_eq!(sequence_data.get_token_ids_range(3, 5), vec![4, 1]);
    }

    #[test]
    fn test_sequence_num_new_tokens() {
        let mut sequence = create_dummy_prompt(0, 6, 4, 10);
        assert!(sequence.is_prefill());
        assert_eq!(sequence.get_num_new_tokens(), 6);
        assert_eq!(sequence.num_required_blocks(), 2);

        sequence
            .update_num_computed_tokens(6)
            .expect("Failed to update");
        sequence.add_token_id(42, -0.5);
        assert!(!sequence.is_prefill());
        assert_eq!(sequence.get_num_new_tokens(), 1);
        assert_eq!(sequence.sequence_data().get_last_token_id(), Some(42));
    }

    #[test]
    fn test_sequence_status_transitions() {
        let mut sequence = create_dummy_prompt(0, 4, 4, 10);
        assert_eq!(sequence.get_sequence_status(), SequenceStatus::Waiting);

        // Waiting sequences cannot be preempted, nor finish by stopping
        assert!(sequence
            .set_sequence_status(SequenceStatus::Preempted)
            .is_err());
        assert!(sequence
            .set_sequence_status(SequenceStatus::Finished(FinishReason::Stopped))
            .is_err());

        sequence
            .set_sequence_status(SequenceStatus::Running)
            .expect("Failed to set status");
        sequence
            .set_sequence_status(SequenceStatus::Preempted)
            .expect("Failed to set status");
        sequence
            .set_sequence_status(SequenceStatus::Running)
            .expect("Failed to set status");
        sequence
            .set_sequence_status(SequenceStatus::Finished(FinishReason::Stopped))
            .expect("Failed to set status");
        assert!(sequence.is_finished());
        assert_eq!(sequence.finish_reason(), Some(FinishReason::Stopped));

        // Terminal states never change
        assert!(sequence
            .set_sequence_status(SequenceStatus::Cancelled)
            .is_err());
        assert!(sequence
            .set_sequence_status(SequenceStatus::Running)
            .is_err());

        let mut sequence = create_dummy_prompt(1, 4, 4, 10);
        sequence
            .set_sequence_status(SequenceStatus::Cancelled)
            .expect("Failed to cancel");
        assert_eq!(sequence.finish_reason(), Some(FinishReason::Cancelled));
    }

    #[test]
    fn test_check_stop() {
        let mut sequence = Sequence::new(
            0,
            "req-0".to_string(),
            vec![1, 2, 3],
            4,
            Instant::now(),
            NextTokenChooserParameters::default(),
            StoppingCriteriaParameters {
                max_new_tokens: 4,
                stop_token_ids: vec![99],
                stop_sequences: vec![vec![7, 8]],
                ignore_eos_token: false,
            },
        )
        .expect("Failed to create sequence");

        assert_eq!(sequence.check_stop(false, 100), None);

        sequence.add_token_id(7, 0.0);
        assert_eq!(sequence.check_stop(false, 100), None);
        assert_eq!(sequence.check_stop(true, 100), Some(FinishReason::Stopped));

        sequence.add_token_id(8, 0.0);
        assert_eq!(sequence.check_stop(false, 100), Some(FinishReason::Stopped));

        sequence.add_token_id(5, 0.0);
        assert_eq!(sequence.check_stop(false, 100), None);
        // model maximum length is reached
        assert_eq!(
            sequence.check_stop(false, 6),
            Some(FinishReason::LengthCapped)
        );

        sequence.add_token_id(99, 0.0);
        assert_eq!(sequence.check_stop(false, 100), Some(FinishReason::Stopped));

        let mut sequence = create_dummy_prompt(1, 3, 4, 2);
        sequence.add_token_id(5, 0.0);
        assert_eq!(sequence.check_stop(false, 100), None);
        sequence.add_token_id(6, 0.0);
        assert_eq!(
            sequence.check_stop(false, 100),
            Some(FinishReason::LengthCapped)
        );
    }

    #[test]
    fn test_check_stop_ignore_eos() {
        let mut sequence = Sequence::new(
            0,
            "req-0".to_string(),
            vec![1],
            4,
            Instant::now(),
            NextTokenChooserParameters::default(),
            StoppingCriteriaParameters {
                max_new_tokens: 8,
                ignore_eos_token: true,
                ..Default::default()
            },
        )
        .expect("Failed to create sequence");
        sequence.add_token_id(2, 0.0);
        assert_eq!(sequence.check_stop(true, 100), None);
    }

    #[test]
    fn test_sequence_fork() {
        let mut sequence = create_dummy_prompt(0, 5, 4, 10);
        sequence
            .set_sequence_status(SequenceStatus::Running)
            .expect("Failed to set status");
        sequence
            .update_num_computed_tokens(5)
            .expect("Failed to update");
        sequence.add_token_id(11, 0.0);

        let child = sequence.fork(7, "req-7".to_string(), Instant::now());
        assert_eq!(child.sequence_id(), 7);
        assert_eq!(child.request_id(), "req-7");
        assert_eq!(child.output_token_ids(), &[11]);
        assert_eq!(child.get_num_computed_tokens(), 5);
        assert_eq!(child.get_sequence_status(), SequenceStatus::Running);
        assert!(child.metrics().first_token_time.is_none());
    }

    #[test]
    fn test_finish_reason_codes() {
        let codes = [
            FinishReason::Stopped,
            FinishReason::LengthCapped,
            FinishReason::Cancelled,
            FinishReason::AdmissionRejected,
            FinishReason::EngineError,
        ]
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>();
        expect_test::expect![[r#"
            [
                "stop",
                "length",
                "cancelled",
                "admission_rejected",
                "engine_error",
            ]
        "#]]
        .assert_debug_eq(&codes);
    }

    #[test]
    fn test_empty_prompt() {
        let result = Sequence::new(
            0,
            "req-0".to_string(),
            vec![],
            4,
            Instant::now(),
            NextTokenChooserParameters::default(),
            StoppingCriteriaParameters::default(),
        );
        assert!(matches!(result, Err(SequenceError::EmptyPrompt(_))));
    }
}
