use std::collections::{HashMap, HashSet};

use crate::{
    block::{num_blocks_for_tokens, BlockId},
    block_manager::{AllocationStatus, BlockSpaceManager, BlockSpaceManagerError},
    config::ExecutionContext,
    sequence::Sequence,
    validation::NextTokenChooserParameters,
};
use thiserror::Error;
use tracing::{debug, error, info_span, instrument, trace, Span};

/// `SchedulingBudget` - The available slots for scheduling.
///
/// The budget is sequence id aware: adding the tokens (or the sequence count)
/// of the same sequence twice is a no-op, so that running sequences can be
/// counted ahead of time and then scheduled without double counting.
#[derive(Debug)]
pub struct SchedulingBudget {
    /// Maximum number of tokens that can be scheduled
    pub token_budget: usize,
    /// Maximum number of sequences that can be scheduled
    pub max_num_sequences: usize,
    /// Set of sequence ids that have updated `num_batched_tokens`
    sequence_ids_num_batched_tokens: HashSet<u64>,
    /// Set of sequence ids that have updated `num_curr_seqs`
    sequence_ids_num_curr_seqs: HashSet<u64>,
    /// Number of batched tokens currently used
    num_batched_tokens: usize,
    /// Number of current scheduled sequences
    num_curr_seqs: usize,
    /// Tracing span
    pub span: Span,
}

impl SchedulingBudget {
    /// Creates a new `SchedulingBudget` with the specified token budget and maximum number of sequences.
    pub fn new(token_budget: usize, max_num_sequences: usize) -> Self {
        Self {
            token_budget,
            max_num_sequences,
            sequence_ids_num_batched_tokens: HashSet::new(),
            sequence_ids_num_curr_seqs: HashSet::new(),
            num_batched_tokens: 0,
            num_curr_seqs: 0,
            span: info_span!("scheduling-budget"),
        }
    }

    /// Checks if it is possible to schedule `num_new_tokens` tokens, for
    /// `num_new_sequences` sequences that are not counted yet
    #[instrument(skip_all)]
    pub fn can_schedule(
        &self,
        num_new_tokens: usize,
        num_new_sequences: usize,
    ) -> Result<bool, BatchBuilderError> {
        let _enter = self.span.enter();
        if num_new_tokens == 0 {
            error!("Empty scheduling, `num_new_tokens` == 0");
            return Err(BatchBuilderError::EmptyScheduling);
        }

        Ok(
            (self.num_batched_tokens + num_new_tokens <= self.token_budget)
                && (self.num_curr_seqs + num_new_sequences <= self.max_num_sequences),
        )
    }

    /// Computes the remaining number of budget tokens
    pub fn remaining_budget_tokens(&self) -> usize {
        self.token_budget.saturating_sub(self.num_batched_tokens)
    }

    /// Adds number of batched tokens
    #[instrument(skip_all)]
    pub fn add_num_batched_tokens(&mut self, sequence_id: u64, num_batched_tokens: usize) {
        let _enter = self.span.enter();
        trace!("Adding number of batched tokens");
        // If the sequence has already been batched, simply return
        if !self.sequence_ids_num_batched_tokens.insert(sequence_id) {
            return;
        }
        self.num_batched_tokens += num_batched_tokens;
    }

    /// Subtracts number of batched tokens
    #[instrument(skip_all)]
    pub fn subtract_num_batched_tokens(&mut self, sequence_id: u64, num_batched_tokens: usize) {
        let _enter = self.span.enter();
        trace!("Subtracting number of batched tokens..");
        // Only performs an action, if the sequence has been already batched
        if self.sequence_ids_num_batched_tokens.remove(&sequence_id) {
            self.num_batched_tokens -= num_batched_tokens;
        }
    }

    /// Adds number sequences
    #[instrument(skip_all)]
    pub fn add_number_sequences(&mut self, sequence_id: u64, num_current_sequences: usize) {
        let _enter = self.span.enter();
        trace!("Adding number of sequences..");
        // If the sequence has already been added, simply return
        if !self.sequence_ids_num_curr_seqs.insert(sequence_id) {
            return;
        }
        self.num_curr_seqs += num_current_sequences;
    }

    /// Subtracts number sequences
    #[instrument(skip_all)]
    pub fn subtracts_number_sequences(&mut self, sequence_id: u64, num_current_sequences: usize) {
        let _enter = self.span.enter();
        trace!("Subtracting number of sequences..");
        // Only performs an action, if the sequence has been already added
        if self.sequence_ids_num_curr_seqs.remove(&sequence_id) {
            self.num_curr_seqs -= num_current_sequences;
        }
    }

    /// Number of batched tokens
    pub fn num_batched_tokens(&self) -> usize {
        self.num_batched_tokens
    }

    /// Number of current sequences
    pub fn num_current_sequences(&self) -> usize {
        self.num_curr_seqs
    }
}

/// Where the KV cache blocks of a candidate sequence live, right before the
/// batch is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Running, its block table lives in the GPU pool
    Resident,
    /// Preempted by swap, its block table lives in the CPU pool
    Swapped,
    /// Waiting, or preempted by recomputation, it owns no block table
    Unallocated,
}

/// A sequence the `BatchBuilder` may include in the next batch.
#[derive(Debug)]
pub struct Candidate {
    /// The sequence
    pub sequence: Sequence,
    /// Where its blocks currently live
    pub residency: Residency,
}

impl Candidate {
    /// Constructor
    pub fn new(sequence: Sequence, residency: Residency) -> Self {
        Self {
            sequence,
            residency,
        }
    }
}

/// Per sequence metadata, forwarded to the engine with the batch.
#[derive(Clone, Debug, PartialEq)]
pub struct SequenceMetadata {
    /// Sequence id
    pub sequence_id: u64,
    /// Request id
    pub request_id: String,
    /// Number of tokens of the sequence processed in this batch
    pub num_tokens: usize,
    /// Whether the tokens are prompt tokens (prefill), or a single decode token
    pub is_prompt: bool,
    /// Whether the engine should sample a token for the sequence. It is false
    /// for every chunk of a chunked prefill but the last one.
    pub do_sample: bool,
    /// Number of tokens in the KV cache once the batch is processed
    pub context_len: usize,
    /// Sampling parameters
    pub next_token_chooser_params: NextTokenChooserParameters,
}

/// `BatchDescriptor` - Everything the engine needs to run one forward step.
///
/// The engine performs the cache operations in the following order, before the
/// forward pass: `blocks_to_copy`, `blocks_to_swap_out`, `blocks_to_swap_in`.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchDescriptor {
    /// Token ids of every scheduled sequence, concatenated in batch order
    pub input_token_ids: Vec<u32>,
    /// Absolute position of each token in `input_token_ids`
    pub input_positions: Vec<usize>,
    /// Block table of each scheduled sequence, in batch order
    pub block_tables: Vec<Vec<BlockId>>,
    /// Cumulative token offsets, sequence `i` spans
    /// `sequence_boundaries[i]..sequence_boundaries[i + 1]`
    pub sequence_boundaries: Vec<usize>,
    /// Metadata of each scheduled sequence, in batch order
    pub sequences: Vec<SequenceMetadata>,
    /// Blocks to swap in, CPU -> GPU block number
    pub blocks_to_swap_in: HashMap<BlockId, BlockId>,
    /// Blocks to swap out, GPU -> CPU block number
    pub blocks_to_swap_out: HashMap<BlockId, BlockId>,
    /// Blocks to copy, source -> destination block number
    pub blocks_to_copy: Vec<(BlockId, BlockId)>,
    /// Devices and data type of the KV cache
    pub context: ExecutionContext,
}

impl BatchDescriptor {
    /// Creates a new empty instance
    pub fn create_empty(context: ExecutionContext) -> Self {
        Self {
            input_token_ids: vec![],
            input_positions: vec![],
            block_tables: vec![],
            sequence_boundaries: vec![0],
            sequences: vec![],
            blocks_to_swap_in: HashMap::new(),
            blocks_to_swap_out: HashMap::new(),
            blocks_to_copy: vec![],
            context,
        }
    }

    /// Total number of tokens in the batch
    pub fn num_tokens(&self) -> usize {
        self.input_token_ids.len()
    }

    /// Checks if there is no work for the engine
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
            && self.blocks_to_swap_in.is_empty()
            && self.blocks_to_swap_out.is_empty()
            && self.blocks_to_copy.is_empty()
    }
}

/// A sequence included in the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledSequence {
    /// Sequence id
    pub sequence_id: u64,
    /// Request id
    pub request_id: String,
    /// The number of tokens to process in this iteration
    ///
    /// This value is:
    /// - 1 for decoding (generating a single new token)
    /// - Equal to the number of uncomputed tokens for a full prefill
    /// - Smaller than the uncomputed tokens if prefill is chunked
    pub token_chunk_size: usize,
    /// Whether a token is sampled for the sequence in this iteration
    pub do_sample: bool,
}

/// `BatchBuilderOutputs` - The result of building a batch.
#[derive(Debug)]
pub struct BatchBuilderOutputs {
    /// The batch, without the swap out and copy operations, which the scheduler adds
    pub batch: BatchDescriptor,
    /// Scheduled sequences, in batch order
    pub scheduled: Vec<ScheduledSequence>,
    /// Candidates included in the batch, with their residency before admission
    pub admitted: Vec<Candidate>,
    /// Candidates left for a later iteration
    pub deferred: Vec<Candidate>,
    /// Candidates that can never be scheduled
    pub rejected: Vec<Candidate>,
}

/// `BatchBuilder` - Greedily packs candidate sequences into the next batch.
///
/// Candidates are processed in the given order. Each one is included if its
/// token demand fits the remaining token budget, and the GPU pool (minus the
/// blocks already reserved for the tokens sampled by earlier candidates) can
/// hold its block table. Once a candidate that is not running is deferred,
/// every later candidate that is not running is deferred too, so that a later
/// arrival never bypasses an earlier one.
#[derive(Debug)]
pub struct BatchBuilder {
    /// Maximum number of tokens (prompt and output) of a sequence
    max_model_len: usize,
    /// Whether prefills can be split to fit the token budget
    enable_chunking: bool,
    /// Tracing span
    span: Span,
}

impl BatchBuilder {
    /// Constructor
    pub fn new(max_model_len: usize, enable_chunking: bool) -> Self {
        Self {
            max_model_len,
            enable_chunking,
            span: info_span!("batch-builder"),
        }
    }

    /// Builds the next batch out of `candidates`.
    ///
    /// Admitted `Unallocated` candidates get a fresh GPU block table covering their
    /// current length, admitted `Swapped` candidates are swapped in (recorded in
    /// `blocks_to_swap_in`). Resident candidates already own their block table.
    #[instrument(skip_all)]
    pub fn build(
        &self,
        candidates: Vec<Candidate>,
        budget: &mut SchedulingBudget,
        block_manager: &mut BlockSpaceManager,
        context: ExecutionContext,
    ) -> Result<BatchBuilderOutputs, BatchBuilderError> {
        let _enter = self.span.enter();
        let mut batch = BatchDescriptor::create_empty(context);
        let mut scheduled = vec![];
        let mut admitted = vec![];
        let mut deferred = vec![];
        let mut rejected = vec![];

        // Blocks kept aside for the tokens sampled by the admitted candidates
        let mut reserved_blocks = 0;
        let mut admission_blocked = false;

        for candidate in candidates {
            let is_resident = candidate.residency == Residency::Resident;
            if admission_blocked && !is_resident {
                deferred.push(candidate);
                continue;
            }

            match self.try_admit(&candidate, budget, block_manager, &mut reserved_blocks)? {
                Decision::Admit(scheduled_sequence) => {
                    if candidate.residency == Residency::Swapped {
                        let mapping = block_manager.swap_in(candidate.sequence.sequence_id())?;
                        batch.blocks_to_swap_in.extend(mapping);
                    }
                    scheduled.push(scheduled_sequence);
                    admitted.push(candidate);
                }
                Decision::Defer => {
                    admission_blocked |= !is_resident;
                    deferred.push(candidate);
                }
                Decision::Reject => {
                    rejected.push(candidate);
                }
            }
        }

        for (scheduled_sequence, candidate) in scheduled.iter().zip(admitted.iter()) {
            let sequence = &candidate.sequence;
            let sequence_id = sequence.sequence_id();
            let start = sequence.get_num_computed_tokens();
            let end = start + scheduled_sequence.token_chunk_size;

            let block_table = block_manager
                .get_block_table_ids(sequence_id)
                .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;

            batch
                .input_token_ids
                .extend(sequence.sequence_data().get_token_ids_range(start, end));
            batch.input_positions.extend(start..end);
            batch.block_tables.push(block_table);
            batch.sequence_boundaries.push(batch.input_token_ids.len());
            batch.sequences.push(SequenceMetadata {
                sequence_id,
                request_id: sequence.request_id().to_string(),
                num_tokens: scheduled_sequence.token_chunk_size,
                is_prompt: sequence.is_prefill(),
                do_sample: scheduled_sequence.do_sample,
                context_len: end,
                next_token_chooser_params: sequence.next_token_chooser_params().clone(),
            });
        }

        debug!(
            "Built batch with {} sequences and {} tokens, deferred = {}, rejected = {}",
            scheduled.len(),
            batch.num_tokens(),
            deferred.len(),
            rejected.len()
        );

        Ok(BatchBuilderOutputs {
            batch,
            scheduled,
            admitted,
            deferred,
            rejected,
        })
    }

    /// Decides whether a single candidate is included in the batch, updating
    /// the budget and the block reservations on admission.
    fn try_admit(
        &self,
        candidate: &Candidate,
        budget: &mut SchedulingBudget,
        block_manager: &mut BlockSpaceManager,
        reserved_blocks: &mut usize,
    ) -> Result<Decision, BatchBuilderError> {
        let sequence = &candidate.sequence;
        let sequence_id = sequence.sequence_id();
        let length = sequence.length();
        let block_size = block_manager.block_size();

        if length >= self.max_model_len {
            debug!("Sequence with id = {sequence_id} reached the maximum model length, rejecting");
            return Ok(Decision::Reject);
        }

        let num_uncomputed_tokens = sequence.get_num_new_tokens();
        if num_uncomputed_tokens == 0 {
            error!("Sequence with id = {sequence_id} has no tokens to schedule");
            return Err(BatchBuilderError::ZeroNewTokensToSchedule(sequence_id));
        }
        let num_new_sequences = usize::from(candidate.residency != Residency::Resident);

        let token_chunk_size = if self.enable_chunking && sequence.is_prefill() {
            num_uncomputed_tokens.min(budget.remaining_budget_tokens())
        } else {
            if num_uncomputed_tokens > budget.token_budget {
                debug!("Sequence with id = {sequence_id} can never fit the token budget, rejecting");
                return Ok(Decision::Reject);
            }
            num_uncomputed_tokens
        };
        if token_chunk_size == 0 || !budget.can_schedule(token_chunk_size, num_new_sequences)? {
            trace!("Token budget exhausted, deferring sequence with id = {sequence_id}");
            return Ok(Decision::Defer);
        }

        let do_sample = sequence.get_num_computed_tokens() + token_chunk_size == length;
        // Tokens the block table covers once the sampled token is appended
        let target_len = length + usize::from(do_sample);

        let num_free_blocks = block_manager.get_number_of_free_gpu_blocks();
        let num_reserved_blocks = match candidate.residency {
            Residency::Resident => {
                let num_required_blocks =
                    block_manager.num_required_blocks(sequence_id, length, target_len)?;
                if *reserved_blocks + num_required_blocks > num_free_blocks {
                    return Ok(Decision::Defer);
                }
                num_required_blocks
            }
            Residency::Swapped => {
                let num_table_blocks = block_manager
                    .block_table(sequence_id)
                    .map(|block_table| block_table.len())
                    .ok_or(BlockSpaceManagerError::MissingSequence(sequence_id))?;
                let num_extension_blocks =
                    num_blocks_for_tokens(target_len, block_size).saturating_sub(num_table_blocks);
                match block_manager.can_swap_in(sequence_id, *reserved_blocks + num_extension_blocks)? {
                    AllocationStatus::Ok => num_extension_blocks,
                    AllocationStatus::Later => return Ok(Decision::Defer),
                    AllocationStatus::Never => return Ok(Decision::Reject),
                }
            }
            Residency::Unallocated => match block_manager.can_allocate(target_len, *reserved_blocks) {
                AllocationStatus::Ok => {
                    block_manager.allocate(sequence_id, length)?;
                    num_blocks_for_tokens(target_len, block_size)
                        - num_blocks_for_tokens(length, block_size)
                }
                AllocationStatus::Later => return Ok(Decision::Defer),
                AllocationStatus::Never => {
                    debug!("Sequence with id = {sequence_id} can never fit the block pool, rejecting");
                    return Ok(Decision::Reject);
                }
            },
        };

        *reserved_blocks += num_reserved_blocks;
        budget.add_num_batched_tokens(sequence_id, token_chunk_size);
        budget.add_number_sequences(sequence_id, 1);

        Ok(Decision::Admit(ScheduledSequence {
            sequence_id,
            request_id: sequence.request_id().to_string(),
            token_chunk_size,
            do_sample,
        }))
    }
}

/// Outcome for a single candidate
enum Decision {
    Admit(ScheduledSequence),
    Defer,
    Reject,
}

#[derive(Debug, Error)]
pub enum BatchBuilderError {
    #[error("Block space manager error: `{0}`")]
    BlockSpaceManagerError(#[from] BlockSpaceManagerError),
    #[error("Empty scheduling")]
    EmptyScheduling,
    #[error("Zero number of new tokens to schedule for sequence with id = `{0}`")]
    ZeroNewTokensToSchedule(u64),
}
