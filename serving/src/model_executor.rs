use thiserror::Error;

use crate::{batch::BatchDescriptor, sequence::SequenceOutput};

/// `ModelExecutor` trait - interface for running AI inference
/// from a LLM, on the KV cache blocks managed by the scheduler
pub trait ModelExecutor {
    /// Executes a batch, as a single atomic unit of work.
    ///
    /// The engine must, in this order:
    /// 1. Perform the block copies in `blocks_to_copy` (copy-on-write).
    /// 2. Swap out the blocks in `blocks_to_swap_out`, from GPU to CPU.
    /// 3. Swap in the blocks in `blocks_to_swap_in`, from CPU to GPU.
    /// 4. Run the forward pass over `input_token_ids`, writing the KV entries of
    ///    each token to the slot given by its position and the block table of
    ///    its sequence.
    ///
    /// # Returns
    /// One `SequenceOutput` for each sequence with `do_sample` set. A sequence the
    /// engine could not process is reported with `success = false`.
    ///
    /// # Errors
    /// `ModelExecutorError` if the batch could not be executed at all, in which case
    /// every sequence of the batch is failed by the scheduler.
    fn execute(
        &mut self,
        batch: &BatchDescriptor,
    ) -> Result<Vec<SequenceOutput>, ModelExecutorError>;
}

impl<M: ModelExecutor + ?Sized> ModelExecutor for Box<M> {
    fn execute(
        &mut self,
        batch: &BatchDescriptor,
    ) -> Result<Vec<SequenceOutput>, ModelExecutorError> {
        (**self).execute(batch)
    }
}

#[derive(Debug, Error)]
pub enum ModelExecutorError {
    #[error("Invalid batch: `{0}`")]
    InvalidBatch(String),
    #[error("Forward pass failed: `{0}`")]
    ForwardFailed(String),
    #[error("Block transfer failed: `{0}`")]
    BlockTransferFailed(String),
}
