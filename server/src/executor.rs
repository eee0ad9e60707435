use std::time::Duration;

use paged_serving::{BatchDescriptor, ModelExecutor, ModelExecutorError, SequenceOutput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{info_span, trace, Span};

/// `SyntheticExecutor` - A stand-in engine sampling random tokens, used to
/// drive the scheduler and the KV cache pool without a model.
pub struct SyntheticExecutor {
    /// Random number generator
    rng: StdRng,
    /// Sampled tokens are drawn from `0..vocab_size`
    vocab_size: u32,
    /// End of sequence token id
    eos_token_id: u32,
    /// Probability of sampling the end of sequence token
    eos_probability: f64,
    /// Time spent on each batch, to mimic a forward pass
    step_delay: Duration,
    /// Tracing span
    span: Span,
}

impl SyntheticExecutor {
    /// Constructor
    pub fn new(
        seed: u64,
        vocab_size: u32,
        eos_token_id: u32,
        eos_probability: f64,
        step_delay: Duration,
    ) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            vocab_size,
            eos_token_id,
            eos_probability: eos_probability.clamp(0.0, 1.0),
            step_delay,
            span: info_span!("synthetic-executor"),
        }
    }
}

impl ModelExecutor for SyntheticExecutor {
    fn execute(
        &mut self,
        batch: &BatchDescriptor,
    ) -> Result<Vec<SequenceOutput>, ModelExecutorError> {
        let _enter = self.span.enter();
        if batch.input_token_ids.len() != batch.input_positions.len() {
            return Err(ModelExecutorError::InvalidBatch(format!(
                "{} tokens but {} positions",
                batch.input_token_ids.len(),
                batch.input_positions.len()
            )));
        }
        trace!(
            "Executing batch with {} sequences, {} tokens, {} copies, {} swap outs, {} swap ins",
            batch.sequences.len(),
            batch.num_tokens(),
            batch.blocks_to_copy.len(),
            batch.blocks_to_swap_out.len(),
            batch.blocks_to_swap_in.len()
        );

        if !self.step_delay.is_zero() {
            std::thread::sleep(self.step_delay);
        }

        let mut outputs = Vec::with_capacity(batch.sequences.len());
        for metadata in batch.sequences.iter().filter(|metadata| metadata.do_sample) {
            let is_stop_token = self.rng.gen_bool(self.eos_probability);
            let output_token = if is_stop_token {
                self.eos_token_id
            } else {
                self.rng.gen_range(0..self.vocab_size)
            };
            outputs.push(SequenceOutput {
                sequence_id: metadata.sequence_id,
                output_token,
                logprob: -(self.vocab_size as f32).ln(),
                is_stop_token,
                success: true,
            });
        }
        Ok(outputs)
    }
}
