use thiserror::Error;
use tracing::{error, info_span, instrument, trace, Span};

use crate::{block::num_blocks_for_tokens, types::GenerateParameters};

const DEFAULT_RANDOM_SEED: u64 = 1_283_768_955;

/// `Validation` - Responsible for validating requests before they reach the scheduler.
///
/// It knows the static capacity of the service (the KV cache pool and the model
/// maximum length), so that requests that can never be served are rejected
/// synchronously, without touching the block pool.
#[derive(Clone, Debug)]
pub struct Validation {
    /// Maximum number of stop sequences allowed in a request
    max_stop_sequences: usize,
    /// Maximum number of tokens (prompt and output) the model supports
    max_model_len: usize,
    /// Number of new tokens to generate, when a request does not specify it
    default_max_new_tokens: u32,
    /// KV cache block size
    block_size: usize,
    /// Total number of GPU blocks in the KV cache pool
    num_gpu_blocks: usize,
    /// Tracing span
    span: Span,
}

impl Validation {
    /// Constructor
    pub fn new(
        max_stop_sequences: usize,
        max_model_len: usize,
        default_max_new_tokens: u32,
        block_size: usize,
        num_gpu_blocks: usize,
    ) -> Self {
        Self {
            max_stop_sequences,
            max_model_len,
            default_max_new_tokens,
            block_size,
            num_gpu_blocks,
            span: info_span!("validation"),
        }
    }

    /// Validates a request and builds the parameters that drive its generation.
    ///
    /// # Arguments
    ///
    /// * `prompt_token_ids` - The tokenized prompt
    /// * `parameters` - The request's generation parameters
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` if:
    /// - The prompt is empty
    /// - The prompt and its first generated token need more KV cache blocks than the whole pool holds (`AdmissionRejected`)
    /// - The prompt reaches the model maximum length
    /// - `max_new_tokens` is zero
    /// - There are too many stop sequences, or an empty one
    /// - Sampling parameters (temperature, repetition penalty, top_k, top_p) are out of range
    #[instrument(skip_all)]
    pub fn validate(
        &self,
        prompt_token_ids: Vec<u32>,
        parameters: GenerateParameters,
    ) -> Result<ValidGenerateRequest, ValidationError> {
        let _enter = self.span.enter();
        trace!("Validating request with {} prompt tokens", prompt_token_ids.len());

        let GenerateParameters {
            temperature,
            repetition_penalty,
            top_k,
            top_p,
            max_new_tokens,
            stop_token_ids,
            stop_sequences,
            ignore_eos_token,
            random_seed,
        } = parameters;

        if prompt_token_ids.is_empty() {
            error!("Empty input");
            return Err(ValidationError::EmptyInput);
        }

        let input_len = prompt_token_ids.len();
        // The prompt and its first generated token
        let num_required_blocks = num_blocks_for_tokens(input_len + 1, self.block_size);
        if num_required_blocks > self.num_gpu_blocks {
            error!(
                "Prompt requires {num_required_blocks} blocks, but the KV cache pool only holds {} blocks",
                self.num_gpu_blocks
            );
            return Err(ValidationError::AdmissionRejected {
                num_required_blocks,
                num_total_blocks: self.num_gpu_blocks,
            });
        }

        if input_len >= self.max_model_len {
            error!(
                "Input length exceeded by request's input length ({input_len} >= {})",
                self.max_model_len
            );
            return Err(ValidationError::InputLength(self.max_model_len, input_len));
        }

        let temperature = temperature.unwrap_or(1.0);
        if temperature <= 0.0 {
            error!("Temperature must be greater than 0");
            return Err(ValidationError::Temperature);
        }

        let repetition_penalty = repetition_penalty.unwrap_or(1.0);
        if repetition_penalty <= 0.0 {
            error!("Repetition penalty must be greater than 0");
            return Err(ValidationError::RepetitionPenalty);
        }

        let top_p = top_p
            .map(|value| {
                if value <= 0.0 || value > 1.0 {
                    error!("Top p must be in (0.0, 1.0]");
                    return Err(ValidationError::TopP);
                }
                Ok(value)
            })
            .unwrap_or(Ok(1.0))?;

        let top_k = top_k
            .map(|value| {
                if value == 0 {
                    error!("Top k must be greater than 0");
                    return Err(ValidationError::TopK);
                }
                Ok(value)
            })
            .unwrap_or(Ok(0))?;

        let max_new_tokens = match max_new_tokens {
            Some(0) => {
                error!("Max new tokens must be greater than 0");
                return Err(ValidationError::ZeroMaxNewTokens);
            }
            Some(max_new_tokens) => max_new_tokens,
            None => self
                .default_max_new_tokens
                .min((self.max_model_len - input_len) as u32),
        };

        if stop_sequences.len() > self.max_stop_sequences {
            error!(
                "Stop sequences exceeded by request's stop sequences ({} > {})",
                stop_sequences.len(),
                self.max_stop_sequences
            );
            return Err(ValidationError::StopSequence(
                self.max_stop_sequences,
                stop_sequences.len(),
            ));
        }
        if stop_sequences.iter().any(|s| s.is_empty()) {
            error!("Empty stop sequence");
            return Err(ValidationError::EmptyStopSequence);
        }

        metrics::histogram!("validation-input-length").record(input_len as f64);

        Ok(ValidGenerateRequest {
            input_token_len: input_len,
            prompt_token_ids,
            parameters: NextTokenChooserParameters {
                temperature,
                repetition_penalty,
                top_k,
                top_p,
                random_seed: random_seed.unwrap_or(DEFAULT_RANDOM_SEED),
            },
            stopping_parameters: StoppingCriteriaParameters {
                max_new_tokens,
                stop_token_ids,
                stop_sequences,
                ignore_eos_token,
            },
        })
    }
}

/// `ValidGenerateRequest` - A validated version of a generation request.
#[derive(Clone, Debug)]
pub struct ValidGenerateRequest {
    /// Tokenized prompt
    pub prompt_token_ids: Vec<u32>,
    /// Number of tokens in the prompt
    pub input_token_len: usize,
    /// Parameters for the next token selection, forwarded to the engine
    pub parameters: NextTokenChooserParameters,
    /// Criteria for when to stop generating tokens
    pub stopping_parameters: StoppingCriteriaParameters,
}

/// Parameters for controlling the next token selection process.
///
/// The scheduler does not interpret them, they are forwarded to the engine
/// with every batch.
#[derive(Clone, Debug, PartialEq)]
pub struct NextTokenChooserParameters {
    /// Temperature for controlling randomness in sampling (higher values increase diversity)
    pub temperature: f32,
    /// Limits sampling to the k most likely next tokens, 0 disables it
    pub top_k: u32,
    /// Limits sampling to the smallest set of most probable tokens with probabilities that add up to top_p or higher
    pub top_p: f32,
    /// Penalizes repeated tokens
    pub repetition_penalty: f32,
    /// Seed for reproducible random sampling
    pub random_seed: u64,
}

impl Default for NextTokenChooserParameters {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            random_seed: DEFAULT_RANDOM_SEED,
        }
    }
}

/// Criteria for stopping token generation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoppingCriteriaParameters {
    /// Maximum number of new tokens to generate.
    pub max_new_tokens: u32,
    /// Token ids that stop the generation once produced.
    pub stop_token_ids: Vec<u32>,
    /// Token sequences that stop the generation once the output ends with them.
    pub stop_sequences: Vec<Vec<u32>>,
    /// If true, the end-of-sequence token reported by the engine is ignored.
    pub ignore_eos_token: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Empty input")]
    EmptyInput,
    #[error("Admission rejected, prompt requires `{num_required_blocks}` blocks but the pool holds `{num_total_blocks}`")]
    AdmissionRejected {
        num_required_blocks: usize,
        num_total_blocks: usize,
    },
    #[error("Input length error: max_model_len = `{0}`, input_len = `{1}`")]
    InputLength(usize, usize),
    #[error("Invalid temperature parameter")]
    Temperature,
    #[error("Invalid repetition parameter")]
    RepetitionPenalty,
    #[error("Invalid top p parameter")]
    TopP,
    #[error("Invalid top k parameter")]
    TopK,
    #[error("Max new tokens to generate must be greater than 0")]
    ZeroMaxNewTokens,
    #[error("Stop sequences size exceeds maximum number of stop sequences allowed: `{0}` < `{1}`")]
    StopSequence(usize, usize),
    #[error("Empty stop sequence")]
    EmptyStopSequence,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validation() -> Validation {
        // 10 blocks of 4 tokens, model maximum length of 32 tokens
        Validation::new(2, 32, 16, 4, 10)
    }

    #[test]
    fn test_validate_defaults() {
        let request = validation()
            .validate(vec![1, 2, 3], GenerateParameters::default())
            .expect("Failed to validate request");
        assert_eq!(request.input_token_len, 3);
        assert_eq!(request.stopping_parameters.max_new_tokens, 16);
        assert_eq!(request.parameters, NextTokenChooserParameters::default());

        // The default number of new tokens never exceeds the model maximum length
        let request = validation()
            .validate((0..30).collect(), GenerateParameters::default())
            .expect("Failed to validate request");
        assert_eq!(request.stopping_parameters.max_new_tokens, 2);
    }

    #[test]
    fn test_validate_capacity() {
        let validation = validation();
        assert_eq!(
            validation
                .validate(vec![], GenerateParameters::default())
                .unwrap_err(),
            ValidationError::EmptyInput
        );
        assert_eq!(
            validation
                .validate((0..41).collect(), GenerateParameters::default())
                .unwrap_err(),
            ValidationError::AdmissionRejected {
                num_required_blocks: 11,
                num_total_blocks: 10
            }
        );
        // 40 tokens fill the pool exactly, leaving no room for the first generated token
        assert_eq!(
            validation
                .validate((0..40).collect(), GenerateParameters::default())
                .unwrap_err(),
            ValidationError::AdmissionRejected {
                num_required_blocks: 11,
                num_total_blocks: 10
            }
        );
        assert_eq!(
            validation
                .validate((0..32).collect(), GenerateParameters::default())
                .unwrap_err(),
            ValidationError::InputLength(32, 32)
        );
    }

    #[test]
    fn test_validate_parameters() {
        let validation = validation();
        let cases = [
            (
                GenerateParameters {
                    max_new_tokens: Some(0),
                    ..Default::default()
                },
                ValidationError::ZeroMaxNewTokens,
            ),
            (
                GenerateParameters {
                    temperature: Some(0.0),
                    ..Default::default()
                },
                ValidationError::Temperature,
            ),
            (
                GenerateParameters {
                    top_p: Some(1.5),
                    ..Default::default()
                },
                ValidationError::TopP,
            ),
            (
                GenerateParameters {
                    top_k: Some(0),
                    ..Default::default()
                },
                ValidationError::TopK,
            ),
            (
                GenerateParameters {
                    repetition_penalty: Some(-1.0),
                    ..Default::default()
                },
                ValidationError::RepetitionPenalty,
            ),
            (
                GenerateParameters {
                    stop_sequences: vec![vec![1], vec![2], vec![3]],
                    ..Default::default()
                },
                ValidationError::StopSequence(2, 3),
            ),
            (
                GenerateParameters {
                    stop_sequences: vec![vec![]],
                    ..Default::default()
                },
                ValidationError::EmptyStopSequence,
            ),
        ];

        for (parameters, expected) in cases {
            assert_eq!(
                validation.validate(vec![1, 2, 3], parameters).unwrap_err(),
                expected
            );
        }
    }

    #[test]
    fn test_validate_forwards_parameters() {
        let request = validation()
            .validate(
                vec![1, 2, 3],
                GenerateParameters {
                    temperature: Some(0.7),
                    top_k: Some(40),
                    random_seed: Some(7),
                    max_new_tokens: Some(12),
                    stop_token_ids: vec![2],
                    stop_sequences: vec![vec![5, 6]],
                    ignore_eos_token: true,
                    ..Default::default()
                },
            )
            .expect("Failed to validate request");
        assert_eq!(request.parameters.temperature, 0.7);
        assert_eq!(request.parameters.top_k, 40);
        assert_eq!(request.parameters.random_seed, 7);
        assert_eq!(
            request.stopping_parameters,
            StoppingCriteriaParameters {
                max_new_tokens: 12,
                stop_token_ids: vec![2],
                stop_sequences: vec![vec![5, 6]],
                ignore_eos_token: true,
            }
        );
    }
}
