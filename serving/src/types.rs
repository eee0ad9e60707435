use serde::{Deserialize, Serialize};

/// `GenerateParameters` - Parameters of a generation request, as submitted
/// by the transport layer
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct GenerateParameters {
    /// Temperature is used for modeling the logits distribution
    pub temperature: Option<f32>,
    /// The parameter for repetition penalty. 1.0 means no penalty.
    pub repetition_penalty: Option<f32>,
    /// The number of highest probability vocabulary tokens to keep for top-k-filtering
    pub top_k: Option<u32>,
    /// Top-p value for nucleus sampling
    pub top_p: Option<f32>,
    /// Maximum number of tokens to generate
    pub max_new_tokens: Option<u32>,
    /// Stop generating tokens once any of these token ids is generated
    pub stop_token_ids: Vec<u32>,
    /// Stop generating tokens once the output ends with any of these token sequences
    pub stop_sequences: Vec<Vec<u32>>,
    /// Keep generating past end of sequence tokens, mostly useful for benchmarking
    pub ignore_eos_token: bool,
    /// Random sampling seed
    pub random_seed: Option<u64>,
}

impl Default for GenerateParameters {
    fn default() -> Self {
        Self {
            temperature: None,
            repetition_penalty: None,
            top_k: None,
            top_p: None,
            max_new_tokens: None,
            stop_token_ids: Vec::new(),
            stop_sequences: Vec::new(),
            ignore_eos_token: false,
            random_seed: None,
        }
    }
}
