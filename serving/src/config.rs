use std::{path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{llm_service::ShutdownPolicy, scheduler::PreemptionMode};

/// Prefix of the environment variables overriding file configuration values,
/// e.g. `PAGED_SERVING_CACHE__NUM_GPU_BLOCKS=512`.
const ENV_PREFIX: &str = "PAGED_SERVING";

/// Upper bound on `max_stop_sequences`
const MAX_STOP_SEQUENCES_LIMIT: usize = 64;

/// Loads the table `table` of the configuration file at `path`, layered
/// with the environment overrides.
fn load_table<T: serde::de::DeserializeOwned, P: AsRef<Path>>(
    path: P,
    table: &str,
) -> Result<T, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path.as_ref()))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .get::<T>(table)
}

/// Data type used to store the KV cache.
///
/// `Auto` resolves to `F32` on CPU devices and to `F16` on CUDA devices.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDType {
    #[default]
    Auto,
    F16,
    Bf16,
    F32,
}

/// Configuration for the KV cache.
///
/// Args:
///   block_size: Size of a cache block in number of tokens.
///   num_gpu_blocks: Number of blocks in the accelerator pool.
///   num_cpu_blocks: Number of blocks in the CPU pool, used by swap preemption.
///   cache_dtype: Data type for kv cache storage.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
    /// Block size
    block_size: usize,
    /// Number of GPU blocks
    num_gpu_blocks: usize,
    /// Number of CPU blocks
    #[serde(default)]
    num_cpu_blocks: usize,
    /// KV cache data type
    #[serde(default)]
    cache_dtype: CacheDType,
}

impl CacheConfig {
    /// Constructor
    pub fn new(
        block_size: usize,
        num_gpu_blocks: usize,
        num_cpu_blocks: usize,
        cache_dtype: CacheDType,
    ) -> Result<Self, CacheConfigError> {
        let this = Self {
            block_size,
            num_gpu_blocks,
            num_cpu_blocks,
            cache_dtype,
        };

        this.verify_args()?;
        Ok(this)
    }

    /// Reads the `[cache]` table of the configuration file at `path`
    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Result<Self, CacheConfigError> {
        let this: Self = load_table(path, "cache")?;
        this.verify_args()?;
        Ok(this)
    }

    /// Verify `CacheConfig` arguments
    fn verify_args(&self) -> Result<(), CacheConfigError> {
        if self.block_size == 0 {
            return Err(CacheConfigError::InvalidBlockSize(self.block_size));
        }
        if self.num_gpu_blocks == 0 {
            return Err(CacheConfigError::InvalidNumberGpuBlocks(self.num_gpu_blocks));
        }
        Ok(())
    }

    /// Getter for `block_size`
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Getter for `num_gpu_blocks`
    pub fn num_gpu_blocks(&self) -> usize {
        self.num_gpu_blocks
    }

    /// Getter for `num_cpu_blocks`
    pub fn num_cpu_blocks(&self) -> usize {
        self.num_cpu_blocks
    }

    /// Getter for `cache_dtype`
    pub fn cache_dtype(&self) -> CacheDType {
        self.cache_dtype
    }
}

#[derive(Debug, Error)]
pub enum CacheConfigError {
    #[error("Invalid block size: `{0}`")]
    InvalidBlockSize(usize),
    #[error("Invalid number of GPU blocks: `{0}`")]
    InvalidNumberGpuBlocks(usize),
    #[error("Failed to load cache config: `{0}`")]
    ConfigError(#[from] config::ConfigError),
}

/// Scheduler configuration.
///
/// Args:
///   max_num_batched_tokens: Maximum number of tokens to be processed in
///      a single iteration.
///   max_num_sequences: Maximum number of sequences to be processed in a single
///      iteration.
///   max_model_len: Maximum length of a sequence (including prompt
///      and generated text).
///   delay_factor: Apply a delay (of delay factor multiplied by previous
///      prompt latency) before scheduling next prompt.
///   enable_chunked_prefill: If true, prefill requests can be chunked based
///      on the remaining max_num_batched_tokens.
///   preemption_mode: Whether preempted sequences release their blocks or
///      move them to the CPU pool.
///   device: Comma separated list of devices, e.g. `cuda:0,cuda:1` or `cpu`.
#[derive(Clone, Debug, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of batched tokens
    max_num_batched_tokens: usize,
    /// Maximum number of sequences
    max_num_sequences: usize,
    /// Maximum length of a sequence (including prompt and generated text)
    max_model_len: usize,
    /// Delay factor
    #[serde(default)]
    delay_factor: f32,
    /// Enable chunked prefill
    #[serde(default)]
    enable_chunked_prefill: bool,
    /// Preemption mode
    #[serde(default)]
    preemption_mode: PreemptionMode,
    /// Devices
    #[serde(default = "default_device")]
    device: String,
}

fn default_device() -> String {
    "cuda:0".to_string()
}

impl SchedulerConfig {
    /// Constructor
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_num_batched_tokens: usize,
        max_num_sequences: usize,
        max_model_len: usize,
        delay_factor: f32,
        enable_chunked_prefill: bool,
        preemption_mode: PreemptionMode,
        device: String,
    ) -> Result<Self, SchedulerConfigError> {
        let this = Self {
            max_num_batched_tokens,
            max_num_sequences,
            max_model_len,
            delay_factor,
            enable_chunked_prefill,
            preemption_mode,
            device,
        };

        this.verify_args()?;
        Ok(this)
    }

    /// Reads the `[scheduler]` table of the configuration file at `path`
    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Result<Self, SchedulerConfigError> {
        let this: Self = load_table(path, "scheduler")?;
        this.verify_args()?;
        Ok(this)
    }

    fn verify_args(&self) -> Result<(), SchedulerConfigError> {
        if self.max_num_sequences == 0 {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(
                "`max_num_sequences` must be greater than 0".to_string(),
            ));
        }

        if self.max_num_batched_tokens < self.max_model_len && !self.enable_chunked_prefill {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(format!(
                "`max_num_batched_tokens` ({}) is smaller than `max_model_len` ({}). This effectively limits the maximum sequence length to `max_num_batched_tokens` and makes the scheduler reject longer sequences. Please increase `max_num_batched_tokens` or decrease `max_model_len`.",
                self.max_num_batched_tokens, self.max_model_len
            )));
        }

        if self.max_num_batched_tokens < self.max_num_sequences {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(format!(
                "`max_num_batched_tokens` ({}) must be greater than or equal to `max_num_sequences` ({}).",
                self.max_num_batched_tokens, self.max_num_sequences
            )));
        }

        if self.delay_factor < 0.0 || !self.delay_factor.is_finite() {
            return Err(SchedulerConfigError::FailedVerifySchedulerConfig(format!(
                "`delay_factor` ({}) must be a non negative number",
                self.delay_factor
            )));
        }

        parse_devices(&self.device)?;
        Ok(())
    }

    /// Getter for `device`
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Parsed devices
    pub fn devices(&self) -> Result<Vec<Device>, SchedulerConfigError> {
        parse_devices(&self.device)
    }

    /// Getter for `delay_factor`
    pub fn delay_factor(&self) -> f32 {
        self.delay_factor
    }

    /// Getter for `enable_chunked_prefill`
    pub fn enable_chunked_prefill(&self) -> bool {
        self.enable_chunked_prefill
    }

    /// Getter for `max_model_len`
    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }

    /// Getter for `max_num_batched_tokens`
    pub fn max_num_batched_tokens(&self) -> usize {
        self.max_num_batched_tokens
    }

    /// Getter for `max_num_sequences`
    pub fn max_num_sequences(&self) -> usize {
        self.max_num_sequences
    }

    /// Getter for `preemption_mode`
    pub fn preemption_mode(&self) -> PreemptionMode {
        self.preemption_mode
    }
}

#[derive(Debug, Error)]
pub enum SchedulerConfigError {
    #[error("Failed verify scheduler config: `{0}`")]
    FailedVerifySchedulerConfig(String),
    #[error("Invalid device: `{0}`")]
    InvalidDevice(String),
    #[error("Failed to load scheduler config: `{0}`")]
    ConfigError(#[from] config::ConfigError),
}

/// Service configuration.
///
/// Args:
///   max_stop_sequences: Maximum number of stop sequences per request.
///   default_max_new_tokens: Number of tokens to generate when a request
///      does not specify it.
///   shutdown_policy: Whether running sequences finish (`drain`) or are
///      cancelled (`cancel`) on shutdown.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceConfig {
    /// Maximum number of stop sequences
    #[serde(default = "default_max_stop_sequences")]
    max_stop_sequences: usize,
    /// Default maximum number of new tokens
    #[serde(default = "default_max_new_tokens")]
    default_max_new_tokens: u32,
    /// Shutdown policy
    #[serde(default)]
    shutdown_policy: ShutdownPolicy,
}

fn default_max_stop_sequences() -> usize {
    4
}

fn default_max_new_tokens() -> u32 {
    256
}

impl ServiceConfig {
    /// Constructor
    pub fn new(
        max_stop_sequences: usize,
        default_max_new_tokens: u32,
        shutdown_policy: ShutdownPolicy,
    ) -> Result<Self, ServiceConfigError> {
        let this = Self {
            max_stop_sequences,
            default_max_new_tokens,
            shutdown_policy,
        };

        this.verify_args()?;
        Ok(this)
    }

    /// Reads the `[service]` table of the configuration file at `path`
    pub fn from_file_path<P: AsRef<Path>>(path: P) -> Result<Self, ServiceConfigError> {
        let this: Self = load_table(path, "service")?;
        this.verify_args()?;
        Ok(this)
    }

    fn verify_args(&self) -> Result<(), ServiceConfigError> {
        if self.max_stop_sequences > MAX_STOP_SEQUENCES_LIMIT {
            return Err(ServiceConfigError::InvalidMaxStopSequences(
                self.max_stop_sequences,
            ));
        }
        if self.default_max_new_tokens == 0 {
            return Err(ServiceConfigError::InvalidDefaultMaxNewTokens);
        }
        Ok(())
    }

    /// Getter for `max_stop_sequences`
    pub fn max_stop_sequences(&self) -> usize {
        self.max_stop_sequences
    }

    /// Getter for `default_max_new_tokens`
    pub fn default_max_new_tokens(&self) -> u32 {
        self.default_max_new_tokens
    }

    /// Getter for `shutdown_policy`
    pub fn shutdown_policy(&self) -> ShutdownPolicy {
        self.shutdown_policy
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_stop_sequences: default_max_stop_sequences(),
            default_max_new_tokens: default_max_new_tokens(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceConfigError {
    #[error("Invalid maximum number of stop sequences: `{0}`")]
    InvalidMaxStopSequences(usize),
    #[error("Default maximum number of new tokens must be greater than 0")]
    InvalidDefaultMaxNewTokens,
    #[error("Failed to load service config: `{0}`")]
    ConfigError(#[from] config::ConfigError),
}

/// Type of an execution device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

/// An execution device, e.g. `cuda:1`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Device {
    /// Device type
    pub kind: DeviceKind,
    /// Device ordinal
    pub ordinal: usize,
}

impl FromStr for Device {
    type Err = SchedulerConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, ordinal) = match s.split_once(':') {
            Some((kind, ordinal)) => (
                kind,
                ordinal
                    .parse::<usize>()
                    .map_err(|_| SchedulerConfigError::InvalidDevice(s.to_string()))?,
            ),
            None => (s, 0),
        };
        let kind = match kind {
            "cpu" => DeviceKind::Cpu,
            "cuda" => DeviceKind::Cuda,
            _ => return Err(SchedulerConfigError::InvalidDevice(s.to_string())),
        };
        Ok(Self { kind, ordinal })
    }
}

/// Parses a comma separated list of devices, all of the same type.
pub fn parse_devices(devices: &str) -> Result<Vec<Device>, SchedulerConfigError> {
    let devices = devices
        .split(',')
        .filter(|d| !d.trim().is_empty())
        .map(Device::from_str)
        .collect::<Result<Vec<_>, _>>()?;
    let Some(first) = devices.first() else {
        return Err(SchedulerConfigError::InvalidDevice(
            "No devices specified".to_string(),
        ));
    };
    if devices.iter().any(|d| d.kind != first.kind) {
        return Err(SchedulerConfigError::InvalidDevice(
            "All devices must be of the same type".to_string(),
        ));
    }
    Ok(devices)
}

/// Device and data type context, attached to every batch sent to the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExecutionContext {
    /// Devices the engine runs on
    pub devices: Vec<Device>,
    /// Resolved KV cache data type, never `Auto`
    pub dtype: CacheDType,
}

impl ExecutionContext {
    /// Builds the execution context out of the device list and the cache data type.
    pub fn new(
        cache_config: &CacheConfig,
        scheduler_config: &SchedulerConfig,
    ) -> Result<Self, SchedulerConfigError> {
        let devices = scheduler_config.devices()?;
        let dtype = match cache_config.cache_dtype() {
            CacheDType::Auto => match devices.first().map(|d| d.kind) {
                Some(DeviceKind::Cuda) => CacheDType::F16,
                _ => CacheDType::F32,
            },
            dtype => dtype,
        };
        Ok(Self { devices, dtype })
    }
}
