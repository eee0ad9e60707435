use std::{
    collections::HashSet,
    path::PathBuf,
    time::Duration,
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serial_test::serial;
use tracing::info;

use crate::{
    batch::BatchDescriptor,
    config::{CacheConfig, CacheDType, SchedulerConfig, ServiceConfig},
    llm_engine::StreamResponse,
    llm_service::{LlmService, LlmServiceError, ShutdownPolicy},
    model_executor::{ModelExecutor, ModelExecutorError},
    scheduler::PreemptionMode,
    sequence::{FinishReason, SequenceOutput},
    types::GenerateParameters,
};

const BLOCK_SIZE: usize = 4;

/// Deterministic engine: the token sampled for a sequence is its context
/// length, so that outputs continue the `0..n` dummy prompts.
#[derive(Debug, Default)]
pub(crate) struct MockExecutor {
    eos_token_id: Option<u32>,
    fail_at_step: Option<usize>,
    failed_sequences: HashSet<u64>,
    step_delay: Option<Duration>,
    num_steps: usize,
    pub(crate) batches: Vec<BatchDescriptor>,
}

impl MockExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    /// The whole batch of the `step`-th call fails (1-indexed)
    pub(crate) fn with_failure_at_step(mut self, step: usize) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub(crate) fn with_failed_sequence(mut self, sequence_id: u64) -> Self {
        self.failed_sequences.insert(sequence_id);
        self
    }

    pub(crate) fn with_step_delay(mut self, step_delay: Duration) -> Self {
        self.step_delay = Some(step_delay);
        self
    }
}

impl ModelExecutor for MockExecutor {
    fn execute(
        &mut self,
        batch: &BatchDescriptor,
    ) -> Result<Vec<SequenceOutput>, ModelExecutorError> {
        self.num_steps += 1;
        assert_eq!(batch.input_token_ids.len(), batch.input_positions.len());
        assert_eq!(batch.sequence_boundaries.len(), batch.sequences.len() + 1);
        assert_eq!(
            batch.sequence_boundaries.last().copied(),
            Some(batch.num_tokens())
        );
        assert_eq!(batch.block_tables.len(), batch.sequences.len());
        self.batches.push(batch.clone());

        if let Some(step_delay) = self.step_delay {
            std::thread::sleep(step_delay);
        }
        if self.fail_at_step == Some(self.num_steps) {
            return Err(ModelExecutorError::ForwardFailed(format!(
                "injected failure at step {}",
                self.num_steps
            )));
        }

        Ok(batch
            .sequences
            .iter()
            .filter(|metadata| metadata.do_sample)
            .map(|metadata| {
                let output_token = metadata.context_len as u32;
                SequenceOutput {
                    sequence_id: metadata.sequence_id,
                    output_token,
                    logprob: -1.0,
                    is_stop_token: self.eos_token_id == Some(output_token),
                    success: !self.failed_sequences.contains(&metadata.sequence_id),
                }
            })
            .collect())
    }
}

fn start_service(
    num_gpu_blocks: usize,
    max_num_sequences: usize,
    max_model_len: usize,
    executor: MockExecutor,
) -> LlmService {
    let cache_config = CacheConfig::new(BLOCK_SIZE, num_gpu_blocks, 0, CacheDType::Auto)
        .expect("Failed to create cache config");
    let scheduler_config = SchedulerConfig::new(
        max_model_len,
        max_num_sequences,
        max_model_len,
        0.0,
        false,
        PreemptionMode::Recomputation,
        "cpu".to_string(),
    )
    .expect("Failed to create scheduler config");
    LlmService::start(
        cache_config,
        scheduler_config,
        ServiceConfig::default(),
        executor,
    )
    .expect("Failed to start LLM service")
}

fn parameters(max_new_tokens: u32) -> GenerateParameters {
    GenerateParameters {
        max_new_tokens: Some(max_new_tokens),
        ..Default::default()
    }
}

/// Reads a stream until its terminal response
async fn collect(
    receiver: &flume::Receiver<StreamResponse>,
) -> (Vec<u32>, FinishReason, Option<String>) {
    let mut tokens = vec![];
    loop {
        match receiver.recv_async().await {
            Ok(StreamResponse::Tokens(new_tokens)) => tokens.extend(new_tokens),
            Ok(StreamResponse::Finished { reason, message }) => return (tokens, reason, message),
            Err(e) => panic!("Stream closed without a terminal response: {e}"),
        }
    }
}

#[tokio::test]
async fn test_llm_service_streams_tokens() {
    init_tracing();
    let service = start_service(10, 4, 64, MockExecutor::new());

    let first = service
        .new_request((0..8).collect(), parameters(4))
        .expect("Failed to submit request");
    let second = service
        .new_request((0..4).collect(), parameters(4))
        .expect("Failed to submit request");
    assert_ne!(first.request_id, second.request_id);
    assert_eq!(first.request_id.len(), 16);

    let (tokens, reason, message) = collect(&first.receiver).await;
    assert_eq!(tokens, vec![8, 9, 10, 11]);
    assert_eq!(reason, FinishReason::LengthCapped);
    assert!(message.is_none());
    let (tokens, _, _) = collect(&second.receiver).await;
    assert_eq!(tokens, vec![4, 5, 6, 7]);

    service.drain().await.expect("Failed to drain service");
}

#[tokio::test]
async fn test_llm_service_admission_rejected() {
    init_tracing();
    let service = start_service(10, 4, 64, MockExecutor::new());

    // 44 tokens need 11 blocks, the pool holds 10
    let result = service.new_request((0..44).collect(), parameters(1));
    assert!(matches!(result, Err(LlmServiceError::AdmissionRejected(_))));
    let snapshot = service.snapshot();
    assert_eq!(snapshot.num_free_gpu_blocks, 10);
    assert_eq!(snapshot.num_waiting, 0);

    let result = service.new_request(vec![], parameters(1));
    assert!(matches!(result, Err(LlmServiceError::ValidationError(_))));

    service.drain().await.expect("Failed to drain service");
}

#[tokio::test]
async fn test_llm_service_cancel_is_idempotent() {
    init_tracing();
    let executor = MockExecutor::new().with_step_delay(Duration::from_millis(10));
    let service = start_service(256, 4, 2048, executor);

    let handle = service
        .new_request((0..4).collect(), parameters(1000))
        .expect("Failed to submit request");
    match handle.receiver.recv_async().await {
        Ok(StreamResponse::Tokens(tokens)) => assert_eq!(tokens, vec![4]),
        response => panic!("Unexpected response {response:?}"),
    }

    service.cancel(&handle.request_id).expect("Failed to cancel");
    service.cancel(&handle.request_id).expect("Failed to cancel");
    let (tokens, reason, _) = collect(&handle.receiver).await;
    assert_eq!(reason, FinishReason::Cancelled);
    // Tokens delivered before the cancellation are in order
    assert!(tokens.iter().zip(5..).all(|(token, expected)| *token == expected));

    // Cancelling a finished request is a no-op
    service.cancel(&handle.request_id).expect("Failed to cancel");
    service.cancel("unknown").expect("Failed to cancel");

    let mut snapshots = service.subscribe_snapshots();
    service.drain().await.expect("Failed to drain service");
    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(snapshot.num_free_gpu_blocks, 256);
    assert_eq!(snapshot.num_running, 0);
}

#[tokio::test]
async fn test_llm_service_dropped_stream_cancels_request() {
    init_tracing();
    let executor = MockExecutor::new().with_step_delay(Duration::from_millis(20));
    let service = start_service(256, 4, 2048, executor);

    let handle = service
        .new_request((0..4).collect(), parameters(1000))
        .expect("Failed to submit request");
    assert!(matches!(
        handle.receiver.recv_async().await,
        Ok(StreamResponse::Tokens(_))
    ));
    drop(handle);

    // Generating the remaining tokens would take far longer
    tokio::time::timeout(Duration::from_secs(5), service.drain())
        .await
        .expect("Dropped request was not cancelled")
        .expect("Failed to drain service");
}

#[tokio::test]
async fn test_llm_service_shutdown_cancels_running_sequences() {
    init_tracing();
    let executor = MockExecutor::new().with_step_delay(Duration::from_millis(10));
    let service = start_service(256, 4, 2048, executor);

    let handles = (0..3)
        .map(|_| {
            service
                .new_request((0..4).collect(), parameters(1000))
                .expect("Failed to submit request")
        })
        .collect::<Vec<_>>();
    assert!(matches!(
        handles[0].receiver.recv_async().await,
        Ok(StreamResponse::Tokens(_))
    ));

    service
        .shutdown_with_policy(ShutdownPolicy::Cancel)
        .await
        .expect("Failed to shutdown service");
    for handle in handles.iter() {
        let (_, reason, _) = collect(&handle.receiver).await;
        assert_eq!(reason, FinishReason::Cancelled);
    }
}

#[tokio::test]
async fn test_llm_service_drain_completes_requests() {
    init_tracing();
    let service = start_service(16, 2, 64, MockExecutor::new());

    let handles = (0..6)
        .map(|i| {
            service
                .new_request((0..(4 + i)).collect(), parameters(3))
                .expect("Failed to submit request")
        })
        .collect::<Vec<_>>();

    service.drain().await.expect("Failed to drain service");
    for (i, handle) in handles.iter().enumerate() {
        let (tokens, reason, _) = collect(&handle.receiver).await;
        let prompt_len = 4 + i as u32;
        assert_eq!(tokens, (prompt_len..prompt_len + 3).collect::<Vec<_>>());
        assert_eq!(reason, FinishReason::LengthCapped);
    }
}

#[tokio::test]
async fn test_llm_service_engine_error() {
    init_tracing();
    let executor = MockExecutor::new().with_failure_at_step(2);
    let service = start_service(16, 4, 64, executor);

    let handle = service
        .new_request((0..4).collect(), parameters(8))
        .expect("Failed to submit request");
    let (tokens, reason, message) = collect(&handle.receiver).await;
    assert_eq!(tokens, vec![4]);
    assert_eq!(reason, FinishReason::EngineError);
    assert!(message.unwrap().contains("injected failure"));

    // The engine keeps serving after a failed batch
    let handle = service
        .new_request((0..4).collect(), parameters(2))
        .expect("Failed to submit request");
    let (tokens, reason, _) = collect(&handle.receiver).await;
    assert_eq!(tokens, vec![4, 5]);
    assert_eq!(reason, FinishReason::LengthCapped);

    service.drain().await.expect("Failed to drain service");
}

#[tokio::test]
async fn test_llm_service_fork_request() {
    init_tracing();
    let executor = MockExecutor::new().with_step_delay(Duration::from_millis(20));
    let service = start_service(64, 4, 256, executor);

    let parent = service
        .new_request((0..6).collect(), parameters(8))
        .expect("Failed to submit request");
    let mut parent_tokens = match parent.receiver.recv_async().await {
        Ok(StreamResponse::Tokens(tokens)) => tokens,
        response => panic!("Unexpected response {response:?}"),
    };

    let child = service
        .fork_request(&parent.request_id)
        .await
        .expect("Failed to fork request");
    assert_ne!(child.request_id, parent.request_id);

    let (tokens, reason, _) = collect(&parent.receiver).await;
    parent_tokens.extend(tokens);
    assert_eq!(parent_tokens, (6..14).collect::<Vec<_>>());
    assert_eq!(reason, FinishReason::LengthCapped);

    // The child shares the parent prefix and continues from it
    let (tokens, reason, _) = collect(&child.receiver).await;
    assert_eq!(reason, FinishReason::LengthCapped);
    assert!(!tokens.is_empty());
    assert_eq!(tokens.last().copied(), Some(13));

    assert!(matches!(
        service.fork_request("unknown").await,
        Err(LlmServiceError::CannotFork(_))
    ));

    let mut snapshots = service.subscribe_snapshots();
    service.drain().await.expect("Failed to drain service");
    assert_eq!(snapshots.borrow_and_update().num_free_gpu_blocks, 64);
}

#[tokio::test]
async fn test_llm_service_many_requests_under_memory_pressure() {
    init_tracing();

    const NUM_REQUESTS: usize = 64;
    const MAX_NEW_TOKENS: u32 = 16;

    // 24 blocks of 4 tokens, far less than the requests need together
    let service = start_service(24, 8, 64, MockExecutor::new());
    let mut rng = StdRng::seed_from_u64(42);

    let handles = (0..NUM_REQUESTS)
        .map(|_| {
            let prompt_len = rng.gen_range(1..32u32);
            let handle = service
                .new_request((0..prompt_len).collect(), parameters(MAX_NEW_TOKENS))
                .expect("Failed to submit request");
            (prompt_len, handle)
        })
        .collect::<Vec<_>>();

    for (prompt_len, handle) in handles.iter() {
        let (tokens, reason, _) = collect(&handle.receiver).await;
        assert_eq!(reason, FinishReason::LengthCapped);
        assert_eq!(
            tokens,
            (*prompt_len..*prompt_len + MAX_NEW_TOKENS).collect::<Vec<_>>()
        );
    }

    let snapshot = service.snapshot();
    info!("Final snapshot: {snapshot:?}");
    assert!(snapshot.num_cumulative_preemption > 0);

    let mut snapshots = service.subscribe_snapshots();
    service.drain().await.expect("Failed to drain service");
    assert_eq!(snapshots.borrow_and_update().num_free_gpu_blocks, 24);
}

#[tokio::test]
#[serial]
async fn test_llm_service_start_from_file_path() {
    init_tracing();
    let config_path = std::env::temp_dir().join("paged_serving_service_test.toml");
    std::fs::write(
        &config_path,
        r#"
[cache]
block_size = 4
num_gpu_blocks = 32

[scheduler]
max_num_batched_tokens = 128
max_num_sequences = 4
max_model_len = 128
delay_factor = 0.0
enable_chunked_prefill = false
device = "cpu"

[service]
default_max_new_tokens = 3
shutdown_policy = "cancel"
"#,
    )
    .expect("Failed to write config file");

    let service = LlmService::start_from_file_path(PathBuf::from(&config_path), MockExecutor::new())
        .expect("Failed to start LLM service");
    let handle = service
        .new_request((0..5).collect(), GenerateParameters::default())
        .expect("Failed to submit request");
    let (tokens, _, _) = collect(&handle.receiver).await;
    assert_eq!(tokens, vec![5, 6, 7]);

    service.shutdown().await.expect("Failed to shutdown service");
    std::fs::remove_file(config_path).ok();
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::try_init();
}
