use std::{net::SocketAddr, sync::Arc, time::Duration};

use expect_test::expect;
use futures::StreamExt;
use paged_serving::{
    config::{CacheDType, ExecutionContext},
    validation::NextTokenChooserParameters,
    BatchDescriptor, CacheConfig, FinishReason, LlmService, ModelExecutor, PreemptionMode,
    SchedulerConfig, SequenceMetadata, ServiceConfig, StreamResponse,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    executor::SyntheticExecutor,
    router,
    stream::{StreamStatus, Streamer},
    AppState,
};

const BLOCK_SIZE: usize = 4;

fn synthetic_executor(seed: u64) -> SyntheticExecutor {
    SyntheticExecutor::new(seed, 128, 2, 0.0, Duration::ZERO)
}

fn decode_batch() -> BatchDescriptor {
    let cache_config = CacheConfig::new(BLOCK_SIZE, 8, 0, CacheDType::Auto).unwrap();
    let scheduler_config = SchedulerConfig::new(
        64,
        4,
        64,
        0.0,
        false,
        PreemptionMode::Recomputation,
        "cpu".to_string(),
    )
    .unwrap();
    let context = ExecutionContext::new(&cache_config, &scheduler_config).unwrap();
    let mut batch = BatchDescriptor::create_empty(context);
    for sequence_id in 0..3u64 {
        batch.input_token_ids.push(sequence_id as u32);
        batch.input_positions.push(5);
        batch.block_tables.push(vec![2 * sequence_id as u32, 2 * sequence_id as u32 + 1]);
        batch.sequence_boundaries.push(sequence_id as usize + 1);
        batch.sequences.push(SequenceMetadata {
            sequence_id,
            request_id: format!("{sequence_id:016x}"),
            num_tokens: 1,
            is_prompt: false,
            do_sample: true,
            context_len: 6,
            next_token_chooser_params: NextTokenChooserParameters::default(),
        });
    }
    batch
}

async fn spawn_server(num_gpu_blocks: usize) -> SocketAddr {
    let cache_config = CacheConfig::new(BLOCK_SIZE, num_gpu_blocks, 0, CacheDType::Auto).unwrap();
    let scheduler_config = SchedulerConfig::new(
        64,
        4,
        64,
        0.0,
        false,
        PreemptionMode::Recomputation,
        "cpu".to_string(),
    )
    .unwrap();
    let service = LlmService::start(
        cache_config,
        scheduler_config,
        ServiceConfig::default(),
        synthetic_executor(42),
    )
    .unwrap();
    let app_state = AppState {
        service: Arc::new(service),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(app_state).into_make_service())
            .await
            .unwrap();
    });
    address
}

/// Sends a single HTTP/1.1 request and returns the status line and the raw body
async fn send_request(address: SocketAddr, method: &str, path: &str, body: &str) -> (String, String) {
    let mut stream = TcpStream::connect(address).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {address}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status_line = head.lines().next().unwrap().to_string();
    (status_line, body.to_string())
}

#[tokio::test]
async fn test_streamer_ends_after_finished_event() {
    let (sender, receiver) = flume::unbounded();
    sender.send(StreamResponse::Tokens(vec![1, 2])).unwrap();
    sender.send(StreamResponse::Tokens(vec![3])).unwrap();
    sender
        .send(StreamResponse::Finished {
            reason: FinishReason::LengthCapped,
            message: None,
        })
        .unwrap();
    // Anything sent after the terminal event is never streamed
    sender.send(StreamResponse::Tokens(vec![4])).unwrap();

    let mut streamer = Streamer::new("0000000000000000".to_string(), receiver);
    let mut num_events = 0;
    while let Some(event) = streamer.next().await {
        assert!(event.is_ok());
        num_events += 1;
    }
    assert_eq!(num_events, 3);
    assert_eq!(streamer.status, StreamStatus::Completed);
}

#[tokio::test]
async fn test_streamer_interrupted_when_engine_stops() {
    let (sender, receiver) = flume::unbounded();
    sender.send(StreamResponse::Tokens(vec![1])).unwrap();
    drop(sender);

    let mut streamer = Streamer::new("0000000000000001".to_string(), receiver);
    assert!(streamer.next().await.is_some());
    assert_eq!(streamer.status, StreamStatus::Started);
    assert!(streamer.next().await.is_none());
    assert_eq!(streamer.status, StreamStatus::Interrupted);
    assert!(streamer.next().await.is_none());
}

#[test]
fn test_synthetic_executor_is_deterministic() {
    let batch = decode_batch();
    let mut first = synthetic_executor(7);
    let mut second = synthetic_executor(7);
    for _ in 0..4 {
        let first_outputs = first.execute(&batch).unwrap();
        let second_outputs = second.execute(&batch).unwrap();
        assert_eq!(first_outputs.len(), 3);
        for (a, b) in first_outputs.iter().zip(second_outputs.iter()) {
            assert_eq!(a.sequence_id, b.sequence_id);
            assert_eq!(a.output_token, b.output_token);
            assert!(a.output_token < 128);
            assert!(!a.is_stop_token);
            assert!(a.success);
        }
    }
}

#[test]
fn test_synthetic_executor_skips_chunks_without_sampling() {
    let mut batch = decode_batch();
    batch.sequences[1].do_sample = false;
    let outputs = synthetic_executor(0).execute(&batch).unwrap();
    assert_eq!(
        outputs.iter().map(|o| o.sequence_id).collect::<Vec<_>>(),
        vec![0, 2]
    );

    batch.input_positions.pop();
    assert!(synthetic_executor(0).execute(&batch).is_err());
}

#[test]
fn test_synthetic_executor_always_stops_with_eos_probability_one() {
    let mut executor = SyntheticExecutor::new(0, 128, 2, 1.5, Duration::ZERO);
    let outputs = executor.execute(&decode_batch()).unwrap();
    assert!(outputs.iter().all(|o| o.is_stop_token && o.output_token == 2));
}

#[tokio::test]
async fn test_snapshot_route() {
    let address = spawn_server(8).await;
    let (status_line, body) = send_request(address, "GET", "/snapshot", "").await;
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    expect![[r#"{"num_waiting":0,"num_running":0,"num_preempted":0,"num_free_gpu_blocks":8,"num_total_gpu_blocks":8,"num_free_cpu_blocks":0,"num_total_cpu_blocks":0,"num_cumulative_preemption":0}"#]]
        .assert_eq(&body);
}

#[tokio::test]
async fn test_generate_route_streams_events() {
    let address = spawn_server(8).await;
    let (status_line, body) = send_request(
        address,
        "POST",
        "/generate",
        r#"{"prompt_token_ids": [1, 2, 3], "parameters": {"max_new_tokens": 3}}"#,
    )
    .await;
    assert_eq!(status_line, "HTTP/1.1 200 OK");
    assert_eq!(body.matches("event: tokens").count(), 3);
    assert_eq!(body.matches("event: finished").count(), 1);
    assert!(body.contains("\"finish_reason\":\"length\""));
}

#[tokio::test]
async fn test_generate_route_rejects_requests() {
    let address = spawn_server(2).await;

    // 9 tokens need 3 blocks of 4 tokens, the pool only holds 2
    let (status_line, body) = send_request(
        address,
        "POST",
        "/generate",
        r#"{"prompt_token_ids": [0, 1, 2, 3, 4, 5, 6, 7, 8]}"#,
    )
    .await;
    assert_eq!(status_line, "HTTP/1.1 422 Unprocessable Entity");
    assert!(body.contains("admission_rejected"));

    let (status_line, body) =
        send_request(address, "POST", "/generate", r#"{"prompt_token_ids": []}"#).await;
    assert_eq!(status_line, "HTTP/1.1 400 Bad Request");
    assert!(body.contains("invalid_request"));
}

#[tokio::test]
async fn test_cancel_route_is_idempotent() {
    let address = spawn_server(8).await;
    for _ in 0..2 {
        let (status_line, _) =
            send_request(address, "POST", "/requests/00000000000000ff/cancel", "").await;
        assert_eq!(status_line, "HTTP/1.1 204 No Content");
    }
}

#[tokio::test]
async fn test_fork_route_unknown_request() {
    let address = spawn_server(8).await;
    let (status_line, body) =
        send_request(address, "POST", "/requests/00000000000000ff/fork", "").await;
    assert_eq!(status_line, "HTTP/1.1 409 Conflict");
    assert!(body.contains("cannot_fork"));
}
