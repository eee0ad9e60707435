use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::{response::sse::Event, Error};
use flume::{r#async::RecvStream, Receiver};
use futures::{stream::Stream, StreamExt};
use paged_serving::StreamResponse;
use serde_json::json;

/// A structure for streaming the generated tokens of a request as server sent
/// events.
///
/// Dropping the `Streamer` (e.g. once the client disconnects) drops the
/// underlying receiver, which cancels the request.
pub struct Streamer {
    /// Request id
    request_id: String,
    /// The responses of the request
    responses: RecvStream<'static, StreamResponse>,
    /// The current status of the streaming process.
    pub(crate) status: StreamStatus,
}

impl Streamer {
    /// Creates a new `Streamer` for the request with the given id
    pub fn new(request_id: String, receiver: Receiver<StreamResponse>) -> Self {
        Self {
            request_id,
            responses: receiver.into_stream(),
            status: StreamStatus::NotStarted,
        }
    }
}

/// Represents the various states of a streaming process.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// Indicates that the streaming process has not started yet.
    NotStarted,
    /// Indicates that tokens are being streamed.
    Started,
    /// Indicates that the terminal event was sent.
    Completed,
    /// Indicates that the engine stopped before the terminal event.
    Interrupted,
}

impl Stream for Streamer {
    type Item = Result<Event, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if matches!(
            self.status,
            StreamStatus::Completed | StreamStatus::Interrupted
        ) {
            return Poll::Ready(None);
        }
        match self.responses.poll_next_unpin(cx) {
            Poll::Ready(Some(StreamResponse::Tokens(token_ids))) => {
                self.status = StreamStatus::Started;
                let data = json!({ "request_id": self.request_id, "token_ids": token_ids });
                Poll::Ready(Some(Event::default().event("tokens").json_data(data)))
            }
            Poll::Ready(Some(StreamResponse::Finished { reason, message })) => {
                self.status = StreamStatus::Completed;
                let data = json!({
                    "request_id": self.request_id,
                    "finish_reason": reason,
                    "message": message,
                });
                Poll::Ready(Some(Event::default().event("finished").json_data(data)))
            }
            Poll::Ready(None) => {
                self.status = StreamStatus::Interrupted;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
